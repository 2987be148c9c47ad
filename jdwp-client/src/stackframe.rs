// StackFrame command implementations

use crate::commands::{command_sets, stack_frame_commands};
use crate::connection::JdwpConnection;
use crate::protocol::{CommandPacket, JdwpResult};
use crate::reader::{read_i32, read_u64, read_u8};
use crate::types::{read_tagged_value, FrameId, ObjectId, ThreadId, Value};
use bytes::BufMut;

impl JdwpConnection {
    /// StackFrame.GetValues — read local variable slots from a suspended
    /// thread's frame. `slots` pairs each frame slot with the expected tag.
    pub async fn get_frame_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        slots: &[(u32, u8)],
    ) -> JdwpResult<Vec<Value>> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(
            id,
            command_sets::STACK_FRAME,
            stack_frame_commands::GET_VALUES,
        );

        packet.data.put_u64(thread);
        packet.data.put_u64(frame_id);
        packet.data.put_i32(slots.len() as i32);
        for (slot, tag) in slots {
            packet.data.put_u32(*slot);
            packet.data.put_u8(*tag);
        }

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let values_count = read_i32(&mut data)?;
        let mut values = Vec::with_capacity(values_count as usize);
        for _ in 0..values_count {
            values.push(read_tagged_value(&mut data)?);
        }

        Ok(values)
    }

    /// StackFrame.ThisObject — the `this` reference of a frame, 0 for static
    /// frames.
    pub async fn get_frame_this_object(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
    ) -> JdwpResult<ObjectId> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(
            id,
            command_sets::STACK_FRAME,
            stack_frame_commands::THIS_OBJECT,
        );

        packet.data.put_u64(thread);
        packet.data.put_u64(frame_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();
        let _tag = read_u8(&mut data)?;
        read_u64(&mut data)
    }
}
