// ClassType command implementations
//
// Static method invocation and constructor calls inside the remote VM.

use crate::commands::{class_type_commands, command_sets};
use crate::connection::JdwpConnection;
use crate::protocol::{CommandPacket, JdwpResult};
use crate::reader::read_u8;
use crate::types::{
    read_tagged_value, ClassId, MethodId, ObjectId, ThreadId, Value,
};
use bytes::BufMut;

/// Result of a remote invocation: the returned value plus the remote
/// exception object (0 when none was thrown). Exactly one of the two is
/// meaningful.
#[derive(Debug, Clone)]
pub struct InvokeReply {
    pub value: Value,
    pub exception: ObjectId,
}

impl JdwpConnection {
    /// ClassType.InvokeMethod — invoke a static method on the given thread.
    pub async fn class_invoke_method(
        &self,
        class_id: ClassId,
        thread: ThreadId,
        method_id: MethodId,
        args: &[Value],
        options: i32,
    ) -> JdwpResult<InvokeReply> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(
            id,
            command_sets::CLASS_TYPE,
            class_type_commands::INVOKE_METHOD,
        );

        packet.data.put_u64(class_id);
        packet.data.put_u64(thread);
        packet.data.put_u64(method_id);
        packet.data.put_i32(args.len() as i32);
        for arg in args {
            arg.write_tagged(&mut packet.data);
        }
        packet.data.put_i32(options);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();
        let value = read_tagged_value(&mut data)?;
        let exception = read_tagged_object_id(&mut data)?;

        Ok(InvokeReply { value, exception })
    }

    /// ClassType.NewInstance — run a constructor on the given thread.
    pub async fn class_new_instance(
        &self,
        class_id: ClassId,
        thread: ThreadId,
        method_id: MethodId,
        args: &[Value],
        options: i32,
    ) -> JdwpResult<InvokeReply> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(
            id,
            command_sets::CLASS_TYPE,
            class_type_commands::NEW_INSTANCE,
        );

        packet.data.put_u64(class_id);
        packet.data.put_u64(thread);
        packet.data.put_u64(method_id);
        packet.data.put_i32(args.len() as i32);
        for arg in args {
            arg.write_tagged(&mut packet.data);
        }
        packet.data.put_i32(options);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();
        // reply carries the new object and the exception, both tagged ids
        let value = read_tagged_value(&mut data)?;
        let exception = read_tagged_object_id(&mut data)?;

        Ok(InvokeReply { value, exception })
    }
}

/// Read a tagged-objectID (tag byte + 8-byte id).
pub(crate) fn read_tagged_object_id(buf: &mut &[u8]) -> JdwpResult<ObjectId> {
    let _tag = read_u8(buf)?;
    crate::reader::read_u64(buf)
}
