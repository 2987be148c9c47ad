// ThreadReference command implementations

use crate::commands::{command_sets, thread_commands};
use crate::connection::JdwpConnection;
use crate::protocol::{CommandPacket, JdwpResult};
use crate::reader::{read_i32, read_string, read_u64, read_u8};
use crate::types::{FrameId, Location, ThreadId, SUSPEND_STATUS_SUSPENDED};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

/// Stack frame information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub frame_id: FrameId,
    pub location: Location,
}

/// ThreadReference.Status reply
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThreadStatus {
    pub thread_status: i32,
    pub suspend_status: i32,
}

impl ThreadStatus {
    pub fn is_suspended(&self) -> bool {
        self.suspend_status & SUSPEND_STATUS_SUSPENDED != 0
    }
}

impl JdwpConnection {
    /// ThreadReference.Name
    pub async fn thread_name(&self, thread: ThreadId) -> JdwpResult<String> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::THREAD_REFERENCE, thread_commands::NAME);

        packet.data.put_u64(thread);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();
        read_string(&mut data)
    }

    /// ThreadReference.Status
    pub async fn thread_status(&self, thread: ThreadId) -> JdwpResult<ThreadStatus> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::THREAD_REFERENCE, thread_commands::STATUS);

        packet.data.put_u64(thread);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();
        let thread_status = read_i32(&mut data)?;
        let suspend_status = read_i32(&mut data)?;

        Ok(ThreadStatus {
            thread_status,
            suspend_status,
        })
    }

    /// ThreadReference.Resume — undo one suspension of a single thread.
    pub async fn thread_resume(&self, thread: ThreadId) -> JdwpResult<()> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::THREAD_REFERENCE, thread_commands::RESUME);

        packet.data.put_u64(thread);

        let reply = self.send_command(packet).await?;
        reply.check_error()
    }

    /// ThreadReference.Frames
    ///
    /// `start_frame` 0 is the top of the stack; `length` -1 requests all.
    pub async fn get_frames(
        &self,
        thread: ThreadId,
        start_frame: i32,
        length: i32,
    ) -> JdwpResult<Vec<Frame>> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::THREAD_REFERENCE, thread_commands::FRAMES);

        packet.data.put_u64(thread);
        packet.data.put_i32(start_frame);
        packet.data.put_i32(length);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let frames_count = read_i32(&mut data)?;
        let mut frames = Vec::with_capacity(frames_count as usize);

        for _ in 0..frames_count {
            let frame_id = read_u64(&mut data)?;

            let type_tag = read_u8(&mut data)?;
            let class_id = read_u64(&mut data)?;
            let method_id = read_u64(&mut data)?;
            let index = read_u64(&mut data)?;

            frames.push(Frame {
                frame_id,
                location: Location {
                    type_tag,
                    class_id,
                    method_id,
                    index,
                },
            });
        }

        Ok(frames)
    }
}
