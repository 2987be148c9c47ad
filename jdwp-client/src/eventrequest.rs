// EventRequest command implementations

use crate::commands::{command_sets, event_commands, event_kinds, modifier_kinds};
use crate::connection::JdwpConnection;
use crate::protocol::{CommandPacket, JdwpResult};
use crate::reader::read_i32;
use crate::types::ReferenceTypeId;
use bytes::BufMut;
use serde::{Deserialize, Serialize};

/// Suspend policy for events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SuspendPolicy {
    None = 0,
    EventThread = 1,
    All = 2,
}

impl JdwpConnection {
    /// EventRequest.Set with a METHOD_ENTRY kind and a class-only filter.
    ///
    /// The VM fires an event for every method entered on the filtered class;
    /// matching the method name is the caller's job. Returns the request id.
    pub async fn set_method_entry_request(
        &self,
        class_id: ReferenceTypeId,
        suspend_policy: SuspendPolicy,
    ) -> JdwpResult<i32> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(id, command_sets::EVENT_REQUEST, event_commands::SET);

        packet.data.put_u8(event_kinds::METHOD_ENTRY);
        packet.data.put_u8(suspend_policy as u8);

        // one modifier: ClassOnly
        packet.data.put_i32(1);
        packet.data.put_u8(modifier_kinds::CLASS_ONLY);
        packet.data.put_u64(class_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();
        read_i32(&mut data)
    }

    /// EventRequest.Clear for a METHOD_ENTRY request.
    pub async fn clear_method_entry_request(&self, request_id: i32) -> JdwpResult<()> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(id, command_sets::EVENT_REQUEST, event_commands::CLEAR);

        packet.data.put_u8(event_kinds::METHOD_ENTRY);
        packet.data.put_i32(request_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()
    }
}
