// ObjectReference command implementations

use crate::classtype::{read_tagged_object_id, InvokeReply};
use crate::commands::{command_sets, object_reference_commands};
use crate::connection::JdwpConnection;
use crate::protocol::{CommandPacket, JdwpResult};
use crate::reader::{read_u64, read_u8};
use crate::types::{read_tagged_value, ClassId, MethodId, ObjectId, ReferenceTypeId, ThreadId, Value};
use bytes::BufMut;

impl JdwpConnection {
    /// ObjectReference.ReferenceType — the class of an object.
    pub async fn get_object_reference_type(
        &self,
        object_id: ObjectId,
    ) -> JdwpResult<ReferenceTypeId> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(
            id,
            command_sets::OBJECT_REFERENCE,
            object_reference_commands::REFERENCE_TYPE,
        );

        packet.data.put_u64(object_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let _type_tag = read_u8(&mut data)?;
        read_u64(&mut data)
    }

    /// ObjectReference.InvokeMethod — invoke an instance method on the given
    /// thread.
    pub async fn object_invoke_method(
        &self,
        object_id: ObjectId,
        thread: ThreadId,
        class_id: ClassId,
        method_id: MethodId,
        args: &[Value],
        options: i32,
    ) -> JdwpResult<InvokeReply> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(
            id,
            command_sets::OBJECT_REFERENCE,
            object_reference_commands::INVOKE_METHOD,
        );

        packet.data.put_u64(object_id);
        packet.data.put_u64(thread);
        packet.data.put_u64(class_id);
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
}
