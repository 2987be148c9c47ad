// Common types used across the JDWP protocol

use crate::protocol::{JdwpError, JdwpResult};
use crate::reader::{read_u64, read_u8};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

// Object IDs are 8 bytes on Android's ART
pub type ObjectId = u64;
pub type ThreadId = ObjectId;
pub type StringId = ObjectId;
pub type ClassLoaderId = ObjectId;

pub type ReferenceTypeId = u64;
pub type ClassId = ReferenceTypeId;

pub type MethodId = u64;
pub type FieldId = u64;
pub type FrameId = u64;

/// Code position inside the remote VM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub type_tag: u8, // 1=class, 2=interface, 3=array
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64, // bytecode index
}

// Suspend status bit reported by ThreadReference.Status
pub const SUSPEND_STATUS_SUSPENDED: i32 = 1;

// Value tags
pub mod tags {
    pub const ARRAY: u8 = 91; // '['
    pub const BYTE: u8 = 66; // 'B'
    pub const CHAR: u8 = 67; // 'C'
    pub const OBJECT: u8 = 76; // 'L'
    pub const FLOAT: u8 = 70; // 'F'
    pub const DOUBLE: u8 = 68; // 'D'
    pub const INT: u8 = 73; // 'I'
    pub const LONG: u8 = 74; // 'J'
    pub const SHORT: u8 = 83; // 'S'
    pub const VOID: u8 = 86; // 'V'
    pub const BOOLEAN: u8 = 90; // 'Z'
    pub const STRING: u8 = 115; // 's'
    pub const THREAD: u8 = 116; // 't'
    pub const THREAD_GROUP: u8 = 103; // 'g'
    pub const CLASS_LOADER: u8 = 108; // 'l'
    pub const CLASS_OBJECT: u8 = 99; // 'c'
}

/// Tagged value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub tag: u8,
    pub data: ValueData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueData {
    Byte(i8),
    Char(u16),
    Float(f32),
    Double(f64),
    Int(i32),
    Long(i64),
    Short(i16),
    Boolean(bool),
    Object(ObjectId),
    Void,
}

impl Value {
    pub fn object(tag: u8, id: ObjectId) -> Self {
        Self {
            tag,
            data: ValueData::Object(id),
        }
    }

    pub fn boolean(v: bool) -> Self {
        Self {
            tag: tags::BOOLEAN,
            data: ValueData::Boolean(v),
        }
    }

    pub fn null() -> Self {
        Self::object(tags::OBJECT, 0)
    }

    /// Remote object identity, if this value refers to one (null maps to None).
    pub fn object_id(&self) -> Option<ObjectId> {
        match self.data {
            ValueData::Object(0) => None,
            ValueData::Object(id) => Some(id),
            _ => None,
        }
    }

    /// Append this value in tagged-value wire format.
    pub fn write_tagged(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.tag);
        match &self.data {
            ValueData::Byte(v) => buf.put_i8(*v),
            ValueData::Char(v) => buf.put_u16(*v),
            ValueData::Float(v) => buf.put_f32(*v),
            ValueData::Double(v) => buf.put_f64(*v),
            ValueData::Int(v) => buf.put_i32(*v),
            ValueData::Long(v) => buf.put_i64(*v),
            ValueData::Short(v) => buf.put_i16(*v),
            ValueData::Boolean(v) => buf.put_u8(u8::from(*v)),
            ValueData::Object(id) => buf.put_u64(*id),
            ValueData::Void => {}
        }
    }

    pub fn format(&self) -> String {
        match &self.data {
            ValueData::Byte(v) => format!("(byte) {}", v),
            ValueData::Char(v) => format!("(char) '{}'", char::from_u32(*v as u32).unwrap_or('?')),
            ValueData::Float(v) => format!("(float) {}", v),
            ValueData::Double(v) => format!("(double) {}", v),
            ValueData::Int(v) => format!("(int) {}", v),
            ValueData::Long(v) => format!("(long) {}", v),
            ValueData::Short(v) => format!("(short) {}", v),
            ValueData::Boolean(v) => format!("(boolean) {}", v),
            ValueData::Object(0) => "(object) null".to_string(),
            ValueData::Object(id) => format!("(object) @{:x}", id),
            ValueData::Void => "(void)".to_string(),
        }
    }
}

/// Read a tagged value (tag byte followed by tag-specific payload).
pub fn read_tagged_value(buf: &mut &[u8]) -> JdwpResult<Value> {
    let tag = read_u8(buf)?;
    let data = read_value_data(tag, buf)?;
    Ok(Value { tag, data })
}

fn read_value_data(tag: u8, buf: &mut &[u8]) -> JdwpResult<ValueData> {
    match tag {
        tags::BYTE => Ok(ValueData::Byte(buf.get_i8())),
        tags::CHAR => Ok(ValueData::Char(buf.get_u16())),
        tags::DOUBLE => Ok(ValueData::Double(buf.get_f64())),
        tags::FLOAT => Ok(ValueData::Float(buf.get_f32())),
        tags::INT => Ok(ValueData::Int(buf.get_i32())),
        tags::LONG => Ok(ValueData::Long(buf.get_i64())),
        tags::SHORT => Ok(ValueData::Short(buf.get_i16())),
        tags::BOOLEAN => Ok(ValueData::Boolean(buf.get_u8() != 0)),
        tags::VOID => Ok(ValueData::Void),
        tags::OBJECT
        | tags::STRING
        | tags::THREAD
        | tags::THREAD_GROUP
        | tags::CLASS_LOADER
        | tags::CLASS_OBJECT
        | tags::ARRAY => {
            let object_id = read_u64(buf)?;
            Ok(ValueData::Object(object_id))
        }
        _ => Err(JdwpError::Protocol(format!("unknown value tag: {}", tag))),
    }
}

/// JNI-style signature for a dotted class name: "android.os.Looper" -> "Landroid/os/Looper;"
pub fn class_signature(class_name: &str) -> String {
    format!("L{};", class_name.replace('.', "/"))
}

/// Dotted class name for a JNI-style signature, best effort.
pub fn signature_to_class_name(signature: &str) -> String {
    signature
        .strip_prefix('L')
        .and_then(|s| s.strip_suffix(';'))
        .unwrap_or(signature)
        .replace('/', ".")
}

/// Local variable information from Method.VariableTable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub code_index: u64,
    pub name: String,
    pub signature: String,
    pub length: u32,
    pub slot: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_signature() {
        assert_eq!(
            class_signature("android.content.ContextWrapper"),
            "Landroid/content/ContextWrapper;"
        );
        assert_eq!(
            signature_to_class_name("Ljava/lang/UnsatisfiedLinkError;"),
            "java.lang.UnsatisfiedLinkError"
        );
    }

    #[test]
    fn test_tagged_value_round_trip() {
        let value = Value::object(tags::STRING, 0xCAFE);
        let mut buf = Vec::new();
        value.write_tagged(&mut buf);

        let mut slice = buf.as_slice();
        assert_eq!(read_tagged_value(&mut slice).unwrap(), value);

        let void = Value {
            tag: tags::VOID,
            data: ValueData::Void,
        };
        let mut buf = Vec::new();
        void.write_tagged(&mut buf);
        assert_eq!(buf, vec![tags::VOID]);
    }

    #[test]
    fn test_null_object_id() {
        assert_eq!(Value::null().object_id(), None);
        assert_eq!(Value::object(tags::OBJECT, 7).object_id(), Some(7));
    }
}
