// Helper functions for reading JDWP data types from buffers

use crate::protocol::{JdwpError, JdwpResult};
use bytes::Buf;

/// Read a JDWP string (4-byte length prefix + UTF-8 bytes)
pub fn read_string(buf: &mut &[u8]) -> JdwpResult<String> {
    if buf.remaining() < 4 {
        return Err(JdwpError::Protocol(
            "not enough data for string length".to_string(),
        ));
    }

    let len = buf.get_u32() as usize;

    if buf.remaining() < len {
        return Err(JdwpError::Protocol(format!(
            "not enough data for string: expected {}, got {}",
            len,
            buf.remaining()
        )));
    }

    let bytes = &buf[..len];
    buf.advance(len);

    String::from_utf8(bytes.to_vec())
        .map_err(|e| JdwpError::Protocol(format!("invalid UTF-8 in string: {}", e)))
}

pub fn read_u8(buf: &mut &[u8]) -> JdwpResult<u8> {
    if buf.remaining() < 1 {
        return Err(JdwpError::Protocol("not enough data for u8".to_string()));
    }
    Ok(buf.get_u8())
}

pub fn read_u16(buf: &mut &[u8]) -> JdwpResult<u16> {
    if buf.remaining() < 2 {
        return Err(JdwpError::Protocol("not enough data for u16".to_string()));
    }
    Ok(buf.get_u16())
}

pub fn read_i32(buf: &mut &[u8]) -> JdwpResult<i32> {
    if buf.remaining() < 4 {
        return Err(JdwpError::Protocol("not enough data for i32".to_string()));
    }
    Ok(buf.get_i32())
}

pub fn read_u32(buf: &mut &[u8]) -> JdwpResult<u32> {
    if buf.remaining() < 4 {
        return Err(JdwpError::Protocol("not enough data for u32".to_string()));
    }
    Ok(buf.get_u32())
}

pub fn read_u64(buf: &mut &[u8]) -> JdwpResult<u64> {
    if buf.remaining() < 8 {
        return Err(JdwpError::Protocol("not enough data for u64".to_string()));
    }
    Ok(buf.get_u64())
}

/// Append a JDWP string (4-byte length prefix + UTF-8 bytes)
pub fn put_string(buf: &mut Vec<u8>, s: &str) {
    use bytes::BufMut;
    buf.put_u32(s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}
