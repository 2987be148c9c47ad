// Injection error taxonomy
//
// Every failure class carries a stable numeric code for the CLI surface;
// scripts key off the exit code, not the message text.

use jdwp_client::JdwpError;
use std::path::PathBuf;
use thiserror::Error;

pub mod codes {
    pub const PAYLOAD_NOT_FOUND: i32 = 1;
    pub const DEVICE_NOT_FOUND: i32 = 2;
    pub const PROCESS_NOT_DEBUGGABLE: i32 = 3;
    pub const PUSH_FAILED: i32 = 4;
    pub const ATTACH_FAILED: i32 = 5;
    pub const BREAKPOINT_TIMEOUT: i32 = 6;
    pub const PAYLOAD_SHOULD_BE_32BIT: i32 = 7;
    pub const PAYLOAD_SHOULD_BE_64BIT: i32 = 8;
    pub const REMOTE_INVOCATION_FAILED: i32 = 9;
    pub const ADB_UNAVAILABLE: i32 = 10;
    pub const BREAKPOINT_FORMAT: i32 = 11;
    pub const INJECT_TIMEOUT: i32 = 12;
}

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("payload does not exist: {0}")]
    PayloadNotFound(PathBuf),

    #[error("can not find device{}", fmt_serial(.0))]
    DeviceNotFound(Option<String>),

    #[error(
        "can not find a debuggable process for package {0}; \
         make sure the application is debuggable and running"
    )]
    ProcessNotDebuggable(String),

    #[error("can not push {payload} into device: {reason}")]
    PushFailed { payload: String, reason: String },

    #[error("can not attach to the application at {host}:{port}")]
    AttachFailed { host: String, port: u16 },

    #[error("no breakpoint was hit before the deadline, breakpoints={0}")]
    BreakpointTimeout(String),

    #[error("{payload} is {payload_bits}-bit but the application is {app_bits}-bit")]
    AbiMismatch {
        payload: String,
        payload_bits: u8,
        app_bits: u8,
    },

    #[error("remote invocation failed: {0}")]
    RemoteInvocation(String),

    #[error("adb is not available: {0}")]
    AdbUnavailable(String),

    #[error("invalid breakpoint, expected Class.method: {0}")]
    BreakpointFormat(String),

    #[error("unsupported application abi: {0}")]
    UnsupportedAbi(String),

    #[error("injection timed out")]
    Timeout,

    #[error(transparent)]
    Jdwp(#[from] JdwpError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn fmt_serial(serial: &Option<String>) -> String {
    match serial {
        Some(s) => format!(", serial={}", s),
        None => String::new(),
    }
}

impl InjectError {
    /// Stable numeric code for the CLI exit status.
    pub fn code(&self) -> i32 {
        match self {
            InjectError::PayloadNotFound(_) => codes::PAYLOAD_NOT_FOUND,
            InjectError::DeviceNotFound(_) => codes::DEVICE_NOT_FOUND,
            InjectError::ProcessNotDebuggable(_) => codes::PROCESS_NOT_DEBUGGABLE,
            InjectError::PushFailed { .. } => codes::PUSH_FAILED,
            InjectError::AttachFailed { .. } => codes::ATTACH_FAILED,
            InjectError::BreakpointTimeout(_) => codes::BREAKPOINT_TIMEOUT,
            InjectError::AbiMismatch { app_bits, .. } => bits_code(*app_bits),
            InjectError::RemoteInvocation(message) => match bitness_hint(message) {
                Some(bits) => bits_code(bits),
                None => codes::REMOTE_INVOCATION_FAILED,
            },
            InjectError::AdbUnavailable(_) => codes::ADB_UNAVAILABLE,
            InjectError::BreakpointFormat(_) => codes::BREAKPOINT_FORMAT,
            // apk library extraction happens during the push phase
            InjectError::UnsupportedAbi(_) => codes::PUSH_FAILED,
            InjectError::Timeout => codes::INJECT_TIMEOUT,
            InjectError::Jdwp(_) => codes::REMOTE_INVOCATION_FAILED,
            InjectError::Io(_) => codes::PUSH_FAILED,
        }
    }
}

fn bits_code(bits: u8) -> i32 {
    if bits == 32 {
        codes::PAYLOAD_SHOULD_BE_32BIT
    } else {
        codes::PAYLOAD_SHOULD_BE_64BIT
    }
}

/// Linker errors end with the bit width the process actually wants, e.g.
/// `dlopen failed: "..." is 32-bit instead of 64-bit`. Pull that width out
/// so the failure maps to the matching abi code.
fn bitness_hint(message: &str) -> Option<u8> {
    let last = message.split_whitespace().last()?;
    let last = last.trim_end_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-');
    match last {
        "32-bit" => Some(32),
        "64-bit" => Some(64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            InjectError::PayloadNotFound(PathBuf::from("/tmp/x.so")).code(),
            1
        );
        assert_eq!(InjectError::DeviceNotFound(None).code(), 2);
        assert_eq!(InjectError::BreakpointTimeout(String::new()).code(), 6);
        assert_eq!(InjectError::Timeout.code(), 12);
    }

    #[test]
    fn test_abi_mismatch_codes() {
        let err = InjectError::AbiMismatch {
            payload: "libnative.so".to_string(),
            payload_bits: 64,
            app_bits: 32,
        };
        assert_eq!(err.code(), codes::PAYLOAD_SHOULD_BE_32BIT);

        let err = InjectError::AbiMismatch {
            payload: "libnative.so".to_string(),
            payload_bits: 32,
            app_bits: 64,
        };
        assert_eq!(err.code(), codes::PAYLOAD_SHOULD_BE_64BIT);
    }

    #[test]
    fn test_remote_invocation_bitness_hint() {
        let err = InjectError::RemoteInvocation(
            "java.lang.UnsatisfiedLinkError dlopen failed: \
             \"/data/data/app/lib.so\" is 32-bit instead of 64-bit"
                .to_string(),
        );
        assert_eq!(err.code(), codes::PAYLOAD_SHOULD_BE_64BIT);

        let err = InjectError::RemoteInvocation("class not found".to_string());
        assert_eq!(err.code(), codes::REMOTE_INVOCATION_FAILED);
    }
}
