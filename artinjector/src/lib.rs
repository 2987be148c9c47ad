// ART injector: loads shared libraries and apk payloads into a running
// debuggable Android application by attaching to it as a JDWP debugger.

pub mod apk;
pub mod error;
pub mod inject;
pub mod transport;

pub use error::InjectError;
pub use inject::{ArtInjector, InjectOptions};
pub use transport::{AdbTransport, Device, ProcessInfo, Transport};
