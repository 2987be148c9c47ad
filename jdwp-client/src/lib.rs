// JDWP client library for attaching to Android ART processes
//
// Implements the subset of the JDWP protocol that library injection needs:
// - Connection management and packet framing
// - Method-entry breakpoints with a background dispatch loop
// - Remote method invocation on a suspended thread

pub mod breakpoint;
pub mod classtype;
pub mod commands;
pub mod connection;
pub mod evaluate;
pub mod eventloop;
pub mod eventrequest;
pub mod events;
pub mod method;
pub mod object;
pub mod protocol;
pub mod reader;
pub mod reftype;
pub mod session;
pub mod stackframe;
pub mod string;
#[cfg(feature = "testvm")]
pub mod testvm;
pub mod thread;
pub mod types;
pub mod vm;

pub use breakpoint::Breakpoint;
pub use connection::JdwpConnection;
pub use evaluate::{CallArg, EvaluateContext, EvaluateResult, Evaluator};
pub use eventrequest::SuspendPolicy;
pub use protocol::{JdwpError, JdwpResult};
pub use session::{BreakpointEvent, DebugSession, EventListener};
