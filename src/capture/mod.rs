pub mod frame;
pub mod gst_reader;
pub mod process;
pub mod uxplay;

pub use frame::{Frame, Geometry};
pub use process::{CommandSpec, ManagedProcess, ProcessKind, StdoutMode};
