pub mod api;
pub mod buffer;

pub use api::{negotiate, ControlApi, HttpControlApi, NegotiationError};
pub use buffer::{BufferOpenError, OverlayBuffer};
