//! Shared utilities

pub mod error;
pub mod fs;
pub mod poll;

pub use error::{ErrorResponse, RecordingError, RecordingResult};
pub use poll::{bounded, poll_until, PollError, PollPolicy, Shutdown, ShutdownHandle};
