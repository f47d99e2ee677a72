//! IPC bridge between the supervisor and the worker subprocess.
//!
//! - **protocol**: envelope types (batch requests down, events up)
//! - **codec**: length-prefixed JSON framing over AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
