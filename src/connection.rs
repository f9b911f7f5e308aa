//! Per-connection protocol handling: the state machine and its async driver.

pub mod closure;
pub mod stream;
pub mod task;

pub use closure::{ClosureOptions, ConnectionClosure, ConnectionState};
pub use stream::{BoxedStream, NetStream};
pub use task::{serve_connection, ConnectionContext};
