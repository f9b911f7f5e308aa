//! Error types, one enum per subsystem.

pub mod types;

pub use types::{
    CodecError, ConfigError, ConnectionError, EventLogError, IoLogError, RelayError, ServerError,
};
