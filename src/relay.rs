//! Relay mode: forwarding a session to a chain of upstream log servers.

pub mod forwarder;

pub use forwarder::{RelayLink, RelaySettings, RelayTarget};
