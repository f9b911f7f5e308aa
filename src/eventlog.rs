//! Event record seam.
//!
//! Accept/Reject/Alert events are handed off as an opaque ordered list of
//! typed key/value pairs; how they are rendered for humans is not this
//! server's concern. The shipped implementation appends JSON lines.

pub mod json;
pub mod types;

pub use json::JsonEventLog;
pub use types::{EventKind, EventLog, InfoValue, LoggedEvent};
