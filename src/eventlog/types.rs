use serde::Serialize;

use crate::error_handling::types::EventLogError;
use crate::protocol::messages::{info_message, InfoMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Accept,
    Reject,
    Alert,
}

/// A single typed value from the event's key/value list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum InfoValue {
    Number(i64),
    String(String),
    StringList(Vec<String>),
    NumberList(Vec<i64>),
}

impl InfoValue {
    pub fn from_message(msg: &InfoMessage) -> Option<InfoValue> {
        match &msg.value {
            Some(info_message::Value::Numval(n)) => Some(InfoValue::Number(*n)),
            Some(info_message::Value::Strval(s)) => Some(InfoValue::String(s.clone())),
            Some(info_message::Value::Strlistval(l)) => {
                Some(InfoValue::StringList(l.strings.clone()))
            }
            Some(info_message::Value::Numlistval(l)) => {
                Some(InfoValue::NumberList(l.numbers.clone()))
            }
            None => None,
        }
    }
}

/// An event as passed to the logging collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct LoggedEvent {
    pub kind: EventKind,
    /// Event time from the client, seconds since the epoch.
    pub time: i64,
    /// Peer address of the submitting connection.
    pub peer: String,
    /// Reject/alert reason, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Ordered key/value metadata, passed through untouched.
    pub info: Vec<(String, InfoValue)>,
}

impl LoggedEvent {
    pub fn new(kind: EventKind, time: i64, peer: String) -> Self {
        LoggedEvent {
            kind,
            time,
            peer,
            reason: None,
            info: Vec::new(),
        }
    }

    pub fn with_info_msgs(mut self, info_msgs: &[InfoMessage]) -> Self {
        self.info = info_msgs
            .iter()
            .filter_map(|m| InfoValue::from_message(m).map(|v| (m.key.clone(), v)))
            .collect();
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        if !reason.is_empty() {
            self.reason = Some(reason.to_string());
        }
        self
    }
}

/// Consumer of policy events. Implementations must tolerate being called
/// from multiple connections.
pub trait EventLog: Send + Sync {
    fn log(&self, event: &LoggedEvent) -> Result<(), EventLogError>;
}

/// Discards every event. Used when no event sink is configured.
pub struct NullEventLog;

impl EventLog for NullEventLog {
    fn log(&self, _event: &LoggedEvent) -> Result<(), EventLogError> {
        Ok(())
    }
}
