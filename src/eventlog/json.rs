use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use log::info;
use serde::Serialize;

use crate::error_handling::types::EventLogError;
use crate::eventlog::types::{EventLog, LoggedEvent};

#[derive(Serialize)]
struct JsonRecord<'a> {
    /// Server-side receive time, RFC 3339.
    logged_at: String,
    #[serde(flatten)]
    event: &'a LoggedEvent,
}

/// Appends one JSON object per event to a log file.
pub struct JsonEventLog {
    file: Mutex<std::fs::File>,
}

impl JsonEventLog {
    pub fn open(path: &Path) -> Result<Self, EventLogError> {
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        info!("logging events to {}", path.display());
        Ok(JsonEventLog {
            file: Mutex::new(file),
        })
    }
}

impl EventLog for JsonEventLog {
    fn log(&self, event: &LoggedEvent) -> Result<(), EventLogError> {
        let record = JsonRecord {
            logged_at: Utc::now().to_rfc3339(),
            event,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        match self.file.lock() {
            Ok(mut file) => {
                file.write_all(&line)?;
                Ok(())
            }
            Err(_) => Err(EventLogError::IoError(std::io::Error::other(
                "event log mutex poisoned",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::types::EventKind;
    use crate::protocol::messages::info_message::Value;
    use crate::protocol::messages::InfoMessage;
    use tempfile::TempDir;

    #[test]
    fn writes_one_json_line_per_event() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.json");
        let sink = JsonEventLog::open(&path).unwrap();

        let info = vec![InfoMessage {
            key: "submituser".into(),
            value: Some(Value::Strval("alice".into())),
        }];
        sink.log(
            &LoggedEvent::new(EventKind::Accept, 1_700_000_000, "127.0.0.1:9999".into())
                .with_info_msgs(&info),
        )
        .unwrap();
        sink.log(
            &LoggedEvent::new(EventKind::Reject, 1_700_000_001, "127.0.0.1:9999".into())
                .with_reason("not permitted"),
        )
        .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "accept");
        assert_eq!(first["info"][0][0], "submituser");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["reason"], "not permitted");
    }
}
