//! Session metadata ("info") files.
//!
//! The `log` file keeps the legacy three-line format understood by replay
//! tools; `log.json` carries the same fields for newer consumers.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use log::warn;
use serde::Serialize;

use crate::error_handling::types::IoLogError;
use crate::protocol::messages::{info_message, InfoMessage};

const RUNAS_DEFAULT: &str = "root";

/// Metadata describing the audited command, extracted from the accept
/// event's key/value list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogInfo {
    /// Submit time, seconds since the epoch.
    pub submit_time: i64,
    pub submit_user: String,
    pub submit_group: String,
    pub submit_host: String,
    pub run_user: String,
    pub run_group: String,
    pub tty: String,
    pub lines: i64,
    pub columns: i64,
    pub cwd: String,
    pub command: String,
    pub argv: Vec<String>,
}

fn str_value(info: &InfoMessage) -> Option<&str> {
    match &info.value {
        Some(info_message::Value::Strval(s)) => Some(s),
        _ => None,
    }
}

fn num_value(info: &InfoMessage) -> Option<i64> {
    match &info.value {
        Some(info_message::Value::Numval(n)) => Some(*n),
        _ => None,
    }
}

impl LogInfo {
    /// Pull the fields this store needs out of the event's key/value list.
    /// Unknown keys are ignored; wrongly-typed known keys keep the default.
    /// `submituser`, `submithost` and `command` are required.
    pub fn from_info_msgs(submit_time: i64, info_msgs: &[InfoMessage]) -> Result<LogInfo, IoLogError> {
        let mut submit_user = None;
        let mut submit_host = None;
        let mut command = None;
        let mut info = LogInfo {
            submit_time,
            submit_user: String::new(),
            submit_group: String::new(),
            submit_host: String::new(),
            run_user: RUNAS_DEFAULT.to_string(),
            run_group: String::new(),
            tty: "unknown".to_string(),
            lines: 24,
            columns: 80,
            cwd: "unknown".to_string(),
            command: String::new(),
            argv: Vec::new(),
        };

        for msg in info_msgs {
            match msg.key.as_str() {
                "columns" => match num_value(msg) {
                    Some(n) if n > 0 && n <= i32::MAX as i64 => info.columns = n,
                    _ => warn!("columns info is missing or out of range"),
                },
                "lines" => match num_value(msg) {
                    Some(n) if n > 0 && n <= i32::MAX as i64 => info.lines = n,
                    _ => warn!("lines info is missing or out of range"),
                },
                "command" => match str_value(msg) {
                    Some(s) => command = Some(s.to_string()),
                    None => warn!("command info is not a string"),
                },
                "cwd" => match str_value(msg) {
                    Some(s) => info.cwd = s.to_string(),
                    None => warn!("cwd info is not a string"),
                },
                "runargv" => match &msg.value {
                    Some(info_message::Value::Strlistval(list)) => {
                        info.argv = list.strings.clone();
                    }
                    _ => warn!("runargv info is not a string list"),
                },
                "rungroup" => match str_value(msg) {
                    Some(s) => info.run_group = s.to_string(),
                    None => warn!("rungroup info is not a string"),
                },
                "runuser" => match str_value(msg) {
                    Some(s) => info.run_user = s.to_string(),
                    None => warn!("runuser info is not a string"),
                },
                "submitgroup" => match str_value(msg) {
                    Some(s) => info.submit_group = s.to_string(),
                    None => warn!("submitgroup info is not a string"),
                },
                "submithost" => match str_value(msg) {
                    Some(s) => submit_host = Some(s.to_string()),
                    None => warn!("submithost info is not a string"),
                },
                "submituser" => match str_value(msg) {
                    Some(s) => submit_user = Some(s.to_string()),
                    None => warn!("submituser info is not a string"),
                },
                "ttyname" => match str_value(msg) {
                    Some(s) => info.tty = s.to_string(),
                    None => warn!("ttyname info is not a string"),
                },
                _ => {}
            }
        }

        info.submit_user = submit_user.ok_or(IoLogError::MissingInfo("submituser"))?;
        info.submit_host = submit_host.ok_or(IoLogError::MissingInfo("submithost"))?;
        info.command = command.ok_or(IoLogError::MissingInfo("command"))?;
        Ok(info)
    }

    /// Write the legacy `log` file and its JSON sibling into `dir`.
    pub fn write(&self, dir: &Path, file_mode: u32) -> Result<(), IoLogError> {
        let mut f = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(file_mode)
            .open(dir.join("log"))?;
        let mut line3 = self.command.clone();
        for arg in self.argv.iter().skip(1) {
            line3.push(' ');
            line3.push_str(arg);
        }
        write!(
            f,
            "{}:{}:{}:{}:{}:{}:{}\n{}\n{}\n",
            self.submit_time,
            self.submit_user,
            self.run_user,
            self.run_group,
            self.tty,
            self.lines,
            self.columns,
            self.cwd,
            line3
        )?;
        f.flush()?;

        let json = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(file_mode)
            .open(dir.join("log.json"))?;
        serde_json::to_writer_pretty(&json, self)
            .map_err(|e| IoLogError::BadInfo(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::info_message::{StringList, Value};
    use tempfile::TempDir;

    fn info(key: &str, value: Value) -> InfoMessage {
        InfoMessage {
            key: key.to_string(),
            value: Some(value),
        }
    }

    fn sample_msgs() -> Vec<InfoMessage> {
        vec![
            info("submituser", Value::Strval("alice".into())),
            info("submithost", Value::Strval("buildbox".into())),
            info("command", Value::Strval("/bin/ls".into())),
            info("ttyname", Value::Strval("/dev/pts/3".into())),
            info("cwd", Value::Strval("/home/alice".into())),
            info("lines", Value::Numval(50)),
            info("columns", Value::Numval(132)),
            info(
                "runargv",
                Value::Strlistval(StringList {
                    strings: vec!["/bin/ls".into(), "-l".into()],
                }),
            ),
        ]
    }

    #[test]
    fn extracts_fields_with_defaults() {
        let li = LogInfo::from_info_msgs(1_700_000_000, &sample_msgs()).unwrap();
        assert_eq!(li.submit_user, "alice");
        assert_eq!(li.run_user, "root");
        assert_eq!(li.lines, 50);
        assert_eq!(li.argv, vec!["/bin/ls", "-l"]);
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let msgs: Vec<InfoMessage> = sample_msgs()
            .into_iter()
            .filter(|m| m.key != "command")
            .collect();
        assert!(matches!(
            LogInfo::from_info_msgs(0, &msgs),
            Err(IoLogError::MissingInfo("command"))
        ));
    }

    #[test]
    fn wrong_typed_key_keeps_default() {
        let mut msgs = sample_msgs();
        for m in &mut msgs {
            if m.key == "lines" {
                m.value = Some(Value::Strval("fifty".into()));
            }
        }
        let li = LogInfo::from_info_msgs(0, &msgs).unwrap();
        assert_eq!(li.lines, 24);
    }

    #[test]
    fn writes_legacy_and_json_files() {
        let dir = TempDir::new().unwrap();
        let li = LogInfo::from_info_msgs(1_700_000_000, &sample_msgs()).unwrap();
        li.write(dir.path(), 0o600).unwrap();

        let log = std::fs::read_to_string(dir.path().join("log")).unwrap();
        assert_eq!(
            log,
            "1700000000:alice:root::/dev/pts/3:50:132\n/home/alice\n/bin/ls -l\n"
        );
        let json = std::fs::read_to_string(dir.path().join("log.json")).unwrap();
        assert!(json.contains("\"submit_user\": \"alice\""));
    }
}
