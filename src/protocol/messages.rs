//! Wire message types for the audit log protocol.
//!
//! Messages travel in both directions as protobuf-encoded tagged unions,
//! prefixed on the wire with a 32-bit size in network byte order (see
//! [`crate::protocol::codec`]). Field numbering is part of the wire
//! contract and must not change.

use std::time::Duration;

/// Equivalent of POSIX `struct timespec`.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct TimeSpec {
    /// seconds
    #[prost(int64, tag = "1")]
    pub tv_sec: i64,
    /// nanoseconds
    #[prost(int32, tag = "2")]
    pub tv_nsec: i32,
}

impl TimeSpec {
    pub fn new(tv_sec: i64, tv_nsec: i32) -> Self {
        TimeSpec { tv_sec, tv_nsec }
    }

    /// Convert to a `Duration`, rejecting negative values.
    pub fn to_duration(self) -> Option<Duration> {
        if self.tv_sec < 0 || self.tv_nsec < 0 || self.tv_nsec >= 1_000_000_000 {
            return None;
        }
        Some(Duration::new(self.tv_sec as u64, self.tv_nsec as u32))
    }
}

impl From<Duration> for TimeSpec {
    fn from(d: Duration) -> Self {
        TimeSpec {
            tv_sec: d.as_secs() as i64,
            tv_nsec: d.subsec_nanos() as i32,
        }
    }
}

/// I/O buffer with captured terminal data.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IoBuffer {
    /// elapsed time since the previous record
    #[prost(message, optional, tag = "1")]
    pub delay: Option<TimeSpec>,
    /// captured bytes
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

/// Key/value event data supplied by the policy engine.
/// The value may be a number, a string, or a list of either.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InfoMessage {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(oneof = "info_message::Value", tags = "2, 3, 4, 5")]
    pub value: Option<info_message::Value>,
}

pub mod info_message {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StringList {
        #[prost(string, repeated, tag = "1")]
        pub strings: Vec<String>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct NumberList {
        #[prost(int64, repeated, tag = "1")]
        pub numbers: Vec<i64>,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(int64, tag = "2")]
        Numval(i64),
        #[prost(string, tag = "3")]
        Strval(String),
        #[prost(message, tag = "4")]
        Strlistval(StringList),
        #[prost(message, tag = "5")]
        Numlistval(NumberList),
    }
}

/// Event log data for a command accepted by the policy.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AcceptMessage {
    /// when the command was submitted
    #[prost(message, optional, tag = "1")]
    pub submit_time: Option<TimeSpec>,
    /// key/value event log data
    #[prost(message, repeated, tag = "2")]
    pub info_msgs: Vec<InfoMessage>,
    /// true if I/O logging is enabled for the session
    #[prost(bool, tag = "3")]
    pub expect_iobufs: bool,
}

/// Event log data for a command rejected by the policy.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RejectMessage {
    #[prost(message, optional, tag = "1")]
    pub submit_time: Option<TimeSpec>,
    /// reason the command was rejected
    #[prost(string, tag = "2")]
    pub reason: String,
    #[prost(message, repeated, tag = "3")]
    pub info_msgs: Vec<InfoMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExitMessage {
    /// total elapsed run time
    #[prost(message, optional, tag = "1")]
    pub run_time: Option<TimeSpec>,
    /// 0-255
    #[prost(int32, tag = "2")]
    pub exit_value: i32,
    /// true if the command dumped core
    #[prost(bool, tag = "3")]
    pub dumped_core: bool,
    /// signal name if killed by a signal
    #[prost(string, tag = "4")]
    pub signal: String,
    /// set if killed due to some other error
    #[prost(string, tag = "5")]
    pub error: String,
}

/// Alert message, policy module-specific.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AlertMessage {
    #[prost(message, optional, tag = "1")]
    pub alert_time: Option<TimeSpec>,
    #[prost(string, tag = "2")]
    pub reason: String,
    #[prost(message, repeated, tag = "3")]
    pub info_msgs: Vec<InfoMessage>,
}

/// Used to resume an existing I/O log on the server.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RestartMessage {
    /// ID of the log being restarted
    #[prost(string, tag = "1")]
    pub log_id: String,
    /// resume point (elapsed time)
    #[prost(message, optional, tag = "2")]
    pub resume_point: Option<TimeSpec>,
}

/// Window size change event.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChangeWindowSize {
    #[prost(message, optional, tag = "1")]
    pub delay: Option<TimeSpec>,
    #[prost(int32, tag = "2")]
    pub rows: i32,
    #[prost(int32, tag = "3")]
    pub cols: i32,
}

/// Command suspend/resume event.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandSuspend {
    #[prost(message, optional, tag = "1")]
    pub delay: Option<TimeSpec>,
    /// signal that caused the suspend/resume, no SIG prefix
    #[prost(string, tag = "2")]
    pub signal: String,
}

/// Hello message sent by a client (or by this server when relaying).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientHello {
    /// free-form client description
    #[prost(string, tag = "1")]
    pub client_id: String,
}

/// Client messages to the server.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientMessage {
    #[prost(oneof = "client_message::Msg", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13")]
    pub msg: Option<client_message::Msg>,
}

pub mod client_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        AcceptMsg(super::AcceptMessage),
        #[prost(message, tag = "2")]
        RejectMsg(super::RejectMessage),
        #[prost(message, tag = "3")]
        ExitMsg(super::ExitMessage),
        #[prost(message, tag = "4")]
        RestartMsg(super::RestartMessage),
        #[prost(message, tag = "5")]
        AlertMsg(super::AlertMessage),
        #[prost(message, tag = "6")]
        TtyinBuf(super::IoBuffer),
        #[prost(message, tag = "7")]
        TtyoutBuf(super::IoBuffer),
        #[prost(message, tag = "8")]
        StdinBuf(super::IoBuffer),
        #[prost(message, tag = "9")]
        StdoutBuf(super::IoBuffer),
        #[prost(message, tag = "10")]
        StderrBuf(super::IoBuffer),
        #[prost(message, tag = "11")]
        WinsizeEvent(super::ChangeWindowSize),
        #[prost(message, tag = "12")]
        SuspendEvent(super::CommandSuspend),
        #[prost(message, tag = "13")]
        HelloMsg(super::ClientHello),
    }
}

impl client_message::Msg {
    /// Short message name for logging and state machine errors.
    pub fn name(&self) -> &'static str {
        match self {
            client_message::Msg::AcceptMsg(_) => "AcceptMessage",
            client_message::Msg::RejectMsg(_) => "RejectMessage",
            client_message::Msg::ExitMsg(_) => "ExitMessage",
            client_message::Msg::RestartMsg(_) => "RestartMessage",
            client_message::Msg::AlertMsg(_) => "AlertMessage",
            client_message::Msg::TtyinBuf(_) => "IoBuffer (ttyin)",
            client_message::Msg::TtyoutBuf(_) => "IoBuffer (ttyout)",
            client_message::Msg::StdinBuf(_) => "IoBuffer (stdin)",
            client_message::Msg::StdoutBuf(_) => "IoBuffer (stdout)",
            client_message::Msg::StderrBuf(_) => "IoBuffer (stderr)",
            client_message::Msg::WinsizeEvent(_) => "ChangeWindowSize",
            client_message::Msg::SuspendEvent(_) => "CommandSuspend",
            client_message::Msg::HelloMsg(_) => "ClientHello",
        }
    }
}

/// Hello message from the server when a client connects.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerHello {
    /// free-form server description
    #[prost(string, tag = "1")]
    pub server_id: String,
    /// optional redirect if the server is busy
    #[prost(string, tag = "2")]
    pub redirect: String,
    /// optional list of known servers
    #[prost(string, repeated, tag = "3")]
    pub servers: Vec<String>,
}

/// Server messages to the client.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerMessage {
    #[prost(oneof = "server_message::Msg", tags = "1, 2, 3, 4, 5")]
    pub msg: Option<server_message::Msg>,
}

pub mod server_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Msg {
        /// server hello message
        #[prost(message, tag = "1")]
        Hello(super::ServerHello),
        /// cumulative elapsed time of records stored to disk
        #[prost(message, tag = "2")]
        CommitPoint(super::TimeSpec),
        /// ID of the server-side I/O log
        #[prost(string, tag = "3")]
        LogId(String),
        /// error message, connection will close
        #[prost(string, tag = "4")]
        Error(String),
        /// abort message, kill the command
        #[prost(string, tag = "5")]
        Abort(String),
    }
}

impl ServerMessage {
    pub fn hello(server_id: &str) -> Self {
        ServerMessage {
            msg: Some(server_message::Msg::Hello(ServerHello {
                server_id: server_id.to_string(),
                redirect: String::new(),
                servers: Vec::new(),
            })),
        }
    }

    pub fn commit_point(elapsed: Duration) -> Self {
        ServerMessage {
            msg: Some(server_message::Msg::CommitPoint(TimeSpec::from(elapsed))),
        }
    }

    pub fn log_id(id: impl Into<String>) -> Self {
        ServerMessage {
            msg: Some(server_message::Msg::LogId(id.into())),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        ServerMessage {
            msg: Some(server_message::Msg::Error(reason.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespec_duration_conversion() {
        let ts = TimeSpec::new(3, 500_000_000);
        assert_eq!(ts.to_duration(), Some(Duration::new(3, 500_000_000)));
        assert_eq!(TimeSpec::from(Duration::new(3, 500_000_000)), ts);
    }

    #[test]
    fn timespec_rejects_negative() {
        assert_eq!(TimeSpec::new(-1, 0).to_duration(), None);
        assert_eq!(TimeSpec::new(0, -1).to_duration(), None);
        assert_eq!(TimeSpec::new(0, 1_000_000_000).to_duration(), None);
    }
}
