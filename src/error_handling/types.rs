use std::fmt;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    NoListeners(String),
    BadAddress(String),
    BadEscapePattern(String),
    TlsMaterial(String),
    NotInRange(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::NoListeners(e) => write!(f, "listener configuration error: {}", e),
            ConfigError::BadAddress(e) => write!(f, "bad listen address: {}", e),
            ConfigError::BadEscapePattern(e) => write!(f, "bad I/O log path pattern: {}", e),
            ConfigError::TlsMaterial(e) => write!(f, "TLS configuration error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "value out of range: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

/// Errors from the length-prefixed wire framing and protobuf decoding.
///
/// `Truncated` (EOF mid-frame) is distinguished from `Malformed` (bad
/// protobuf payload): a short buffer keeps the reader accumulating, and
/// `Truncated` is reported only when the peer closes inside a frame.
#[derive(Debug)]
pub enum CodecError {
    Oversize(u32),
    Malformed(prost::DecodeError),
    Truncated,
    IoError(std::io::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Oversize(len) => write!(f, "message too large: {} bytes", len),
            CodecError::Malformed(e) => write!(f, "malformed message: {}", e),
            CodecError::Truncated => write!(f, "connection closed mid-frame"),
            CodecError::IoError(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        CodecError::IoError(err)
    }
}

impl From<prost::DecodeError> for CodecError {
    fn from(err: prost::DecodeError) -> Self {
        CodecError::Malformed(err)
    }
}

#[derive(Debug)]
pub enum IoLogError {
    IoError(std::io::Error),
    BadLogId(String),
    SequenceExhausted,
    MissingInfo(&'static str),
    BadInfo(String),
    MalformedTiming(String),
    ResumeMismatch { target: Duration, elapsed: Duration },
    LogComplete,
    NegativeDelay,
    MissingStream(&'static str),
    StreamTooShort { stream: &'static str, want: u64, have: u64 },
}

impl fmt::Display for IoLogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoLogError::IoError(e) => write!(f, "I/O log error: {}", e),
            IoLogError::BadLogId(id) => write!(f, "invalid log ID: {}", id),
            IoLogError::SequenceExhausted => write!(f, "session sequence number space exhausted"),
            IoLogError::MissingInfo(key) => write!(f, "missing required info key: {}", key),
            IoLogError::BadInfo(e) => write!(f, "bad info message: {}", e),
            IoLogError::MalformedTiming(line) => write!(f, "invalid timing file line: {}", line),
            IoLogError::ResumeMismatch { target, elapsed } => write!(
                f,
                "unable to find resume point [{}.{:09}] in timing file (log ends at {}.{:09})",
                target.as_secs(),
                target.subsec_nanos(),
                elapsed.as_secs(),
                elapsed.subsec_nanos()
            ),
            IoLogError::LogComplete => write!(f, "log is complete, cannot be restarted"),
            IoLogError::NegativeDelay => write!(f, "negative delay in timing record"),
            IoLogError::MissingStream(stream) => write!(f, "missing I/O log file {}", stream),
            IoLogError::StreamTooShort { stream, want, have } => write!(
                f,
                "{} is shorter than the timing file claims ({} < {})",
                stream, have, want
            ),
        }
    }
}

impl std::error::Error for IoLogError {}

impl From<std::io::Error> for IoLogError {
    fn from(err: std::io::Error) -> Self {
        IoLogError::IoError(err)
    }
}

#[derive(Debug)]
pub enum EventLogError {
    IoError(std::io::Error),
    SerializeError(serde_json::Error),
}

impl fmt::Display for EventLogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventLogError::IoError(e) => write!(f, "event log IO error: {}", e),
            EventLogError::SerializeError(e) => write!(f, "event log serialization error: {}", e),
        }
    }
}

impl std::error::Error for EventLogError {}

impl From<std::io::Error> for EventLogError {
    fn from(err: std::io::Error) -> Self {
        EventLogError::IoError(err)
    }
}

impl From<serde_json::Error> for EventLogError {
    fn from(err: serde_json::Error) -> Self {
        EventLogError::SerializeError(err)
    }
}

#[derive(Debug)]
pub enum RelayError {
    CandidatesExhausted,
    ConnectFailed(String, std::io::Error),
    ConnectTimeout(String),
    TlsError(String),
    UnexpectedEof,
    Protocol(String),
    Codec(CodecError),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::CandidatesExhausted => write!(f, "unable to connect to any relay host"),
            RelayError::ConnectFailed(host, e) => {
                write!(f, "unable to connect to relay {}: {}", host, e)
            }
            RelayError::ConnectTimeout(host) => write!(f, "timed out connecting to relay {}", host),
            RelayError::TlsError(e) => write!(f, "relay TLS error: {}", e),
            RelayError::UnexpectedEof => write!(f, "unexpected EOF from relay"),
            RelayError::Protocol(e) => write!(f, "relay protocol error: {}", e),
            RelayError::Codec(e) => write!(f, "relay codec error: {}", e),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<CodecError> for RelayError {
    fn from(err: CodecError) -> Self {
        RelayError::Codec(err)
    }
}

#[derive(Debug)]
pub enum ConnectionError {
    Codec(CodecError),
    IoLog(IoLogError),
    EventLog(EventLogError),
    Relay(RelayError),
    StateMachine {
        state: &'static str,
        message: &'static str,
    },
    InvalidMessage(String),
    WriteQueueClosed,
    Timeout,
    DebugDrop,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Codec(e) => write!(f, "codec error: {}", e),
            ConnectionError::IoLog(e) => write!(f, "{}", e),
            ConnectionError::EventLog(e) => write!(f, "{}", e),
            ConnectionError::Relay(e) => write!(f, "{}", e),
            ConnectionError::StateMachine { state, message } => {
                write!(f, "state machine error: unexpected {} in state {}", message, state)
            }
            ConnectionError::InvalidMessage(e) => write!(f, "invalid message: {}", e),
            ConnectionError::WriteQueueClosed => write!(f, "connection write queue closed"),
            ConnectionError::Timeout => write!(f, "connection timed out"),
            ConnectionError::DebugDrop => write!(f, "synthetic packet drop (debug)"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<CodecError> for ConnectionError {
    fn from(err: CodecError) -> Self {
        ConnectionError::Codec(err)
    }
}

impl From<IoLogError> for ConnectionError {
    fn from(err: IoLogError) -> Self {
        ConnectionError::IoLog(err)
    }
}

impl From<EventLogError> for ConnectionError {
    fn from(err: EventLogError) -> Self {
        ConnectionError::EventLog(err)
    }
}

impl From<RelayError> for ConnectionError {
    fn from(err: RelayError) -> Self {
        ConnectionError::Relay(err)
    }
}

#[derive(Debug)]
pub enum ServerError {
    ConfigError(ConfigError),
    BindError(std::io::Error),
    TlsError(String),
    SignalError(std::io::Error),
    EventLogError(EventLogError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::ConfigError(e) => write!(f, "configuration error: {}", e),
            ServerError::BindError(e) => write!(f, "unable to bind listener: {}", e),
            ServerError::TlsError(e) => write!(f, "TLS error: {}", e),
            ServerError::SignalError(e) => write!(f, "unable to register signal handler: {}", e),
            ServerError::EventLogError(e) => write!(f, "unable to open event log: {}", e),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        ServerError::ConfigError(err)
    }
}
