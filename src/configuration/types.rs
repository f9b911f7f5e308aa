use std::path::PathBuf;

use serde::Deserialize;

use crate::error_handling::types::ConfigError;
use crate::iolog::path::SESSID_SPACE;
use crate::relay::forwarder::RelayTarget;

/// Port registered for the audit log protocol.
pub const DEFAULT_PORT: u16 = 30344;

fn default_server_id() -> String {
    format!("iologd {}", env!("CARGO_PKG_VERSION"))
}

/// `[server]` section.
///
/// # Fields Overview
/// - `listen_address`: addresses to accept connections on; a `tls://`
///   prefix makes the listener TLS
/// - `timeout`: socket read/write timeout in seconds
/// - `ack_frequency`: commit point cadence in seconds
/// - `shutdown_grace`: how long to wait for draining connections at
///   shutdown, in seconds
/// - `tls_cert`/`tls_key`/`tls_cacert`/`tls_verify`: listener TLS material
/// - `server_id`: free-form id sent in the server hello
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub listen_address: Vec<String>,
    pub timeout: u64,
    pub ack_frequency: u64,
    pub shutdown_grace: u64,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub tls_cacert: Option<PathBuf>,
    pub tls_verify: bool,
    pub server_id: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            listen_address: vec![format!("0.0.0.0:{}", DEFAULT_PORT)],
            timeout: 30,
            ack_frequency: 10,
            shutdown_grace: 10,
            tls_cert: None,
            tls_key: None,
            tls_cacert: None,
            tls_verify: false,
            server_id: default_server_id(),
        }
    }
}

/// `[iolog]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IoLogSettings {
    /// Storage root for session logs.
    pub iolog_dir: PathBuf,
    /// Session path pattern relative to `iolog_dir`. `%{seq}` must be the
    /// final component when used.
    pub iolog_file: String,
    pub compress: bool,
    /// Mode bits for created files, e.g. `0o600`.
    pub iolog_mode: u32,
    /// Highest sequence number before ids recycle.
    pub maxseq: u64,
    /// Debug-only test hook: probability of dropping the connection after
    /// a stored I/O buffer. Leave at 0 outside of tests.
    pub random_drop: f64,
}

impl Default for IoLogSettings {
    fn default() -> Self {
        IoLogSettings {
            iolog_dir: PathBuf::from("/var/log/iologd"),
            iolog_file: "%{seq}".to_string(),
            compress: false,
            iolog_mode: 0o600,
            maxseq: SESSID_SPACE,
            random_drop: 0.0,
        }
    }
}

/// `[relay]` section. A non-empty `relay_host` list switches the server
/// into relay mode: sessions are forwarded instead of stored locally.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    /// Ordered candidate list, `host` or `host:port`.
    pub relay_host: Vec<String>,
    /// Wrap the upstream hop in TLS (material from `[server]`).
    pub relay_tls: bool,
    /// Verify the upstream certificate against `tls_cacert`.
    pub relay_tls_verify: bool,
    /// Per-candidate connect timeout in seconds.
    pub connect_timeout: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        RelaySection {
            relay_host: Vec::new(),
            relay_tls: false,
            relay_tls_verify: false,
            connect_timeout: 30,
        }
    }
}

/// `[eventlog]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventLogSettings {
    /// Append accept/reject/alert events as JSON lines to this file.
    pub json_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddress {
    pub addr: String,
    pub tls: bool,
}

pub fn parse_listen_address(entry: &str) -> Result<ListenAddress, ConfigError> {
    let (addr, tls) = match entry.strip_prefix("tls://") {
        Some(rest) => (rest, true),
        None => (entry, false),
    };
    if addr.is_empty() || !addr.contains(':') {
        return Err(ConfigError::BadAddress(format!(
            "{}: expected host:port",
            entry
        )));
    }
    Ok(ListenAddress {
        addr: addr.to_string(),
        tls,
    })
}

/// Parse a relay candidate, `host` or `host:port`.
pub fn parse_relay_host(entry: &str) -> Result<RelayTarget, ConfigError> {
    if entry.is_empty() {
        return Err(ConfigError::BadAddress("empty relay host".into()));
    }
    if let Some((host, port)) = entry.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            if host.is_empty() {
                return Err(ConfigError::BadAddress(format!("{}: missing host", entry)));
            }
            return Ok(RelayTarget {
                host: host.to_string(),
                port,
            });
        }
    }
    Ok(RelayTarget {
        host: entry.to_string(),
        port: DEFAULT_PORT,
    })
}
