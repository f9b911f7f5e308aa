//! Server configuration: a TOML file selected on the command line.

pub mod config;
pub mod types;

pub use config::Config;
pub use types::{
    parse_listen_address, parse_relay_host, EventLogSettings, IoLogSettings, ListenAddress,
    RelaySection, ServerSettings, DEFAULT_PORT,
};
