use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::types::{
    parse_listen_address, parse_relay_host, EventLogSettings, IoLogSettings, RelaySection,
    ServerSettings,
};
use crate::error_handling::types::ConfigError;
use crate::iolog::path::{expand_escapes, PathEscapes};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub iolog: IoLogSettings,
    pub relay: RelaySection,
    pub eventlog: EventLogSettings,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&text).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_address.is_empty() {
            return Err(ConfigError::NoListeners(
                "at least one listen_address is required".into(),
            ));
        }
        let mut any_tls = false;
        for entry in &self.server.listen_address {
            any_tls |= parse_listen_address(entry)?.tls;
        }
        if any_tls && (self.server.tls_cert.is_none() || self.server.tls_key.is_none()) {
            return Err(ConfigError::TlsMaterial(
                "tls:// listeners require tls_cert and tls_key".into(),
            ));
        }
        if self.server.tls_verify && self.server.tls_cacert.is_none() {
            return Err(ConfigError::TlsMaterial(
                "tls_verify requires tls_cacert".into(),
            ));
        }
        if self.server.timeout == 0 || self.server.ack_frequency == 0 {
            return Err(ConfigError::NotInRange(
                "timeout and ack_frequency must be at least 1 second".into(),
            ));
        }
        if self.iolog.iolog_mode > 0o777 {
            return Err(ConfigError::NotInRange(format!(
                "iolog_mode {:o} is not a permission mask",
                self.iolog.iolog_mode
            )));
        }
        if !(0.0..=1.0).contains(&self.iolog.random_drop) {
            return Err(ConfigError::NotInRange(
                "random_drop must be between 0 and 1".into(),
            ));
        }
        self.validate_pattern()?;
        for host in &self.relay.relay_host {
            parse_relay_host(host)?;
        }
        if self.relay.relay_tls && self.relay.relay_tls_verify && self.server.tls_cacert.is_none()
        {
            return Err(ConfigError::TlsMaterial(
                "relay_tls_verify requires tls_cacert".into(),
            ));
        }
        Ok(())
    }

    fn validate_pattern(&self) -> Result<(), ConfigError> {
        let pattern = &self.iolog.iolog_file;
        if pattern.is_empty() || pattern.starts_with('/') {
            return Err(ConfigError::BadEscapePattern(format!(
                "{}: must be a relative path",
                pattern
            )));
        }
        let dummy = PathEscapes {
            user: "user",
            group: "group",
            runas_user: "root",
            runas_group: "wheel",
            hostname: "host",
            command: "cmd",
        };
        expand_escapes(pattern, &dummy)
            .map_err(|e| ConfigError::BadEscapePattern(e.to_string()))?;
        if let Some(pos) = pattern.find("%{seq}") {
            if pos + "%{seq}".len() != pattern.len() {
                return Err(ConfigError::BadEscapePattern(format!(
                    "{}: %{{seq}} must be the final component",
                    pattern
                )));
            }
        }
        Ok(())
    }

    pub fn sock_timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout)
    }

    pub fn ack_frequency(&self) -> Duration {
        Duration::from_secs(self.server.ack_frequency)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.relay.connect_timeout)
    }
}
