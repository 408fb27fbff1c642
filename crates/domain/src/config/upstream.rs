use super::errors::ConfigError;
use crate::UpstreamEndpoint;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// `doq://HOST:PORT`, `quic://HOST:PORT` or `HOST[:PORT]` (port 853 when omitted).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// TLS server name. Derived from the endpoint host when absent.
    #[serde(default)]
    pub server_name: Option<String>,

    /// Skip certificate verification. Testing only.
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Local address of the UDP socket the QUIC endpoint binds.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Silence after which a failed query marks the shared connection as lost.
    #[serde(default = "default_connection_lost_threshold_ms")]
    pub connection_lost_threshold_ms: u64,

    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    #[serde(default)]
    pub keep_alive_interval_secs: Option<u64>,
}

impl UpstreamConfig {
    pub fn parsed_endpoint(&self) -> Result<UpstreamEndpoint, ConfigError> {
        self.endpoint
            .parse::<UpstreamEndpoint>()
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn connection_lost_threshold(&self) -> Duration {
        Duration::from_millis(self.connection_lost_threshold_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parsed_endpoint()?;

        if self.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid upstream bind address '{}'",
                self.bind_address
            )));
        }
        if self.dial_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "dial_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.query_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "query_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if matches!(self.server_name.as_deref(), Some(name) if name.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "server_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            server_name: None,
            insecure_skip_verify: false,
            bind_address: default_bind_address(),
            dial_timeout_ms: default_dial_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            connection_lost_threshold_ms: default_connection_lost_threshold_ms(),
            idle_timeout_secs: None,
            keep_alive_interval_secs: None,
        }
    }
}

fn default_endpoint() -> String {
    "doq://dns.adguard-dns.com:853".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0:0".to_string()
}

fn default_dial_timeout_ms() -> u64 {
    3_000
}

fn default_query_timeout_ms() -> u64 {
    5_000
}

fn default_connection_lost_threshold_ms() -> u64 {
    5_000
}
