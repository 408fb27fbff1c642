use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid domain name: {0}")]
    InvalidDomainName(String),

    #[error("Invalid upstream address: {0}")]
    InvalidUpstreamAddr(String),

    #[error("Invalid DNS response: {0}")]
    InvalidDnsResponse(String),

    #[error("Invalid DNS message: {0}")]
    InvalidDnsMessage(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to resolve upstream address {server}: {reason}")]
    AddressResolution { server: String, reason: String },

    #[error("Transport timeout connecting to {server}")]
    TransportTimeout { server: String },

    #[error("Transport connection refused by {server}")]
    TransportConnectionRefused { server: String },

    #[error("Transport connection reset by {server}")]
    TransportConnectionReset { server: String },

    #[error("Failed to open stream to {server}: {reason}")]
    StreamOpen { server: String, reason: String },

    #[error("Query cancelled")]
    Cancelled,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Upstream closed")]
    UpstreamClosed,
}

impl DomainError {
    /// Errors produced by the network path rather than by bad input.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::AddressResolution { .. }
                | Self::TransportTimeout { .. }
                | Self::TransportConnectionRefused { .. }
                | Self::TransportConnectionReset { .. }
                | Self::StreamOpen { .. }
                | Self::IoError(_)
                | Self::ConnectionClosed
        )
    }
}
