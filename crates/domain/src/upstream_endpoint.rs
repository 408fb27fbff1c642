use crate::DomainError;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

/// Port assigned to DNS over QUIC (RFC 9250 §8.2).
pub const DEFAULT_DOQ_PORT: u16 = 853;

/// An upstream address that may or may not already be an IP literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UpstreamAddr {
    Resolved(SocketAddr),
    Unresolved { hostname: Arc<str>, port: u16 },
}

impl UpstreamAddr {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            UpstreamAddr::Resolved(addr) => Some(*addr),
            UpstreamAddr::Unresolved { .. } => None,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            UpstreamAddr::Resolved(addr) => addr.port(),
            UpstreamAddr::Unresolved { port, .. } => *port,
        }
    }

    pub fn hostname_str(&self) -> Option<&str> {
        match self {
            UpstreamAddr::Resolved(_) => None,
            UpstreamAddr::Unresolved { hostname, .. } => Some(hostname),
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self, UpstreamAddr::Unresolved { .. })
    }
}

impl fmt::Display for UpstreamAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamAddr::Resolved(addr) => write!(f, "{}", addr),
            UpstreamAddr::Unresolved { hostname, port } => write!(f, "{}:{}", hostname, port),
        }
    }
}

/// A DoQ upstream as written in configuration: `doq://dns.example:853`,
/// `quic://9.9.9.9`, or a bare `host[:port]`.
///
/// `hostname` is the TLS server name derived from the address. For IP
/// literals it is the textual IP.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamEndpoint {
    pub addr: UpstreamAddr,
    pub hostname: Arc<str>,
}

impl UpstreamEndpoint {
    /// The `host:port` string handed to the system resolver at dial time.
    pub fn dial_target(&self) -> String {
        self.addr.to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

fn split_host_port(s: &str) -> Result<(&str, u16), DomainError> {
    if let Some(rest) = s.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| DomainError::InvalidUpstreamAddr(format!("Unclosed '[' in '{}'", s)))?;
        let host = &rest[..end];
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => parse_port(s, p)?,
            None if rest[end + 1..].is_empty() => DEFAULT_DOQ_PORT,
            None => {
                return Err(DomainError::InvalidUpstreamAddr(format!(
                    "Unexpected characters after ']' in '{}'",
                    s
                )))
            }
        };
        return Ok((host, port));
    }

    match s.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok((host, parse_port(s, port)?)),
        // Bare IPv6 literal without brackets has no port.
        Some(_) => Ok((s, DEFAULT_DOQ_PORT)),
        None => Ok((s, DEFAULT_DOQ_PORT)),
    }
}

fn parse_port(s: &str, port: &str) -> Result<u16, DomainError> {
    port.parse::<u16>()
        .map_err(|e| DomainError::InvalidUpstreamAddr(format!("Invalid port in '{}': {}", s, e)))
}

impl FromStr for UpstreamEndpoint {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let rest = if let Some(rest) = s.strip_prefix("doq://") {
            rest
        } else if let Some(rest) = s.strip_prefix("quic://") {
            rest
        } else if let Some((scheme, _)) = s.split_once("://") {
            return Err(DomainError::InvalidUpstreamAddr(format!(
                "Unsupported scheme '{}' in '{}'. Expected 'doq://HOST:PORT' or 'quic://HOST:PORT'",
                scheme, s
            )));
        } else {
            s
        };
        let rest = rest.trim_end_matches('/');

        if rest.is_empty() {
            return Err(DomainError::InvalidUpstreamAddr(format!(
                "Missing host in '{}'",
                s
            )));
        }

        let (host, port) = split_host_port(rest)?;
        if host.is_empty() {
            return Err(DomainError::InvalidUpstreamAddr(format!(
                "Missing host in '{}'",
                s
            )));
        }

        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            return Ok(Self {
                addr: UpstreamAddr::Resolved(SocketAddr::new(ip, port)),
                hostname: ip.to_string().into(),
            });
        }

        Ok(Self {
            addr: UpstreamAddr::Unresolved {
                hostname: host.into(),
                port,
            },
            hostname: host.into(),
        })
    }
}

impl fmt::Display for UpstreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            UpstreamAddr::Resolved(addr) => write!(f, "doq://{}", addr),
            UpstreamAddr::Unresolved { hostname, port } => write!(f, "doq://{}:{}", hostname, port),
        }
    }
}
