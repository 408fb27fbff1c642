use super::connection::{Dialer, DoqConnection};
use super::DoqTransportConfig;
use crate::dns::transport::tls::DoqTlsConfig;
use async_trait::async_trait;
use doqfwd_domain::{DomainError, UpstreamEndpoint};
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ConnectionError, EndpointConfig, IdleTimeout, TransportConfig, VarInt};
use ring::rand::SecureRandom;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const STATELESS_RESET_KEY_LEN: usize = 32;

/// How long a closed endpoint may spend draining before the socket is dropped.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[async_trait]
impl DoqConnection for quinn::Connection {
    type SendStream = quinn::SendStream;
    type RecvStream = quinn::RecvStream;

    async fn open_stream(&self) -> Result<(quinn::SendStream, quinn::RecvStream), DomainError> {
        self.open_bi()
            .await
            .map_err(|e| DomainError::StreamOpen {
                server: self.remote_address().to_string(),
                reason: e.to_string(),
            })
    }

    fn is_gone(&self) -> bool {
        self.close_reason().is_some()
    }

    fn terminate(&self) {
        self.close(VarInt::from_u32(0), b"");
    }

    fn conn_id(&self) -> usize {
        self.stable_id()
    }
}

/// Dials one DoQ upstream from a dedicated QUIC endpoint.
pub struct QuinnDialer {
    /// `None` after shutdown; dropping the last handle releases the socket.
    endpoint: Mutex<Option<quinn::Endpoint>>,
    client_config: quinn::ClientConfig,
    upstream: UpstreamEndpoint,
    server_name: String,
    label: String,
}

impl QuinnDialer {
    pub fn new(
        upstream: UpstreamEndpoint,
        local_socket: std::net::UdpSocket,
        tls: &DoqTlsConfig,
        transport: &DoqTransportConfig,
    ) -> Result<Self, DomainError> {
        let tls_config = tls.build_client_config()?;
        let quic_crypto = QuicClientConfig::try_from(Arc::new(tls_config)).map_err(|e| {
            DomainError::ConfigError(format!("Invalid QUIC TLS config: {}", e))
        })?;

        let mut client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));
        client_config.transport_config(Arc::new(build_transport_config(transport)?));

        let endpoint_config = EndpointConfig::new(Arc::new(stateless_reset_key()?));

        local_socket.set_nonblocking(true).map_err(|e| {
            DomainError::ConfigError(format!("Failed to configure QUIC socket: {}", e))
        })?;
        let endpoint = quinn::Endpoint::new(
            endpoint_config,
            None,
            local_socket,
            Arc::new(quinn::TokioRuntime),
        )
        .map_err(|e| DomainError::ConfigError(format!("Failed to create QUIC endpoint: {}", e)))?;

        let server_name = tls
            .server_name
            .clone()
            .unwrap_or_else(|| upstream.hostname.to_string());
        let label = upstream.to_string();

        Ok(Self {
            endpoint: Mutex::new(Some(endpoint)),
            client_config,
            upstream,
            server_name,
            label,
        })
    }

    fn endpoint(&self) -> Option<quinn::Endpoint> {
        self.endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint()?.local_addr().ok()
    }

    /// Resolves the upstream through the system resolver, preferring the
    /// address family of the local socket.
    async fn resolve(&self) -> Result<SocketAddr, DomainError> {
        if let Some(addr) = self.upstream.addr.socket_addr() {
            return Ok(addr);
        }

        let target = self.upstream.dial_target();
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| DomainError::AddressResolution {
                server: target.clone(),
                reason: e.to_string(),
            })?
            .collect();

        let want_v4 = self.local_addr().map(|a| a.is_ipv4()).unwrap_or(true);
        addrs
            .iter()
            .find(|a| a.is_ipv4() == want_v4)
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| DomainError::AddressResolution {
                server: target,
                reason: "no addresses returned".to_string(),
            })
    }

    fn map_connection_error(&self, addr: SocketAddr, error: ConnectionError) -> DomainError {
        let server = format!("{}({})", self.server_name, addr);
        match error {
            ConnectionError::TimedOut => DomainError::TransportTimeout { server },
            ConnectionError::Reset => DomainError::TransportConnectionReset { server },
            other => DomainError::TransportConnectionRefused {
                server: format!("{}: {}", server, other),
            },
        }
    }
}

#[async_trait]
impl Dialer for QuinnDialer {
    type Connection = quinn::Connection;

    async fn dial(&self, deadline: Instant) -> Result<quinn::Connection, DomainError> {
        let endpoint = self.endpoint().ok_or(DomainError::UpstreamClosed)?;
        let addr = self.resolve().await?;
        debug!(server = %self.label, addr = %addr, "Starting QUIC handshake");

        let connecting = endpoint
            .connect_with(self.client_config.clone(), addr, &self.server_name)
            .map_err(|e| DomainError::TransportConnectionRefused {
                server: format!("{}({}): {}", self.server_name, addr, e),
            })?;

        match connecting.into_0rtt() {
            Ok((conn, accepted)) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        conn.close(VarInt::from_u32(0), b"");
                        Err(DomainError::TransportTimeout {
                            server: addr.to_string(),
                        })
                    }
                    zero_rtt = accepted => {
                        if let Some(reason) = conn.close_reason() {
                            return Err(self.map_connection_error(addr, reason));
                        }
                        debug!(server = %self.label, zero_rtt, "QUIC handshake complete");
                        Ok(conn)
                    }
                }
            }
            Err(connecting) => tokio::time::timeout_at(deadline, connecting)
                .await
                .map_err(|_| DomainError::TransportTimeout {
                    server: addr.to_string(),
                })?
                .map_err(|e| self.map_connection_error(addr, e)),
        }
    }

    fn target(&self) -> &str {
        &self.label
    }

    fn shutdown(&self) {
        let Some(endpoint) = self
            .endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        endpoint.close(VarInt::from_u32(0), b"");
        debug!(server = %self.label, "QUIC endpoint closed");

        // Outside a runtime the endpoint is dropped right here.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, endpoint.wait_idle()).await;
                drop(endpoint);
            });
        }
    }
}

fn build_transport_config(config: &DoqTransportConfig) -> Result<TransportConfig, DomainError> {
    let mut transport = TransportConfig::default();
    if let Some(idle) = config.idle_timeout {
        let idle = IdleTimeout::try_from(idle)
            .map_err(|e| DomainError::ConfigError(format!("Invalid idle timeout: {}", e)))?;
        transport.max_idle_timeout(Some(idle));
    }
    transport.keep_alive_interval(config.keep_alive_interval);
    Ok(transport)
}

fn stateless_reset_key() -> Result<ring::hmac::Key, DomainError> {
    let mut key = [0u8; STATELESS_RESET_KEY_LEN];
    ring::rand::SystemRandom::new()
        .fill(&mut key)
        .map_err(|_| {
            DomainError::ConfigError("Failed to generate stateless reset key".to_string())
        })?;
    Ok(ring::hmac::Key::new(ring::hmac::HMAC_SHA256, &key))
}
