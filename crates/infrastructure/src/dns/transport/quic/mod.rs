//! DNS-over-QUIC upstream (RFC 9250)
//!
//! One QUIC connection per upstream, dialed on first use and shared by every
//! query; each query gets its own bidirectional stream. The connection is
//! only replaced after it failed, ended, or went silent for longer than the
//! lost threshold while a query was failing.

pub mod connection;
pub mod dialer;
pub mod exchange;
pub mod lazy_conn;

pub use connection::{Dialer, DoqConnection};
pub use dialer::QuinnDialer;
pub use lazy_conn::LazyConn;

use super::tls::DoqTlsConfig;
use super::DnsUpstream;
use crate::dns::buffer_pool::{BufferPool, BufferPoolStats};
use crate::dns::wire::{pack_framed, set_message_id, zero_framed_id};
use async_trait::async_trait;
use doqfwd_domain::config::UpstreamConfig;
use doqfwd_domain::{DomainError, UpstreamEndpoint};
use exchange::exchange_on_stream;
use hickory_proto::op::Message;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECTION_LOST_THRESHOLD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct DoqTimeouts {
    /// Address resolution plus handshake.
    pub dial: Duration,

    /// Write and read of one exchange.
    pub query: Duration,

    /// Silence after which a failing query closes the connection.
    pub connection_lost: Duration,
}

impl Default for DoqTimeouts {
    fn default() -> Self {
        Self {
            dial: DEFAULT_DIAL_TIMEOUT,
            query: DEFAULT_QUERY_TIMEOUT,
            connection_lost: DEFAULT_CONNECTION_LOST_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DoqTransportConfig {
    pub timeouts: DoqTimeouts,

    /// QUIC max idle timeout. quinn's default when unset.
    pub idle_timeout: Option<Duration>,

    pub keep_alive_interval: Option<Duration>,
}

impl DoqTransportConfig {
    pub fn from_upstream_config(config: &UpstreamConfig) -> Self {
        Self {
            timeouts: DoqTimeouts {
                dial: config.dial_timeout(),
                query: config.query_timeout(),
                connection_lost: config.connection_lost_threshold(),
            },
            idle_timeout: config.idle_timeout_secs.map(Duration::from_secs),
            keep_alive_interval: config.keep_alive_interval_secs.map(Duration::from_secs),
        }
    }
}

struct ConnSlot<C: DoqConnection> {
    current: Option<Arc<LazyConn<C>>>,
    closed: bool,
}

/// A DoQ upstream multiplexing queries over one lazily dialed connection.
pub struct DoqUpstream<D: Dialer = QuinnDialer> {
    dialer: Arc<D>,
    slot: Mutex<ConnSlot<D::Connection>>,
    pool: Arc<BufferPool>,
    timeouts: DoqTimeouts,
}

impl DoqUpstream<QuinnDialer> {
    /// Fails when `tls` is missing, names no server without insecure mode,
    /// or when the QUIC endpoint cannot be created on `local_socket`.
    pub fn new(
        upstream: UpstreamEndpoint,
        local_socket: std::net::UdpSocket,
        tls: Option<DoqTlsConfig>,
        transport: DoqTransportConfig,
    ) -> Result<Self, DomainError> {
        let tls = tls.ok_or_else(|| {
            DomainError::ConfigError("DoQ upstream requires a TLS config".to_string())
        })?;
        let dialer = QuinnDialer::new(upstream, local_socket, &tls, &transport)?;

        info!(
            server = dialer.target(),
            local_addr = ?dialer.local_addr(),
            "DoQ upstream created"
        );

        Ok(Self::with_dialer(Arc::new(dialer), transport.timeouts))
    }

    /// Builds the upstream described by the `[upstream]` config section.
    /// The TLS server name defaults to the endpoint host.
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, DomainError> {
        let upstream = config
            .parsed_endpoint()
            .map_err(|e| DomainError::ConfigError(e.to_string()))?;

        let bind_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
            DomainError::ConfigError(format!(
                "Invalid bind address '{}': {}",
                config.bind_address, e
            ))
        })?;
        let socket = bind_udp_socket(bind_addr)?;

        let tls = DoqTlsConfig {
            server_name: Some(
                config
                    .server_name
                    .clone()
                    .unwrap_or_else(|| upstream.hostname.to_string()),
            ),
            insecure_skip_verify: config.insecure_skip_verify,
            extra_roots: Vec::new(),
        };

        Self::new(
            upstream,
            socket,
            Some(tls),
            DoqTransportConfig::from_upstream_config(config),
        )
    }
}

impl<D: Dialer> DoqUpstream<D> {
    pub fn with_dialer(dialer: Arc<D>, timeouts: DoqTimeouts) -> Self {
        Self {
            dialer,
            slot: Mutex::new(ConnSlot {
                current: None,
                closed: false,
            }),
            pool: Arc::new(BufferPool::default()),
            timeouts,
        }
    }

    pub fn target(&self) -> &str {
        self.dialer.target()
    }

    pub fn buffer_stats(&self) -> BufferPoolStats {
        self.pool.stats()
    }

    fn lock_slot(&self) -> MutexGuard<'_, ConnSlot<D::Connection>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Picks the shared connection attempt, starting a new one when there is
    /// none or the current one is unusable. Never waits under the lock.
    fn current_lazy_conn(&self) -> Result<Arc<LazyConn<D::Connection>>, DomainError> {
        let mut slot = self.lock_slot();
        if slot.closed {
            return Err(DomainError::UpstreamClosed);
        }

        if let Some(current) = &slot.current {
            if !current.needs_replacement() {
                return Ok(Arc::clone(current));
            }
            debug!(
                server = self.dialer.target(),
                conn_id = ?current.conn_id(),
                "Replacing DoQ connection"
            );
            current.close();
        }

        let fresh = LazyConn::start(
            Arc::clone(&self.dialer),
            self.timeouts.dial,
            self.timeouts.connection_lost,
        );
        slot.current = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    async fn acquire_stream(
        &self,
        cancel: &CancellationToken,
    ) -> Result<
        (
            <D::Connection as DoqConnection>::SendStream,
            <D::Connection as DoqConnection>::RecvStream,
            Arc<LazyConn<D::Connection>>,
        ),
        DomainError,
    > {
        let lazy = self.current_lazy_conn()?;
        let conn = lazy.wait(cancel).await?;

        // Opening waits for stream credit from the peer.
        let opened = tokio::select! {
            _ = cancel.cancelled() => return Err(DomainError::Cancelled),
            opened = tokio::time::timeout(self.timeouts.query, lazy.open_stream(&conn)) => {
                opened.unwrap_or_else(|_| Err(DomainError::TransportTimeout {
                    server: self.dialer.target().to_string(),
                }))
            }
        };

        match opened {
            Ok((send, recv)) => Ok((send, recv, lazy)),
            Err(e) => {
                debug!(
                    server = self.dialer.target(),
                    conn_id = conn.conn_id(),
                    error = %e,
                    "Failed to open DoQ stream"
                );
                lazy.query_failed(Instant::now());
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<D: Dialer> DnsUpstream for DoqUpstream<D> {
    async fn exchange_context(
        &self,
        cancel: &CancellationToken,
        query: &Message,
    ) -> Result<Message, DomainError> {
        let original_id = query.id();

        let mut framed = pack_framed(query, &self.pool)?;
        zero_framed_id(&mut framed);

        let (send, recv, lazy) = self.acquire_stream(cancel).await?;

        let query_timeout = self.timeouts.query;
        let server = self.dialer.target().to_string();
        let exchange = tokio::spawn(async move {
            let result = exchange_on_stream(send, recv, &framed, query_timeout, &server).await;
            drop(framed);

            match &result {
                Ok(_) => lazy.mark_received(Instant::now()),
                Err(e) => {
                    debug!(server = %server, error = %e, "DoQ exchange failed");
                    lazy.query_failed(Instant::now());
                }
            }
            result
        });

        let mut response = tokio::select! {
            _ = cancel.cancelled() => return Err(DomainError::Cancelled),
            joined = exchange => joined.map_err(|e| {
                DomainError::IoError(format!("DoQ exchange task failed: {}", e))
            })??,
        };

        set_message_id(&mut response, original_id);
        Ok(response)
    }

    fn close(&self) {
        let current = {
            let mut slot = self.lock_slot();
            if slot.closed {
                return;
            }
            slot.closed = true;
            slot.current.take()
        };

        if let Some(lazy) = current {
            lazy.close();
        }
        self.dialer.shutdown();

        let stats = self.pool.stats();
        info!(
            server = self.dialer.target(),
            buffers_created = stats.total_created,
            buffers_reused = stats.total_reused,
            "DoQ upstream closed"
        );
    }

    fn protocol_name(&self) -> &'static str {
        "QUIC"
    }
}

fn bind_udp_socket(bind_addr: SocketAddr) -> Result<std::net::UdpSocket, DomainError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if bind_addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let bind = || -> std::io::Result<std::net::UdpSocket> {
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if bind_addr.is_ipv6() {
            socket.set_only_v6(false)?;
        }
        socket.set_recv_buffer_size(256 * 1024)?;
        socket.set_send_buffer_size(256 * 1024)?;
        socket.bind(&bind_addr.into())?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    };

    bind().map_err(|e| {
        DomainError::ConfigError(format!(
            "Failed to bind QUIC socket on {}: {}",
            bind_addr, e
        ))
    })
}
