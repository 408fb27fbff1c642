use async_trait::async_trait;
use doqfwd_domain::DomainError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

/// An established QUIC connection that DNS exchanges can open streams on.
///
/// Handles are cheap clones of one underlying connection.
#[async_trait]
pub trait DoqConnection: Clone + Send + Sync + 'static {
    type SendStream: AsyncWrite + Send + Unpin + 'static;
    type RecvStream: AsyncRead + Send + Unpin + 'static;

    /// Opens a bidirectional stream for one query.
    async fn open_stream(&self) -> Result<(Self::SendStream, Self::RecvStream), DomainError>;

    /// True once the connection ended: peer close, idle timeout, transport
    /// error or local close.
    fn is_gone(&self) -> bool;

    /// Closes with application error code 0.
    fn terminate(&self);

    /// Identity of the underlying connection, stable across clones.
    fn conn_id(&self) -> usize;
}

/// Establishes connections to one upstream.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Connection: DoqConnection;

    /// Resolves the target and completes a handshake before `deadline`.
    async fn dial(&self, deadline: Instant) -> Result<Self::Connection, DomainError>;

    /// Upstream label used in logs and errors.
    fn target(&self) -> &str;

    /// Releases the local socket. Called once, when the upstream closes.
    fn shutdown(&self) {}
}
