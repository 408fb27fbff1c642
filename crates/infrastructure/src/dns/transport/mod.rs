pub mod quic;
pub mod tls;

use async_trait::async_trait;
use doqfwd_domain::DomainError;
use hickory_proto::op::Message;
use tokio_util::sync::CancellationToken;

pub use quic::{DoqTimeouts, DoqTransportConfig, DoqUpstream};
pub use tls::DoqTlsConfig;

/// A resolver the forwarder can hand queries to.
#[async_trait]
pub trait DnsUpstream: Send + Sync {
    /// Sends `query` and returns the answer carrying the query's ID.
    ///
    /// Returns [`DomainError::Cancelled`] as soon as `cancel` fires. Work
    /// shared with other callers keeps running.
    async fn exchange_context(
        &self,
        cancel: &CancellationToken,
        query: &Message,
    ) -> Result<Message, DomainError>;

    async fn exchange(&self, query: &Message) -> Result<Message, DomainError> {
        let cancel = CancellationToken::new();
        self.exchange_context(&cancel, query).await
    }

    /// Releases sockets and connections. Later exchanges fail.
    fn close(&self);

    fn protocol_name(&self) -> &'static str;
}
