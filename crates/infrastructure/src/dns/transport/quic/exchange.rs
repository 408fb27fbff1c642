use crate::dns::wire::read_framed_message;
use doqfwd_domain::DomainError;
use hickory_proto::op::Message;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Runs one DoQ exchange on a fresh stream.
///
/// A single timeout covers the write, the FIN and the read. The client must
/// finish its send side after the query (RFC 9250 §4.2), which `shutdown`
/// does for QUIC send streams. Both stream halves are dropped on return.
pub async fn exchange_on_stream<S, R>(
    mut send: S,
    mut recv: R,
    framed_query: &[u8],
    timeout: Duration,
    server: &str,
) -> Result<Message, DomainError>
where
    S: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let exchange = async {
        send.write_all(framed_query).await.map_err(|e| {
            DomainError::IoError(format!("Failed to write DoQ query to {}: {}", server, e))
        })?;
        send.shutdown().await.map_err(|e| {
            DomainError::IoError(format!(
                "Failed to finish DoQ send stream to {}: {}",
                server, e
            ))
        })?;

        let (response, _) = read_framed_message(&mut recv).await?;
        Ok(response)
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| DomainError::TransportTimeout {
            server: server.to_string(),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::forwarding::MessageBuilder;
    use crate::dns::{pack_framed, BufferPool};
    use hickory_proto::rr::RecordType;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_query_is_written_then_finished() {
        let pool = Arc::new(BufferPool::default());
        let query = MessageBuilder::build_query("example.com", RecordType::A).unwrap();
        let framed = pack_framed(&query, &pool).unwrap();

        let (client_send, mut server_recv) = tokio::io::duplex(4096);
        let (mut server_send, client_recv) = tokio::io::duplex(4096);

        let expected = framed.to_vec();
        let server = tokio::spawn(async move {
            let mut received = Vec::new();
            // Completes only once the client finished its send side.
            server_recv.read_to_end(&mut received).await.unwrap();
            assert_eq!(received, expected);
            server_send.write_all(&received).await.unwrap();
        });

        let response = exchange_on_stream(
            client_send,
            client_recv,
            &framed,
            Duration::from_secs(5),
            "test",
        )
        .await
        .unwrap();

        server.await.unwrap();
        assert_eq!(response.id(), query.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out() {
        let (client_send, _server_recv) = tokio::io::duplex(4096);
        let (_server_send, client_recv) = tokio::io::duplex(4096);

        let result = exchange_on_stream(
            client_send,
            client_recv,
            &[0x00, 0x01, 0x00],
            Duration::from_secs(5),
            "silent",
        )
        .await;

        assert_eq!(
            result.err(),
            Some(DomainError::TransportTimeout {
                server: "silent".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_peer_reset_is_io_error() {
        let (client_send, _server_recv) = tokio::io::duplex(4096);
        let (server_send, client_recv) = tokio::io::duplex(4096);
        drop(server_send);

        let result = exchange_on_stream(
            client_send,
            client_recv,
            &[0x00, 0x01, 0x00],
            Duration::from_secs(5),
            "closed",
        )
        .await;

        assert!(matches!(result, Err(DomainError::IoError(_))));
    }
}
