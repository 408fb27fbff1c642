use doqfwd_domain::DomainError;
use doqfwd_infrastructure::dns::encode_message;
use doqfwd_infrastructure::dns::forwarding::MessageBuilder;
use doqfwd_infrastructure::dns::transport::DnsUpstream;
use hickory_proto::op::Message;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Plain-DNS UDP listener; every datagram is forwarded through `upstream`.
///
/// Returns once `shutdown` is cancelled. In-flight queries are cancelled
/// with it.
pub async fn start_dns_server(
    bind_addr: String,
    upstream: Arc<dyn DnsUpstream>,
    query_timeout: Duration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let socket_addr: SocketAddr = bind_addr.parse()?;
    let socket = Arc::new(create_udp_socket(socket_addr)?);

    info!(
        bind_address = %socket_addr,
        protocol = upstream.protocol_name(),
        "DNS server listening"
    );

    let mut recv_buf = [0u8; 4096];
    loop {
        let (n, from) = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut recv_buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "UDP receive failed");
                    continue;
                }
            },
        };

        let query = match Message::from_vec(&recv_buf[..n]) {
            Ok(q) => q,
            Err(e) => {
                debug!(client = %from, error = %e, "Dropping malformed query");
                continue;
            }
        };

        let socket = Arc::clone(&socket);
        let upstream = Arc::clone(&upstream);
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            let response = forward_query(upstream.as_ref(), &query, query_timeout, cancel).await;
            match udp_response_bytes(&query, &response) {
                Ok(wire) => {
                    if let Err(e) = socket.send_to(&wire, from).await {
                        debug!(client = %from, error = %e, "Failed to send response");
                    }
                }
                Err(e) => warn!(client = %from, error = %e, "Failed to encode response"),
            }
        });
    }

    info!("DNS server stopped");
    Ok(())
}

/// Exchanges `query` upstream; any failure becomes SERVFAIL.
pub(crate) async fn forward_query(
    upstream: &dyn DnsUpstream,
    query: &Message,
    timeout: Duration,
    cancel: CancellationToken,
) -> Message {
    let deadline = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        })
    };

    let result = upstream.exchange_context(&cancel, query).await;
    deadline.abort();

    match result {
        Ok(response) => response,
        Err(e) => {
            if e.is_transport_error() {
                warn!(id = query.id(), error = %e, "Upstream exchange failed");
            } else {
                debug!(id = query.id(), error = %e, "Upstream exchange failed");
            }
            MessageBuilder::servfail_for(query)
        }
    }
}

/// Encodes `response` for a UDP client, truncating it with TC set when it
/// exceeds the payload size the query advertised (512 without EDNS).
pub(crate) fn udp_response_bytes(
    query: &Message,
    response: &Message,
) -> Result<Vec<u8>, DomainError> {
    let limit = usize::from(query.max_payload());
    let wire = encode_message(response)?;
    if wire.len() <= limit {
        return Ok(wire);
    }

    debug!(
        id = response.id(),
        size = wire.len(),
        limit,
        "Response exceeds client payload size, truncating"
    );
    encode_message(&response.truncate())
}

fn create_udp_socket(socket_addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let domain = if socket_addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if socket_addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_recv_buffer_size(512 * 1024)?;
    socket.set_send_buffer_size(512 * 1024)?;
    socket.bind(&socket_addr.into())?;
    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}
