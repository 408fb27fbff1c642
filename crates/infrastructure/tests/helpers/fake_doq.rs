#![allow(dead_code)]
use super::build_mock_response;
use async_trait::async_trait;
use doqfwd_domain::DomainError;
use doqfwd_infrastructure::dns::transport::quic::{Dialer, DoqConnection};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::Instant;

pub const FAKE_TARGET: &str = "doq://fake.test:853";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerBehavior {
    /// Answer every query.
    Answer,
    /// Read the query, then reset the stream without answering.
    DropStream,
    /// Read the query and never answer.
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOpenBehavior {
    Open,
    /// Never grant stream credit.
    Hang,
    /// Refuse the stream while the connection still looks alive.
    Refuse,
}

#[derive(Debug, Clone, Copy)]
pub struct SeenQuery {
    pub conn_id: usize,
    pub wire_id: u16,
}

struct Shared {
    behavior: Mutex<ServerBehavior>,
    stream_open: Mutex<StreamOpenBehavior>,
    seen: Mutex<Vec<SeenQuery>>,
}

/// In-memory connection; every stream is a pair of duplex pipes served by
/// a spawned task.
#[derive(Clone)]
pub struct FakeConnection {
    id: usize,
    closed: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl FakeConnection {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Peer-side close.
    pub fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DoqConnection for FakeConnection {
    type SendStream = DuplexStream;
    type RecvStream = DuplexStream;

    async fn open_stream(&self) -> Result<(DuplexStream, DuplexStream), DomainError> {
        if self.closed() {
            return Err(DomainError::StreamOpen {
                server: FAKE_TARGET.to_string(),
                reason: "connection closed".to_string(),
            });
        }

        let stream_open = *self.shared.stream_open.lock().unwrap();
        match stream_open {
            StreamOpenBehavior::Open => {}
            StreamOpenBehavior::Hang => std::future::pending::<()>().await,
            StreamOpenBehavior::Refuse => {
                return Err(DomainError::StreamOpen {
                    server: FAKE_TARGET.to_string(),
                    reason: "stream limit reached".to_string(),
                });
            }
        }

        let (client_send, server_recv) = tokio::io::duplex(64 * 1024);
        let (server_send, client_recv) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_stream(
            self.id,
            Arc::clone(&self.shared),
            server_recv,
            server_send,
        ));
        Ok((client_send, client_recv))
    }

    fn is_gone(&self) -> bool {
        self.closed()
    }

    fn terminate(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn conn_id(&self) -> usize {
        self.id
    }
}

async fn serve_stream(
    conn_id: usize,
    shared: Arc<Shared>,
    mut recv: DuplexStream,
    mut send: DuplexStream,
) {
    // EOF only arrives once the client finished its send side.
    let mut framed = Vec::new();
    if recv.read_to_end(&mut framed).await.is_err() || framed.len() < 2 + 12 {
        return;
    }

    let wire_id = u16::from_be_bytes([framed[2], framed[3]]);
    shared
        .seen
        .lock()
        .unwrap()
        .push(SeenQuery { conn_id, wire_id });

    let behavior = *shared.behavior.lock().unwrap();
    match behavior {
        ServerBehavior::Answer => {
            let response = build_mock_response(&framed[2..]);
            let _ = send.write_all(&(response.len() as u16).to_be_bytes()).await;
            let _ = send.write_all(&response).await;
        }
        ServerBehavior::DropStream => {}
        ServerBehavior::Silent => {
            std::future::pending::<()>().await;
        }
    }
}

/// Dialer counting every attempt; dials take `delay` and can be made to fail.
pub struct FakeDialer {
    delay: Duration,
    dials: AtomicUsize,
    fail_dials: AtomicBool,
    shut_down: AtomicBool,
    shared: Arc<Shared>,
    connections: Mutex<Vec<FakeConnection>>,
}

impl FakeDialer {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            dials: AtomicUsize::new(0),
            fail_dials: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            shared: Arc::new(Shared {
                behavior: Mutex::new(ServerBehavior::Answer),
                stream_open: Mutex::new(StreamOpenBehavior::Open),
                seen: Mutex::new(Vec::new()),
            }),
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn set_behavior(&self, behavior: ServerBehavior) {
        *self.shared.behavior.lock().unwrap() = behavior;
    }

    pub fn set_stream_open(&self, behavior: StreamOpenBehavior) {
        *self.shared.stream_open.lock().unwrap() = behavior;
    }

    pub fn set_fail_dials(&self, fail: bool) {
        self.fail_dials.store(fail, Ordering::SeqCst);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<SeenQuery> {
        self.shared.seen.lock().unwrap().clone()
    }

    pub fn connections(&self) -> Vec<FakeConnection> {
        self.connections.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    type Connection = FakeConnection;

    async fn dial(&self, _deadline: Instant) -> Result<FakeConnection, DomainError> {
        let attempt = self.dials.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;

        if self.fail_dials.load(Ordering::SeqCst) {
            return Err(DomainError::TransportConnectionRefused {
                server: FAKE_TARGET.to_string(),
            });
        }

        let conn = FakeConnection {
            id: attempt,
            closed: Arc::new(AtomicBool::new(false)),
            shared: Arc::clone(&self.shared),
        };
        self.connections.lock().unwrap().push(conn.clone());
        Ok(conn)
    }

    fn target(&self) -> &str {
        FAKE_TARGET
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}
