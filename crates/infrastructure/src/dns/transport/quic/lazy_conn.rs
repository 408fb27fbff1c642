use super::connection::{Dialer, DoqConnection};
use doqfwd_domain::DomainError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct DialState<C> {
    closed: bool,
    outcome: Option<Result<C, DomainError>>,
}

/// One connection attempt to an upstream and its outcome.
///
/// The dial runs in its own task. Any number of callers wait on the
/// completion signal; the signal flips once, after the outcome is stored.
/// A closed instance never hands out a connection again, and is replaced
/// rather than reopened.
pub struct LazyConn<C: DoqConnection> {
    state: Mutex<DialState<C>>,

    done: watch::Sender<bool>,

    dial_cancel: CancellationToken,

    born: Instant,

    /// Last successful receive, in milliseconds since `born`.
    latest_recv_ms: AtomicU64,

    lost_threshold: Duration,
}

impl<C: DoqConnection> LazyConn<C> {
    fn new(lost_threshold: Duration) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            state: Mutex::new(DialState {
                closed: false,
                outcome: None,
            }),
            done,
            dial_cancel: CancellationToken::new(),
            born: Instant::now(),
            latest_recv_ms: AtomicU64::new(0),
            lost_threshold,
        }
    }

    /// Creates an instance and spawns its dial.
    pub fn start<D>(dialer: Arc<D>, dial_timeout: Duration, lost_threshold: Duration) -> Arc<Self>
    where
        D: Dialer<Connection = C>,
    {
        let lazy = Arc::new(Self::new(lost_threshold));
        let task_lazy = Arc::clone(&lazy);

        tokio::spawn(async move {
            let deadline = Instant::now() + dial_timeout;
            debug!(server = dialer.target(), "Dialing DoQ upstream");

            let outcome = tokio::select! {
                _ = task_lazy.dial_cancel.cancelled() => Err(DomainError::ConnectionClosed),
                result = tokio::time::timeout_at(deadline, dialer.dial(deadline)) => {
                    result.unwrap_or_else(|_| Err(DomainError::TransportTimeout {
                        server: dialer.target().to_string(),
                    }))
                }
            };

            match &outcome {
                Ok(conn) => debug!(
                    server = dialer.target(),
                    conn_id = conn.conn_id(),
                    "DoQ connection established"
                ),
                Err(DomainError::ConnectionClosed) => {
                    debug!(server = dialer.target(), "DoQ dial aborted by close")
                }
                Err(e) => warn!(server = dialer.target(), error = %e, "DoQ dial failed"),
            }

            task_lazy.publish(outcome);
        });

        lazy
    }

    fn lock_state(&self) -> MutexGuard<'_, DialState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, outcome: Result<C, DomainError>) {
        let mut state = self.lock_state();
        if state.closed {
            if let Ok(conn) = outcome {
                debug!(conn_id = conn.conn_id(), "Closing connection dialed after close");
                conn.terminate();
            }
            return;
        }

        if outcome.is_ok() {
            self.mark_received(Instant::now());
        }
        state.outcome = Some(outcome);
        self.done.send_replace(true);
    }

    /// Waits for the dial outcome or for `cancel`, whichever comes first.
    /// Cancelling one waiter leaves the dial running.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<C, DomainError> {
        let mut done = self.done.subscribe();
        let resolved = tokio::select! {
            _ = cancel.cancelled() => Err(DomainError::Cancelled),
            signal = done.wait_for(|resolved| *resolved) => {
                signal.map(|_| ()).map_err(|_| DomainError::ConnectionClosed)
            }
        };
        resolved?;
        self.outcome()
    }

    fn outcome(&self) -> Result<C, DomainError> {
        match &self.lock_state().outcome {
            Some(Ok(conn)) => Ok(conn.clone()),
            Some(Err(e)) => Err(e.clone()),
            None => Err(DomainError::ConnectionClosed),
        }
    }

    pub fn is_resolved(&self) -> bool {
        *self.done.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Resolved with an error, closed, or its connection has ended.
    /// An instance still dialing is always reused.
    pub fn needs_replacement(&self) -> bool {
        let state = self.lock_state();
        match &state.outcome {
            None => false,
            Some(Err(_)) => true,
            Some(Ok(conn)) => state.closed || conn.is_gone(),
        }
    }

    pub fn conn_id(&self) -> Option<usize> {
        match &self.lock_state().outcome {
            Some(Ok(conn)) => Some(conn.conn_id()),
            _ => None,
        }
    }

    pub async fn open_stream(
        &self,
        conn: &C,
    ) -> Result<(C::SendStream, C::RecvStream), DomainError> {
        if self.is_closed() {
            return Err(DomainError::ConnectionClosed);
        }
        conn.open_stream().await
    }

    /// Closes the connection, or aborts the dial and wakes every waiter with
    /// [`DomainError::ConnectionClosed`]. Idempotent.
    pub fn close(&self) {
        let mut state = self.lock_state();
        if state.closed {
            return;
        }
        state.closed = true;

        match &state.outcome {
            Some(Ok(conn)) => conn.terminate(),
            Some(Err(_)) => {}
            None => {
                self.dial_cancel.cancel();
                state.outcome = Some(Err(DomainError::ConnectionClosed));
                self.done.send_replace(true);
            }
        }
    }

    pub fn mark_received(&self, now: Instant) {
        let ms = whole_millis(now.saturating_duration_since(self.born));
        self.latest_recv_ms.fetch_max(ms, Ordering::AcqRel);
    }

    fn last_received(&self) -> Instant {
        self.born + Duration::from_millis(self.latest_recv_ms.load(Ordering::Acquire))
    }

    /// Called after a failed exchange. Closes this instance when nothing has
    /// been received for longer than the lost threshold; returns whether it
    /// did.
    pub fn query_failed(&self, now: Instant) -> bool {
        let silent_for = now.saturating_duration_since(self.last_received());
        if silent_for <= self.lost_threshold {
            return false;
        }

        debug!(
            conn_id = ?self.conn_id(),
            silent_ms = whole_millis(silent_for),
            "DoQ connection considered lost"
        );
        self.close();
        true
    }
}

fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::io::DuplexStream;

    #[derive(Clone)]
    struct StubConn {
        id: usize,
        closed: Arc<AtomicBool>,
    }

    impl StubConn {
        fn new(id: usize) -> Self {
            Self {
                id,
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl DoqConnection for StubConn {
        type SendStream = DuplexStream;
        type RecvStream = DuplexStream;

        async fn open_stream(&self) -> Result<(DuplexStream, DuplexStream), DomainError> {
            Ok(tokio::io::duplex(64))
        }

        fn is_gone(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn terminate(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn conn_id(&self) -> usize {
            self.id
        }
    }

    struct StubDialer {
        delay: Duration,
        dials: AtomicUsize,
        conn: StubConn,
    }

    #[async_trait]
    impl Dialer for StubDialer {
        type Connection = StubConn;

        async fn dial(&self, _deadline: Instant) -> Result<StubConn, DomainError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.conn.clone())
        }

        fn target(&self) -> &str {
            "stub:853"
        }
    }

    fn stub_dialer(delay: Duration) -> Arc<StubDialer> {
        Arc::new(StubDialer {
            delay,
            dials: AtomicUsize::new(0),
            conn: StubConn::new(1),
        })
    }

    const THRESHOLD: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_connection_dialed_after_close_is_terminated() {
        let lazy = LazyConn::<StubConn>::new(THRESHOLD);
        lazy.close();
        assert!(lazy.is_resolved());

        let conn = StubConn::new(7);
        lazy.publish(Ok(conn.clone()));

        assert!(conn.is_gone(), "late connection must be closed");
        let result = lazy.wait(&CancellationToken::new()).await;
        assert_eq!(result.err(), Some(DomainError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_close_terminates_published_connection() {
        let lazy = LazyConn::<StubConn>::new(THRESHOLD);
        let conn = StubConn::new(3);
        lazy.publish(Ok(conn.clone()));
        assert!(!lazy.needs_replacement());

        lazy.close();
        lazy.close();

        assert!(conn.is_gone());
        assert!(lazy.needs_replacement());
        let opened = lazy.open_stream(&conn).await;
        assert_eq!(opened.err(), Some(DomainError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_failed_dial_needs_replacement() {
        let lazy = LazyConn::<StubConn>::new(THRESHOLD);
        assert!(!lazy.needs_replacement());

        lazy.publish(Err(DomainError::TransportConnectionRefused {
            server: "stub:853".to_string(),
        }));

        assert!(lazy.needs_replacement());
        assert!(matches!(
            lazy.wait(&CancellationToken::new()).await,
            Err(DomainError::TransportConnectionRefused { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_does_not_abort_dial() {
        let dialer = stub_dialer(Duration::from_secs(1));
        let lazy = LazyConn::start(Arc::clone(&dialer), Duration::from_secs(3), THRESHOLD);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let cancelled = lazy.wait(&cancel).await;
        assert_eq!(cancelled.err(), Some(DomainError::Cancelled));

        let conn = lazy.wait(&CancellationToken::new()).await.unwrap();
        assert_eq!(conn.conn_id(), 1);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_timeout() {
        let dialer = stub_dialer(Duration::from_secs(10));
        let lazy = LazyConn::start(dialer, Duration::from_secs(3), THRESHOLD);

        let result = lazy.wait(&CancellationToken::new()).await;
        assert!(matches!(result, Err(DomainError::TransportTimeout { .. })));
        assert!(lazy.needs_replacement());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_dial_wakes_waiters() {
        let dialer = stub_dialer(Duration::from_secs(1));
        let lazy = LazyConn::start(Arc::clone(&dialer), Duration::from_secs(3), THRESHOLD);

        let waiter = {
            let lazy = Arc::clone(&lazy);
            tokio::spawn(async move { lazy.wait(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        lazy.close();
        let result = waiter.await.unwrap();
        assert_eq!(result.err(), Some(DomainError::ConnectionClosed));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!dialer.conn.is_gone(), "aborted dial never produced a connection");
        assert_eq!(lazy.conn_id(), None);
    }

    #[tokio::test]
    async fn test_liveness_threshold() {
        let lazy = LazyConn::<StubConn>::new(THRESHOLD);
        let conn = StubConn::new(9);
        lazy.publish(Ok(conn.clone()));
        let start = Instant::now();

        assert!(!lazy.query_failed(start + Duration::from_secs(4)));
        assert!(!conn.is_gone());

        lazy.mark_received(start + Duration::from_secs(4));
        assert!(!lazy.query_failed(start + Duration::from_secs(8)));

        assert!(lazy.query_failed(start + Duration::from_secs(10)));
        assert!(conn.is_gone());
        assert!(lazy.needs_replacement());
    }

    #[test]
    fn test_whole_millis_saturates() {
        assert_eq!(whole_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(whole_millis(Duration::MAX), u64::MAX);
    }
}
