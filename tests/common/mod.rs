//! Shared integration-test support: an instrumented session factory and a
//! scripted acceptor for fault injection.

#![allow(dead_code)]

use async_trait::async_trait;
use echod::config::{Config, ListenConfig, ManagerConfig, SessionConfig};
use echod::error::SessionError;
use echod::server::{Acceptor, ManagedSession, SessionFactory, TcpAcceptor};
use echod::session::EchoSessionFactory;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

/// Config bound to an ephemeral localhost port with the given limits.
pub fn test_config(max_sessions: usize, recycled: usize, max_stopping: usize) -> Config {
    Config {
        listen: ListenConfig {
            address: "127.0.0.1:0".parse().expect("addr"),
            backlog: 128,
        },
        manager: ManagerConfig {
            max_session_count: max_sessions,
            recycled_session_count: recycled,
            max_stopping_sessions: max_stopping,
        },
        session: SessionConfig::default(),
    }
}

/// Poll `condition` until it holds or a 5 second deadline passes.
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Write `payload` and expect it echoed back verbatim.
pub async fn assert_echo(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.expect("write");
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.expect("read echo");
    assert_eq!(buf, payload);
}

// ============================================================================
// Scripted acceptor
// ============================================================================

/// Wraps the production acceptor and lets tests deliver injected errors
/// to the accept currently pending on it.
pub struct ScriptedAcceptor {
    inner: TcpAcceptor,
    inject_tx: mpsc::UnboundedSender<io::Error>,
    inject_rx: Mutex<mpsc::UnboundedReceiver<io::Error>>,
}

impl ScriptedAcceptor {
    pub fn new() -> Self {
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        Self {
            inner: TcpAcceptor::new(),
            inject_tx,
            inject_rx: Mutex::new(inject_rx),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    /// Fail the pending (or next) accept with `error`.
    pub fn inject(&self, error: io::Error) {
        let _ = self.inject_tx.send(error);
    }
}

#[async_trait]
impl Acceptor for ScriptedAcceptor {
    async fn open(&self, endpoint: SocketAddr, backlog: u32) -> io::Result<SocketAddr> {
        self.inner.open(endpoint, backlog).await
    }

    async fn accept(&self) -> io::Result<TcpStream> {
        // The manager keeps at most one accept outstanding, so the lock
        // is never contended.
        let mut inject_rx = self.inject_rx.lock().await;
        tokio::select! {
            biased;
            Some(error) = inject_rx.recv() => Err(error),
            accepted = self.inner.accept() => accepted,
        }
    }

    fn close(&self) {
        self.inner.close();
    }
}

// ============================================================================
// Instrumented factory
// ============================================================================

/// Counters observed by tests across a factory's sessions.
#[derive(Default)]
pub struct SessionGauges {
    pub created: AtomicUsize,
    pub released: AtomicUsize,
    pub stops_completed: AtomicUsize,
    stops_in_flight: AtomicUsize,
    max_stops_in_flight: AtomicUsize,
}

impl SessionGauges {
    fn stop_entered(&self) {
        let now = self.stops_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let mut max = self.max_stops_in_flight.load(Ordering::SeqCst);
        while now > max {
            match self.max_stops_in_flight.compare_exchange_weak(
                max,
                now,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => max = current,
            }
        }
    }

    fn stop_exited(&self) {
        self.stops_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.stops_completed.fetch_add(1, Ordering::SeqCst);
    }

    /// Highest number of session stops ever observed running at once.
    pub fn max_concurrent_stops(&self) -> usize {
        self.max_stops_in_flight.load(Ordering::SeqCst)
    }
}

/// Echo-session factory that counts lifecycle events and can slow
/// starts and stops down (or fail starts outright) to widen the
/// lifecycle windows the manager has to handle.
pub struct InstrumentedFactory {
    inner: EchoSessionFactory,
    pub gauges: Arc<SessionGauges>,
    start_delay: Duration,
    stop_delay: Duration,
    fail_start: bool,
}

impl InstrumentedFactory {
    pub fn new(stop_delay: Duration) -> Self {
        Self::build(Duration::ZERO, stop_delay, false)
    }

    /// Sessions whose start takes `start_delay` to complete.
    pub fn slow_start(start_delay: Duration, stop_delay: Duration) -> Self {
        Self::build(start_delay, stop_delay, false)
    }

    /// Sessions whose start fails after `start_delay`.
    pub fn failing_start(start_delay: Duration) -> Self {
        Self::build(start_delay, Duration::ZERO, true)
    }

    fn build(start_delay: Duration, stop_delay: Duration, fail_start: bool) -> Self {
        Self {
            inner: EchoSessionFactory,
            gauges: Arc::new(SessionGauges::default()),
            start_delay,
            stop_delay,
            fail_start,
        }
    }
}

impl SessionFactory for InstrumentedFactory {
    fn create(&self, config: &SessionConfig) -> Result<Arc<dyn ManagedSession>, SessionError> {
        self.gauges.created.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.create(config)?;
        Ok(Arc::new(InstrumentedSession {
            inner,
            gauges: Arc::clone(&self.gauges),
            start_delay: self.start_delay,
            stop_delay: self.stop_delay,
            fail_start: self.fail_start,
        }))
    }

    fn release(&self, _session: &Arc<dyn ManagedSession>) {
        self.gauges.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct InstrumentedSession {
    inner: Arc<dyn ManagedSession>,
    gauges: Arc<SessionGauges>,
    start_delay: Duration,
    stop_delay: Duration,
    fail_start: bool,
}

#[async_trait]
impl ManagedSession for InstrumentedSession {
    async fn start(&self, transport: TcpStream) -> Result<(), SessionError> {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if self.fail_start {
            return Err(SessionError::InvalidState);
        }
        self.inner.start(transport).await
    }

    async fn wait(&self) -> Result<(), SessionError> {
        self.inner.wait().await
    }

    async fn stop(&self) -> Result<(), SessionError> {
        self.gauges.stop_entered();
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        let result = self.inner.stop().await;
        self.gauges.stop_exited();
        result
    }

    fn reset(&self) {
        self.inner.reset();
    }
}
