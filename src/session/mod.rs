//! Echo session: the production session served to accepted connections.
//!
//! Each session runs a full-duplex pump in its own task: bytes read from
//! the peer cycle through a bounded chunk pool and are written straight
//! back. The pump ends on peer EOF (after draining), on an I/O error, or
//! when the session is stopped. The pump reports its end through a watch
//! channel so `wait` and `stop` can both observe it, concurrently.

mod buffer;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::server::{ManagedSession, SessionFactory};
use async_trait::async_trait;
use buffer::BufferPool;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Outcome = Result<(), SessionError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

struct Inner {
    phase: Phase,
    cancel: CancellationToken,
    /// Taken by the pump at start; present while idle so a stop of a
    /// never-started session can publish its outcome directly.
    outcome_tx: Option<watch::Sender<Option<Outcome>>>,
    outcome_rx: watch::Receiver<Option<Outcome>>,
}

impl Inner {
    fn fresh() -> Self {
        let (outcome_tx, outcome_rx) = watch::channel(None);
        Self {
            phase: Phase::Idle,
            cancel: CancellationToken::new(),
            outcome_tx: Some(outcome_tx),
            outcome_rx,
        }
    }
}

/// One echo connection.
pub struct EchoSession {
    config: SessionConfig,
    inner: Mutex<Inner>,
}

impl EchoSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::fresh()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ManagedSession for EchoSession {
    async fn start(&self, transport: TcpStream) -> Result<(), SessionError> {
        let (cancel, outcome_tx) = {
            let mut inner = self.lock();
            if inner.phase != Phase::Idle {
                return Err(SessionError::InvalidState);
            }
            let outcome_tx = inner.outcome_tx.take().ok_or(SessionError::InvalidState)?;
            inner.phase = Phase::Running;
            (inner.cancel.clone(), outcome_tx)
        };

        if self.config.no_delay {
            if let Err(e) = transport.set_nodelay(true) {
                let error = SessionError::from(e);
                let _ = outcome_tx.send(Some(Err(error.clone())));
                self.lock().phase = Phase::Stopped;
                return Err(error);
            }
        }

        let pool = BufferPool::new(self.config.buffer_chunks, self.config.buffer_size);
        tokio::spawn(async move {
            let result = pump(transport, pool, &cancel).await;
            if let Err(e) = &result {
                debug!(error = %e, "echo pump ended with error");
            }
            let _ = outcome_tx.send(Some(result));
        });
        Ok(())
    }

    async fn wait(&self) -> Result<(), SessionError> {
        let mut rx = self.lock().outcome_rx.clone();
        let outcome = rx
            .wait_for(|outcome| outcome.is_some())
            .await
            .map_err(|_| SessionError::InvalidState)?;
        (*outcome).clone().unwrap_or(Ok(()))
    }

    async fn stop(&self) -> Result<(), SessionError> {
        let mut rx = {
            let mut inner = self.lock();
            match inner.phase {
                Phase::Idle => {
                    // Never started; nothing to wind down.
                    inner.phase = Phase::Stopped;
                    if let Some(outcome_tx) = inner.outcome_tx.take() {
                        let _ = outcome_tx.send(Some(Ok(())));
                    }
                    return Ok(());
                }
                Phase::Running | Phase::Stopped => {
                    inner.cancel.cancel();
                    inner.outcome_rx.clone()
                }
            }
        };
        rx.wait_for(|outcome| outcome.is_some())
            .await
            .map_err(|_| SessionError::InvalidState)?;
        self.lock().phase = Phase::Stopped;
        Ok(())
    }

    fn reset(&self) {
        *self.lock() = Inner::fresh();
    }
}

/// Full-duplex echo loop over a bounded chunk pool.
///
/// The read side stalls once every chunk is queued behind a slow peer,
/// which bounds memory per session to the pool size.
async fn pump(stream: TcpStream, mut pool: BufferPool, cancel: &CancellationToken) -> Outcome {
    let (mut rd, mut wr) = stream.into_split();
    let mut eof = false;

    loop {
        if eof && !pool.has_queued() {
            break;
        }
        let read_slot = if eof { None } else { pool.read_slot() };
        let write_slot = pool.write_slot();

        // SAFETY: the two slots refer to distinct pool-owned chunks (one
        // leased for reading, one queued for writing); the pool does not
        // touch a slot's bytes while the I/O below runs.
        let read_buf =
            read_slot.map(|(ptr, len)| unsafe { std::slice::from_raw_parts_mut(ptr, len) });
        let write_buf =
            write_slot.map(|(ptr, len)| unsafe { std::slice::from_raw_parts(ptr, len) });

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            read = maybe_read(&mut rd, read_buf) => {
                let n = read?;
                if n == 0 {
                    eof = true;
                    pool.release_read_slot();
                } else {
                    pool.commit_read(n);
                }
            }
            wrote = maybe_write(&mut wr, write_buf) => {
                pool.commit_write(wrote?);
            }
        }
    }

    let _ = wr.shutdown().await;
    Ok(())
}

async fn maybe_read(rd: &mut OwnedReadHalf, buf: Option<&mut [u8]>) -> Result<usize, SessionError> {
    match buf {
        Some(buf) => rd.read(buf).await.map_err(SessionError::from),
        None => std::future::pending().await,
    }
}

async fn maybe_write(wr: &mut OwnedWriteHalf, buf: Option<&[u8]>) -> Result<usize, SessionError> {
    match buf {
        Some(buf) => wr.write(buf).await.map_err(SessionError::from),
        None => std::future::pending().await,
    }
}

/// Builds [`EchoSession`]s for the manager.
pub struct EchoSessionFactory;

impl SessionFactory for EchoSessionFactory {
    fn create(&self, config: &SessionConfig) -> Result<Arc<dyn ManagedSession>, SessionError> {
        Ok(Arc::new(EchoSession::new(config.clone())))
    }
}
