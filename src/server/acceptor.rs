//! Listening socket ownership.
//!
//! The manager drives its accept loop exclusively through the [`Acceptor`]
//! seam; [`TcpAcceptor`] is the production implementation.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Opens a listening endpoint and asynchronously yields accepted
/// transports.
///
/// At most one `accept` is ever outstanding per acceptor; the manager's
/// accept loop guarantees it.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Bind and listen on `endpoint`. Returns the bound address, which
    /// differs from `endpoint` for port-zero binds.
    async fn open(&self, endpoint: SocketAddr, backlog: u32) -> io::Result<SocketAddr>;

    /// Wait for one inbound connection. A pending call completes with an
    /// [`io::ErrorKind::Interrupted`] error when the acceptor is closed.
    async fn accept(&self) -> io::Result<TcpStream>;

    /// Stop accepting: cancel a pending `accept` and release the
    /// listening socket.
    fn close(&self);
}

/// Error delivered to a pending accept cancelled by [`Acceptor::close`].
///
/// tokio retries EINTR internally, so `Interrupted` never reaches the
/// accept path any other way; classification can rely on it.
pub(crate) fn accept_cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "accept cancelled by close")
}

/// How the manager reacts to an accept failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AcceptErrorClass {
    /// The listener was closed under the accept; behave as if stopping.
    Cancelled,
    /// Transient resource shortage; recycle and retry.
    Recoverable,
    /// The listener is unusable; latch and shut down.
    Fatal,
}

pub(crate) fn classify_accept_error(error: &io::Error) -> AcceptErrorClass {
    match error.kind() {
        io::ErrorKind::Interrupted => AcceptErrorClass::Cancelled,
        // A peer that resets mid-handshake or a transiently reused address
        // costs one retry, nothing more.
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
        | io::ErrorKind::AddrInUse => AcceptErrorClass::Recoverable,
        _ => match error.raw_os_error() {
            // ENFILE (23) / EMFILE (24): descriptor pressure; retrying
            // after in-flight sessions wind down can succeed.
            Some(23) | Some(24) if cfg!(unix) => AcceptErrorClass::Recoverable,
            _ => AcceptErrorClass::Fatal,
        },
    }
}

struct AcceptorState {
    listener: Option<Arc<TcpListener>>,
    cancel: CancellationToken,
    local_addr: Option<SocketAddr>,
}

/// Production acceptor bound to a TCP listening socket.
pub struct TcpAcceptor {
    state: Mutex<AcceptorState>,
}

impl TcpAcceptor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AcceptorState {
                listener: None,
                cancel: CancellationToken::new(),
                local_addr: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AcceptorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Address the listener is bound to, once open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().local_addr
    }
}

impl Default for TcpAcceptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn open(&self, endpoint: SocketAddr, backlog: u32) -> io::Result<SocketAddr> {
        let socket = if endpoint.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(endpoint)?;
        let listener = socket.listen(backlog)?;
        let addr = listener.local_addr()?;

        let mut state = self.lock();
        state.listener = Some(Arc::new(listener));
        state.cancel = CancellationToken::new();
        state.local_addr = Some(addr);
        debug!(%addr, backlog, "listener open");
        Ok(addr)
    }

    async fn accept(&self) -> io::Result<TcpStream> {
        let (listener, cancel) = {
            let state = self.lock();
            let listener = state
                .listener
                .clone()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "listener not open"))?;
            (listener, state.cancel.clone())
        };

        tokio::select! {
            () = cancel.cancelled() => Err(accept_cancelled()),
            accepted = listener.accept() => accepted.map(|(stream, _peer)| stream),
        }
    }

    fn close(&self) {
        let mut state = self.lock();
        state.cancel.cancel();
        // A pending accept holds its own reference and winds down on the
        // cancel; the OS socket closes with the last reference.
        state.listener = None;
        state.local_addr = None;
        debug!("listener closed");
    }
}
