//! Session construction seam.
//!
//! The manager never touches connection I/O itself: it creates sessions
//! through a [`SessionFactory`] and drives them through the
//! [`ManagedSession`] contract.

use crate::config::SessionConfig;
use crate::error::SessionError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::TcpStream;

/// One accepted connection plus its I/O state, as seen by the manager.
///
/// `wait` and `stop` may be awaited concurrently: `wait` resolves when
/// the connection has ended for any reason, `stop` forces that end and
/// resolves once the session is fully down.
#[async_trait]
pub trait ManagedSession: Send + Sync {
    /// Take ownership of the accepted transport and begin serving.
    async fn start(&self, transport: TcpStream) -> Result<(), SessionError>;

    /// Resolve when the connection has ended (peer EOF, I/O error, or
    /// stop).
    async fn wait(&self) -> Result<(), SessionError>;

    /// Force the connection to end. Safe to call at any point after
    /// `start` has been issued, including while it is still in flight.
    async fn stop(&self) -> Result<(), SessionError>;

    /// Prepare a stopped session for reuse by a recycled handle.
    fn reset(&self);
}

/// Creates and releases sessions on behalf of the manager.
pub trait SessionFactory: Send + Sync {
    /// Construct a fresh session.
    fn create(&self, config: &SessionConfig) -> Result<Arc<dyn ManagedSession>, SessionError>;

    /// Observe a session leaving the manager for good (dropped rather
    /// than recycled).
    fn release(&self, _session: &Arc<dyn ManagedSession>) {}
}
