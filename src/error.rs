//! Unified error handling for echod.
//!
//! The manager deals in clonable errors: the single terminal value reached
//! at shutdown may have to be delivered to both a pending `wait()` and a
//! pending `stop()` observer, so I/O causes are carried as
//! `Arc<std::io::Error>` rather than by value.

use std::io;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Manager Errors (control surface)
// ============================================================================

/// Errors produced by the session manager control surface.
#[derive(Debug, Clone, Error)]
pub enum ManagerError {
    /// The requested operation is not valid in the current lifecycle state
    /// (second `start()`, second outstanding `wait()`, `stop()` after the
    /// manager already stopped, and so on).
    #[error("operation not valid in the current manager state")]
    InvalidState,

    /// `start()` could not bind or listen on the configured endpoint.
    /// The manager stays ready; the call may be retried.
    #[error("failed to open listener: {0}")]
    AcceptorOpen(Arc<io::Error>),

    /// A listener-level failure forced the manager to shut down. This is
    /// the terminal value reported to `wait()` and `stop()`.
    #[error("listener accept failed: {0}")]
    AcceptFatal(Arc<io::Error>),

    /// The session factory could not construct a session for the accept
    /// loop, leaving the manager unable to serve further connections.
    #[error("session factory failed: {0}")]
    SessionCreate(SessionError),
}

impl ManagerError {
    /// Static code string for log labeling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidState => "invalid_state",
            Self::AcceptorOpen(_) => "acceptor_open",
            Self::AcceptFatal(_) => "accept_fatal",
            Self::SessionCreate(_) => "session_create",
        }
    }
}

// ============================================================================
// Session Errors (per-connection)
// ============================================================================

/// Errors produced by individual sessions.
///
/// A session error terminates the session that raised it and is counted by
/// the stats collector; it never terminates the manager.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The session is not in a state that allows the requested transition
    /// (starting a session that is already running, for example).
    #[error("session is not in a usable state for the requested operation")]
    InvalidState,

    /// The session's transport failed.
    #[error("session i/o failed: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for SessionError {
    fn from(error: io::Error) -> Self {
        Self::Io(Arc::new(error))
    }
}
