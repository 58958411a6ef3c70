//! Session bookkeeping wrapper.
//!
//! A [`SessionHandle`] adorns one managed session with the lifecycle
//! state the manager tracks for it and with the shared-list hook that
//! places it in the active list or the recycled pool. Handles are shared:
//! the owning list holds one strong reference and every in-flight
//! continuation holds another for the duration of its callback.

use crate::error::SessionError;
use crate::list::{SharedListHook, SharedListNode};
use crate::server::factory::ManagedSession;
use std::sync::{Arc, Mutex, MutexGuard};

/// Start progress of the wrapped session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StartState {
    NotStarted,
    Started,
    Stopped,
}

/// Stop progress of the wrapped session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopState {
    NotStopped,
    InProgress,
    Stopped,
}

/// Progress of the session's end-of-connection watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitState {
    NotStarted,
    InProgress,
    Complete,
}

#[derive(Debug)]
struct HandleState {
    start: StartState,
    stop: StopState,
    wait: WaitState,
    error: Option<SessionError>,
}

impl HandleState {
    fn fresh() -> Self {
        Self {
            start: StartState::NotStarted,
            stop: StopState::NotStopped,
            wait: WaitState::NotStarted,
            error: None,
        }
    }
}

/// One in-flight or reusable session.
pub(crate) struct SessionHandle {
    id: u64,
    session: Arc<dyn ManagedSession>,
    state: Mutex<HandleState>,
    link: SharedListHook<SessionHandle>,
}

impl SessionHandle {
    pub fn new(id: u64, session: Arc<dyn ManagedSession>) -> Arc<Self> {
        Arc::new(Self {
            id,
            session,
            state: Mutex::new(HandleState::fresh()),
            link: SharedListHook::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session(&self) -> &Arc<dyn ManagedSession> {
        &self.session
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn start_state(&self) -> StartState {
        self.lock().start
    }

    pub fn set_start_state(&self, state: StartState) {
        self.lock().start = state;
    }

    pub fn stop_state(&self) -> StopState {
        self.lock().stop
    }

    pub fn set_stop_state(&self, state: StopState) {
        self.lock().stop = state;
    }

    pub fn wait_state(&self) -> WaitState {
        self.lock().wait
    }

    pub fn set_wait_state(&self, state: WaitState) {
        self.lock().wait = state;
    }

    /// Most recent error observed for the session, if any.
    pub fn error(&self) -> Option<SessionError> {
        self.lock().error.clone()
    }

    pub fn set_error(&self, error: SessionError) {
        self.lock().error = Some(error);
    }

    /// Whether the wrapped session has fully wound down.
    pub fn is_terminated(&self) -> bool {
        let state = self.lock();
        state.start == StartState::Stopped && state.stop == StopState::Stopped
    }

    /// Return the bookkeeping to its freshly-created shape so the handle
    /// can serve a future accept.
    pub fn reset_for_reuse(&self) {
        *self.lock() = HandleState::fresh();
    }
}

impl SharedListNode for SessionHandle {
    fn shared_hook(&self) -> &SharedListHook<Self> {
        &self.link
    }
}
