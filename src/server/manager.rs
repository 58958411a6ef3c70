//! Session manager: the control plane that owns the listening socket and
//! orchestrates the lifetime of the session population.
//!
//! All manager state lives inside a single actor task. Public methods post
//! an operation into the task's inbox and await a oneshot completion;
//! background continuations (accept, session start, session wait, session
//! stop) are spawned tasks that report back through an event inbox. Every
//! inbox entry runs to completion before the next is taken, which gives
//! the state transitions a total order per manager instance. Completions
//! are delivered on the caller's task, never inside the actor, so callers
//! may re-enter the manager from a completion without deadlock.

use crate::config::Config;
use crate::error::{ManagerError, SessionError};
use crate::list::SharedIntrusiveList;
use crate::server::acceptor::{classify_accept_error, AcceptErrorClass, Acceptor};
use crate::server::factory::SessionFactory;
use crate::server::handle::{SessionHandle, StartState, StopState, WaitState};
use crate::server::stats::{ManagerStats, StatsCollector};
use std::io;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

// ============================================================================
// Public handle
// ============================================================================

/// Cloneable control handle for one session manager instance.
///
/// The manager is jointly owned by its handles and by every continuation
/// it has in flight. Dropping the last handle drains the actor: any
/// remaining sessions are stopped and the task exits.
#[derive(Clone)]
pub struct SessionManager {
    ops: mpsc::UnboundedSender<Op>,
    stats: Arc<StatsCollector>,
}

impl SessionManager {
    /// Create a manager and spawn its actor task. The manager starts in
    /// the ready state; nothing is bound until [`start`](Self::start).
    pub fn new(
        config: Config,
        factory: Arc<dyn SessionFactory>,
        acceptor: Arc<dyn Acceptor>,
    ) -> Self {
        let stats = Arc::new(StatsCollector::new());
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = ManagerTask {
            ops: ops_rx,
            events: events_rx,
            core: ManagerCore::new(config, factory, acceptor, events_tx, Arc::clone(&stats)),
        };
        tokio::spawn(task.run());
        Self { ops: ops_tx, stats }
    }

    /// Transition from ready to work: open the listener and post the
    /// first accept. On `AcceptorOpen` the manager stays ready.
    pub async fn start(&self) -> Result<(), ManagerError> {
        self.submit(Op::Start).await
    }

    /// Request graceful shutdown and complete once the manager has fully
    /// stopped, with the terminal value.
    pub async fn stop(&self) -> Result<(), ManagerError> {
        self.submit(Op::Stop).await
    }

    /// One-shot notification of the first unrecoverable condition: a
    /// fatal accept error or the terminal stop. Completes with the
    /// terminal value (`Ok` on clean stop). Only one `wait` may be
    /// outstanding; a second completes with `InvalidState` and leaves the
    /// first pending.
    pub async fn wait(&self) -> Result<(), ManagerError> {
        self.submit(Op::Wait).await
    }

    /// Return a stopped (or never-started) manager to ready, optionally
    /// dropping the recycled pool. Counters are zeroed.
    pub async fn reset(&self, free_recycled: bool) -> Result<(), ManagerError> {
        self.submit(|reply| Op::Reset {
            free_recycled,
            reply,
        })
        .await
    }

    /// Non-blocking snapshot of the manager's counters.
    pub fn stats(&self) -> ManagerStats {
        self.stats.snapshot()
    }

    async fn submit(&self, op: impl FnOnce(Reply) -> Op) -> Result<(), ManagerError> {
        let (tx, rx) = oneshot::channel();
        if self.ops.send(op(tx)).is_err() {
            // The actor has already drained and exited.
            return Err(ManagerError::InvalidState);
        }
        rx.await.unwrap_or(Err(ManagerError::InvalidState))
    }
}

// ============================================================================
// Actor plumbing
// ============================================================================

type Reply = oneshot::Sender<Result<(), ManagerError>>;

enum Op {
    Start(Reply),
    Stop(Reply),
    Wait(Reply),
    Reset { free_recycled: bool, reply: Reply },
}

enum Event {
    AcceptDone {
        handle: Arc<SessionHandle>,
        result: io::Result<TcpStream>,
    },
    StartDone {
        handle: Arc<SessionHandle>,
        result: Result<(), SessionError>,
    },
    WaitDone {
        handle: Arc<SessionHandle>,
        result: Result<(), SessionError>,
    },
    StopDone {
        handle: Arc<SessionHandle>,
        result: Result<(), SessionError>,
    },
}

struct ManagerTask {
    ops: mpsc::UnboundedReceiver<Op>,
    events: mpsc::UnboundedReceiver<Event>,
    core: ManagerCore,
}

impl ManagerTask {
    #[instrument(name = "session_manager", skip_all)]
    async fn run(self) {
        let ManagerTask {
            mut ops,
            mut events,
            mut core,
        } = self;
        let mut ops_open = true;

        loop {
            tokio::select! {
                op = ops.recv(), if ops_open => match op {
                    Some(op) => core.handle_op(op).await,
                    None => {
                        ops_open = false;
                        core.on_handles_dropped();
                    }
                },
                event = events.recv() => match event {
                    Some(event) => core.handle_event(event),
                    None => break,
                },
            }
            if !ops_open && core.is_drained() {
                break;
            }
        }
        debug!("manager actor exited");
    }
}

// ============================================================================
// State machine
// ============================================================================

/// Lifecycle as seen by callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ExternState {
    Ready,
    Work,
    Stop,
    Stopped,
}

/// Internal drive state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InternState {
    Work,
    Stop,
    Stopped,
}

/// Whether an accept is pending on the listening socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AcceptState {
    Ready,
    InProgress,
    Stopped,
}

/// Cursor of the shutdown sweep over the active list.
enum StopSweep {
    Idle,
    At(Arc<SessionHandle>),
    Done,
}

struct ManagerCore {
    config: Config,
    factory: Arc<dyn SessionFactory>,
    acceptor: Arc<dyn Acceptor>,
    events_tx: mpsc::UnboundedSender<Event>,
    stats: Arc<StatsCollector>,

    extern_state: ExternState,
    intern_state: InternState,
    accept_state: AcceptState,
    /// In-flight continuations the manager must observe before it may
    /// announce the stopped state.
    pending_operations: usize,

    active_sessions: SharedIntrusiveList<SessionHandle>,
    recycled_sessions: SharedIntrusiveList<SessionHandle>,
    stop_sweep: StopSweep,
    stops_in_flight: usize,

    /// Latched fatal accept error; gates the accept loop.
    accept_error: Option<ManagerError>,
    /// The single terminal value delivered to `wait` and `stop`.
    terminal_error: Option<ManagerError>,

    wait_reply: Option<Reply>,
    stop_reply: Option<Reply>,

    next_session_id: u64,
}

impl ManagerCore {
    fn new(
        config: Config,
        factory: Arc<dyn SessionFactory>,
        acceptor: Arc<dyn Acceptor>,
        events_tx: mpsc::UnboundedSender<Event>,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            config,
            factory,
            acceptor,
            events_tx,
            stats,
            extern_state: ExternState::Ready,
            intern_state: InternState::Work,
            accept_state: AcceptState::Ready,
            pending_operations: 0,
            active_sessions: SharedIntrusiveList::new(),
            recycled_sessions: SharedIntrusiveList::new(),
            stop_sweep: StopSweep::Idle,
            stops_in_flight: 0,
            accept_error: None,
            terminal_error: None,
            wait_reply: None,
            stop_reply: None,
            next_session_id: 0,
        }
    }

    fn is_drained(&self) -> bool {
        self.intern_state == InternState::Stopped && self.pending_operations == 0
    }

    /// The last control handle went away; wind everything down.
    fn on_handles_dropped(&mut self) {
        if self.intern_state != InternState::Stopped {
            debug!("all manager handles dropped, draining");
            self.start_stop(None);
        }
    }

    // ------------------------------------------------------------------
    // External requests
    // ------------------------------------------------------------------

    async fn handle_op(&mut self, op: Op) {
        match op {
            Op::Start(reply) => {
                let result = self.do_start().await;
                let _ = reply.send(result);
            }
            Op::Stop(reply) => self.do_stop(reply),
            Op::Wait(reply) => self.do_wait(reply),
            Op::Reset {
                free_recycled,
                reply,
            } => {
                let result = self.do_reset(free_recycled);
                let _ = reply.send(result);
            }
        }
    }

    async fn do_start(&mut self) -> Result<(), ManagerError> {
        if self.extern_state != ExternState::Ready {
            return Err(ManagerError::InvalidState);
        }
        let endpoint = self.config.listen.address;
        let addr = match self.acceptor.open(endpoint, self.config.listen.backlog).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!(%endpoint, error = %e, "failed to open listener");
                return Err(ManagerError::AcceptorOpen(Arc::new(e)));
            }
        };
        info!(%addr, max_sessions = self.config.manager.max_session_count, "accepting sessions");
        self.extern_state = ExternState::Work;
        self.intern_state = InternState::Work;
        self.continue_work();
        Ok(())
    }

    fn do_stop(&mut self, reply: Reply) {
        match self.extern_state {
            ExternState::Stopped => {
                let _ = reply.send(Err(ManagerError::InvalidState));
            }
            ExternState::Stop => {
                // Already draining (an earlier stop, or an implicit stop
                // after a fatal accept error). One caller may adopt the
                // completion slot.
                if self.stop_reply.is_some() {
                    let _ = reply.send(Err(ManagerError::InvalidState));
                } else {
                    self.stop_reply = Some(reply);
                }
            }
            ExternState::Ready | ExternState::Work => {
                self.extern_state = ExternState::Stop;
                self.stop_reply = Some(reply);
                self.start_stop(None);
            }
        }
    }

    fn do_wait(&mut self, reply: Reply) {
        match self.extern_state {
            ExternState::Ready => {
                let _ = reply.send(Err(ManagerError::InvalidState));
            }
            ExternState::Stopped => {
                let _ = reply.send(self.terminal_result());
            }
            ExternState::Work | ExternState::Stop => {
                if self.wait_reply.is_some() {
                    let _ = reply.send(Err(ManagerError::InvalidState));
                } else if let Some(latched) = &self.terminal_error {
                    // The unrecoverable condition already happened.
                    let _ = reply.send(Err(latched.clone()));
                } else {
                    self.wait_reply = Some(reply);
                }
            }
        }
    }

    fn do_reset(&mut self, free_recycled: bool) -> Result<(), ManagerError> {
        match self.extern_state {
            ExternState::Work | ExternState::Stop => Err(ManagerError::InvalidState),
            ExternState::Ready | ExternState::Stopped => {
                debug_assert!(self.active_sessions.is_empty());
                debug_assert_eq!(self.pending_operations, 0);
                self.active_sessions.clear();
                if free_recycled {
                    while let Some(handle) = self.recycled_sessions.pop_front() {
                        self.factory.release(handle.session());
                    }
                }
                self.accept_error = None;
                self.terminal_error = None;
                self.stop_sweep = StopSweep::Idle;
                self.stops_in_flight = 0;
                self.extern_state = ExternState::Ready;
                self.intern_state = InternState::Work;
                self.accept_state = AcceptState::Ready;
                self.stats.reset();
                self.stats
                    .set_recycled_session_count(self.recycled_sessions.len());
                debug!(free_recycled, "manager reset to ready");
                Ok(())
            }
        }
    }

    fn terminal_result(&self) -> Result<(), ManagerError> {
        match &self.terminal_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Background continuations
    // ------------------------------------------------------------------

    fn handle_event(&mut self, event: Event) {
        debug_assert!(self.pending_operations > 0);
        self.pending_operations -= 1;
        match event {
            Event::AcceptDone { handle, result } => self.handle_accept(handle, result),
            Event::StartDone { handle, result } => self.handle_session_start(handle, result),
            Event::WaitDone { handle, result } => self.handle_session_wait(handle, result),
            Event::StopDone { handle, result } => self.handle_session_stop(handle, result),
        }
    }

    // ------------------------------------------------------------------
    // Accept loop
    // ------------------------------------------------------------------

    /// Issue the next accept when the loop conditions allow it: working,
    /// no accept outstanding, below the session cap, no latched error.
    fn continue_work(&mut self) {
        if self.intern_state != InternState::Work
            || self.accept_state != AcceptState::Ready
            || self.accept_error.is_some()
            || self.active_sessions.len() >= self.config.manager.max_session_count
        {
            return;
        }
        match self.acquire_handle() {
            Ok(handle) => self.start_accept(handle),
            Err(e) => {
                error!(error = %e, "session factory refused to create a session");
                self.start_stop(Some(ManagerError::SessionCreate(e)));
            }
        }
    }

    /// Take a handle from the recycled pool, or build a fresh one.
    fn acquire_handle(&mut self) -> Result<Arc<SessionHandle>, SessionError> {
        if let Some(handle) = self.recycled_sessions.pop_front() {
            self.stats
                .set_recycled_session_count(self.recycled_sessions.len());
            return Ok(handle);
        }
        let session = self.factory.create(&self.config.session)?;
        let id = self.next_session_id;
        self.next_session_id += 1;
        Ok(SessionHandle::new(id, session))
    }

    fn start_accept(&mut self, handle: Arc<SessionHandle>) {
        self.accept_state = AcceptState::InProgress;
        self.pending_operations += 1;
        let acceptor = Arc::clone(&self.acceptor);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = acceptor.accept().await;
            let _ = events.send(Event::AcceptDone { handle, result });
        });
    }

    fn handle_accept(&mut self, handle: Arc<SessionHandle>, result: io::Result<TcpStream>) {
        if self.accept_state == AcceptState::InProgress {
            self.accept_state = AcceptState::Ready;
        }
        match self.intern_state {
            InternState::Work => self.handle_accept_at_work(handle, result),
            _ => self.handle_accept_at_stop(handle, result),
        }
    }

    fn handle_accept_at_work(
        &mut self,
        handle: Arc<SessionHandle>,
        result: io::Result<TcpStream>,
    ) {
        match result {
            Ok(transport) => {
                self.stats.session_accepted(false);
                self.add_to_active(&handle);
                self.start_session_start(handle, transport);
                self.continue_work();
            }
            Err(e) => match classify_accept_error(&e) {
                AcceptErrorClass::Cancelled => {
                    // The listener is closing under us; release the handle
                    // as if the stop had already been observed.
                    debug!("accept cancelled");
                    self.recycle(handle);
                }
                AcceptErrorClass::Recoverable => {
                    warn!(error = %e, "recoverable accept failure, retrying");
                    self.stats.session_accepted(true);
                    self.recycle(handle);
                    self.continue_work();
                }
                AcceptErrorClass::Fatal => {
                    error!(error = %e, "fatal accept failure, shutting down");
                    self.stats.session_accepted(true);
                    self.recycle(handle);
                    let fatal = ManagerError::AcceptFatal(Arc::new(e));
                    self.accept_error = Some(fatal.clone());
                    self.start_stop(Some(fatal));
                }
            },
        }
    }

    fn handle_accept_at_stop(
        &mut self,
        handle: Arc<SessionHandle>,
        result: io::Result<TcpStream>,
    ) {
        // Draining: release the accepted transport, keep the allocation.
        if let Ok(transport) = result {
            drop(transport);
        }
        self.recycle(handle);
        self.continue_stop();
    }

    // ------------------------------------------------------------------
    // Session-start handshake
    // ------------------------------------------------------------------

    fn start_session_start(&mut self, handle: Arc<SessionHandle>, transport: TcpStream) {
        self.pending_operations += 1;
        let events = self.events_tx.clone();
        let session = Arc::clone(handle.session());
        tokio::spawn(async move {
            let result = session.start(transport).await;
            let _ = events.send(Event::StartDone { handle, result });
        });
    }

    fn handle_session_start(
        &mut self,
        handle: Arc<SessionHandle>,
        result: Result<(), SessionError>,
    ) {
        match self.intern_state {
            InternState::Work => self.handle_session_start_at_work(handle, result),
            _ => self.handle_session_start_at_stop(handle, result),
        }
    }

    fn handle_session_start_at_work(
        &mut self,
        handle: Arc<SessionHandle>,
        result: Result<(), SessionError>,
    ) {
        match result {
            Ok(()) => {
                handle.set_start_state(StartState::Started);
                self.start_session_wait(handle);
            }
            Err(e) => {
                // A session that failed to start must still be stopped.
                warn!(session = handle.id(), error = %e, "session failed to start");
                handle.set_error(e);
                self.start_session_stop(handle);
            }
        }
    }

    fn handle_session_start_at_stop(
        &mut self,
        handle: Arc<SessionHandle>,
        result: Result<(), SessionError>,
    ) {
        match result {
            Ok(()) => {
                handle.set_start_state(StartState::Started);
            }
            Err(e) => {
                // Must-stop: the session never ran, but it still gets
                // its one stop completion from the sweep.
                handle.set_error(e);
                handle.set_start_state(StartState::Stopped);
            }
        }
        // Either way the start has settled; the sweep held here and can
        // issue the session's stop under the drain cap.
        self.continue_stop();
    }

    // ------------------------------------------------------------------
    // Session wait and stop
    // ------------------------------------------------------------------

    fn start_session_wait(&mut self, handle: Arc<SessionHandle>) {
        handle.set_wait_state(WaitState::InProgress);
        self.pending_operations += 1;
        let events = self.events_tx.clone();
        let session = Arc::clone(handle.session());
        tokio::spawn(async move {
            let result = session.wait().await;
            let _ = events.send(Event::WaitDone { handle, result });
        });
    }

    fn handle_session_wait(
        &mut self,
        handle: Arc<SessionHandle>,
        result: Result<(), SessionError>,
    ) {
        handle.set_wait_state(WaitState::Complete);
        if let Err(e) = result {
            debug!(session = handle.id(), error = %e, "session ended with error");
            handle.set_error(e);
        }
        if handle.stop_state() == StopState::Stopped {
            // The stop completion beat this continuation through the
            // inbox and deferred the retire to it.
            self.retire(handle);
            match self.intern_state {
                InternState::Work => self.continue_work(),
                _ => self.continue_stop(),
            }
            return;
        }
        match self.intern_state {
            InternState::Work => {
                // The connection ended on its own; retire the session.
                if handle.stop_state() == StopState::NotStopped {
                    self.start_session_stop(handle);
                }
            }
            _ => {
                // The sweep owns stop issuance during the drain and has
                // not passed a not-yet-stopping session; this landing
                // only needs to advance the drain.
                self.continue_stop();
            }
        }
    }

    fn start_session_stop(&mut self, handle: Arc<SessionHandle>) {
        debug_assert_eq!(handle.stop_state(), StopState::NotStopped);
        handle.set_stop_state(StopState::InProgress);
        self.stops_in_flight += 1;
        self.pending_operations += 1;
        let events = self.events_tx.clone();
        let session = Arc::clone(handle.session());
        tokio::spawn(async move {
            let result = session.stop().await;
            let _ = events.send(Event::StopDone { handle, result });
        });
    }

    fn handle_session_stop(
        &mut self,
        handle: Arc<SessionHandle>,
        result: Result<(), SessionError>,
    ) {
        debug_assert!(self.stops_in_flight > 0);
        self.stops_in_flight -= 1;
        handle.set_stop_state(StopState::Stopped);
        handle.set_start_state(StartState::Stopped);
        if let Err(e) = result {
            handle.set_error(e);
        }

        // The end-of-connection continuation may still be in flight; if
        // so the handle must not be recycled from under it. The retire
        // happens when that continuation lands.
        if handle.wait_state() != WaitState::InProgress {
            self.retire(handle);
        }

        match self.intern_state {
            // A freed slot may put the accept loop back under its cap.
            InternState::Work => self.continue_work(),
            _ => self.continue_stop(),
        }
    }

    /// Final per-session accounting once every continuation for the
    /// handle has been observed: leave the active list, count the
    /// outcome, recycle or release.
    fn retire(&mut self, handle: Arc<SessionHandle>) {
        debug_assert!(handle.is_terminated());
        let failed = handle.error().is_some();
        self.remove_from_active(&handle);
        self.stats.session_stopped(failed);
        self.recycle(handle);
    }

    // ------------------------------------------------------------------
    // Stop drive
    // ------------------------------------------------------------------

    /// Begin (or join) the shutdown drive. `error` latches the terminal
    /// value; the first latched error wins.
    fn start_stop(&mut self, error: Option<ManagerError>) {
        if let Some(error) = error {
            if self.terminal_error.is_none() {
                self.terminal_error = Some(error);
            }
        }
        if self.intern_state != InternState::Work {
            return;
        }
        if self.extern_state == ExternState::Work || self.extern_state == ExternState::Ready {
            // Implicit stop: the caller learns through `wait`.
            self.extern_state = ExternState::Stop;
        }
        self.intern_state = InternState::Stop;
        self.accept_state = AcceptState::Stopped;
        self.acceptor.close();
        self.stop_sweep = StopSweep::Idle;
        self.continue_stop();
    }

    /// Advance the stopping sweep and detect the terminal state.
    fn continue_stop(&mut self) {
        debug_assert_eq!(self.intern_state, InternState::Stop);

        if let StopSweep::Idle = self.stop_sweep {
            self.stop_sweep = match self.active_sessions.front() {
                Some(front) => StopSweep::At(Arc::clone(front)),
                None => StopSweep::Done,
            };
        }

        // Walk the active list front-to-back issuing stops. The sweep is
        // the only stop issuer while draining, so the cap on
        // simultaneously outstanding stop operations is absolute. At a
        // session whose start is still in flight the sweep holds and
        // resumes once the start settles; sessions already stopping are
        // passed over, their completion advances the drain.
        while self.stops_in_flight < self.config.manager.max_stopping_sessions {
            let current = match &self.stop_sweep {
                StopSweep::At(handle) => Arc::clone(handle),
                _ => break,
            };
            if current.start_state() == StartState::NotStarted {
                break;
            }
            let next = SharedIntrusiveList::next(&current);
            if current.stop_state() == StopState::NotStopped {
                self.start_session_stop(Arc::clone(&current));
            }
            self.stop_sweep = match next {
                Some(next) => StopSweep::At(next),
                None => StopSweep::Done,
            };
        }

        if self.active_sessions.is_empty() && self.pending_operations == 0 {
            self.complete_stop();
        }
    }

    fn complete_stop(&mut self) {
        self.intern_state = InternState::Stopped;
        self.extern_state = ExternState::Stopped;
        let terminal = self.terminal_result();
        match &terminal {
            Ok(()) => info!("manager stopped"),
            Err(e) => info!(error = %e, "manager stopped with terminal error"),
        }
        if let Some(reply) = self.stop_reply.take() {
            let _ = reply.send(terminal.clone());
        }
        if let Some(reply) = self.wait_reply.take() {
            let _ = reply.send(terminal);
        }
    }

    // ------------------------------------------------------------------
    // List maintenance
    // ------------------------------------------------------------------

    fn add_to_active(&mut self, handle: &Arc<SessionHandle>) {
        self.active_sessions.push_front(Arc::clone(handle));
        self.stats
            .set_active_session_count(self.active_sessions.len());
    }

    fn remove_from_active(&mut self, handle: &Arc<SessionHandle>) {
        // Keep the sweep cursor off the node being unlinked.
        if let StopSweep::At(cursor) = &self.stop_sweep {
            if Arc::ptr_eq(cursor, handle) {
                self.stop_sweep = match SharedIntrusiveList::next(handle) {
                    Some(next) => StopSweep::At(next),
                    None => StopSweep::Done,
                };
            }
        }
        self.active_sessions.erase(handle);
        self.stats
            .set_active_session_count(self.active_sessions.len());
    }

    /// Return a handle to the recycled pool if it is reusable and the
    /// pool has room; release it otherwise.
    fn recycle(&mut self, handle: Arc<SessionHandle>) {
        let reusable = handle.error().is_none();
        if reusable
            && self.recycled_sessions.len() < self.config.manager.recycled_session_count
        {
            handle.reset_for_reuse();
            handle.session().reset();
            self.recycled_sessions.push_front(handle);
        } else {
            self.factory.release(handle.session());
        }
        self.stats
            .set_recycled_session_count(self.recycled_sessions.len());
    }
}
