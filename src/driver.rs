//! the state machine driver: advances every connection through the state graph, invokes
//! per-state and terminal callbacks, and implements the retry/failure and reentrant-mutation
//! rules.
//!
//! the per-connection drive loop is built around an explicit `State` enum rather than a
//! typestate-by-struct approach, and around `tokio::task::LocalSet` + `spawn_local` rather than
//! an `Arc`-shared worker pool, giving a single-threaded cooperative model with no locks or
//! atomics anywhere in the hot path.

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    rc::Rc,
    time::Duration,
};

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    task::{AbortHandle, JoinSet},
};
use tracing::{debug, trace, warn};

use crate::{
    builder::{self, Defaults, RequestOptions},
    callback::{CallbackStorage, Callbacks},
    codec::{self, WireRequest},
    connection::{
        Connection, ErrorEntry, PendingAction, ReinitOverrides, RequestSpec, ResponseRecord, State,
        TimelineEntry,
    },
    error::{Error, ErrorKind, TimeoutError},
    host::{Resolver, Target},
    pool::{CacheKey, IdleSocket, SocketCache},
    timeout::Deadlines,
    tls::{self, Io},
};

/// driver-wide state reachable from any connection-driving task: the connection table, the
/// callback side-table, the socket cache, and the deferred-action queues that implement
/// cooperative reentrancy. never holds the [`JoinSet`]/[`AbortHandle`] bookkeeping -- those stay
/// on [`Driver`] itself so a `.await` on `join_next()` never needs to cross a borrow of this type.
pub(crate) struct Shared {
    connections: HashMap<u64, Rc<RefCell<Connection>>>,
    callbacks: CallbackStorage,
    pending_new: VecDeque<(u64, RequestSpec, Callbacks)>,
    pending_break: bool,
    socket_cache: Option<SocketCache>,
    resolver: Rc<Resolver>,
    next_id: u64,
    defaults: Defaults,
    account_for_signals: bool,
    keep_timeline: bool,
}

impl Shared {
    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// the view of a connection and its driver a callback receives. every accessor takes only a
/// brief, non-`.await`-spanning borrow; every mutator defers its effect via `pending_action` (for
/// the callback's own connection) or a `Shared` queue (for everything else), per the cooperative
/// reentrancy design.
pub struct CallbackCtx<'a> {
    id: u64,
    conn: &'a Rc<RefCell<Connection>>,
    shared: &'a Rc<RefCell<Shared>>,
    error_kind: ErrorKind,
    error_message: Option<String>,
}

impl<'a> CallbackCtx<'a> {
    fn new(id: u64, conn: &'a Rc<RefCell<Connection>>, shared: &'a Rc<RefCell<Shared>>) -> Self {
        Self {
            id,
            conn,
            shared,
            error_kind: ErrorKind::NoError,
            error_message: None,
        }
    }

    /// the `CallbackCtx` handed to the terminal callback on entry to `USER_ACTION`, carrying the
    /// `(error_kind, error_message)` pair alongside the connection itself. Hook callbacks never
    /// see a non-`NoError` kind here -- `fire_hook` always constructs its context with
    /// [`CallbackCtx::new`].
    fn terminal(id: u64, conn: &'a Rc<RefCell<Connection>>, shared: &'a Rc<RefCell<Shared>>, kind: ErrorKind, message: String) -> Self {
        Self {
            id,
            conn,
            shared,
            error_kind: kind,
            error_message: (kind != ErrorKind::NoError).then_some(message),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// the error kind the terminal callback is being invoked with; [`ErrorKind::NoError`] for
    /// a successful response and for every hook callback. When this is anything else, `response`
    /// is `None`.
    pub fn error_kind(&self) -> ErrorKind {
        self.error_kind
    }

    /// the message paired with [`CallbackCtx::error_kind`], absent on success and for hooks.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn state(&self) -> State {
        self.conn.borrow().state()
    }

    pub fn target(&self) -> Option<Target> {
        self.conn.borrow().target().cloned()
    }

    pub fn url(&self) -> String {
        self.conn.borrow().url()
    }

    /// the request record driving this connection, including any per-attempt overrides applied
    /// by a prior `reinit`. named distinctly from [`CallbackCtx::request`] (which enqueues a new,
    /// unrelated request) to avoid a same-name inherent-method clash.
    pub fn request_spec(&self) -> RequestSpec {
        self.conn.borrow().request().clone()
    }

    pub fn attempts_left(&self) -> u32 {
        self.conn.borrow().attempts_left()
    }

    pub fn last_error(&self) -> Option<ErrorEntry> {
        self.conn.borrow().last_error().cloned()
    }

    pub fn errors(&self) -> Vec<ErrorEntry> {
        self.conn.borrow().errors().to_vec()
    }

    pub fn timeline(&self) -> Vec<TimelineEntry> {
        self.conn.borrow().timeline().to_vec()
    }

    pub fn response(&self) -> Option<ResponseRecord> {
        self.conn.borrow().response().cloned()
    }

    /// request a retry of *this* connection. a no-op if `attempts_left == 0`; applied by the
    /// driver once the callback returns.
    pub fn retry(&self) {
        self.conn.borrow_mut().pending_action = PendingAction::Retry;
    }

    /// request reinitialization of *this* connection with `overrides`, resetting its retry
    /// budget; applied once the callback returns.
    pub fn reinit(&self, overrides: ReinitOverrides) {
        self.conn.borrow_mut().pending_action = PendingAction::Reinit(Box::new(overrides));
    }

    /// request that *this* connection be dropped without the terminal callback firing again.
    pub fn drop_self(&self) {
        self.conn.borrow_mut().pending_action = PendingAction::Drop;
    }

    /// stop the driver's current `run` at the next safe point. does not alter any connection's
    /// state.
    pub fn break_loop(&self) {
        self.shared.borrow_mut().pending_break = true;
    }

    /// enqueue a brand new request. returns its id immediately; the connection does not begin
    /// driving until the next loop iteration, exactly like [`Driver::request`].
    pub fn request(&self, options: RequestOptions) -> u64 {
        enqueue_request(&self.shared, options)
    }

    /// request a retry of another connection. takes effect on a subsequent iteration.
    pub fn retry_conn(&self, id: u64) {
        if let Some(other) = self.shared.borrow().connections.get(&id).cloned() {
            other.borrow_mut().pending_action = PendingAction::Retry;
        }
    }

    /// request reinitialization of another connection. takes effect on a subsequent iteration.
    pub fn reinit_conn(&self, id: u64, overrides: ReinitOverrides) {
        if let Some(other) = self.shared.borrow().connections.get(&id).cloned() {
            other.borrow_mut().pending_action = PendingAction::Reinit(Box::new(overrides));
        }
    }

    /// request that another connection be dropped. takes effect on a subsequent iteration.
    pub fn drop_conn(&self, id: u64) {
        if let Some(other) = self.shared.borrow().connections.get(&id).cloned() {
            other.borrow_mut().pending_action = PendingAction::Drop;
        }
    }
}

fn enqueue_request(shared: &Rc<RefCell<Shared>>, options: RequestOptions) -> u64 {
    let mut s = shared.borrow_mut();
    let id = s.alloc_id();
    let (request, callbacks) = builder::merge(&s.defaults, options);
    s.pending_new.push_back((id, request, callbacks));
    id
}

/// the driving engine. owns the `JoinSet` of connection tasks and their abort handles directly
/// (never behind the shared `RefCell`) so that awaiting task completion never risks a double
/// borrow with a task that is itself mutating `Shared`.
pub struct Driver {
    shared: Rc<RefCell<Shared>>,
    tasks: JoinSet<u64>,
    abort_handles: HashMap<u64, AbortHandle>,
    task_ids: HashMap<tokio::task::Id, u64>,
    running: bool,
}

/// a state a `run` call may wait for instead of full completion, via the `until_state` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunUntil {
    State(State),
}

impl Driver {
    pub(crate) fn new(
        defaults: Defaults,
        socket_cache: Option<SocketCache>,
        resolver: Resolver,
        account_for_signals: bool,
        keep_timeline: bool,
    ) -> (Self, CallbackStorage) {
        let callbacks = CallbackStorage::default();
        let shared = Rc::new(RefCell::new(Shared {
            connections: HashMap::new(),
            callbacks: callbacks.clone(),
            pending_new: VecDeque::new(),
            pending_break: false,
            socket_cache,
            resolver: Rc::new(resolver),
            next_id: 1,
            defaults,
            account_for_signals,
            keep_timeline,
        }));
        (
            Self {
                shared,
                tasks: JoinSet::new(),
                abort_handles: HashMap::new(),
                task_ids: HashMap::new(),
                running: false,
            },
            callbacks,
        )
    }

    /// submit a new request. options override the driver's defaults. returns the new
    /// connection's id immediately; the connection does not begin driving until the next call
    /// to [`Driver::run`]/[`Driver::run_once`]/[`Driver::run_nowait`].
    pub fn request(&mut self, options: RequestOptions) -> u64 {
        enqueue_request(&self.shared, options)
    }

    /// immediately cancel `id`'s task (if it has one yet), close its socket (never caching it),
    /// and remove it without invoking the terminal callback.
    pub fn drop(&mut self, id: u64) {
        if let Some(handle) = self.abort_handles.remove(&id) {
            self.task_ids.remove(&handle.id());
            handle.abort();
        }
        let mut shared = self.shared.borrow_mut();
        shared.connections.remove(&id);
        shared.callbacks.remove(id);
        shared.pending_new.retain(|(pending_id, ..)| *pending_id != id);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// stop the current `run` at the next safe point.
    pub fn break_loop(&mut self) {
        self.shared.borrow_mut().pending_break = true;
    }

    fn drain_pending_new(&mut self) {
        let pending: Vec<_> = {
            let mut shared = self.shared.borrow_mut();
            shared.pending_new.drain(..).collect()
        };
        for (id, request, callbacks) in pending {
            let keep_timeline = self.shared.borrow().keep_timeline;
            let conn = Rc::new(RefCell::new(Connection::new(id, request, keep_timeline)));
            {
                let mut shared = self.shared.borrow_mut();
                shared.connections.insert(id, conn.clone());
                shared.callbacks.insert(id, callbacks);
            }
            let shared = self.shared.clone();
            let handle = self.tasks.spawn_local(drive_connection(id, conn, shared));
            self.task_ids.insert(handle.id(), id);
            self.abort_handles.insert(id, handle);
        }
    }

    /// drive connections until either every live connection has reached COMPLETED, or -- when
    /// `until` names a state and `ids` names a subset -- every connection in `ids` has reached at
    /// least that state (a connection absent from the table, because it already completed and was
    /// reaped, counts as having reached it). `ids` of `None` applies the `until` check to every
    /// live connection instead of a named subset. must be called from within a
    /// [`tokio::task::LocalSet`], since connection tasks are spawned via `spawn_local`.
    pub async fn run(&mut self, until: Option<RunUntil>, ids: Option<&[u64]>) {
        self.running = true;
        self.shared.borrow_mut().pending_break = false;

        let account_for_signals = self.shared.borrow().account_for_signals;
        let mut idle_tick = account_for_signals.then(|| tokio::time::interval(Duration::from_millis(1)));

        loop {
            self.drain_pending_new();

            if self.shared.borrow_mut().pending_break {
                break;
            }

            if self.tasks.is_empty() {
                break;
            }

            if let Some(RunUntil::State(target)) = until {
                let shared = self.shared.borrow();
                let reached = match ids {
                    Some(ids) => ids.iter().all(|id| {
                        shared
                            .connections
                            .get(id)
                            .map(|c| state_at_least(c.borrow().state(), target))
                            .unwrap_or(true)
                    }),
                    None => shared.connections.values().all(|c| state_at_least(c.borrow().state(), target)),
                };
                drop(shared);
                if reached {
                    break;
                }
            }

            tokio::select! {
                joined = self.tasks.join_next_with_id() => {
                    match joined {
                        Some(Ok((_, id))) => self.finish_connection(id),
                        Some(Err(e)) => self.finish_panicked(&e),
                        None => break,
                    }
                }
                _ = async {
                    if let Some(tick) = idle_tick.as_mut() {
                        tick.tick().await;
                    } else {
                        std::future::pending::<()>().await;
                    }
                } => {}
            }
        }

        self.running = false;
    }

    /// a single non-blocking iteration: spawn any pending new connections and reap any task that
    /// has already finished, without waiting.
    pub fn run_nowait(&mut self) {
        self.drain_pending_new();
        while let Some(joined) = self.tasks.try_join_next_with_id() {
            match joined {
                Ok((_, id)) => self.finish_connection(id),
                Err(e) => self.finish_panicked(&e),
            }
        }
    }

    /// a single blocking iteration: spawn pending connections, then wait for exactly one task to
    /// finish (or return immediately if none are outstanding).
    pub async fn run_once(&mut self) {
        self.drain_pending_new();
        if let Some(joined) = self.tasks.join_next_with_id().await {
            match joined {
                Ok((_, id)) => self.finish_connection(id),
                Err(e) => self.finish_panicked(&e),
            }
        }
    }

    fn finish_connection(&mut self, id: u64) {
        if let Some(handle) = self.abort_handles.remove(&id) {
            self.task_ids.remove(&handle.id());
        }
        let mut shared = self.shared.borrow_mut();
        shared.connections.remove(&id);
        shared.callbacks.remove(id);
    }

    /// a connection task panicked (or was aborted and its `JoinError` surfaced, e.g. on a race
    /// with `drop`). its socket and any other task-local state are already gone -- dropped during
    /// unwind -- so this only needs to forget the connection and its callbacks, the same
    /// bookkeeping [`Driver::drop`] performs, rather than re-invoke the terminal callback: the
    /// panic may have happened mid-callback, and re-entering it would not be safe.
    fn finish_panicked(&mut self, err: &tokio::task::JoinError) {
        warn!(error = %err, "connection task panicked or was aborted");
        if let Some(id) = self.task_ids.remove(&err.id()) {
            self.abort_handles.remove(&id);
            let mut shared = self.shared.borrow_mut();
            shared.connections.remove(&id);
            shared.callbacks.remove(id);
        }
    }

    /// confirms `id` still names a live (not yet reaped) connection, echoing it back.
    pub fn conn_id(&self, id: u64) -> Option<u64> {
        self.with_conn(id, |c| c.id())
    }

    pub fn conn_state(&self, id: u64) -> Option<State> {
        self.with_conn(id, |c| c.state())
    }

    pub fn conn_target(&self, id: u64) -> Option<Target> {
        self.with_conn(id, |c| c.target().cloned())?
    }

    pub fn conn_url(&self, id: u64) -> Option<String> {
        self.with_conn(id, |c| c.url())
    }

    pub fn conn_request(&self, id: u64) -> Option<RequestSpec> {
        self.with_conn(id, |c| c.request().clone())
    }

    pub fn conn_errors(&self, id: u64) -> Option<Vec<ErrorEntry>> {
        self.with_conn(id, |c| c.errors().to_vec())
    }

    pub fn conn_last_error(&self, id: u64) -> Option<ErrorEntry> {
        self.with_conn(id, |c| c.last_error().cloned())?
    }

    /// the connection's timeline of state transitions. empty whether or not `keep_timeline` was
    /// enabled -- present only as a signal of whether recording was turned on, matching
    /// [`Connection::timeline`]'s own "enabled via config" semantics.
    pub fn conn_timeline(&self, id: u64) -> Option<Vec<TimelineEntry>> {
        self.with_conn(id, |c| c.timeline().to_vec())
    }

    pub fn conn_attempts_left(&self, id: u64) -> Option<u32> {
        self.with_conn(id, |c| c.attempts_left())
    }

    pub fn conn_response(&self, id: u64) -> Option<ResponseRecord> {
        self.with_conn(id, |c| c.response().cloned())?
    }

    fn with_conn<T>(&self, id: u64, f: impl FnOnce(&Connection) -> T) -> Option<T> {
        let shared = self.shared.borrow();
        shared.connections.get(&id).map(|c| f(&c.borrow()))
    }
}

fn state_at_least(state: State, target: State) -> bool {
    fn rank(s: State) -> u8 {
        match s {
            State::Initialized => 0,
            State::ResolveDns => 1,
            State::Connecting => 2,
            State::Connected => 3,
            State::SslHandshake => 4,
            State::Writing => 5,
            State::Reading => 6,
            State::UserAction => 7,
            State::Completed => 8,
        }
    }
    rank(state) >= rank(target)
}

/// outcome of a single attempt (one pass from INITIALIZED through either USER_ACTION or a
/// recoverable failure).
enum AttemptOutcome {
    Success {
        response: ResponseRecord,
        reusable: Option<(CacheKey, IdleSocket)>,
    },
    Recoverable(ErrorKind, String),
    Terminal(ErrorKind, String),
}

/// the per-connection task body: one `spawn_local` future per connection, alive for its entire
/// lifetime. owns its socket and timers as plain local variables for the duration of each
/// attempt -- never inside the shared, `RefCell`-guarded [`Connection`] -- so nothing here ever
/// holds a borrow of `Connection` across an `.await` point.
async fn drive_connection(id: u64, conn: Rc<RefCell<Connection>>, shared: Rc<RefCell<Shared>>) -> u64 {
    // `request` spans every attempt of this request's lifecycle, so it is armed once here and
    // never touched by `arm_attempt` -- only a callback-triggered reinit (a deliberate new
    // request) below replaces it. `connect`/`drain` are rearmed per attempt inside the loop.
    let timeout_config = conn.borrow().request().timeout_config;
    let mut deadlines = Deadlines::new(timeout_config);

    loop {
        if matches!(conn.borrow().pending_action, PendingAction::Drop) {
            conn.borrow_mut().record_state(State::Completed);
            return id;
        }

        deadlines.arm_attempt();

        let outcome = run_attempt(id, &conn, &shared, &mut deadlines).await;

        match outcome {
            AttemptOutcome::Success { response, reusable } => {
                if let Some((key, socket)) = reusable {
                    if let Some(cache) = shared.borrow_mut().socket_cache.as_mut() {
                        cache.put(key, socket);
                    }
                }
                conn.borrow_mut().set_response(response);
                conn.borrow_mut().record_state(State::UserAction);
                invoke_terminal(id, &conn, &shared, ErrorKind::NoError, String::new());
            }
            AttemptOutcome::Recoverable(kind, message) => {
                conn.borrow_mut().push_error(kind, message.clone());
                let has_more = conn.borrow_mut().consume_attempt();
                if has_more {
                    conn.borrow_mut().record_state(State::Initialized);
                    continue;
                }
                // retry budget exhausted -- the terminal callback sees the real failure that
                // ended the last attempt, not a synthetic kind. no extra `errors` entry: the
                // failure was already pushed above, and `attempts_left` (now 0) already tells the
                // callback the budget is spent.
                conn.borrow_mut().record_state(State::UserAction);
                invoke_terminal(id, &conn, &shared, kind, message);
            }
            AttemptOutcome::Terminal(kind, message) => {
                conn.borrow_mut().push_error(kind, message.clone());
                conn.borrow_mut().record_state(State::UserAction);
                invoke_terminal(id, &conn, &shared, kind, message);
            }
        }

        let action = std::mem::replace(&mut conn.borrow_mut().pending_action, PendingAction::None);
        match action {
            PendingAction::None => {
                conn.borrow_mut().record_state(State::Completed);
                return id;
            }
            PendingAction::Drop => {
                conn.borrow_mut().record_state(State::Completed);
                return id;
            }
            PendingAction::Retry => {
                if conn.borrow().attempts_left() > 0 {
                    conn.borrow_mut().record_state(State::Initialized);
                } else {
                    trace!(id, "retry requested with no attempts left, ignoring");
                    conn.borrow_mut().record_state(State::Completed);
                    return id;
                }
            }
            PendingAction::Reinit(overrides) => {
                conn.borrow_mut().apply_overrides(*overrides);
                conn.borrow_mut().record_state(State::Initialized);
                // `reinit_conn` starts a fresh request lifecycle -- including its own
                // end-to-end `request_timeout` -- rather than inheriting the exhausted one.
                let timeout_config = conn.borrow().request().timeout_config;
                deadlines = Deadlines::new(timeout_config);
            }
        }
    }
}

/// run one attempt: DNS resolution, connect (or socket cache reuse), optional TLS handshake,
/// write, read. returns as soon as the attempt either produces a response or fails.
async fn run_attempt(
    id: u64,
    conn: &Rc<RefCell<Connection>>,
    shared: &Rc<RefCell<Shared>>,
    deadlines: &mut Deadlines,
) -> AttemptOutcome {
    if let Err(message) = fire_hook(id, conn, shared, |c| c.init.clone()) {
        return AttemptOutcome::Terminal(ErrorKind::InternalError, message);
    }
    conn.borrow_mut().record_state(State::ResolveDns);

    let host_spec = {
        let c = conn.borrow();
        let attempt = c.attempt();
        let request = c.request();
        request.host.spec_for_attempt(attempt, request.scheme)
    };

    // `resolver` is reference-counted so the borrow of `shared` ends before the `.resolve().await`
    // below -- nothing here ever holds a `RefCell` guard across a suspension point.
    let resolver = shared.borrow().resolver.clone();
    let target = match resolver.resolve(&host_spec).await {
        Ok(mut targets) if !targets.is_empty() => targets.remove(0),
        Ok(_) => {
            return AttemptOutcome::Recoverable(
                ErrorKind::ConnectError,
                format!("host {} resolved to no addresses", host_spec.host),
            )
        }
        Err(e) => return AttemptOutcome::Recoverable(e.kind(), e.to_string()),
    };

    conn.borrow_mut().set_target(target.clone());
    conn.borrow_mut().record_state(State::Connecting);
    if let Err(message) = fire_hook(id, conn, shared, |c| c.connecting.clone()) {
        return AttemptOutcome::Terminal(ErrorKind::InternalError, message);
    }

    let cache_key = CacheKey::new(target.host.clone(), target.port, target.scheme);
    let cached = shared
        .borrow_mut()
        .socket_cache
        .as_mut()
        .and_then(|cache| cache.take(&cache_key));

    let io = if let Some(idle) = cached {
        trace!(id, host = %target.host, port = target.port, "socket cache hit");
        idle.io
    } else {
        let connected = tokio::select! {
            res = TcpStream::connect(target.addr) => res.map_err(Error::from),
            _ = deadlines.connect() => Err(Error::from(TimeoutError::Connect)),
        };
        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => return AttemptOutcome::Recoverable(e.kind(), e.to_string()),
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(id, error = %e, "failed to set TCP_NODELAY");
        }

        if target.scheme.is_tls() {
            conn.borrow_mut().record_state(State::SslHandshake);
            let handshake = tokio::select! {
                res = tls::handshake(stream, &target.host) => res,
                _ = deadlines.connect() => Err(Error::from(TimeoutError::Connect)),
            };
            match handshake {
                Ok(io) => io,
                Err(e) => return AttemptOutcome::Recoverable(ErrorKind::TlsError, e.to_string()),
            }
        } else {
            Io::Tcp(stream)
        }
    };

    conn.borrow_mut().record_state(State::Connected);
    if let Err(message) = fire_hook(id, conn, shared, |c| c.connected.clone()) {
        return AttemptOutcome::Terminal(ErrorKind::InternalError, message);
    }

    conn.borrow_mut().record_state(State::Writing);
    if let Err(message) = fire_hook(id, conn, shared, |c| c.writing.clone()) {
        return AttemptOutcome::Terminal(ErrorKind::InternalError, message);
    }

    let mut io = io;
    let mut out = BytesMut::new();
    {
        let c = conn.borrow();
        let request = c.request();
        let wire = WireRequest {
            method: &request.method,
            path: &request.path,
            query: request.query.as_deref(),
            version: request.version,
            headers: &request.headers,
            body: &request.body,
        };
        codec::encode_request(&wire, Some(&format!("{}:{}", target.host, target.port)), &mut out);
    }
    warn_if_non_binary(&conn.borrow());

    let write_result = tokio::select! {
        res = io.write_all(&out) => res.map_err(Error::from),
        _ = deadlines.drain() => Err(Error::from(TimeoutError::Drain)),
        _ = deadlines.request() => Err(Error::from(TimeoutError::Request)),
    };
    if let Err(e) = write_result {
        let kind = classify_io(&e, ErrorKind::WriteError);
        return AttemptOutcome::Recoverable(kind, e.to_string());
    }
    if let Err(e) = tokio::select! {
        res = io.flush() => res.map_err(Error::from),
        _ = deadlines.drain() => Err(Error::from(TimeoutError::Drain)),
    } {
        let kind = classify_io(&e, ErrorKind::WriteError);
        return AttemptOutcome::Recoverable(kind, e.to_string());
    }

    conn.borrow_mut().record_state(State::Reading);
    if let Err(message) = fire_hook(id, conn, shared, |c| c.reading.clone()) {
        return AttemptOutcome::Terminal(ErrorKind::InternalError, message);
    }

    let mut read_buf = BytesMut::new();
    let head = loop {
        match codec::try_decode_head(&read_buf) {
            Ok(Some(head)) => break head,
            Ok(None) => {}
            Err(e) => {
                let kind = e.kind();
                return AttemptOutcome::Terminal(kind, e.to_string());
            }
        }
        let mut chunk = [0u8; 8192];
        let read_result = tokio::select! {
            res = io.read(&mut chunk) => res.map_err(Error::from),
            _ = deadlines.request() => Err(Error::from(TimeoutError::Request)),
        };
        match read_result {
            Ok(0) => {
                return AttemptOutcome::Recoverable(
                    ErrorKind::ReadError,
                    "connection closed before response head was complete".into(),
                )
            }
            Ok(n) => read_buf.extend_from_slice(&chunk[..n]),
            Err(e) => {
                let kind = classify_io(&e, ErrorKind::ReadError);
                return AttemptOutcome::Recoverable(kind, e.to_string());
            }
        }
    };

    let content_length = match codec::content_length(&head.headers) {
        Ok(len) => len,
        Err(e) => {
            let kind = e.kind();
            return AttemptOutcome::Terminal(kind, e.to_string());
        }
    };
    let keep_alive = codec::is_keep_alive(head.version, &head.headers);
    let version = head.version;
    let status = head.status;
    let headers = head.headers.clone();
    let mut body = codec::split_head(&mut read_buf, &head);

    while body.len() < content_length {
        let mut chunk = [0u8; 8192];
        let read_result = tokio::select! {
            res = io.read(&mut chunk) => res.map_err(Error::from),
            _ = deadlines.request() => Err(Error::from(TimeoutError::Request)),
        };
        match read_result {
            Ok(0) => {
                return AttemptOutcome::Recoverable(
                    ErrorKind::ReadError,
                    "connection closed before response body was complete".into(),
                )
            }
            Ok(n) => {
                let mut buf = bytes::BytesMut::from(&body[..]);
                buf.extend_from_slice(&chunk[..n]);
                body = buf.freeze();
            }
            Err(e) => {
                let kind = classify_io(&e, ErrorKind::ReadError);
                return AttemptOutcome::Recoverable(kind, e.to_string());
            }
        }
    }
    // a single read can overshoot Content-Length if the peer pipelines trailing bytes; trim to
    // the declared length and leave the rest unread rather than trying to frame a second message.
    if body.len() > content_length {
        body = body.slice(..content_length);
    }

    let response = ResponseRecord { version, status, headers, body };
    let reusable = keep_alive.then(|| (cache_key, IdleSocket::new(io)));

    debug!(id, status = status.as_u16(), keep_alive, "response complete");

    AttemptOutcome::Success { response, reusable }
}

/// classify an I/O-phase error: a plain `io::Error` takes on the kind of the phase it occurred
/// in (write vs. read), since [`Error::kind`] alone cannot tell connect-time and write/read-time
/// `io::Error`s apart. Timeouts and every other variant already carry enough information and
/// pass through [`Error::kind`] unchanged.
fn classify_io(e: &Error, io_kind: ErrorKind) -> ErrorKind {
    match e {
        Error::Io(_) => io_kind,
        other => other.kind(),
    }
}

fn warn_if_non_binary(conn: &Connection) {
    let request = conn.request();
    if !request.path.is_ascii() {
        warn!(id = conn.id(), "request path contains non-ASCII bytes; pass pre-encoded bytes instead");
    }
    if !request.query.as_deref().map(str::is_ascii).unwrap_or(true) {
        warn!(id = conn.id(), "request query contains non-ASCII bytes; pass pre-encoded bytes instead");
    }
}

/// run a hook callback, catching a panic instead of letting it unwind through the connection
/// task. a hook "throws" by panicking (Rust's equivalent of raising); on success this returns
/// `Ok(())`, on panic it returns `Err(message)` for the caller to fold into an
/// [`ErrorKind::InternalError`] terminal transition per the per-state-hook contract.
fn fire_hook(
    id: u64,
    conn: &Rc<RefCell<Connection>>,
    shared: &Rc<RefCell<Shared>>,
    select: impl FnOnce(&Callbacks) -> Option<Rc<dyn Fn(&CallbackCtx<'_>)>>,
) -> Result<(), String> {
    let hook = shared.borrow().callbacks.get(id).and_then(|cb| select(&cb));
    if let Some(hook) = hook {
        let ctx = CallbackCtx::new(id, conn, shared);
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(&ctx))).map_err(|payload| {
            warn!(id, "hook callback panicked");
            panic_message(payload)
        })?;
    }
    Ok(())
}

/// extract a displayable message from a caught panic payload, falling back to a generic message
/// for payloads that are neither a `&str` nor a `String` (the two types `panic!`'s formatting
/// machinery actually produces).
fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "hook callback panicked".to_string()
    }
}

fn invoke_terminal(
    id: u64,
    conn: &Rc<RefCell<Connection>>,
    shared: &Rc<RefCell<Shared>>,
    kind: ErrorKind,
    message: String,
) {
    let terminal = shared.borrow().callbacks.get(id).and_then(|cb| cb.terminal.clone());
    if let Some(terminal) = terminal {
        let ctx = CallbackCtx::terminal(id, conn, shared, kind, message);
        terminal(&ctx);
    }
}
