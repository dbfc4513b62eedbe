//! the [`Connection`] record: identity, configuration, current state, attempt counter, I/O
//! buffers, request/response and the error/timeline history, built around an explicit state
//! machine rather than a pooled tower-service connection.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Version};
use tokio::time::Instant;

use crate::{
    codec::HeaderList,
    error::ErrorKind,
    host::{Host, Scheme, Target},
    timeout::TimeoutConfig,
};

/// one node of the connection's state graph. modeled as a plain tagged enum: every invalid
/// `fd`/state combination the data model rules out is instead enforced procedurally by
/// [`crate::driver::drive_connection`], which only ever holds a socket on its stack during the
/// phases that correspond to these variants -- see the module docs there for why that is the
/// more natural Rust rendering of the invariant than embedding the socket in the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initialized,
    ResolveDns,
    Connecting,
    Connected,
    SslHandshake,
    Writing,
    Reading,
    UserAction,
    Completed,
}

/// one entry of the append-only `timeline`. only recorded when the driver/request was built
/// with `keep_timeline` enabled.
#[derive(Debug, Clone, Copy)]
pub struct TimelineEntry {
    pub state: State,
    pub at: Instant,
}

/// one entry of the append-only `errors` list. never cleared across retries.
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub kind: ErrorKind,
    pub message: String,
    pub target: Option<Target>,
    pub at: Instant,
}

/// the response built incrementally in `READING`. fields must not be read when the terminal
/// callback observed an `error_kind` other than [`ErrorKind::NoError`].
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub version: Version,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// immutable-per-attempt request record. request-level overrides from [`crate::builder::RequestOptions`]
/// are folded into this when a connection is created; a callback-triggered reinit produces a fresh one.
#[derive(Clone)]
pub struct RequestSpec {
    pub version: Version,
    pub host: Host,
    pub scheme: Scheme,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderList,
    pub body: Bytes,
    pub retries: u32,
    pub timeout_config: TimeoutConfig,
}

/// the decision a terminal callback (or reentrant driver call) leaves on a connection, applied by
/// the driver only after control returns from user code -- the cooperative-reentrancy pattern
/// from the design notes.
#[derive(Clone, Default)]
pub(crate) enum PendingAction {
    #[default]
    None,
    Retry,
    Reinit(Box<ReinitOverrides>),
    Drop,
}

/// overrides applied by `reinit_conn`. any field left `None` keeps the current request's value.
#[derive(Clone, Default)]
pub struct ReinitOverrides {
    pub host: Option<Host>,
    pub scheme: Option<Scheme>,
    pub method: Option<Method>,
    pub path: Option<String>,
    pub query: Option<Option<String>>,
    pub headers: Option<HeaderList>,
    pub body: Option<Bytes>,
}

pub struct Connection {
    id: u64,
    state: State,
    request: RequestSpec,
    target: Option<Target>,
    attempt: u32,
    attempts_left: u32,
    response: Option<ResponseRecord>,
    errors: Vec<ErrorEntry>,
    timeline: Vec<TimelineEntry>,
    keep_timeline: bool,
    pub(crate) pending_action: PendingAction,
}

impl Connection {
    pub(crate) fn new(id: u64, request: RequestSpec, keep_timeline: bool) -> Self {
        let attempts_left = request.retries;
        let mut conn = Self {
            id,
            state: State::Initialized,
            request,
            target: None,
            attempt: 0,
            attempts_left,
            response: None,
            errors: Vec::new(),
            timeline: Vec::new(),
            keep_timeline,
            pending_action: PendingAction::None,
        };
        conn.record_state(State::Initialized);
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub fn url(&self) -> String {
        match &self.target {
            Some(t) => format!(
                "{}://{}{}{}",
                if t.scheme.is_tls() { "https" } else { "http" },
                t,
                self.request.path,
                self.request
                    .query
                    .as_deref()
                    .map(|q| format!("?{q}"))
                    .unwrap_or_default()
            ),
            None => format!(
                "{}{}",
                self.request.path,
                self.request
                    .query
                    .as_deref()
                    .map(|q| format!("?{q}"))
                    .unwrap_or_default()
            ),
        }
    }

    pub fn request(&self) -> &RequestSpec {
        &self.request
    }

    pub fn response(&self) -> Option<&ResponseRecord> {
        self.response.as_ref()
    }

    pub fn attempts_left(&self) -> u32 {
        self.attempts_left
    }

    pub fn errors(&self) -> &[ErrorEntry] {
        &self.errors
    }

    pub fn last_error(&self) -> Option<&ErrorEntry> {
        self.errors.last()
    }

    pub fn timeline(&self) -> &[TimelineEntry] {
        &self.timeline
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn set_target(&mut self, target: Target) {
        self.target = Some(target);
    }

    pub(crate) fn set_response(&mut self, response: ResponseRecord) {
        self.response = Some(response);
    }

    /// transition into a new state, recording it on the timeline when enabled. called by the
    /// driver on entry to every state, before any I/O work for that state begins.
    pub(crate) fn record_state(&mut self, state: State) {
        self.state = state;
        if self.keep_timeline {
            self.timeline.push(TimelineEntry {
                state,
                at: Instant::now(),
            });
        }
    }

    pub(crate) fn push_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.errors.push(ErrorEntry {
            kind,
            message: message.into(),
            target: self.target.clone(),
            at: Instant::now(),
        });
    }

    /// drive the retry branch: abandon the current attempt, decrement `attempts_left`, and
    /// report whether a new attempt should be made. does not itself transition state -- the
    /// caller moves back to `INITIALIZED` (or on to `USER_ACTION` carrying the failure that
    /// exhausted the budget, once this returns `false`) and is responsible for rearming the
    /// per-attempt deadlines it holds locally.
    pub(crate) fn consume_attempt(&mut self) -> bool {
        self.response = None;
        self.target = None;
        let had_budget = self.attempts_left > 0;
        if had_budget {
            self.attempts_left -= 1;
        }
        self.attempt += 1;
        had_budget
    }

    /// reset for a fresh attempt as part of `reinit_conn`: attempt counter and `attempts_left`
    /// both reset to the configured retry budget, and the request record is replaced wholesale.
    /// `errors` and `timeline` are intentionally left untouched. the caller rebuilds its local
    /// deadlines from the new `timeout_config`.
    pub(crate) fn reinit(&mut self, request: RequestSpec) {
        self.attempts_left = request.retries;
        self.attempt = 0;
        self.response = None;
        self.target = None;
        self.request = request;
    }

    pub(crate) fn apply_overrides(&mut self, overrides: ReinitOverrides) {
        let mut request = self.request.clone();
        if let Some(host) = overrides.host {
            request.host = host;
        }
        if let Some(scheme) = overrides.scheme {
            request.scheme = scheme;
        }
        if let Some(method) = overrides.method {
            request.method = method;
        }
        if let Some(path) = overrides.path {
            request.path = path;
        }
        if let Some(query) = overrides.query {
            request.query = query;
        }
        if let Some(headers) = overrides.headers {
            request.headers = headers;
        }
        if let Some(body) = overrides.body {
            request.body = body;
        }
        self.reinit(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> RequestSpec {
        RequestSpec {
            version: Version::HTTP_11,
            host: Host::single("127.0.0.1:1"),
            scheme: Scheme::Http,
            method: Method::GET,
            path: "/".into(),
            query: None,
            headers: HeaderList::new(),
            body: Bytes::new(),
            retries: 2,
            timeout_config: TimeoutConfig::new(),
        }
    }

    #[test]
    fn test_consume_attempt_decrements_and_resets() {
        let mut conn = Connection::new(1, spec(), false);
        assert_eq!(conn.attempts_left(), 2);
        assert!(conn.consume_attempt());
        assert_eq!(conn.attempts_left(), 1);
        assert!(conn.consume_attempt());
        assert_eq!(conn.attempts_left(), 0);
        assert!(!conn.consume_attempt());
        assert_eq!(conn.attempts_left(), 0);
    }

    #[test]
    fn test_reinit_resets_attempts_left_but_keeps_errors() {
        let mut conn = Connection::new(1, spec(), false);
        conn.push_error(ErrorKind::ConnectError, "boom");
        conn.consume_attempt();
        conn.consume_attempt();
        assert_eq!(conn.attempts_left(), 0);

        conn.reinit(spec());
        assert_eq!(conn.attempts_left(), 2);
        assert_eq!(conn.errors().len(), 1);
    }

    #[test]
    fn test_timeline_disabled_by_default_records_nothing() {
        let mut conn = Connection::new(1, spec(), false);
        conn.record_state(State::Connecting);
        assert!(conn.timeline().is_empty());
    }

    #[test]
    fn test_timeline_enabled_records_entries() {
        let mut conn = Connection::new(1, spec(), true);
        conn.record_state(State::Connecting);
        conn.record_state(State::Connected);
        let states: Vec<_> = conn.timeline().iter().map(|e| e.state).collect();
        assert_eq!(states, vec![State::Initialized, State::Connecting, State::Connected]);
    }
}
