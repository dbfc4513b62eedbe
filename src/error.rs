//! strongly typed library error and the stable error taxonomy exposed to callbacks.

use std::{error, fmt, io, str};

/// stable error kind surfaced to hook and terminal callbacks.
///
/// kinds classify into recoverable (drive the retry branch while attempts remain)
/// and terminal (drive directly to `USER_ACTION`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    NoError,
    ConnectError,
    ReadError,
    WriteError,
    RequestError,
    ResponseError,
    Timeout,
    TlsError,
    InternalError,
    TerminalError,
    RetryLimit,
}

impl ErrorKind {
    /// whether this kind drives the retry branch (true) or goes straight to `USER_ACTION` (false).
    pub const fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::ConnectError | Self::ReadError | Self::WriteError | Self::Timeout | Self::TlsError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoError => "no error",
            Self::ConnectError => "connect error",
            Self::ReadError => "read error",
            Self::WriteError => "write error",
            Self::RequestError => "request error",
            Self::ResponseError => "response error",
            Self::Timeout => "timeout",
            Self::TlsError => "tls error",
            Self::InternalError => "internal error",
            Self::TerminalError => "terminal error",
            Self::RetryLimit => "retry limit reached",
        };
        f.write_str(s)
    }
}

/// library error type. constructed internally and surfaced through [`crate::connection::ErrorEntry`]
/// as `(kind, message)` pairs rather than returned from the public driver API directly, since the
/// driver never fails a `run` call because of a single connection's trouble.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    Io(io::Error),
    Std(Box<dyn error::Error + Send + Sync>),
    Parse(ParseError),
    Timeout(TimeoutError),
    Resolve(ResolveError),
    UnsupportedResponse(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Std(e) => write!(f, "{e}"),
            Self::Parse(e) => write!(f, "parse error: {e}"),
            Self::Timeout(e) => write!(f, "{e}"),
            Self::Resolve(e) => write!(f, "{e}"),
            Self::UnsupportedResponse(reason) => write!(f, "unsupported response: {reason}"),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Self {
        Self::Parse(ParseError::Status(e))
    }
}

impl From<str::Utf8Error> for Error {
    fn from(e: str::Utf8Error) -> Self {
        Self::Parse(ParseError::Encoding(e))
    }
}

impl From<http::header::InvalidHeaderName> for Error {
    fn from(e: http::header::InvalidHeaderName) -> Self {
        Self::Parse(ParseError::HeaderName(e))
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Self::Parse(ParseError::HeaderValue(e))
    }
}

/// maps an [`Error`] to the stable taxonomy kind used by callbacks, classifying it as
/// recoverable or terminal along the way. the mapping is purely a function of the error
/// shape, not of the state the connection was in when it occurred -- the driver supplies
/// that context separately when appending to the connection's error timeline.
impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::ConnectError,
            Self::Std(_) => ErrorKind::InternalError,
            Self::Parse(_) => ErrorKind::ResponseError,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Resolve(_) => ErrorKind::ConnectError,
            Self::UnsupportedResponse(_) => ErrorKind::ResponseError,
        }
    }
}

#[derive(Debug)]
pub enum ParseError {
    Status(httparse::Error),
    Encoding(str::Utf8Error),
    HeaderName(http::header::InvalidHeaderName),
    HeaderValue(http::header::InvalidHeaderValue),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(e) => write!(f, "malformed status line or headers: {e}"),
            Self::Encoding(e) => write!(f, "{e}"),
            Self::HeaderName(e) => write!(f, "{e}"),
            Self::HeaderValue(e) => write!(f, "{e}"),
        }
    }
}

impl error::Error for ParseError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutError {
    Connect,
    Drain,
    Request,
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("connect timeout elapsed"),
            Self::Drain => f.write_str("drain (write) timeout elapsed"),
            Self::Request => f.write_str("request timeout elapsed"),
        }
    }
}

impl error::Error for TimeoutError {}

impl From<TimeoutError> for Error {
    fn from(e: TimeoutError) -> Self {
        Self::Timeout(e)
    }
}

#[derive(Debug)]
pub struct ResolveError {
    host: String,
}

impl ResolveError {
    pub(crate) fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host: {} could not be resolved to a socket address", self.host)
    }
}

impl error::Error for ResolveError {}

impl From<ResolveError> for Error {
    fn from(e: ResolveError) -> Self {
        Self::Resolve(e)
    }
}
