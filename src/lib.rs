#![forbid(unsafe_code)]

//! `swarm-http`: a minimal, low-latency asynchronous HTTP/1.x client for fan-out workloads.
//!
//! A caller submits many requests, each potentially aimed at a pool of candidate hosts, and
//! drives them concurrently through an explicit per-connection state machine with retry,
//! timeout, and callback hooks. This is not a general-purpose user agent: it does not follow
//! redirects, negotiate proxies, or interpret cookies -- it speaks HTTP over TCP (optionally
//! TLS) one step above raw sockets.
//!
//! The entry point is [`DriverBuilder`], which produces a paired [`Driver`] and
//! [`CallbackStorage`]: the driver advances connections, the storage owns every closure a
//! caller attaches to one. Both halves must be kept alive together -- see the `callback` module
//! docs for why.

mod builder;
mod callback;
mod codec;
mod connection;
mod driver;
mod error;
mod host;
mod pool;
mod timeout;
mod tls;

pub use self::builder::{DriverBuilder, RequestOptions};
pub use self::callback::CallbackStorage;
pub use self::codec::HeaderList;
pub use self::connection::{
    Connection, ErrorEntry, ReinitOverrides, RequestSpec, ResponseRecord, State, TimelineEntry,
};
pub use self::driver::{CallbackCtx, Driver, RunUntil};
pub use self::error::{Error, ErrorKind, ParseError, ResolveError, TimeoutError};
pub use self::host::{Host, Resolve, Scheme, Target, TargetSpec};
pub use self::pool::{CacheKey, IdleSocket, SocketCache};
pub use self::timeout::TimeoutConfig;
pub use self::tls::Io;

// re-export the http crate so callers can build `Method`/`Version`/`HeaderMap` values without
// a direct dependency of their own.
pub use http;
// re-export bytes for the same reason -- request bodies and response bodies are `bytes::Bytes`.
pub use bytes;
