//! caller-provided socket cache for keep-alive reuse.
//!
//! the cache is a plain caller-owned map keyed by `(process id, host, port, scheme)`, with no
//! capacity bound and no internal expiry -- eviction is the caller's responsibility. the driver
//! only ever inserts on a clean keep-alive completion and removes on reuse or explicit purge.

use std::collections::HashMap;

use crate::{host::Scheme, tls::Io};

/// key identifying a reusable idle socket. `pid` disambiguates sockets across process forks,
/// even though a single-process `Driver` only ever inserts its own pid.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub pid: u32,
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
}

impl CacheKey {
    pub(crate) fn new(host: impl Into<String>, port: u16, scheme: Scheme) -> Self {
        Self {
            pid: std::process::id(),
            host: host.into(),
            port,
            scheme,
        }
    }
}

/// an idle, keep-alive-capable socket together with whatever TLS state (if any) is attached to it.
pub struct IdleSocket {
    pub(crate) io: Io,
}

impl IdleSocket {
    pub(crate) fn new(io: Io) -> Self {
        Self { io }
    }
}

/// caller-owned, opt-in socket cache. a [`Driver`](crate::driver::Driver) built without one
/// never attempts reuse and always closes sockets on completion.
#[derive(Default)]
pub struct SocketCache {
    idle: HashMap<CacheKey, Vec<IdleSocket>>,
}

impl SocketCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// remove and return one idle socket for `key`, if any is cached.
    pub(crate) fn take(&mut self, key: &CacheKey) -> Option<IdleSocket> {
        let sockets = self.idle.get_mut(key)?;
        let socket = sockets.pop();
        if sockets.is_empty() {
            self.idle.remove(key);
        }
        socket
    }

    /// insert a socket as reusable. only called after a clean keep-alive completion.
    pub(crate) fn put(&mut self, key: CacheKey, socket: IdleSocket) {
        self.idle.entry(key).or_default().push(socket);
    }

    /// number of idle sockets currently cached, across all keys. exposed for tests and caller
    /// introspection/eviction policies.
    pub fn len(&self) -> usize {
        self.idle.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// drop every cached socket for `key`, e.g. in response to caller-driven eviction.
    pub fn purge(&mut self, key: &CacheKey) {
        self.idle.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CacheKey {
        CacheKey::new("example.com", 80, Scheme::Http)
    }

    #[test]
    fn test_cache_round_trip() {
        let mut cache = SocketCache::new();
        assert!(cache.take(&key()).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_cache_purge() {
        let mut cache = SocketCache::new();
        cache.purge(&key());
        assert!(cache.is_empty());
    }
}
