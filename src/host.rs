//! target selection: turning a request's `host` option into a concrete `(host, ip, port, scheme)`
//! tuple for a given attempt, and resolving hostnames to socket addresses.

use core::future::Future;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
};

use crate::error::{Error, ResolveError};

/// network scheme a target is reached over. only plain TCP and TLS-over-TCP are modeled;
/// proxies and other transports are out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    pub const fn is_tls(self) -> bool {
        matches!(self, Self::Https)
    }
}

/// a single candidate target for a connection attempt.
#[derive(Debug, Clone)]
pub struct Target {
    pub host: String,
    pub addr: SocketAddr,
    pub port: u16,
    pub scheme: Scheme,
}

impl core::fmt::Display for Target {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// a callback-produced target, before DNS resolution. mirrors [`Target`] minus the resolved
/// `SocketAddr`, which `Host::Callable` closures are not required to supply.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub host: String,
    pub port: Option<u16>,
    pub scheme: Scheme,
}

impl TargetSpec {
    pub fn new(host: impl Into<String>, scheme: Scheme) -> Self {
        Self {
            host: host.into(),
            port: None,
            scheme,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

/// the `host` option of a request: a single address, a round-robin list, or a callable invoked
/// once per attempt. the cursor (attempt index) advances only when a *new* attempt starts, never
/// across retries of the exact same target.
#[derive(Clone)]
pub enum Host {
    Single(String),
    List(Vec<String>),
    Callable(Arc<dyn Fn(u32) -> TargetSpec + Send + Sync>),
}

impl Host {
    pub fn single(host: impl Into<String>) -> Self {
        Self::Single(host.into())
    }

    pub fn list<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::List(hosts.into_iter().map(Into::into).collect())
    }

    pub fn callable<F>(f: F) -> Self
    where
        F: Fn(u32) -> TargetSpec + Send + Sync + 'static,
    {
        Self::Callable(Arc::new(f))
    }

    /// produce the (unresolved) spec for the `attempt`th connection attempt (0-indexed), cycling
    /// round-robin through a host list.
    pub(crate) fn spec_for_attempt(&self, attempt: u32, default_scheme: Scheme) -> TargetSpec {
        match self {
            Self::Single(host) => split_host_port(host, default_scheme),
            Self::List(hosts) => {
                let idx = (attempt as usize) % hosts.len().max(1);
                split_host_port(&hosts[idx], default_scheme)
            }
            Self::Callable(f) => f(attempt),
        }
    }
}

impl core::fmt::Debug for Host {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Single(h) => f.debug_tuple("Single").field(h).finish(),
            Self::List(hs) => f.debug_tuple("List").field(hs).finish(),
            Self::Callable(_) => f.write_str("Callable(..)"),
        }
    }
}

fn split_host_port(host: &str, default_scheme: Scheme) -> TargetSpec {
    match host.rsplit_once(':') {
        Some((h, p)) if p.parse::<u16>().is_ok() => TargetSpec::new(h, default_scheme).with_port(p.parse().unwrap()),
        _ => TargetSpec::new(host, default_scheme),
    }
}

/// DNS resolution hook. the built-in [`Resolver::Std`] variant resolves via a blocking task;
/// no async resolver ships by default -- this trait is the integration point for one.
pub trait Resolve: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> impl Future<Output = Result<Vec<SocketAddr>, Error>> + Send;
}

pub(crate) enum Resolver {
    Std,
    Custom(Box<dyn ResolveDyn>),
}

impl Resolver {
    pub(crate) fn custom(resolver: impl Resolve + 'static) -> Self {
        Self::Custom(Box::new(resolver))
    }

    pub(crate) async fn resolve(&self, spec: &TargetSpec) -> Result<Vec<Target>, Error> {
        let port = spec.port.unwrap_or(spec.scheme.default_port());

        // a literal IP address does not need resolution -- skip straight to a single target.
        if let Ok(addr) = format!("{}:{port}", spec.host).parse::<SocketAddr>() {
            return Ok(vec![Target {
                host: spec.host.clone(),
                addr,
                port,
                scheme: spec.scheme,
            }]);
        }

        let addrs = match self {
            Self::Std => {
                let host = spec.host.clone();
                tokio::task::spawn_blocking(move || (host.as_str(), port).to_socket_addrs())
                    .await
                    .expect("resolver blocking task panicked")?
                    .collect::<Vec<_>>()
            }
            Self::Custom(resolver) => resolver.resolve_dyn(&spec.host, port).await?,
        };

        if addrs.is_empty() {
            return Err(ResolveError::new(spec.host.clone()).into());
        }

        Ok(addrs
            .into_iter()
            .map(|addr| Target {
                host: spec.host.clone(),
                addr,
                port,
                scheme: spec.scheme,
            })
            .collect())
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::Std
    }
}

pub(crate) trait ResolveDyn: Send + Sync {
    fn resolve_dyn<'s, 'h>(
        &'s self,
        host: &'h str,
        port: u16,
    ) -> core::pin::Pin<Box<dyn Future<Output = Result<Vec<SocketAddr>, Error>> + Send + 'h>>
    where
        's: 'h;
}

impl<R> ResolveDyn for R
where
    R: Resolve,
{
    fn resolve_dyn<'s, 'h>(
        &'s self,
        host: &'h str,
        port: u16,
    ) -> core::pin::Pin<Box<dyn Future<Output = Result<Vec<SocketAddr>, Error>> + Send + 'h>>
    where
        's: 'h,
    {
        Box::pin(self.resolve(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        let spec = split_host_port("example.com", Scheme::Http);
        assert_eq!(spec.host, "example.com");
        assert_eq!(spec.port, None);

        let spec = split_host_port("example.com:8080", Scheme::Http);
        assert_eq!(spec.host, "example.com");
        assert_eq!(spec.port, Some(8080));

        let spec = split_host_port("example.com:not-a-port", Scheme::Http);
        assert_eq!(spec.host, "example.com:not-a-port");
        assert_eq!(spec.port, None);
    }

    #[test]
    fn test_host_list_round_robin() {
        let host = Host::list(["a:1", "b:2", "c:3"]);
        assert_eq!(host.spec_for_attempt(0, Scheme::Http).host, "a");
        assert_eq!(host.spec_for_attempt(1, Scheme::Http).host, "b");
        assert_eq!(host.spec_for_attempt(2, Scheme::Http).host, "c");
        assert_eq!(host.spec_for_attempt(3, Scheme::Http).host, "a");
    }
}
