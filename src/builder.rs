//! driver configuration: request-level defaults and the per-request override set, assembled with
//! a consuming-self builder pattern (`set_*` methods returning `Self`, a final `finish` producing
//! the live object).

use std::time::Duration;

use bytes::Bytes;
use http::{Method, Version};

use crate::{
    callback::{Callbacks, CallbackStorage},
    codec::HeaderList,
    connection::RequestSpec,
    driver::Driver,
    host::{Host, Resolve, Resolver, Scheme},
    pool::SocketCache,
    timeout::TimeoutConfig,
};

/// request-level configuration inherited by every connection unless overridden in
/// [`RequestOptions`]. equivalent to the options bag in the external interface's `Driver::new`.
#[derive(Clone)]
pub(crate) struct Defaults {
    pub(crate) host: Host,
    pub(crate) scheme: Scheme,
    pub(crate) version: Version,
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) query: Option<String>,
    pub(crate) headers: HeaderList,
    pub(crate) body: Bytes,
    pub(crate) retries: u32,
    pub(crate) timeout_config: TimeoutConfig,
    pub(crate) callbacks: Callbacks,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            host: Host::single("localhost"),
            scheme: Scheme::Http,
            version: Version::HTTP_11,
            method: Method::GET,
            path: "/".into(),
            query: None,
            headers: HeaderList::new(),
            body: Bytes::new(),
            retries: 0,
            timeout_config: TimeoutConfig::new(),
            callbacks: Callbacks::default(),
        }
    }
}

/// builds a [`Driver`] and its paired [`CallbackStorage`]. every setter consumes and returns
/// `Self`, and `finish` is the only way to produce a usable pair.
pub struct DriverBuilder {
    defaults: Defaults,
    socket_cache: Option<SocketCache>,
    resolver: Resolver,
    account_for_signals: bool,
    keep_timeline: bool,
}

impl DriverBuilder {
    pub fn new() -> Self {
        Self {
            defaults: Defaults::default(),
            socket_cache: None,
            resolver: Resolver::default(),
            account_for_signals: false,
            keep_timeline: false,
        }
    }

    pub fn host(mut self, host: Host) -> Self {
        self.defaults.host = host;
        self
    }

    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.defaults.scheme = scheme;
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.defaults.version = version;
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.defaults.method = method;
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.defaults.path = path.into();
        self
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.defaults.query = Some(query.into());
        self
    }

    pub fn headers(mut self, headers: HeaderList) -> Self {
        self.defaults.headers = headers;
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.defaults.body = body.into();
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.defaults.retries = retries;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.defaults.timeout_config.connect_timeout = timeout;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.defaults.timeout_config.drain_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.defaults.timeout_config.request_timeout = timeout;
        self
    }

    pub fn init_callback(mut self, f: impl Fn(&crate::driver::CallbackCtx<'_>) + 'static) -> Self {
        self.defaults.callbacks.init = Some(std::rc::Rc::new(f));
        self
    }

    pub fn connecting_callback(mut self, f: impl Fn(&crate::driver::CallbackCtx<'_>) + 'static) -> Self {
        self.defaults.callbacks.connecting = Some(std::rc::Rc::new(f));
        self
    }

    pub fn connected_callback(mut self, f: impl Fn(&crate::driver::CallbackCtx<'_>) + 'static) -> Self {
        self.defaults.callbacks.connected = Some(std::rc::Rc::new(f));
        self
    }

    pub fn writing_callback(mut self, f: impl Fn(&crate::driver::CallbackCtx<'_>) + 'static) -> Self {
        self.defaults.callbacks.writing = Some(std::rc::Rc::new(f));
        self
    }

    pub fn reading_callback(mut self, f: impl Fn(&crate::driver::CallbackCtx<'_>) + 'static) -> Self {
        self.defaults.callbacks.reading = Some(std::rc::Rc::new(f));
        self
    }

    /// the terminal callback, invoked exactly once on entry to `USER_ACTION`.
    pub fn callback(mut self, f: impl Fn(&crate::driver::CallbackCtx<'_>) + 'static) -> Self {
        self.defaults.callbacks.terminal = Some(std::rc::Rc::new(f));
        self
    }

    pub fn socket_cache(mut self, cache: SocketCache) -> Self {
        self.socket_cache = Some(cache);
        self
    }

    pub fn resolver(mut self, resolver: impl Resolve + 'static) -> Self {
        self.resolver = Resolver::custom(resolver);
        self
    }

    pub fn account_for_signals(mut self, yes: bool) -> Self {
        self.account_for_signals = yes;
        self
    }

    pub fn keep_timeline(mut self, yes: bool) -> Self {
        self.keep_timeline = yes;
        self
    }

    pub fn finish(self) -> (Driver, CallbackStorage) {
        Driver::new(
            self.defaults,
            self.socket_cache,
            self.resolver,
            self.account_for_signals,
            self.keep_timeline,
        )
    }
}

impl Default for DriverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// per-request overrides, merged onto the driver's [`Defaults`] when a connection is created.
/// absent fields (`None`) fall back to the default; `callbacks` overrides on a per-slot basis via
/// [`Callbacks::merge_overrides`].
#[derive(Default)]
pub struct RequestOptions {
    pub(crate) host: Option<Host>,
    pub(crate) scheme: Option<Scheme>,
    pub(crate) version: Option<Version>,
    pub(crate) method: Option<Method>,
    pub(crate) path: Option<String>,
    pub(crate) query: Option<String>,
    pub(crate) headers: Option<HeaderList>,
    pub(crate) body: Option<Bytes>,
    pub(crate) retries: Option<u32>,
    pub(crate) timeout_config: Option<TimeoutConfig>,
    pub(crate) callbacks: Callbacks,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: Host) -> Self {
        self.host = Some(host);
        self
    }

    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = Some(scheme);
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn headers(mut self, headers: HeaderList) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn timeout_config(mut self, config: TimeoutConfig) -> Self {
        self.timeout_config = Some(config);
        self
    }

    pub fn callback(mut self, f: impl Fn(&crate::driver::CallbackCtx<'_>) + 'static) -> Self {
        self.callbacks.terminal = Some(std::rc::Rc::new(f));
        self
    }

    pub fn init_callback(mut self, f: impl Fn(&crate::driver::CallbackCtx<'_>) + 'static) -> Self {
        self.callbacks.init = Some(std::rc::Rc::new(f));
        self
    }

    pub fn connecting_callback(mut self, f: impl Fn(&crate::driver::CallbackCtx<'_>) + 'static) -> Self {
        self.callbacks.connecting = Some(std::rc::Rc::new(f));
        self
    }

    pub fn connected_callback(mut self, f: impl Fn(&crate::driver::CallbackCtx<'_>) + 'static) -> Self {
        self.callbacks.connected = Some(std::rc::Rc::new(f));
        self
    }

    pub fn writing_callback(mut self, f: impl Fn(&crate::driver::CallbackCtx<'_>) + 'static) -> Self {
        self.callbacks.writing = Some(std::rc::Rc::new(f));
        self
    }

    pub fn reading_callback(mut self, f: impl Fn(&crate::driver::CallbackCtx<'_>) + 'static) -> Self {
        self.callbacks.reading = Some(std::rc::Rc::new(f));
        self
    }
}

/// fold `options` onto `defaults`, producing the immutable-per-attempt request record together
/// with the resolved callback set for the new connection.
pub(crate) fn merge(defaults: &Defaults, options: RequestOptions) -> (RequestSpec, Callbacks) {
    let request = RequestSpec {
        version: options.version.unwrap_or(defaults.version),
        host: options.host.unwrap_or_else(|| defaults.host.clone()),
        scheme: options.scheme.unwrap_or(defaults.scheme),
        method: options.method.unwrap_or_else(|| defaults.method.clone()),
        path: options.path.unwrap_or_else(|| defaults.path.clone()),
        query: options.query.or_else(|| defaults.query.clone()),
        headers: options.headers.unwrap_or_else(|| defaults.headers.clone()),
        body: options.body.unwrap_or_else(|| defaults.body.clone()),
        retries: options.retries.unwrap_or(defaults.retries),
        timeout_config: options.timeout_config.unwrap_or(defaults.timeout_config),
    };
    let callbacks = defaults.callbacks.merge_overrides(&options.callbacks);
    (request, callbacks)
}
