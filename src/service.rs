//! Server/client façade: configuration, bind/connect, and the id → session map.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::info;
use rustls::{ClientConfig, ServerConfig};

use crate::chain::FilterChain;
use crate::future::Future;
use crate::handler::Handler;
use crate::selector::strategy::RoundRobin;
use crate::selector::SelectorPool;
use crate::session::id::SessionIdGenerator;
use crate::session::{Session, SessionId};
use crate::tls::TlsHelper;

/// Programmatic, validated configuration for a [`Service`].
///
/// Mirrors the knobs named in §6: keep-alive, reuse-address, TCP-no-delay,
/// socket buffer sizes, traffic class, `SO_LINGER`, OOB inline, per-direction
/// idle timeouts, and an optional TLS context. There is no file or
/// environment-variable form — building one programmatically and calling
/// [`ServiceConfig::validate`] (invoked automatically by [`Service::new`]) is
/// the only supported path: a plain, programmatically-built config struct
/// rather than a file or environment-variable form.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Enables `SO_KEEPALIVE` on accepted/connected sockets.
    pub keep_alive: bool,
    /// Enables `SO_REUSEADDR` before binding.
    pub reuse_address: bool,
    /// Enables `TCP_NODELAY` (disables Nagle's algorithm).
    pub tcp_no_delay: bool,
    /// Requested kernel send-buffer size in bytes, if any.
    pub send_buffer_size: Option<usize>,
    /// Requested kernel receive-buffer size in bytes, if any.
    pub recv_buffer_size: Option<usize>,
    /// IP traffic class / type-of-service byte.
    pub traffic_class: Option<u8>,
    /// `SO_LINGER` duration; also bounds the close-with-linger flush.
    pub linger: Option<Duration>,
    /// Whether out-of-band data is delivered inline with the ordinary stream.
    pub oob_inline: bool,
    /// Read-idle timeout. `None` disables read-idle tracking.
    pub read_idle_timeout: Option<Duration>,
    /// Write-idle timeout. `None` disables write-idle tracking.
    pub write_idle_timeout: Option<Duration>,
    /// TLS server context; `Some` makes every accepted session Securing.
    pub tls: Option<Arc<ServerConfig>>,
    /// TLS client context; `Some` makes every `Service::connect` session
    /// start Securing instead of Connected.
    pub tls_client: Option<Arc<ClientConfig>>,
    /// Deadline after which a pending `connect` future fails with `Timeout`.
    pub connect_timeout: Duration,
    /// Number of selector loops the service spreads sessions across.
    pub loop_count: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            keep_alive: true,
            reuse_address: true,
            tcp_no_delay: true,
            send_buffer_size: None,
            recv_buffer_size: None,
            traffic_class: None,
            linger: None,
            oob_inline: false,
            read_idle_timeout: None,
            write_idle_timeout: None,
            tls: None,
            tls_client: None,
            connect_timeout: Duration::from_secs(10),
            loop_count: 1,
        }
    }
}

impl ServiceConfig {
    /// Rejects configurations that cannot be honored: a zero loop count, or a
    /// connect timeout of zero (which could never succeed).
    fn validate(&self) -> Result<(), crate::error::Error> {
        if self.loop_count == 0 {
            return Err(crate::error::Error::Protocol(
                "loop_count must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(crate::error::Error::Protocol(
                "connect_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Read-idle timeout in whole seconds, as the [`crate::idle::IdleDetector`]
    /// wants it. Sub-second timeouts round up so they still fire.
    pub(crate) fn read_idle_secs(&self) -> u64 {
        duration_to_ticks(self.read_idle_timeout)
    }

    /// Write-idle timeout in whole seconds.
    pub(crate) fn write_idle_secs(&self) -> u64 {
        duration_to_ticks(self.write_idle_timeout)
    }
}

fn duration_to_ticks(d: Option<Duration>) -> u64 {
    match d {
        None => 0,
        Some(d) if d.is_zero() => 0,
        Some(d) => d.as_secs().max(1),
    }
}

/// The server/client façade: owns configuration, the handler, the filter
/// chain snapshot new sessions are built from, and the id → session map.
///
/// A `Service` does not itself own a selector loop — binding/connecting
/// registers sessions onto loops owned by [`crate::selector::SelectorLoop`]s,
/// which the service spawns and balances across per [`ServiceConfig::loop_count`].
pub struct Service {
    config: ServiceConfig,
    handler: Arc<dyn Handler>,
    #[cfg(any(test, feature = "test-support"))]
    handler_any: Arc<dyn std::any::Any + Send + Sync>,
    chain: FilterChain,
    sessions: DashMap<SessionId, Arc<Session>>,
    session_count: AtomicUsize,
    id_generator: SessionIdGenerator,
    pool: SelectorPool,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("sessions", &self.session_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Service {
    /// Builds a service. Panics only if `config` fails validation — this is a
    /// caller programming error, not a runtime condition.
    ///
    /// Takes the handler as a concrete `Arc<H>` rather than an already
    /// type-erased `Arc<dyn Handler>` so that [`Service::handler_for_test`]
    /// can keep a second, `Any`-erased handle captured before `H` is erased
    /// to `dyn Handler` — downcasting a trait object back to its concrete
    /// type needs that handle to exist, and `Handler` has no `Any` supertrait
    /// of its own (adding one would force every implementor to be `'static`,
    /// which they already are, but would also leak a test-only concern into
    /// the public trait every application implements).
    pub fn new<H: Handler>(config: ServiceConfig, handler: Arc<H>, chain: FilterChain) -> Arc<Service> {
        config.validate().expect("invalid service configuration");
        #[cfg(any(test, feature = "test-support"))]
        let handler_any: Arc<dyn std::any::Any + Send + Sync> = handler.clone();
        let pool = SelectorPool::new(
            config.loop_count,
            Arc::new(RoundRobin::new()),
            config.read_idle_secs(),
            config.write_idle_secs(),
        )
        .expect("failed to start selector loops");
        Arc::new(Service {
            config,
            handler,
            #[cfg(any(test, feature = "test-support"))]
            handler_any,
            chain,
            sessions: DashMap::new(),
            session_count: AtomicUsize::new(0),
            id_generator: SessionIdGenerator::new(),
            pool,
        })
    }

    /// This service's configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The filter chain every new session is snapshotted from.
    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }

    pub(crate) fn handler_arc(&self) -> Arc<dyn Handler> {
        self.handler.clone()
    }

    /// Downcasts the installed handler for assertions in tests that need to
    /// inspect state a `Handler` recorded.
    #[cfg(any(test, feature = "test-support"))]
    pub fn handler_for_test<T: std::any::Any + Send + Sync>(&self) -> Arc<T> {
        Arc::downcast(self.handler_any.clone())
            .unwrap_or_else(|_| panic!("handler is not of the requested type"))
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        self.id_generator.next()
    }

    /// Number of sessions currently registered with this service. May be
    /// slightly stale, like every other statistic in this crate (§5).
    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::Relaxed)
    }

    /// Registers a freshly accepted/connected session, bumping the
    /// per-service session count. Called by the selector loop once a session
    /// has been assigned to it.
    pub(crate) fn track(&self, session: Arc<Session>) {
        self.sessions.insert(session.id(), session);
        self.session_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes a session from the service map, e.g. once `sessionClosed` has
    /// fired. Returns the removed session, if it was still present.
    pub(crate) fn untrack(&self, id: SessionId) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(&id).map(|(_, session)| session);
        if removed.is_some() {
            self.session_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Looks up a live session by id.
    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Binds a listening socket on `addr`, fanning accepted sessions across
    /// this service's selector loops. Returns the address actually bound
    /// (resolving a requested `:0` ephemeral port); readiness registration
    /// happens asynchronously on the owning loop's thread, but the bind
    /// itself, and so the returned address, are settled before this returns.
    pub fn bind(self: &Arc<Self>, addr: SocketAddr) -> io::Result<SocketAddr> {
        info!(target: "service", "binding {addr}");
        self.pool.bind(addr, self)
    }

    /// Binds a UDP socket on `addr`. Every distinct peer address becomes its
    /// own degenerate session sharing this one socket (§10.1).
    pub fn bind_udp(self: &Arc<Self>, addr: SocketAddr) -> io::Result<SocketAddr> {
        info!(target: "service", "binding udp {addr}");
        self.pool.bind_udp(addr, self)
    }

    /// Cancels every listening/datagram socket this service has bound. A
    /// service with nothing bound is a no-op.
    pub fn unbind(self: &Arc<Self>) -> io::Result<()> {
        self.pool.unbind(self)
    }

    /// Initiates an outbound connection. The returned future resolves once
    /// the session has been accepted by a selector loop and registered
    /// (`Connected`, or `Securing` if this service carries a TLS client
    /// context); it fails if the connect itself or the registration fails.
    ///
    /// Binding the actual `mio::net::TcpStream` and registering it with a
    /// loop is the selector module's job (`SelectorLoop::drain_connect`);
    /// this method exists on `Service` so callers never construct a loop
    /// themselves, matching §6's "Service: ... connect(remote, local?)".
    pub fn connect(self: &Arc<Self>, remote: SocketAddr, local: Option<SocketAddr>) -> Future<Arc<Session>> {
        info!(target: "session", "connect requested to {remote}");
        let tls = match &self.config.tls_client {
            Some(cfg) => match TlsHelper::client(cfg.clone(), server_name_for(remote)) {
                Ok(helper) => Some(helper),
                Err(err) => {
                    let (promise, future) = crate::future::promise();
                    promise.fail(crate::error::Error::Tls(err));
                    return future;
                }
            },
            None => None,
        };
        self.pool.connect(remote, local, self, tls)
    }
}

/// Derives the SNI server name a TLS client handshake presents, from the
/// connect target's bare IP address (no hostname travels alongside a
/// `SocketAddr`). An IP literal is never valid DNS-name syntax, so this goes
/// through `ServerName::IpAddress` rather than stringifying the address and
/// hoping it parses as a hostname.
fn server_name_for(remote: SocketAddr) -> rustls::pki_types::ServerName<'static> {
    rustls::pki_types::ServerName::IpAddress(remote.ip().into())
}
