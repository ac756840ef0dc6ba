//! Per-connection identity, state, attributes, and public write/close contract.

pub mod id;
pub mod state;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use log::{error, warn};

use crate::attributes::{AttributeKey, Attributes};
use crate::buffer::CompositeBuf;
use crate::chain::FilterChain;
use crate::error::Error;
use crate::future::{self, Future};
use crate::handler::Handler;
use crate::message::Message;
use crate::service::Service;
use crate::write_queue::{WriteQueue, WriteRequest};

pub use id::SessionId;
pub use state::SessionState;

/// What kind of endpoint a session represents.
///
/// UDP sessions are a degenerate variant (§9 open question (b)): they never
/// reach `Securing`/`Secured` and have no dedicated per-connection socket —
/// the service's single bound `UdpSocket` is shared across every UDP session,
/// demultiplexed by peer address.
#[derive(Debug, Clone, Copy)]
pub enum Transport {
    /// A session backed by its own `TcpStream`.
    Tcp,
    /// A session backed by the service's shared `UdpSocket`, keyed by peer.
    Udp {
        /// The remote address this session exchanges datagrams with.
        peer: SocketAddr,
    },
}

impl Transport {
    /// True for sessions that may legally enter `Securing`/`Secured`.
    pub fn supports_tls(&self) -> bool {
        matches!(self, Transport::Tcp)
    }
}

/// The contract a session uses to ask its selector loop to do something.
///
/// Only the loop thread may mutate multiplexer registrations (§5); every
/// other thread reaches the loop through this handle, which is backed by the
/// loop's lock-free intake queues plus a wakeup.
pub trait LoopHandle: Send + Sync + fmt::Debug {
    /// Coalesced request to drain this session's write queue.
    fn request_flush(&self, session: SessionId);
    /// Request to close this session, optionally after flushing.
    fn request_close(&self, session: SessionId, immediate: bool);
    /// Request to close this session once its write queue drains, or after
    /// `linger_ticks` seconds elapse, whichever comes first (§6 `SO_LINGER`,
    /// §10.1 close-with-linger supplement).
    fn request_close_with_linger(&self, session: SessionId, linger_ticks: u64);
    /// Stop delivering read-readiness events for this session.
    fn request_suspend_read(&self, session: SessionId);
    /// Resume delivering read-readiness events for this session.
    fn request_resume_read(&self, session: SessionId);
    /// Stop delivering write-readiness events for this session.
    fn request_suspend_write(&self, session: SessionId);
    /// Resume delivering write-readiness events for this session.
    fn request_resume_write(&self, session: SessionId);
}

/// One logical connection: an addressable, bidirectional state machine.
pub struct Session {
    id: SessionId,
    service: Weak<Service>,
    transport: Transport,
    created_at: Instant,

    read_bytes: AtomicU64,
    written_bytes: AtomicU64,
    scheduled_write_bytes_hint: AtomicU64,
    last_read_tick: AtomicU64,
    last_write_tick: AtomicU64,

    attributes: Attributes,
    state: RwLock<SessionState>,
    secured: AtomicBool,
    read_suspended: AtomicBool,
    write_suspended: AtomicBool,

    write_queue: WriteQueue,
    chain: FilterChain,
    handler: Arc<dyn Handler>,
    loop_handle: RwLock<Option<Arc<dyn LoopHandle>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &*self.state.read().unwrap())
            .field("secured", &self.secured.load(Ordering::Relaxed))
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        service: Weak<Service>,
        transport: Transport,
        chain: FilterChain,
        handler: Arc<dyn Handler>,
    ) -> Arc<Session> {
        let session = Arc::new(Session {
            id,
            service,
            transport,
            created_at: Instant::now(),
            read_bytes: AtomicU64::new(0),
            written_bytes: AtomicU64::new(0),
            scheduled_write_bytes_hint: AtomicU64::new(0),
            last_read_tick: AtomicU64::new(0),
            last_write_tick: AtomicU64::new(0),
            attributes: Attributes::new(),
            state: RwLock::new(SessionState::Created),
            secured: AtomicBool::new(false),
            read_suspended: AtomicBool::new(false),
            write_suspended: AtomicBool::new(false),
            write_queue: WriteQueue::new(),
            chain,
            handler,
            loop_handle: RwLock::new(None),
        });
        session.chain.fire_session_created(&session);
        session
    }

    /// Builds a session with no owning service and no loop handle, for unit
    /// tests that only exercise the filter chain or write queue in isolation.
    #[cfg(any(test, feature = "test-support"))]
    pub fn standalone_for_test(service: &Arc<Service>) -> Session {
        Session {
            id: service.next_session_id(),
            service: Arc::downgrade(service),
            transport: Transport::Tcp,
            created_at: Instant::now(),
            read_bytes: AtomicU64::new(0),
            written_bytes: AtomicU64::new(0),
            scheduled_write_bytes_hint: AtomicU64::new(0),
            last_read_tick: AtomicU64::new(0),
            last_write_tick: AtomicU64::new(0),
            attributes: Attributes::new(),
            state: RwLock::new(SessionState::Connected),
            secured: AtomicBool::new(false),
            read_suspended: AtomicBool::new(false),
            write_suspended: AtomicBool::new(false),
            write_queue: WriteQueue::new(),
            chain: service.chain().clone(),
            handler: service.handler_arc(),
            loop_handle: RwLock::new(None),
        }
    }

    /// This session's unique identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The owning service, or `None` if it has already been dropped.
    pub fn service(&self) -> Option<Arc<Service>> {
        self.service.upgrade()
    }

    /// Which transport backs this session.
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// When this session was constructed.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    /// True once the TLS handshake has completed.
    pub fn is_secured(&self) -> bool {
        self.secured.load(Ordering::Relaxed)
    }

    /// Total bytes read from the wire so far. May be slightly stale.
    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    /// Total bytes written to the wire so far. May be slightly stale.
    pub fn written_bytes(&self) -> u64 {
        self.written_bytes.load(Ordering::Relaxed)
    }

    /// Queue depth in bytes not yet written to the kernel: the backpressure
    /// signal §4.4 leaves to the policy layer.
    pub fn scheduled_write_bytes(&self) -> u64 {
        self.write_queue.scheduled_bytes()
    }

    /// The filter chain snapshotted for this session at construction.
    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }

    pub(crate) fn handler(&self) -> &dyn Handler {
        self.handler.as_ref()
    }

    pub(crate) fn write_queue(&self) -> &WriteQueue {
        &self.write_queue
    }

    /// Reads a typed attribute.
    pub fn get_attribute<T: std::any::Any + Send + Sync + Clone>(
        &self,
        key: &AttributeKey<T>,
    ) -> Option<T> {
        self.attributes.get(key)
    }

    /// Writes a typed attribute, rejecting (at compile time) any value whose
    /// type does not match the key.
    pub fn set_attribute<T: std::any::Any + Send + Sync>(&self, key: &AttributeKey<T>, value: T) {
        self.attributes.set(key, value);
    }

    /// Attempts `from -> to`; on success updates state and, for `Secured`,
    /// the secured flag. On failure returns `Error::State` and leaves state
    /// unchanged.
    pub(crate) fn transition(&self, to: SessionState) -> Result<(), Error> {
        let mut state = self.state.write().unwrap();
        if !state.can_transition_to(to) {
            return Err(Error::State { from: *state, to });
        }
        *state = to;
        self.secured.store(to == SessionState::Secured, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn bind_loop_handle(&self, handle: Arc<dyn LoopHandle>) {
        *self.loop_handle.write().unwrap() = Some(handle);
    }

    pub(crate) fn loop_handle(&self) -> Option<Arc<dyn LoopHandle>> {
        self.loop_handle.read().unwrap().clone()
    }

    /// Records `amount` bytes just read and advances the read-idle clock.
    pub(crate) fn note_read(&self, amount: usize, tick: u64) {
        self.read_bytes.fetch_add(amount as u64, Ordering::Relaxed);
        self.last_read_tick.store(tick, Ordering::Relaxed);
    }

    /// Records `amount` bytes just written and advances the write-idle clock.
    pub(crate) fn note_write(&self, amount: usize, tick: u64) {
        self.written_bytes.fetch_add(amount as u64, Ordering::Relaxed);
        self.last_write_tick.store(tick, Ordering::Relaxed);
    }

    /// Fire-and-forget send. Silently discarded (with a logged error) if the
    /// session is `Closing`/`Closed`.
    pub fn write(&self, payload: impl Into<Message>) {
        if self.state().rejects_writes() {
            warn!(target: "session", "discarding write to closing/closed session {}", self.id);
            return;
        }
        self.chain.fire_message_writing(self, payload.into());
        self.request_flush();
    }

    /// Like [`Session::write`], but resolves the returned future once every
    /// byte of this payload has reached the kernel.
    ///
    /// The future is threaded through a thread-local slot consumed by
    /// [`Session::enqueue_write`]; a filter that defers write propagation to
    /// a different thread will not see it attached.
    pub fn write_with_future(&self, payload: impl Into<Message>) -> Future<()> {
        let (promise, future) = future::promise();
        if self.state().rejects_writes() {
            warn!(target: "session", "discarding write to closing/closed session {}", self.id);
            promise.fail(Error::State {
                from: self.state(),
                to: SessionState::Closing,
            });
            return future;
        }
        PENDING_COMPLETION.with(|cell| *cell.borrow_mut() = Some(promise));
        self.chain.fire_message_writing(self, payload.into());
        PENDING_COMPLETION.with(|cell| cell.borrow_mut().take());
        self.request_flush();
        future
    }

    /// Called by [`crate::chain::WriteController`] once a message has
    /// traversed every filter in the send direction.
    pub(crate) fn enqueue_write(&self, msg: Message) {
        let Some(payload) = into_composite_buf(msg) else {
            error!(target: "session", "non-byte message reached the write queue tail on session {}", self.id);
            return;
        };
        let completion = PENDING_COMPLETION.with(|cell| cell.borrow_mut().take());
        let request = match completion {
            Some(promise) => WriteRequest::with_completion(payload, promise),
            None => WriteRequest::new(payload),
        };
        self.write_queue.enqueue(request);
    }

    fn request_flush(&self) {
        if self.write_queue.mark_registered_for_write() {
            if let Some(handle) = self.loop_handle() {
                handle.request_flush(self.id);
            }
        }
    }

    /// Begins closing the session. If `immediate`, the write queue is
    /// flushed before the socket is actually torn down; otherwise pending
    /// writes are abandoned.
    pub fn close(&self, immediate: bool) -> Future<()> {
        let (promise, future) = future::promise();
        match self.transition(SessionState::Closing) {
            Ok(()) => {
                if let Some(handle) = self.loop_handle() {
                    handle.request_close(self.id, immediate);
                }
                promise.set(());
            }
            Err(err) => {
                if self.state() == SessionState::Closing || self.state() == SessionState::Closed {
                    // Already closing/closed: closing twice is not an error.
                    promise.set(());
                } else {
                    promise.fail(err);
                }
            }
        }
        future
    }

    /// Begins closing the session, giving its write queue up to `linger` to
    /// drain before the socket is torn down regardless (§6 `SO_LINGER`, §10.1
    /// close-with-linger supplement). The returned future resolves once the
    /// session actually reaches `Closed`, whichever of the two happens.
    ///
    /// Unlike [`Session::close`], whose `immediate` flush is a single
    /// best-effort drain attempt, this keeps draining across subsequent
    /// write-readiness events until the queue empties or the deadline ticks
    /// by, so a payload that doesn't fit in one socket write still has a
    /// chance to leave before teardown.
    pub fn close_with_linger(&self, linger: Duration) -> Future<()> {
        let (promise, future) = future::promise();
        match self.transition(SessionState::Closing) {
            Ok(()) => {
                let ticks = linger.as_secs().max(1);
                if let Some(handle) = self.loop_handle() {
                    handle.request_close_with_linger(self.id, ticks);
                }
                promise.set(());
            }
            Err(err) => {
                if self.state() == SessionState::Closing || self.state() == SessionState::Closed {
                    promise.set(());
                } else {
                    promise.fail(err);
                }
            }
        }
        future
    }

    /// Stops delivering read-readiness events until [`Session::resume_read`].
    pub fn suspend_read(&self) {
        self.read_suspended.store(true, Ordering::Relaxed);
        if let Some(handle) = self.loop_handle() {
            handle.request_suspend_read(self.id);
        }
    }

    /// Resumes delivering read-readiness events.
    pub fn resume_read(&self) {
        self.read_suspended.store(false, Ordering::Relaxed);
        if let Some(handle) = self.loop_handle() {
            handle.request_resume_read(self.id);
        }
    }

    /// Stops delivering write-readiness events until [`Session::resume_write`].
    pub fn suspend_write(&self) {
        self.write_suspended.store(true, Ordering::Relaxed);
        if let Some(handle) = self.loop_handle() {
            handle.request_suspend_write(self.id);
        }
    }

    /// Resumes delivering write-readiness events.
    pub fn resume_write(&self) {
        self.write_suspended.store(false, Ordering::Relaxed);
        if let Some(handle) = self.loop_handle() {
            handle.request_resume_write(self.id);
        }
    }

    /// True while reads are suspended.
    pub fn is_read_suspended(&self) -> bool {
        self.read_suspended.load(Ordering::Relaxed)
    }

    /// True while writes are suspended.
    pub fn is_write_suspended(&self) -> bool {
        self.write_suspended.load(Ordering::Relaxed)
    }
}

thread_local! {
    static PENDING_COMPLETION: std::cell::RefCell<Option<crate::future::Promise<()>>> =
        const { std::cell::RefCell::new(None) };
}

fn into_composite_buf(msg: Message) -> Option<CompositeBuf> {
    match msg.downcast::<CompositeBuf>() {
        Ok(buf) => return Some(buf),
        Err(m) => match m.downcast::<bytes::Bytes>() {
            Ok(bytes) => return Some(CompositeBuf::from_bytes(bytes)),
            Err(m) => match m.downcast::<Vec<u8>>() {
                Ok(v) => return Some(CompositeBuf::from_bytes(bytes::Bytes::from(v))),
                Err(m) => match m.downcast::<String>() {
                    Ok(s) => return Some(CompositeBuf::from_bytes(bytes::Bytes::from(s))),
                    Err(_) => {}
                },
            },
        },
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceConfig;

    struct NoopHandler;
    impl Handler for NoopHandler {}

    fn new_service() -> Arc<Service> {
        Service::new(ServiceConfig::default(), Arc::new(NoopHandler), FilterChain::empty())
    }

    #[test]
    fn ids_are_unique_across_two_sessions() {
        let service = new_service();
        let a = Session::standalone_for_test(&service);
        let b = Session::standalone_for_test(&service);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn write_to_closed_session_is_dropped_not_panicking() {
        let service = new_service();
        let session = Session::standalone_for_test(&service);
        session.transition(SessionState::Closing).unwrap();
        session.write(bytes::Bytes::from_static(b"x"));
        assert!(session.write_queue().is_empty());
    }

    #[test]
    fn illegal_transition_is_rejected_and_state_unchanged() {
        let service = new_service();
        let session = Session::standalone_for_test(&service);
        assert_eq!(session.state(), SessionState::Connected);
        let err = session.transition(SessionState::Created);
        assert!(err.is_err());
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn write_with_future_completes_once_drained() {
        let service = new_service();
        let session = Session::standalone_for_test(&service);
        let fut = session.write_with_future(bytes::Bytes::from_static(b"hi"));
        assert!(!fut.is_done());
        let emptied = session.write_queue().drain_with(|buf| Ok(buf.len()));
        assert!(emptied);
        assert!(fut.get().is_ok());
    }
}
