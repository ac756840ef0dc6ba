//! The application-level tail sink for the filter chain.
//!
//! A [`Handler`] is the business logic the engine hands decoded messages to
//! once every filter in the receive direction has run (or immediately, on an
//! empty chain). It is out of scope for this crate in the sense that its
//! implementation is entirely the embedding application's concern; the only
//! contract the engine depends on is this trait.

use crate::chain::IdleStatus;
use crate::error::Error;
use crate::message::Message;
use crate::session::Session;

/// Lifecycle and message sink invoked at the read-direction tail of the
/// filter chain.
///
/// All methods default to a no-op so an application only implements the
/// callbacks it cares about.
pub trait Handler: Send + Sync + 'static {
    /// Invoked once, synchronously, at session construction.
    fn session_created(&self, _session: &Session) {}

    /// Invoked once the session is registered with a selector loop and ready
    /// for I/O.
    fn session_opened(&self, _session: &Session) {}

    /// Invoked once, after the session has been removed from its service.
    fn session_closed(&self, _session: &Session) {}

    /// Invoked by the idle detector when `session` crosses a read-idle or
    /// write-idle threshold.
    fn session_idle(&self, _session: &Session, _status: IdleStatus) {}

    /// Invoked with the final message once it has traversed every filter in
    /// the receive direction.
    fn message_received(&self, _session: &Session, _message: Message) {}

    /// Invoked when a filter (or the chain dispatcher itself, for a caught
    /// panic) raises an exception that reaches the tail unhandled.
    fn exception_caught(&self, _session: &Session, _cause: Error) {}
}
