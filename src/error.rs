//! Error taxonomy shared by every component of the engine.

use std::io;

/// Errors produced by the engine.
///
/// Filter-raised [`Error::Protocol`] and panics caught by the chain dispatcher are
/// funnelled back through `exceptionCaught` (see [`crate::chain`]) rather than
/// returned here; this enum covers the errors that are surfaced synchronously to a
/// caller or that close a session outright.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// OS-level I/O failure. Closes the session that produced it.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// TLS handshake or decryption failure. Closes the session that produced it.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// Raised by a filter. Policy for what happens next is filter-defined.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An illegal state transition, or use of a session after it has closed.
    #[error("illegal state transition from {from:?} to {to:?}")]
    State {
        /// The state the session was in when the transition was attempted.
        from: crate::session::SessionState,
        /// The state that was rejected.
        to: crate::session::SessionState,
    },

    /// Resolution of a cancelled [`crate::future::Future`].
    #[error("operation cancelled")]
    Cancelled,

    /// Resolution of [`crate::future::Future::get_timeout`] when the deadline elapses.
    #[error("operation timed out")]
    Timeout,
}

/// Convenience alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
