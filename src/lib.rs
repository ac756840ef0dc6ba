//! Low-level, non-blocking network I/O with a bidirectional filter-chain
//! pipeline.
//!
//! A [`Service`] binds or connects TCP/UDP sockets onto a pool of selector
//! loops (`selector`), each driving many [`Session`]s with operating-system
//! readiness notification. Application logic is expressed as a chain of
//! [`chain::Filter`]s terminating in a [`Handler`]; writes are queued
//! (`write_queue`), optionally encrypted (`tls`), and drained as the socket
//! becomes writable. An [`idle::IdleDetector`] tags sessions that go quiet in
//! either direction, and a one-shot [`future::Future`]/[`future::Promise`]
//! pair carries the result of a write or a connect back to the caller.
//!
//! Concrete filters, protocol framing, and application business logic are
//! out of scope (§1) — this crate is the engine they plug into.

pub mod attributes;
pub mod buffer;
pub mod chain;
pub mod error;
pub mod future;
pub mod handler;
pub mod idle;
pub mod message;
pub mod selector;
pub mod service;
pub mod session;
pub mod tls;
pub mod write_queue;

pub use attributes::{AttributeKey, Attributes};
pub use chain::{Filter, FilterChain, IdleStatus, ReadController, WriteController};
pub use error::{Error, Result};
pub use future::{Future, Promise};
pub use handler::Handler;
pub use message::Message;
pub use service::{Service, ServiceConfig};
pub use session::{Session, SessionId, SessionState};
pub use tls::TlsHelper;
