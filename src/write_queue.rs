//! Per-session FIFO of pending writes, with coalesced flush registration.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::buffer::CompositeBuf;
use crate::error::Error;
use crate::future::Promise;

/// A single queued send: a byte payload plus an optional completion.
pub struct WriteRequest {
    payload: CompositeBuf,
    completion: Option<Promise<()>>,
}

impl WriteRequest {
    /// Wraps a payload with no completion listener (fire-and-forget).
    pub fn new(payload: CompositeBuf) -> Self {
        WriteRequest {
            payload,
            completion: None,
        }
    }

    /// Wraps a payload whose promise is resolved once every byte has been
    /// written to the kernel.
    pub fn with_completion(payload: CompositeBuf, completion: Promise<()>) -> Self {
        WriteRequest {
            payload,
            completion: Some(completion),
        }
    }

    /// Remaining unwritten bytes of this request.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True once every byte has been advanced past.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Splits the request into its raw payload and completion, for a drain
    /// path (TLS) that must hold the promise open past the point where the
    /// plaintext itself leaves the queue.
    pub(crate) fn into_parts(self) -> (CompositeBuf, Option<Promise<()>>) {
        (self.payload, self.completion)
    }
}

/// FIFO of [`WriteRequest`]s awaiting drain by the owning selector loop.
///
/// The `registered_for_write` flag coalesces concurrent producers: the first
/// thread to flip it from `false` to `true` is responsible for asking the
/// loop to flush this session; the loop clears it once the queue has been
/// fully drained (or `OP_WRITE` interest has been installed to finish the
/// job on a later readiness notification). The queue itself is guarded by a
/// plain mutex: the drainer takes it for the duration of a whole drain pass,
/// so producers enqueuing concurrently briefly block rather than interleave.
pub struct WriteQueue {
    requests: Mutex<VecDeque<WriteRequest>>,
    scheduled_bytes: std::sync::atomic::AtomicU64,
    registered_for_write: AtomicBool,
}

impl Default for WriteQueue {
    fn default() -> Self {
        WriteQueue {
            requests: Mutex::new(VecDeque::new()),
            scheduled_bytes: std::sync::atomic::AtomicU64::new(0),
            registered_for_write: AtomicBool::new(false),
        }
    }
}

impl WriteQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        WriteQueue::default()
    }

    /// Appends `request` to the tail of the queue.
    pub fn enqueue(&self, request: WriteRequest) {
        self.scheduled_bytes
            .fetch_add(request.len() as u64, Ordering::Relaxed);
        self.requests.lock().unwrap().push_back(request);
    }

    /// True if flipping `registered_for_write` from false to true was this
    /// call's doing — the caller that observes `true` is responsible for
    /// enqueuing the session onto the loop's flush queue.
    pub fn mark_registered_for_write(&self) -> bool {
        self.registered_for_write
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clears the coalescing flag; called by the loop once a drain pass has
    /// emptied the queue.
    pub fn clear_registered_for_write(&self) {
        self.registered_for_write.store(false, Ordering::Release);
    }

    /// Current queue depth in pending requests.
    pub fn len(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// True if no requests are queued.
    pub fn is_empty(&self) -> bool {
        self.requests.lock().unwrap().is_empty()
    }

    /// Total bytes still owed across every queued request. Exposed to
    /// filters/handlers implementing their own backpressure policy (§4.4:
    /// the core imposes no bound).
    pub fn scheduled_bytes(&self) -> u64 {
        self.scheduled_bytes.load(Ordering::Relaxed)
    }

    /// Removes and returns the head request without touching its completion.
    ///
    /// Used by drain paths (TLS) where a request must be transformed
    /// (encrypted) before it reaches the socket, so whether its bytes are
    /// fully on the wire can no longer be read off `CompositeBuf::advance`
    /// alone — the caller takes ownership of the promise and resolves it
    /// once the transformed bytes have actually been written.
    pub(crate) fn pop_front(&self) -> Option<WriteRequest> {
        let mut requests = self.requests.lock().unwrap();
        let request = requests.pop_front()?;
        self.scheduled_bytes
            .fetch_sub(request.len() as u64, Ordering::Relaxed);
        Some(request)
    }

    /// Drains as much of the queue as `write_some` accepts.
    ///
    /// `write_some` is handed the head request's remaining bytes and returns
    /// the number of bytes the socket accepted this call. `WouldBlock` stops
    /// the drain and returns `Ok(false)` — normal backpressure, bytes stay
    /// queued. Any other error is a hard failure (§7 `TransportError`): the
    /// head request is popped and its completion, if any, failed, and the
    /// original error is returned to the caller so it can tear the session
    /// down the same way the read path does on a hard read error. Partial
    /// writes leave the remainder as the new head; completed requests are
    /// popped and their completion, if any, resolved.
    ///
    /// Returns `Ok(true)` if the queue is now empty.
    pub fn drain_with<F>(&self, mut write_some: F) -> io::Result<bool>
    where
        F: FnMut(&CompositeBuf) -> io::Result<usize>,
    {
        let mut requests = self.requests.lock().unwrap();
        loop {
            let Some(head) = requests.front_mut() else {
                break;
            };
            match write_some(&head.payload) {
                Ok(0) => return Ok(false),
                Ok(written) => {
                    head.payload.advance(written);
                    self.scheduled_bytes.fetch_sub(written as u64, Ordering::Relaxed);
                    if head.is_empty() {
                        let completed = requests.pop_front().unwrap();
                        if let Some(promise) = completed.completion {
                            promise.set(());
                        }
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => {
                    if let Some(failed) = requests.pop_front() {
                        self.scheduled_bytes.fetch_sub(failed.len() as u64, Ordering::Relaxed);
                        if let Some(promise) = failed.completion {
                            promise.fail(Error::Protocol(err.to_string()));
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(requests.is_empty())
    }

    /// Fails every still-queued request's completion with an error built by
    /// `make_err`, then drains the queue. Used when a session is torn down
    /// with writes still outstanding, so no write future is left unresolved.
    pub(crate) fn fail_all<F>(&self, mut make_err: F)
    where
        F: FnMut() -> Error,
    {
        let mut requests = self.requests.lock().unwrap();
        for request in requests.drain(..) {
            let (_, completion) = request.into_parts();
            if let Some(promise) = completion {
                promise.fail(make_err());
            }
        }
        self.scheduled_bytes.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn enqueue_increments_scheduled_bytes() {
        let queue = WriteQueue::new();
        queue.enqueue(WriteRequest::new(CompositeBuf::from_bytes(Bytes::from_static(b"abc"))));
        assert_eq!(queue.scheduled_bytes(), 3);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn drain_with_full_write_pops_and_completes() {
        let queue = WriteQueue::new();
        let (promise, future) = crate::future::promise::<()>();
        queue.enqueue(WriteRequest::with_completion(
            CompositeBuf::from_bytes(Bytes::from_static(b"abc")),
            promise,
        ));
        let empty = queue.drain_with(|buf| Ok(buf.len())).unwrap();
        assert!(empty);
        assert!(future.get().is_ok());
        assert_eq!(queue.scheduled_bytes(), 0);
    }

    #[test]
    fn drain_with_partial_write_leaves_remainder_as_new_head() {
        let queue = WriteQueue::new();
        queue.enqueue(WriteRequest::new(CompositeBuf::from_bytes(Bytes::from_static(b"abcdef"))));
        let mut calls = 0;
        let empty = queue
            .drain_with(|_| {
                calls += 1;
                Ok(3)
            })
            .unwrap();
        assert!(!empty);
        assert_eq!(calls, 1);
        assert_eq!(queue.scheduled_bytes(), 3);
    }

    #[test]
    fn mark_registered_for_write_only_flips_once() {
        let queue = WriteQueue::new();
        assert!(queue.mark_registered_for_write());
        assert!(!queue.mark_registered_for_write());
        queue.clear_registered_for_write();
        assert!(queue.mark_registered_for_write());
    }

    #[test]
    fn would_block_stops_drain_without_losing_bytes() {
        let queue = WriteQueue::new();
        queue.enqueue(WriteRequest::new(CompositeBuf::from_bytes(Bytes::from_static(b"abc"))));
        let empty = queue.drain_with(|_| Err(std::io::ErrorKind::WouldBlock.into())).unwrap();
        assert!(!empty);
        assert_eq!(queue.scheduled_bytes(), 3);
    }

    #[test]
    fn hard_error_pops_and_fails_the_completion() {
        let queue = WriteQueue::new();
        let (promise, future) = crate::future::promise::<()>();
        queue.enqueue(WriteRequest::with_completion(
            CompositeBuf::from_bytes(Bytes::from_static(b"abc")),
            promise,
        ));
        let result = queue.drain_with(|_| Err(std::io::ErrorKind::Other.into()));
        assert!(result.is_err());
        assert!(future.get().is_err());
        assert_eq!(queue.scheduled_bytes(), 0);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn fail_all_resolves_every_queued_completion() {
        let queue = WriteQueue::new();
        let (promise_a, future_a) = crate::future::promise::<()>();
        let (promise_b, future_b) = crate::future::promise::<()>();
        queue.enqueue(WriteRequest::with_completion(
            CompositeBuf::from_bytes(Bytes::from_static(b"abc")),
            promise_a,
        ));
        queue.enqueue(WriteRequest::with_completion(
            CompositeBuf::from_bytes(Bytes::from_static(b"def")),
            promise_b,
        ));
        queue.fail_all(|| crate::error::Error::Protocol("session closed".to_string()));
        assert!(future_a.get().is_err());
        assert!(future_b.get().is_err());
        assert_eq!(queue.scheduled_bytes(), 0);
        assert_eq!(queue.len(), 0);
    }
}
