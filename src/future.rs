//! One-shot completion future used for writes and connects.
//!
//! A [`Future`] is the handle an application thread waits on or attaches
//! listeners to; a [`Promise`] is the producer-side handle the engine holds
//! and completes exactly once. Both share the same inner state guarded by a
//! single mutex plus condvar, matching the only two sanctioned blocking calls
//! named in the concurrency model: `Future::get` here, and the multiplexer's
//! bounded `select` in [`crate::selector`].

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;

type Listener<T> = Box<dyn FnOnce(Outcome<T>) + Send + 'static>;

enum Outcome<T> {
    Completed(T),
    Failed(Error),
    Cancelled,
}

impl<T: Clone> Clone for Outcome<T> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Completed(v) => Outcome::Completed(v.clone()),
            Outcome::Failed(e) => Outcome::Failed(Error::Protocol(e.to_string())),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }
}

enum State<T> {
    Pending(Vec<Listener<T>>),
    Done(Outcome<T>),
}

type CancelHandler = Box<dyn FnOnce(bool) + Send>;

struct Inner<T> {
    state: Mutex<State<T>>,
    condvar: Condvar,
    owner: Mutex<Option<CancelHandler>>,
}

/// The producer side of a one-shot [`Future`].
///
/// Exactly one of [`Promise::set`], [`Promise::fail`], or the cancellation
/// path may resolve a given promise. A second resolution attempt is a
/// programming error and panics, mirroring the source's "second completion
/// is a programming error detected by assertion".
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

/// The consumer side of a one-shot completion value.
///
/// Cheaply cloneable; every clone observes the same completion.
pub struct Future<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = matches!(&*self.inner.state.lock().unwrap(), State::Done(_));
        f.debug_struct("Future").field("done", &done).finish()
    }
}

/// Creates a linked promise/future pair for a single completion value.
pub fn promise<T>() -> (Promise<T>, Future<T>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State::Pending(Vec::new())),
        condvar: Condvar::new(),
        owner: Mutex::new(None),
    });
    (
        Promise {
            inner: inner.clone(),
        },
        Future { inner },
    )
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Completes the future with a value. Panics if already resolved.
    pub fn set(&self, value: T) {
        self.resolve(Outcome::Completed(value));
    }

    /// Fails the future with `cause`. Panics if already resolved.
    pub fn fail(&self, cause: Error) {
        self.resolve(Outcome::Failed(cause));
    }

    /// Like [`Promise::set`], but returns `false` instead of panicking if the
    /// future already resolved some other way. Used by owners that may race
    /// a concurrent [`Future::cancel`] (e.g. a pending connect).
    pub(crate) fn try_set(&self, value: T) -> bool {
        self.try_resolve(Outcome::Completed(value))
    }

    /// Like [`Promise::fail`], but returns `false` instead of panicking if
    /// the future already resolved some other way.
    pub(crate) fn try_fail(&self, cause: Error) -> bool {
        self.try_resolve(Outcome::Failed(cause))
    }

    /// Resolves the future as cancelled, unless it already resolved some
    /// other way, in which case this is a no-op. Returns whether this call
    /// performed the transition — the signal [`Future::cancel`] uses to
    /// decide whether to invoke the registered owner callback.
    pub(crate) fn cancelled(&self) -> bool {
        self.try_resolve(Outcome::Cancelled)
    }

    /// Registers a callback invoked, with the `may_interrupt` flag passed to
    /// [`Future::cancel`], if and only if cancellation is what resolves this
    /// promise's future. This is how the owner of the underlying operation
    /// (a pending connect, a pending write) is told to actually interrupt it;
    /// a promise that resolves normally first never invokes it.
    pub(crate) fn on_cancel<F>(&self, handler: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        *self.inner.owner.lock().unwrap() = Some(Box::new(handler));
    }

    /// True if this promise has already been resolved.
    pub fn is_done(&self) -> bool {
        matches!(&*self.inner.state.lock().unwrap(), State::Done(_))
    }

    fn resolve(&self, outcome: Outcome<T>) {
        if !self.try_resolve(outcome) {
            panic!("promise completed more than once");
        }
    }

    /// Attempts the `Pending -> Done` transition, returning whether this
    /// call won it. A losing call is a normal outcome for cancellation (it
    /// raced a real completion) rather than the programming error `resolve`
    /// guards against for `set`/`fail`.
    fn try_resolve(&self, outcome: Outcome<T>) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock().unwrap();
            if matches!(&*state, State::Done(_)) {
                return false;
            }
            match std::mem::replace(&mut *state, State::Done(outcome.clone())) {
                State::Pending(listeners) => listeners,
                State::Done(_) => unreachable!(),
            }
        };
        self.inner.condvar.notify_all();
        for listener in listeners {
            listener(outcome.clone());
        }
        true
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// Blocks the calling thread until the future is resolved.
    ///
    /// This is one of only two sanctioned blocking calls in the engine (the
    /// other being the selector's bounded `select`); callers on a selector
    /// loop thread must never call this.
    pub fn get(&self) -> Result<T, Error> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            match &*state {
                State::Done(outcome) => return Self::into_result(outcome.clone()),
                State::Pending(_) => {
                    state = self.inner.condvar.wait(state).unwrap();
                }
            }
        }
    }

    /// Blocks until resolved or `timeout` elapses, whichever comes first.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, Error> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        loop {
            match &*state {
                State::Done(outcome) => return Self::into_result(outcome.clone()),
                State::Pending(_) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::Timeout);
                    }
                    let (guard, result) =
                        self.inner.condvar.wait_timeout(state, remaining).unwrap();
                    state = guard;
                    if result.timed_out() {
                        if let State::Done(outcome) = &*state {
                            return Self::into_result(outcome.clone());
                        }
                        return Err(Error::Timeout);
                    }
                }
            }
        }
    }

    /// Registers `listener` to run once the future resolves.
    ///
    /// If the future is already complete, `listener` runs synchronously and
    /// immediately, inline on the calling thread. Otherwise it is queued and
    /// invoked by whichever thread resolves the promise.
    pub fn register<F>(&self, listener: F)
    where
        F: FnOnce(Result<T, Error>) + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        match &mut *state {
            State::Done(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                listener(Self::into_result(outcome));
            }
            State::Pending(listeners) => {
                listeners.push(Box::new(move |outcome| listener(Self::into_result(outcome))));
            }
        }
    }

    /// True once the future has resolved, in any terminal state.
    pub fn is_done(&self) -> bool {
        matches!(&*self.inner.state.lock().unwrap(), State::Done(_))
    }

    /// Requests cancellation of the operation this future represents (§4.7).
    ///
    /// Resolves the future as `Cancelled` via the same promise-side path
    /// [`Promise::set`]/[`Promise::fail`] use, unless it has already resolved
    /// some other way, in which case this is a no-op. Returns `true` if this
    /// call was the one that performed the transition.
    ///
    /// `may_interrupt` is forwarded, only on that winning call, to whatever
    /// owner callback was registered on the promise side — e.g. a pending
    /// connect abandons the in-flight socket; a pending write may choose to
    /// leave bytes already queued in place when `may_interrupt` is false.
    /// Exactly one of completed/failed/cancelled is ever reachable for a
    /// given future (§8 property 4): cancellation either wins this race or
    /// it doesn't, never both.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let promise = Promise {
            inner: self.inner.clone(),
        };
        if !promise.cancelled() {
            return false;
        }
        if let Some(owner) = self.inner.owner.lock().unwrap().take() {
            owner(may_interrupt);
        }
        true
    }

    fn into_result(outcome: Outcome<T>) -> Result<T, Error> {
        match outcome {
            Outcome::Completed(v) => Ok(v),
            Outcome::Failed(e) => Err(e),
            Outcome::Cancelled => Err(Error::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::thread;

    #[test]
    fn get_returns_value_after_set() {
        let (promise, future) = promise::<u32>();
        promise.set(42);
        assert_eq!(future.get().unwrap(), 42);
    }

    #[test]
    fn get_blocks_until_set_from_another_thread() {
        let (promise, future) = promise::<u32>();
        let handle = thread::spawn(move || future.get().unwrap());
        thread::sleep(Duration::from_millis(20));
        promise.set(7);
        assert_eq!(handle.join().unwrap(), 7);
    }

    #[test]
    fn fail_resolves_as_error() {
        let (promise, future) = promise::<()>();
        promise.fail(Error::Protocol("boom".into()));
        assert!(future.get().is_err());
    }

    #[test]
    #[should_panic(expected = "completed more than once")]
    fn second_completion_panics() {
        let (promise, _future) = promise::<u32>();
        promise.set(1);
        promise.set(2);
    }

    #[test]
    fn listener_registered_before_completion_runs_once() {
        let (promise, future) = promise::<u32>();
        let (fired_tx, fired_rx) = std::sync::mpsc::channel();
        future.register(move |res| fired_tx.send(res.unwrap()).unwrap());
        promise.set(5);
        assert_eq!(fired_rx.recv().unwrap(), 5);
    }

    #[test]
    fn listener_registered_after_completion_runs_synchronously() {
        let (promise, future) = promise::<u32>();
        promise.set(9);
        let mut seen = None;
        future.register(|res| seen = Some(res.unwrap()));
        assert_eq!(seen, Some(9));
    }

    #[test]
    fn get_timeout_times_out_when_pending() {
        let (_promise, future) = promise::<u32>();
        let result = future.get_timeout(Duration::from_millis(10));
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[test]
    fn cancel_on_pending_future_resolves_as_cancelled() {
        let (_promise, future) = promise::<u32>();
        assert!(future.cancel(true));
        assert!(matches!(future.get(), Err(Error::Cancelled)));
    }

    #[test]
    fn cancel_after_completion_is_a_no_op() {
        let (promise, future) = promise::<u32>();
        promise.set(3);
        assert!(!future.cancel(true));
        assert_eq!(future.get().unwrap(), 3);
    }

    #[test]
    fn cancel_invokes_registered_owner_exactly_once() {
        let (promise, future) = promise::<u32>();
        let (tx, rx) = std::sync::mpsc::channel();
        promise.on_cancel(move |may_interrupt| tx.send(may_interrupt).unwrap());
        assert!(future.cancel(false));
        assert_eq!(rx.recv().unwrap(), false);
        // A second cancel attempt loses the race and must not invoke the
        // owner callback again (it was already taken).
        assert!(!future.cancel(true));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn owner_is_not_invoked_when_promise_completes_first() {
        let (promise, future) = promise::<u32>();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_clone = fired.clone();
        promise.on_cancel(move |_| fired_clone.store(true, Ordering::SeqCst));
        promise.set(1);
        assert!(!future.cancel(true));
        assert!(!fired.load(Ordering::SeqCst));
    }
}
