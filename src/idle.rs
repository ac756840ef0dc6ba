//! Wheel-indexed read/write idleness tracking.
//!
//! One second resolution. Each direction (read, write) has its own ring of
//! buckets sized to the largest configured idle timeout in that direction;
//! a session occupies exactly one bucket per direction at a time, and every
//! read or write re-indexes it into a fresh bucket computed from the current
//! tick. Firing walks every bucket between the last tick processed and the
//! current tick, so a timeout is detected at-least-once and at most once per
//! elapsed second per direction (§4.6).

use std::collections::HashSet;

use crate::session::id::SessionId;

/// One direction's ring of idle buckets.
struct Wheel {
    buckets: Vec<HashSet<SessionId>>,
    positions: std::collections::HashMap<SessionId, usize>,
    timeout_secs: u64,
}

impl Wheel {
    fn new(timeout_secs: u64) -> Self {
        let size = (timeout_secs.max(1) + 1) as usize;
        Wheel {
            buckets: (0..size).map(|_| HashSet::new()).collect(),
            positions: std::collections::HashMap::new(),
            timeout_secs,
        }
    }

    fn slot(&self, tick: u64) -> usize {
        (tick % self.buckets.len() as u64) as usize
    }

    /// Moves `session` into the bucket for `now_tick + timeout`, removing it
    /// from whatever bucket it previously occupied.
    fn reindex(&mut self, session: SessionId, now_tick: u64) {
        self.remove(session);
        if self.timeout_secs == 0 {
            return;
        }
        let slot = self.slot(now_tick + self.timeout_secs);
        self.buckets[slot].insert(session);
        self.positions.insert(session, slot);
    }

    fn remove(&mut self, session: SessionId) {
        if let Some(slot) = self.positions.remove(&session) {
            self.buckets[slot].remove(&session);
        }
    }

    /// Returns every session whose bucket fires between `from_tick` exclusive
    /// and `to_tick` inclusive, re-indexing each for another interval.
    fn fire(&mut self, from_tick: u64, to_tick: u64) -> Vec<SessionId> {
        if self.timeout_secs == 0 || to_tick <= from_tick {
            return Vec::new();
        }
        let mut fired = Vec::new();
        let elapsed = to_tick - from_tick;
        // Never walk more than a full revolution: a wheel this far behind has
        // already lost precision and every live session is overdue anyway.
        let steps = elapsed.min(self.buckets.len() as u64);
        for i in 0..steps {
            let tick = from_tick + 1 + i;
            let slot = self.slot(tick);
            let bucket = std::mem::take(&mut self.buckets[slot]);
            for session in bucket {
                self.positions.remove(&session);
                fired.push(session);
            }
        }
        for session in &fired {
            self.reindex(*session, to_tick);
        }
        fired
    }
}

/// Tracks read-idle and write-idle timeouts for every registered session in
/// one selector loop.
pub struct IdleDetector {
    read: Wheel,
    write: Wheel,
    last_tick: u64,
}

/// A session crossed a read-idle or write-idle threshold.
pub struct IdleEvent {
    pub session: SessionId,
    pub status: crate::chain::IdleStatus,
}

impl IdleDetector {
    /// Creates a detector with the given read/write idle timeouts in
    /// seconds. A timeout of `0` disables tracking in that direction.
    pub fn new(read_timeout_secs: u64, write_timeout_secs: u64) -> Self {
        IdleDetector {
            read: Wheel::new(read_timeout_secs),
            write: Wheel::new(write_timeout_secs),
            last_tick: 0,
        }
    }

    /// Begins tracking `session` from `now_tick` (seconds since an arbitrary
    /// epoch shared by every call into this detector).
    pub fn register(&mut self, session: SessionId, now_tick: u64) {
        self.read.reindex(session, now_tick);
        self.write.reindex(session, now_tick);
        self.last_tick = self.last_tick.max(now_tick);
    }

    /// Stops tracking `session` entirely (on close).
    pub fn unregister(&mut self, session: SessionId) {
        self.read.remove(session);
        self.write.remove(session);
    }

    /// Re-indexes `session`'s read bucket after activity.
    pub fn note_read(&mut self, session: SessionId, now_tick: u64) {
        self.read.reindex(session, now_tick);
    }

    /// Re-indexes `session`'s write bucket after activity.
    pub fn note_write(&mut self, session: SessionId, now_tick: u64) {
        self.write.reindex(session, now_tick);
    }

    /// Advances the detector to `now_tick`, returning every idle event that
    /// fired in the elapsed whole seconds.
    pub fn tick(&mut self, now_tick: u64) -> Vec<IdleEvent> {
        if now_tick <= self.last_tick {
            return Vec::new();
        }
        let mut events = Vec::new();
        for session in self.read.fire(self.last_tick, now_tick) {
            events.push(IdleEvent {
                session,
                status: crate::chain::IdleStatus::ReadIdle,
            });
        }
        for session in self.write.fire(self.last_tick, now_tick) {
            events.push(IdleEvent {
                session,
                status: crate::chain::IdleStatus::WriteIdle,
            });
        }
        self.last_tick = now_tick;
        events
    }
}
