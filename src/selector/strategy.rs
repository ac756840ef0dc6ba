//! Accept-balancing strategies for spreading new sessions across loops.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Chooses which of a service's selector loops a freshly accepted or
/// connected session should be registered on (§4.1 "accept balancing", §10.1
/// supplement: pluggable strategies beyond round-robin).
pub trait SelectorStrategy: Send + Sync + fmt::Debug {
    /// Returns the index into `loads` (one entry per loop, its current
    /// registered-session count) that should receive the next session.
    /// Panics if `loads` is empty; callers never invoke this on a service
    /// with zero loops.
    fn choose(&self, loads: &[usize]) -> usize;
}

/// Cycles through loops in order. The default strategy, matching §4.1's
/// "round-robin by default".
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    /// A fresh round-robin cursor starting at loop 0.
    pub fn new() -> Self {
        RoundRobin::default()
    }
}

impl SelectorStrategy for RoundRobin {
    fn choose(&self, loads: &[usize]) -> usize {
        assert!(!loads.is_empty(), "selector strategy requires at least one loop");
        self.next.fetch_add(1, Ordering::Relaxed) % loads.len()
    }
}

/// Picks the loop with the fewest registered sessions, breaking ties by
/// lowest index. Consults only the session count snapshot supplied by the
/// caller — strategies are deliberately stateless about *why* a loop is
/// loaded.
#[derive(Debug, Default)]
pub struct LeastLoaded;

impl LeastLoaded {
    /// Builds a least-loaded strategy.
    pub fn new() -> Self {
        LeastLoaded
    }
}

impl SelectorStrategy for LeastLoaded {
    fn choose(&self, loads: &[usize]) -> usize {
        assert!(!loads.is_empty(), "selector strategy requires at least one loop");
        loads
            .iter()
            .enumerate()
            .min_by_key(|&(_, &count)| count)
            .map(|(index, _)| index)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_every_index() {
        let strategy = RoundRobin::new();
        let loads = [0, 0, 0];
        let picks: Vec<usize> = (0..6).map(|_| strategy.choose(&loads)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn least_loaded_picks_minimum_breaking_ties_low() {
        let strategy = LeastLoaded::new();
        assert_eq!(strategy.choose(&[5, 2, 2, 9]), 1);
        assert_eq!(strategy.choose(&[0]), 0);
    }
}
