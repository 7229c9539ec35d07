//! Worker registry and least-recently-assigned selection
//!
//! This module tracks the workers connected to the backend and which of them
//! can take work. Idle workers are handed out in the order they were last
//! assigned, so load spreads evenly across the pool.

use crate::identity::WorkerId;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

/// Whether a worker can accept a new assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Idle,
    Busy,
}

/// Broker-side view of a connected worker
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    /// Worker identity
    pub identity: WorkerId,

    /// Current availability
    pub availability: Availability,

    /// Wall-clock time of the last assignment, if any
    pub last_assigned_at: Option<Instant>,

    /// Logical time of the last assignment (0 = never assigned)
    assigned_stamp: u64,

    /// Logical time of registration
    joined_stamp: u64,
}

impl WorkerHandle {
    fn new(identity: WorkerId, joined_stamp: u64) -> Self {
        Self {
            identity,
            availability: Availability::Idle,
            last_assigned_at: None,
            assigned_stamp: 0,
            joined_stamp,
        }
    }

    /// Ordering key for selection (lower is chosen first)
    fn selection_key(&self) -> (u64, u64) {
        (self.assigned_stamp, self.joined_stamp)
    }

    pub fn is_idle(&self) -> bool {
        self.availability == Availability::Idle
    }
}

/// Registry of backend workers
///
/// Owned by the broker loop; never shared across tasks.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, WorkerHandle>,

    /// Logical clock for join and assignment stamps
    clock: u64,
}

impl WorkerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Register a worker, or mark an already known worker idle
    ///
    /// Returns `true` when the worker was not known before.
    pub fn register_or_touch(&mut self, identity: WorkerId) -> bool {
        if let Some(worker) = self.workers.get_mut(&identity) {
            worker.availability = Availability::Idle;
            debug!("Worker {} is idle again", identity);
            return false;
        }

        let stamp = self.tick();
        self.workers.insert(identity, WorkerHandle::new(identity, stamp));
        debug!("Registered worker {}", identity);
        true
    }

    /// Select the idle worker that was assigned least recently
    ///
    /// Workers that were never assigned come first, in join order.
    pub fn select_idle_worker(&self) -> Option<&WorkerHandle> {
        self.workers
            .values()
            .filter(|w| w.is_idle())
            .min_by_key(|w| w.selection_key())
    }

    /// Mark a worker busy and stamp the assignment; no-op for unknown workers
    pub fn mark_busy(&mut self, identity: WorkerId) -> bool {
        let stamp = self.clock + 1;
        match self.workers.get_mut(&identity) {
            Some(worker) => {
                worker.availability = Availability::Busy;
                worker.assigned_stamp = stamp;
                worker.last_assigned_at = Some(Instant::now());
                self.clock = stamp;
                true
            }
            None => false,
        }
    }

    /// Mark a worker idle; no-op for unknown workers
    pub fn mark_idle(&mut self, identity: WorkerId) -> bool {
        match self.workers.get_mut(&identity) {
            Some(worker) => {
                worker.availability = Availability::Idle;
                true
            }
            None => false,
        }
    }

    /// Forget a worker that left the pool
    pub fn remove(&mut self, identity: WorkerId) -> Option<WorkerHandle> {
        let removed = self.workers.remove(&identity);
        if removed.is_some() {
            debug!("Removed worker {}", identity);
        }
        removed
    }

    /// Look up a worker
    pub fn get(&self, identity: WorkerId) -> Option<&WorkerHandle> {
        self.workers.get(&identity)
    }

    /// Whether the worker is registered
    pub fn contains(&self, identity: WorkerId) -> bool {
        self.workers.contains_key(&identity)
    }

    /// Number of registered workers
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Number of idle workers
    pub fn idle_count(&self) -> usize {
        self.workers.values().filter(|w| w.is_idle()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selected(registry: &WorkerRegistry) -> Option<WorkerId> {
        registry.select_idle_worker().map(|w| w.identity)
    }

    #[test]
    fn test_empty_registry_has_no_idle_worker() {
        let registry = WorkerRegistry::new();
        assert!(selected(&registry).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_twice_is_idempotent() {
        let mut registry = WorkerRegistry::new();
        let w1 = WorkerId::new();

        assert!(registry.register_or_touch(w1));
        assert!(!registry.register_or_touch(w1));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.idle_count(), 1);
    }

    #[test]
    fn test_never_assigned_workers_go_in_join_order() {
        let mut registry = WorkerRegistry::new();
        let w1 = WorkerId::new();
        let w2 = WorkerId::new();
        let w3 = WorkerId::new();
        registry.register_or_touch(w1);
        registry.register_or_touch(w2);
        registry.register_or_touch(w3);

        assert_eq!(selected(&registry), Some(w1));
        registry.mark_busy(w1);
        assert_eq!(selected(&registry), Some(w2));
        registry.mark_busy(w2);
        assert_eq!(selected(&registry), Some(w3));
    }

    #[test]
    fn test_least_recently_assigned_goes_first() {
        let mut registry = WorkerRegistry::new();
        let w1 = WorkerId::new();
        let w2 = WorkerId::new();
        registry.register_or_touch(w1);
        registry.register_or_touch(w2);

        registry.mark_busy(w1);
        registry.mark_busy(w2);
        // w2 frees up first, but w1 was assigned earlier
        registry.mark_idle(w2);
        registry.mark_idle(w1);

        assert_eq!(selected(&registry), Some(w1));
    }

    #[test]
    fn test_busy_worker_is_never_selected() {
        let mut registry = WorkerRegistry::new();
        let w1 = WorkerId::new();
        registry.register_or_touch(w1);
        registry.mark_busy(w1);

        assert!(selected(&registry).is_none());
        assert_eq!(
            registry.get(w1).map(|w| w.availability),
            Some(Availability::Busy)
        );
        assert!(registry.get(w1).and_then(|w| w.last_assigned_at).is_some());
    }

    #[test]
    fn test_touch_resets_busy_worker_to_idle() {
        let mut registry = WorkerRegistry::new();
        let w1 = WorkerId::new();
        registry.register_or_touch(w1);
        registry.mark_busy(w1);
        registry.register_or_touch(w1);

        assert_eq!(selected(&registry), Some(w1));
    }

    #[test]
    fn test_unknown_worker_transitions_are_noops() {
        let mut registry = WorkerRegistry::new();
        let ghost = WorkerId::new();

        assert!(!registry.mark_busy(ghost));
        assert!(!registry.mark_idle(ghost));
        assert!(registry.remove(ghost).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_removed_worker_is_not_selected() {
        let mut registry = WorkerRegistry::new();
        let w1 = WorkerId::new();
        let w2 = WorkerId::new();
        registry.register_or_touch(w1);
        registry.register_or_touch(w2);

        registry.remove(w1);

        assert_eq!(selected(&registry), Some(w2));
        assert_eq!(registry.len(), 1);
    }
}
