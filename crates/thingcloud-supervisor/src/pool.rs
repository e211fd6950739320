use std::collections::VecDeque;
use std::sync::Arc;

use crate::process::WorkerProcess;

/// Fixed set of shared worker slots, handed out round-robin.
///
/// A slot is empty while its worker is being replaced; empty and dying slots
/// are skipped.
pub struct SharedPool {
    slots: Vec<Option<Arc<WorkerProcess>>>,
    order: VecDeque<usize>,
}

impl SharedPool {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| None).collect(),
            order: (0..size).collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn set(&mut self, slot: usize, worker: Arc<WorkerProcess>) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = Some(worker);
        }
    }

    /// Empties `slot` if it still holds `worker`.
    pub fn clear_if(&mut self, slot: usize, worker: &Arc<WorkerProcess>) -> bool {
        match self.slots.get_mut(slot) {
            Some(entry) if entry.as_ref().is_some_and(|w| Arc::ptr_eq(w, worker)) => {
                *entry = None;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, slot: usize) -> Option<&Arc<WorkerProcess>> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Next live worker in round-robin order.
    pub fn next_worker(&mut self) -> Option<Arc<WorkerProcess>> {
        for _ in 0..self.order.len() {
            // Rotate: move first to back, use it if it is alive
            let slot = self.order.pop_front()?;
            self.order.push_back(slot);
            if let Some(worker) = self.get(slot) {
                if worker.is_ready() {
                    return Some(worker.clone());
                }
            }
        }
        None
    }

    pub fn workers(&self) -> Vec<Arc<WorkerProcess>> {
        self.slots.iter().flatten().cloned().collect()
    }

    /// Use count per slot; `None` for an empty slot.
    pub fn use_counts(&self) -> Vec<Option<usize>> {
        self.slots
            .iter()
            .map(|slot| slot.as_ref().map(|w| w.use_count()))
            .collect()
    }

    pub fn clear(&mut self) -> Vec<Arc<WorkerProcess>> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::tests::{idle_worker, starting_worker};
    use crate::process::{WorkerId, WorkerKind, WorkerState};

    fn pool_of(size: usize) -> (SharedPool, Vec<Arc<WorkerProcess>>) {
        let mut pool = SharedPool::new(size);
        let workers: Vec<_> = (0..size)
            .map(|slot| idle_worker(WorkerId::shared(slot as u64), WorkerKind::Shared(slot)))
            .collect();
        for (slot, worker) in workers.iter().enumerate() {
            pool.set(slot, worker.clone());
        }
        (pool, workers)
    }

    #[tokio::test]
    async fn test_round_robin() {
        let (mut pool, workers) = pool_of(3);
        assert_eq!(pool.size(), 3);

        for expected in [0, 1, 2, 0] {
            let next = pool.next_worker().unwrap();
            assert!(Arc::ptr_eq(&next, &workers[expected]));
        }
    }

    #[test]
    fn test_empty_pool_returns_none() {
        let mut pool = SharedPool::new(0);
        assert!(pool.next_worker().is_none());

        let mut unfilled = SharedPool::new(2);
        assert!(unfilled.next_worker().is_none());
        assert_eq!(unfilled.use_counts(), vec![None, None]);
    }

    #[tokio::test]
    async fn test_skips_empty_and_dying_slots() {
        let (mut pool, workers) = pool_of(3);
        assert!(pool.clear_if(0, &workers[0]));
        workers[1].set_state(WorkerState::Dying);

        for _ in 0..3 {
            let next = pool.next_worker().unwrap();
            assert!(Arc::ptr_eq(&next, &workers[2]));
        }
    }

    #[tokio::test]
    async fn test_skips_starting_slot() {
        let (mut pool, workers) = pool_of(2);
        pool.set(0, starting_worker(WorkerId::shared(5), WorkerKind::Shared(0)));

        for _ in 0..2 {
            let next = pool.next_worker().unwrap();
            assert!(Arc::ptr_eq(&next, &workers[1]));
        }
    }

    #[tokio::test]
    async fn test_clear_if_only_matching_worker() {
        let (mut pool, workers) = pool_of(2);
        let replacement = idle_worker(WorkerId::shared(9), WorkerKind::Shared(0));
        pool.set(0, replacement.clone());

        // The old worker's exit must not empty the slot again.
        assert!(!pool.clear_if(0, &workers[0]));
        assert!(Arc::ptr_eq(pool.get(0).unwrap(), &replacement));
    }

    #[tokio::test]
    async fn test_use_counts_and_clear() {
        let (mut pool, workers) = pool_of(2);
        workers[1].add_use();
        workers[1].add_use();
        assert_eq!(pool.use_counts(), vec![Some(0), Some(2)]);

        let removed = pool.clear();
        assert_eq!(removed.len(), 2);
        assert!(pool.workers().is_empty());
    }
}
