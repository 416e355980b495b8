//! Two-pool byte accounting for the block store.
//!
//! One pool per [`MemoryMode`], each split into a storage region and an
//! unroll region with a soft shared boundary. The accountant is pure
//! bookkeeping: acquisition never evicts; the store drives eviction and
//! retries.

use parking_lot::Mutex;
use riffle_types::{BlockId, MemoryMode, TaskAttemptId};
use std::collections::HashMap;
use tracing::{trace, warn};

/// Grants and releases byte reservations for both memory modes.
///
/// Every counter update for a mode happens under that mode's mutex, so
/// callers may observe arbitrary interleavings between consecutive calls
/// but never a torn update. Compound invariants (such as the
/// unroll-to-storage hand-off) are provided as single operations here.
pub struct MemoryAccountant {
    on_heap: Mutex<Pool>,
    off_heap: Mutex<Pool>,
}

struct Pool {
    max_total: u64,
    /// Soft boundary: unroll reservations may not exceed this share of the
    /// pool, so a single unrolling task cannot starve storage entirely.
    storage_region_size: u64,
    storage_used: u64,
    unroll_used: u64,
    /// Execution is an unrelated peer pool; the store only observes it
    /// when computing free room.
    execution_used: u64,
    unroll_by_task: HashMap<TaskAttemptId, u64>,
}

impl Pool {
    fn new(max_total: u64, storage_region_fraction: f64) -> Self {
        let storage_region_size = (max_total as f64 * storage_region_fraction) as u64;
        Self {
            max_total,
            storage_region_size,
            storage_used: 0,
            unroll_used: 0,
            execution_used: 0,
            unroll_by_task: HashMap::new(),
        }
    }

    fn free(&self) -> u64 {
        self.max_total
            .saturating_sub(self.storage_used)
            .saturating_sub(self.unroll_used)
            .saturating_sub(self.execution_used)
    }

    fn grant_unroll(&mut self, task: TaskAttemptId, n: u64) -> bool {
        if n > self.free() || self.unroll_used.saturating_add(n) > self.storage_region_size {
            return false;
        }
        self.unroll_used += n;
        *self.unroll_by_task.entry(task).or_insert(0) += n;
        true
    }

    fn drop_unroll(&mut self, task: TaskAttemptId, n: u64) {
        debug_assert!(n <= self.unroll_used, "unroll release underflow");
        self.unroll_used = self.unroll_used.saturating_sub(n);
        match self.unroll_by_task.get_mut(&task) {
            Some(held) if *held > n => *held -= n,
            Some(held) => {
                debug_assert!(*held == n, "task unroll ledger underflow");
                self.unroll_by_task.remove(&task);
            }
            None => debug_assert!(n == 0, "unroll release for task with no ledger entry"),
        }
    }

    fn snapshot(&self) -> ModeSnapshot {
        ModeSnapshot {
            max_total: self.max_total,
            storage_region_size: self.storage_region_size,
            storage_used: self.storage_used,
            unroll_used: self.unroll_used,
            execution_used: self.execution_used,
            free: self.free(),
        }
    }
}

/// Point-in-time counters for one memory mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSnapshot {
    pub max_total: u64,
    pub storage_region_size: u64,
    pub storage_used: u64,
    pub unroll_used: u64,
    pub execution_used: u64,
    pub free: u64,
}

/// Counters for both modes, each read under a single lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub on_heap: ModeSnapshot,
    pub off_heap: ModeSnapshot,
}

impl MemoryAccountant {
    pub fn new(max_on_heap: u64, max_off_heap: u64, storage_region_fraction: f64) -> Self {
        Self {
            on_heap: Mutex::new(Pool::new(max_on_heap, storage_region_fraction)),
            off_heap: Mutex::new(Pool::new(max_off_heap, storage_region_fraction)),
        }
    }

    fn pool(&self, mode: MemoryMode) -> &Mutex<Pool> {
        match mode {
            MemoryMode::OnHeap => &self.on_heap,
            MemoryMode::OffHeap => &self.off_heap,
        }
    }

    /// Reserve `n` bytes of storage credit for `id`.
    ///
    /// Grants iff the pool has `n` bytes free after unroll and execution
    /// usage. Never evicts; a refusal leaves all counters untouched.
    #[must_use]
    pub fn acquire_storage(&self, id: &BlockId, n: u64, mode: MemoryMode) -> bool {
        let mut pool = self.pool(mode).lock();
        if n > pool.free() {
            trace!(
                event = "storage_acquire_refused",
                block = %id,
                requested = n,
                free = pool.free(),
                mode = %mode,
            );
            return false;
        }
        pool.storage_used += n;
        true
    }

    /// Reserve `n` bytes of unroll credit for `id` on behalf of `task`.
    ///
    /// Unroll and storage compete for the same free room; unroll is
    /// additionally capped by the storage region boundary.
    #[must_use]
    pub fn acquire_unroll(
        &self,
        id: &BlockId,
        task: TaskAttemptId,
        n: u64,
        mode: MemoryMode,
    ) -> bool {
        let mut pool = self.pool(mode).lock();
        let granted = pool.grant_unroll(task, n);
        if !granted {
            trace!(
                event = "unroll_acquire_refused",
                block = %id,
                task = %task,
                requested = n,
                free = pool.free(),
                mode = %mode,
            );
        }
        granted
    }

    pub fn release_storage(&self, n: u64, mode: MemoryMode) {
        let mut pool = self.pool(mode).lock();
        if n > pool.storage_used {
            debug_assert!(false, "storage release underflow");
            warn!(
                event = "storage_release_underflow",
                released = n,
                held = pool.storage_used,
                mode = %mode,
            );
        }
        pool.storage_used = pool.storage_used.saturating_sub(n);
    }

    pub fn release_unroll(&self, task: TaskAttemptId, n: u64, mode: MemoryMode) {
        let mut pool = self.pool(mode).lock();
        pool.drop_unroll(task, n);
    }

    /// Convert `held` bytes of `task`'s unroll credit into `size` bytes of
    /// storage credit, reconciling any gap, as one atomic step.
    ///
    /// If `size` exceeds `held` the shortfall must fit in free room or the
    /// transfer fails with every counter unchanged. The pool lock is held
    /// across the pair so no observer sees the storage counter dip while
    /// the unroll counter still carries the block.
    #[must_use]
    pub fn transfer_unroll_to_storage(
        &self,
        id: &BlockId,
        task: TaskAttemptId,
        held: u64,
        size: u64,
        mode: MemoryMode,
    ) -> bool {
        let mut pool = self.pool(mode).lock();
        if size > held {
            let shortfall = size - held;
            if shortfall > pool.free() {
                trace!(
                    event = "unroll_transfer_refused",
                    block = %id,
                    task = %task,
                    held,
                    size,
                    free = pool.free(),
                    mode = %mode,
                );
                return false;
            }
        }
        pool.drop_unroll(task, held);
        pool.storage_used += size;
        true
    }

    /// Drop every unroll reservation `task` still holds, in both modes.
    ///
    /// Invoked on task completion; returns the bytes reclaimed per mode
    /// `(on_heap, off_heap)`.
    pub fn release_all_unroll_for_task(&self, task: TaskAttemptId) -> (u64, u64) {
        let mut reclaimed = (0, 0);
        for (mode, slot) in [
            (MemoryMode::OnHeap, &mut reclaimed.0),
            (MemoryMode::OffHeap, &mut reclaimed.1),
        ] {
            let mut pool = self.pool(mode).lock();
            if let Some(held) = pool.unroll_by_task.remove(&task) {
                pool.unroll_used = pool.unroll_used.saturating_sub(held);
                *slot = held;
            }
        }
        reclaimed
    }

    /// Observe an execution-side reservation against this pool.
    #[must_use]
    pub fn acquire_execution(&self, n: u64, mode: MemoryMode) -> bool {
        let mut pool = self.pool(mode).lock();
        if n > pool.free() {
            return false;
        }
        pool.execution_used += n;
        true
    }

    pub fn release_execution(&self, n: u64, mode: MemoryMode) {
        let mut pool = self.pool(mode).lock();
        debug_assert!(n <= pool.execution_used, "execution release underflow");
        pool.execution_used = pool.execution_used.saturating_sub(n);
    }

    #[must_use]
    pub fn storage_used(&self, mode: MemoryMode) -> u64 {
        self.pool(mode).lock().storage_used
    }

    #[must_use]
    pub fn unroll_used(&self, mode: MemoryMode) -> u64 {
        self.pool(mode).lock().unroll_used
    }

    #[must_use]
    pub fn unroll_held_by_task(&self, task: TaskAttemptId, mode: MemoryMode) -> u64 {
        self.pool(mode)
            .lock()
            .unroll_by_task
            .get(&task)
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn free(&self, mode: MemoryMode) -> u64 {
        self.pool(mode).lock().free()
    }

    #[must_use]
    pub fn max_total(&self, mode: MemoryMode) -> u64 {
        self.pool(mode).lock().max_total
    }

    #[must_use]
    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            on_heap: self.on_heap.lock().snapshot(),
            off_heap: self.off_heap.lock().snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODE: MemoryMode = MemoryMode::OnHeap;

    fn block(n: u32) -> BlockId {
        BlockId::Partition {
            dataset: riffle_types::DatasetId(1),
            index: n,
        }
    }

    fn task(n: u64) -> TaskAttemptId {
        TaskAttemptId(n)
    }

    #[test]
    fn storage_grants_up_to_capacity() {
        let acct = MemoryAccountant::new(1000, 0, 1.0);
        assert!(acct.acquire_storage(&block(0), 400, MODE));
        assert!(acct.acquire_storage(&block(1), 600, MODE));
        assert!(!acct.acquire_storage(&block(2), 1, MODE));
        assert_eq!(acct.storage_used(MODE), 1000);
        assert_eq!(acct.free(MODE), 0);
    }

    #[test]
    fn exact_fit_is_granted() {
        let acct = MemoryAccountant::new(500, 0, 1.0);
        assert!(acct.acquire_storage(&block(0), 500, MODE));
        assert_eq!(acct.free(MODE), 0);
    }

    #[test]
    fn modes_are_independent() {
        let acct = MemoryAccountant::new(100, 100, 1.0);
        assert!(acct.acquire_storage(&block(0), 100, MemoryMode::OnHeap));
        assert!(acct.acquire_storage(&block(1), 100, MemoryMode::OffHeap));
        assert_eq!(acct.storage_used(MemoryMode::OnHeap), 100);
        assert_eq!(acct.storage_used(MemoryMode::OffHeap), 100);
    }

    #[test]
    fn unroll_competes_with_storage_for_free_room() {
        let acct = MemoryAccountant::new(1000, 0, 1.0);
        assert!(acct.acquire_storage(&block(0), 700, MODE));
        assert!(acct.acquire_unroll(&block(1), task(1), 300, MODE));
        assert!(!acct.acquire_storage(&block(2), 1, MODE));
        assert!(!acct.acquire_unroll(&block(3), task(2), 1, MODE));
    }

    #[test]
    fn unroll_capped_by_storage_region() {
        let acct = MemoryAccountant::new(1000, 0, 0.5);
        assert!(acct.acquire_unroll(&block(0), task(1), 500, MODE));
        assert!(!acct.acquire_unroll(&block(0), task(1), 1, MODE));
        // Storage may still use the rest of the pool.
        assert!(acct.acquire_storage(&block(1), 500, MODE));
    }

    #[test]
    fn unroll_ledger_tracks_per_task_totals() {
        let acct = MemoryAccountant::new(1000, 0, 1.0);
        assert!(acct.acquire_unroll(&block(0), task(1), 100, MODE));
        assert!(acct.acquire_unroll(&block(1), task(1), 50, MODE));
        assert!(acct.acquire_unroll(&block(2), task(2), 200, MODE));
        assert_eq!(acct.unroll_held_by_task(task(1), MODE), 150);
        assert_eq!(acct.unroll_held_by_task(task(2), MODE), 200);
        assert_eq!(acct.unroll_used(MODE), 350);

        acct.release_unroll(task(1), 150, MODE);
        assert_eq!(acct.unroll_held_by_task(task(1), MODE), 0);
        assert_eq!(acct.unroll_used(MODE), 200);
    }

    #[test]
    fn release_all_unroll_sweeps_both_modes() {
        let acct = MemoryAccountant::new(1000, 1000, 1.0);
        assert!(acct.acquire_unroll(&block(0), task(1), 120, MemoryMode::OnHeap));
        assert!(acct.acquire_unroll(&block(1), task(1), 80, MemoryMode::OffHeap));
        assert_eq!(acct.release_all_unroll_for_task(task(1)), (120, 80));
        assert_eq!(acct.unroll_used(MemoryMode::OnHeap), 0);
        assert_eq!(acct.unroll_used(MemoryMode::OffHeap), 0);
    }

    #[test]
    fn transfer_moves_credit_without_gap() {
        let acct = MemoryAccountant::new(1000, 0, 1.0);
        assert!(acct.acquire_unroll(&block(0), task(1), 400, MODE));
        assert!(acct.transfer_unroll_to_storage(&block(0), task(1), 400, 400, MODE));
        assert_eq!(acct.unroll_used(MODE), 0);
        assert_eq!(acct.storage_used(MODE), 400);
    }

    #[test]
    fn transfer_releases_excess_reservation() {
        let acct = MemoryAccountant::new(1000, 0, 1.0);
        assert!(acct.acquire_unroll(&block(0), task(1), 400, MODE));
        assert!(acct.transfer_unroll_to_storage(&block(0), task(1), 400, 250, MODE));
        assert_eq!(acct.storage_used(MODE), 250);
        assert_eq!(acct.unroll_used(MODE), 0);
        assert_eq!(acct.free(MODE), 750);
    }

    #[test]
    fn transfer_acquires_shortfall_when_room_exists() {
        let acct = MemoryAccountant::new(1000, 0, 1.0);
        assert!(acct.acquire_unroll(&block(0), task(1), 400, MODE));
        assert!(acct.transfer_unroll_to_storage(&block(0), task(1), 400, 600, MODE));
        assert_eq!(acct.storage_used(MODE), 600);
        assert_eq!(acct.unroll_used(MODE), 0);
    }

    #[test]
    fn transfer_refused_when_shortfall_does_not_fit() {
        let acct = MemoryAccountant::new(1000, 0, 1.0);
        assert!(acct.acquire_storage(&block(9), 500, MODE));
        assert!(acct.acquire_unroll(&block(0), task(1), 400, MODE));
        // 100 free, shortfall of 300 needed.
        assert!(!acct.transfer_unroll_to_storage(&block(0), task(1), 400, 700, MODE));
        // Refusal leaves the unroll reservation in place.
        assert_eq!(acct.unroll_used(MODE), 400);
        assert_eq!(acct.storage_used(MODE), 500);
        assert_eq!(acct.unroll_held_by_task(task(1), MODE), 400);
    }

    #[test]
    fn execution_usage_shrinks_free_room() {
        let acct = MemoryAccountant::new(1000, 0, 1.0);
        assert!(acct.acquire_execution(600, MODE));
        assert!(!acct.acquire_storage(&block(0), 500, MODE));
        assert!(acct.acquire_storage(&block(0), 400, MODE));
        acct.release_execution(600, MODE);
        assert_eq!(acct.free(MODE), 600);
    }

    #[test]
    fn snapshot_reflects_all_counters() {
        let acct = MemoryAccountant::new(1000, 500, 0.5);
        assert!(acct.acquire_storage(&block(0), 300, MemoryMode::OnHeap));
        assert!(acct.acquire_unroll(&block(1), task(1), 100, MemoryMode::OnHeap));
        assert!(acct.acquire_execution(50, MemoryMode::OffHeap));

        let snap = acct.snapshot();
        assert_eq!(snap.on_heap.storage_used, 300);
        assert_eq!(snap.on_heap.unroll_used, 100);
        assert_eq!(snap.on_heap.free, 600);
        assert_eq!(snap.on_heap.storage_region_size, 500);
        assert_eq!(snap.off_heap.execution_used, 50);
        assert_eq!(snap.off_heap.free, 450);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "storage release underflow")]
    fn storage_release_underflow_asserts() {
        let acct = MemoryAccountant::new(100, 0, 1.0);
        acct.release_storage(1, MODE);
    }
}
