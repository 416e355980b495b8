//! Per-block read/write locking with task-affinity bookkeeping.
//!
//! One writer or N readers per block, never both. Every hold records the
//! owning task attempt so a crashed or cancelled task can be swept with
//! [`BlockLockTable::release_all_locks_for_task`] instead of relying on
//! task-scoped destructors.

use parking_lot::{Condvar, Mutex};
use riffle_types::{BlockId, TaskAttemptId};
use std::collections::{HashMap, HashSet};
use tracing::{trace, warn};

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum LockOutcome {
    Acquired,
    /// The lock is held incompatibly and the caller asked not to wait.
    Contended,
    /// No lock record exists for the block.
    UnknownBlock,
}

impl LockOutcome {
    pub fn is_acquired(self) -> bool {
        matches!(self, LockOutcome::Acquired)
    }
}

#[derive(Debug, Default)]
struct LockState {
    /// Read holds per task; a task may pin the same block several times.
    readers: HashMap<TaskAttemptId, usize>,
    writer: Option<TaskAttemptId>,
}

impl LockState {
    fn read_count(&self) -> usize {
        self.readers.values().sum()
    }

    fn held_by(&self, task: TaskAttemptId) -> bool {
        self.writer == Some(task) || self.readers.contains_key(&task)
    }
}

#[derive(Default)]
struct LockTables {
    blocks: HashMap<BlockId, LockState>,
    by_task: HashMap<TaskAttemptId, HashSet<BlockId>>,
}

impl LockTables {
    fn note_hold(&mut self, task: TaskAttemptId, id: &BlockId) {
        self.by_task.entry(task).or_default().insert(id.clone());
    }

    fn forget_hold(&mut self, task: TaskAttemptId, id: &BlockId) {
        if let Some(blocks) = self.by_task.get_mut(&task) {
            blocks.remove(id);
            if blocks.is_empty() {
                self.by_task.remove(&task);
            }
        }
    }
}

/// Lock table for every block the store is aware of.
///
/// A record exists for the lifetime of its block's presence: it is created
/// write-locked by [`register`](Self::register) at the start of a put and
/// destroyed by [`remove_block_entry`](Self::remove_block_entry) when the
/// block is dropped from every tier.
pub struct BlockLockTable {
    tables: Mutex<LockTables>,
    released: Condvar,
}

impl Default for BlockLockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockLockTable {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(LockTables::default()),
            released: Condvar::new(),
        }
    }

    /// Create the lock record for a new block, already write-locked by
    /// `task`. Returns false if the block is already registered.
    pub fn register(&self, id: &BlockId, task: TaskAttemptId) -> bool {
        let mut tables = self.tables.lock();
        if tables.blocks.contains_key(id) {
            return false;
        }
        tables.blocks.insert(
            id.clone(),
            LockState {
                readers: HashMap::new(),
                writer: Some(task),
            },
        );
        tables.note_hold(task, id);
        trace!(event = "block_registered", block = %id, task = %task);
        true
    }

    pub fn lock_for_writing(
        &self,
        id: &BlockId,
        task: TaskAttemptId,
        blocking: bool,
    ) -> LockOutcome {
        let mut tables = self.tables.lock();
        loop {
            let Some(state) = tables.blocks.get_mut(id) else {
                return LockOutcome::UnknownBlock;
            };
            // A hold by the requesting task itself (e.g. its own read pin
            // on an eviction candidate) is contention, never a wait: the
            // wait could only end with the task releasing its own hold.
            if state.held_by(task) {
                return LockOutcome::Contended;
            }
            if state.writer.is_none() && state.readers.is_empty() {
                state.writer = Some(task);
                tables.note_hold(task, id);
                return LockOutcome::Acquired;
            }
            if !blocking {
                return LockOutcome::Contended;
            }
            self.released.wait(&mut tables);
        }
    }

    pub fn lock_for_reading(
        &self,
        id: &BlockId,
        task: TaskAttemptId,
        blocking: bool,
    ) -> LockOutcome {
        let mut tables = self.tables.lock();
        loop {
            let Some(state) = tables.blocks.get_mut(id) else {
                return LockOutcome::UnknownBlock;
            };
            if state.writer == Some(task) {
                return LockOutcome::Contended;
            }
            if state.writer.is_none() {
                *state.readers.entry(task).or_insert(0) += 1;
                tables.note_hold(task, id);
                return LockOutcome::Acquired;
            }
            if !blocking {
                return LockOutcome::Contended;
            }
            self.released.wait(&mut tables);
        }
    }

    /// Exchange `task`'s write lock for a read lock, making the block
    /// visible to other readers without a window where it is unlocked.
    pub fn downgrade(&self, id: &BlockId, task: TaskAttemptId) {
        let mut tables = self.tables.lock();
        let Some(state) = tables.blocks.get_mut(id) else {
            debug_assert!(false, "downgrade on unknown block");
            return;
        };
        debug_assert_eq!(state.writer, Some(task), "downgrade by non-writer");
        if state.writer == Some(task) {
            state.writer = None;
            *state.readers.entry(task).or_insert(0) += 1;
            self.released.notify_all();
        }
    }

    /// Release one hold `task` has on the block (the write lock, or one
    /// read pin) and wake waiters.
    pub fn unlock(&self, id: &BlockId, task: TaskAttemptId) {
        let mut tables = self.tables.lock();
        let Some(state) = tables.blocks.get_mut(id) else {
            warn!(event = "unlock_unknown_block", block = %id, task = %task);
            return;
        };
        if state.writer == Some(task) {
            state.writer = None;
        } else {
            match state.readers.get_mut(&task) {
                Some(pins) if *pins > 1 => *pins -= 1,
                Some(_) => {
                    state.readers.remove(&task);
                }
                None => {
                    warn!(event = "unlock_without_hold", block = %id, task = %task);
                    return;
                }
            }
        }
        if !state.held_by(task) {
            tables.forget_hold(task, id);
        }
        self.released.notify_all();
    }

    /// Drop every lock `task` holds. Returns the blocks that were touched.
    ///
    /// The sole cleanup path for tasks that end without unlocking.
    pub fn release_all_locks_for_task(&self, task: TaskAttemptId) -> Vec<BlockId> {
        let mut tables = self.tables.lock();
        let Some(blocks) = tables.by_task.remove(&task) else {
            return Vec::new();
        };
        let mut touched = Vec::with_capacity(blocks.len());
        for id in blocks {
            if let Some(state) = tables.blocks.get_mut(&id) {
                if state.writer == Some(task) {
                    state.writer = None;
                }
                state.readers.remove(&task);
                touched.push(id);
            }
        }
        self.released.notify_all();
        trace!(event = "task_locks_released", task = %task, blocks = touched.len());
        touched
    }

    /// Destroy the lock record while the caller holds the write lock.
    ///
    /// Waiters are woken so blocked readers re-check and observe the block
    /// as unknown.
    pub fn remove_block_entry(&self, id: &BlockId) {
        let mut tables = self.tables.lock();
        let Some(state) = tables.blocks.remove(id) else {
            debug_assert!(false, "removing unknown lock record");
            return;
        };
        debug_assert!(
            state.writer.is_some() && state.readers.is_empty(),
            "lock record removed without holding the write lock"
        );
        if let Some(writer) = state.writer {
            tables.forget_hold(writer, id);
        }
        self.released.notify_all();
    }

    /// Drop every record. Shutdown path; any waiters are woken and will
    /// observe their blocks as unknown.
    pub fn clear(&self) {
        let mut tables = self.tables.lock();
        tables.blocks.clear();
        tables.by_task.clear();
        self.released.notify_all();
    }

    #[must_use]
    pub fn read_lock_count(&self, id: &BlockId) -> usize {
        self.tables
            .lock()
            .blocks
            .get(id)
            .map_or(0, LockState::read_count)
    }

    #[must_use]
    pub fn writer_task(&self, id: &BlockId) -> Option<TaskAttemptId> {
        self.tables.lock().blocks.get(id).and_then(|s| s.writer)
    }

    #[must_use]
    pub fn is_registered(&self, id: &BlockId) -> bool {
        self.tables.lock().blocks.contains_key(id)
    }

    #[must_use]
    pub fn tracked_block_count(&self) -> usize {
        self.tables.lock().blocks.len()
    }
}
