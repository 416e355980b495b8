#![forbid(unsafe_code)]
//! In-memory block store with cooperative unroll-and-evict admission.
//!
//! Caches partitioned computation results in two bounded pools (on-heap
//! and off-heap), admits blocks of unknown size by incrementally
//! unrolling their record sequences, and makes room under pressure by
//! evicting least-recently-accessed blocks that are neither read-locked
//! nor siblings of the requesting block's dataset. Overflow is delegated
//! to an external [`BlockEvictionHandler`]; the store itself performs no
//! disk I/O.

pub mod accounting;
pub mod entry;
pub mod estimate;
pub mod locks;
mod unroll;

pub use accounting::{MemoryAccountant, MemorySnapshot, ModeSnapshot};
pub use entry::{BlockValues, ChunkedBuf, ChunkedBufWriter, MemoryEntry};
pub use estimate::{HeapSize, SizeTrackingVec};
pub use locks::{BlockLockTable, LockOutcome};
pub use unroll::{PartiallySerializedBlock, PartiallyUnrolledValues, UnrollLease};

use parking_lot::Mutex;
use riffle_error::{AdmissionReason, Result, RiffleError};
use riffle_types::{BlockId, MemoryMode, StorageLevel, TaskAttemptId};
use std::cell::Cell;
use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, trace};

use unroll::{BytesUnrollOutcome, RedirectableWriter, UnrollMemory, ValuesUnrollOutcome};

/// Numeric knobs consumed by the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreConfig {
    /// Ceiling of the on-heap pool.
    pub max_on_heap_bytes: u64,
    /// Ceiling of the off-heap pool.
    pub max_off_heap_bytes: u64,
    /// Share of each pool initially dedicated to storage (the rest is
    /// observed execution room). Unroll reservations are capped at this
    /// region.
    pub storage_region_fraction: f64,
    /// First unroll reservation per put.
    pub unroll_initial_threshold_bytes: u64,
    /// Records between size re-estimates in the values unroll.
    pub unroll_check_period_records: u64,
    /// Multiplier for successive unroll reservations; must be > 1.
    pub unroll_growth_factor: f64,
    /// Chunk size for the serialized-variant output stream.
    pub chunk_size_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_on_heap_bytes: 1024 * 1024 * 1024,
            max_off_heap_bytes: 0,
            storage_region_fraction: 0.5,
            unroll_initial_threshold_bytes: 1024 * 1024,
            unroll_check_period_records: 16,
            unroll_growth_factor: 1.5,
            chunk_size_bytes: 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn validate(self) -> Result<Self> {
        if !(self.storage_region_fraction > 0.0 && self.storage_region_fraction <= 1.0) {
            return Err(RiffleError::InvalidConfig(
                "storage_region_fraction must be in (0, 1]".to_owned(),
            ));
        }
        if self.unroll_growth_factor <= 1.0 {
            return Err(RiffleError::InvalidConfig(
                "unroll_growth_factor must be > 1".to_owned(),
            ));
        }
        if self.unroll_check_period_records == 0 {
            return Err(RiffleError::InvalidConfig(
                "unroll_check_period_records must be > 0".to_owned(),
            ));
        }
        if self.unroll_initial_threshold_bytes == 0 {
            return Err(RiffleError::InvalidConfig(
                "unroll_initial_threshold_bytes must be > 0".to_owned(),
            ));
        }
        if self.chunk_size_bytes == 0 {
            return Err(RiffleError::InvalidConfig(
                "chunk_size_bytes must be > 0".to_owned(),
            ));
        }
        Ok(self)
    }
}

/// Payload view handed to the eviction handler.
pub enum EvictedData<'a, R> {
    Values(&'a [R]),
    Bytes(&'a ChunkedBuf),
}

/// External spill seam consulted for every evicted block.
///
/// The returned [`StorageLevel`] tells the store whether the block is
/// still findable in another tier; if so its lock record is kept so a
/// future reader can be redirected there.
///
/// Implementations must complete or fail definitely, must not block on
/// the store's own locks, and must not call back into the store from the
/// evicting thread.
pub trait BlockEvictionHandler<R>: Send + Sync {
    fn drop_from_memory(&self, id: &BlockId, data: EvictedData<'_, R>) -> StorageLevel;
}

/// Handler that simply discards evicted payloads.
pub struct DiscardOnEvict;

impl<R> BlockEvictionHandler<R> for DiscardOnEvict {
    fn drop_from_memory(&self, _id: &BlockId, _data: EvictedData<'_, R>) -> StorageLevel {
        StorageLevel::NONE
    }
}

/// Encoder for one block's record stream.
pub trait SerializationStream<R>: Send {
    fn write_record(&mut self, record: &R) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    /// Flush any internal buffering and seal the stream.
    fn finish(&mut self) -> Result<()>;
}

pub trait Serializer<R>: Send + Sync {
    fn new_stream(&self, sink: Box<dyn Write + Send>) -> Box<dyn SerializationStream<R>>;
}

/// Codec selection seam used by the bytes-variant unroll.
pub trait SerializerManager<R>: Send + Sync {
    /// Wrap `sink` in the compression configured for `id`'s block kind.
    fn wrap_for_compression(
        &self,
        id: &BlockId,
        sink: Box<dyn Write + Send>,
    ) -> Box<dyn Write + Send>;

    /// Pick a serializer; `auto_pick` permits choosing a cheaper codec
    /// when the record type allows it.
    fn get_serializer(&self, auto_pick: bool) -> Arc<dyn Serializer<R>>;
}

/// Result of an iterator put in the values variant.
#[must_use]
pub enum ValuesPutOutcome<R, I> {
    /// The block was admitted; carries its final stored size.
    Stored(u64),
    /// Memory ran out partway; the handle recovers every record.
    Partial(PartiallyUnrolledValues<R, I>),
}

impl<R, I> ValuesPutOutcome<R, I> {
    #[must_use]
    pub fn stored_size(&self) -> Option<u64> {
        match self {
            ValuesPutOutcome::Stored(size) => Some(*size),
            ValuesPutOutcome::Partial(_) => None,
        }
    }
}

/// Result of an iterator put in the bytes variant.
#[must_use]
pub enum BytesPutOutcome<R, I> {
    Stored(u64),
    Partial(PartiallySerializedBlock<R, I>),
}

impl<R, I> BytesPutOutcome<R, I> {
    #[must_use]
    pub fn stored_size(&self) -> Option<u64> {
        match self {
            BytesPutOutcome::Stored(size) => Some(*size),
            BytesPutOutcome::Partial(_) => None,
        }
    }
}

/// Point-in-time store statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreMetrics {
    pub blocks: usize,
    pub deserialized_blocks: usize,
    pub serialized_blocks: usize,
    pub on_heap_bytes: u64,
    pub off_heap_bytes: u64,
    pub memory: MemorySnapshot,
}

struct IndexRecord<R> {
    seq: u64,
    entry: MemoryEntry<R>,
}

/// Access-ordered block index: `get` promotes, eviction walks
/// least-recently-accessed first. Ordering rides a logical clock in a
/// `BTreeSet<(seq, id)>` beside the id-keyed map.
struct AccessOrderedIndex<R> {
    next_seq: u64,
    by_block: HashMap<BlockId, IndexRecord<R>>,
    by_access: BTreeSet<(u64, BlockId)>,
}

impl<R> AccessOrderedIndex<R> {
    fn new() -> Self {
        Self {
            next_seq: 0,
            by_block: HashMap::new(),
            by_access: BTreeSet::new(),
        }
    }

    fn insert(&mut self, id: BlockId, entry: MemoryEntry<R>) {
        debug_assert!(!self.by_block.contains_key(&id), "duplicate index insert");
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_access.insert((seq, id.clone()));
        self.by_block.insert(id, IndexRecord { seq, entry });
    }

    fn get_promote(&mut self, id: &BlockId) -> Option<&MemoryEntry<R>> {
        let seq = self.next_seq;
        let record = self.by_block.get_mut(id)?;
        self.by_access.remove(&(record.seq, id.clone()));
        record.seq = seq;
        self.by_access.insert((seq, id.clone()));
        self.next_seq += 1;
        Some(&record.entry)
    }

    fn peek(&self, id: &BlockId) -> Option<&MemoryEntry<R>> {
        self.by_block.get(id).map(|r| &r.entry)
    }

    fn contains(&self, id: &BlockId) -> bool {
        self.by_block.contains_key(id)
    }

    fn remove(&mut self, id: &BlockId) -> Option<MemoryEntry<R>> {
        let record = self.by_block.remove(id)?;
        self.by_access.remove(&(record.seq, id.clone()));
        Some(record.entry)
    }

    fn len(&self) -> usize {
        self.by_block.len()
    }

    fn iter_access_order(&self) -> impl Iterator<Item = (&BlockId, &MemoryEntry<R>)> {
        self.by_access
            .iter()
            .map(move |(_, id)| (id, &self.by_block[id].entry))
    }

    fn drain(&mut self) -> Vec<(BlockId, MemoryEntry<R>)> {
        self.by_access.clear();
        self.next_seq = 0;
        self.by_block
            .drain()
            .map(|(id, record)| (id, record.entry))
            .collect()
    }

    fn bytes_in_mode(&self, mode: MemoryMode) -> u64 {
        self.by_block
            .values()
            .filter(|r| r.entry.mode() == mode)
            .map(|r| r.entry.size())
            .sum()
    }
}

thread_local! {
    static IN_EVICTION_HANDLER: Cell<bool> = const { Cell::new(false) };
}

struct HandlerScope;

impl HandlerScope {
    fn enter() -> Self {
        IN_EVICTION_HANDLER.with(|flag| flag.set(true));
        HandlerScope
    }
}

impl Drop for HandlerScope {
    fn drop(&mut self) {
        IN_EVICTION_HANDLER.with(|flag| flag.set(false));
    }
}

fn ensure_not_reentrant() -> Result<()> {
    if IN_EVICTION_HANDLER.with(Cell::get) {
        return Err(RiffleError::ReentrantEviction);
    }
    Ok(())
}

/// Write locks secured on eviction candidates, released on drop for any
/// candidate not yet handed to the eviction handler.
struct CandidateLocks<'a> {
    locks: &'a BlockLockTable,
    task: TaskAttemptId,
    pending: Vec<BlockId>,
}

impl CandidateLocks<'_> {
    fn take(&mut self, id: &BlockId) {
        if let Some(pos) = self.pending.iter().position(|b| b == id) {
            self.pending.remove(pos);
        }
    }
}

impl Drop for CandidateLocks<'_> {
    fn drop(&mut self) {
        for id in &self.pending {
            self.locks.unlock(id, self.task);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct EvictAttempt {
    freed: u64,
    /// Bytes of unlockable, differently-owned candidates that were found.
    candidate_bytes: u64,
    /// Bytes skipped because they belong to the requesting block's
    /// dataset. Only these justify an `EvictionForbidden` rejection.
    dataset_excluded_bytes: u64,
    /// Bytes skipped because the non-blocking write lock was refused.
    /// A shortfall caused purely by read pins is transient and reports
    /// as `InsufficientMemory`.
    contended_bytes: u64,
}

enum EvictedPayload<R> {
    Values(Arc<Vec<R>>),
    Bytes(ChunkedBuf),
}

/// Single entry point over the accountant, lock table, unroll engine and
/// block index.
///
/// Admission that needs eviction is serialized behind one mutex: the
/// evict-and-retry pair (and therefore every handler callout) runs under
/// it, so two putters can never race each other for the same freed bytes.
/// The same mutex guards every storage-counter/index pair (publish,
/// eviction, `remove`, `clear`) and gates the composite reader
/// (`metrics`), so no observer can catch the accountant and the index
/// disagreeing about resident bytes. Acquisitions that fit in free room
/// bypass the mutex.
pub struct MemoryStore<R> {
    conf: StoreConfig,
    accountant: Arc<MemoryAccountant>,
    locks: Arc<BlockLockTable>,
    index: Mutex<AccessOrderedIndex<R>>,
    admission: Mutex<()>,
    handler: Arc<dyn BlockEvictionHandler<R>>,
    serializers: Arc<dyn SerializerManager<R>>,
}

impl<R> MemoryStore<R> {
    pub fn new(
        conf: StoreConfig,
        handler: Arc<dyn BlockEvictionHandler<R>>,
        serializers: Arc<dyn SerializerManager<R>>,
    ) -> Result<Self> {
        let conf = conf.validate()?;
        info!(
            event = "memstore_created",
            max_on_heap = conf.max_on_heap_bytes,
            max_off_heap = conf.max_off_heap_bytes,
        );
        Ok(Self {
            conf,
            accountant: Arc::new(MemoryAccountant::new(
                conf.max_on_heap_bytes,
                conf.max_off_heap_bytes,
                conf.storage_region_fraction,
            )),
            locks: Arc::new(BlockLockTable::new()),
            index: Mutex::new(AccessOrderedIndex::new()),
            admission: Mutex::new(()),
            handler,
            serializers,
        })
    }

    #[must_use]
    pub fn accountant(&self) -> &MemoryAccountant {
        &self.accountant
    }

    #[must_use]
    pub fn lock_table(&self) -> &BlockLockTable {
        &self.locks
    }

    /// Store an already-serialized payload whose final size is known.
    ///
    /// The supplier is only invoked once the storage reservation has been
    /// secured, so callers can defer materializing the buffer.
    pub fn put_bytes<F>(
        &self,
        id: &BlockId,
        task: TaskAttemptId,
        size: u64,
        mode: MemoryMode,
        bytes: F,
    ) -> Result<()>
    where
        F: FnOnce() -> ChunkedBuf,
    {
        ensure_not_reentrant()?;
        if !self.locks.register(id, task) {
            return Err(RiffleError::DuplicateBlock(id.to_string()));
        }

        let rejection = {
            let _admit = self.admission.lock();
            match self.reserve_storage(id, task, size, mode) {
                Ok(()) => {
                    let buf = bytes();
                    debug_assert_eq!(buf.len(), size, "supplier size mismatch");
                    self.index
                        .lock()
                        .insert(id.clone(), MemoryEntry::Serialized { bytes: buf, mode });
                    None
                }
                Err(reason) => Some(reason),
            }
        };

        match rejection {
            None => {
                self.locks.downgrade(id, task);
                self.locks.unlock(id, task);
                debug!(event = "block_stored", block = %id, bytes = size, mode = %mode);
                Ok(())
            }
            Some(reason) => {
                self.locks.remove_block_entry(id);
                debug!(event = "admission_rejected", block = %id, bytes = size, reason = %reason);
                Err(RiffleError::AdmissionRejected {
                    block: id.to_string(),
                    reason,
                })
            }
        }
    }

    /// Materialize a record sequence into a deserialized on-heap entry.
    ///
    /// Memory is reserved incrementally while the sequence is consumed;
    /// if the store fills up partway the put fails without publishing and
    /// the returned handle yields the materialized prefix followed by the
    /// untouched remainder.
    pub fn put_iterator_as_values<I>(
        &self,
        id: &BlockId,
        task: TaskAttemptId,
        values: I,
    ) -> Result<ValuesPutOutcome<R, I::IntoIter>>
    where
        R: HeapSize,
        I: IntoIterator<Item = R>,
    {
        ensure_not_reentrant()?;
        if !self.locks.register(id, task) {
            return Err(RiffleError::DuplicateBlock(id.to_string()));
        }

        let reserver = StoreUnrollMemory { store: self };
        match unroll::unroll_values(&reserver, &self.conf, id, task, values.into_iter()) {
            ValuesUnrollOutcome::Complete {
                vector,
                reserved,
                drained,
            } => {
                let size = vector.estimated_size();
                let records = vector.into_values();
                let publish = {
                    let _admit = self.admission.lock();
                    if self.transfer_with_eviction(id, task, reserved, size, MemoryMode::OnHeap) {
                        self.index.lock().insert(
                            id.clone(),
                            MemoryEntry::Deserialized {
                                values: Arc::new(records),
                                size,
                            },
                        );
                        Ok(())
                    } else {
                        Err(records)
                    }
                };
                match publish {
                    Ok(()) => {
                        self.locks.downgrade(id, task);
                        self.locks.unlock(id, task);
                        debug!(event = "block_stored", block = %id, bytes = size, mode = %MemoryMode::OnHeap);
                        Ok(ValuesPutOutcome::Stored(size))
                    }
                    Err(records) => {
                        self.locks.remove_block_entry(id);
                        let lease = UnrollLease::new(
                            Arc::clone(&self.accountant),
                            task,
                            MemoryMode::OnHeap,
                            reserved,
                        );
                        Ok(ValuesPutOutcome::Partial(PartiallyUnrolledValues::new(
                            records, drained, lease,
                        )))
                    }
                }
            }
            ValuesUnrollOutcome::Incomplete {
                vector,
                rest,
                reserved,
            } => {
                self.locks.remove_block_entry(id);
                let lease = UnrollLease::new(
                    Arc::clone(&self.accountant),
                    task,
                    MemoryMode::OnHeap,
                    reserved,
                );
                debug!(event = "put_unrolled_partially", block = %id, records = vector.len(), reserved);
                Ok(ValuesPutOutcome::Partial(PartiallyUnrolledValues::new(
                    vector.into_values(),
                    rest,
                    lease,
                )))
            }
        }
    }

    /// Encode a record sequence into a serialized entry in either mode.
    pub fn put_iterator_as_bytes<I>(
        &self,
        id: &BlockId,
        task: TaskAttemptId,
        mode: MemoryMode,
        values: I,
    ) -> Result<BytesPutOutcome<R, I::IntoIter>>
    where
        I: IntoIterator<Item = R>,
    {
        ensure_not_reentrant()?;
        if !self.locks.register(id, task) {
            return Err(RiffleError::DuplicateBlock(id.to_string()));
        }

        let writer = ChunkedBufWriter::new(self.conf.chunk_size_bytes);
        let redirect = RedirectableWriter::new(Box::new(writer.clone()));
        let compressed = self
            .serializers
            .wrap_for_compression(id, Box::new(redirect.clone()));
        let stream = self.serializers.get_serializer(true).new_stream(compressed);

        let reserver = StoreUnrollMemory { store: self };
        let outcome = match unroll::unroll_bytes(
            &reserver,
            &self.conf,
            id,
            task,
            mode,
            stream,
            writer,
            redirect,
            values.into_iter(),
        ) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.locks.remove_block_entry(id);
                return Err(err);
            }
        };

        match outcome {
            BytesUnrollOutcome::Complete { buf, reserved, .. } => {
                let size = buf.len();
                let transferred = {
                    let _admit = self.admission.lock();
                    let ok = self
                        .accountant
                        .transfer_unroll_to_storage(id, task, reserved, size, mode);
                    debug_assert!(ok, "transfer within reservation cannot fail");
                    if ok {
                        self.index
                            .lock()
                            .insert(id.clone(), MemoryEntry::Serialized { bytes: buf, mode });
                    }
                    ok
                };
                if transferred {
                    self.locks.downgrade(id, task);
                    self.locks.unlock(id, task);
                    debug!(event = "block_stored", block = %id, bytes = size, mode = %mode);
                    Ok(BytesPutOutcome::Stored(size))
                } else {
                    self.accountant.release_unroll(task, reserved, mode);
                    self.locks.remove_block_entry(id);
                    Err(RiffleError::AdmissionRejected {
                        block: id.to_string(),
                        reason: AdmissionReason::InsufficientMemory,
                    })
                }
            }
            BytesUnrollOutcome::Incomplete {
                stream,
                writer,
                redirect,
                rest,
                reserved,
            } => {
                self.locks.remove_block_entry(id);
                let lease = UnrollLease::new(Arc::clone(&self.accountant), task, mode, reserved);
                debug!(event = "put_unrolled_partially", block = %id, bytes = writer.bytes_written(), reserved);
                Ok(BytesPutOutcome::Partial(PartiallySerializedBlock::new(
                    stream, writer, redirect, rest, lease,
                )))
            }
        }
    }

    /// Fetch a serialized block's payload, promoting its access order.
    ///
    /// Returns `WrongVariant` for deserialized entries. The returned
    /// buffer shares storage with the entry and stays valid after
    /// eviction.
    pub fn get_bytes(&self, id: &BlockId, task: TaskAttemptId) -> Result<Option<ChunkedBuf>> {
        ensure_not_reentrant()?;
        if !self.locks.lock_for_reading(id, task, true).is_acquired() {
            return Ok(None);
        }
        let outcome = {
            let mut index = self.index.lock();
            match index.get_promote(id) {
                None => Ok(None),
                Some(MemoryEntry::Serialized { bytes, .. }) => Ok(Some(bytes.clone())),
                Some(entry) => Err(RiffleError::WrongVariant {
                    block: id.to_string(),
                    expected: "serialized",
                    actual: entry.variant_name(),
                }),
            }
        };
        self.locks.unlock(id, task);
        outcome
    }

    /// Fetch a deserialized block's records, promoting its access order.
    pub fn get_values(&self, id: &BlockId, task: TaskAttemptId) -> Result<Option<BlockValues<R>>> {
        ensure_not_reentrant()?;
        if !self.locks.lock_for_reading(id, task, true).is_acquired() {
            return Ok(None);
        }
        let outcome = {
            let mut index = self.index.lock();
            match index.get_promote(id) {
                None => Ok(None),
                Some(MemoryEntry::Deserialized { values, .. }) => {
                    Ok(Some(BlockValues::new(Arc::clone(values))))
                }
                Some(entry) => Err(RiffleError::WrongVariant {
                    block: id.to_string(),
                    expected: "deserialized",
                    actual: entry.variant_name(),
                }),
            }
        };
        self.locks.unlock(id, task);
        outcome
    }

    /// Point query; does not promote access order.
    #[must_use]
    pub fn contains(&self, id: &BlockId) -> bool {
        self.index.lock().contains(id)
    }

    /// Pin a block for reading across facade calls. Blocks while a put
    /// is publishing. Returns false for unknown blocks.
    pub fn pin_for_reading(&self, id: &BlockId, task: TaskAttemptId) -> Result<bool> {
        ensure_not_reentrant()?;
        Ok(self.locks.lock_for_reading(id, task, true).is_acquired())
    }

    /// Release one read pin taken with [`pin_for_reading`](Self::pin_for_reading).
    pub fn unpin(&self, id: &BlockId, task: TaskAttemptId) {
        self.locks.unlock(id, task);
    }

    /// Drop a block and its reservation. Silent if the block is absent.
    pub fn remove(&self, id: &BlockId, task: TaskAttemptId) -> Result<bool> {
        ensure_not_reentrant()?;
        if !self.locks.lock_for_writing(id, task, true).is_acquired() {
            return Ok(false);
        }
        let removed = {
            let _admit = self.admission.lock();
            let removed = self.index.lock().remove(id);
            if let Some(entry) = &removed {
                self.accountant.release_storage(entry.size(), entry.mode());
            }
            removed
        };
        self.locks.remove_block_entry(id);
        match removed {
            Some(entry) => {
                let bytes = entry.size();
                let mode = entry.mode();
                entry.dispose();
                debug!(event = "block_removed", block = %id, bytes, mode = %mode);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop every entry and release every reservation. Shutdown path.
    pub fn clear(&self) -> Result<()> {
        ensure_not_reentrant()?;
        let (drained, on_heap, off_heap) = {
            let _admit = self.admission.lock();
            let drained = self.index.lock().drain();
            let mut on_heap = 0_u64;
            let mut off_heap = 0_u64;
            for (_, entry) in &drained {
                match entry.mode() {
                    MemoryMode::OnHeap => on_heap += entry.size(),
                    MemoryMode::OffHeap => off_heap += entry.size(),
                }
            }
            self.accountant.release_storage(on_heap, MemoryMode::OnHeap);
            self.accountant
                .release_storage(off_heap, MemoryMode::OffHeap);
            (drained, on_heap, off_heap)
        };
        let count = drained.len();
        for (_, entry) in drained {
            entry.dispose();
        }
        self.locks.clear();
        info!(event = "store_cleared", blocks = count, on_heap, off_heap);
        Ok(())
    }

    /// Sweep every lock and unroll reservation `task` still holds.
    ///
    /// Invoked on task completion; the sole safety net for tasks that end
    /// without releasing.
    pub fn release_all_for_task(&self, task: TaskAttemptId) -> usize {
        let blocks = self.locks.release_all_locks_for_task(task);
        let (on_heap, off_heap) = self.accountant.release_all_unroll_for_task(task);
        if on_heap > 0 || off_heap > 0 {
            debug!(event = "task_unroll_reclaimed", task = %task, on_heap, off_heap);
        }
        blocks.len()
    }

    /// Consistent snapshot of the index and the accountant together.
    ///
    /// Taken under the admission gate, so the returned counters always
    /// satisfy `storage_used(mode) == Σ entry.size` per mode, even while
    /// a put is publishing or an eviction is in flight.
    pub fn metrics(&self) -> Result<StoreMetrics> {
        ensure_not_reentrant()?;
        let _admit = self.admission.lock();
        let (blocks, deserialized, serialized, on_heap, off_heap) = {
            let index = self.index.lock();
            let mut deserialized = 0_usize;
            let mut serialized = 0_usize;
            for (_, entry) in index.iter_access_order() {
                match entry {
                    MemoryEntry::Deserialized { .. } => deserialized += 1,
                    MemoryEntry::Serialized { .. } => serialized += 1,
                }
            }
            (
                index.len(),
                deserialized,
                serialized,
                index.bytes_in_mode(MemoryMode::OnHeap),
                index.bytes_in_mode(MemoryMode::OffHeap),
            )
        };
        Ok(StoreMetrics {
            blocks,
            deserialized_blocks: deserialized,
            serialized_blocks: serialized,
            on_heap_bytes: on_heap,
            off_heap_bytes: off_heap,
            memory: self.accountant.snapshot(),
        })
    }

    /// Acquire `n` bytes of storage, evicting and retrying once. Must be
    /// called with the admission mutex held.
    fn reserve_storage(
        &self,
        id: &BlockId,
        task: TaskAttemptId,
        n: u64,
        mode: MemoryMode,
    ) -> std::result::Result<(), AdmissionReason> {
        if self.accountant.acquire_storage(id, n, mode) {
            return Ok(());
        }
        let shortfall = n.saturating_sub(self.accountant.free(mode));
        let attempt = self.evict_to_free(Some(id), task, shortfall, mode);
        if self.accountant.acquire_storage(id, n, mode) {
            return Ok(());
        }
        Err(self.classify_rejection(id, n, mode, attempt))
    }

    /// Promote a completed unroll's reservation to storage, evicting and
    /// retrying once if the measured size outgrew the reservation. Must
    /// be called with the admission mutex held.
    fn transfer_with_eviction(
        &self,
        id: &BlockId,
        task: TaskAttemptId,
        held: u64,
        size: u64,
        mode: MemoryMode,
    ) -> bool {
        if self
            .accountant
            .transfer_unroll_to_storage(id, task, held, size, mode)
        {
            return true;
        }
        let needed = size.saturating_sub(held);
        let shortfall = needed.saturating_sub(self.accountant.free(mode));
        let _ = self.evict_to_free(Some(id), task, shortfall, mode);
        self.accountant
            .transfer_unroll_to_storage(id, task, held, size, mode)
    }

    /// `EvictionForbidden` is reserved for shortfalls the dataset policy
    /// caused: the requirement would have been reachable had same-dataset
    /// siblings been evictable. Read-pinned bytes do not count; that
    /// contention is transient, not a policy rejection.
    fn classify_rejection(
        &self,
        id: &BlockId,
        n: u64,
        mode: MemoryMode,
        attempt: EvictAttempt,
    ) -> AdmissionReason {
        let reachable = self
            .accountant
            .free(mode)
            .saturating_add(attempt.candidate_bytes)
            .saturating_add(attempt.dataset_excluded_bytes);
        let reason = if reachable >= n {
            AdmissionReason::EvictionForbidden
        } else {
            AdmissionReason::InsufficientMemory
        };
        trace!(
            event = "admission_classified",
            block = %id,
            requested = n,
            freed = attempt.freed,
            candidates = attempt.candidate_bytes,
            dataset_excluded = attempt.dataset_excluded_bytes,
            contended = attempt.contended_bytes,
            mode = %mode,
            reason = %reason,
        );
        reason
    }

    /// Evict least-recently-accessed blocks of `mode` until `bytes_needed`
    /// are reclaimed, skipping the requesting block's dataset siblings and
    /// anything that cannot be write-locked without waiting.
    ///
    /// All-or-nothing: if the scan cannot cover the requirement, every
    /// secured lock is released and nothing is evicted. The index lock is
    /// dropped before the handler callout.
    fn evict_to_free(
        &self,
        requesting: Option<&BlockId>,
        task: TaskAttemptId,
        bytes_needed: u64,
        mode: MemoryMode,
    ) -> EvictAttempt {
        if bytes_needed == 0 {
            return EvictAttempt::default();
        }
        let excluded_dataset = requesting.and_then(BlockId::dataset);

        let mut selected: Vec<(BlockId, u64)> = Vec::new();
        let mut selected_bytes = 0_u64;
        let mut dataset_excluded_bytes = 0_u64;
        let mut contended_bytes = 0_u64;
        {
            let index = self.index.lock();
            for (candidate, entry) in index.iter_access_order() {
                if selected_bytes >= bytes_needed {
                    break;
                }
                if entry.mode() != mode {
                    continue;
                }
                if excluded_dataset.is_some() && candidate.dataset() == excluded_dataset {
                    dataset_excluded_bytes += entry.size();
                    continue;
                }
                if self.locks.lock_for_writing(candidate, task, false).is_acquired() {
                    selected_bytes += entry.size();
                    selected.push((candidate.clone(), entry.size()));
                } else {
                    contended_bytes += entry.size();
                }
            }
        }

        let mut secured = CandidateLocks {
            locks: &self.locks,
            task,
            pending: selected.iter().map(|(id, _)| id.clone()).collect(),
        };

        if selected_bytes < bytes_needed {
            trace!(
                event = "eviction_insufficient",
                needed = bytes_needed,
                candidates = selected_bytes,
                dataset_excluded = dataset_excluded_bytes,
                contended = contended_bytes,
                mode = %mode,
            );
            drop(secured);
            return EvictAttempt {
                freed: 0,
                candidate_bytes: selected_bytes,
                dataset_excluded_bytes,
                contended_bytes,
            };
        }

        let mut freed = 0_u64;
        for (candidate, size) in &selected {
            let payload = {
                let index = self.index.lock();
                match index.peek(candidate) {
                    Some(MemoryEntry::Deserialized { values, .. }) => {
                        EvictedPayload::Values(Arc::clone(values))
                    }
                    Some(MemoryEntry::Serialized { bytes, .. }) => {
                        EvictedPayload::Bytes(bytes.clone())
                    }
                    None => {
                        debug_assert!(false, "locked candidate vanished from index");
                        secured.take(candidate);
                        self.locks.unlock(candidate, task);
                        continue;
                    }
                }
            };

            secured.take(candidate);
            let new_level = {
                let _scope = HandlerScope::enter();
                match &payload {
                    EvictedPayload::Values(values) => self
                        .handler
                        .drop_from_memory(candidate, EvictedData::Values(values.as_slice())),
                    EvictedPayload::Bytes(bytes) => self
                        .handler
                        .drop_from_memory(candidate, EvictedData::Bytes(bytes)),
                }
            };

            if let Some(entry) = self.index.lock().remove(candidate) {
                entry.dispose();
            }
            self.accountant.release_storage(*size, mode);
            freed += size;
            if new_level.retains_data() {
                self.locks.unlock(candidate, task);
            } else {
                self.locks.remove_block_entry(candidate);
            }
            debug!(
                event = "block_evicted",
                block = %candidate,
                bytes = size,
                retained = new_level.retains_data(),
                mode = %mode,
            );
        }

        EvictAttempt {
            freed,
            candidate_bytes: selected_bytes,
            dataset_excluded_bytes,
            contended_bytes,
        }
    }
}

/// Admission wrapper handed to the unroll loop: a refused reservation is
/// retried once behind the admission mutex after an eviction pass.
struct StoreUnrollMemory<'a, R> {
    store: &'a MemoryStore<R>,
}

impl<R> UnrollMemory for StoreUnrollMemory<'_, R> {
    fn reserve_unroll(&self, id: &BlockId, task: TaskAttemptId, n: u64, mode: MemoryMode) -> bool {
        if self.store.accountant.acquire_unroll(id, task, n, mode) {
            return true;
        }
        let _admit = self.store.admission.lock();
        if self.store.accountant.acquire_unroll(id, task, n, mode) {
            return true;
        }
        let shortfall = n.saturating_sub(self.store.accountant.free(mode));
        let _ = self.store.evict_to_free(Some(id), task, shortfall, mode);
        self.store.accountant.acquire_unroll(id, task, n, mode)
    }

    fn release_unroll(&self, task: TaskAttemptId, n: u64, mode: MemoryMode) {
        self.store.accountant.release_unroll(task, n, mode);
    }
}
