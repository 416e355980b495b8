//! Incremental materialization of record sequences of unknown length.
//!
//! Both unroll variants share one control structure: reserve an initial
//! threshold, append records while periodically comparing the buffer's
//! size against the reservation, and grow the reservation by the
//! configured factor when the buffer catches up. A refused growth stops
//! the loop with the records appended so far; the caller decides whether
//! to hand the partial buffer back or promote a complete one to storage.

use crate::accounting::MemoryAccountant;
use crate::entry::{ChunkedBuf, ChunkedBufWriter};
use crate::estimate::{HeapSize, SizeTrackingVec};
use crate::{SerializationStream, StoreConfig};
use parking_lot::Mutex;
use riffle_error::Result;
use riffle_types::{BlockId, MemoryMode, TaskAttemptId};
use std::io::{self, Write};
use std::sync::Arc;
use tracing::trace;

/// Reservation source for the unroll loop.
///
/// The store implements this with its evict-and-retry admission wrapper;
/// the accountant alone satisfies it for components that must not evict.
pub(crate) trait UnrollMemory {
    fn reserve_unroll(&self, id: &BlockId, task: TaskAttemptId, n: u64, mode: MemoryMode) -> bool;
    fn release_unroll(&self, task: TaskAttemptId, n: u64, mode: MemoryMode);
}

impl UnrollMemory for MemoryAccountant {
    fn reserve_unroll(&self, id: &BlockId, task: TaskAttemptId, n: u64, mode: MemoryMode) -> bool {
        self.acquire_unroll(id, task, n, mode)
    }

    fn release_unroll(&self, task: TaskAttemptId, n: u64, mode: MemoryMode) {
        MemoryAccountant::release_unroll(self, task, n, mode);
    }
}

/// Ownership of an unroll reservation held by a partial-put handle.
///
/// The credit is returned to the accountant when the lease is dropped, so
/// discarding a partial handle can never leak reservation.
pub struct UnrollLease {
    accountant: Arc<MemoryAccountant>,
    task: TaskAttemptId,
    mode: MemoryMode,
    bytes: u64,
}

impl UnrollLease {
    pub(crate) fn new(
        accountant: Arc<MemoryAccountant>,
        task: TaskAttemptId,
        mode: MemoryMode,
        bytes: u64,
    ) -> Self {
        Self {
            accountant,
            task,
            mode,
            bytes,
        }
    }

    /// Bytes of unroll credit still held.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    fn release_now(&mut self) {
        if self.bytes > 0 {
            self.accountant
                .release_unroll(self.task, self.bytes, self.mode);
            self.bytes = 0;
        }
    }
}

impl Drop for UnrollLease {
    fn drop(&mut self) {
        self.release_now();
    }
}

pub(crate) enum ValuesUnrollOutcome<R, I> {
    Complete {
        vector: SizeTrackingVec<R>,
        reserved: u64,
        drained: I,
    },
    Incomplete {
        vector: SizeTrackingVec<R>,
        rest: I,
        reserved: u64,
    },
}

/// Values-variant unroll loop. The buffer is always on-heap.
pub(crate) fn unroll_values<R, I, M>(
    mem: &M,
    conf: &StoreConfig,
    id: &BlockId,
    task: TaskAttemptId,
    mut source: I,
) -> ValuesUnrollOutcome<R, I>
where
    R: HeapSize,
    I: Iterator<Item = R>,
    M: UnrollMemory + ?Sized,
{
    let mode = MemoryMode::OnHeap;
    let mut vector = SizeTrackingVec::new();
    if !mem.reserve_unroll(id, task, conf.unroll_initial_threshold_bytes, mode) {
        return ValuesUnrollOutcome::Incomplete {
            vector,
            rest: source,
            reserved: 0,
        };
    }
    let mut reserved = conf.unroll_initial_threshold_bytes;

    while let Some(record) = source.next() {
        vector.push(record);
        if vector.len() as u64 % conf.unroll_check_period_records != 0 {
            continue;
        }
        let estimate = vector.estimated_size();
        if estimate < reserved {
            continue;
        }
        let target = (estimate as f64 * conf.unroll_growth_factor).ceil() as u64;
        let request = target.saturating_sub(reserved);
        if mem.reserve_unroll(id, task, request, mode) {
            reserved += request;
        } else {
            trace!(
                event = "unroll_stopped",
                block = %id,
                records = vector.len(),
                reserved,
                estimate,
            );
            return ValuesUnrollOutcome::Incomplete {
                vector,
                rest: source,
                reserved,
            };
        }
    }

    ValuesUnrollOutcome::Complete {
        vector,
        reserved,
        drained: source,
    }
}

pub(crate) enum BytesUnrollOutcome<R, I> {
    Complete {
        buf: ChunkedBuf,
        reserved: u64,
        drained: I,
    },
    Incomplete {
        /// Still open unless the input was exhausted before the final
        /// shortfall was refused.
        stream: Option<Box<dyn SerializationStream<R>>>,
        writer: ChunkedBufWriter,
        redirect: RedirectableWriter,
        rest: I,
        reserved: u64,
    },
}

/// Bytes-variant unroll loop.
///
/// `stream` must drain into `writer` (usually through a compression
/// wrapper over `redirect`); the loop watches the writer's exact byte
/// count after every record. A reservation refusal leaves the stream
/// open so the partial handle can keep encoding into another sink.
pub(crate) fn unroll_bytes<R, I, M>(
    mem: &M,
    conf: &StoreConfig,
    id: &BlockId,
    task: TaskAttemptId,
    mode: MemoryMode,
    mut stream: Box<dyn SerializationStream<R>>,
    writer: ChunkedBufWriter,
    redirect: RedirectableWriter,
    mut source: I,
) -> Result<BytesUnrollOutcome<R, I>>
where
    I: Iterator<Item = R>,
    M: UnrollMemory + ?Sized,
{
    if !mem.reserve_unroll(id, task, conf.unroll_initial_threshold_bytes, mode) {
        return Ok(BytesUnrollOutcome::Incomplete {
            stream: Some(stream),
            writer,
            redirect,
            rest: source,
            reserved: 0,
        });
    }
    let mut reserved = conf.unroll_initial_threshold_bytes;

    while let Some(record) = source.next() {
        if let Err(err) = stream.write_record(&record) {
            mem.release_unroll(task, reserved, mode);
            return Err(err);
        }
        let written = writer.bytes_written();
        if written < reserved {
            continue;
        }
        let target = (written as f64 * conf.unroll_growth_factor).ceil() as u64;
        let request = target.saturating_sub(reserved);
        if mem.reserve_unroll(id, task, request, mode) {
            reserved += request;
        } else {
            trace!(
                event = "unroll_stopped",
                block = %id,
                bytes = written,
                reserved,
            );
            return Ok(BytesUnrollOutcome::Incomplete {
                stream: Some(stream),
                writer,
                redirect,
                rest: source,
                reserved,
            });
        }
    }

    // Flush whatever the encoder stack buffered, then reconcile the exact
    // byte count with one final acquire for the shortfall.
    if let Err(err) = stream.finish() {
        mem.release_unroll(task, reserved, mode);
        return Err(err);
    }
    let size = writer.bytes_written();
    if size > reserved {
        let shortfall = size - reserved;
        if mem.reserve_unroll(id, task, shortfall, mode) {
            reserved += shortfall;
        } else {
            return Ok(BytesUnrollOutcome::Incomplete {
                stream: None,
                writer,
                redirect,
                rest: source,
                reserved,
            });
        }
    }

    Ok(BytesUnrollOutcome::Complete {
        buf: writer.finish(),
        reserved,
        drained: source,
    })
}

/// Write sink whose target can be swapped mid-stream.
///
/// Sits at the bottom of the bytes-variant encoder stack; a partial put
/// retargets it from the chunked buffer to the caller's sink and keeps
/// encoding through the same (stateful) stream.
#[derive(Clone)]
pub(crate) struct RedirectableWriter {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl RedirectableWriter {
    pub(crate) fn new(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    pub(crate) fn redirect(&self, new_sink: Box<dyn Write + Send>) {
        *self.sink.lock() = new_sink;
    }
}

impl Write for RedirectableWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.lock().flush()
    }
}

/// Result of a values put that ran out of memory partway.
///
/// Iterating yields the unrolled prefix first, then the untouched
/// remainder of the input. The unroll reservation backing the prefix is
/// released once the prefix is consumed, or when the handle is dropped.
pub struct PartiallyUnrolledValues<R, I> {
    unrolled: std::vec::IntoIter<R>,
    rest: I,
    lease: UnrollLease,
}

impl<R, I: Iterator<Item = R>> PartiallyUnrolledValues<R, I> {
    pub(crate) fn new(unrolled: Vec<R>, rest: I, lease: UnrollLease) -> Self {
        Self {
            unrolled: unrolled.into_iter(),
            rest,
            lease,
        }
    }

    /// The records that were materialized before memory ran out.
    #[must_use]
    pub fn unrolled(&self) -> &[R] {
        self.unrolled.as_slice()
    }

    /// Unroll reservation still held on behalf of the prefix.
    #[must_use]
    pub fn reservation_held(&self) -> u64 {
        self.lease.bytes()
    }

    /// Decompose into the prefix and the remainder, releasing the
    /// reservation immediately.
    #[must_use]
    pub fn into_parts(self) -> (Vec<R>, I) {
        let Self {
            unrolled,
            rest,
            lease,
        } = self;
        drop(lease);
        (unrolled.collect(), rest)
    }
}

impl<R, I: Iterator<Item = R>> Iterator for PartiallyUnrolledValues<R, I> {
    type Item = R;

    fn next(&mut self) -> Option<R> {
        if let Some(record) = self.unrolled.next() {
            return Some(record);
        }
        self.lease.release_now();
        self.rest.next()
    }
}

/// Result of a bytes put that ran out of memory partway.
///
/// The encoder stream is kept open, so the block can still be written out
/// in full: [`finish_to_writer`](Self::finish_to_writer) streams the
/// already-encoded prefix to a sink and then encodes the remainder
/// through the same stream.
pub struct PartiallySerializedBlock<R, I> {
    stream: Option<Box<dyn SerializationStream<R>>>,
    writer: ChunkedBufWriter,
    redirect: RedirectableWriter,
    rest: I,
    lease: UnrollLease,
}

impl<R, I: Iterator<Item = R>> PartiallySerializedBlock<R, I> {
    pub(crate) fn new(
        stream: Option<Box<dyn SerializationStream<R>>>,
        writer: ChunkedBufWriter,
        redirect: RedirectableWriter,
        rest: I,
        lease: UnrollLease,
    ) -> Self {
        Self {
            stream,
            writer,
            redirect,
            rest,
            lease,
        }
    }

    /// Bytes already encoded into the buffered prefix.
    #[must_use]
    pub fn unrolled_bytes(&self) -> u64 {
        self.writer.bytes_written()
    }

    /// Unroll reservation held for the buffered prefix.
    #[must_use]
    pub fn reservation_held(&self) -> u64 {
        self.lease.bytes()
    }

    /// Write the complete encoded block to `sink`: the buffered prefix
    /// verbatim, then the remaining records through the still-open
    /// encoder stream. Consumes the handle and releases the reservation.
    pub fn finish_to_writer<W: Write + Send + 'static>(mut self, sink: W) -> Result<()> {
        self.redirect.redirect(Box::new(sink));
        let prefix = self.writer.finish();
        let mut raw = self.redirect.clone();
        prefix.write_to(&mut raw)?;
        if let Some(mut stream) = self.stream.take() {
            for record in self.rest.by_ref() {
                stream.write_record(&record)?;
            }
            stream.finish()?;
        }
        Ok(())
    }

    /// Abandon the block, keeping only the unencoded remainder.
    #[must_use]
    pub fn into_rest(self) -> I {
        let Self { rest, .. } = self;
        rest
    }
}
