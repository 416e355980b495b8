//! Resident entry variants and chunked byte buffers.

use parking_lot::Mutex;
use riffle_types::MemoryMode;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::trace;

/// Immutable chunked byte payload of a serialized block.
///
/// Chunks are shared; cloning copies chunk handles, not bytes, so readers
/// can keep a payload alive after the entry itself is evicted.
#[derive(Debug, Clone)]
pub struct ChunkedBuf {
    chunks: Vec<Arc<[u8]>>,
    len: u64,
}

impl ChunkedBuf {
    #[must_use]
    pub fn from_chunks(chunks: Vec<Arc<[u8]>>) -> Self {
        let len = chunks.iter().map(|c| c.len() as u64).sum();
        Self { chunks, len }
    }

    /// Single-chunk buffer over `bytes`.
    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        Self {
            chunks: vec![Arc::from(bytes)],
            len,
        }
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn chunks(&self) -> &[Arc<[u8]>] {
        &self.chunks
    }

    /// Copy every chunk into one contiguous vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(usize::try_from(self.len).unwrap_or(usize::MAX));
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    pub fn write_to(&self, sink: &mut dyn Write) -> io::Result<()> {
        for chunk in &self.chunks {
            sink.write_all(chunk)?;
        }
        Ok(())
    }

    /// Drop the chunk storage now. Off-heap payloads must not linger past
    /// eviction, `remove`, or `clear`; the accountant cannot see a buffer
    /// that outlives its reservation.
    pub fn dispose(self) {
        trace!(event = "chunked_buf_disposed", bytes = self.len);
        drop(self);
    }
}

#[derive(Debug)]
struct WriterState {
    chunk_size: usize,
    sealed: Vec<Arc<[u8]>>,
    current: Vec<u8>,
    written: u64,
    finished: bool,
}

/// `io::Write` sink that accumulates fixed-size chunks.
///
/// The handle is cheaply cloneable so an encoder stack can own one end
/// while the unroll loop watches [`bytes_written`](Self::bytes_written)
/// through the other.
#[derive(Debug, Clone)]
pub struct ChunkedBufWriter {
    state: Arc<Mutex<WriterState>>,
}

impl ChunkedBufWriter {
    /// Panics if `chunk_size` is zero.
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be > 0");
        Self {
            state: Arc::new(Mutex::new(WriterState {
                chunk_size,
                sealed: Vec::new(),
                current: Vec::new(),
                written: 0,
                finished: false,
            })),
        }
    }

    /// Exact bytes accepted so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.state.lock().written
    }

    /// Seal the final partial chunk and freeze the buffer.
    ///
    /// Further writes through any handle fail with `io::Error`.
    #[must_use]
    pub fn finish(&self) -> ChunkedBuf {
        let mut state = self.state.lock();
        debug_assert!(!state.finished, "finish called twice");
        state.finished = true;
        if !state.current.is_empty() {
            let chunk = std::mem::take(&mut state.current);
            state.sealed.push(Arc::from(chunk));
        }
        ChunkedBuf::from_chunks(std::mem::take(&mut state.sealed))
    }
}

impl Write for ChunkedBufWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.finished {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "write into finished chunked buffer",
            ));
        }
        let mut remaining = buf;
        while !remaining.is_empty() {
            let room = state.chunk_size - state.current.len();
            let take = room.min(remaining.len());
            state.current.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            if state.current.len() == state.chunk_size {
                let chunk = std::mem::replace(
                    &mut state.current,
                    Vec::with_capacity(state.chunk_size.min(64 * 1024)),
                );
                state.sealed.push(Arc::from(chunk));
            }
        }
        state.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A block resident in memory.
#[derive(Debug)]
pub enum MemoryEntry<R> {
    /// An ordered record sequence with its estimated byte size.
    /// Deserialized entries always live on-heap.
    Deserialized { values: Arc<Vec<R>>, size: u64 },
    /// An encoded payload in either mode.
    Serialized { bytes: ChunkedBuf, mode: MemoryMode },
}

impl<R> MemoryEntry<R> {
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            MemoryEntry::Deserialized { size, .. } => *size,
            MemoryEntry::Serialized { bytes, .. } => bytes.len(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> MemoryMode {
        match self {
            MemoryEntry::Deserialized { .. } => MemoryMode::OnHeap,
            MemoryEntry::Serialized { mode, .. } => *mode,
        }
    }

    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            MemoryEntry::Deserialized { .. } => "deserialized",
            MemoryEntry::Serialized { .. } => "serialized",
        }
    }

    /// Release the payload storage.
    pub fn dispose(self) {
        if let MemoryEntry::Serialized { bytes, .. } = self {
            bytes.dispose();
        }
    }
}

/// Shared view over a deserialized block's records, returned by
/// `get_values`. Stays valid after the entry is evicted.
#[derive(Debug, Clone)]
pub struct BlockValues<R> {
    values: Arc<Vec<R>>,
}

impl<R> BlockValues<R> {
    pub(crate) fn new(values: Arc<Vec<R>>) -> Self {
        Self { values }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[R] {
        &self.values
    }

    pub fn iter(&self) -> std::slice::Iter<'_, R> {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_splits_input_into_chunks() {
        let mut writer = ChunkedBufWriter::new(4);
        writer.write_all(b"abcdefghij").expect("write");
        assert_eq!(writer.bytes_written(), 10);

        let buf = writer.finish();
        assert_eq!(buf.len(), 10);
        let sizes: Vec<usize> = buf.chunks().iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(buf.to_vec(), b"abcdefghij");
    }

    #[test]
    fn writer_handles_chunk_aligned_input() {
        let mut writer = ChunkedBufWriter::new(4);
        writer.write_all(b"abcdefgh").expect("write");
        let buf = writer.finish();
        let sizes: Vec<usize> = buf.chunks().iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![4, 4]);
    }

    #[test]
    fn empty_writer_finishes_empty() {
        let writer = ChunkedBufWriter::new(8);
        let buf = writer.finish();
        assert!(buf.is_empty());
        assert!(buf.chunks().is_empty());
    }

    #[test]
    fn writes_after_finish_fail() {
        let mut writer = ChunkedBufWriter::new(4);
        writer.write_all(b"ab").expect("write");
        let _ = writer.finish();
        assert!(writer.write_all(b"cd").is_err());
    }

    #[test]
    fn cloned_handle_observes_writes() {
        let mut writer = ChunkedBufWriter::new(4);
        let watcher = writer.clone();
        writer.write_all(b"abcdef").expect("write");
        assert_eq!(watcher.bytes_written(), 6);
    }

    #[test]
    fn chunked_buf_clone_shares_chunks() {
        let buf = ChunkedBuf::from_vec(vec![1, 2, 3]);
        let copy = buf.clone();
        assert!(Arc::ptr_eq(&buf.chunks()[0], &copy.chunks()[0]));
        buf.dispose();
        assert_eq!(copy.to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn write_to_concatenates_chunks() {
        let mut writer = ChunkedBufWriter::new(3);
        writer.write_all(b"hello world").expect("write");
        let buf = writer.finish();
        let mut out = Vec::new();
        buf.write_to(&mut out).expect("write_to");
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn entry_reports_size_and_mode() {
        let serialized: MemoryEntry<()> = MemoryEntry::Serialized {
            bytes: ChunkedBuf::from_vec(vec![0; 16]),
            mode: MemoryMode::OffHeap,
        };
        assert_eq!(serialized.size(), 16);
        assert_eq!(serialized.mode(), MemoryMode::OffHeap);
        assert_eq!(serialized.variant_name(), "serialized");

        let deserialized = MemoryEntry::Deserialized {
            values: Arc::new(vec![1_u32, 2, 3]),
            size: 12,
        };
        assert_eq!(deserialized.size(), 12);
        assert_eq!(deserialized.mode(), MemoryMode::OnHeap);
    }
}
