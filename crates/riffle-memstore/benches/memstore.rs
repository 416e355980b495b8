#![forbid(unsafe_code)]

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use riffle_memstore::{
    BlockEvictionHandler, ChunkedBuf, DiscardOnEvict, EvictedData, HeapSize, MemoryStore,
    SerializationStream, Serializer, SerializerManager, StoreConfig,
};
use riffle_types::{BlockId, MemoryMode, StorageLevel, TaskAttemptId};
use std::io::Write;
use std::sync::Arc;

const TASK: TaskAttemptId = TaskAttemptId(1);

#[derive(Debug, Clone, Copy)]
struct Rec(u64);

impl HeapSize for Rec {
    fn heap_size(&self) -> usize {
        0
    }
}

struct RecStream {
    sink: Box<dyn Write + Send>,
}

impl SerializationStream<Rec> for RecStream {
    fn write_record(&mut self, record: &Rec) -> riffle_error::Result<()> {
        self.sink.write_all(&record.0.to_le_bytes())?;
        Ok(())
    }

    fn flush(&mut self) -> riffle_error::Result<()> {
        self.sink.flush()?;
        Ok(())
    }

    fn finish(&mut self) -> riffle_error::Result<()> {
        self.sink.flush()?;
        Ok(())
    }
}

struct RecSerializer;

impl Serializer<Rec> for RecSerializer {
    fn new_stream(&self, sink: Box<dyn Write + Send>) -> Box<dyn SerializationStream<Rec>> {
        Box::new(RecStream { sink })
    }
}

struct RecManager;

impl SerializerManager<Rec> for RecManager {
    fn wrap_for_compression(
        &self,
        _id: &BlockId,
        sink: Box<dyn Write + Send>,
    ) -> Box<dyn Write + Send> {
        sink
    }

    fn get_serializer(&self, _auto_pick: bool) -> Arc<dyn Serializer<Rec>> {
        Arc::new(RecSerializer)
    }
}

/// Spill target that accepts everything, so eviction stays on the
/// retain-the-lock-record path.
struct SinkHandler;

impl BlockEvictionHandler<Rec> for SinkHandler {
    fn drop_from_memory(&self, _id: &BlockId, _data: EvictedData<'_, Rec>) -> StorageLevel {
        StorageLevel::DISK_ONLY
    }
}

fn bench_store(max: u64) -> MemoryStore<Rec> {
    let conf = StoreConfig {
        max_on_heap_bytes: max,
        storage_region_fraction: 1.0,
        unroll_initial_threshold_bytes: 4096,
        unroll_check_period_records: 16,
        ..StoreConfig::default()
    };
    MemoryStore::new(conf, Arc::new(DiscardOnEvict), Arc::new(RecManager)).expect("store")
}

fn bench_put_get_bytes(c: &mut Criterion) {
    let store = bench_store(64 * 1024 * 1024);
    let payload = vec![0x5A_u8; 64 * 1024];
    let mut next = 0_u64;

    c.bench_function("put_get_remove_bytes_64k", |b| {
        b.iter(|| {
            next += 1;
            let id = BlockId::Broadcast { id: next };
            store
                .put_bytes(&id, TASK, payload.len() as u64, MemoryMode::OnHeap, || {
                    ChunkedBuf::from_vec(payload.clone())
                })
                .expect("put");
            let buf = store.get_bytes(&id, TASK).expect("get").expect("resident");
            black_box(buf.len());
            store.remove(&id, TASK).expect("remove");
        });
    });
}

fn bench_put_with_eviction_churn(c: &mut Criterion) {
    // Pool fits 8 payloads: every put past warm-up displaces the LRU
    // block through the handler callout path.
    let conf = StoreConfig {
        max_on_heap_bytes: 8 * 64 * 1024,
        storage_region_fraction: 1.0,
        ..StoreConfig::default()
    };
    let store: MemoryStore<Rec> =
        MemoryStore::new(conf, Arc::new(SinkHandler), Arc::new(RecManager)).expect("store");
    let payload = vec![0x5A_u8; 64 * 1024];
    let mut next = 0_u64;

    c.bench_function("put_bytes_evicting_64k", |b| {
        b.iter(|| {
            next += 1;
            let id = BlockId::Stream {
                stream: 1,
                seq: next,
            };
            store
                .put_bytes(&id, TASK, payload.len() as u64, MemoryMode::OnHeap, || {
                    ChunkedBuf::from_vec(payload.clone())
                })
                .expect("put");
        });
    });
}

fn bench_unroll_values(c: &mut Criterion) {
    let store = bench_store(256 * 1024 * 1024);
    let mut next = 0_u64;

    c.bench_function("unroll_values_10k_records", |b| {
        b.iter(|| {
            next += 1;
            let id = BlockId::TaskResult { task: next };
            let outcome = store
                .put_iterator_as_values(&id, TASK, (0..10_000_u64).map(Rec))
                .expect("put");
            black_box(outcome.stored_size());
            store.remove(&id, TASK).expect("remove");
        });
    });
}

criterion_group!(
    benches,
    bench_put_get_bytes,
    bench_put_with_eviction_churn,
    bench_unroll_values
);
criterion_main!(benches);
