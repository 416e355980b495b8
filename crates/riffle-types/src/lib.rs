#![forbid(unsafe_code)]
//! Shared vocabulary for the Riffle engine's storage layer.
//!
//! Defines block and task identifiers, the on-heap/off-heap memory mode
//! tag, and `StorageLevel` descriptors consumed by the block store.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identity of a logical dataset. Blocks computed from the same dataset
/// share a `DatasetId`; eviction uses it to refuse self-displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub u64);

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a single task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskAttemptId(pub u64);

impl TaskAttemptId {
    /// Sentinel for callers that are not running inside a task (driver-side
    /// puts, maintenance sweeps). Lock bookkeeping treats it like any other
    /// task id.
    pub const NON_TASK: TaskAttemptId = TaskAttemptId(u64::MAX);
}

impl fmt::Display for TaskAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NON_TASK {
            write!(f, "non-task")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Unique identifier of a block held by the storage layer.
///
/// The wire name produced by `Display` is stable and parseable back via
/// `FromStr`; peers exchange block names in that form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BlockId {
    /// A cached partition of a logical dataset.
    Partition { dataset: DatasetId, index: u32 },
    /// Output of one map task for one reduce partition.
    Shuffle { shuffle: u32, map: u32, reduce: u32 },
    /// A broadcast variable piece.
    Broadcast { id: u64 },
    /// A received streaming block.
    Stream { stream: u64, seq: u64 },
    /// An oversized task result stored instead of shipped inline.
    TaskResult { task: u64 },
}

impl BlockId {
    /// The logical dataset this block belongs to, when it has one.
    ///
    /// Only partition blocks carry a dataset identity; all other block
    /// kinds are dataset-less and therefore never excluded from eviction
    /// on the requester's behalf.
    #[must_use]
    pub fn dataset(&self) -> Option<DatasetId> {
        match self {
            BlockId::Partition { dataset, .. } => Some(*dataset),
            _ => None,
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Partition { dataset, index } => {
                write!(f, "dataset_{dataset}_partition_{index}")
            }
            BlockId::Shuffle {
                shuffle,
                map,
                reduce,
            } => write!(f, "shuffle_{shuffle}_{map}_{reduce}"),
            BlockId::Broadcast { id } => write!(f, "broadcast_{id}"),
            BlockId::Stream { stream, seq } => write!(f, "stream_{stream}_{seq}"),
            BlockId::TaskResult { task } => write!(f, "task_result_{task}"),
        }
    }
}

/// Error for unparseable wire names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized block name: {name}")]
pub struct ParseBlockIdError {
    pub name: String,
}

impl std::str::FromStr for BlockId {
    type Err = ParseBlockIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn nums<const N: usize>(parts: &[&str]) -> Option<[u64; N]> {
            if parts.len() != N {
                return None;
            }
            let mut out = [0_u64; N];
            for (slot, part) in out.iter_mut().zip(parts) {
                *slot = part.parse().ok()?;
            }
            Some(out)
        }

        let err = || ParseBlockIdError { name: s.to_owned() };
        if let Some(rest) = s.strip_prefix("dataset_") {
            let parts: Vec<&str> = rest.splitn(2, "_partition_").collect();
            let [dataset] = nums::<1>(&parts[..1]).ok_or_else(err)?;
            let [index] = nums::<1>(&parts[1..]).ok_or_else(err)?;
            let index = u32::try_from(index).map_err(|_| err())?;
            return Ok(BlockId::Partition {
                dataset: DatasetId(dataset),
                index,
            });
        }
        if let Some(rest) = s.strip_prefix("shuffle_") {
            let parts: Vec<&str> = rest.split('_').collect();
            let [shuffle, map, reduce] = nums::<3>(&parts).ok_or_else(err)?;
            return Ok(BlockId::Shuffle {
                shuffle: u32::try_from(shuffle).map_err(|_| err())?,
                map: u32::try_from(map).map_err(|_| err())?,
                reduce: u32::try_from(reduce).map_err(|_| err())?,
            });
        }
        if let Some(rest) = s.strip_prefix("broadcast_") {
            let [id] = nums::<1>(&[rest]).ok_or_else(err)?;
            return Ok(BlockId::Broadcast { id });
        }
        if let Some(rest) = s.strip_prefix("stream_") {
            let parts: Vec<&str> = rest.split('_').collect();
            let [stream, seq] = nums::<2>(&parts).ok_or_else(err)?;
            return Ok(BlockId::Stream { stream, seq });
        }
        if let Some(rest) = s.strip_prefix("task_result_") {
            let [task] = nums::<1>(&[rest]).ok_or_else(err)?;
            return Ok(BlockId::TaskResult { task });
        }
        Err(err())
    }
}

/// Which pool a reservation or resident entry is accounted against.
///
/// The two modes have fully independent accounting; nothing is ever moved
/// between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryMode {
    OnHeap,
    OffHeap,
}

impl fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryMode::OnHeap => write!(f, "on-heap"),
            MemoryMode::OffHeap => write!(f, "off-heap"),
        }
    }
}

/// Where and how a block should be stored.
///
/// Only `use_memory`, `use_off_heap` and `deserialized` affect the memory
/// store; the remaining fields are recorded for the outer tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageLevel {
    pub use_memory: bool,
    pub use_disk: bool,
    pub use_off_heap: bool,
    pub deserialized: bool,
    pub replication: u8,
}

impl StorageLevel {
    pub const NONE: StorageLevel = StorageLevel::new(false, false, false, false, 1);
    pub const MEMORY_ONLY: StorageLevel = StorageLevel::new(true, false, false, true, 1);
    pub const MEMORY_ONLY_SER: StorageLevel = StorageLevel::new(true, false, false, false, 1);
    pub const MEMORY_AND_DISK: StorageLevel = StorageLevel::new(true, true, false, true, 1);
    pub const MEMORY_AND_DISK_SER: StorageLevel = StorageLevel::new(true, true, false, false, 1);
    pub const DISK_ONLY: StorageLevel = StorageLevel::new(false, true, false, false, 1);
    pub const OFF_HEAP: StorageLevel = StorageLevel::new(true, true, true, false, 1);

    const fn new(
        use_memory: bool,
        use_disk: bool,
        use_off_heap: bool,
        deserialized: bool,
        replication: u8,
    ) -> Self {
        Self {
            use_memory,
            use_disk,
            use_off_heap,
            deserialized,
            replication,
        }
    }

    /// An off-heap level must be serialized and must request memory.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.replication == 0 {
            return false;
        }
        if self.use_off_heap && (self.deserialized || !self.use_memory) {
            return false;
        }
        self.use_memory || self.use_disk || !self.use_off_heap
    }

    /// The pool this level's memory portion is accounted against.
    #[must_use]
    pub fn memory_mode(&self) -> MemoryMode {
        if self.use_off_heap {
            MemoryMode::OffHeap
        } else {
            MemoryMode::OnHeap
        }
    }

    /// Whether a block demoted to this level is still findable in some
    /// tier. Drives lock-record retention after eviction.
    #[must_use]
    pub fn retains_data(&self) -> bool {
        self.use_memory || self.use_disk
    }
}

impl fmt::Display for StorageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StorageLevel(memory={}, disk={}, off_heap={}, deserialized={}, replication={})",
            self.use_memory, self.use_disk, self.use_off_heap, self.deserialized, self.replication
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn partition_block_carries_dataset() {
        let id = BlockId::Partition {
            dataset: DatasetId(7),
            index: 3,
        };
        assert_eq!(id.dataset(), Some(DatasetId(7)));
        assert_eq!(id.to_string(), "dataset_7_partition_3");
    }

    #[test]
    fn non_partition_blocks_have_no_dataset() {
        let ids = [
            BlockId::Shuffle {
                shuffle: 1,
                map: 2,
                reduce: 3,
            },
            BlockId::Broadcast { id: 9 },
            BlockId::Stream { stream: 4, seq: 5 },
            BlockId::TaskResult { task: 11 },
        ];
        for id in ids {
            assert_eq!(id.dataset(), None, "{id}");
        }
    }

    #[test]
    fn block_names_round_trip() {
        let ids = [
            BlockId::Partition {
                dataset: DatasetId(42),
                index: 0,
            },
            BlockId::Shuffle {
                shuffle: 3,
                map: 14,
                reduce: 15,
            },
            BlockId::Broadcast { id: 92 },
            BlockId::Stream { stream: 6, seq: 53 },
            BlockId::TaskResult { task: 5 },
        ];
        for id in ids {
            let name = id.to_string();
            assert_eq!(BlockId::from_str(&name).expect("parse"), id, "{name}");
        }
    }

    #[test]
    fn malformed_block_names_are_rejected() {
        for name in ["", "dataset_", "shuffle_1_2", "block_1", "broadcast_x"] {
            assert!(BlockId::from_str(name).is_err(), "{name}");
        }
    }

    #[test]
    fn storage_level_memory_mode() {
        assert_eq!(
            StorageLevel::MEMORY_ONLY.memory_mode(),
            MemoryMode::OnHeap
        );
        assert_eq!(StorageLevel::OFF_HEAP.memory_mode(), MemoryMode::OffHeap);
    }

    #[test]
    fn storage_level_validity() {
        assert!(StorageLevel::MEMORY_ONLY.is_valid());
        assert!(StorageLevel::OFF_HEAP.is_valid());
        assert!(StorageLevel::DISK_ONLY.is_valid());
        let deserialized_off_heap = StorageLevel {
            deserialized: true,
            ..StorageLevel::OFF_HEAP
        };
        assert!(!deserialized_off_heap.is_valid());
        let zero_replication = StorageLevel {
            replication: 0,
            ..StorageLevel::MEMORY_ONLY
        };
        assert!(!zero_replication.is_valid());
    }

    #[test]
    fn retains_data_levels() {
        assert!(StorageLevel::DISK_ONLY.retains_data());
        assert!(StorageLevel::MEMORY_AND_DISK.retains_data());
        assert!(!StorageLevel::NONE.retains_data());
    }

    #[test]
    fn non_task_sentinel_display() {
        assert_eq!(TaskAttemptId::NON_TASK.to_string(), "non-task");
        assert_eq!(TaskAttemptId(17).to_string(), "17");
    }
}
