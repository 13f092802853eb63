mod file;
mod memory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use weft_shared::Patch;

pub use file::FileStorage;
pub use memory::{MemoryStorage, SharedSnapshot};

/// Per-field write stamps for every key of the room state. `_exists` is
/// tracked as a field so deletions participate in reconnect diffs.
pub type FieldStamps = BTreeMap<String, BTreeMap<String, u64>>;

/// The persisted form of a room: tombstones are filtered out of `state`, but
/// their stamps survive in `timestamps` so diffs stay correct while the room
/// is live.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: u64,
    pub state: Patch,
    pub timestamps: FieldStamps,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Load/save of a room snapshot. Backends are owned 1:1 by rooms and are
/// free to be as slow as they like; the room only talks to them from its
/// throttled save timer and from `load()`.
pub trait Storage {
    fn load(&mut self) -> Result<Option<Snapshot>, StorageError>;
    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StorageError>;
}
