use std::cell::RefCell;
use std::rc::Rc;

use super::{Snapshot, Storage, StorageError};

/// Handle onto the snapshot held by a [`MemoryStorage`], usable from tests
/// and embedders to observe what a room persisted.
pub type SharedSnapshot = Rc<RefCell<Option<Snapshot>>>;

/// Keeps the latest snapshot in memory. The reference backend for tests and
/// for deployments that do not care about durability.
#[derive(Default)]
pub struct MemoryStorage {
    slot: SharedSnapshot,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a storage seeded with an existing snapshot.
    pub fn seeded(snapshot: Snapshot) -> Self {
        Self {
            slot: Rc::new(RefCell::new(Some(snapshot))),
        }
    }

    /// A shared view of the stored snapshot that stays valid after the
    /// storage is handed to a room.
    pub fn handle(&self) -> SharedSnapshot {
        Rc::clone(&self.slot)
    }
}

impl Storage for MemoryStorage {
    fn load(&mut self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.slot.borrow().clone())
    }

    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        *self.slot.borrow_mut() = Some(snapshot.clone());
        Ok(())
    }
}
