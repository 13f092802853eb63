//! The key-value persistence interface.
//!
//! The real backend (IndexedDB or whatever the host platform offers) stays
//! external; adapters only see [`KvStore`] handles opened per database name
//! through a [`KvBackend`]. [`MemoryKv`] backs tests and ephemeral embedders,
//! [`BufferedKv`] adds the write-buffering behavior production backends
//! exhibit: writes to the same key collapse for a flush interval and reads
//! consult pending writes first.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde_json::Value;
use weft_shared::Timer;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("key-value store `{db}`: {message}")]
    Backend { db: String, message: String },
}

/// One opened key-value database. Values are raw JSON.
pub trait KvStore {
    fn get(&mut self, key: &str) -> Result<Option<Value>, KvError>;
    fn put(&mut self, key: &str, value: Value) -> Result<(), KvError>;
    fn delete(&mut self, key: &str) -> Result<(), KvError>;
    fn entries(&mut self) -> Result<Vec<(String, Value)>, KvError>;

    /// Gives stores with internal buffering a chance to flush. Called from
    /// the owning adapter's pull phase.
    fn poll(&mut self, _now: Instant) -> Result<(), KvError> {
        Ok(())
    }

    /// Forces any buffered writes out; called when the owning adapter
    /// closes.
    fn flush(&mut self) -> Result<(), KvError> {
        Ok(())
    }
}

/// Opens stores by database name. One backend serves both the per-document
/// store and the transport meta store.
pub trait KvBackend {
    fn open(&self, db: &str) -> Result<Box<dyn KvStore>, KvError>;
}

type Db = Rc<RefCell<BTreeMap<String, Value>>>;

/// In-memory backend. Databases survive reopening through the same backend
/// instance, which is enough to exercise restore paths in tests.
#[derive(Default, Clone)]
pub struct MemoryKvBackend {
    dbs: Rc<RefCell<HashMap<String, Db>>>,
}

impl MemoryKvBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct view of a database for seeding and assertions.
    pub fn db(&self, db: &str) -> Db {
        self.dbs
            .borrow_mut()
            .entry(db.to_string())
            .or_default()
            .clone()
    }
}

impl KvBackend for MemoryKvBackend {
    fn open(&self, db: &str) -> Result<Box<dyn KvStore>, KvError> {
        Ok(Box::new(MemoryKv { map: self.db(db) }))
    }
}

pub struct MemoryKv {
    map: Db,
}

impl KvStore for MemoryKv {
    fn get(&mut self, key: &str) -> Result<Option<Value>, KvError> {
        Ok(self.map.borrow().get(key).cloned())
    }

    fn put(&mut self, key: &str, value: Value) -> Result<(), KvError> {
        self.map.borrow_mut().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), KvError> {
        self.map.borrow_mut().remove(key);
        Ok(())
    }

    fn entries(&mut self) -> Result<Vec<(String, Value)>, KvError> {
        Ok(self
            .map
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Write-buffering wrapper with read-your-writes consistency.
///
/// Writes park in a pending map (`None` marks a deletion) and reach the
/// inner store when the flush timer fires or on [`KvStore::flush`]. Reads
/// check the pending map before the inner store.
pub struct BufferedKv {
    inner: Box<dyn KvStore>,
    pending: BTreeMap<String, Option<Value>>,
    flush_interval: Duration,
    flush_timer: Timer,
}

impl BufferedKv {
    pub fn new(inner: Box<dyn KvStore>) -> Self {
        Self::with_interval(inner, Duration::from_secs(1))
    }

    pub fn with_interval(inner: Box<dyn KvStore>, flush_interval: Duration) -> Self {
        Self {
            inner,
            pending: BTreeMap::new(),
            flush_interval,
            flush_timer: Timer::idle(),
        }
    }

    fn write_through(&mut self) -> Result<(), KvError> {
        for (key, slot) in std::mem::take(&mut self.pending) {
            match slot {
                Some(value) => self.inner.put(&key, value)?,
                None => self.inner.delete(&key)?,
            }
        }
        Ok(())
    }
}

impl KvStore for BufferedKv {
    fn get(&mut self, key: &str) -> Result<Option<Value>, KvError> {
        if let Some(slot) = self.pending.get(key) {
            return Ok(slot.clone());
        }
        self.inner.get(key)
    }

    fn put(&mut self, key: &str, value: Value) -> Result<(), KvError> {
        self.pending.insert(key.to_string(), Some(value));
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), KvError> {
        self.pending.insert(key.to_string(), None);
        Ok(())
    }

    fn entries(&mut self) -> Result<Vec<(String, Value)>, KvError> {
        let mut merged: BTreeMap<String, Value> = self.inner.entries()?.into_iter().collect();
        for (key, slot) in &self.pending {
            match slot {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    fn poll(&mut self, now: Instant) -> Result<(), KvError> {
        if !self.pending.is_empty() {
            self.flush_timer.arm_if_idle(now, self.flush_interval);
        }
        if self.flush_timer.fire(now) {
            self.write_through()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), KvError> {
        self.flush_timer.cancel();
        self.write_through()?;
        self.inner.flush()
    }
}
