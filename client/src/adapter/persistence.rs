use std::rc::Rc;
use std::time::Instant;

use log::{error, warn};

use weft_shared::{key, ComponentValue, Mutation, Origin, Patch, Schema, SyncBehavior};

use crate::adapter::{Adapter, AdapterError};
use crate::kv::{KvBackend, KvStore};

/// Local key-value persistence of document-scoped and local-scoped state.
///
/// On init the adapter reads the whole store, migrates entries whose
/// `_version` tag went stale (writing them back), and queues the result as
/// pending mutations so the rest of the ring starts from the persisted
/// document. Afterwards it shadows every non-ephemeral mutation into the
/// store. Store errors are logged and never propagated; losing a write is
/// better than stalling the ring.
pub struct PersistenceAdapter {
    document_id: String,
    backend: Rc<dyn KvBackend>,
    schema: Rc<dyn Schema>,
    store: Option<Box<dyn KvStore>>,
    pending: Vec<Mutation>,
}

impl PersistenceAdapter {
    pub fn new(
        document_id: impl Into<String>,
        backend: Rc<dyn KvBackend>,
        schema: Rc<dyn Schema>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            backend,
            schema,
            store: None,
            pending: Vec::new(),
        }
    }

    fn restore(&mut self) -> Result<(), AdapterError> {
        let mut store = self.backend.open(&self.document_id)?;

        let mut document = Patch::new();
        let mut local = Patch::new();
        for (patch_key, raw) in store.entries()? {
            let value: ComponentValue = match serde_json::from_value(raw) {
                Ok(value) => value,
                Err(err) => {
                    warn!("dropping undecodable persisted entry `{patch_key}`: {err}");
                    continue;
                }
            };
            let value = self.migrate(&mut store, &patch_key, value);

            let behavior = key::component_name(&patch_key)
                .and_then(|component| self.schema.def(component))
                .map(|def| def.sync)
                .unwrap_or(SyncBehavior::Document);
            match behavior {
                SyncBehavior::Document => document.insert(patch_key, value),
                SyncBehavior::Local => local.insert(patch_key, value),
                // Ephemeral state has no business being persisted.
                SyncBehavior::Ephemeral | SyncBehavior::None => {
                    warn!("dropping persisted entry `{patch_key}` with non-persistent behavior");
                }
            }
        }

        if !document.is_empty() {
            self.pending
                .push(Mutation::new(Origin::Persistence, SyncBehavior::Document, document));
        }
        if !local.is_empty() {
            self.pending
                .push(Mutation::new(Origin::Persistence, SyncBehavior::Local, local));
        }
        self.store = Some(store);
        Ok(())
    }

    /// Runs the migration chain for one entry when its version tag differs
    /// from the component definition, writing the result back.
    fn migrate(
        &self,
        store: &mut Box<dyn KvStore>,
        patch_key: &str,
        value: ComponentValue,
    ) -> ComponentValue {
        let Some(component) = key::component_name(patch_key) else {
            return value;
        };
        let Some(def) = self.schema.def(component) else {
            return value;
        };
        let Some(fields) = value.fields() else {
            return value;
        };
        if fields.version == def.version {
            return value;
        }

        let from = fields.version.clone();
        let migrated = self
            .schema
            .migrate(component, fields.clone(), from.as_deref());
        let migrated = match value {
            ComponentValue::Partial(_) => ComponentValue::Partial(migrated),
            _ => ComponentValue::Full(migrated),
        };
        match serde_json::to_value(&migrated) {
            Ok(raw) => {
                if let Err(err) = store.put(patch_key, raw) {
                    error!("writing back migrated entry `{patch_key}` failed: {err}");
                }
            }
            Err(err) => error!("migrated entry `{patch_key}` did not serialize: {err}"),
        }
        migrated
    }

    fn write(&mut self, patch_key: &str, value: &ComponentValue) {
        let Some(store) = &mut self.store else {
            return;
        };
        let result = match value {
            ComponentValue::Tombstone => store.delete(patch_key),
            ComponentValue::Full(_) => match serde_json::to_value(value) {
                Ok(raw) => store.put(patch_key, raw),
                Err(err) => {
                    error!("entry `{patch_key}` did not serialize: {err}");
                    return;
                }
            },
            ComponentValue::Partial(fields) => {
                // Read-modify-write: fold the partial into whatever is
                // stored, or start from the partial itself.
                let merged = match store.get(patch_key) {
                    Ok(Some(raw)) => match serde_json::from_value::<ComponentValue>(raw) {
                        Ok(mut existing) => {
                            if let Some(existing_fields) = existing.fields_mut() {
                                existing_fields.merge_from(fields);
                            }
                            existing
                        }
                        Err(err) => {
                            warn!("overwriting undecodable entry `{patch_key}`: {err}");
                            value.clone()
                        }
                    },
                    Ok(None) => value.clone(),
                    Err(err) => {
                        error!("reading entry `{patch_key}` failed: {err}");
                        return;
                    }
                };
                match serde_json::to_value(&merged) {
                    Ok(raw) => store.put(patch_key, raw),
                    Err(err) => {
                        error!("entry `{patch_key}` did not serialize: {err}");
                        return;
                    }
                }
            }
        };
        if let Err(err) = result {
            error!("persisting entry `{patch_key}` failed: {err}");
        }
    }
}

impl Adapter for PersistenceAdapter {
    fn init(&mut self, _now: Instant) -> Result<(), AdapterError> {
        self.restore()
    }

    fn pull(&mut self, now: Instant) -> Vec<Mutation> {
        if let Some(store) = &mut self.store {
            if let Err(err) = store.poll(now) {
                error!("store flush failed: {err}");
            }
        }
        std::mem::take(&mut self.pending)
    }

    fn push(&mut self, mutations: &[Mutation], _now: Instant) {
        for mutation in mutations {
            if mutation.origin == Origin::Persistence
                || mutation.behavior == SyncBehavior::Ephemeral
            {
                continue;
            }
            for (patch_key, value) in &mutation.patch {
                self.write(patch_key, value);
            }
        }
    }

    fn close(&mut self) {
        if let Some(store) = &mut self.store {
            if let Err(err) = store.flush() {
                error!("final store flush failed: {err}");
            }
        }
        self.store = None;
    }
}
