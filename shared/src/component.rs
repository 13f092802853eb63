use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use log::{error, warn};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::mutation::SyncBehavior;
use crate::value::{FieldValue, Fields, ValueError};

/// Reserved member carrying the presence flag. `false` is a tombstone,
/// `true` a full replacement, absence a partial update.
pub const EXISTS_FIELD: &str = "_exists";
/// Reserved member carrying the schema version tag.
pub const VERSION_FIELD: &str = "_version";

/// One keyed entry of a patch.
///
/// The `_exists` flag discriminates the three shapes on the wire:
/// a tombstone records a deletion, a full value replaces whatever was
/// there, and a partial update field-merges into an existing value.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentValue {
    Tombstone,
    Full(Fields),
    Partial(Fields),
}

impl ComponentValue {
    pub fn full(fields: Fields) -> Self {
        ComponentValue::Full(fields)
    }

    pub fn partial(fields: Fields) -> Self {
        ComponentValue::Partial(fields)
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, ComponentValue::Tombstone)
    }

    pub fn is_full(&self) -> bool {
        matches!(self, ComponentValue::Full(_))
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, ComponentValue::Partial(_))
    }

    pub fn fields(&self) -> Option<&Fields> {
        match self {
            ComponentValue::Tombstone => None,
            ComponentValue::Full(fields) | ComponentValue::Partial(fields) => Some(fields),
        }
    }

    pub fn fields_mut(&mut self) -> Option<&mut Fields> {
        match self {
            ComponentValue::Tombstone => None,
            ComponentValue::Full(fields) | ComponentValue::Partial(fields) => Some(fields),
        }
    }

    fn from_raw(raw: BTreeMap<String, serde_json::Value>) -> Result<Self, ValueError> {
        let mut exists = None;
        let mut fields = Fields::new();
        for (name, value) in raw {
            match name.as_str() {
                EXISTS_FIELD => match value {
                    serde_json::Value::Bool(flag) => exists = Some(flag),
                    other => {
                        warn!("reserved field `{EXISTS_FIELD}` must be a boolean, got {other}");
                        return Err(ValueError::MalformedReservedField(EXISTS_FIELD));
                    }
                },
                VERSION_FIELD => match value {
                    serde_json::Value::Null => fields.version = None,
                    serde_json::Value::String(tag) => fields.version = Some(tag),
                    other => {
                        warn!("reserved field `{VERSION_FIELD}` must be a string or null, got {other}");
                        return Err(ValueError::MalformedReservedField(VERSION_FIELD));
                    }
                },
                _ => {
                    fields.set(name, FieldValue::from_json(value)?);
                }
            }
        }
        Ok(match exists {
            Some(false) => ComponentValue::Tombstone,
            Some(true) => ComponentValue::Full(fields),
            None => ComponentValue::Partial(fields),
        })
    }
}

impl Serialize for ComponentValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ComponentValue::Tombstone => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(EXISTS_FIELD, &false)?;
                map.end()
            }
            ComponentValue::Full(fields) => serialize_fields(serializer, fields, Some(true)),
            ComponentValue::Partial(fields) => serialize_fields(serializer, fields, None),
        }
    }
}

fn serialize_fields<S: Serializer>(
    serializer: S,
    fields: &Fields,
    exists: Option<bool>,
) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(None)?;
    if let Some(flag) = exists {
        map.serialize_entry(EXISTS_FIELD, &flag)?;
    }
    if let Some(version) = &fields.version {
        map.serialize_entry(VERSION_FIELD, version)?;
    }
    for (name, value) in fields.iter() {
        map.serialize_entry(name, value)?;
    }
    map.end()
}

impl<'de> Deserialize<'de> for ComponentValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        ComponentValue::from_raw(raw).map_err(D::Error::custom)
    }
}

/// Per-component facts the sync core needs from the schema collaborator.
#[derive(Debug, Clone)]
pub struct ComponentDef {
    pub name: String,
    pub sync: SyncBehavior,
    /// Current schema version; compared against the `_version` tag of
    /// persisted values.
    pub version: Option<String>,
    /// Field names that do not participate in undo history.
    pub history_excluded: HashSet<String>,
}

impl ComponentDef {
    pub fn new(name: impl Into<String>, sync: SyncBehavior) -> Self {
        Self {
            name: name.into(),
            sync,
            version: None,
            history_excluded: HashSet::new(),
        }
    }

    pub fn versioned(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn exclude_from_history(mut self, field: impl Into<String>) -> Self {
        self.history_excluded.insert(field.into());
        self
    }
}

/// The component definition and migration collaborator.
///
/// The core consults definitions for sync behavior and history exclusion,
/// and runs the migration chain whenever a persisted or received value
/// carries a stale `_version` tag.
pub trait Schema {
    fn def(&self, component: &str) -> Option<&ComponentDef>;

    /// Bring `fields` from version `from` up to the component's current
    /// version.
    ///
    /// # Panics
    /// Panics when `from` is unknown to the migration chain. Stale data with
    /// no registered migration is a programmer error, not a user fault.
    fn migrate(&self, component: &str, fields: Fields, from: Option<&str>) -> Fields;
}

type MigrateFn = Box<dyn Fn(Fields, Option<&str>) -> Fields>;

/// Map-backed [`Schema`] for embedders that do not bring their own registry.
#[derive(Default)]
pub struct SchemaSet {
    defs: HashMap<String, ComponentDef>,
    migrations: HashMap<String, MigrateFn>,
}

impl SchemaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: ComponentDef) -> &mut Self {
        self.defs.insert(def.name.clone(), def);
        self
    }

    pub fn register_with_migration(
        &mut self,
        def: ComponentDef,
        migrate: impl Fn(Fields, Option<&str>) -> Fields + 'static,
    ) -> &mut Self {
        self.migrations.insert(def.name.clone(), Box::new(migrate));
        self.register(def)
    }

    pub fn defs(&self) -> impl Iterator<Item = &ComponentDef> {
        self.defs.values()
    }
}

impl fmt::Debug for SchemaSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaSet")
            .field("defs", &self.defs)
            .finish_non_exhaustive()
    }
}

impl Schema for SchemaSet {
    fn def(&self, component: &str) -> Option<&ComponentDef> {
        self.defs.get(component)
    }

    fn migrate(&self, component: &str, fields: Fields, from: Option<&str>) -> Fields {
        let current = self.defs.get(component).and_then(|def| def.version.as_deref());
        if from == current {
            return fields;
        }
        let Some(migrate) = self.migrations.get(component) else {
            error!("component `{component}` carries version {from:?} but has no migration chain");
            panic!(
                "no migration registered for component `{component}` from version {from:?} to {current:?}"
            );
        };
        let mut migrated = migrate(fields, from);
        migrated.version = current.map(str::to_string);
        migrated
    }
}
