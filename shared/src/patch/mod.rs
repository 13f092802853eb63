//! The patch algebra.
//!
//! `merge`, `subtract`, `strip` and `diff` are the only ways patches are
//! combined anywhere in the system; the room controller, the history engine
//! and the transport all build on these four operations.


use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::component::ComponentValue;
use crate::value::Fields;

/// A keyed set of component values: the unit of exchange between adapters,
/// rooms and storage. Keys are `<entityId>/<componentName>` or
/// `SINGLETON/<name>`.
///
/// Backed by a `BTreeMap` so iteration order, equality and serialization are
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(BTreeMap<String, ComponentValue>);

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(key: impl Into<String>, value: ComponentValue) -> Self {
        let mut patch = Patch::new();
        patch.insert(key, value);
        patch
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ComponentValue) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&ComponentValue> {
        self.0.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut ComponentValue> {
        self.0.get_mut(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<ComponentValue> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ComponentValue)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str, &ComponentValue) -> bool) {
        self.0.retain(|key, value| keep(key, value));
    }
}

impl FromIterator<(String, ComponentValue)> for Patch {
    fn from_iter<I: IntoIterator<Item = (String, ComponentValue)>>(iter: I) -> Self {
        Patch(iter.into_iter().collect())
    }
}

impl IntoIterator for Patch {
    type Item = (String, ComponentValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, ComponentValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Patch {
    type Item = (&'a String, &'a ComponentValue);
    type IntoIter = std::collections::btree_map::Iter<'a, String, ComponentValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Left-to-right fold of patches into one.
///
/// Per key: a tombstone overrides any prior value, a full value replaces a
/// prior tombstone or partial, and a partial update field-merges into an
/// existing value with later fields winning. A partial cannot resurrect a
/// tombstone. A key introduced by a full value and deleted later in the same
/// merge is dropped entirely, so create-then-delete nets out to nothing.
pub fn merge<'a>(patches: impl IntoIterator<Item = &'a Patch>) -> Patch {
    let mut out: BTreeMap<String, ComponentValue> = BTreeMap::new();
    let mut introduced: HashSet<String> = HashSet::new();

    for patch in patches {
        for (key, value) in patch {
            match value {
                ComponentValue::Tombstone => {
                    if introduced.contains(key) {
                        out.remove(key);
                    } else {
                        out.insert(key.clone(), ComponentValue::Tombstone);
                    }
                }
                ComponentValue::Full(fields) => {
                    if !out.contains_key(key) {
                        introduced.insert(key.clone());
                    }
                    out.insert(key.clone(), ComponentValue::Full(fields.clone()));
                }
                ComponentValue::Partial(fields) => match out.entry(key.clone()) {
                    Entry::Vacant(entry) => {
                        entry.insert(ComponentValue::Partial(fields.clone()));
                    }
                    Entry::Occupied(mut entry) => {
                        if let Some(existing) = entry.get_mut().fields_mut() {
                            existing.merge_from(fields);
                        }
                    }
                },
            }
        }
    }

    Patch(out)
}

/// In-place merge of `patch` into a state mirror.
///
/// Same per-key semantics as [`merge`], except the state provides the prior
/// context: tombstones are always retained so later observers can learn of
/// deletions, and the create-then-delete collapse does not apply.
pub fn apply(state: &mut Patch, patch: &Patch) {
    for (key, value) in patch {
        match value {
            ComponentValue::Tombstone => {
                state.insert(key, ComponentValue::Tombstone);
            }
            ComponentValue::Full(fields) => {
                state.insert(key, ComponentValue::Full(fields.clone()));
            }
            ComponentValue::Partial(fields) => match state.get_mut(key) {
                None => state.insert(key, ComponentValue::Partial(fields.clone())),
                Some(ComponentValue::Tombstone) => {}
                Some(existing) => {
                    if let Some(existing) = existing.fields_mut() {
                        existing.merge_from(fields);
                    }
                }
            },
        }
    }
}

/// The portion of `a` not already expressed by `b`, compared field value by
/// field value.
///
/// A tombstone in `a` is dropped iff `b` holds a tombstone for the same key.
/// A full value in `a` survives wholesale unless `b` also asserts existence;
/// when both assert the same shape, matching fields are pruned and whatever
/// differs comes out as a partial update.
pub fn subtract(a: &Patch, b: &Patch) -> Patch {
    let mut out = Patch::new();
    for (key, av) in a {
        match (av, b.get(key)) {
            (ComponentValue::Tombstone, Some(ComponentValue::Tombstone)) => {}
            (ComponentValue::Tombstone, _) => out.insert(key, ComponentValue::Tombstone),
            (_, None) | (_, Some(ComponentValue::Tombstone)) => out.insert(key, av.clone()),
            (ComponentValue::Full(_), Some(bv)) if !bv.is_full() => out.insert(key, av.clone()),
            (av, Some(bv)) => {
                let (Some(af), Some(bf)) = (av.fields(), bv.fields()) else {
                    continue;
                };
                let rest = fields_not_expressed(af, bf);
                if !rest.is_empty() {
                    out.insert(key, ComponentValue::Partial(rest));
                }
            }
        }
    }
    out
}

fn fields_not_expressed(a: &Fields, b: &Fields) -> Fields {
    let mut rest = Fields::new();
    if a.version.is_some() && a.version != b.version {
        rest.version.clone_from(&a.version);
    }
    for (name, value) in a.iter() {
        if b.get(name) != Some(value) {
            rest.set(name, value.clone());
        }
    }
    rest
}

/// `a` minus every key and field named by `mask`, regardless of the masked
/// values. The `_exists` assertion counts as a field: a full mask entry
/// strips it off a full value in `a`.
///
/// Keys that are tombstones in the mask are dropped from `a` outright;
/// tombstones in `a` otherwise always pass through. Whatever ends up
/// carrying neither fields nor an existence assertion disappears.
pub fn strip(a: &Patch, mask: &Patch) -> Patch {
    let mut out = Patch::new();
    for (key, av) in a {
        let Some(mv) = mask.get(key) else {
            out.insert(key, av.clone());
            continue;
        };
        if mv.is_tombstone() {
            continue;
        }
        if av.is_tombstone() {
            out.insert(key, ComponentValue::Tombstone);
            continue;
        }
        let (Some(af), Some(mf)) = (av.fields(), mv.fields()) else {
            continue;
        };
        let mut rest = af.clone();
        if mf.version.is_some() {
            rest.version = None;
        }
        rest.retain(|name| !mf.contains(name));
        let keeps_existence = av.is_full() && !mv.is_full();
        if keeps_existence {
            out.insert(key, ComponentValue::Full(rest));
        } else if !rest.is_empty() {
            out.insert(key, ComponentValue::Partial(rest));
        }
    }
    out
}

/// The minimal update that, merged into `prev`, yields `next`. Both inputs
/// are read as full states: entries are full values or tombstones, and an
/// absent key means the component does not exist.
///
/// A field present in `prev` but gone from `next` cannot be expressed by a
/// partial update, so that case degrades to a full replacement. Returns
/// `None` when the states already agree.
pub fn diff(prev: &Patch, next: &Patch) -> Option<Patch> {
    let mut out = Patch::new();

    for (key, nv) in next {
        let prev_fields = prev.get(key).and_then(ComponentValue::fields);
        match (prev_fields, nv.fields()) {
            // Deleted on both sides, nothing to express.
            (None, None) => {}
            (Some(_), None) => out.insert(key, ComponentValue::Tombstone),
            (None, Some(nf)) => out.insert(key, ComponentValue::Full(nf.clone())),
            (Some(pf), Some(nf)) => {
                let field_removed = pf.iter().any(|(name, _)| !nf.contains(name));
                let version_cleared = pf.version.is_some() && nf.version.is_none();
                if field_removed || version_cleared {
                    // A partial update cannot remove a field or unset the
                    // version tag; fall back to a full replacement.
                    out.insert(key, ComponentValue::Full(nf.clone()));
                    continue;
                }
                let mut changed = Fields::new();
                if nf.version != pf.version {
                    changed.version.clone_from(&nf.version);
                }
                for (name, value) in nf.iter() {
                    if pf.get(name) != Some(value) {
                        changed.set(name, value.clone());
                    }
                }
                if !changed.is_empty() {
                    out.insert(key, ComponentValue::Partial(changed));
                }
            }
        }
    }

    // Keys that vanished from the state entirely read as deletions.
    for (key, pv) in prev {
        if !pv.is_tombstone() && !next.contains_key(key) {
            out.insert(key, ComponentValue::Tombstone);
        }
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}
