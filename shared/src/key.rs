//! Patch key construction and splitting.
//!
//! Entity components are keyed `<stableEntityId>/<componentName>`; document
//! singletons live under the reserved `SINGLETON` prefix.

/// Reserved entity id for document-scoped singletons.
pub const SINGLETON: &str = "SINGLETON";

pub fn component_key(entity: &str, component: &str) -> String {
    format!("{entity}/{component}")
}

pub fn singleton_key(name: &str) -> String {
    format!("{SINGLETON}/{name}")
}

/// Splits a patch key into its entity id and component name.
///
/// Component names cannot contain `/`, so the split is taken from the right
/// and entity ids with embedded slashes survive.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.rsplit_once('/')
}

pub fn entity_id(key: &str) -> Option<&str> {
    split_key(key).map(|(entity, _)| entity)
}

pub fn component_name(key: &str) -> Option<&str> {
    split_key(key).map(|(_, component)| component)
}

pub fn is_singleton(key: &str) -> bool {
    entity_id(key) == Some(SINGLETON)
}
