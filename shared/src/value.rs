use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single field of a component record.
///
/// The value space is a closed sum over the primitive kinds the codec layer
/// supports, plus arrays of those. Arrays compare element-wise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn from_json(value: serde_json::Value) -> Result<Self, ValueError> {
        match value {
            serde_json::Value::Bool(b) => Ok(FieldValue::Bool(b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(FieldValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(FieldValue::Float(f))
                } else {
                    Err(ValueError::UnrepresentableNumber(n.to_string()))
                }
            }
            serde_json::Value::String(s) => Ok(FieldValue::Str(s)),
            serde_json::Value::Array(items) => {
                let mut list = Vec::with_capacity(items.len());
                for item in items {
                    list.push(FieldValue::from_json(item)?);
                }
                Ok(FieldValue::List(list))
            }
            other => Err(ValueError::UnsupportedKind(kind_name(&other))),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

fn kind_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Errors produced while decoding raw JSON into field values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("field value kind `{0}` is not supported")]
    UnsupportedKind(&'static str),
    #[error("number {0} cannot be represented as a field value")]
    UnrepresentableNumber(String),
    #[error("reserved field `{0}` has the wrong type")]
    MalformedReservedField(&'static str),
}

/// The non-meta payload of a component value: the named fields plus the
/// schema version tag owned by the migration collaborator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields {
    pub version: Option<String>,
    map: BTreeMap<String, FieldValue>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            map: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> &mut Self {
        self.map.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.map.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.map.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.map.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Empty means no named fields and no version tag.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty() && self.version.is_none()
    }

    /// Field-merge `other` into `self`. Later fields win; a version tag in
    /// `other` replaces ours.
    pub fn merge_from(&mut self, other: &Fields) {
        if other.version.is_some() {
            self.version.clone_from(&other.version);
        }
        for (name, value) in &other.map {
            self.map.insert(name.clone(), value.clone());
        }
    }

    /// Keep only the fields whose name passes `keep`. The version tag is
    /// not affected.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.map.retain(|name, _| keep(name));
    }
}

impl<const N: usize> From<[(&str, FieldValue); N]> for Fields {
    fn from(entries: [(&str, FieldValue); N]) -> Self {
        let mut fields = Fields::new();
        for (name, value) in entries {
            fields.set(name, value);
        }
        fields
    }
}
