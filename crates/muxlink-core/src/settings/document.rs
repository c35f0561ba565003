//! Settings documents
//!
//! A [`SettingsDocument`] is the unit of exchange on the settings channel: a
//! flat JSON object keyed by slash-separated paths such as `app/brightness`
//! or `settings/lock`. Some paths are write-only and never appear in a
//! device response; verification has to skip them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ProtocolError;

/// Paths the device accepts but never reports back.
const WRITE_ONLY_PATHS: [&str; 2] = ["save", "reset"];

/// True if a path can be written but never read back.
///
/// Covers `save`, `reset`, and every key slot (`settings/key_0`,
/// `settings/key_1`, ...). ACL vectors (`settings/acl_N`) are readable.
pub fn is_write_only(path: &str) -> bool {
    WRITE_ONLY_PATHS.contains(&path) || path.starts_with("settings/key_")
}

/// A flat configuration document keyed by slash-separated paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettingsDocument(pub Map<String, Value>);

impl SettingsDocument {
    /// Create an empty document (the "read everything" query).
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpret a JSON value as a document; anything but an object fails.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(ProtocolError::InvalidResponse(format!(
                "expected a settings object, got {}",
                other
            ))),
        }
    }

    /// Set one path, builder style.
    pub fn with(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(path.into(), value.into());
        self
    }

    /// Set one path, returning the previous value if any.
    pub fn insert(&mut self, path: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(path.into(), value.into())
    }

    /// Value at a path, if present.
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.0.get(path)
    }

    /// True if the document has no paths.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of paths in the document.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over `(path, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Copy every path of `other` into this document, overwriting.
    pub fn merge(&mut self, other: &SettingsDocument) {
        for (path, value) in other.iter() {
            self.0.insert(path.clone(), value.clone());
        }
    }

    /// Canonical byte encoding sent on the wire (and signed over).
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl From<Map<String, Value>> for SettingsDocument {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl std::fmt::Display for SettingsDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}
