//! Named, versioned item schemas and the process-wide schema registry,
//! per §3 and §9 ("Process-wide schema registry").

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{GoatError, Result};
use crate::value::Value;

/// A single field's type and upgrade behaviour.
#[derive(Clone, Copy)]
pub struct FieldSchema {
    pub type_name: &'static str,
    pub required: bool,
    pub default: Option<fn() -> Value>,
    /// Called when upgrading an item from the prior schema version; `None`
    /// means the field is new (its `default()` is used instead) or passes
    /// through unchanged when present in the prior version too.
    pub upgrade_from: Option<fn(prior: Option<&Value>) -> Value>,
}

impl FieldSchema {
    pub fn required(type_name: &'static str) -> Self {
        Self {
            type_name,
            required: true,
            default: None,
            upgrade_from: None,
        }
    }

    pub fn optional(type_name: &'static str, default: fn() -> Value) -> Self {
        Self {
            type_name,
            required: false,
            default: Some(default),
            upgrade_from: None,
        }
    }

    pub fn with_upgrade(mut self, upgrade_from: fn(prior: Option<&Value>) -> Value) -> Self {
        self.upgrade_from = Some(upgrade_from);
        self
    }

    fn matches(&self, v: &Value) -> bool {
        v.type_name() == self.type_name
    }
}

/// `{namespace, version, fields}` — a named, versioned item shape.
#[derive(Clone)]
pub struct Schema {
    pub namespace: String,
    pub version: u32,
    pub fields: BTreeMap<String, FieldSchema>,
}

impl Schema {
    pub fn new(namespace: impl Into<String>, version: u32) -> Self {
        Self {
            namespace: namespace.into(),
            version,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, field: FieldSchema) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    pub fn key(&self) -> (String, u32) {
        (self.namespace.clone(), self.version)
    }

    pub fn validate(&self, data: &BTreeMap<String, Value>) -> Result<()> {
        for (name, field) in &self.fields {
            match data.get(name) {
                Some(v) if !field.matches(v) => {
                    return Err(GoatError::TypeMismatch {
                        field: name.clone(),
                        expected: field.type_name,
                        got: v.type_name(),
                    })
                }
                None if field.required => return Err(GoatError::MissingRequired(name.clone())),
                _ => {}
            }
        }
        for name in data.keys() {
            if !self.fields.contains_key(name) {
                return Err(GoatError::UnknownField(name.clone()));
            }
        }
        Ok(())
    }
}

/// Serialisable identity of a schema, for embedding in commits/items
/// without carrying function pointers across the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRef {
    pub namespace: String,
    pub version: u32,
}

impl From<&Schema> for SchemaRef {
    fn from(s: &Schema) -> Self {
        SchemaRef {
            namespace: s.namespace.clone(),
            version: s.version,
        }
    }
}

/// Process-wide, append-only registry keyed by `(namespace, version)`.
/// Populated once at startup via `register`; queried by deserialisation.
/// No dynamic reflection — schemas must be registered in-process before
/// any item referencing them can be materialised.
pub struct SchemaRegistry {
    schemas: RwLock<BTreeMap<(String, u32), Schema>>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, schema: Schema) {
        let key = schema.key();
        self.schemas.write().insert(key, schema);
    }

    pub fn lookup(&self, namespace: &str, version: u32) -> Result<Schema> {
        self.schemas
            .read()
            .get(&(namespace.to_string(), version))
            .cloned()
            .ok_or_else(|| GoatError::UnknownSchema {
                namespace: namespace.to_string(),
                version,
            })
    }

    /// The highest registered version for `namespace`, used when
    /// computing the merge engine's upgrade target (§4.5 step 3).
    pub fn latest_version(&self, namespace: &str) -> Option<u32> {
        self.schemas
            .read()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, v)| *v)
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let registry = SchemaRegistry::new();
        let schema = Schema::new("doc", 1).with_field("title", FieldSchema::required("string"));
        registry.register(schema);
        let looked_up = registry.lookup("doc", 1).unwrap();
        assert_eq!(looked_up.namespace, "doc");
    }

    #[test]
    fn unknown_schema_errors() {
        let registry = SchemaRegistry::new();
        match registry.lookup("missing", 1) {
            Err(GoatError::UnknownSchema { .. }) => {}
            other => panic!("expected UnknownSchema, got {:?}", other.map(|_| ())),
        }
    }
}
