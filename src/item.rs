//! `Item`: a schema-bound record, a mapping from field name to typed
//! value, per §3/§4.2.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{GoatError, Result};
use crate::schema::{Schema, SchemaRef, SchemaRegistry};
use crate::value::{FieldChange, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub schema: SchemaRef,
    pub data: BTreeMap<String, Value>,
}

impl Item {
    /// Builds an item, applying schema defaults for any missing optional
    /// field and validating the result.
    pub fn new(schema: &Schema, mut data: BTreeMap<String, Value>) -> Result<Self> {
        for (name, field) in &schema.fields {
            if !data.contains_key(name) {
                if let Some(default) = field.default {
                    data.insert(name.clone(), default());
                }
            }
        }
        schema.validate(&data)?;
        Ok(Item {
            schema: schema.into(),
            data,
        })
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    pub fn set(&self, field: impl Into<String>, value: Value) -> Item {
        let mut data = self.data.clone();
        data.insert(field.into(), value);
        Item {
            schema: self.schema.clone(),
            data,
        }
    }

    /// Checksum of the canonical encoding of the field map, per §3.
    pub fn checksum(&self) -> u64 {
        let canon =
            crate::commit::canonical::to_canonical_bytes(&self.data).expect("item canonicalizes");
        let hash = blake3::hash(&canon);
        u64::from_le_bytes(hash.as_bytes()[0..8].try_into().unwrap())
    }

    pub fn diff(&self, other: &Item) -> BTreeMap<String, Vec<FieldChange>> {
        let mut out = BTreeMap::new();
        let mut names: std::collections::BTreeSet<&String> = std::collections::BTreeSet::new();
        names.extend(self.data.keys());
        names.extend(other.data.keys());
        for name in names {
            let src = self.data.get(name);
            let dst = other.data.get(name);
            match (src, dst) {
                (Some(s), Some(d)) => {
                    let changes = Value::diff(s, d);
                    if !changes.is_empty() {
                        out.insert(name.clone(), changes);
                    }
                }
                (None, Some(d)) => {
                    out.insert(name.clone(), vec![FieldChange::Replace(d.clone())]);
                }
                (Some(_), None) => {
                    out.insert(name.clone(), vec![FieldChange::Remove]);
                }
                (None, None) => {}
            }
        }
        out
    }

    pub fn patch(&self, changes: &BTreeMap<String, Vec<FieldChange>>) -> Result<Item> {
        let mut data = self.data.clone();
        for (field, field_changes) in changes {
            if let [FieldChange::Remove] = field_changes.as_slice() {
                data.remove(field);
                continue;
            }
            match data.get(field) {
                Some(src) => {
                    let patched = Value::patch(src, field_changes)?;
                    data.insert(field.clone(), patched);
                }
                None => {
                    if let [FieldChange::Replace(v)] = field_changes.as_slice() {
                        data.insert(field.clone(), v.clone());
                    } else {
                        return Err(GoatError::UnknownField(field.clone()));
                    }
                }
            }
        }
        Ok(Item {
            schema: self.schema.clone(),
            data,
        })
    }

    /// Walks the schema-registry upgrade chain from this item's schema
    /// version to `target_version`, applying each step's `upgradeFrom`
    /// then defaults for newly-required fields.
    pub fn upgrade_to(&self, registry: &SchemaRegistry, target_version: u32) -> Result<Item> {
        if self.schema.version == target_version {
            return Ok(self.clone());
        }
        if self.schema.version > target_version {
            return Err(GoatError::NoUpgradePath {
                namespace: self.schema.namespace.clone(),
                from: self.schema.version,
                to: target_version,
            });
        }
        let mut current = self.clone();
        let mut version = self.schema.version;
        while version < target_version {
            let next_version = version + 1;
            let next_schema = registry
                .lookup(&current.schema.namespace, next_version)
                .map_err(|_| GoatError::NoUpgradePath {
                    namespace: current.schema.namespace.clone(),
                    from: self.schema.version,
                    to: target_version,
                })?;
            let mut data = BTreeMap::new();
            for (name, field) in &next_schema.fields {
                let prior = current.data.get(name);
                if let Some(upgrade) = field.upgrade_from {
                    data.insert(name.clone(), upgrade(prior));
                } else if let Some(v) = prior {
                    data.insert(name.clone(), v.clone());
                } else if let Some(default) = field.default {
                    data.insert(name.clone(), default());
                } else if field.required {
                    return Err(GoatError::MissingRequired(name.clone()));
                }
            }
            current = Item {
                schema: (&next_schema).into(),
                data,
            };
            version = next_version;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldSchema;

    fn string_field() -> Value {
        Value::String(String::new())
    }

    #[test]
    fn diff_patch_roundtrip() {
        let schema = Schema::new("doc", 1)
            .with_field("title", FieldSchema::required("string"))
            .with_field("count", FieldSchema::optional("number", || Value::Number(0.0)));
        let a = Item::new(
            &schema,
            [("title".to_string(), Value::String("a".into()))].into(),
        )
        .unwrap();
        let b = a.set("title", Value::String("b".into()));
        let changes = a.diff(&b);
        let patched = a.patch(&changes).unwrap();
        assert_eq!(patched.get("title"), b.get("title"));
    }

    #[test]
    fn diff_patch_roundtrips_a_removed_field() {
        let schema = Schema::new("doc", 1)
            .with_field("title", FieldSchema::required("string"))
            .with_field("note", FieldSchema::optional("string", || Value::String(String::new())));
        let a = Item::new(
            &schema,
            [
                ("title".to_string(), Value::String("a".into())),
                ("note".to_string(), Value::String("scratch".into())),
            ]
            .into(),
        )
        .unwrap();
        let mut without_note = a.data.clone();
        without_note.remove("note");
        let b = Item { schema: a.schema.clone(), data: without_note };

        let changes = a.diff(&b);
        assert_eq!(changes.get("note"), Some(&vec![FieldChange::Remove]));
        let patched = a.patch(&changes).unwrap();
        assert_eq!(patched, b);
        assert!(patched.get("note").is_none());
    }

    #[test]
    fn upgrade_adds_defaults() {
        let v1 = Schema::new("doc", 1).with_field("title", FieldSchema::required("string"));
        let v2 = Schema::new("doc", 2)
            .with_field("title", FieldSchema::required("string"))
            .with_field("archived", FieldSchema::optional("boolean", || Value::Boolean(false)));
        let registry = SchemaRegistry::new();
        registry.register(v1.clone());
        registry.register(v2);

        let item = Item::new(
            &v1,
            [("title".to_string(), Value::String("hi".into()))].into(),
        )
        .unwrap();
        let upgraded = item.upgrade_to(&registry, 2).unwrap();
        assert_eq!(upgraded.get("archived"), Some(&Value::Boolean(false)));
        let _ = string_field();
    }
}
