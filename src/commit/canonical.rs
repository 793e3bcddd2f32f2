//! Canonical JSON encoding: sorted keys, stable numeric formatting. Per
//! §9 ("Canonical encoding") this is the sole basis for content-addressing
//! and signature stability, so every caller must route through here
//! instead of `serde_json::to_vec`.

use serde::Serialize;
use serde_json::Value as Json;

use crate::error::Result;

/// Canonicalizes `v`'s JSON representation (sorted object keys, no
/// incidental whitespace) and returns the encoded bytes.
pub fn to_canonical_bytes<T: Serialize>(v: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_value(v)?;
    let canon = canonicalize(&json);
    Ok(serde_json::to_vec(&canon)?)
}

/// Recursively sorts object keys. Arrays keep their given order — callers
/// that need deterministic set ordering (§9) sort the elements themselves
/// before serializing, since canonicalization here has no type
/// information to distinguish an ordered array from an unordered set.
fn canonicalize(v: &Json) -> Json {
    match v {
        Json::Object(map) => {
            let mut sorted: Vec<(String, Json)> =
                map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Json::Object(out)
        }
        Json::Array(items) => Json::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// blake3 content hash of `v`'s canonical encoding, hex-encoded.
pub fn content_hash<T: Serialize>(v: &T) -> Result<String> {
    let bytes = to_canonical_bytes(v)?;
    Ok(hex::encode(blake3::hash(&bytes).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_encoding() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(to_canonical_bytes(&a).unwrap(), to_canonical_bytes(&b).unwrap());
    }

    #[test]
    fn nested_objects_sort_recursively() {
        let a = json!({"outer": {"z": 1, "y": 2}});
        let b = json!({"outer": {"y": 2, "z": 1}});
        assert_eq!(to_canonical_bytes(&a).unwrap(), to_canonical_bytes(&b).unwrap());
    }
}
