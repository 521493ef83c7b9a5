//! Hashing System - SHA-256 for Cache Keys
//!
//! Keys are derived only from normalized source text and the serialized
//! option set, so the same inputs give the same key on any machine.

use sha2::{Sha256, Digest};
use serde::Serialize;
use serde_json::{Value, to_string};

use crate::ENGINE_VERSION;

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    let sorted = sort_value(&v);
    to_string(&sorted)
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let sorted_map: serde_json::Map<String, Value> = sorted
                .into_iter()
                .map(|(k, v)| (k.clone(), sort_value(v)))
                .collect();
            Value::Object(sorted_map)
        }
        Value::Array(arr) => {
            Value::Array(arr.iter().map(sort_value).collect())
        }
        _ => v.clone()
    }
}

/// Strip a leading BOM and fold CRLF / CR line endings to LF.
pub fn normalize_source(text: &str) -> String {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Hash of the normalized template text
pub fn content_hash(text: &str) -> String {
    sha256_hex(normalize_source(text).as_bytes())
}

/// Compute the cache key for a compiled template
/// cache_key = sha256(engine_version + content_hash + canonical_options)
pub fn compute_cache_key(
    source_text: &str,
    options: &impl Serialize,
) -> Result<String, serde_json::Error> {
    let canonical_options = canonical_json(options)?;
    let combined = format!(
        "{}:{}:{}",
        ENGINE_VERSION,
        content_hash(source_text),
        canonical_options
    );
    Ok(sha256_hex(combined.as_bytes()))
}

/// Checksum over an artifact payload and its declared metadata
pub fn compute_artifact_checksum<T: Serialize>(
    payload: &[u8],
    metadata: &T,
) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(metadata)?;
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

// We need hex encoding
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorted() {
        let obj = json!({"z": 1, "a": 2, "m": 3});
        let canonical = canonical_json(&obj).unwrap();
        assert_eq!(canonical, r#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn test_hash_deterministic() {
        let data = b"test data";
        let h1 = sha256_hex(data);
        let h2 = sha256_hex(data);
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_cache_key_stable_across_line_endings() {
        let options = json!({"inline": true, "fold": false});
        let k1 = compute_cache_key("a\r\nb", &options).unwrap();
        let k2 = compute_cache_key("\u{feff}a\nb", &options).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_cache_key_changes_with_options() {
        let k1 = compute_cache_key("x", &json!({"inline": true})).unwrap();
        let k2 = compute_cache_key("x", &json!({"inline": false})).unwrap();
        assert_ne!(k1, k2);
    }
}
