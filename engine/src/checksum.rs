//! Canonical JSON and content checksums.
//!
//! Checksums detect divergence between a queued payload and the last committed
//! one; they are not a security boundary. The digest is fixed to MD5 over the
//! canonical JSON so that every replica computes the same value.

use crate::{Payload, Version};
use md5::{Digest, Md5};
use serde_json::Value;

/// Render `value` as canonical JSON: object keys sorted, no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Lowercase hex MD5 of the canonical JSON of `value`.
pub fn digest(value: &Value) -> String {
    format!("{:x}", Md5::digest(canonical_json(value).as_bytes()))
}

/// Checksum stored in a version entry.
///
/// Covers the committed payload plus the identifying fields, so the same
/// content at a later version hashes differently.
pub fn record_checksum(
    table_name: &str,
    record_id: &str,
    version: Version,
    modified_by: &str,
    payload: &Payload,
) -> String {
    digest(&serde_json::json!({
        "table": table_name,
        "record": record_id,
        "version": version,
        "modified_by": modified_by,
        "data": Value::Object(payload.clone()),
    }))
}

/// Content-only digest, for equality-of-content comparisons across versions.
pub fn content_digest(payload: &Payload) -> String {
    digest(&Value::Object(payload.clone()))
}

/// Canonical equality of two JSON values.
pub fn canonical_eq(a: &Value, b: &Value) -> bool {
    canonical_json(a) == canonical_json(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"d": [3, {"z": true, "y": null}], "c": "x"}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":"x","d":[3,{"y":null,"z":true}]},"b":1}"#
        );
    }

    #[test]
    fn canonical_json_escapes_keys_and_strings() {
        let value = json!({"k\"ey": "line\nbreak"});
        assert_eq!(canonical_json(&value), r#"{"k\"ey":"line\nbreak"}"#);
    }

    #[test]
    fn digest_is_md5_hex() {
        // md5("{}")
        assert_eq!(digest(&json!({})), "99914b932bd37a50b983c5e7c90ae93b");
        assert_eq!(digest(&json!({"a": 1})).len(), 32);
    }

    #[test]
    fn digest_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": [1, 2]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": [1, 2], "x": 1}"#).unwrap();
        assert_eq!(digest(&a), digest(&b));
        assert!(canonical_eq(&a, &b));
    }

    #[test]
    fn record_checksum_covers_identity_and_version() {
        let payload = json!({"name": "Srv", "price": 9}).as_object().cloned().unwrap();
        let v1 = record_checksum("products", "5", 1, "server", &payload);
        let v2 = record_checksum("products", "5", 2, "server", &payload);
        let other = record_checksum("products", "6", 1, "server", &payload);

        assert_ne!(v1, v2);
        assert_ne!(v1, other);
        assert_eq!(v1, record_checksum("products", "5", 1, "server", &payload));
        assert_eq!(content_digest(&payload), digest(&json!({"price": 9, "name": "Srv"})));
    }
}
