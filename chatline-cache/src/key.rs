//! Deterministic cache keys.
//!
//! A key is the request identifier followed by a canonical encoding of the
//! request parameters. Object fields are emitted in sorted order at every
//! nesting level, so two logically identical requests always produce the
//! same key no matter how their parameters were assembled.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Separator between the request identifier and the encoded parameters.
const PARAMS_SEPARATOR: char = '?';

/// A cache key derived from a request identifier and its parameters.
///
/// # Format
///
/// - `request_id` alone when the parameters are absent, `null`, or `{}`
/// - `request_id?<canonical-json>` otherwise
///
/// Because the request identifier comes first, every key for one request
/// kind shares that identifier as a prefix, which is what
/// `invalidate_by_prefix` relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a request without parameters.
    pub fn new(request_id: impl Into<String>) -> Self {
        Self(request_id.into())
    }

    /// Key for a request with serializable parameters.
    pub fn with_params<P: Serialize + ?Sized>(
        request_id: &str,
        params: &P,
    ) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(params)?;
        Ok(Self::from_value(request_id, &value))
    }

    /// Key for a request whose parameters are already a JSON value.
    pub fn from_value(request_id: &str, params: &JsonValue) -> Self {
        let is_empty = match params {
            JsonValue::Null => true,
            JsonValue::Object(map) => map.is_empty(),
            _ => false,
        };
        if is_empty {
            return Self(request_id.to_string());
        }

        let mut encoded = String::with_capacity(request_id.len() + 32);
        encoded.push_str(request_id);
        encoded.push(PARAMS_SEPARATOR);
        write_canonical(params, &mut encoded);
        Self(encoded)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The request identifier portion of the key.
    pub fn request_id(&self) -> &str {
        match self.0.split_once(PARAMS_SEPARATOR) {
            Some((request_id, _)) => request_id,
            None => &self.0,
        }
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Write `value` as compact JSON with object keys sorted.
fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut fields: Vec<(&String, &JsonValue)> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_scalar(&JsonValue::String(name.clone()), out);
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &JsonValue, out: &mut String) {
    // Scalars always serialize; the fallback only guards the type system.
    match serde_json::to_string(value) {
        Ok(text) => out.push_str(&text),
        Err(_) => out.push_str("null"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_key_without_params_is_request_id() {
        assert_eq!(CacheKey::new("conversations:recent").as_str(), "conversations:recent");
        assert_eq!(
            CacheKey::from_value("conversations:recent", &JsonValue::Null).as_str(),
            "conversations:recent"
        );
        assert_eq!(
            CacheKey::from_value("conversations:recent", &json!({})).as_str(),
            "conversations:recent"
        );
    }

    #[test]
    fn test_key_field_order_is_irrelevant() {
        let a = CacheKey::from_value("messages", &json!({ "id": "c1", "page": 2 }));
        let b = CacheKey::from_value("messages", &json!({ "page": 2, "id": "c1" }));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), r#"messages?{"id":"c1","page":2}"#);
    }

    #[test]
    fn test_key_nested_objects_are_sorted() {
        let a = CacheKey::from_value("search", &json!({ "filter": { "z": 1, "a": [ { "y": 1, "b": 2 } ] } }));
        assert_eq!(a.as_str(), r#"search?{"filter":{"a":[{"b":2,"y":1}],"z":1}}"#);
    }

    #[test]
    fn test_key_array_order_is_significant() {
        let a = CacheKey::from_value("batch", &json!([1, 2]));
        let b = CacheKey::from_value("batch", &json!([2, 1]));
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_escapes_field_names() {
        let key = CacheKey::from_value("q", &json!({ "a\"b": "c" }));
        assert_eq!(key.as_str(), r#"q?{"a\"b":"c"}"#);
    }

    #[test]
    fn test_key_request_id_and_prefix() {
        let key = CacheKey::from_value("conversation:c1:messages", &json!({ "page": 1 }));
        assert_eq!(key.request_id(), "conversation:c1:messages");
        assert!(key.starts_with("conversation:c1"));
        assert!(!key.starts_with("conversation:c2"));
    }

    #[test]
    fn test_key_with_params_from_struct() {
        #[derive(Serialize)]
        struct Page {
            page_size: u32,
            page: u32,
        }
        let key = CacheKey::with_params("messages", &Page { page_size: 50, page: 3 }).unwrap();
        assert_eq!(key.as_str(), r#"messages?{"page":3,"page_size":50}"#);
    }

    proptest! {
        #[test]
        fn prop_key_is_order_independent(
            fields in proptest::collection::btree_map("[a-z]{1,6}", any::<i64>(), 1..8)
        ) {
            let forward: serde_json::Map<String, JsonValue> = fields
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();
            let mut reversed = serde_json::Map::new();
            for (k, v) in fields.iter().rev() {
                reversed.insert(k.clone(), json!(v));
            }
            let a = CacheKey::from_value("req", &JsonValue::Object(forward));
            let b = CacheKey::from_value("req", &JsonValue::Object(reversed));
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_encoded_params_are_valid_json(
            fields in proptest::collection::btree_map("[a-z]{1,6}", "[ -~]{0,12}", 1..6)
        ) {
            let params: serde_json::Map<String, JsonValue> = fields
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();
            let params = JsonValue::Object(params);
            let key = CacheKey::from_value("req", &params);
            let (_, encoded) = key.as_str().split_once('?').unwrap();
            let decoded: JsonValue = serde_json::from_str(encoded).unwrap();
            prop_assert_eq!(decoded, params);
        }
    }
}
