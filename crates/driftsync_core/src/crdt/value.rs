//! Conversions between plain JSON values and yrs value types.
//!
//! Documents are JSON-like records. When written into the CRDT, object
//! fields become nested Y maps so concurrent edits to different fields of
//! the same document merge at field granularity; scalars and arrays are
//! stored as opaque [`Any`] leaves with last-writer-wins semantics.

use std::sync::Arc;

use serde_json::Value;
use yrs::{Any, Map, MapPrelim, MapRef, Out, ReadTxn, TransactionMut};

/// Convert a JSON scalar or array into a yrs [`Any`] leaf.
///
/// Objects are converted to `Any::Map` when they appear inside arrays,
/// where field-granular merging is not available anyway.
pub fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Any::BigInt(i)
            } else {
                Any::Number(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Any::String(Arc::from(s.as_str())),
        Value::Array(items) => {
            let converted: Vec<Any> = items.iter().map(json_to_any).collect();
            Any::Array(Arc::from(converted))
        }
        Value::Object(fields) => {
            let converted: std::collections::HashMap<String, Any> = fields
                .iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect();
            Any::Map(Arc::new(converted))
        }
    }
}

/// Convert a yrs [`Any`] leaf back into a JSON value.
pub fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Any::BigInt(i) => Value::Number((*i).into()),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::Number((*b).into())).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(fields) => {
            let mut object = serde_json::Map::new();
            for (key, value) in fields.iter() {
                object.insert(key.clone(), any_to_json(value));
            }
            Value::Object(object)
        }
    }
}

/// Set a single field on a Y map from a JSON value.
///
/// JSON objects become nested Y maps (recursively); everything else is
/// stored as an `Any` leaf.
pub fn set_field(map: &MapRef, txn: &mut TransactionMut, key: &str, value: &Value) {
    match value {
        Value::Object(fields) => {
            let nested = map.insert(txn, key, MapPrelim::default());
            for (field, field_value) in fields {
                set_field(&nested, txn, field, field_value);
            }
        }
        other => {
            map.insert(txn, key, json_to_any(other));
        }
    }
}

/// Merge a JSON patch into a Y map, setting only fields whose value
/// actually changed.
///
/// Nested objects merge recursively when the existing field is itself a
/// Y map; any other shape mismatch overwrites the field wholesale.
pub fn merge_patch(map: &MapRef, txn: &mut TransactionMut, patch: &serde_json::Map<String, Value>) {
    for (field, patch_value) in patch {
        match (map.get(txn, field), patch_value) {
            (Some(Out::YMap(existing)), Value::Object(nested_patch)) => {
                merge_patch(&existing, txn, nested_patch);
            }
            (Some(existing), _) if out_to_json(txn, &existing) == *patch_value => {
                // Unchanged field, keep the delta minimal
            }
            _ => set_field(map, txn, field, patch_value),
        }
    }
}

/// Convert a map value read from the CRDT back into JSON.
pub fn out_to_json<T: ReadTxn>(txn: &T, out: &Out) -> Value {
    match out {
        Out::Any(any) => any_to_json(any),
        Out::YMap(map) => map_to_json(txn, map),
        _ => {
            // Shared types we never write (text, xml); nothing to project.
            Value::Null
        }
    }
}

/// Read an entire Y map as a JSON object.
pub fn map_to_json<T: ReadTxn>(txn: &T, map: &MapRef) -> Value {
    let mut object = serde_json::Map::new();
    for (key, value) in map.iter(txn) {
        object.insert(key.to_string(), out_to_json(txn, &value));
    }
    Value::Object(object)
}
