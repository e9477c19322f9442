//! Path is the dotted-field resolver.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use super::unresolved;

// Resolve walks the dotted segments through nested JSON maps. Arrays are not
// addressable; a found composite is rendered whole as compact JSON under the
// query key.
pub(super) fn resolve(query: &str, object: &Value) -> BTreeMap<String, String> {
    let mut cursor = object;
    for segment in query.split('.') {
        cursor = match cursor {
            Value::Object(map) => match map.get(segment) {
                Some(next) => next,
                None => return unresolved(query),
            },
            _ => return unresolved(query),
        };
    }

    let text = match cursor {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        composite => match serde_json::to_string(composite) {
            Ok(text) => text,
            Err(err) => {
                debug!(query, error = %err, "ignoring resolution for query");
                return unresolved(query);
            }
        },
    };
    BTreeMap::from([(query.to_string(), text)])
}
