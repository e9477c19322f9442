//! Cel is the CEL-expression resolver.

use std::collections::BTreeMap;

use cel_interpreter::{objects::Key, Context, Program, Value as CelValue};
use serde_json::Value;
use tracing::debug;

use super::unresolved;

// Queries longer than this are rejected before parsing. cel-interpreter has
// no runtime cost accounting; CEL is not Turing-complete, so bounding the
// query (and evaluating over an already-materialized object) keeps each call
// proportional to its inputs.
const MAX_QUERY_LEN: usize = 4096;

// Resolve parses and evaluates the query with the object bound to `o`.
// Scalar results keep the query as their key; maps and lists expand one entry
// per scalar child, composite children skipped.
pub(super) fn resolve(query: &str, object: &Value) -> BTreeMap<String, String> {
    if query.len() > MAX_QUERY_LEN {
        debug!(query.len = query.len(), "query too long, ignoring resolution");
        return unresolved(query);
    }

    let program = match Program::compile(query) {
        Ok(program) => program,
        Err(err) => {
            debug!(query, error = %err, "ignoring resolution for query");
            return unresolved(query);
        }
    };
    let mut context = Context::default();
    if let Err(err) = context.add_variable("o", object) {
        debug!(query, error = %err, "ignoring resolution for query");
        return unresolved(query);
    }
    let out = match program.execute(&context) {
        Ok(out) => out,
        Err(err) => {
            debug!(query, error = %err, "ignoring resolution for query");
            return unresolved(query);
        }
    };

    match &out {
        CelValue::Bool(_)
        | CelValue::Int(_)
        | CelValue::UInt(_)
        | CelValue::Float(_)
        | CelValue::String(_) => match scalar_text(&out) {
            Some(text) => BTreeMap::from([(query.to_string(), text)]),
            None => unresolved(query),
        },
        CelValue::Map(map) => {
            let mut resolved = BTreeMap::new();
            for (key, value) in map.map.iter() {
                match scalar_text(value) {
                    Some(text) => {
                        resolved.insert(key_text(key), text);
                    }
                    None => debug!(query, key = %key_text(key), "skipping composite value"),
                }
            }
            resolved
        }
        CelValue::List(list) => {
            let mut resolved = BTreeMap::new();
            for (index, value) in list.iter().enumerate() {
                match scalar_text(value) {
                    Some(text) => {
                        resolved.insert(index.to_string(), text);
                    }
                    None => debug!(query, index, "skipping composite value"),
                }
            }
            resolved
        }
        _ => {
            debug!(query, "unsupported output type, ignoring resolution");
            unresolved(query)
        }
    }
}

fn scalar_text(value: &CelValue) -> Option<String> {
    match value {
        CelValue::Bool(b) => Some(b.to_string()),
        CelValue::Int(i) => Some(i.to_string()),
        CelValue::UInt(u) => Some(u.to_string()),
        CelValue::Float(f) => Some(f.to_string()),
        CelValue::String(s) => Some(s.as_ref().clone()),
        _ => None,
    }
}

fn key_text(key: &Key) -> String {
    match key {
        Key::String(s) => s.as_ref().clone(),
        Key::Int(i) => i.to_string(),
        Key::Uint(u) => u.to_string(),
        Key::Bool(b) => b.to_string(),
    }
}
