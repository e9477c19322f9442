//! Resolver evaluates the label and value queries of a metrics configuration
//! against an observed object's JSON form.
//!
//! Both variants are total: any parse, evaluation, or lookup failure yields
//! the `{query: query}` fallback so callers can tell "unresolved" apart from
//! "resolved to empty", and no input panics or performs I/O.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod cel;
mod path;

/// Kind selects which resolver evaluates a scope's queries.
///
/// Unset scopes inherit from their parent; a fully-unset chain defaults to
/// [`Kind::Unstructured`].
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Cel evaluates the query as a CEL expression with the object bound to `o`.
    Cel,
    /// Unstructured addresses nested fields with a dotted path.
    #[default]
    Unstructured,
}

impl Kind {
    /// Resolve evaluates the query against the object.
    ///
    /// The result maps resolved keys to their text representations; see the
    /// module documentation for the fallback contract.
    pub fn resolve(&self, query: &str, object: &Value) -> BTreeMap<String, String> {
        match self {
            Kind::Cel => cel::resolve(query, object),
            Kind::Unstructured => path::resolve(query, object),
        }
    }
}

// The "unresolved" marker: the query mapped to itself.
fn unresolved(query: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(query.to_string(), query.to_string())])
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn object() -> Value {
        json!({
            "metadata": {
                "name": "test-sample",
                "labels": {"env": "prod", "tier": "web"},
            },
            "spec": {"replicas": 3, "paused": false, "ratio": 0.5},
        })
    }

    #[test]
    fn path_scalars() {
        let o = object();
        let kind = Kind::Unstructured;
        assert_eq!(
            kind.resolve("metadata.name", &o),
            BTreeMap::from([("metadata.name".into(), "test-sample".into())]),
        );
        assert_eq!(kind.resolve("spec.replicas", &o)["spec.replicas"], "3");
        assert_eq!(kind.resolve("spec.paused", &o)["spec.paused"], "false");
        assert_eq!(kind.resolve("spec.ratio", &o)["spec.ratio"], "0.5");
    }

    #[test]
    fn path_missing_is_unresolved() {
        let o = object();
        let got = Kind::Unstructured.resolve("spec.missing.deeper", &o);
        assert_eq!(got, unresolved("spec.missing.deeper"));
    }

    #[test]
    fn path_composite_renders_as_json() {
        let o = object();
        let got = Kind::Unstructured.resolve("metadata.labels", &o);
        assert_eq!(
            got["metadata.labels"],
            r#"{"env":"prod","tier":"web"}"#,
        );
    }

    #[test]
    fn cel_scalars() {
        let o = object();
        let kind = Kind::Cel;
        assert_eq!(kind.resolve("o.metadata.name", &o)["o.metadata.name"], "test-sample");
        assert_eq!(kind.resolve("o.spec.replicas", &o)["o.spec.replicas"], "3");
        assert_eq!(
            kind.resolve("o.spec.replicas * 2", &o)["o.spec.replicas * 2"],
            "6",
        );
    }

    #[test]
    fn cel_map_expands() {
        let o = object();
        let got = Kind::Cel.resolve("o.metadata.labels", &o);
        assert_eq!(
            got,
            BTreeMap::from([
                ("env".to_string(), "prod".to_string()),
                ("tier".to_string(), "web".to_string()),
            ]),
        );
    }

    #[test]
    fn cel_list_expands_by_index() {
        let o = serde_json::json!({"spec": {"zones": ["a", "b"]}});
        let got = Kind::Cel.resolve("o.spec.zones", &o);
        assert_eq!(
            got,
            BTreeMap::from([
                ("0".to_string(), "a".to_string()),
                ("1".to_string(), "b".to_string()),
            ]),
        );
    }

    #[test]
    fn cel_errors_are_unresolved() {
        let o = object();
        // Parse error, missing field, and an over-long query all fall back.
        for q in ["o.metadata.(", "o.metadata.labels.baz"] {
            assert_eq!(Kind::Cel.resolve(q, &o), unresolved(q), "query {q:?}");
        }
        let long = format!("o.{}", "x.".repeat(4096));
        assert_eq!(Kind::Cel.resolve(&long, &o), unresolved(&long));
    }

    #[test]
    fn totality() {
        let o = object();
        for kind in [Kind::Cel, Kind::Unstructured] {
            for q in ["", ".", "o..", "metadata", "42", "\"x\""] {
                // Never panics; empty or non-empty are both fine.
                let _ = kind.resolve(q, &o);
            }
        }
    }
}
