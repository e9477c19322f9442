//! Family holds the metric-family configuration model and turns observed
//! objects into blocks of text-exposition lines.

use anyhow::{anyhow, bail};
use kube::core::GroupVersionKind;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::resolver;

/// METRIC_PREFIX marks every emitted metric as custom-resource generated (and
/// carrying no stability guarantee), in convention with kube-state-metrics.
pub const METRIC_PREFIX: &str = "kube_customresource_";

// The type text is pinned to `gauge` to avoid ingestion issues with backends
// that do not recognize the full OpenMetrics set.
const METRIC_TYPE: &str = "gauge";

/// FamilySpec is a named group of metrics sharing a HELP/TYPE header.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FamilySpec {
    /// Name of the metric family, appended to [`METRIC_PREFIX`].
    pub name: String,
    /// Help text for the metric family.
    #[serde(default)]
    pub help: String,
    /// Metrics that belong to the family.
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
    /// Resolver to use for queries below this scope, unless overridden.
    #[serde(default)]
    pub resolver: Option<resolver::Kind>,
    /// LabelKeys defined at this scope, extending the store's.
    #[serde(default)]
    pub label_keys: Vec<String>,
    /// LabelValues defined at this scope, extending the store's.
    #[serde(default)]
    pub label_values: Vec<String>,
}

/// MetricSpec is a single time series within a family.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricSpec {
    /// LabelKeys names the labels to attach.
    #[serde(default)]
    pub label_keys: Vec<String>,
    /// LabelValues holds one query per label key.
    #[serde(default)]
    pub label_values: Vec<String>,
    /// Value is the metric value: a float literal, or a query to resolve.
    pub value: String,
    /// Resolver override for this metric.
    #[serde(default)]
    pub resolver: Option<resolver::Kind>,
}

/// Scope carries the store-level defaults down into a family render.
#[derive(Clone, Copy, Debug, Default)]
pub struct Scope<'a> {
    /// Resolver declared on the store, if any.
    pub resolver: Option<resolver::Kind>,
    /// LabelKeys declared on the store.
    pub label_keys: &'a [String],
    /// LabelValues declared on the store.
    pub label_values: &'a [String],
}

impl FamilySpec {
    /// Headers renders the HELP/TYPE block for the family.
    pub fn headers(&self) -> String {
        format!(
            "# HELP {prefix}{name} {help}\n# TYPE {prefix}{name} {METRIC_TYPE}",
            prefix = METRIC_PREFIX,
            name = self.name,
            help = self.help,
        )
    }

    /// Render produces the family's serialized block for one observed object.
    ///
    /// Metrics that fail to resolve are skipped individually; the rest of the
    /// family still emits. Inherited label slices are copied, never mutated in
    /// place, so renders are safe to repeat across events.
    pub fn render(&self, object: &Value, gvk: &GroupVersionKind, scope: Scope<'_>) -> String {
        let mut out = String::new();
        for metric in &self.metrics {
            let kind = metric
                .resolver
                .or(self.resolver)
                .or(scope.resolver)
                .unwrap_or_default();

            // Inherit the label keys and values: metric, then family, then store.
            let keys = metric
                .label_keys
                .iter()
                .chain(&self.label_keys)
                .chain(scope.label_keys);
            let queries = metric
                .label_values
                .iter()
                .chain(&self.label_values)
                .chain(scope.label_values);

            let mut resolved_keys = Vec::new();
            let mut resolved_values = Vec::new();
            for (key, query) in keys.zip(queries) {
                let resolved = kind.resolve(query, object);
                match resolved.get(query) {
                    // The supplied key is preserved for non-composite results.
                    Some(value) => {
                        resolved_keys.push(normalize_label_key(key));
                        resolved_values.push(value.clone());
                    }
                    // Composite results expand, prefixing the supplied key.
                    None => {
                        for (child_key, value) in &resolved {
                            resolved_keys.push(normalize_label_key(&format!("{key}{child_key}")));
                            resolved_values.push(value.clone());
                        }
                    }
                }
            }

            // A literal float is used directly; anything else goes through the
            // resolver and the metric is skipped when that fails.
            let value = if metric.value.parse::<f64>().is_ok() {
                metric.value.clone()
            } else {
                match kind.resolve(&metric.value, object).remove(&metric.value) {
                    Some(value) => value,
                    None => {
                        debug!(family = self.name, value = metric.value, "unresolved metric value, skipping");
                        continue;
                    }
                }
            };

            match write_sample(&self.name, gvk, &value, resolved_keys, resolved_values) {
                Ok(line) => out.push_str(&line),
                Err(err) => {
                    warn!(family = self.name, error = %err, "error writing metric, skipping");
                }
            }
        }
        out
    }
}

/// Write_sample serializes one metric line.
///
/// Label pairs are sorted by key length then lexicographically, the synthetic
/// `group`/`version`/`kind` labels are appended after the sort, and the value
/// must parse as a finite double.
pub fn write_sample(
    family: &str,
    gvk: &GroupVersionKind,
    value: &str,
    resolved_keys: Vec<String>,
    resolved_values: Vec<String>,
) -> anyhow::Result<String> {
    if resolved_keys.len() != resolved_values.len() {
        bail!(
            "expected label keys {resolved_keys:?} ({}) and label values {resolved_values:?} ({}) to be of the same length",
            resolved_keys.len(),
            resolved_values.len(),
        );
    }

    let mut labels: Vec<(String, String)> = resolved_keys
        .into_iter()
        .zip(resolved_values)
        .collect();
    labels.sort_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    labels.push(("group".to_string(), gvk.group.clone()));
    labels.push(("version".to_string(), gvk.version.clone()));
    labels.push(("kind".to_string(), gvk.kind.clone()));

    let value: f64 = value
        .parse()
        .map_err(|err| anyhow!("error parsing metric value {value:?} as a double: {err}"))?;
    if !value.is_finite() {
        bail!("metric value {value:?} is not finite");
    }

    let mut line = String::with_capacity(64);
    line.push_str(METRIC_PREFIX);
    line.push_str(family);
    if !labels.is_empty() {
        let mut separator = '{';
        for (key, value) in &labels {
            line.push(separator);
            line.push_str(key);
            line.push_str("=\"");
            line.push_str(&escape_label_value(value));
            line.push('"');
            separator = ',';
        }
        line.push('}');
    }
    line.push(' ');
    line.push_str(&format!("{value:.6}"));
    line.push('\n');
    Ok(line)
}

// Label keys are lowercased with every non-word character mapped to `_`.
pub(crate) fn normalize_label_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}
