//! Config parses the YAML configuration carried by a MetricsMonitor spec and
//! builds the stores it declares.

use kube::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{family::FamilySpec, resolver, stores, Error, Result};

/// Selectors filter the objects of a target kind on the API server.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Selectors {
    /// Label selector string, verbatim.
    #[serde(default)]
    pub label: Option<String>,
    /// Field selector string, verbatim.
    #[serde(default)]
    pub field: Option<String>,
}

/// StoreSpec declares one target kind and its metric plan.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreSpec {
    /// Group is the API group of the custom resource.
    #[serde(rename = "g")]
    pub group: String,
    /// Version is the API version of the custom resource.
    #[serde(rename = "v")]
    pub version: String,
    /// Kind is the type of the custom resource.
    #[serde(rename = "k")]
    pub kind: String,
    /// Resource is the plural, lowercase name of the custom resource.
    #[serde(rename = "r")]
    pub resource: String,
    /// Selectors to use to filter the objects.
    #[serde(default)]
    pub selectors: Selectors,
    /// Resolver to use for queries below this scope, unless overridden.
    #[serde(default)]
    pub resolver: Option<resolver::Kind>,
    /// LabelKeys inherited by every family below.
    #[serde(default)]
    pub label_keys: Vec<String>,
    /// LabelValues inherited by every family below.
    #[serde(default)]
    pub label_values: Vec<String>,
    /// Families is the metric families to build for the target kind.
    #[serde(default)]
    pub families: Vec<FamilySpec>,
}

/// Configuration is the parsed form of the configuration YAML.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Configuration {
    /// Stores declares one entry per target kind.
    #[serde(default)]
    pub stores: Vec<StoreSpec>,
}

impl Configuration {
    /// Parse unmarshals the configuration YAML.
    ///
    /// Unknown fields are ignored; missing mandatory fields are errors.
    pub fn parse(raw: &str) -> Result<Configuration> {
        serde_yaml::from_str(raw)
            .map_err(|err| Error::Configuration(format!("error unmarshalling configuration: {err}")))
    }

    /// Build spawns one store per declared target and registers each under
    /// the managed resource's UID.
    ///
    /// Purely additive: the reconciler drops any stale entries for the UID
    /// before calling this.
    pub fn build(
        &self,
        client: &Client,
        registry: &stores::Registry,
        uid: &str,
        try_no_cache: bool,
        cancel: &CancellationToken,
    ) {
        for spec in &self.stores {
            let store = stores::spawn(client, spec, try_no_cache, cancel);
            registry.append(uid, store);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
stores:
  - g: contoso.com
    v: v1alpha1
    k: MyPlatform
    r: myplatforms
    selectors:
      label: "app=sample"
    labelKeys: [job]
    labelValues: [metadata.labels.job]
    families:
      - name: platform_info
        help: Information about each MyPlatform instance
        resolver: cel
        metrics:
          - labelKeys: [name]
            labelValues: [o.metadata.name]
            value: "1"
  - g: samplecontroller.k8s.io
    v: v1alpha1
    k: Foo
    r: foos
    families:
      - name: foo_replicas
        help: Number of replicas for each Foo instance
        metrics:
          - value: spec.replicas
"#;

    #[test]
    fn parse_sample() {
        let config = Configuration::parse(SAMPLE).unwrap();
        assert_eq!(config.stores.len(), 2);

        let platform = &config.stores[0];
        assert_eq!(platform.group, "contoso.com");
        assert_eq!(platform.resource, "myplatforms");
        assert_eq!(platform.selectors.label.as_deref(), Some("app=sample"));
        assert_eq!(platform.label_keys, vec!["job"]);
        assert_eq!(platform.families[0].resolver, Some(resolver::Kind::Cel));
        assert_eq!(platform.families[0].metrics[0].value, "1");

        let foo = &config.stores[1];
        assert!(foo.selectors.label.is_none());
        assert!(foo.resolver.is_none());
        assert_eq!(foo.families[0].metrics[0].value, "spec.replicas");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let config = Configuration::parse(
            "stores:\n  - g: g\n    v: v\n    k: K\n    r: ks\n    surprise: true\n",
        )
        .unwrap();
        assert_eq!(config.stores.len(), 1);
        assert!(config.stores[0].families.is_empty());
    }

    #[test]
    fn missing_mandatory_fields_are_errors() {
        // No resource name.
        assert!(Configuration::parse("stores:\n  - g: g\n    v: v\n    k: K\n").is_err());
        // No family name.
        assert!(Configuration::parse(
            "stores:\n  - g: g\n    v: v\n    k: K\n    r: ks\n    families:\n      - help: h\n",
        )
        .is_err());
        // No metric value.
        assert!(Configuration::parse(
            "stores:\n  - g: g\n    v: v\n    k: K\n    r: ks\n    families:\n      - name: n\n        metrics:\n          - labelKeys: [a]\n",
        )
        .is_err());
    }

    #[test]
    fn empty_configuration() {
        assert_eq!(Configuration::parse("stores: []").unwrap().stores.len(), 0);
        assert!(Configuration::parse("nonsense: [").is_err());
    }
}
