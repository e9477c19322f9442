//! Pipeline tests: configuration in, exposition text out, no cluster needed.

use std::sync::Arc;

use kube::core::{DynamicObject, GroupVersionKind};
use tokio_util::sync::CancellationToken;

use controller::{
    config::Configuration,
    stores::{Registry, Store},
};

const CONFIGURATION: &str = r#"
stores:
  - g: contoso.com
    v: v1alpha1
    k: MyPlatform
    r: myplatforms
    families:
      - name: platform_info
        help: Information about each MyPlatform instance
        resolver: cel
        metrics:
          - labelKeys: [name]
            labelValues: [o.metadata.name]
            value: "2"
          - labelKeys: [language, environmentType]
            labelValues: [o.spec.language, o.spec.environmentType]
            value: "1"
      - name: platform_replicas
        help: Number of replicas for each MyPlatform instance
        metrics:
          - labelKeys: [name]
            labelValues: [metadata.name]
            value: spec.replicas
"#;

// Build the configured stores and register them under the UID, handing the
// store handles back the way the watch pumps hold them.
fn build_stores(uid: &str, registry: &Registry) -> Vec<Arc<Store>> {
    let configuration = Configuration::parse(CONFIGURATION).unwrap();
    let mut stores = Vec::new();
    for spec in &configuration.stores {
        let store = Arc::new(Store::new(
            GroupVersionKind::gvk(&spec.group, &spec.version, &spec.kind),
            spec.families.clone(),
            spec.resolver,
            spec.label_keys.clone(),
            spec.label_values.clone(),
            CancellationToken::new(),
        ));
        registry.append(uid, store.clone());
        stores.push(store);
    }
    stores
}

fn apply(stores: &[Arc<Store>], object: &DynamicObject) {
    for store in stores {
        store.add(object);
    }
}

fn platform(uid: &str, name: &str, replicas: i64) -> DynamicObject {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "contoso.com/v1alpha1",
        "kind": "MyPlatform",
        "metadata": {"name": name, "uid": uid},
        "spec": {
            "language": "csharp",
            "environmentType": "dev",
            "replicas": replicas,
        },
    }))
    .unwrap()
}

const EXPECTED: &str = "\
# HELP kube_customresource_platform_info Information about each MyPlatform instance
# TYPE kube_customresource_platform_info gauge
kube_customresource_platform_info{name=\"test-sample\",group=\"contoso.com\",version=\"v1alpha1\",kind=\"MyPlatform\"} 2.000000
kube_customresource_platform_info{language=\"csharp\",environmenttype=\"dev\",group=\"contoso.com\",version=\"v1alpha1\",kind=\"MyPlatform\"} 1.000000
# HELP kube_customresource_platform_replicas Number of replicas for each MyPlatform instance
# TYPE kube_customresource_platform_replicas gauge
kube_customresource_platform_replicas{name=\"test-sample\",group=\"contoso.com\",version=\"v1alpha1\",kind=\"MyPlatform\"} 3.000000
";

// Apply a store spec against one observed object and compare the whole
// scrape, fixture-style.
#[test]
fn scrape_matches_fixture() {
    let registry = Registry::default();
    let stores = build_stores("monitor-1", &registry);

    // No objects yet: headers only, one HELP and one TYPE per family.
    let empty = registry.render();
    assert_eq!(empty.matches("# HELP ").count(), 2);
    assert_eq!(empty.matches("# TYPE ").count(), 2);
    assert!(empty.lines().all(|l| l.starts_with('#')));

    apply(&stores, &platform("cr-1", "test-sample", 3));
    assert_eq!(registry.render(), EXPECTED);
}

// Two scrapes of identical state are byte-identical, and every non-header
// line carries the prefix with balanced quoting.
#[test]
fn scrape_is_deterministic_and_well_formed() {
    let registry = Registry::default();
    let stores = build_stores("monitor-1", &registry);
    for i in 0..5 {
        apply(&stores, &platform(&format!("cr-{i}"), &format!("obj-{i}"), i));
    }

    let first = registry.render();
    let second = registry.render();
    assert_eq!(first, second);

    for line in first.lines().filter(|l| !l.starts_with('#')) {
        assert!(line.starts_with("kube_customresource_"), "line {line:?}");
        assert_eq!(line.matches('"').count() % 2, 0, "unbalanced quotes: {line:?}");
        assert!(line.ends_with("000"), "not a %f value: {line:?}");
    }
}

// Re-applying the same object (the add/add coalescing case) changes nothing.
#[test]
fn reapply_is_idempotent() {
    let registry = Registry::default();
    let stores = build_stores("monitor-1", &registry);
    apply(&stores, &platform("cr-1", "test-sample", 3));
    let first = registry.render();
    apply(&stores, &platform("cr-1", "test-sample", 3));
    assert_eq!(registry.render(), first);
}

// Dropping a monitor's UID removes its headers and blocks from the scrape.
#[test]
fn config_churn_drops_stores() {
    let registry = Registry::default();
    let stores = build_stores("monitor-1", &registry);
    apply(&stores, &platform("cr-1", "test-sample", 3));
    assert!(!registry.render().is_empty());

    registry.drop_uid("monitor-1");
    assert_eq!(registry.render(), "");
    assert!(!registry.contains("monitor-1"));
}

// Two monitors never share stores; the scrape concatenates both, UID-ordered.
#[test]
fn monitors_are_isolated() {
    let registry = Registry::default();
    let a = build_stores("monitor-a", &registry);
    let b = build_stores("monitor-b", &registry);
    apply(&a, &platform("cr-1", "test-sample", 3));
    apply(&b, &platform("cr-1", "test-sample", 3));

    let both = registry.render();
    assert_eq!(both.matches("# HELP kube_customresource_platform_info ").count(), 2);

    registry.drop_uid("monitor-a");
    let one = registry.render();
    assert_eq!(one.matches("# HELP kube_customresource_platform_info ").count(), 1);
}
