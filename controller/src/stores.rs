//! Stores cache the serialized metric blocks for one target kind each, fed by
//! a dynamic watch and read by the exposition server.

use std::{
    collections::BTreeMap,
    pin::pin,
    sync::{Arc, RwLock},
};

use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::{watcher, WatchStreamExt},
    Client, ResourceExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    config::StoreSpec,
    family::{FamilySpec, Scope},
    resolver,
};

/// Registry maps a managed resource's UID to the stores built for it.
///
/// Two managed resources never share a store. The reconciler is the only
/// writer; the exposition server reads a point-in-time view. The registry is
/// the sole owner of the stores: watch tasks hold only back-references and
/// exit when their store is dropped from here.
#[derive(Clone, Default)]
pub struct Registry(Arc<RwLock<BTreeMap<String, Vec<Arc<Store>>>>>);

impl Registry {
    /// Append adds a store under the given managed-resource UID.
    pub fn append(&self, uid: &str, store: Arc<Store>) {
        let mut inner = self.0.write().unwrap_or_else(|e| e.into_inner());
        inner.entry(uid.to_string()).or_default().push(store);
    }

    /// Drop_uid removes every store registered under the UID, stopping their
    /// watch tasks.
    pub fn drop_uid(&self, uid: &str) {
        let dropped = {
            let mut inner = self.0.write().unwrap_or_else(|e| e.into_inner());
            inner.remove(uid)
        };
        if let Some(stores) = dropped {
            debug!(uid, count = stores.len(), "dropping stores");
            for store in stores {
                store.cancel.cancel();
            }
        }
    }

    /// Contains reports whether any stores are registered under the UID.
    pub fn contains(&self, uid: &str) -> bool {
        let inner = self.0.read().unwrap_or_else(|e| e.into_inner());
        inner.contains_key(uid)
    }

    /// Render writes every store's content, UID-ordered so identical state
    /// serializes identically.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let inner = self.0.read().unwrap_or_else(|e| e.into_inner());
        for stores in inner.values() {
            for store in stores {
                store.write_to(&mut out);
            }
        }
        out
    }
}

/// Store is the per-target-kind cache of serialized family blocks, keyed by
/// the observed object's UID.
pub struct Store {
    gvk: GroupVersionKind,
    families: Vec<FamilySpec>,
    resolver: resolver::Kind,
    label_keys: Vec<String>,
    label_values: Vec<String>,

    // One HELP/TYPE block per family, parallel to `families`; immutable after
    // construction.
    headers: Vec<String>,

    // UID -> per-family blocks, parallel to `families`.
    metrics: RwLock<BTreeMap<String, Vec<String>>>,

    cancel: CancellationToken,
}

impl Store {
    /// New constructs a store for the given target, defaulting the resolver
    /// when the configuration left it unset.
    pub fn new(
        gvk: GroupVersionKind,
        families: Vec<FamilySpec>,
        resolver: Option<resolver::Kind>,
        label_keys: Vec<String>,
        label_values: Vec<String>,
        cancel: CancellationToken,
    ) -> Store {
        let headers = families.iter().map(FamilySpec::headers).collect();
        Store {
            gvk,
            families,
            resolver: resolver.unwrap_or_default(),
            label_keys,
            label_values,
            headers,
            metrics: RwLock::new(BTreeMap::new()),
            cancel,
        }
    }

    /// Target names the kind the store caches, for logging.
    pub fn target(&self) -> String {
        format!("{}/{}.{}", self.gvk.group, self.gvk.version, self.gvk.kind)
    }

    /// Add builds the family blocks for the object and stores them under its
    /// UID. Updates are rebuilds.
    pub fn add(&self, object: &DynamicObject) {
        let Some(uid) = object.uid() else {
            warn!(store = self.target(), name = object.name_any(), "object has no UID, skipping");
            return;
        };
        let json = match serde_json::to_value(object) {
            Ok(json) => json,
            Err(err) => {
                warn!(store = self.target(), error = %err, "error converting object, skipping");
                return;
            }
        };

        // Render outside the lock; the write below is a pointer swap.
        let scope = Scope {
            resolver: Some(self.resolver),
            label_keys: &self.label_keys,
            label_values: &self.label_values,
        };
        let blocks: Vec<String> = self
            .families
            .iter()
            .map(|family| family.render(&json, &self.gvk, scope))
            .collect();
        trace!(store = self.target(), uid, "add");

        let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        metrics.insert(uid, blocks);
    }

    /// Delete removes the object's blocks.
    pub fn delete(&self, object: &DynamicObject) {
        let Some(uid) = object.uid() else {
            warn!(store = self.target(), name = object.name_any(), "object has no UID, skipping");
            return;
        };
        trace!(store = self.target(), uid, "delete");
        let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        metrics.remove(&uid);
    }

    /// Write_to appends the store's exposition text: each family's header
    /// followed by every cached object's block for that family.
    pub fn write_to(&self, out: &mut String) {
        let metrics = self.metrics.read().unwrap_or_else(|e| e.into_inner());
        for (i, header) in self.headers.iter().enumerate() {
            out.push_str(header);
            out.push('\n');
            for blocks in metrics.values() {
                out.push_str(&blocks[i]);
            }
        }
    }
}

/// Spawn builds a store for the spec and starts its watch task.
///
/// The task consumes the dynamic watch with the default backoff and applies
/// events to the store in delivery order. It stops when the returned store is
/// dropped from the registry or when `cancel` (the root token) fires.
pub fn spawn(
    client: &Client,
    spec: &StoreSpec,
    try_no_cache: bool,
    cancel: &CancellationToken,
) -> Arc<Store> {
    let gvk = GroupVersionKind::gvk(&spec.group, &spec.version, &spec.kind);
    let resource = ApiResource::from_gvk_with_plural(&gvk, &spec.resource);
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &resource);

    let mut config = watcher::Config::default();
    if let Some(selector) = spec.selectors.label.as_deref() {
        config = config.labels(selector);
    }
    if let Some(selector) = spec.selectors.field.as_deref() {
        config = config.fields(selector);
    }
    if try_no_cache {
        // Ask for the server's freshest best-effort view (resourceVersion=0).
        config = config.any_semantic();
    }

    let store = Arc::new(Store::new(
        gvk,
        spec.families.clone(),
        spec.resolver,
        spec.label_keys.clone(),
        spec.label_values.clone(),
        cancel.child_token(),
    ));
    tokio::spawn(pump(api, config, store.clone()));
    store
}

// Pump applies watch events to the store until its token fires.
async fn pump(api: Api<DynamicObject>, config: watcher::Config, store: Arc<Store>) {
    let store_name = store.target();
    debug!(store = store_name, "starting watch");
    let mut events = pin!(watcher(api, config).default_backoff());
    loop {
        tokio::select! {
            _ = store.cancel.cancelled() => {
                debug!(store = store_name, "stopping watch");
                break;
            }
            event = events.try_next() => match event {
                Ok(Some(watcher::Event::Apply(object) | watcher::Event::InitApply(object))) => {
                    store.add(&object);
                }
                Ok(Some(watcher::Event::Delete(object))) => store.delete(&object),
                // Re-list markers: the store keeps its contents and relies on
                // the follow-up applies, so re-lists never build twice.
                Ok(Some(watcher::Event::Init | watcher::Event::InitDone)) => {}
                Ok(None) => {
                    debug!(store = store_name, "watch stream ended");
                    break;
                }
                Err(err) => warn!(store = store_name, error = %err, "watch error"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::family::MetricSpec;

    fn sample_object(uid: &str, name: &str, replicas: i64) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "contoso.com/v1alpha1",
            "kind": "MyPlatform",
            "metadata": {"name": name, "uid": uid},
            "spec": {"replicas": replicas},
        }))
        .unwrap()
    }

    fn sample_store() -> Store {
        Store::new(
            GroupVersionKind::gvk("contoso.com", "v1alpha1", "MyPlatform"),
            vec![
                FamilySpec {
                    name: "platform_info".into(),
                    help: "Information about each MyPlatform instance".into(),
                    metrics: vec![MetricSpec {
                        label_keys: vec!["name".into()],
                        label_values: vec!["metadata.name".into()],
                        value: "1".into(),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                FamilySpec {
                    name: "platform_replicas".into(),
                    help: "Number of replicas".into(),
                    metrics: vec![MetricSpec {
                        value: "spec.replicas".into(),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            ],
            None,
            vec![],
            vec![],
            CancellationToken::new(),
        )
    }

    #[test]
    fn add_is_parallel_to_families() {
        let store = sample_store();
        store.add(&sample_object("u1", "a", 3));
        let metrics = store.metrics.read().unwrap();
        assert_eq!(metrics["u1"].len(), store.headers.len());
        assert_eq!(store.headers.len(), 2);
    }

    #[test]
    fn update_rebuilds_and_delete_removes() {
        let store = sample_store();
        store.add(&sample_object("u1", "a", 3));
        store.add(&sample_object("u1", "a", 5));
        {
            let metrics = store.metrics.read().unwrap();
            assert_eq!(metrics.len(), 1);
            assert!(metrics["u1"][1].contains("5.000000"), "{:?}", metrics["u1"]);
        }
        store.delete(&sample_object("u1", "a", 5));
        assert!(store.metrics.read().unwrap().is_empty());
    }

    #[test]
    fn write_to_interleaves_headers_and_blocks() {
        let store = sample_store();
        store.add(&sample_object("u2", "b", 2));
        store.add(&sample_object("u1", "a", 1));
        let mut out = String::new();
        store.write_to(&mut out);
        assert_eq!(
            out,
            "# HELP kube_customresource_platform_info Information about each MyPlatform instance\n\
             # TYPE kube_customresource_platform_info gauge\n\
             kube_customresource_platform_info{name=\"a\",group=\"contoso.com\",version=\"v1alpha1\",kind=\"MyPlatform\"} 1.000000\n\
             kube_customresource_platform_info{name=\"b\",group=\"contoso.com\",version=\"v1alpha1\",kind=\"MyPlatform\"} 1.000000\n\
             # HELP kube_customresource_platform_replicas Number of replicas\n\
             # TYPE kube_customresource_platform_replicas gauge\n\
             kube_customresource_platform_replicas{group=\"contoso.com\",version=\"v1alpha1\",kind=\"MyPlatform\"} 1.000000\n\
             kube_customresource_platform_replicas{group=\"contoso.com\",version=\"v1alpha1\",kind=\"MyPlatform\"} 2.000000\n",
        );
    }

    #[test]
    fn registry_gc() {
        let registry = Registry::default();
        let store = Arc::new(sample_store());
        registry.append("monitor-uid", store.clone());
        assert!(registry.contains("monitor-uid"));
        registry.drop_uid("monitor-uid");
        assert!(!registry.contains("monitor-uid"));
        assert!(store.cancel.is_cancelled());
        assert!(registry.render().is_empty());
    }
}
