use std::{
    collections::HashMap,
    env,
    pin::Pin,
    sync::{LazyLock, Mutex},
};

use futures::Future;
use kube::{core::GroupVersionKind, runtime::events};
use tokio::time::{Duration, Instant};

// Re-exports for everyone's easy use.
pub(crate) mod prelude {
    pub use std::sync::Arc;

    pub use futures::prelude::*;
    pub use kube::{
        self,
        api::{Api, Patch, PatchParams},
        runtime::{
            controller::{Action, Controller},
            events::{Event, EventType},
            watcher,
        },
        Resource, ResourceExt,
    };
    pub use tokio_util::sync::CancellationToken;
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use api::v1alpha1;

    pub use super::{Context, ControllerFuture, Error, Result};
    pub use super::{CONTROLLER_NAME, PATCH_PARAMS};
}

pub mod config;
pub mod family;
pub mod metrics;
pub mod monitors;
pub mod probe;
pub mod resolver;
pub mod server;
pub mod stores;

// NB The docs are unclear, but backtraces are unsupported on stable.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("tracing_subscriber error: {0}")]
    TracingConfig(#[from] tracing_subscriber::filter::ParseError),
    #[error("tracing error: {0}")]
    Tracing(#[from] tracing::subscriber::SetGlobalDefaultError),
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    #[error("kubeconfig error: {0}")]
    KubeConfig(#[from] kube::config::InferConfigError),
    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),
    #[error("finalizer error: {0}")]
    // NB: finalizer::Error embeds the reconciler error (which is this), so box to break the cycle.
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tokio error: {0}")]
    Tokio(#[from] tokio::task::JoinError),
    #[error("http error: {0}")]
    Http(#[from] http::Error),
    #[error("missing metadata on kubernetes object: {0}")]
    MissingMetadata(&'static str),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("some other error: {0}")]
    Other(#[from] anyhow::Error),
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    YAML(#[from] serde_yaml::Error),
    #[error("parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("metrics exporter error: {0}")]
    Exporter(#[from] metrics_exporter_prometheus::BuildError),
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(err: kube::runtime::finalizer::Error<Error>) -> Self {
        Error::Finalizer(Box::new(err))
    }
}

/// Result typedef for the controller.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Context is the state shared by the reconciler workers and the exposition
/// server.
pub struct Context {
    /// Client for the cluster the controller runs against.
    pub client: kube::Client,
    /// Registry maps managed-resource UIDs to the stores built for them.
    pub registry: stores::Registry,
    /// Try_no_cache asks the API server for its freshest view on list/watch.
    pub try_no_cache: bool,
    /// Cancel is the root token every long-lived task is joined on.
    pub cancel: tokio_util::sync::CancellationToken,

    recorder: events::Recorder,
    backoffs: Mutex<HashMap<String, u32>>,
    bucket: Mutex<TokenBucket>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ctx")
    }
}

static REPORTER: LazyLock<events::Reporter> = LazyLock::new(|| events::Reporter {
    controller: CONTROLLER_NAME.to_string(),
    instance: env::var("CONTROLLER_POD_NAME").ok(),
});

impl Context {
    /// New constructs a Context around the given client.
    pub fn new(
        client: kube::Client,
        try_no_cache: bool,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Context {
        let recorder = events::Recorder::new(client.clone(), REPORTER.clone());
        Context {
            client,
            registry: stores::Registry::default(),
            try_no_cache,
            cancel,
            recorder,
            backoffs: Mutex::new(HashMap::new()),
            bucket: Mutex::new(TokenBucket::new(RECONCILE_RATE, RECONCILE_BURST)),
        }
    }

    /// Gvk_exists reports whether the given kind is queryable on the cluster.
    pub async fn gvk_exists(&self, gvk: &GroupVersionKind) -> bool {
        kube::discovery::oneshot::pinned_kind(&self.client, gvk)
            .await
            .is_ok()
    }

    /// Publish sends an Event for the referenced object.
    pub async fn publish(
        &self,
        ev: &events::Event,
        oref: &k8s_openapi::api::core::v1::ObjectReference,
    ) -> Result<()> {
        Ok(self.recorder.publish(ev, oref).await?)
    }

    /// Throttle blocks until the global reconcile token bucket admits one
    /// more operation.
    pub async fn throttle(&self) {
        let wait = {
            let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
            bucket.reserve(Instant::now())
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Next_backoff returns the requeue delay for the given object key,
    /// doubling on each consecutive failure.
    pub fn next_backoff(&self, key: &str) -> Duration {
        let mut backoffs = self.backoffs.lock().unwrap_or_else(|e| e.into_inner());
        let attempts = backoffs.entry(key.to_string()).or_insert(0);
        *attempts = attempts.saturating_add(1);
        let base = BACKOFF_FLOOR.saturating_mul(1u32.checked_shl(*attempts - 1).unwrap_or(u32::MAX));
        base.min(BACKOFF_CEILING)
    }

    /// Reset_backoff clears the failure streak for the given object key.
    pub fn reset_backoff(&self, key: &str) {
        let mut backoffs = self.backoffs.lock().unwrap_or_else(|e| e.into_inner());
        backoffs.remove(key);
    }
}

pub type ControllerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

// Per-item backoff bounds and the global admission rate for reconciles.
const BACKOFF_FLOOR: Duration = Duration::from_millis(5);
const BACKOFF_CEILING: Duration = Duration::from_secs(5 * 60);
const RECONCILE_RATE: f64 = 50.0;
const RECONCILE_BURST: f64 = 300.0;

// TokenBucket admits RECONCILE_RATE operations per second with bursts up to
// RECONCILE_BURST, borrowing against future refill when empty.
struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64) -> TokenBucket {
        TokenBucket {
            rate,
            burst,
            tokens: burst,
            last: Instant::now(),
        }
    }

    fn reserve(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last = now;
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

fn keyify<S: ToString, K: AsRef<str>>(space: S, key: K) -> String {
    let mut out = space.to_string();
    key.as_ref()
        .chars()
        .map(|c| match c {
            '_' | ' ' | '\t' | '\n' => '-',
            _ => c.to_ascii_lowercase(),
        })
        .for_each(|c| out.push(c));
    out
}

/// K8s_label prefixes the given key with the well-known kubernetes label
/// namespace.
pub fn k8s_label<S: AsRef<str>>(s: S) -> String {
    keyify("app.kubernetes.io/", s)
}

/// PATCH_PARAMS is the server-side-apply parameters used for every patch the
/// controller issues.
pub static PATCH_PARAMS: LazyLock<kube::api::PatchParams> =
    LazyLock::new(|| kube::api::PatchParams::apply(CONTROLLER_NAME));

/// CONTROLLER_NAME is the name the controller uses whenever it needs a
/// human-readable name.
pub const CONTROLLER_NAME: &str = "crstate-controller";
