use std::{env, sync::Arc};

use kube::{api::Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use controller::{Context, Result};

pub mod prelude {
    pub use std::sync::Arc;

    pub use kube::api::{Api, DeleteParams, PostParams};
    pub use serde_json::json;
    pub use tokio::{task, time::Duration};
    pub use tokio_util::sync::CancellationToken;
}

/// In_ci reports if the test is being run in CI.
#[allow(dead_code)]
pub fn in_ci() -> bool {
    env::var("CI").is_ok_and(|v| v == "true")
}

/// Test_context builds a Context against the ambient cluster.
pub async fn test_context(cancel: CancellationToken) -> Arc<Context> {
    let client = Client::try_default().await.expect("unable to build client");
    Arc::new(Context::new(client, false, cancel))
}

/// Load_crds applies the MetricsMonitor CRD, tolerating an existing one.
pub async fn load_crds(client: &Client) -> Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crd = api::v1alpha1::MetricsMonitor::crd();
    match crds.create(&Default::default(), &crd).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(err) => Err(err.into()),
    }
}
