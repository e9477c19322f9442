//! V1alpha1 types for the crstate CRDs.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// MetricsMonitorSpec describes the desired state of a MetricsMonitor instance.
#[derive(
    CustomResource, Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema,
)]
#[kube(
    group = "crstate.io",
    version = "v1alpha1",
    kind = "MetricsMonitor",
    status = "MetricsMonitorStatus",
    derive = "PartialEq",
    shortname = "mm",
    category = "instrumentation"
)]
#[serde(rename_all = "camelCase")]
pub struct MetricsMonitorSpec {
    /// ConfigurationYAML holds the configuration that generates metrics for the
    /// declared target kinds.
    ///
    /// See the configuration documentation for the expected shape.
    #[validate(length(min = 1))]
    pub configuration_yaml: String,
}

/// MetricsMonitorStatus describes the observed state of a MetricsMonitor instance.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricsMonitorStatus {
    /// Conditions reports k8s-style conditions for the resource.
    ///
    /// Merged by `type`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<meta::v1::Condition>,
}

/// ConditionKind enumerates the condition types the controller manages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionKind {
    /// Processed indicates the resource configuration has been handled.
    Processed,
    /// Failed indicates the resource could not be processed further.
    Failed,
}

impl ConditionKind {
    /// As_str returns the condition `type` string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionKind::Processed => "Processed",
            ConditionKind::Failed => "Failed",
        }
    }

    // Reason and message matrices are fixed; the per-event detail is appended
    // to the message by `set_condition`.
    fn reason(&self, status: bool) -> &'static str {
        match (self, status) {
            (ConditionKind::Processed, true) => "EventHandlerSucceeded",
            (ConditionKind::Processed, false) => "EventHandlerRunning",
            (ConditionKind::Failed, true) => "EventHandlerFailed",
            (ConditionKind::Failed, false) => "N/A",
        }
    }

    fn message(&self, status: bool) -> &'static str {
        match (self, status) {
            (ConditionKind::Processed, true) => {
                "Resource configuration has been processed successfully"
            }
            (ConditionKind::Processed, false) => "Resource configuration is yet to be processed",
            (ConditionKind::Failed, true) => "Resource failed to process",
            (ConditionKind::Failed, false) => "N/A",
        }
    }
}

impl MetricsMonitorStatus {
    /// Set_condition upserts the given condition kind, merging by `type`.
    pub fn set_condition(
        &mut self,
        observed_generation: Option<i64>,
        kind: ConditionKind,
        status: bool,
        detail: &str,
    ) {
        let condition = meta::v1::Condition {
            type_: kind.as_str().to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: kind.reason(status).to_string(),
            message: format!("{}: {detail}", kind.message(status)),
            last_transition_time: meta::v1::Time(Utc::now()),
            observed_generation,
        };
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_.as_str() == condition.type_.as_str())
        {
            None => self.conditions.push(condition),
            Some(existing) => *existing = condition,
        };
    }
}
