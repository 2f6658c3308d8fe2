//! Shared data model: desired state (`RequirementSpec`) and observed state
//! (`RuntimeStatus`) exchanged between the orchestrator, the reconciler, and
//! shimlets.

use serde::{Deserialize, Serialize};

/// User-declared desired state for one service.
///
/// `service_id` is the primary key everywhere: once `Set` for a
/// `service_id` the store returns the latest spec, and an update is
/// expressed by re-`Set` + re-enqueue under the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequirementSpec {
    /// Opaque stable identifier, assigned at first submission, immutable
    /// thereafter. Empty on the initial ingress POST; the ingress layer
    /// assigns it before calling `Orchestrator::provision`.
    #[serde(default)]
    pub service_id: String,

    /// Logical model identifier, mapped to `{model_root}/{model_name}`.
    pub model_name: String,

    /// Resolved absolute directory. Populated by the `resolve-model-path`
    /// goal; empty on entry to a fresh reconcile pass.
    #[serde(default)]
    pub model_file_dir: String,

    #[serde(default)]
    pub resource_requirements: Option<ResourceRequirements>,

    /// Defaults to 1 if zero (normalized by the orchestrator).
    #[serde(default)]
    pub replica_count: u32,

    #[serde(default)]
    pub context_length: u32,

    #[serde(default)]
    pub env: Vec<Env>,

    /// Which named `GoalSet` to run.
    pub goal_set_name: String,

    /// Which registered shimlet to use. Fixed at submission to the
    /// globally-configured current shimlet.
    #[serde(default)]
    pub shimlet_name: String,
}

impl RequirementSpec {
    /// `replicaCount = 1` if zero, `acceleratorType` normalized to the
    /// adapter's canonical GPU resource name if unspecified.
    pub fn normalize(&mut self) {
        if self.replica_count == 0 {
            self.replica_count = 1;
        }
        if let Some(rr) = self.resource_requirements.as_mut() {
            if rr.accelerator_type.is_empty() {
                rr.accelerator_type = DEFAULT_ACCELERATOR_TYPE.to_owned();
            }
        }
    }
}

pub const DEFAULT_ACCELERATOR_TYPE: &str = "nvidia.com/gpu";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default)]
    pub accelerator_type: String,
    #[serde(default)]
    pub accelerator_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Env {
    pub key: String,
    pub value: String,
}

/// Snapshot returned by a shimlet for one `service_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    /// Best-effort reconstruction from live infra labels/annotations/env.
    pub deploy_spec: Option<RequirementSpec>,
    pub status: ServicePhase,
    /// Empty until exposed.
    #[serde(default)]
    pub end_point: String,
}

impl RuntimeStatus {
    pub fn unknown() -> Self {
        RuntimeStatus {
            deploy_spec: None,
            status: ServicePhase::Unknown,
            end_point: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServicePhase {
    Unknown,
    Pending,
    Creating,
    Running,
    Updating,
    Failed,
    Terminating,
    Terminated,
}
