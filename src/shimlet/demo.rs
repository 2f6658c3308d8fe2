//! In-memory shimlet used by the goal/queue/reconciler tests so they don't
//! need a live Kubernetes cluster. A throwaway backend that exists only so
//! the core convergence machinery can be exercised end to end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::registry::Identified;
use crate::types::{RequirementSpec, RuntimeStatus, ServicePhase};

use super::{Result, Shimlet, ShimletError};

struct Deployment {
    spec: RequirementSpec,
    ready: bool,
}

/// In-memory shimlet. `fail_apply_times` lets tests simulate a transient
/// adapter outage: the first N calls to `apply` for a not-yet-ready
/// service fail with `ShimletError::Adapter`.
pub struct DemoShimlet {
    id: String,
    deployments: Mutex<HashMap<String, Deployment>>,
    fail_apply_times: AtomicU32,
}

impl DemoShimlet {
    pub fn new(id: impl Into<String>) -> Self {
        DemoShimlet {
            id: id.into(),
            deployments: Mutex::new(HashMap::new()),
            fail_apply_times: AtomicU32::new(0),
        }
    }

    /// Make the next `n` `apply` calls for services not already ready fail.
    pub fn fail_next_applies(&self, n: u32) {
        self.fail_apply_times.store(n, Ordering::SeqCst);
    }

    /// Remaining count of forced-failure `apply` calls.
    pub fn remaining_failures(&self) -> u32 {
        self.fail_apply_times.load(Ordering::SeqCst)
    }

    /// Mark a deployed service as having become Ready, as if its pods
    /// passed their readiness probe asynchronously.
    pub fn mark_ready(&self, service_id: &str) {
        if let Some(dep) = self.deployments.lock().unwrap().get_mut(service_id) {
            dep.ready = true;
        }
    }
}

impl Identified for DemoShimlet {
    fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Shimlet for DemoShimlet {
    async fn init_with_config(&self, _config_path: &str) -> Result<()> {
        Ok(())
    }

    async fn apply(&self, spec: &RequirementSpec) -> Result<()> {
        if spec.model_file_dir.is_empty() {
            return Err(ShimletError::Validation(
                "model_file_dir must be resolved before apply".into(),
            ));
        }

        let mut deployments = self.deployments.lock().unwrap();
        let already_ready = deployments
            .get(&spec.service_id)
            .map(|d| d.ready)
            .unwrap_or(false);

        if !already_ready {
            let remaining = self.fail_apply_times.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_apply_times.fetch_sub(1, Ordering::SeqCst);
                return Err(ShimletError::Adapter(
                    "simulated transient adapter outage".into(),
                ));
            }
        }

        deployments
            .entry(spec.service_id.clone())
            .and_modify(|d| d.spec = spec.clone())
            .or_insert_with(|| Deployment {
                spec: spec.clone(),
                ready: true,
            });
        Ok(())
    }

    async fn delete(&self, service_id: &str) -> Result<()> {
        self.deployments.lock().unwrap().remove(service_id);
        Ok(())
    }

    async fn status(&self, service_id: &str) -> Result<RuntimeStatus> {
        let deployments = self.deployments.lock().unwrap();
        match deployments.get(service_id) {
            None => Ok(RuntimeStatus::unknown()),
            Some(dep) => Ok(RuntimeStatus {
                deploy_spec: Some(dep.spec.clone()),
                status: if dep.ready {
                    ServicePhase::Running
                } else {
                    ServicePhase::Creating
                },
                end_point: if dep.ready {
                    format!("http://demo.local/{service_id}")
                } else {
                    String::new()
                },
            }),
        }
    }

    async fn list_deployed(&self) -> Result<Vec<String>> {
        Ok(self.deployments.lock().unwrap().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> RequirementSpec {
        RequirementSpec {
            service_id: id.to_owned(),
            model_name: "qwen-7b".into(),
            model_file_dir: "/models/qwen-7b".into(),
            resource_requirements: None,
            replica_count: 1,
            context_length: 0,
            env: vec![],
            goal_set_name: "opensource-llm-deploy".into(),
            shimlet_name: "demo".into(),
        }
    }

    #[tokio::test]
    async fn apply_then_status_is_running() {
        let shim = DemoShimlet::new("demo");
        shim.apply(&spec("svc1")).await.unwrap();
        let status = shim.status("svc1").await.unwrap();
        assert_eq!(status.status, ServicePhase::Running);
        assert!(!status.end_point.is_empty());
    }

    #[tokio::test]
    async fn status_unknown_for_absent_service() {
        let shim = DemoShimlet::new("demo");
        let status = shim.status("nope").await.unwrap();
        assert_eq!(status.status, ServicePhase::Unknown);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let shim = DemoShimlet::new("demo");
        shim.apply(&spec("svc1")).await.unwrap();
        shim.delete("svc1").await.unwrap();
        shim.delete("svc1").await.unwrap();
        let status = shim.status("svc1").await.unwrap();
        assert_eq!(status.status, ServicePhase::Unknown);
    }

    #[tokio::test]
    async fn apply_rejects_unresolved_model_path() {
        let shim = DemoShimlet::new("demo");
        let mut bad = spec("svc1");
        bad.model_file_dir.clear();
        let err = shim.apply(&bad).await.unwrap_err();
        assert!(matches!(err, ShimletError::Validation(_)));
    }

    #[tokio::test]
    async fn transient_failures_then_success() {
        let shim = DemoShimlet::new("demo");
        shim.fail_next_applies(3);
        for _ in 0..3 {
            assert!(shim.apply(&spec("svc1")).await.is_err());
        }
        shim.apply(&spec("svc1")).await.unwrap();
        let status = shim.status("svc1").await.unwrap();
        assert_eq!(status.status, ServicePhase::Running);
    }
}
