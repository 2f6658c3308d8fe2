//! Front door the ingress calls into. Never touches infrastructure
//! directly and never blocks on it — it only writes to the spec store and
//! enqueues a key.

use std::sync::Arc;

use crate::id::new_service_id;
use crate::queue::RateLimitingQueue;
use crate::shimlet::Shimlet;
use crate::spec_store::SpecStore;
use crate::types::{RequirementSpec, RuntimeStatus, ServicePhase};

const DELETE_GOAL_SET: &str = "opensource-llm-delete";
const CHAT_COMPLETIONS_SUFFIX: &str = "/v1/chat/completions";

pub struct Orchestrator {
    store: Arc<dyn SpecStore>,
    queue: RateLimitingQueue,
    shimlet: Arc<dyn Shimlet>,
    current_shimlet: String,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SpecStore>,
        queue: RateLimitingQueue,
        shimlet: Arc<dyn Shimlet>,
        current_shimlet: impl Into<String>,
    ) -> Self {
        Orchestrator {
            store,
            queue,
            shimlet,
            current_shimlet: current_shimlet.into(),
        }
    }

    /// Create or update a service. Normalizes the spec, assigns a
    /// `serviceId` if the caller didn't supply one (create path), binds
    /// `shimletName` to the configured current shimlet, then writes
    /// through to the store and enqueues. Returns the resolved
    /// `serviceId`. Never blocks on infrastructure.
    pub fn provision(&self, mut spec: RequirementSpec) -> String {
        if spec.service_id.is_empty() {
            spec.service_id = new_service_id();
        }
        spec.normalize();
        spec.shimlet_name = self.current_shimlet.clone();

        let service_id = spec.service_id.clone();
        // A resubmission always gets a clean attempt, even if the previous
        // one was parked as failed.
        let _ = self.store.set(spec);
        self.queue.add(service_id.clone());
        service_id
    }

    /// Route the service through the delete goal-set so removal gets the
    /// same backoff/retry semantics as any other convergence pass.
    /// Idempotent: deleting a service that's already gone from the store
    /// is a no-op success, matching the idempotent-DELETE scenario.
    pub fn delete(&self, service_id: &str) {
        if let Ok(Some(mut spec)) = self.store.get(service_id) {
            spec.goal_set_name = DELETE_GOAL_SET.to_owned();
            let _ = self.store.set(spec);
            self.queue.add(service_id.to_owned());
        }
    }

    /// Proxy straight to the shimlet, unless the service was parked as
    /// failed after exhausting its goal-set's retry budget. If an
    /// endpoint is exposed, suffix it for OpenAI-compatible clients.
    pub async fn status(&self, service_id: &str) -> Result<RuntimeStatus, crate::shimlet::ShimletError> {
        if self.store.is_failed(service_id).unwrap_or(false) {
            let deploy_spec = self.store.get(service_id).ok().flatten();
            return Ok(RuntimeStatus {
                deploy_spec,
                status: ServicePhase::Failed,
                end_point: String::new(),
            });
        }

        let mut status = self.shimlet.status(service_id).await?;
        if !status.end_point.is_empty() && !status.end_point.ends_with(CHAT_COMPLETIONS_SUFFIX) {
            status.end_point.push_str(CHAT_COMPLETIONS_SUFFIX);
        }
        Ok(status)
    }

    /// Crash-recovery: re-establish queue tracking for everything the
    /// shimlet still reports as deployed.
    pub async fn recover(&self) -> Result<usize, crate::shimlet::ShimletError> {
        let ids = self.shimlet.list_deployed().await?;
        let count = ids.len();
        for id in ids {
            self.queue.add(id);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shimlet::demo::DemoShimlet;
    use crate::spec_store::InMemorySpecStore;
    use crate::types::ServicePhase;

    fn spec() -> RequirementSpec {
        RequirementSpec {
            service_id: String::new(),
            model_name: "qwen-7b".into(),
            model_file_dir: String::new(),
            resource_requirements: None,
            replica_count: 0,
            context_length: 4096,
            env: vec![],
            goal_set_name: "opensource-llm-deploy".into(),
            shimlet_name: String::new(),
        }
    }

    fn orchestrator() -> (Orchestrator, Arc<dyn SpecStore>, Arc<DemoShimlet>) {
        let store: Arc<dyn SpecStore> = Arc::new(InMemorySpecStore::new());
        let queue = RateLimitingQueue::new();
        let shimlet = Arc::new(DemoShimlet::new("demo"));
        let orchestrator = Orchestrator::new(store.clone(), queue, shimlet.clone(), "demo");
        (orchestrator, store, shimlet)
    }

    #[test]
    fn provision_assigns_id_and_normalizes() {
        let (orchestrator, store, _shimlet) = orchestrator();
        let id = orchestrator.provision(spec());
        assert!(!id.is_empty());
        let stored = store.get(&id).unwrap().unwrap();
        assert_eq!(stored.replica_count, 1);
        assert_eq!(stored.shimlet_name, "demo");
    }

    #[test]
    fn provision_on_existing_id_is_an_update() {
        let (orchestrator, store, _shimlet) = orchestrator();
        let id = orchestrator.provision(spec());

        let mut update = spec();
        update.service_id = id.clone();
        update.replica_count = 3;
        let id2 = orchestrator.provision(update);

        assert_eq!(id, id2);
        assert_eq!(store.get(&id).unwrap().unwrap().replica_count, 3);
    }

    #[test]
    fn delete_of_unknown_service_is_a_noop() {
        let (orchestrator, _store, _shimlet) = orchestrator();
        orchestrator.delete("never-existed");
    }

    #[test]
    fn delete_rewrites_goal_set_and_enqueues() {
        let (orchestrator, store, _shimlet) = orchestrator();
        let id = orchestrator.provision(spec());
        orchestrator.delete(&id);
        assert_eq!(
            store.get(&id).unwrap().unwrap().goal_set_name,
            "opensource-llm-delete"
        );
    }

    #[tokio::test]
    async fn status_reports_failed_when_store_has_parked_the_service() {
        let (orchestrator, store, _shimlet) = orchestrator();
        let id = orchestrator.provision(spec());
        store.mark_failed(&id).unwrap();

        let status = orchestrator.status(&id).await.unwrap();
        assert_eq!(status.status, ServicePhase::Failed);
        assert!(status.end_point.is_empty());
    }

    #[test]
    fn reprovisioning_a_failed_service_clears_the_failed_flag() {
        let (orchestrator, store, _shimlet) = orchestrator();
        let id = orchestrator.provision(spec());
        store.mark_failed(&id).unwrap();

        let mut update = spec();
        update.service_id = id.clone();
        orchestrator.provision(update);

        assert!(!store.is_failed(&id).unwrap());
    }

    #[tokio::test]
    async fn status_appends_chat_completions_suffix() {
        let (orchestrator, _store, shimlet) = orchestrator();
        let mut s = spec();
        s.service_id = "svc1".into();
        s.model_file_dir = "/models/qwen-7b".into();
        shimlet.apply(&s).await.unwrap();

        let status = orchestrator.status("svc1").await.unwrap();
        assert_eq!(status.status, ServicePhase::Running);
        assert!(status.end_point.ends_with("/v1/chat/completions"));
    }

    #[tokio::test]
    async fn status_of_unknown_service_has_empty_endpoint() {
        let (orchestrator, _store, _shimlet) = orchestrator();
        let status = orchestrator.status("nope").await.unwrap();
        assert_eq!(status.status, ServicePhase::Unknown);
        assert!(status.end_point.is_empty());
    }
}
