//! Store of desired state, keyed by `service_id`.
//!
//! `set` is last-writer-wins: it always overwrites. A first-writer-wins
//! store would silently drop a resubmitted spec for an existing service,
//! which is never the right behavior for an update path.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::types::RequirementSpec;

/// The in-memory store cannot actually fail; this exists so a durable
/// implementation (file- or database-backed) can report a real I/O error
/// through the same trait without changing its signature.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Storage seam for `RequirementSpec`s. A trait so a durable
/// implementation (e.g. backed by a file or a database) can stand in for
/// `InMemorySpecStore` without touching the orchestrator or reconciler.
pub trait SpecStore: Send + Sync {
    fn set(&self, spec: RequirementSpec) -> Result<()>;
    fn get(&self, service_id: &str) -> Result<Option<RequirementSpec>>;
    fn delete(&self, service_id: &str) -> Result<()>;
    fn list_ids(&self) -> Result<Vec<String>>;

    /// Park `service_id` as permanently failed (a goal-set exhausted its
    /// retry budget). Cleared automatically the next time `set` is called
    /// for the same id, since resubmission should get a clean attempt.
    fn mark_failed(&self, service_id: &str) -> Result<()>;
    fn is_failed(&self, service_id: &str) -> Result<bool>;
}

#[derive(Default)]
pub struct InMemorySpecStore {
    specs: Mutex<HashMap<String, RequirementSpec>>,
    failed: Mutex<HashSet<String>>,
}

impl InMemorySpecStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SpecStore for InMemorySpecStore {
    fn set(&self, spec: RequirementSpec) -> Result<()> {
        let service_id = spec.service_id.clone();
        self.specs.lock().unwrap().insert(service_id.clone(), spec);
        self.failed.lock().unwrap().remove(&service_id);
        Ok(())
    }

    fn get(&self, service_id: &str) -> Result<Option<RequirementSpec>> {
        Ok(self.specs.lock().unwrap().get(service_id).cloned())
    }

    fn delete(&self, service_id: &str) -> Result<()> {
        self.specs.lock().unwrap().remove(service_id);
        self.failed.lock().unwrap().remove(service_id);
        Ok(())
    }

    fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self.specs.lock().unwrap().keys().cloned().collect())
    }

    fn mark_failed(&self, service_id: &str) -> Result<()> {
        self.failed.lock().unwrap().insert(service_id.to_owned());
        Ok(())
    }

    fn is_failed(&self, service_id: &str) -> Result<bool> {
        Ok(self.failed.lock().unwrap().contains(service_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, replicas: u32) -> RequirementSpec {
        RequirementSpec {
            service_id: id.to_owned(),
            model_name: "qwen-7b".into(),
            model_file_dir: String::new(),
            resource_requirements: None,
            replica_count: replicas,
            context_length: 0,
            env: vec![],
            goal_set_name: "opensource-llm-deploy".into(),
            shimlet_name: "demo".into(),
        }
    }

    #[test]
    fn set_is_last_writer_wins() {
        let store = InMemorySpecStore::new();
        store.set(spec("svc1", 1)).unwrap();
        store.set(spec("svc1", 4)).unwrap();
        assert_eq!(store.get("svc1").unwrap().unwrap().replica_count, 4);
    }

    #[test]
    fn delete_then_get_is_none() {
        let store = InMemorySpecStore::new();
        store.set(spec("svc1", 1)).unwrap();
        store.delete("svc1").unwrap();
        assert!(store.get("svc1").unwrap().is_none());
    }

    #[test]
    fn list_ids_reflects_current_contents() {
        let store = InMemorySpecStore::new();
        store.set(spec("svc1", 1)).unwrap();
        store.set(spec("svc2", 1)).unwrap();
        let mut ids = store.list_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["svc1".to_owned(), "svc2".to_owned()]);
    }

    #[test]
    fn mark_failed_is_cleared_by_a_later_set() {
        let store = InMemorySpecStore::new();
        store.set(spec("svc1", 1)).unwrap();
        store.mark_failed("svc1").unwrap();
        assert!(store.is_failed("svc1").unwrap());
        store.set(spec("svc1", 1)).unwrap();
        assert!(!store.is_failed("svc1").unwrap());
    }
}
