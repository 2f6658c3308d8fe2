//! The shimlet abstraction: the stable interface the core uses to drive an
//! infrastructure backend.

pub mod demo;
pub mod k8s;

use async_trait::async_trait;

use crate::registry::Identified;
use crate::types::{RequirementSpec, RuntimeStatus};

pub const MANAGED_BY_LABEL: &str = "managed-by";
pub const MANAGED_BY_VALUE: &str = "modserv-shim";
pub const SERVICE_LABEL: &str = "app";

#[derive(Debug, thiserror::Error)]
pub enum ShimletError {
    /// Caller-supplied spec is malformed (e.g. empty resolved model path).
    /// Surfaced to ingress as 400 when caught synchronously; when it
    /// surfaces from a reconcile pass instead, it is retried like any
    /// other goal failure, budget-limited by the goal-set's `max_retries`.
    #[error("validation error: {0}")]
    Validation(String),

    /// Network/auth/transport fault talking to the backend, or some other
    /// condition expected to clear on its own. Triggers re-enqueue with a
    /// fixed retry interval.
    #[error("adapter error: {0}")]
    Adapter(String),

    /// The backend rejects the spec semantically and retrying unchanged
    /// won't help (quota exceeded, immutable field changed). Retried under
    /// the goal-set's `max_retries` budget same as any other failure;
    /// exhausting that budget parks the service with `Status = Failed`.
    #[error("adapter permanent error: {0}")]
    Permanent(String),
}

pub type Result<T, E = ShimletError> = std::result::Result<T, E>;

/// Capability set implemented by each infrastructure adapter.
#[async_trait]
pub trait Shimlet: Identified + Send + Sync {
    /// Load adapter-specific config from `config_path`. Idempotent if
    /// called again on the same instance.
    async fn init_with_config(&self, config_path: &str) -> Result<()>;

    /// Drive infra to match `spec`. Declarative and idempotent: repeated
    /// calls with the same spec converge to the same state; calls with a
    /// changed spec update it.
    async fn apply(&self, spec: &RequirementSpec) -> Result<()>;

    /// Remove all resources tagged with this `service_id`. Idempotent:
    /// absence is success.
    async fn delete(&self, service_id: &str) -> Result<()>;

    /// Return the current status for `service_id`. If no resources exist,
    /// returns `status = Unknown`, not an error.
    async fn status(&self, service_id: &str) -> Result<RuntimeStatus>;

    /// Enumerate every `service_id` this adapter currently owns, used for
    /// crash-recovery enumeration.
    async fn list_deployed(&self) -> Result<Vec<String>>;
}
