//! Goal and GoalSet: the unit of convergence and its ordered composition.
//!
//! A `Goal` is a name plus an idempotent achieved-check and an idempotent
//! ensure-step. A `GoalSet` runs its goals in order, checking each before
//! and after its `ensure`.

pub mod goalsets;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::shimlet::{Shimlet, ShimletError};
use crate::types::RequirementSpec;

/// Mutable scratch space threaded through one reconcile pass. `data` lets
/// goals hand intermediate results to later goals in the same set (e.g.
/// `resolve-model-path` writing the resolved directory that
/// `ensure-applied` then reads off `spec` once copied back).
pub struct ReconcileContext {
    pub data: HashMap<String, serde_json::Value>,
    pub spec: RequirementSpec,
    pub shimlet: Arc<dyn Shimlet>,
}

impl ReconcileContext {
    pub fn new(spec: RequirementSpec, shimlet: Arc<dyn Shimlet>) -> Self {
        ReconcileContext {
            data: HashMap::new(),
            spec,
            shimlet,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GoalError {
    /// `ensure` ran but a subsequent check still finds the goal unmet.
    /// Distinguished from a hard failure: the reconciler treats this as
    /// transient and re-enqueues with backoff rather than surfacing
    /// `Failed` immediately.
    #[error("goal {goal:?} not yet satisfied for {service_id:?}")]
    NotYetSatisfied { goal: String, service_id: String },

    #[error(transparent)]
    Ensure(#[from] ShimletError),
}

type IsAchieved = Box<dyn Fn(&ReconcileContext) -> bool + Send + Sync>;
type Ensure = Box<dyn Fn(&mut ReconcileContext) -> Result<(), GoalError> + Send + Sync>;

/// One convergence step. Closures over traits: idiomatic in Rust where a
/// one-method-per-goal trait hierarchy would just be ceremony around a
/// function pointer.
pub struct Goal {
    pub name: String,
    is_achieved: IsAchieved,
    ensure: Ensure,
}

impl Goal {
    pub fn new(
        name: impl Into<String>,
        is_achieved: impl Fn(&ReconcileContext) -> bool + Send + Sync + 'static,
        ensure: impl Fn(&mut ReconcileContext) -> Result<(), GoalError> + Send + Sync + 'static,
    ) -> Self {
        Goal {
            name: name.into(),
            is_achieved: Box::new(is_achieved),
            ensure: Box::new(ensure),
        }
    }

    fn is_achieved(&self, ctx: &ReconcileContext) -> bool {
        (self.is_achieved)(ctx)
    }

    fn ensure(&self, ctx: &mut ReconcileContext) -> Result<(), GoalError> {
        (self.ensure)(ctx)
    }
}

/// An ordered sequence of goals run to convergence for one reconcile pass.
pub struct GoalSet {
    pub name: String,
    pub goals: Vec<Goal>,
    pub max_retries: u32,
    pub timeout: Duration,
}

impl GoalSet {
    pub fn new(name: impl Into<String>, goals: Vec<Goal>) -> Self {
        GoalSet {
            name: name.into(),
            goals,
            max_retries: 20,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run every goal in order. For each: skip `ensure` if already
    /// achieved; otherwise call `ensure` once and re-check. A goal whose
    /// check still fails after `ensure` stops the whole pass with
    /// `NotYetSatisfied` — later goals in the set are not attempted this
    /// pass, since they typically depend on this one's postcondition.
    pub fn run(&self, ctx: &mut ReconcileContext) -> Result<(), GoalError> {
        for goal in &self.goals {
            if goal.is_achieved(ctx) {
                continue;
            }
            goal.ensure(ctx)?;
            if !goal.is_achieved(ctx) {
                return Err(GoalError::NotYetSatisfied {
                    goal: goal.name.clone(),
                    service_id: ctx.spec.service_id.clone(),
                });
            }
        }
        Ok(())
    }
}
