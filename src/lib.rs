#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod api;
pub mod config;
pub mod goal;
pub mod id;
pub mod orchestrator;
pub mod queue;
pub mod reconciler;
pub mod registry;
pub mod shimlet;
pub mod spec_store;
pub mod types;

pub use orchestrator::Orchestrator;
pub use reconciler::Reconciler;
pub use types::{RequirementSpec, ResourceRequirements, RuntimeStatus, ServicePhase};
