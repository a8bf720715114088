//! Dependency resolution and run orchestration for Foreman.
//!
//! The resolver turns a descriptor into an [`foreman_core::ExecutionPlan`];
//! the orchestrator executes the plan against a `StepRunner` with a bounded
//! worker pool.

pub mod orchestrator;
pub mod resolver;

pub use orchestrator::{Orchestrator, RunOptions};
pub use resolver::{resolve, resolve_subset};
