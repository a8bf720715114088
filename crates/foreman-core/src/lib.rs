//! Core domain types and traits for the Foreman build orchestrator.
//!
//! This crate contains:
//! - The descriptor model (projects, build types, parameters, steps)
//! - Run identifiers and common types
//! - The execution plan produced by the dependency resolver
//! - Run states, events and results
//! - The `StepRunner` trait that execution backends implement

pub mod descriptor;
pub mod error;
pub mod id;
pub mod plan;
pub mod run;
pub mod step;

pub use descriptor::{
    ArtifactRule, BuildType, BuildTypeKind, Descriptor, Parameter, Project, RetryPolicy,
    ScopeChain, ScopedBuildType, Step, StepKind, VcsRootRef,
};
pub use error::{Error, Result};
pub use id::RunId;
pub use plan::ExecutionPlan;
pub use run::{BuildState, CollectedArtifact, LogLine, LogStream, RunEvent, RunResult};
pub use step::{BuildJob, ProcessInvocation, StepRunner};
