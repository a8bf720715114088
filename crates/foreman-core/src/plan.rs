//! Execution plans produced by the dependency resolver.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The resolved, ordered sequence of build types for one descriptor
/// snapshot. Immutable once computed; discarded after the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    order: Vec<String>,
    deps: HashMap<String, Vec<String>>,
}

impl ExecutionPlan {
    /// Constructed by the resolver; `order` must already be a valid
    /// topological order over `deps`.
    pub fn new(order: Vec<String>, deps: HashMap<String, Vec<String>>) -> Self {
        Self { order, deps }
    }

    /// Build type names in execution order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Direct dependencies of a build type.
    pub fn deps_of(&self, name: &str) -> &[String] {
        self.deps.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.order.iter().any(|n| n == name)
    }
}
