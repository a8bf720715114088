//! Descriptor model: projects, build types, parameters and steps.
//!
//! A [`Descriptor`] is constructed once from static configuration and is
//! read-only for the duration of a run. Projects own their children; scope
//! resolution walks a borrowed chain of parameter frames instead of parent
//! back-pointers.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Reserved prefix marking a parameter as sensitive. Resolved values of
/// sensitive parameters are masked in all log output.
pub const SECRET_PREFIX: &str = "secret.";

/// Prefix for parameters exported to the subprocess environment. The prefix
/// is stripped from the variable name on export.
pub const ENV_PREFIX: &str = "env.";

/// The root of a descriptor tree. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    root: Project,
}

impl Descriptor {
    /// Wrap a fully constructed project tree.
    pub fn new(root: Project) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Project {
        &self.root
    }

    /// All build types in declaration order, each with its parameter scope
    /// chain. A project's own build types come before those of its
    /// subprojects.
    pub fn build_types(&self) -> Vec<ScopedBuildType<'_>> {
        let mut out = Vec::new();
        collect_build_types(&self.root, &[], &mut out);
        out
    }

    /// Look up a build type by name anywhere in the tree.
    pub fn find_build_type(&self, name: &str) -> Option<ScopedBuildType<'_>> {
        self.build_types()
            .into_iter()
            .find(|s| s.build_type.name == name)
    }
}

fn collect_build_types<'a>(
    project: &'a Project,
    outer: &[&'a [Parameter]],
    out: &mut Vec<ScopedBuildType<'a>>,
) {
    // Nearest scope first: this project's params in front of the enclosing ones.
    let mut frames: Vec<&'a [Parameter]> = Vec::with_capacity(outer.len() + 1);
    frames.push(project.params.as_slice());
    frames.extend_from_slice(outer);

    for bt in &project.build_types {
        let mut chain = Vec::with_capacity(frames.len() + 1);
        chain.push(bt.params.as_slice());
        chain.extend_from_slice(&frames);
        out.push(ScopedBuildType {
            build_type: bt,
            scope: ScopeChain { frames: chain },
        });
    }

    for sub in &project.subprojects {
        collect_build_types(sub, &frames, out);
    }
}

/// A build type paired with the parameter scopes that enclose it.
#[derive(Debug, Clone)]
pub struct ScopedBuildType<'a> {
    pub build_type: &'a BuildType,
    pub scope: ScopeChain<'a>,
}

/// Borrowed chain of parameter frames, innermost scope first.
#[derive(Debug, Clone)]
pub struct ScopeChain<'a> {
    frames: Vec<&'a [Parameter]>,
}

impl<'a> ScopeChain<'a> {
    /// Resolve a key, nearest scope wins.
    pub fn lookup(&self, key: &str) -> Option<&'a Parameter> {
        self.frames
            .iter()
            .find_map(|frame| frame.iter().find(|p| p.key == key))
    }

    /// Flatten the chain into a stable list of effective parameters.
    /// Inner definitions shadow outer ones with the same key.
    pub fn flatten(&self) -> Vec<&'a Parameter> {
        let mut seen: Vec<&str> = Vec::new();
        let mut out = Vec::new();
        for frame in &self.frames {
            for param in frame.iter() {
                if !seen.contains(&param.key.as_str()) {
                    seen.push(&param.key);
                    out.push(param);
                }
            }
        }
        out
    }
}

/// A project: a named scope holding parameters, subprojects and build types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    name: String,
    params: Vec<Parameter>,
    subprojects: Vec<Project>,
    build_types: Vec<BuildType>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            subprojects: Vec::new(),
            build_types: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    pub fn subprojects(&self) -> &[Project] {
        &self.subprojects
    }

    pub fn build_types(&self) -> &[BuildType] {
        &self.build_types
    }

    /// Set a parameter on this project's scope, replacing any existing
    /// definition with the same key.
    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(existing) = self.params.iter_mut().find(|p| p.key == key) {
            existing.value = value;
        } else {
            self.params.push(Parameter { key, value });
        }
    }

    /// Add a subproject. Names must be unique among this project's children.
    pub fn add_subproject(&mut self, project: Project) -> Result<()> {
        if self.has_child(&project.name) {
            return Err(Error::DuplicateName(project.name));
        }
        self.subprojects.push(project);
        Ok(())
    }

    /// Add a build type. Names must be unique among this project's children.
    pub fn add_build_type(&mut self, build_type: BuildType) -> Result<()> {
        if self.has_child(&build_type.name) {
            return Err(Error::DuplicateName(build_type.name));
        }
        self.build_types.push(build_type);
        Ok(())
    }

    fn has_child(&self, name: &str) -> bool {
        self.subprojects.iter().any(|p| p.name == name)
            || self.build_types.iter().any(|b| b.name == name)
    }
}

/// A string-typed key/value parameter.
///
/// An `env.*` parameter with an empty value stands for a secret supplied by
/// the process environment at run time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub key: String,
    pub value: String,
}

impl Parameter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Whether this parameter's resolved value must be masked in logs.
    pub fn is_sensitive(&self) -> bool {
        self.key.starts_with(SECRET_PREFIX)
            || (self.key.starts_with(ENV_PREFIX) && self.value.is_empty())
    }

    /// Environment variable name if this is an `env.*` parameter.
    pub fn env_name(&self) -> Option<&str> {
        self.key.strip_prefix(ENV_PREFIX)
    }
}

/// Kind of a build type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildTypeKind {
    /// Runs its steps.
    Regular,
    /// Carries no steps; its status is derived from its dependencies.
    Composite,
}

/// A build type: a named, ordered sequence of steps plus its wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildType {
    pub name: String,
    pub kind: BuildTypeKind,
    pub params: Vec<Parameter>,
    pub steps: Vec<Step>,
    pub vcs_root: Option<VcsRootRef>,
    pub artifact_rules: Vec<ArtifactRule>,
    /// Names of build types that must succeed before this one runs.
    pub depends_on: Vec<String>,
    pub retry: Option<RetryPolicy>,
}

impl BuildType {
    pub fn new(name: impl Into<String>, kind: BuildTypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            params: Vec::new(),
            steps: Vec::new(),
            vcs_root: None,
            artifact_rules: Vec::new(),
            depends_on: Vec::new(),
            retry: None,
        }
    }

    /// Set a parameter on this build type's scope, shadowing any project
    /// parameter with the same key.
    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(existing) = self.params.iter_mut().find(|p| p.key == key) {
            existing.value = value;
        } else {
            self.params.push(Parameter { key, value });
        }
    }

    pub fn is_composite(&self) -> bool {
        self.kind == BuildTypeKind::Composite
    }
}

/// Opaque reference to a version-control root resolved externally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[display("{_0}")]
pub struct VcsRootRef(String);

impl VcsRootRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A single step of a build type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Optional display name.
    pub name: Option<String>,
    /// Working directory, relative to the run's root directory.
    pub working_dir: Option<PathBuf>,
    /// Maximum execution time; the run-level default applies when unset.
    pub timeout: Option<Duration>,
    pub kind: StepKind,
}

impl Step {
    pub fn new(kind: StepKind) -> Self {
        Self {
            name: None,
            working_dir: None,
            timeout: None,
            kind,
        }
    }

    /// Human-readable label for logs and errors.
    pub fn label(&self, index: usize) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => match &self.kind {
                StepKind::Tool { program, .. } => format!("step {} ({})", index + 1, program),
                StepKind::Script { .. } => format!("step {} (script)", index + 1),
                StepKind::ContainerBuild { .. } => {
                    format!("step {} (container build)", index + 1)
                }
            },
        }
    }
}

/// What a step does. Each variant is lowered to a single external process
/// invocation at one dispatch point in the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StepKind {
    /// Invoke an external build tool with arguments.
    Tool { program: String, args: Vec<String> },
    /// Run a shell script body.
    Script { body: String },
    /// Build a container image from a Dockerfile and context directory.
    ContainerBuild {
        dockerfile: String,
        context: String,
        tags: Vec<String>,
        extra_args: Vec<String>,
    },
}

/// A glob pattern selecting files produced by a build type's steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRule {
    pub pattern: String,
    /// When set, zero matches fail the build type.
    pub required: bool,
}

impl ArtifactRule {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            required: false,
        }
    }
}

/// Retry configuration for execution failures (step failure or timeout).
/// Configuration errors are never retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}
