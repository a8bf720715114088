//! Descriptor configuration parsing.
//!
//! A descriptor file contains a single top-level `project` node:
//!
//! ```kdl
//! project "demo" {
//!     params {
//!         env.APP_ID "12b4f8a4"
//!         env.SCRIBE_TOKEN ""
//!     }
//!
//!     build-type "unit tests" {
//!         vcs-root "app"
//!         tool "gradle" args="test" working-dir="test1"
//!     }
//!
//!     build-type "report" composite=true depends-on="unit tests"
//! }
//! ```

use crate::{ConfigError, ConfigResult};
use foreman_core::descriptor::{
    ArtifactRule, BuildType, BuildTypeKind, Descriptor, Project, RetryPolicy, Step, StepKind,
    VcsRootRef,
};
use kdl::{KdlDocument, KdlNode};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Read and parse a descriptor file.
pub fn load_descriptor(path: impl AsRef<Path>) -> ConfigResult<Descriptor> {
    let content = std::fs::read_to_string(path)?;
    parse_descriptor(&content)
}

/// Parse a descriptor from KDL text.
pub fn parse_descriptor(kdl: &str) -> ConfigResult<Descriptor> {
    let doc: KdlDocument = kdl.parse()?;

    let mut root: Option<Project> = None;
    for node in doc.nodes() {
        match node.name().value() {
            "project" => {
                if root.is_some() {
                    return Err(ConfigError::InvalidValue {
                        field: "project".to_string(),
                        message: "descriptor must have exactly one top-level project".to_string(),
                    });
                }
                root = Some(parse_project(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    let root = root.ok_or_else(|| ConfigError::MissingField("project".to_string()))?;
    let descriptor = Descriptor::new(root);

    // Validate dependency references across the whole tree.
    let names: Vec<String> = descriptor
        .build_types()
        .iter()
        .map(|s| s.build_type.name.clone())
        .collect();
    for scoped in descriptor.build_types() {
        for dep in &scoped.build_type.depends_on {
            if !names.contains(dep) {
                return Err(ConfigError::InvalidReference(format!(
                    "build type '{}' depends on unknown build type '{}'",
                    scoped.build_type.name, dep
                )));
            }
        }
    }

    Ok(descriptor)
}

fn parse_project(node: &KdlNode) -> ConfigResult<Project> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("project name".to_string()))?;
    let mut project = Project::new(name);

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "params" => {
                    for (key, value) in parse_params(child) {
                        project.set_param(key, value);
                    }
                }
                "project" => {
                    project.add_subproject(parse_project(child)?)?;
                }
                "build-type" => {
                    project.add_build_type(parse_build_type(child)?)?;
                }
                _ => {}
            }
        }
    }

    Ok(project)
}

fn parse_params(node: &KdlNode) -> Vec<(String, String)> {
    let mut out = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            let value = get_first_string_arg(child).unwrap_or_default();
            out.push((key, value));
        }
    }
    out
}

fn parse_build_type(node: &KdlNode) -> ConfigResult<BuildType> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("build type name".to_string()))?;

    let kind = if get_bool_prop(node, "composite").unwrap_or(false) {
        BuildTypeKind::Composite
    } else {
        BuildTypeKind::Regular
    };

    let mut build_type = BuildType::new(name.clone(), kind);
    build_type.depends_on = get_string_list_prop(node, "depends-on");

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "params" => {
                    for (key, value) in parse_params(child) {
                        build_type.set_param(key, value);
                    }
                }
                "vcs-root" => {
                    let id = get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("vcs-root id for '{}'", name))
                    })?;
                    build_type.vcs_root = Some(VcsRootRef::new(id));
                }
                "artifacts" => {
                    for pattern in get_all_string_args(child) {
                        build_type.artifact_rules.push(ArtifactRule {
                            pattern,
                            required: get_bool_prop(child, "required").unwrap_or(false),
                        });
                    }
                }
                "retry" => {
                    build_type.retry = Some(parse_retry(child, &name)?);
                }
                "tool" | "script" | "container-build" => {
                    build_type.steps.push(parse_step(child, &name)?);
                }
                _ => {}
            }
        }
    }

    if build_type.is_composite() && !build_type.steps.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: format!("build type '{}'", name),
            message: "composite build types cannot declare steps".to_string(),
        });
    }

    Ok(build_type)
}

fn parse_retry(node: &KdlNode, build_type: &str) -> ConfigResult<RetryPolicy> {
    let max_attempts = get_int_prop(node, "max-attempts").ok_or_else(|| {
        ConfigError::MissingField(format!("retry max-attempts for '{}'", build_type))
    })?;
    let max_attempts = u32::try_from(max_attempts).ok().filter(|&n| n >= 1).ok_or_else(
        || ConfigError::InvalidValue {
            field: format!("retry max-attempts for '{}'", build_type),
            message: format!("must be between 1 and {}", u32::MAX),
        },
    )?;
    let backoff_secs = get_int_prop(node, "backoff-secs").unwrap_or(0);
    let backoff_secs = u64::try_from(backoff_secs).map_err(|_| ConfigError::InvalidValue {
        field: format!("retry backoff-secs for '{}'", build_type),
        message: "must be a non-negative number of seconds".to_string(),
    })?;
    Ok(RetryPolicy {
        max_attempts,
        backoff: Duration::from_secs(backoff_secs),
    })
}

fn parse_step(node: &KdlNode, build_type: &str) -> ConfigResult<Step> {
    let kind = match node.name().value() {
        "tool" => {
            let program = get_first_string_arg(node).ok_or_else(|| {
                ConfigError::MissingField(format!("tool program for '{}'", build_type))
            })?;
            let args = get_string_list_prop(node, "args");
            StepKind::Tool { program, args }
        }
        "script" => {
            let body = node
                .children()
                .and_then(|c| c.nodes().iter().find(|n| n.name().value() == "body"))
                .and_then(get_first_string_arg)
                .ok_or_else(|| {
                    ConfigError::MissingField(format!("script body for '{}'", build_type))
                })?;
            StepKind::Script { body }
        }
        "container-build" => {
            let mut dockerfile = String::new();
            let mut context = ".".to_string();
            let mut tags = Vec::new();
            let mut extra_args = Vec::new();
            if let Some(children) = node.children() {
                for child in children.nodes() {
                    match child.name().value() {
                        "dockerfile" => {
                            dockerfile = get_first_string_arg(child).unwrap_or_default();
                        }
                        "context" => {
                            context = get_first_string_arg(child).unwrap_or_default();
                        }
                        "tag" => tags.extend(get_all_string_args(child)),
                        "arg" => extra_args.extend(get_all_string_args(child)),
                        _ => {}
                    }
                }
            }
            if dockerfile.is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "container-build dockerfile for '{}'",
                    build_type
                )));
            }
            StepKind::ContainerBuild {
                dockerfile,
                context,
                tags,
                extra_args,
            }
        }
        other => {
            return Err(ConfigError::InvalidValue {
                field: "step".to_string(),
                message: format!("unknown step type: {}", other),
            });
        }
    };

    let mut step = Step::new(kind);
    step.name = get_string_prop(node, "name");
    step.working_dir = get_string_prop(node, "working-dir").map(PathBuf::from);
    step.timeout = get_int_prop(node, "timeout-secs").map(|s| Duration::from_secs(s.max(0) as u64));
    Ok(step)
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_int_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    // Repeated properties: depends-on="a" depends-on="b"
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    // Block syntax: a child node carrying the values as arguments.
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                return get_all_string_args(child);
            }
        }
    }

    Vec::new()
}
