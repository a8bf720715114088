//! CLI command implementations.

pub mod run;

use anyhow::{Context, Result};
use std::path::Path;

use foreman_config::{load_descriptor, validate as validate_descriptor};
use foreman_scheduler::resolve_subset;

pub fn validate(path: &Path) -> Result<()> {
    let descriptor = load_descriptor(path)
        .with_context(|| format!("failed to load descriptor: {}", path.display()))?;
    match validate_descriptor(&descriptor).and_then(|()| {
        resolve_subset(&descriptor, None)?;
        Ok(())
    }) {
        Ok(()) => {
            println!("Descriptor is valid");
            Ok(())
        }
        Err(e) => {
            println!("Descriptor error: {}", e);
            std::process::exit(1);
        }
    }
}

pub fn plan(path: &Path, build_types: &[String], json: bool) -> Result<()> {
    let descriptor = load_descriptor(path)
        .with_context(|| format!("failed to load descriptor: {}", path.display()))?;
    validate_descriptor(&descriptor)?;

    let targets = (!build_types.is_empty()).then_some(build_types);
    let plan = resolve_subset(&descriptor, targets)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        for (position, name) in plan.order().iter().enumerate() {
            let deps = plan.deps_of(name);
            if deps.is_empty() {
                println!("{}. {}", position + 1, name);
            } else {
                println!("{}. {} (after {})", position + 1, name, deps.join(", "));
            }
        }
    }
    Ok(())
}
