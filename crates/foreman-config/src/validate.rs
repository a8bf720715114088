//! Fail-fast validation pass.
//!
//! Runs before any execution; a descriptor that fails here produces no side
//! effects. Cycle detection lives with the dependency resolver.

use crate::params::{ParamTable, RunContext, interpolate_build_type};
use crate::{ConfigError, ConfigResult};
use foreman_core::descriptor::Descriptor;

/// Validate a descriptor:
/// - composite build types carry no steps
/// - every `depends-on` target exists
/// - every `%param%` placeholder resolves somewhere in its scope chain
pub fn validate(descriptor: &Descriptor) -> ConfigResult<()> {
    let names: Vec<&str> = descriptor
        .build_types()
        .iter()
        .map(|s| s.build_type.name.as_str())
        .collect();

    for scoped in descriptor.build_types() {
        let build_type = scoped.build_type;

        if build_type.is_composite() && !build_type.steps.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: format!("build type '{}'", build_type.name),
                message: "composite build types cannot declare steps".to_string(),
            });
        }

        for dep in &build_type.depends_on {
            if !names.contains(&dep.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "build type '{}' depends on unknown build type '{}'",
                    build_type.name, dep
                )));
            }
        }

        let table =
            ParamTable::for_build_type(descriptor, &build_type.name, RunContext::default())?;
        interpolate_build_type(build_type, &table)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{load_descriptor, parse_descriptor};
    use std::io::Write;

    const DEMO: &str = r#"
        project "valint-demo" {
            params {
                env.APP_ID "12b4f8a4-b9a2-4e89-a886-3064b9e98ef6"
                env.TENANT_ID "baa95f6e-53b4-4508-a093-6fce300256b4"
                product.key "Team-City-Demo"
            }

            build-type "suite1" {
                tool "gradle" args="test" working-dir="test1"
            }

            build-type "suite2" {
                tool "gradle" args="test" working-dir="test2"
            }

            build-type "report" composite=true depends-on="suite1" depends-on="suite2"

            build-type "app" {
                artifacts "build/libs/todo.jar"
                tool "gradle" args="clean" args="build"
                script name="login" {
                    body "az login --service-principal -u %env.APP_ID% --tenant %env.TENANT_ID%"
                }
            }
        }
    "#;

    #[test]
    fn test_validate_demo_descriptor() {
        let descriptor = parse_descriptor(DEMO).unwrap();
        validate(&descriptor).unwrap();
    }

    #[test]
    fn test_validate_unresolved_placeholder() {
        let kdl = r#"
            project "demo" {
                build-type "build" {
                    tool "gradle" args="-Djava.home=%env.UNDEFINED_JDK%"
                }
            }
        "#;
        let descriptor = parse_descriptor(kdl).unwrap();
        let err = validate(&descriptor).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Model(foreman_core::Error::UnresolvedParameter { .. })
        ));
    }

    #[test]
    fn test_load_descriptor_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DEMO.as_bytes()).unwrap();
        let descriptor = load_descriptor(file.path()).unwrap();
        assert_eq!(descriptor.root().name(), "valint-demo");
        validate(&descriptor).unwrap();
    }
}
