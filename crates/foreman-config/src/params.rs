//! Parameter resolution and `%param%` interpolation.
//!
//! Placeholders reference parameters by key, e.g. `%env.JDK_11%` or
//! `%product.version%`. Besides descriptor parameters the following
//! run-scoped names resolve:
//! - `%run.id%` - run identifier
//! - `%run.number%` - run number
//! - `%build.number%` - alias of `%run.number%`
//!
//! An `env.*` parameter with an empty value is read from the process
//! environment at resolution time and treated as sensitive; if the
//! variable is absent the parameter is unresolved and resolution fails.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

use foreman_core::descriptor::{ArtifactRule, BuildType, Descriptor, Step, StepKind};
use foreman_core::{Error, Result, RunId};

static PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%([A-Za-z0-9][A-Za-z0-9._-]*)%").unwrap());

/// Run-scoped values available to interpolation.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub run_number: u64,
}

impl RunContext {
    pub fn new(run_id: RunId, run_number: u64) -> Self {
        Self { run_id, run_number }
    }

    fn resolve(&self, name: &str) -> Option<String> {
        match name {
            "run.id" => Some(self.run_id.to_string()),
            "run.number" | "build.number" => Some(self.run_number.to_string()),
            _ => None,
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(RunId::new(), 1)
    }
}

/// Fully resolved parameters for one build type: the scope chain flattened
/// nearest-wins, environment-sourced secrets pulled in, placeholder values
/// expanded.
#[derive(Debug, Clone)]
pub struct ParamTable {
    /// Build type the table was resolved for; named in errors.
    scope: String,
    values: Vec<(String, String)>,
    sensitive: Vec<String>,
    run: RunContext,
}

impl ParamTable {
    /// Resolve the effective parameter table for a build type.
    ///
    /// Fails with [`Error::UnresolvedParameter`] if a parameter value
    /// references a placeholder that is defined nowhere in the scope chain.
    pub fn for_build_type(
        descriptor: &Descriptor,
        build_type: &str,
        run: RunContext,
    ) -> Result<Self> {
        let scoped = descriptor
            .find_build_type(build_type)
            .ok_or_else(|| Error::Internal(format!("unknown build type '{}'", build_type)))?;

        let mut table = Self {
            scope: build_type.to_string(),
            values: Vec::new(),
            sensitive: Vec::new(),
            run,
        };

        for param in scoped.scope.flatten() {
            let value = match (param.env_name(), param.value.is_empty()) {
                // Empty env.* values are supplied by the process environment;
                // an absent variable leaves the parameter unresolved.
                (Some(var), true) => {
                    std::env::var(var).map_err(|_| Error::UnresolvedParameter {
                        name: param.key.clone(),
                        scope: table.scope.clone(),
                    })?
                }
                _ => param.value.clone(),
            };
            if param.is_sensitive() && !value.is_empty() {
                table.sensitive.push(value.clone());
            }
            table.values.push((param.key.clone(), value));
        }

        // Parameter values may themselves carry placeholders; expand one
        // level against the raw table.
        let raw = table.clone();
        for (_, value) in table.values.iter_mut() {
            if PARAM_RE.is_match(value) {
                *value = raw.interpolate(value)?;
            }
        }

        Ok(table)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn resolve(&self, name: &str) -> Option<String> {
        self.get(name)
            .map(str::to_string)
            .or_else(|| self.run.resolve(name))
    }

    /// Substitute every `%name%` placeholder in the input. A placeholder
    /// that resolves nowhere is an [`Error::UnresolvedParameter`].
    pub fn interpolate(&self, input: &str) -> Result<String> {
        let mut missing: Option<String> = None;
        let out = PARAM_RE.replace_all(input, |caps: &regex::Captures| {
            let name = &caps[1];
            match self.resolve(name) {
                Some(value) => value,
                None => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            }
        });
        if let Some(name) = missing {
            return Err(Error::UnresolvedParameter {
                name,
                scope: self.scope.clone(),
            });
        }
        Ok(out.into_owned())
    }

    /// Variables exported to the subprocess environment: every `env.*`
    /// parameter with the prefix stripped. Secret values pass through
    /// verbatim; masking applies only to log output.
    pub fn env_exports(&self) -> HashMap<String, String> {
        self.values
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(foreman_core::descriptor::ENV_PREFIX)
                    .map(|name| (name.to_string(), v.clone()))
            })
            .collect()
    }

    /// Resolved values that must never appear in log output.
    pub fn sensitive_values(&self) -> &[String] {
        &self.sensitive
    }
}

/// Interpolate all parameter references in a build type's steps and
/// artifact rules. Used both by the pre-run validation pass and by the
/// orchestrator when building jobs.
pub fn interpolate_build_type(
    build_type: &BuildType,
    table: &ParamTable,
) -> Result<(Vec<Step>, Vec<ArtifactRule>)> {
    let mut steps = Vec::with_capacity(build_type.steps.len());
    for step in &build_type.steps {
        let mut out = step.clone();
        if let Some(dir) = &step.working_dir {
            out.working_dir = Some(table.interpolate(&dir.to_string_lossy())?.into());
        }
        out.kind = match &step.kind {
            StepKind::Tool { program, args } => StepKind::Tool {
                program: table.interpolate(program)?,
                args: args
                    .iter()
                    .map(|a| table.interpolate(a))
                    .collect::<Result<_>>()?,
            },
            StepKind::Script { body } => StepKind::Script {
                body: table.interpolate(body)?,
            },
            StepKind::ContainerBuild {
                dockerfile,
                context,
                tags,
                extra_args,
            } => StepKind::ContainerBuild {
                dockerfile: table.interpolate(dockerfile)?,
                context: table.interpolate(context)?,
                tags: tags
                    .iter()
                    .map(|t| table.interpolate(t))
                    .collect::<Result<_>>()?,
                extra_args: extra_args
                    .iter()
                    .map(|a| table.interpolate(a))
                    .collect::<Result<_>>()?,
            },
        };
        steps.push(out);
    }

    let mut rules = Vec::with_capacity(build_type.artifact_rules.len());
    for rule in &build_type.artifact_rules {
        rules.push(ArtifactRule {
            pattern: table.interpolate(&rule.pattern)?,
            required: rule.required,
        });
    }

    Ok((steps, rules))
}
