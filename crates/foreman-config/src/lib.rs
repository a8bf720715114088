//! KDL configuration parsing for Foreman.
//!
//! This crate handles:
//! - Descriptor parsing (foreman.kdl): projects, build types, steps
//! - `%param%` placeholder interpolation
//! - The fail-fast validation pass that runs before any execution

pub mod descriptor;
pub mod error;
pub mod params;
pub mod validate;

pub use descriptor::{load_descriptor, parse_descriptor};
pub use error::{ConfigError, ConfigResult};
pub use params::{ParamTable, RunContext, interpolate_build_type};
pub use validate::validate;
