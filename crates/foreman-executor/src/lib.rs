//! Step execution backends.
//!
//! [`LocalProcessRunner`] runs every step as a local subprocess: build tools
//! and container builds invoke their program directly, scripts go through
//! `/bin/sh -c`. Output is captured line by line, masked, and forwarded as
//! run events.

pub mod artifacts;
pub mod local;

pub use local::LocalProcessRunner;
