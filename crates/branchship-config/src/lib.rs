//! KDL configuration parsing for Branchship.
//!
//! The configuration is static for the lifetime of the process: which working
//! copy to build, how to build and package it, which branches and requesters
//! are allowed, and the scheduler timings.

pub mod error;
pub mod settings;

pub use error::{ConfigError, ConfigResult};
pub use settings::{BuildConfig, SplitConfig, Timings, load_config, parse_config};
