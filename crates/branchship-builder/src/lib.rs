//! Build engine for Branchship.
//!
//! - `branches`: lists and validates version-control branches
//! - `pipeline`: the staged checkout, install, build and package sequence
//! - `archive`: deterministic zip packaging with progress
//! - `split`: splitting large archives into delivery-sized parts

pub mod archive;
pub mod branches;
pub mod error;
pub mod pipeline;
pub mod split;

pub use archive::{ArchivePackager, PackagedArchive, sanitize_file_name};
pub use branches::{BranchResolver, BranchValidation};
pub use error::PipelineError;
pub use pipeline::{BuildPipeline, BuildReport};
pub use split::{ArchivePart, remove_parts, split_archive};
