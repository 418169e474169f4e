//! `canopy-core`: shared building blocks.
//!
//! Pure primitives only (no infrastructure concerns): identifiers and the
//! domain error model used by every other crate in the workspace.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{AnalysisId, FileId, ProjectId, UserId};
