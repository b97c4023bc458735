//! Activity execution for Legend runs.
//!
//! This crate provides the [`ActivityExecutor`], which runs one attempt of a
//! step against the collaborator bound to it, enforces the attempt's deadline
//! and classifies failures as retryable or fatal. Collaborators are the
//! opaque, possibly slow, possibly failing operations behind each step
//! (scene analysis, manifest generation).

mod collaborator;
mod error;
mod executor;
mod manifest;
mod scene;

pub use collaborator::{
  ActivityCollaborator, ActivityContext, CollaboratorError, DefaultClassifier, FailureClassifier,
};
pub use error::ExecutorError;
pub use executor::ActivityExecutor;
pub use manifest::{
  FALLBACK_GUIDANCE, FallbackStyleGuide, FileStyleGuide, MANIFEST_FILE, RemixManifestWriter,
  StyleGuide,
};
pub use scene::SceneAnalyzer;
