//! Remix manifest generation.
//!
//! The writer asks a [`StyleGuide`] how to time the gag the analysis found,
//! then writes `remix_manifest.json` under a directory named after the
//! step's idempotency key. The file is written to a temporary name and
//! renamed into place, so a retry replaces the previous attempt's manifest
//! and readers never see a partial one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument};

use crate::collaborator::{ActivityCollaborator, ActivityContext, CollaboratorError};

pub const MANIFEST_FILE: &str = "remix_manifest.json";

/// Guidance used when no style guide is configured or it has nothing on the
/// topic.
pub const FALLBACK_GUIDANCE: &str =
  "Timing is everything. A pause before the fall makes it funnier.";

const SUCCESS: &str = "Remix manifest generated successfully.";

/// Source of timing guidance for a gag.
#[async_trait]
pub trait StyleGuide: Send + Sync {
  async fn consult(&self, topic: &str) -> Result<String, CollaboratorError>;
}

/// Always answers with [`FALLBACK_GUIDANCE`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackStyleGuide;

#[async_trait]
impl StyleGuide for FallbackStyleGuide {
  async fn consult(&self, _topic: &str) -> Result<String, CollaboratorError> {
    Ok(FALLBACK_GUIDANCE.to_string())
  }
}

/// A plain-text style guide. Paragraphs that mention the topic are the
/// answer.
#[derive(Debug, Clone)]
pub struct FileStyleGuide {
  path: PathBuf,
}

impl FileStyleGuide {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }
}

#[async_trait]
impl StyleGuide for FileStyleGuide {
  async fn consult(&self, topic: &str) -> Result<String, CollaboratorError> {
    let text = tokio::fs::read_to_string(&self.path).await?;
    let needle = topic.to_lowercase();

    let matches: Vec<&str> = text
      .split("\n\n")
      .map(str::trim)
      .filter(|paragraph| !paragraph.is_empty() && paragraph.to_lowercase().contains(&needle))
      .collect();

    if matches.is_empty() {
      Ok(FALLBACK_GUIDANCE.to_string())
    } else {
      Ok(matches.join("\n\n"))
    }
  }
}

#[derive(Debug, Deserialize)]
struct SceneAnalysis {
  scene_id: String,
  #[serde(default)]
  detected_objects: Vec<String>,
  current_pacing: String,
  potential_gag: String,
}

#[derive(Debug, Serialize)]
struct RemixManifest<'a> {
  scene_id: &'a str,
  gag: &'a str,
  props: &'a [String],
  original_pacing: &'a str,
  timing_notes: String,
}

/// Built-in `transform` collaborator.
pub struct RemixManifestWriter {
  output_dir: PathBuf,
  style_guide: Box<dyn StyleGuide>,
}

impl RemixManifestWriter {
  pub const NAME: &'static str = "remix-manifest";

  pub fn new(output_dir: impl Into<PathBuf>) -> Self {
    Self {
      output_dir: output_dir.into(),
      style_guide: Box::new(FallbackStyleGuide),
    }
  }

  pub fn with_style_guide(mut self, style_guide: impl StyleGuide + 'static) -> Self {
    self.style_guide = Box::new(style_guide);
    self
  }

  /// Where the manifest for `idempotency_key` lands.
  pub fn manifest_path(&self, idempotency_key: &str) -> PathBuf {
    self.output_dir.join(idempotency_key).join(MANIFEST_FILE)
  }
}

/// Write through a uniquely named temporary file. The same attempt can be
/// running twice after a lost lease, and an abandoned attempt may still be
/// writing when its retry starts.
async fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), CollaboratorError> {
  if let Some(parent) = path.parent() {
    tokio::fs::create_dir_all(parent).await?;
  }
  let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
  tokio::fs::write(&tmp, contents).await?;
  tokio::fs::rename(&tmp, path).await?;
  Ok(())
}

#[async_trait]
impl ActivityCollaborator for RemixManifestWriter {
  fn name(&self) -> &str {
    Self::NAME
  }

  #[instrument(
    name = "remix_manifest",
    skip(self, ctx, input),
    fields(run_id = %ctx.run_id, attempt = ctx.attempt)
  )]
  async fn invoke(
    &self,
    ctx: &ActivityContext,
    input: serde_json::Value,
  ) -> Result<serde_json::Value, CollaboratorError> {
    let analysis: SceneAnalysis = serde_json::from_value(input)
      .map_err(|e| CollaboratorError::invalid_input(format!("scene analysis: {e}")))?;

    let timing_notes = self.style_guide.consult(&analysis.potential_gag).await?;
    let manifest = RemixManifest {
      scene_id: &analysis.scene_id,
      gag: &analysis.potential_gag,
      props: &analysis.detected_objects,
      original_pacing: &analysis.current_pacing,
      timing_notes,
    };
    let contents = serde_json::to_vec_pretty(&manifest).map_err(|e| CollaboratorError::Other {
      message: format!("failed to encode manifest: {e}"),
    })?;

    let path = self.manifest_path(&ctx.idempotency_key);
    write_atomically(&path, &contents).await?;
    info!(path = %path.display(), "manifest_written");

    Ok(json!(SUCCESS))
  }
}
