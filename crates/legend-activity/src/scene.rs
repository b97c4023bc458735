use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::collaborator::{ActivityCollaborator, ActivityContext, CollaboratorError};

/// Built-in `analyze` collaborator.
///
/// Takes a scene id (a JSON string) and reports the props, pacing and the
/// gag the scene sets up.
#[derive(Debug, Clone, Default)]
pub struct SceneAnalyzer;

impl SceneAnalyzer {
  pub const NAME: &'static str = "scene-analyzer";
}

#[async_trait]
impl ActivityCollaborator for SceneAnalyzer {
  fn name(&self) -> &str {
    Self::NAME
  }

  async fn invoke(
    &self,
    ctx: &ActivityContext,
    input: serde_json::Value,
  ) -> Result<serde_json::Value, CollaboratorError> {
    let scene_id = input
      .as_str()
      .filter(|id| !id.trim().is_empty())
      .ok_or_else(|| CollaboratorError::invalid_input("scene id must be a non-empty string"))?;

    info!(run_id = %ctx.run_id, scene_id, "scene_analyzed");

    Ok(json!({
      "scene_id": scene_id,
      "detected_objects": ["hat", "cane", "slippery_floor"],
      "current_pacing": "slow",
      "potential_gag": "The Slip",
    }))
  }
}
