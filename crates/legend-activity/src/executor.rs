//! Activity executor implementation.

use std::collections::HashMap;
use std::sync::Arc;

use legend_config::EngineConfig;
use legend_workflow::{ActivityError, ActivityInvocation, ActivityOutcome, FailureKind, StepName};
use tracing::{error, info, instrument, warn};

use crate::collaborator::{
  ActivityCollaborator, ActivityContext, DefaultClassifier, FailureClassifier,
};
use crate::error::ExecutorError;
use crate::manifest::{FileStyleGuide, RemixManifestWriter};
use crate::scene::SceneAnalyzer;

/// Runs activity attempts against the collaborator bound to each step.
pub struct ActivityExecutor {
  collaborators: HashMap<StepName, Arc<dyn ActivityCollaborator>>,
  classifier: Arc<dyn FailureClassifier>,
}

impl Default for ActivityExecutor {
  fn default() -> Self {
    Self::new()
  }
}

impl ActivityExecutor {
  /// An executor with no bindings and the [`DefaultClassifier`].
  pub fn new() -> Self {
    Self {
      collaborators: HashMap::new(),
      classifier: Arc::new(DefaultClassifier),
    }
  }

  /// Bind the built-in collaborators named in `config`.
  pub fn from_config(config: &EngineConfig) -> Result<Self, ExecutorError> {
    let mut executor = Self::new();
    for (step, step_config) in [
      (StepName::Analyze, &config.analyze),
      (StepName::Transform, &config.transform),
    ] {
      let collaborator = builtin(step, &step_config.collaborator, config)?;
      executor = executor.bind(step, collaborator);
    }
    Ok(executor)
  }

  pub fn bind(mut self, step: StepName, collaborator: Arc<dyn ActivityCollaborator>) -> Self {
    self.collaborators.insert(step, collaborator);
    self
  }

  pub fn with_classifier(mut self, classifier: impl FailureClassifier + 'static) -> Self {
    self.classifier = Arc::new(classifier);
    self
  }

  /// Run one attempt.
  ///
  /// Never fails: every problem becomes a failed outcome. An attempt that
  /// outlives its deadline is dropped and reported as
  /// [`ActivityError::TimeoutExceeded`].
  #[instrument(
    name = "activity_execute",
    skip(self, invocation),
    fields(
      run_id = %invocation.run_id,
      step = %invocation.step,
      attempt = invocation.attempt,
    )
  )]
  pub async fn execute(&self, invocation: &ActivityInvocation) -> ActivityOutcome {
    let Some(collaborator) = self.collaborators.get(&invocation.step) else {
      error!("activity_unbound");
      return ActivityOutcome::FailedFatal {
        cause: ActivityError::collaborator(
          "unbound",
          format!("no collaborator bound to step '{}'", invocation.step),
        ),
      };
    };

    let ctx = ActivityContext {
      run_id: invocation.run_id.clone(),
      step: invocation.step,
      attempt: invocation.attempt,
      idempotency_key: invocation.idempotency_key(),
    };

    info!(collaborator = collaborator.name(), "activity_started");

    let result = tokio::time::timeout(
      invocation.timeout(),
      collaborator.invoke(&ctx, invocation.input.clone()),
    )
    .await;

    match result {
      Ok(Ok(output)) => {
        info!("activity_succeeded");
        ActivityOutcome::Succeeded { output }
      }
      Ok(Err(e)) => {
        let kind = collaborator
          .classify(&e)
          .unwrap_or_else(|| self.classifier.classify(&e));
        let cause = ActivityError::collaborator(collaborator.name(), e.to_string());
        match kind {
          FailureKind::Retryable => {
            warn!(error = %cause, "activity_failed_retryable");
            ActivityOutcome::FailedRetryable { cause }
          }
          FailureKind::Fatal => {
            error!(error = %cause, "activity_failed_fatal");
            ActivityOutcome::FailedFatal { cause }
          }
        }
      }
      Err(_) => {
        warn!(timeout_ms = invocation.timeout_ms, "activity_timed_out");
        ActivityOutcome::FailedRetryable {
          cause: ActivityError::TimeoutExceeded {
            timeout_ms: invocation.timeout_ms,
          },
        }
      }
    }
  }
}

fn builtin(
  step: StepName,
  name: &str,
  config: &EngineConfig,
) -> Result<Arc<dyn ActivityCollaborator>, ExecutorError> {
  match name {
    SceneAnalyzer::NAME => Ok(Arc::new(SceneAnalyzer)),
    RemixManifestWriter::NAME => {
      let writer = RemixManifestWriter::new(&config.output_dir);
      let writer = match &config.style_guide {
        Some(path) => writer.with_style_guide(FileStyleGuide::new(path)),
        None => writer,
      };
      Ok(Arc::new(writer))
    }
    other => Err(ExecutorError::UnknownCollaborator {
      step: step.to_string(),
      name: other.to_string(),
    }),
  }
}
