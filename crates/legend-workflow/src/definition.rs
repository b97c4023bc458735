use std::time::Duration;

use legend_config::{EngineConfig, StepConfig};

use crate::retry::RetryPolicy;
use crate::step::StepName;

/// Static configuration of one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDefinition {
  pub name: StepName,
  pub position: usize,
  pub timeout: Duration,
  pub retry: RetryPolicy,
  /// Name of the collaborator bound to this step.
  pub collaborator: String,
}

impl StepDefinition {
  fn new(name: StepName, config: &StepConfig) -> Self {
    Self {
      name,
      position: name.position(),
      timeout: config.timeout(),
      retry: RetryPolicy::from(&config.retry),
      collaborator: config.collaborator.clone(),
    }
  }

  pub fn timeout_ms(&self) -> u64 {
    u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
  }
}

/// The analyze → transform workflow, resolved from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
  pub workflow_type: String,
  steps: [StepDefinition; 2],
}

impl WorkflowDefinition {
  pub fn from_config(config: &EngineConfig) -> Self {
    Self {
      workflow_type: config.workflow_type.clone(),
      steps: [
        StepDefinition::new(StepName::Analyze, &config.analyze),
        StepDefinition::new(StepName::Transform, &config.transform),
      ],
    }
  }

  pub fn step(&self, name: StepName) -> &StepDefinition {
    &self.steps[name.position()]
  }

  /// Steps in execution order.
  pub fn steps(&self) -> &[StepDefinition] {
    &self.steps
  }
}
