use std::fmt;

use serde::{Deserialize, Serialize};

/// The steps of a Legend run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
  Analyze,
  Transform,
}

impl StepName {
  pub fn first() -> Self {
    StepName::Analyze
  }

  pub fn position(&self) -> usize {
    match self {
      StepName::Analyze => 0,
      StepName::Transform => 1,
    }
  }

  /// The step that runs after this one, if any.
  pub fn next(&self) -> Option<StepName> {
    match self {
      StepName::Analyze => Some(StepName::Transform),
      StepName::Transform => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      StepName::Analyze => "analyze",
      StepName::Transform => "transform",
    }
  }
}

impl fmt::Display for StepName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}
