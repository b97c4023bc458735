//! Legend Config
//!
//! This crate contains the serializable configuration types for the Legend
//! engine. A single [`EngineConfig`] is constructed once at process start and
//! passed by reference to every component that needs it; nothing reads
//! process-wide state on its own.
//!
//! Configuration can be loaded from:
//! - JSON files (via CLI with `--config=engine.json`)
//! - Built-in defaults ([`EngineConfig::default`])
//!
//! Missing fields fall back to their defaults, so a file only needs to name
//! what it overrides.

mod engine;
mod error;
mod retry;
mod step;

pub use engine::{EngineConfig, StoreConfig};
pub use error::ConfigError;
pub use retry::{RetryBackoff, RetryPolicyConfig};
pub use step::StepConfig;
