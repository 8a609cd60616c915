//! Orchestration configuration (ambient stack, §6).

pub mod settings;

pub use settings::{CliConfig, QualityThresholds, SupervisorThresholds};
