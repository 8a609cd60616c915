//! Orchestration configuration (§6 "Configuration (enumerated)"): loaded from
//! an optional YAML file, overridden by `AGENTFORGE_*` environment
//! variables, overridden in turn by CLI flags (applied in `main.rs`).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SupervisorThresholds {
    #[serde(default = "default_warn")]
    pub warn: u32,
    #[serde(default = "default_intervene")]
    pub intervene: u32,
    #[serde(default = "default_critical")]
    pub critical: u32,
    #[serde(default = "default_abort")]
    pub abort: u32,
}

fn default_warn() -> u32 {
    2
}
fn default_intervene() -> u32 {
    3
}
fn default_critical() -> u32 {
    4
}
fn default_abort() -> u32 {
    5
}

impl Default for SupervisorThresholds {
    fn default() -> Self {
        Self {
            warn: default_warn(),
            intervene: default_intervene(),
            critical: default_critical(),
            abort: default_abort(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityThresholds {
    #[serde(default = "default_plan_threshold")]
    pub plan: u8,
    #[serde(default = "default_code_threshold")]
    pub code: u8,
    #[serde(default = "default_step_threshold")]
    pub step: u8,
    #[serde(default = "default_goal_threshold")]
    pub goal: u8,
}

fn default_plan_threshold() -> u8 {
    70
}
fn default_code_threshold() -> u8 {
    60
}
fn default_step_threshold() -> u8 {
    70
}
fn default_goal_threshold() -> u8 {
    80
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            plan: default_plan_threshold(),
            code: default_code_threshold(),
            step: default_step_threshold(),
            goal: default_goal_threshold(),
        }
    }
}

/// The full enumerated configuration record (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default = "default_max_fix_cycles")]
    pub max_fix_cycles: u32,
    #[serde(default = "default_max_step_attempts")]
    pub max_step_attempts: u32,
    #[serde(default = "default_true")]
    pub verify_all_outputs: bool,
    #[serde(default = "default_true")]
    pub require_tests: bool,
    #[serde(with = "duration_secs", default = "default_time_limit")]
    pub time_limit: Duration,
    #[serde(default = "default_true")]
    pub require_pre_plan_review: bool,
    #[serde(default = "default_true")]
    pub enable_progress_checks: bool,
    #[serde(with = "duration_secs", default = "default_progress_check_interval")]
    pub progress_check_interval: Duration,
    #[serde(default = "default_max_plan_revisions")]
    pub max_plan_revisions: u32,
    #[serde(default)]
    pub supervisor_thresholds: SupervisorThresholds,
    #[serde(default)]
    pub quality_thresholds: QualityThresholds,
    /// Default model passed to [`crate::llm::CallOptions`] when a worker
    /// doesn't override it. Not named in §6 but required to build a request.
    #[serde(default = "default_model")]
    pub model: String,
    pub api_key: Option<String>,
    pub working_dir: PathBuf,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

fn default_true() -> bool {
    true
}
fn default_max_fix_cycles() -> u32 {
    3
}
fn default_max_step_attempts() -> u32 {
    3
}
fn default_time_limit() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}
fn default_progress_check_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_max_plan_revisions() -> u32 {
    3
}
fn default_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            max_fix_cycles: default_max_fix_cycles(),
            max_step_attempts: default_max_step_attempts(),
            verify_all_outputs: true,
            require_tests: true,
            time_limit: default_time_limit(),
            require_pre_plan_review: true,
            enable_progress_checks: true,
            progress_check_interval: default_progress_check_interval(),
            max_plan_revisions: default_max_plan_revisions(),
            supervisor_thresholds: SupervisorThresholds::default(),
            quality_thresholds: QualityThresholds::default(),
            model: default_model(),
            api_key: None,
            working_dir: PathBuf::from("."),
        }
    }
}

impl CliConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CliConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration, falling back to defaults if the file doesn't exist.
    pub fn load_or_default(path: Option<&PathBuf>) -> anyhow::Result<Self> {
        match path {
            Some(p) if p.exists() => Self::from_file(p),
            _ => Ok(Self::default()),
        }
    }

    /// Applies `AGENTFORGE_*` environment variable overrides.
    ///
    /// Precedence: config file > env vars > defaults (CLI flags override
    /// everything else, applied separately in `main.rs`).
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("AGENTFORGE_MAX_FIX_CYCLES")
            && let Ok(n) = val.parse::<u32>()
        {
            self.max_fix_cycles = n;
        }
        if let Ok(val) = std::env::var("AGENTFORGE_MAX_STEP_ATTEMPTS")
            && let Ok(n) = val.parse::<u32>()
        {
            self.max_step_attempts = n;
        }
        if let Ok(val) = std::env::var("AGENTFORGE_VERIFY_ALL_OUTPUTS")
            && let Ok(b) = val.parse::<bool>()
        {
            self.verify_all_outputs = b;
        }
        if let Ok(val) = std::env::var("AGENTFORGE_REQUIRE_TESTS")
            && let Ok(b) = val.parse::<bool>()
        {
            self.require_tests = b;
        }
        if let Ok(val) = std::env::var("AGENTFORGE_TIME_LIMIT_SECS")
            && let Ok(secs) = val.parse::<u64>()
        {
            self.time_limit = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("AGENTFORGE_REQUIRE_PRE_PLAN_REVIEW")
            && let Ok(b) = val.parse::<bool>()
        {
            self.require_pre_plan_review = b;
        }
        if let Ok(val) = std::env::var("AGENTFORGE_ENABLE_PROGRESS_CHECKS")
            && let Ok(b) = val.parse::<bool>()
        {
            self.enable_progress_checks = b;
        }
        if let Ok(val) = std::env::var("AGENTFORGE_PROGRESS_CHECK_INTERVAL_SECS")
            && let Ok(secs) = val.parse::<u64>()
        {
            self.progress_check_interval = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("AGENTFORGE_MAX_PLAN_REVISIONS")
            && let Ok(n) = val.parse::<u32>()
        {
            self.max_plan_revisions = n;
        }
        if let Ok(val) = std::env::var("AGENTFORGE_MODEL")
            && !val.is_empty()
        {
            self.model = val;
        }
        if let Ok(val) = std::env::var("AGENTFORGE_API_KEY")
            && !val.is_empty()
        {
            self.api_key = Some(val);
        }
        if let Ok(val) = std::env::var("AGENTFORGE_WORKING_DIR")
            && !val.is_empty()
        {
            self.working_dir = PathBuf::from(val);
        }
        self
    }

    /// Loads configuration with environment variable overrides applied.
    pub fn load_with_env(path: Option<&PathBuf>) -> anyhow::Result<Self> {
        Self::load_or_default(path).map(|c| c.apply_env_overrides())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_enumerated_configuration() {
        let config = CliConfig::default();
        assert_eq!(config.max_fix_cycles, 3);
        assert_eq!(config.max_step_attempts, 3);
        assert!(config.verify_all_outputs);
        assert!(config.require_tests);
        assert_eq!(config.time_limit, Duration::from_secs(2 * 60 * 60));
        assert!(config.require_pre_plan_review);
        assert!(config.enable_progress_checks);
        assert_eq!(config.progress_check_interval, Duration::from_secs(60));
        assert_eq!(config.max_plan_revisions, 3);
        assert_eq!(config.supervisor_thresholds.warn, 2);
        assert_eq!(config.supervisor_thresholds.abort, 5);
        assert_eq!(config.quality_thresholds.plan, 70);
        assert_eq!(config.quality_thresholds.goal, 80);
    }

    #[test]
    fn env_override_takes_precedence_over_default() {
        // SAFETY: tests in this module run serially within this process;
        // no other test reads AGENTFORGE_MAX_FIX_CYCLES.
        unsafe {
            std::env::set_var("AGENTFORGE_MAX_FIX_CYCLES", "7");
        }
        let config = CliConfig::default().apply_env_overrides();
        assert_eq!(config.max_fix_cycles, 7);
        unsafe {
            std::env::remove_var("AGENTFORGE_MAX_FIX_CYCLES");
        }
    }

    #[test]
    fn load_or_default_falls_back_when_path_is_absent() {
        let config = CliConfig::load_or_default(Some(&PathBuf::from("/nonexistent/config.yaml"))).unwrap();
        assert_eq!(config.max_fix_cycles, 3);
    }
}
