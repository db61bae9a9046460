//! Engine configuration.
//!
//! Loaded from TOML with [`EngineConfig::load`], then optionally overridden
//! from `WEAVE_*` environment variables with [`EngineConfig::apply_env`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::hitl::{HitlTimeouts, TimeoutAction, TimeoutPolicy};

/// Default values for engine settings.
pub mod defaults {
    /// Default cap on concurrently running tasks.
    pub const MAX_PARALLEL: usize = 4;

    /// Default timeout for a single executor invocation in seconds (5 minutes).
    pub const TASK_TIMEOUT_SECS: u64 = 300;

    /// Default retry budget for tasks that do not declare one.
    pub const MAX_RETRIES: u32 = 0;

    /// Default window for a plan review in seconds (10 minutes).
    pub const PLAN_REVIEW_TIMEOUT_SECS: u64 = 600;

    /// Default window for a task approval in seconds (5 minutes).
    pub const APPROVAL_TIMEOUT_SECS: u64 = 300;

    /// Default window for a clarification in seconds (5 minutes).
    pub const CLARIFICATION_TIMEOUT_SECS: u64 = 300;

    /// Default window for an input request in seconds (5 minutes).
    pub const INPUT_TIMEOUT_SECS: u64 = 300;

    /// Periodic checkpoint cadence in seconds.
    pub const CHECKPOINT_INTERVAL_SECS: u64 = 30;

    /// How long finished sessions are kept, in hours (one week).
    pub const RETENTION_HOURS: u64 = 168;

    /// Event loop tick interval in milliseconds.
    pub const TICK_INTERVAL_MS: u64 = 250;
}

/// Orchestration engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum tasks in flight per session (0 = unbounded).
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Per-invocation timeout in seconds (0 = none).
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,

    /// Retry budget applied to tasks that declare none.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Hold every session for a plan review before the first dispatch.
    #[serde(default)]
    pub require_plan_review: bool,

    /// Response windows per request type.
    #[serde(default)]
    pub hitl_timeouts: HitlTimeouts,

    /// Action applied when a request times out.
    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,

    /// Seconds between periodic checkpoints (0 = only on suspension and exit).
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_secs: u64,

    /// Hours a finished session is kept before purge.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Interval at which the driver calls `tick`.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Directory for the file checkpoint store.
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
}

fn default_max_parallel() -> usize {
    defaults::MAX_PARALLEL
}

fn default_task_timeout() -> u64 {
    defaults::TASK_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    defaults::MAX_RETRIES
}

fn default_checkpoint_interval() -> u64 {
    defaults::CHECKPOINT_INTERVAL_SECS
}

fn default_retention_hours() -> u64 {
    defaults::RETENTION_HOURS
}

fn default_tick_interval() -> u64 {
    defaults::TICK_INTERVAL_MS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            task_timeout_secs: default_task_timeout(),
            default_max_retries: default_max_retries(),
            require_plan_review: false,
            hitl_timeouts: HitlTimeouts::default(),
            timeout_policy: TimeoutPolicy::default(),
            checkpoint_interval_secs: default_checkpoint_interval(),
            retention_hours: default_retention_hours(),
            tick_interval_ms: default_tick_interval(),
            checkpoint_dir: None,
        }
    }
}

impl EngineConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = Self::from_toml(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Override settings from `WEAVE_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Override settings from an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WEAVE_MAX_PARALLEL") {
            self.max_parallel = parse_var("WEAVE_MAX_PARALLEL", &v)?;
        }
        if let Some(v) = lookup("WEAVE_TASK_TIMEOUT_SECS") {
            self.task_timeout_secs = parse_var("WEAVE_TASK_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("WEAVE_DEFAULT_MAX_RETRIES") {
            self.default_max_retries = parse_var("WEAVE_DEFAULT_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("WEAVE_REQUIRE_PLAN_REVIEW") {
            self.require_plan_review = parse_var("WEAVE_REQUIRE_PLAN_REVIEW", &v)?;
        }
        if let Some(v) = lookup("WEAVE_HITL_TIMEOUT_SECS") {
            self.hitl_timeouts = HitlTimeouts::uniform(parse_var("WEAVE_HITL_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("WEAVE_PLAN_REVIEW_TIMEOUT_ACTION") {
            self.timeout_policy.plan_review = parse_action("WEAVE_PLAN_REVIEW_TIMEOUT_ACTION", &v)?;
        }
        if let Some(v) = lookup("WEAVE_CHECKPOINT_INTERVAL_SECS") {
            self.checkpoint_interval_secs = parse_var("WEAVE_CHECKPOINT_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("WEAVE_RETENTION_HOURS") {
            self.retention_hours = parse_var("WEAVE_RETENTION_HOURS", &v)?;
        }
        if let Some(dir) = lookup("WEAVE_CHECKPOINT_DIR") {
            self.checkpoint_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "tick_interval_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.retention_hours == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retention_hours".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Set the parallelism cap.
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max;
        self
    }

    /// Set the per-invocation timeout.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the default retry budget.
    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    /// Require a plan review before execution.
    pub fn with_plan_review(mut self, required: bool) -> Self {
        self.require_plan_review = required;
        self
    }

    /// Set the HITL response windows.
    pub fn with_hitl_timeouts(mut self, timeouts: HitlTimeouts) -> Self {
        self.hitl_timeouts = timeouts;
        self
    }

    /// Set the HITL timeout policy.
    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    /// Set the periodic checkpoint cadence.
    pub fn with_checkpoint_interval(mut self, secs: u64) -> Self {
        self.checkpoint_interval_secs = secs;
        self
    }

    /// Parallelism cap, `None` when unbounded.
    pub fn max_parallel_limit(&self) -> Option<usize> {
        (self.max_parallel > 0).then_some(self.max_parallel)
    }

    /// Per-invocation timeout, `None` when disabled.
    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_secs > 0).then(|| Duration::from_secs(self.task_timeout_secs))
    }

    /// Periodic checkpoint cadence, `None` when disabled.
    pub fn checkpoint_interval(&self) -> Option<Duration> {
        (self.checkpoint_interval_secs > 0)
            .then(|| Duration::from_secs(self.checkpoint_interval_secs))
    }

    /// Retention window for finished sessions.
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours as i64)
    }

    /// Tick interval for the event loop.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("cannot parse '{}'", value),
    })
}

fn parse_action(key: &str, value: &str) -> Result<TimeoutAction, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "approve" => Ok(TimeoutAction::Approve),
        "reject" => Ok(TimeoutAction::Reject),
        "skip" => Ok(TimeoutAction::Skip),
        "expire" => Ok(TimeoutAction::Expire),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("unknown timeout action '{}'", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_parallel_limit(), Some(defaults::MAX_PARALLEL));
        assert_eq!(config.task_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.timeout_policy.plan_review, TimeoutAction::Approve);
        assert_eq!(config.timeout_policy.approval, TimeoutAction::Skip);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = EngineConfig::from_toml(
            r#"
max_parallel = 0
require_plan_review = true

[hitl_timeouts]
plan_review_secs = 5

[timeout_policy]
approval = "expire"
"#,
        )
        .unwrap();

        assert_eq!(config.max_parallel_limit(), None);
        assert!(config.require_plan_review);
        assert_eq!(config.hitl_timeouts.plan_review_secs, 5);
        assert_eq!(config.hitl_timeouts.input_secs, defaults::INPUT_TIMEOUT_SECS);
        assert_eq!(config.timeout_policy.approval, TimeoutAction::Expire);
        assert_eq!(config.timeout_policy.plan_review, TimeoutAction::Approve);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "task_timeout_secs = 12").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.task_timeout(), Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_load_errors() {
        let missing = EngineConfig::load("/nonexistent/weave.toml");
        assert!(matches!(missing, Err(ConfigError::ReadError { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_parallel = \"many\"").unwrap();
        assert!(matches!(
            EngineConfig::load(file.path()),
            Err(ConfigError::ParseError { .. })
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "tick_interval_ms = 0").unwrap();
        assert!(matches!(
            EngineConfig::load(file.path()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("WEAVE_MAX_PARALLEL", "8"),
            ("WEAVE_REQUIRE_PLAN_REVIEW", "true"),
            ("WEAVE_PLAN_REVIEW_TIMEOUT_ACTION", "Expire"),
            ("WEAVE_CHECKPOINT_DIR", "/tmp/weave"),
        ]);
        let mut config = EngineConfig::default();
        config
            .apply_env_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.max_parallel, 8);
        assert!(config.require_plan_review);
        assert_eq!(config.timeout_policy.plan_review, TimeoutAction::Expire);
        assert_eq!(config.checkpoint_dir, Some(PathBuf::from("/tmp/weave")));
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_env_from(|k| (k == "WEAVE_TASK_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "WEAVE_TASK_TIMEOUT_SECS"));
    }
}
