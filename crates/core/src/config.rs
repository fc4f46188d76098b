use std::env;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Upper bound accepted for an explicit worker thread count.
const MAX_WORKER_THREADS: usize = 1024;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

// ── Policies ──────────────────────────────────────────────────

/// What a drain does after a withdraw for an unknown owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownRemovePolicy {
    /// Stop draining. Actions queued after the bad withdraw stay queued
    /// and are applied on the next cycle.
    #[default]
    AbortPreserve,
    /// Record the diagnostic and keep draining.
    Continue,
}

impl FromStr for UnknownRemovePolicy {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort_preserve" | "abort" => Ok(UnknownRemovePolicy::AbortPreserve),
            "continue" => Ok(UnknownRemovePolicy::Continue),
            other => Err(JobError::Config(format!("unknown remove policy '{other}'"))),
        }
    }
}

/// When a cycle's combined handle is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// Block on the handle when the driver asks for resolution.
    #[default]
    Join,
    /// Resolve only if the work already finished; otherwise try again later.
    WhenReady,
}

impl FromStr for CompletionMode {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "join" => Ok(CompletionMode::Join),
            "when_ready" | "ready" => Ok(CompletionMode::WhenReady),
            other => Err(JobError::Config(format!("unknown completion mode '{other}'"))),
        }
    }
}

// ── Engine config ─────────────────────────────────────────────

/// Engine configuration, typically parsed from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of worker threads. 0 = available parallelism.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Prefix for worker thread names.
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
    /// Preallocated element slots per job.
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,
    #[serde(default)]
    pub unknown_remove: UnknownRemovePolicy,
    #[serde(default)]
    pub completion: CompletionMode,
}

fn default_worker_threads() -> usize { 0 }
fn default_thread_name_prefix() -> String { "jobit-worker".to_string() }
fn default_initial_capacity() -> usize { 1000 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            thread_name_prefix: default_thread_name_prefix(),
            initial_capacity: default_initial_capacity(),
            unknown_remove: UnknownRemovePolicy::default(),
            completion: CompletionMode::default(),
        }
    }
}

impl EngineConfig {
    /// Parse config from a TOML string, then apply env overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, JobError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, JobError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus env overrides (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, JobError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok().filter(|v| !v.is_empty()));
    }

    /// Apply `JOBIT_*` overrides from an arbitrary lookup. Unparseable
    /// values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("JOBIT_WORKER_THREADS") {
            match v.parse() {
                Ok(n) => self.worker_threads = n,
                Err(_) => tracing::warn!(value = %v, "ignoring invalid JOBIT_WORKER_THREADS"),
            }
        }
        if let Some(v) = lookup("JOBIT_THREAD_PREFIX") {
            self.thread_name_prefix = v;
        }
        if let Some(v) = lookup("JOBIT_INITIAL_CAPACITY") {
            match v.parse() {
                Ok(n) => self.initial_capacity = n,
                Err(_) => tracing::warn!(value = %v, "ignoring invalid JOBIT_INITIAL_CAPACITY"),
            }
        }
        if let Some(v) = lookup("JOBIT_UNKNOWN_REMOVE") {
            match v.parse() {
                Ok(policy) => self.unknown_remove = policy,
                Err(e) => tracing::warn!(error = %e, "ignoring JOBIT_UNKNOWN_REMOVE"),
            }
        }
        if let Some(v) = lookup("JOBIT_COMPLETION") {
            match v.parse() {
                Ok(mode) => self.completion = mode,
                Err(e) => tracing::warn!(error = %e, "ignoring JOBIT_COMPLETION"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.thread_name_prefix.trim().is_empty() {
            return Err(JobError::Config("thread_name_prefix must not be empty".into()));
        }
        if self.worker_threads > MAX_WORKER_THREADS {
            return Err(JobError::Config(format!(
                "worker_threads {} exceeds the maximum of {MAX_WORKER_THREADS}",
                self.worker_threads
            )));
        }
        Ok(())
    }

    /// Resolve worker thread count (0 means use available parallelism).
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_threads
        }
    }

    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "worker_threads": self.resolved_worker_threads(),
            "thread_name_prefix": self.thread_name_prefix,
            "initial_capacity": self.initial_capacity,
            "unknown_remove": self.unknown_remove,
            "completion": self.completion,
        })
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!(
            workers = self.resolved_worker_threads(),
            capacity = self.initial_capacity,
            unknown_remove = ?self.unknown_remove,
            completion = ?self.completion,
            "engine config loaded"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_threads, 0);
        assert_eq!(config.thread_name_prefix, "jobit-worker");
        assert_eq!(config.initial_capacity, 1000);
        assert_eq!(config.unknown_remove, UnknownRemovePolicy::AbortPreserve);
        assert_eq!(config.completion, CompletionMode::Join);
    }

    #[test]
    fn resolved_worker_threads() {
        let mut config = EngineConfig::default();
        // 0 means auto-detect
        assert!(config.resolved_worker_threads() > 0);

        config.worker_threads = 8;
        assert_eq!(config.resolved_worker_threads(), 8);
    }

    #[test]
    fn parse_partial_toml_fills_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            worker_threads = 3
            unknown_remove = "continue"
            "#,
        )
        .unwrap();
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.unknown_remove, UnknownRemovePolicy::Continue);
        assert_eq!(config.initial_capacity, 1000);
        assert_eq!(config.completion, CompletionMode::Join);
    }

    #[test]
    fn parse_rejects_unknown_policy() {
        let result: Result<EngineConfig, _> = toml::from_str(r#"completion = "eventually""#);
        assert!(result.is_err());
    }

    #[test]
    fn validate_rejects_empty_prefix() {
        let config = EngineConfig { thread_name_prefix: "  ".into(), ..EngineConfig::default() };
        assert!(matches!(config.validate(), Err(JobError::Config(_))));
    }

    #[test]
    fn validate_rejects_absurd_thread_count() {
        let config = EngineConfig { worker_threads: 5000, ..EngineConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn overrides_apply() {
        let mut config = EngineConfig::default();
        config.apply_overrides(lookup_from(&[
            ("JOBIT_WORKER_THREADS", "6"),
            ("JOBIT_THREAD_PREFIX", "batch"),
            ("JOBIT_INITIAL_CAPACITY", "64"),
            ("JOBIT_UNKNOWN_REMOVE", "continue"),
            ("JOBIT_COMPLETION", "when_ready"),
        ]));
        assert_eq!(config.worker_threads, 6);
        assert_eq!(config.thread_name_prefix, "batch");
        assert_eq!(config.initial_capacity, 64);
        assert_eq!(config.unknown_remove, UnknownRemovePolicy::Continue);
        assert_eq!(config.completion, CompletionMode::WhenReady);
    }

    #[test]
    fn invalid_overrides_are_ignored() {
        let mut config = EngineConfig::default();
        config.apply_overrides(lookup_from(&[
            ("JOBIT_WORKER_THREADS", "many"),
            ("JOBIT_COMPLETION", "someday"),
        ]));
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn policy_from_str_aliases() {
        assert_eq!("abort".parse::<UnknownRemovePolicy>().unwrap(), UnknownRemovePolicy::AbortPreserve);
        assert_eq!(" Continue ".parse::<UnknownRemovePolicy>().unwrap(), UnknownRemovePolicy::Continue);
        assert_eq!("ready".parse::<CompletionMode>().unwrap(), CompletionMode::WhenReady);
        assert!("later".parse::<CompletionMode>().is_err());
    }

    #[test]
    fn from_file_missing_is_io_error() {
        let result = EngineConfig::from_file("/definitely/not/here/jobit.toml");
        assert!(matches!(result, Err(JobError::ConfigIo(_))));
    }

    #[test]
    fn summary_reports_resolved_threads() {
        let config = EngineConfig { worker_threads: 2, ..EngineConfig::default() };
        let summary = config.summary();
        assert_eq!(summary["worker_threads"], 2);
        assert_eq!(summary["unknown_remove"], "abort_preserve");
        assert_eq!(summary["completion"], "join");
    }
}
