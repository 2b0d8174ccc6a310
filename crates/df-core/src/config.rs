//! Engine configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries the
//! router, queue, retry, sweep, and auto-resume settings. Every section
//! defaults sensibly so a completely empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub router: RouterConfig,
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub sweep: SweepConfig,
    #[serde(default)]
    pub auto_resume: Vec<ResumePolicy>,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.router.workers == 0 {
            warnings.push("router.workers is 0; events will never be processed".into());
        }
        if self.router.max_flow_depth == 0 {
            warnings.push("router.max_flow_depth is 0; every split child will error".into());
        }
        if self.queue.cold_queue_threshold == 0 {
            warnings.push("queue.cold_queue_threshold is 0; every action will be cold queued".into());
        }
        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0; treating as a single attempt".into());
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            warnings.push(format!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            ));
        }
        if self.sweep.interval_ms == 0 {
            warnings.push("sweep.interval_ms is 0; periodic sweeps are disabled".into());
        }

        for (i, policy) in self.auto_resume.iter().enumerate() {
            if policy.name.is_empty() {
                warnings.push(format!("auto_resume[{i}].name is empty"));
            }
            if policy.max_attempts < 2 {
                warnings.push(format!(
                    "auto_resume[{i}] ({}) max_attempts must be at least 2 to ever resume",
                    policy.name
                ));
            }
            if policy.error_substring.is_none() && policy.flow.is_none() && policy.action.is_none()
            {
                warnings.push(format!(
                    "auto_resume[{i}] ({}) matches every error",
                    policy.name
                ));
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Flow router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Number of event-processing workers.
    pub workers: usize,
    /// Capacity of the inbound event channel.
    pub event_channel_capacity: usize,
    /// Deepest allowed chain of flows, counting publish hops and split
    /// children.
    pub max_flow_depth: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            event_channel_capacity: 1024,
            max_flow_depth: 32,
        }
    }
}

/// Dispatch queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue depth at which new work is recorded cold instead of dispatched.
    pub cold_queue_threshold: usize,
    /// Age after which a QUEUED action is dispatched again.
    pub requeue_duration_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            cold_queue_threshold: 10_000,
            requeue_duration_secs: 300,
        }
    }
}

impl QueueConfig {
    pub fn requeue_duration(&self) -> Duration {
        Duration::from_secs(self.requeue_duration_secs)
    }
}

/// Optimistic-concurrency retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_ms: 5,
            max_backoff_ms: 500,
        }
    }
}

/// Periodic sweep settings (join timeouts, requeue, auto-resume).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_ms: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Policy that automatically resumes errored actions after a delay.
///
/// A policy matches an error when every populated selector matches: the
/// cause contains `error_substring`, the flow name equals `flow`, and the
/// action name equals `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumePolicy {
    pub name: String,
    #[serde(default)]
    pub error_substring: Option<String>,
    #[serde(default)]
    pub flow: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    /// Total attempts allowed, including the one that failed first.
    pub max_attempts: u32,
    pub delay_secs: u64,
    #[serde(default)]
    pub max_delay_secs: Option<u64>,
    /// Growth factor applied per attempt; absent means a fixed delay.
    #[serde(default)]
    pub multiplier: Option<f64>,
}

impl ResumePolicy {
    /// Whether this policy covers an error raised by `action` in `flow`.
    pub fn matches(&self, attempt: u32, cause: &str, flow: &str, action: &str) -> bool {
        attempt < self.max_attempts
            && self
                .error_substring
                .as_deref()
                .map_or(true, |needle| cause.contains(needle))
            && self.flow.as_deref().map_or(true, |f| f == flow)
            && self.action.as_deref().map_or(true, |a| a == action)
    }

    /// Delay before resuming after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.delay_secs as f64;
        let secs = match self.multiplier {
            Some(multiplier) if multiplier > 1.0 => {
                base * multiplier.powi(attempt.saturating_sub(1) as i32)
            }
            _ => base,
        };
        let secs = match self.max_delay_secs {
            Some(max) => secs.min(max as f64),
            None => secs,
        };
        Duration::from_secs_f64(secs.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_test_policy() -> ResumePolicy {
        ResumePolicy {
            name: "smoke-retry".into(),
            error_substring: Some("timeout".into()),
            flow: Some("smoke".into()),
            action: None,
            max_attempts: 3,
            delay_secs: 10,
            max_delay_secs: Some(25),
            multiplier: Some(2.0),
        }
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert_eq!(cfg.router.workers, 4);
        assert_eq!(cfg.queue.cold_queue_threshold, 10_000);
        assert_eq!(cfg.retry.max_attempts, 10);
        assert!(cfg.auto_resume.is_empty());
    }

    #[test]
    fn default_config_no_warnings() {
        let warnings = Config::default().validate();
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
    }

    #[test]
    fn zero_workers_warns() {
        let mut cfg = Config::default();
        cfg.router.workers = 0;
        assert!(cfg.validate().iter().any(|w| w.contains("router.workers")));
    }

    #[test]
    fn inverted_backoff_warns() {
        let mut cfg = Config::default();
        cfg.retry.initial_backoff_ms = 1000;
        cfg.retry.max_backoff_ms = 10;
        assert!(cfg.validate().iter().any(|w| w.contains("initial_backoff_ms")));
    }

    #[test]
    fn catch_all_policy_warns() {
        let mut cfg = Config::default();
        cfg.auto_resume.push(ResumePolicy {
            error_substring: None,
            flow: None,
            ..make_test_policy()
        });
        assert!(cfg.validate().iter().any(|w| w.contains("matches every error")));
    }

    #[test]
    fn parse_json_config() {
        let json = r#"{"router": {"workers": 8}, "auto_resume": [
            {"name": "p", "flow": "f", "max_attempts": 2, "delay_secs": 5}
        ]}"#;
        let cfg = Config::from_json(json).unwrap();
        assert_eq!(cfg.router.workers, 8);
        assert_eq!(cfg.router.max_flow_depth, 32);
        assert_eq!(cfg.auto_resume[0].flow.as_deref(), Some("f"));
    }

    #[test]
    fn parse_empty_json_uses_defaults() {
        let cfg = Config::from_json("{}").unwrap();
        assert_eq!(cfg.sweep.interval_ms, 1000);
    }

    #[test]
    fn broken_json_is_validation_error() {
        let err = Config::from_json("{not json").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn load_or_default_with_none() {
        let cfg = Config::load_or_default(None);
        assert_eq!(cfg.router.workers, 4);
    }

    #[test]
    fn load_or_default_with_missing_file() {
        let cfg = Config::load_or_default(Some(Path::new("/nonexistent/deltaflow.json")));
        assert_eq!(cfg.router.workers, 4);
    }

    #[test]
    fn load_or_default_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"queue": {{"requeue_duration_secs": 7}}}}"#).unwrap();
        let cfg = Config::load_or_default(Some(file.path()));
        assert_eq!(cfg.queue.requeue_duration(), Duration::from_secs(7));
    }

    #[test]
    fn policy_matching() {
        let policy = make_test_policy();
        assert!(policy.matches(1, "read timeout", "smoke", "compress"));
        assert!(!policy.matches(1, "bad input", "smoke", "compress"));
        assert!(!policy.matches(1, "read timeout", "other", "compress"));
        assert!(!policy.matches(3, "read timeout", "smoke", "compress"));
    }

    #[test]
    fn policy_delay_grows_and_caps() {
        let policy = make_test_policy();
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for(3), Duration::from_secs(25));
    }
}
