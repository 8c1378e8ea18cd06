//! Engine configuration
//!
//! All tunables of the reconciler, registration client, poller and prompt
//! gate live here. Every section has serde defaults, so a partial TOML file
//! (or none at all) yields a working configuration.

use crate::backoff::BackoffPolicy;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Subscription reconciler
    pub reconciler: ReconcilerConfig,
    /// Backend registration retries
    pub registration: RegistrationConfig,
    /// Completion poller
    pub poller: PollerConfig,
    /// Opt-in prompt timing
    pub prompt: PromptConfig,
    /// Backend HTTP endpoint
    pub backend: BackendConfig,
    /// File backing the local flag store (in-memory when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML text and validate
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// With backend base URL
    #[inline]
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.backend.base_url = base_url.into();
        self
    }

    /// With registration attempts
    #[inline]
    #[must_use]
    pub fn with_registration_attempts(mut self, attempts: u32) -> Self {
        self.registration.max_attempts = attempts;
        self
    }

    /// With poll schedule
    #[inline]
    #[must_use]
    pub fn with_poll_schedule(mut self, max_attempts: u32, interval_ms: u64) -> Self {
        self.poller.max_attempts = max_attempts;
        self.poller.interval_ms = interval_ms;
        self
    }

    /// Reject values that would make the engine misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registration.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "registration.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.registration.jitter) {
            return Err(ConfigError::Invalid(format!(
                "registration.jitter must be within [0, 1], got {}",
                self.registration.jitter
            )));
        }
        if self.poller.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "poller.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.poller.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poller.interval_ms must be positive".to_string(),
            ));
        }
        if self.poller.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "poller.max_concurrent must be at least 1".to_string(),
            ));
        }
        url::Url::parse(&self.backend.base_url).map_err(|e| {
            ConfigError::Invalid(format!("backend.base_url {:?}: {e}", self.backend.base_url))
        })?;
        Ok(())
    }
}

/// Subscription reconciler settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Upper bound on waiting for the background worker
    pub worker_ready_timeout_ms: u64,
    /// Backend public key handed to the platform on subscribe (base64url)
    pub application_server_key: String,
}

impl ReconcilerConfig {
    /// Worker wait as a `Duration`
    #[inline]
    #[must_use]
    pub fn worker_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_ready_timeout_ms)
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            worker_ready_timeout_ms: 15_000,
            application_server_key: String::new(),
        }
    }
}

/// Backend registration retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay_ms: u64,
    /// Ceiling for any single delay
    pub max_delay_ms: u64,
    /// Extra random delay as a fraction of the nominal delay, in `[0, 1]`
    pub jitter: f64,
}

impl RegistrationConfig {
    /// Backoff policy described by this section
    #[must_use]
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_jitter(self.jitter)
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter: 0.0,
        }
    }
}

/// Completion poller settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Fetches before a job times out
    pub max_attempts: u32,
    /// Delay between fetches
    pub interval_ms: u64,
    /// Fetches allowed in flight across all jobs
    pub max_concurrent: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval_ms: 2_000,
            max_concurrent: 8,
        }
    }
}

/// Opt-in prompt settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Delay before the prompt appears
    pub grace_period_ms: u64,
}

impl PromptConfig {
    /// Grace period as a `Duration`
    #[inline]
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 3_000,
        }
    }
}

/// Backend HTTP settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL, e.g. `http://localhost:8000`
    pub base_url: String,
    /// Per-request timeout
    pub request_timeout_ms: u64,
}

impl BackendConfig {
    /// Request timeout as a `Duration`
    #[inline]
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::new();
        assert_eq!(config.reconciler.worker_ready_timeout_ms, 15_000);
        assert_eq!(config.registration.max_attempts, 3);
        assert_eq!(config.poller.max_attempts, 10);
        assert_eq!(config.poller.interval_ms, 2_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [poller]
            interval_ms = 500

            [backend]
            base_url = "https://notes.example.com"
            "#,
        )
        .unwrap();
        assert_eq!(config.poller.interval_ms, 500);
        assert_eq!(config.poller.max_attempts, 10);
        assert_eq!(config.backend.base_url, "https://notes.example.com");
        assert_eq!(config.registration, RegistrationConfig::default());
    }

    #[test]
    fn rejects_zero_attempts() {
        let err = EngineConfig::from_toml_str("[registration]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_out_of_range_jitter() {
        let err = EngineConfig::from_toml_str("[registration]\njitter = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_bad_base_url() {
        let config = EngineConfig::new().with_base_url("not a url");
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip_of_defaults() {
        let config = EngineConfig::new().with_poll_schedule(4, 250);
        let text = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noteping.toml");
        std::fs::write(&path, "[prompt]\ngrace_period_ms = 10\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.prompt.grace_period(), Duration::from_millis(10));

        let missing = EngineConfig::load(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
