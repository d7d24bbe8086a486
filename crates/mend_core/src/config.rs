//! Configuration for the recovery loop.
//!
//! Loaded from YAML (`.mend/config.yaml` by default). Every field has a
//! default, so a partial file or no file at all is valid. A handful of
//! budgets can be overridden through `MEND_*` environment variables.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::shard::DEFAULT_SHARDS;

/// Retry budgets per project session and per normalized error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub max_retries_per_error: u32,
    pub max_retries_per_session: u32,
    pub max_tokens_per_session: u64,
    pub session_ttl_secs: u64,
    pub shards: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_retries_per_error: 3,
            max_retries_per_session: 10,
            max_tokens_per_session: 200_000,
            session_ttl_secs: 30 * 60,
            shards: DEFAULT_SHARDS,
        }
    }
}

impl LimiterConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

/// Per-project circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_secs: 300,
        }
    }
}

impl BreakerConfig {
    pub fn recovery_time(&self) -> Duration {
        Duration::from_secs(self.recovery_secs)
    }
}

/// Fix cache sizing and decay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
    /// EMA weight of the newest outcome
    pub alpha: f64,
    /// Entries below this success rate are dropped once `min_uses` is reached
    pub eviction_threshold: f64,
    pub min_uses: u32,
    pub shards: usize,
    /// Combine the file path with the error hash when keying entries
    pub key_includes_file: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 512,
            ttl_secs: 24 * 60 * 60,
            alpha: 0.3,
            eviction_threshold: 0.3,
            min_uses: 4,
            shards: DEFAULT_SHARDS,
            key_includes_file: false,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Sandbox image and lifecycle step policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub image: String,
    pub tag: String,
    /// Directory inside the sandbox where the project is mounted
    pub workdir: String,
    /// Command that starts the preview/dev server
    pub preview_command: Vec<String>,
    /// Command used by verification to check the project builds/boots
    pub probe_command: Vec<String>,
    /// Port the preview server listens on inside the sandbox
    pub preview_port: u16,
    pub network_mode: Option<String>,
    pub step_timeout_secs: u64,
    pub step_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "node".to_string(),
            tag: "20-slim".to_string(),
            workdir: "/app".to_string(),
            preview_command: vec!["npm".to_string(), "run".to_string(), "dev".to_string()],
            probe_command: vec!["npm".to_string(), "run".to_string(), "build".to_string()],
            preview_port: 3000,
            network_mode: None,
            step_timeout_secs: 30,
            step_retries: 2,
            retry_delay_ms: 250,
        }
    }
}

impl SandboxConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Pipeline-level timeouts and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub proposal_timeout_secs: u64,
    pub verify_timeout_secs: u64,
    pub max_tokens_per_proposal: u64,
    /// Give unclassified errors one proposer-assisted attempt
    pub allow_unknown_attempt: bool,
    /// USD per million proposer input tokens
    pub input_cost_per_million: f64,
    /// USD per million proposer output tokens
    pub output_cost_per_million: f64,
    /// External fix-proposal program (argv); empty disables proposals
    pub proposer_command: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            proposal_timeout_secs: 120,
            verify_timeout_secs: 60,
            max_tokens_per_proposal: 16_000,
            allow_unknown_attempt: false,
            input_cost_per_million: 3.0,
            output_cost_per_million: 15.0,
            proposer_command: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_secs(self.proposal_timeout_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    /// USD cost of a proposal call.
    pub fn token_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_cost_per_million
            + (output_tokens as f64 / 1_000_000.0) * self.output_cost_per_million
    }
}

/// Event bus sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub subscriber_capacity: usize,
    pub history_limit: usize,
    /// Directory for per-project JSONL event journals
    pub journal_dir: Option<PathBuf>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
            history_limit: 512,
            journal_dir: None,
        }
    }
}

/// Complete configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MendConfig {
    pub limiter: LimiterConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub sandbox: SandboxConfig,
    pub orchestrator: OrchestratorConfig,
    pub events: EventsConfig,
}

impl MendConfig {
    /// Conventional config location under a workspace root.
    pub fn default_path(root: &Path) -> PathBuf {
        root.join(".mend").join("config.yaml")
    }

    /// Load and validate a YAML config file.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Load `<root>/.mend/config.yaml` if present, defaults otherwise.
    pub fn discover(root: &Path) -> CoreResult<Self> {
        let path = Self::default_path(root);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> CoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Apply `MEND_*` environment overrides.
    pub fn apply_env(mut self) -> Self {
        self.apply_vars(|key| std::env::var(key).ok());
        self
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
            let raw = value?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("Ignoring {}={:?}: not a valid value", key, raw);
                    None
                }
            }
        }

        if let Some(v) = parse("MEND_MAX_RETRIES_PER_ERROR", lookup("MEND_MAX_RETRIES_PER_ERROR")) {
            self.limiter.max_retries_per_error = v;
        }
        if let Some(v) = parse("MEND_MAX_RETRIES_PER_SESSION", lookup("MEND_MAX_RETRIES_PER_SESSION")) {
            self.limiter.max_retries_per_session = v;
        }
        if let Some(v) = parse("MEND_SESSION_TTL_SECS", lookup("MEND_SESSION_TTL_SECS")) {
            self.limiter.session_ttl_secs = v;
        }
        if let Some(v) = parse("MEND_FAILURE_THRESHOLD", lookup("MEND_FAILURE_THRESHOLD")) {
            self.breaker.failure_threshold = v;
        }
        if let Some(v) = parse("MEND_RECOVERY_SECS", lookup("MEND_RECOVERY_SECS")) {
            self.breaker.recovery_secs = v;
        }
        if let Some(v) = parse("MEND_CACHE_CAPACITY", lookup("MEND_CACHE_CAPACITY")) {
            self.cache.capacity = v;
        }
        if let Some(raw) = lookup("MEND_ALLOW_UNKNOWN_ATTEMPT") {
            self.orchestrator.allow_unknown_attempt = matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    /// Reject values that would disable or break a safety valve.
    pub fn validate(&self) -> CoreResult<()> {
        if self.limiter.max_retries_per_error == 0 || self.limiter.max_retries_per_session == 0 {
            return Err(CoreError::Config("retry limits must be at least 1".into()));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(CoreError::Config("failure_threshold must be at least 1".into()));
        }
        if self.cache.capacity == 0 {
            return Err(CoreError::Config("cache capacity must be at least 1".into()));
        }
        if !(self.cache.alpha > 0.0 && self.cache.alpha <= 1.0) {
            return Err(CoreError::Config(format!(
                "cache alpha must be in (0, 1], got {}",
                self.cache.alpha
            )));
        }
        if !(0.0..=1.0).contains(&self.cache.eviction_threshold) {
            return Err(CoreError::Config(
                "cache eviction_threshold must be in [0, 1]".into(),
            ));
        }
        if self.events.subscriber_capacity == 0 {
            return Err(CoreError::Config("subscriber_capacity must be at least 1".into()));
        }
        Ok(())
    }
}
