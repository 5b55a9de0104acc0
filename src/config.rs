//! TOML configuration for alertpipe.
//!
//! A layered model with sensible defaults: an explicit path, then the
//! `ALERTPIPE_CONFIG` environment variable, then the standard system
//! location, then compiled-in defaults. Every section and field is optional.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::retry::RetryPolicy;
use crate::pipeline::Severity;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "ALERTPIPE_CONFIG";

/// Standard system location for the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/alertpipe/alertpipe.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the alertpipe process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded alertpipe configuration");
        Ok(config)
    }

    /// Resolve configuration in order:
    /// 1. `explicit` (a `--config` flag); an unreadable explicit file is an error.
    /// 2. The path in `ALERTPIPE_CONFIG`.
    /// 3. `/etc/alertpipe/alertpipe.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        Ok(Self::load_or_default())
    }

    /// Reject values that cannot become durations or delays.
    pub fn validate(&self) -> Result<()> {
        let endpoints = [
            ("detection", &self.services.detection),
            ("triage", &self.services.triage),
            ("enrichment", &self.services.enrichment),
            ("case_management", &self.services.case_management),
        ];
        for (name, endpoint) in endpoints {
            check_secs(&format!("services.{name}.timeout_secs"), endpoint.timeout_secs)?;
            check_secs(&format!("services.{name}.health_timeout_secs"), endpoint.health_timeout_secs)?;
        }

        let backoff = self.retry.backoff;
        if !backoff.is_finite() || !(1.0..=MAX_BACKOFF).contains(&backoff) {
            bail!("retry.backoff must be between 1 and {MAX_BACKOFF}, got {backoff}");
        }

        if let Some(secs) = self.pipeline.run_timeout_secs {
            check_secs("pipeline.run_timeout_secs", secs)?;
        }
        if self.pipeline.batch_concurrency == 0 {
            bail!("pipeline.batch_concurrency must be at least 1");
        }
        if self.pipeline.queue_capacity == 0 {
            bail!("pipeline.queue_capacity must be at least 1");
        }
        Ok(())
    }

    /// Like [`AppConfig::resolve`] without an explicit path; never fails.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "ALERTPIPE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

/// Largest accepted retry backoff multiplier.
pub const MAX_BACKOFF: f64 = 10.0;

fn check_secs(field: &str, secs: f64) -> Result<()> {
    if secs < 0.0 || Duration::try_from_secs_f64(secs).is_err() {
        bail!("{field} must be a finite, non-negative number of seconds, got {secs}");
    }
    Ok(())
}

/// Seconds to a duration, at least 1ms; unrepresentable values use `fallback`.
fn secs_or(secs: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.001)).unwrap_or(fallback)
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the API listener.
    pub bind: String,
    /// `X-Admin-Token` value required by the admin endpoints; they are disabled when unset.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            admin_token: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// Connection settings for one downstream collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Base URL; request paths are appended to it.
    pub base_url: String,
    /// Per-call timeout in seconds.
    pub timeout_secs: f64,
    /// Maximum in-flight requests; further callers wait for a slot.
    pub max_connections: usize,
    /// Idle keep-alive connections retained per host.
    pub max_idle_connections: usize,
    /// Timeout for the `/health` probe, in seconds.
    pub health_timeout_secs: f64,
    /// Optional bearer token sent with every request.
    pub api_key: Option<String>,
}

impl EndpointConfig {
    /// Defaults for a collaborator at `base_url`.
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        secs_or(self.timeout_secs, Duration::from_secs(30))
    }

    pub fn health_timeout(&self) -> Duration {
        secs_or(self.health_timeout_secs, Duration::from_secs(5))
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            timeout_secs: 30.0,
            max_connections: 10,
            max_idle_connections: 5,
            health_timeout_secs: 5.0,
            api_key: None,
        }
    }
}

/// The four remote collaborators the pipeline drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub detection: EndpointConfig,
    pub triage: EndpointConfig,
    pub enrichment: EndpointConfig,
    pub case_management: EndpointConfig,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            detection: EndpointConfig::with_base_url("http://ml-inference:8000"),
            triage: EndpointConfig::with_base_url("http://alert-triage:8000"),
            enrichment: EndpointConfig::with_base_url("http://rag-service:8000"),
            case_management: EndpointConfig::with_base_url("http://thehive:9000/api"),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Retry policy applied to every collaborator call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            backoff: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_delay_ms),
            self.backoff,
        )
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Stage policy and execution limits for the alert pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Run the ML detection stage when features are present.
    pub enable_ml: bool,
    /// Run the knowledge-base enrichment stage.
    pub enable_enrichment: bool,
    /// Minimum triage severity that opens a case.
    pub case_threshold: Severity,
    /// Model name requested from the detection service.
    pub model_name: String,
    /// Knowledge-base collection searched during enrichment.
    pub enrichment_collection: String,
    /// Documents requested during enrichment.
    pub enrichment_top_k: u32,
    /// Maximum alerts processed concurrently by a batch.
    pub batch_concurrency: usize,
    /// Capacity of the manager's alert queue.
    pub queue_capacity: usize,
    /// How long the worker waits on an empty queue before re-checking for shutdown.
    pub poll_interval_ms: u64,
    /// Optional deadline for a whole run, in seconds.
    pub run_timeout_secs: Option<f64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enable_ml: true,
            enable_enrichment: true,
            case_threshold: Severity::High,
            model_name: "random_forest".to_string(),
            enrichment_collection: "mitre_attack".to_string(),
            enrichment_top_k: 3,
            batch_concurrency: 10,
            queue_capacity: 1000,
            poll_interval_ms: 1000,
            run_timeout_secs: None,
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// `None` when unset, non-positive or too large to represent.
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs
            .filter(|s| *s > 0.0)
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
    }
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// A request budget: `limit` requests per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSpec {
    pub limit: u32,
    pub window_secs: u64,
}

impl LimitSpec {
    pub const fn new(limit: u32, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// HTTP admission control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Disable to admit everything.
    pub enabled: bool,
    /// Named profile (`strict`, `moderate`, `permissive`) used when no
    /// explicit limits are given.
    pub profile: String,
    /// Overrides the profile's default budget.
    pub default: Option<LimitSpec>,
    /// Overrides the profile's per-path budgets.
    pub endpoints: Option<BTreeMap<String, LimitSpec>>,
    /// Paths never rate limited.
    pub exempt_paths: Vec<String>,
    /// Bearer tokens starting with this prefix identify the client.
    pub api_key_prefix: String,
    /// Minimum seconds between sweeps of expired clients.
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            profile: "moderate".to_string(),
            default: None,
            endpoints: None,
            exempt_paths: vec![
                "/health".to_string(),
                "/metrics".to_string(),
                "/metrics/prometheus".to_string(),
                "/docs".to_string(),
                "/openapi.json".to_string(),
            ],
            api_key_prefix: "aisoc_".to_string(),
            cleanup_interval_secs: 300,
        }
    }
}

impl RateLimitConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Tracing output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
