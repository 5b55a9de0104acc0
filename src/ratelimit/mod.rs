//! HTTP admission control.
//!
//! A [`RateLimitPolicy`] binds a default [`SlidingWindowLimiter`] plus
//! tighter per-path limiters, resolved from a named profile or explicit
//! configuration. [`middleware::rate_limit_middleware`] applies it to every
//! request before it reaches a handler.

pub mod limiter;
pub mod middleware;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{info, warn};

pub use self::limiter::{RateDecision, SlidingWindowLimiter};
use crate::config::{LimitSpec, RateLimitConfig};

/// Path of the single-alert processing endpoint.
pub const ALERTS_PATH: &str = "/api/v1/alerts";
/// Path of the batch processing endpoint.
pub const BATCH_PATH: &str = "/api/v1/alerts/batch";
/// Path of the enqueue endpoint.
pub const ENQUEUE_PATH: &str = "/api/v1/alerts/enqueue";

/// A named bundle of default and per-endpoint budgets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitProfile {
    pub default: LimitSpec,
    pub endpoints: BTreeMap<String, LimitSpec>,
}

impl RateLimitProfile {
    fn tiered(default: u32, analyze: u32, batch: u32, queue: u32) -> Self {
        let endpoints = BTreeMap::from([
            (ALERTS_PATH.to_string(), LimitSpec::new(analyze, 60)),
            (BATCH_PATH.to_string(), LimitSpec::new(batch, 60)),
            (ENQUEUE_PATH.to_string(), LimitSpec::new(queue, 60)),
        ]);
        Self {
            default: LimitSpec::new(default, 60),
            endpoints,
        }
    }

    /// Look up a built-in profile. Unknown names fall back to `moderate`.
    pub fn named(name: &str) -> Self {
        match name {
            "strict" => Self::tiered(30, 10, 5, 20),
            "moderate" => Self::tiered(100, 30, 10, 50),
            "permissive" => Self::tiered(300, 100, 50, 150),
            other => {
                warn!(profile = other, "unknown rate limit profile, using 'moderate'");
                Self::named("moderate")
            }
        }
    }
}

/// The set of limiters guarding the HTTP surface.
pub struct RateLimitPolicy {
    enabled: bool,
    default: Arc<SlidingWindowLimiter>,
    endpoints: HashMap<String, Arc<SlidingWindowLimiter>>,
    exempt_paths: Vec<String>,
    api_key_prefix: String,
}

impl RateLimitPolicy {
    /// Build limiters from configuration. Explicit `default`/`endpoints`
    /// override the chosen profile.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let profile = RateLimitProfile::named(&config.profile);
        let default_spec = config.default.unwrap_or(profile.default);
        let endpoint_specs = config.endpoints.clone().unwrap_or(profile.endpoints);
        let cleanup = config.cleanup_interval();

        let default = Arc::new(SlidingWindowLimiter::with_cleanup_interval(
            default_spec.limit,
            default_spec.window(),
            cleanup,
        ));
        let endpoints: HashMap<_, _> = endpoint_specs
            .into_iter()
            .map(|(path, spec)| {
                let limiter =
                    SlidingWindowLimiter::with_cleanup_interval(spec.limit, spec.window(), cleanup);
                (path, Arc::new(limiter))
            })
            .collect();

        info!(
            enabled = config.enabled,
            profile = %config.profile,
            default_limit = default_spec.limit,
            default_window_secs = default_spec.window_secs,
            custom_endpoints = endpoints.len(),
            "rate limit policy initialized"
        );

        Self {
            enabled: config.enabled,
            default,
            endpoints,
            exempt_paths: config.exempt_paths.clone(),
            api_key_prefix: config.api_key_prefix.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|p| p == path)
    }

    pub fn api_key_prefix(&self) -> &str {
        &self.api_key_prefix
    }

    /// The limiter responsible for `path`.
    pub fn limiter_for(&self, path: &str) -> &Arc<SlidingWindowLimiter> {
        self.endpoints.get(path).unwrap_or(&self.default)
    }

    /// Clear `client_id` from every limiter. Returns whether any held state.
    pub async fn reset_client(&self, client_id: &str) -> bool {
        let mut any = self.default.reset(client_id).await;
        for limiter in self.endpoints.values() {
            any |= limiter.reset(client_id).await;
        }
        any
    }
}
