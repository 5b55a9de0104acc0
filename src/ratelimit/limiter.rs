//! Sliding-window rate limiter.
//!
//! Each client owns a queue of admission instants in insertion order, so
//! expired entries are always at the front and pruning is amortized O(1).
//! All state sits behind one `tokio::sync::Mutex`; the per-request work is
//! small enough that global serialization is cheaper than per-client locks.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Time until the oldest retained request leaves the window. Only set on rejection.
    pub retry_after: Option<Duration>,
    /// Requests still admissible in the current window after this decision.
    pub remaining: u32,
}

struct LimiterInner {
    clients: HashMap<String, VecDeque<Instant>>,
    last_sweep: Instant,
}

/// Admits at most `limit` requests per client in any trailing `window`.
pub struct SlidingWindowLimiter {
    limit: u32,
    window: Duration,
    cleanup_interval: Duration,
    inner: Mutex<LimiterInner>,
}

impl SlidingWindowLimiter {
    /// Default spacing between sweeps of fully expired clients.
    pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

    pub fn new(limit: u32, window: Duration) -> Self {
        Self::with_cleanup_interval(limit, window, Self::DEFAULT_CLEANUP_INTERVAL)
    }

    pub fn with_cleanup_interval(limit: u32, window: Duration, cleanup_interval: Duration) -> Self {
        debug!(limit, window_secs = window.as_secs_f64(), "rate limiter initialized");
        Self {
            limit,
            window,
            cleanup_interval,
            inner: Mutex::new(LimiterInner {
                clients: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Check and, if admitted, record a request from `client_id`.
    pub async fn is_allowed(&self, client_id: &str) -> RateDecision {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.window);
        let mut inner = self.inner.lock().await;

        if now.duration_since(inner.last_sweep) >= self.cleanup_interval {
            let removed = sweep_expired(&mut inner.clients, cutoff);
            inner.last_sweep = now;
            if removed > 0 {
                debug!(removed, "swept inactive rate limit clients");
            }
        }

        let timestamps = inner.clients.entry(client_id.to_string()).or_default();
        prune(timestamps, cutoff);

        if timestamps.len() as u32 >= self.limit {
            let retry_after = timestamps
                .front()
                .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
                .unwrap_or(self.window);
            warn!(
                client_id,
                count = timestamps.len(),
                limit = self.limit,
                window_secs = self.window.as_secs_f64(),
                "rate limit exceeded"
            );
            return RateDecision {
                allowed: false,
                retry_after: Some(retry_after),
                remaining: 0,
            };
        }

        timestamps.push_back(now);
        let remaining = self.limit.saturating_sub(timestamps.len() as u32);
        RateDecision {
            allowed: true,
            retry_after: None,
            remaining,
        }
    }

    /// Requests `client_id` may still make in the current window. Does not
    /// record anything.
    pub async fn remaining(&self, client_id: &str) -> u32 {
        let cutoff = Instant::now().checked_sub(self.window);
        let inner = self.inner.lock().await;
        let live = inner
            .clients
            .get(client_id)
            .map(|timestamps| timestamps.iter().filter(|&&t| !is_expired(t, cutoff)).count())
            .unwrap_or(0);
        self.limit.saturating_sub(live as u32)
    }

    /// Drop all history for `client_id`.
    pub async fn reset(&self, client_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let existed = inner.clients.remove(client_id).is_some();
        if existed {
            info!(client_id, "reset rate limit");
        }
        existed
    }

    /// Remove every client whose history has fully expired, regardless of
    /// when the last sweep ran. Returns the number of clients removed.
    pub async fn force_sweep(&self) -> usize {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.window);
        let mut inner = self.inner.lock().await;
        inner.last_sweep = now;
        sweep_expired(&mut inner.clients, cutoff)
    }

    /// Number of clients currently holding window state.
    pub async fn tracked_clients(&self) -> usize {
        self.inner.lock().await.clients.len()
    }
}

fn is_expired(t: Instant, cutoff: Option<Instant>) -> bool {
    cutoff.is_some_and(|c| t <= c)
}

fn prune(timestamps: &mut VecDeque<Instant>, cutoff: Option<Instant>) {
    while timestamps.front().is_some_and(|&t| is_expired(t, cutoff)) {
        timestamps.pop_front();
    }
}

fn sweep_expired(clients: &mut HashMap<String, VecDeque<Instant>>, cutoff: Option<Instant>) -> usize {
    let before = clients.len();
    clients.retain(|_, timestamps| {
        prune(timestamps, cutoff);
        !timestamps.is_empty()
    });
    before - clients.len()
}
