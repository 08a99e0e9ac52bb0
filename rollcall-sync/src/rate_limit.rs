//! Per-client fixed-window admission control.
//!
//! Each connection is keyed by a [`Fingerprint`] derived from its remote IP
//! and `User-Agent`. This is best-effort identity: clients behind one proxy
//! share a bucket.
//!
//! The window is fixed, not sliding: a burst of `2 * capacity` straddling a
//! window boundary is admitted.
//!
//! Buckets are per fingerprint, not per connection. Sibling connections that
//! share a fingerprint share one count, and the hub only releases the bucket
//! once the last of them has closed.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Stable per-client key for rate limiting. Not an authentication token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    pub fn derive(remote: IpAddr, user_agent: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(remote.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(user_agent.as_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[..16]);
        Self(out)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex()[..12])
    }
}

/// Longest window accepted from configuration.
pub const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound on the sweeper period, whatever the window.
const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub capacity: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            capacity: 120,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    /// `None` when the window end is past what `Instant` can represent
    reset_at: Option<Instant>,
}

impl Bucket {
    fn expired(&self, now: Instant) -> bool {
        self.reset_at.is_some_and(|reset_at| now > reset_at)
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted { count: u32 },
    Limited { count: u32 },
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

/// Fingerprint → window counter table.
///
/// All operations are O(1) under one short mutex hold; nothing awaits.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<Fingerprint, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Count one message against `fp` at time `now`.
    pub fn check(&self, fp: Fingerprint, now: Instant) -> Admission {
        let mut buckets = self.buckets();
        let reset_at = now.checked_add(self.config.window);
        let bucket = buckets.entry(fp).or_insert(Bucket { count: 0, reset_at });

        if bucket.expired(now) {
            bucket.count = 1;
            bucket.reset_at = reset_at;
        } else {
            bucket.count = bucket.count.saturating_add(1);
        }

        if bucket.count <= self.config.capacity {
            Admission::Admitted { count: bucket.count }
        } else {
            Admission::Limited { count: bucket.count }
        }
    }

    /// Drop the bucket for a closed connection.
    pub fn release(&self, fp: &Fingerprint) {
        self.buckets().remove(fp);
    }

    /// Drop every bucket whose window has expired. Returns how many went.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut buckets = self.buckets();
        let before = buckets.len();
        buckets.retain(|_, b| !b.expired(now));
        before - buckets.len()
    }

    pub fn tracked(&self) -> usize {
        self.buckets().len()
    }

    /// Run [`RateLimiter::sweep`] once per window until the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let period = limiter.config.window.min(MAX_SWEEP_PERIOD);
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tick.tick().await;
                let removed = limiter.sweep(Instant::now());
                if removed > 0 {
                    log::debug!("Rate limiter swept {removed} expired buckets");
                }
            }
        })
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<Fingerprint, Bucket>> {
        // A panic while holding the guard leaves the counters usable.
        self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
