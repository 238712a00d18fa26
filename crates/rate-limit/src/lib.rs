//! Per-provider request and token rate limiting.
//!
//! Each provider gets two buckets: one counting requests per minute and one
//! counting estimated completion tokens per minute. Acquiring takes exactly
//! one RPM token and the estimated TPM tokens before returning, queueing
//! across short sleeps up to the provider's queue timeout. Providers without
//! explicit limits fall back to conservative defaults rather than running
//! unlimited.

mod bucket;

pub use bucket::TokenBucket;

use {
    dashmap::DashMap,
    serde::Deserialize,
    std::{collections::BTreeMap, sync::Arc, sync::Mutex, time::Duration},
    tokio::time::Instant,
};

/// Longest single sleep while queueing for tokens. Short slices keep the
/// wait responsive to refunds from concurrent failures.
const POLL_SLICE: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ProviderLimits {
    pub requests_per_minute: u64,
    pub tokens_per_minute: u64,
    #[serde(with = "humantime_serde")]
    pub queue_timeout: Duration,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            tokens_per_minute: 100_000,
            queue_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RateLimiterConfig {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderLimits>,
}

/// Dual-bucket limiter keyed by symbolic provider name. Clone-cheap.
#[derive(Clone)]
pub struct ProviderRateLimiter(Arc<Inner>);

struct Inner {
    config: RateLimiterConfig,
    buckets: DashMap<String, Mutex<ProviderBuckets>>,
}

struct ProviderBuckets {
    rpm: TokenBucket,
    tpm: TokenBucket,
    queue_timeout: Duration,
}

impl ProviderRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self(Arc::new(Inner {
            config,
            buckets: DashMap::new(),
        }))
    }

    /// Acquires one request token and `estimated_tokens` completion tokens
    /// for `provider`, waiting up to the provider's queue timeout. Returns
    /// `false` if the deadline passed; a request token already taken is
    /// refunded in that case. Callers invoke this exactly once per logical
    /// request, never per retry.
    pub async fn acquire(&self, provider: &str, estimated_tokens: u64) -> bool {
        let deadline = Instant::now() + self.queue_timeout(provider);

        if !self.acquire_tokens(provider, Resource::Requests, 1, deadline).await {
            Metrics::get().observe(provider, "rpm_timeout");
            tracing::warn!(provider, "request rate limit queue timed out");
            return false;
        }
        if !self
            .acquire_tokens(provider, Resource::Tokens, estimated_tokens, deadline)
            .await
        {
            self.with_buckets(provider, |buckets| buckets.rpm.add_tokens(1));
            Metrics::get().observe(provider, "tpm_timeout");
            tracing::warn!(
                provider,
                estimated_tokens,
                "token rate limit queue timed out, refunded request token"
            );
            return false;
        }
        Metrics::get().observe(provider, "acquired");
        true
    }

    /// Future hook for semaphore-style schemes. Token buckets have nothing
    /// to release.
    pub fn release(&self, _provider: &str) {}

    /// Refunds estimated completion tokens, e.g. when the provider call was
    /// cancelled before any tokens were generated.
    pub fn refund_tokens(&self, provider: &str, tokens: u64) {
        self.with_buckets(provider, |buckets| buckets.tpm.add_tokens(tokens));
    }

    async fn acquire_tokens(
        &self,
        provider: &str,
        resource: Resource,
        n: u64,
        deadline: Instant,
    ) -> bool {
        loop {
            let now = Instant::now();
            let wait = self.with_buckets(provider, |buckets| {
                let bucket = match resource {
                    Resource::Requests => &mut buckets.rpm,
                    Resource::Tokens => &mut buckets.tpm,
                };
                if bucket.try_consume(n, now) {
                    None
                } else {
                    Some(bucket.time_until_available(n, now))
                }
            });
            let Some(wait) = wait else {
                return true;
            };
            if now >= deadline {
                return false;
            }
            let sleep = wait.min(POLL_SLICE).min(deadline.saturating_duration_since(now));
            tokio::time::sleep(sleep.max(Duration::from_millis(1))).await;
        }
    }

    fn with_buckets<T>(&self, provider: &str, f: impl FnOnce(&mut ProviderBuckets) -> T) -> T {
        let entry = self.0.buckets.entry(provider.to_string()).or_insert_with(|| {
            let limits = self.limits(provider);
            let now = Instant::now();
            Mutex::new(ProviderBuckets {
                rpm: TokenBucket::new(limits.requests_per_minute, limits.requests_per_minute, now),
                tpm: TokenBucket::new(limits.tokens_per_minute, limits.tokens_per_minute, now),
                queue_timeout: limits.queue_timeout,
            })
        });
        let mut buckets = entry.lock().unwrap();
        f(&mut buckets)
    }

    fn limits(&self, provider: &str) -> ProviderLimits {
        self.0
            .config
            .providers
            .get(provider)
            .copied()
            .unwrap_or_default()
    }

    fn queue_timeout(&self, provider: &str) -> Duration {
        self.with_buckets(provider, |buckets| buckets.queue_timeout)
    }
}

enum Resource {
    Requests,
    Tokens,
}

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "rate_limiter")]
struct Metrics {
    /// Outcomes of rate limit acquisitions.
    #[metric(labels("provider", "outcome"))]
    acquires: prometheus::IntCounterVec,
}

impl Metrics {
    fn get() -> &'static Self {
        Self::instance(observe::metrics::get_metric_storage_registry())
            .expect("unexpected error getting metrics instance")
    }

    fn observe(&self, provider: &str, outcome: &str) {
        self.acquires.with_label_values(&[provider, outcome]).inc();
    }
}
