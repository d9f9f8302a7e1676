//! Per-source request gate with four simultaneous windows.
//!
//! Buckets live in the store, not in memory, so separate worker processes
//! share one budget. Every counter change is a CAS on the bucket version.

pub mod window;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, warn};

use leadgen_common::{
    PipelineError, PipelineResult, RateLimitBucket, RateLimits, SourceType,
};

use crate::clock::Clock;
use crate::store::RateLimitStore;
use crate::views::{self, RateLimitStatusRow};

pub use window::Decision;

const MAX_CAS_ATTEMPTS: usize = 16;

/// Floor for the sleep between acquire attempts.
const MIN_POLL: std::time::Duration = std::time::Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Allowed,
    /// Denial is not an error. The caller defers the work, it never drops it.
    Denied { retry_after: Duration },
}

impl Acquire {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Acquire::Allowed)
    }
}

pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    limits: BTreeMap<String, RateLimits>,
    default_limits: RateLimits,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
        limits: BTreeMap<String, RateLimits>,
        default_limits: RateLimits,
    ) -> Self {
        Self {
            store,
            clock,
            limits,
            default_limits,
        }
    }

    fn limits_for(&self, source_type: SourceType) -> RateLimits {
        self.limits
            .get(source_type.as_str())
            .copied()
            .unwrap_or(self.default_limits)
    }

    async fn load_bucket(
        &self,
        source_type: SourceType,
        source_key: &str,
    ) -> PipelineResult<RateLimitBucket> {
        if let Some(bucket) = self.store.get_bucket(source_type, source_key).await? {
            return Ok(bucket);
        }
        let fresh = RateLimitBucket::new(
            source_type,
            source_key,
            self.limits_for(source_type),
            self.clock.now(),
        );
        debug!(source_type = %source_type, source_key, "Creating rate limit bucket");
        Ok(self.store.insert_bucket_if_absent(fresh).await?)
    }

    /// Count one request if every window allows it.
    pub async fn try_acquire(
        &self,
        source_type: SourceType,
        source_key: &str,
    ) -> PipelineResult<Acquire> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let mut bucket = self.load_bucket(source_type, source_key).await?;
            let expected = bucket.version;
            bucket.limits = self.limits_for(source_type);
            window::roll_windows(&mut bucket, now);

            if let Decision::Deny { retry_after } = window::evaluate(&bucket, now) {
                debug!(
                    source_type = %source_type,
                    source_key,
                    retry_after_ms = retry_after.num_milliseconds(),
                    throttled = bucket.is_throttled,
                    "Rate limit denied request"
                );
                return Ok(Acquire::Denied { retry_after });
            }

            window::record_request(&mut bucket, now);
            if self.store.update_bucket(&bucket, expected).await? {
                return Ok(Acquire::Allowed);
            }
        }
        Err(PipelineError::Conflict(format!(
            "rate limit bucket {source_type}:{source_key} is too contended"
        )))
    }

    /// Keep trying until allowed or until the next wait would exceed `max_wait`
    /// (`None` waits indefinitely). Holds nothing while sleeping.
    pub async fn acquire_within(
        &self,
        source_type: SourceType,
        source_key: &str,
        max_wait: Option<std::time::Duration>,
    ) -> PipelineResult<Acquire> {
        let mut waited = std::time::Duration::ZERO;
        loop {
            let decision = self.try_acquire(source_type, source_key).await?;
            let Acquire::Denied { retry_after } = decision else {
                return Ok(decision);
            };
            let sleep = retry_after
                .to_std()
                .unwrap_or(std::time::Duration::ZERO)
                .max(MIN_POLL);
            if max_wait.is_some_and(|max| waited + sleep > max) {
                return Ok(decision);
            }
            tokio::time::sleep(sleep).await;
            waited += sleep;
        }
    }

    pub async fn acquire(&self, source_type: SourceType, source_key: &str) -> PipelineResult<()> {
        self.acquire_within(source_type, source_key, None).await?;
        Ok(())
    }

    /// Clear the error streak after a successful upstream call.
    pub async fn on_success(&self, source_type: SourceType, source_key: &str) -> PipelineResult<()> {
        self.update(source_type, source_key, |bucket, _| {
            if bucket.consecutive_errors == 0 {
                return false;
            }
            bucket.consecutive_errors = 0;
            true
        })
        .await
    }

    /// Record an upstream failure. `throttle_for` (from a 429) blocks the bucket
    /// regardless of window state until it elapses.
    pub async fn on_failure(
        &self,
        source_type: SourceType,
        source_key: &str,
        throttle_for: Option<Duration>,
    ) -> PipelineResult<()> {
        self.update(source_type, source_key, |bucket, now| {
            bucket.consecutive_errors += 1;
            // An open-ended throttle is never narrowed to a deadline.
            let open_ended = bucket.is_throttled && bucket.throttled_until.is_none();
            if let (Some(throttle_for), false) = (throttle_for, open_ended) {
                let until = now + throttle_for;
                bucket.is_throttled = true;
                bucket.throttled_until = Some(bucket.throttled_until.map_or(until, |t| t.max(until)));
            }
            true
        })
        .await?;

        match throttle_for {
            Some(d) => warn!(
                source_type = %source_type,
                source_key,
                throttle_secs = d.num_seconds(),
                "Source throttled after upstream rate limit"
            ),
            None => info!(source_type = %source_type, source_key, "Recorded source failure"),
        }
        Ok(())
    }

    async fn update<F>(&self, source_type: SourceType, source_key: &str, mut apply: F) -> PipelineResult<()>
    where
        F: FnMut(&mut RateLimitBucket, chrono::DateTime<chrono::Utc>) -> bool + Send,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let mut bucket = self.load_bucket(source_type, source_key).await?;
            let expected = bucket.version;
            window::roll_windows(&mut bucket, now);
            if !apply(&mut bucket, now) {
                return Ok(());
            }
            if self.store.update_bucket(&bucket, expected).await? {
                return Ok(());
            }
        }
        Err(PipelineError::Conflict(format!(
            "rate limit bucket {source_type}:{source_key} is too contended"
        )))
    }

    /// One row per bucket, windows rolled to the current instant.
    pub async fn status(&self) -> PipelineResult<Vec<RateLimitStatusRow>> {
        views::rate_limit_status(self.store.as_ref(), self.clock.now()).await
    }
}
