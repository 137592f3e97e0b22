//! Client-side token-bucket rate limiting.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota};
use tokio_util::sync::CancellationToken;

use vaultwire_common::RateLimitSpec;

use crate::error::ClientError;

/// A token bucket admitting `rate` requests per second with bursts of up to
/// `burst` requests.
///
/// A limiter with a zero rate or a zero burst never admits anything; callers
/// waiting on it stay blocked until they cancel.
pub struct RateLimiter {
    rate: f64,
    burst: u32,
    bucket: Option<DefaultDirectRateLimiter>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .finish_non_exhaustive()
    }
}

fn quota(rate: f64, burst: u32) -> Option<Quota> {
    let burst = NonZeroU32::new(burst)?;
    if rate.is_nan() || rate <= 0.0 {
        return None;
    }
    let period = Duration::try_from_secs_f64(rate.recip())
        .ok()?
        .max(Duration::from_nanos(1));
    Quota::with_period(period).map(|quota| quota.allow_burst(burst))
}

impl RateLimiter {
    /// Create a limiter with a full bucket.
    #[must_use]
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst,
            bucket: quota(rate, burst).map(governor::RateLimiter::direct),
        }
    }

    /// Requests per second.
    #[must_use]
    pub const fn rate(&self) -> f64 {
        self.rate
    }

    /// Maximum burst.
    #[must_use]
    pub const fn burst(&self) -> u32 {
        self.burst
    }

    /// A separate limiter with the same rate and burst and a full bucket.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self::new(self.rate, self.burst)
    }

    /// Wait until a request is admitted.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Cancelled`] if `cancel` fires first.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        let Some(bucket) = &self.bucket else {
            cancel.cancelled().await;
            return Err(ClientError::Cancelled);
        };

        tokio::select! {
            () = cancel.cancelled() => Err(ClientError::Cancelled),
            () = bucket.until_ready() => Ok(()),
        }
    }
}

impl From<RateLimitSpec> for RateLimiter {
    fn from(spec: RateLimitSpec) -> Self {
        Self::new(spec.rate, spec.burst)
    }
}
