//! Outbound request budget and attachment download slots.
//!
//! [`RateLimiter`] is one token bucket shared by every peer run of the
//! engine, so catching up on many peers at once stays within a fixed
//! request rate. [`Bulkhead`] caps how many attachments one accession
//! downloads at the same time.
//!
//! ```rust,no_run
//! # async fn example() -> chronicle_replication::Result<()> {
//! use chronicle_replication::resilience::{Bulkhead, RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig { burst_size: 20, refill_rate: 50 });
//! limiter.acquire().await;
//!
//! let slots = Bulkhead::new(8);
//! let _slot = slots.acquire().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Token bucket shape: `refill_rate` requests per second sustained, up to
/// `burst_size` at once. Zero is treated as one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

/// Request budget shared by all peers.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Wait until the next request may go out. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Fixed number of download slots.
#[derive(Debug)]
pub struct Bulkhead {
    slots: Semaphore,
}

impl Bulkhead {
    /// At least one slot, even for `0`.
    pub fn new(slots: usize) -> Self {
        Self {
            slots: Semaphore::new(slots.max(1)),
        }
    }

    /// Wait for a free slot; it is released when the permit drops.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        self.slots
            .acquire()
            .await
            .map_err(|_| ReplicationError::Internal("attachment download slots closed".into()))
    }
}
