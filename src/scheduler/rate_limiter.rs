//! Per-source dispatch pacing.
//!
//! This module provides the [`RateLimiter`] struct which enforces a minimum
//! delay between two dispatches for the same data source. Remote archives
//! publish request-rate policies (NCBI allows a few requests per second
//! without an API key, for instance); every source gets a fixed delay that
//! keeps the tool under those limits.
//!
//! # Overview
//!
//! Pacing is applied per source, so jobs for different sources can start
//! back to back. The scheduler uses the non-blocking pair
//! [`RateLimiter::is_ready`] / [`RateLimiter::mark_dispatched`], and
//! [`RateLimiter::delay_until_ready`] to decide how long it may sleep. Job
//! builders that query remote metadata before the scheduler runs use the
//! async [`RateLimiter::acquire`], which shares the same timestamps.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use seqdd_core::scheduler::RateLimiter;
//! use seqdd_core::source::SourceKind;
//!
//! # async fn example() {
//! let limiter = RateLimiter::with_defaults();
//!
//! // First dispatch for a source is always allowed
//! assert!(limiter.is_ready(SourceKind::Ncbi));
//! limiter.mark_dispatched(SourceKind::Ncbi);
//!
//! // The next one waits for the NCBI window
//! assert!(!limiter.is_ready(SourceKind::Ncbi));
//! assert!(limiter.delay_until_ready(SourceKind::Ncbi) <= Duration::from_secs(1));
//!
//! // Other sources are independent
//! limiter.acquire(SourceKind::Sra).await;
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::source::SourceKind;

/// Warning threshold for cumulative waiting per source (30 seconds).
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Per-source dispatch pacing.
///
/// `RateLimiter` is `Send + Sync` and designed to be shared behind `Arc`
/// between the scheduler and the job builders. All state lives in a
/// `DashMap` whose shard locks are never held across an `.await`.
#[derive(Debug)]
pub struct RateLimiter {
    /// Whether pacing is disabled entirely.
    disabled: bool,

    /// Per-source state, created lazily with the source's configured delay.
    sources: DashMap<SourceKind, SourceState>,

    /// Delays configured before the first dispatch.
    delays: DashMap<SourceKind, Duration>,
}

/// State tracked for each source.
#[derive(Debug)]
struct SourceState {
    /// Minimum time between two dispatches.
    min_delay: Duration,

    /// Time of the last dispatch. `None` until the first one.
    last_dispatch: Option<Instant>,

    /// Cumulative time spent waiting in [`RateLimiter::acquire`] (milliseconds).
    cumulative_delay_ms: AtomicU64,
}

impl SourceState {
    fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            last_dispatch: None,
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        match self.last_dispatch {
            Some(last) => self
                .min_delay
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    /// Adds to the cumulative delay and returns the new total.
    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let new_total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(new_total)
    }
}

impl RateLimiter {
    /// Creates a limiter where every source starts with no delay.
    ///
    /// Use [`RateLimiter::set_delay`] to configure sources.
    #[must_use]
    pub fn new() -> Self {
        Self {
            disabled: false,
            sources: DashMap::new(),
            delays: DashMap::new(),
        }
    }

    /// Creates a limiter loaded with each source's published delay.
    #[must_use]
    #[instrument]
    pub fn with_defaults() -> Self {
        let limiter = Self::new();
        for source in SourceKind::ALL {
            limiter.set_delay(source, source.default_delay());
        }
        debug!("created rate limiter with default source delays");
        limiter
    }

    /// Creates a limiter that never delays.
    #[must_use]
    #[instrument]
    pub fn disabled() -> Self {
        debug!("creating disabled rate limiter");
        Self {
            disabled: true,
            ..Self::new()
        }
    }

    /// Returns whether pacing is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Sets the minimum delay between two dispatches for `source`.
    pub fn set_delay(&self, source: SourceKind, min_delay: Duration) {
        self.delays.insert(source, min_delay);
        if let Some(mut state) = self.sources.get_mut(&source) {
            state.min_delay = min_delay;
        }
    }

    /// Returns the minimum delay configured for `source`.
    #[must_use]
    pub fn min_delay(&self, source: SourceKind) -> Duration {
        if self.disabled {
            return Duration::ZERO;
        }
        self.delays
            .get(&source)
            .map_or(Duration::ZERO, |delay| *delay)
    }

    /// Returns true if `source` may dispatch now.
    #[must_use]
    pub fn is_ready(&self, source: SourceKind) -> bool {
        self.delay_until_ready(source).is_zero()
    }

    /// Returns how long `source` must wait before its next dispatch.
    #[must_use]
    pub fn delay_until_ready(&self, source: SourceKind) -> Duration {
        if self.disabled {
            return Duration::ZERO;
        }
        self.sources
            .get(&source)
            .map_or(Duration::ZERO, |state| state.remaining(Instant::now()))
    }

    /// Records a dispatch for `source` at the current instant.
    pub fn mark_dispatched(&self, source: SourceKind) {
        if self.disabled {
            return;
        }
        let min_delay = self.min_delay(source);
        let mut state = self
            .sources
            .entry(source)
            .or_insert_with(|| SourceState::new(min_delay));
        state.last_dispatch = Some(Instant::now());
    }

    /// Checks and records a dispatch in one step.
    ///
    /// # Errors
    ///
    /// Returns the remaining wait when the source is not ready; nothing is
    /// recorded in that case.
    pub fn try_acquire(&self, source: SourceKind) -> Result<(), Duration> {
        if self.disabled {
            return Ok(());
        }
        let min_delay = self.min_delay(source);
        let mut state = self
            .sources
            .entry(source)
            .or_insert_with(|| SourceState::new(min_delay));
        let now = Instant::now();
        let remaining = state.remaining(now);
        if remaining.is_zero() {
            state.last_dispatch = Some(now);
            Ok(())
        } else {
            Err(remaining)
        }
    }

    /// Waits for the source's window, then records a dispatch.
    ///
    /// The first request for a source proceeds immediately.
    #[instrument(skip(self), fields(source = %source))]
    pub async fn acquire(&self, source: SourceKind) {
        loop {
            let delay = match self.try_acquire(source) {
                Ok(()) => return,
                Err(delay) => delay,
            };

            let cumulative = self
                .sources
                .get(&source)
                .map_or(delay, |state| state.add_cumulative_delay(delay));
            debug!(
                source = %source,
                delay_ms = delay.as_millis(),
                cumulative_ms = cumulative.as_millis(),
                "applying rate limit delay"
            );
            if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                warn!(
                    source = %source,
                    cumulative_delay_secs = cumulative.as_secs(),
                    "excessive rate limiting - consider reducing request volume to this source"
                );
            }

            tokio::time::sleep(delay).await;
        }
    }

    /// Returns the shortest wait among `sources`, or `None` if the list is empty.
    #[must_use]
    pub fn next_window<I>(&self, sources: I) -> Option<Duration>
    where
        I: IntoIterator<Item = SourceKind>,
    {
        sources
            .into_iter()
            .map(|source| self.delay_until_ready(source))
            .min()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_defaults()
    }
}
