//! Minimum-interval rate limiting for the upstream provider.
//!
//! One [`RateLimiter`] is shared by everything that talks to a given upstream
//! client. Spacing comes from a `governor` quota with a burst of one, so a
//! grant is stamped the moment it is handed out and a slow upstream call
//! never inflates the spacing seen by the next caller. Concurrent waiters are
//! granted one interval apart.
//!
//! On 429 the quota is swapped for a slower one (doubling, capped at 16x);
//! after 60s with no further 429 the base quota is restored.

use std::ops::Add;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use governor::Quota;
use governor::clock::{Clock, Reference};
use governor::middleware::NoOpMiddleware;
use governor::nanos::Nanos;
use governor::state::{InMemoryState, NotKeyed};
use tokio::time::Instant;

/// Slowdown cap applied by [`RateLimiter::on_rate_limited`].
const MAX_SLOWDOWN: u32 = 16;

/// Quiet period after the last 429 before the base interval is restored.
const DECAY_AFTER: Duration = Duration::from_secs(60);

/// `governor` clock reading tokio's time source, so a paused runtime
/// drives the quota too.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TokioInstant(Instant);

impl Add<Nanos> for TokioInstant {
    type Output = TokioInstant;

    fn add(self, other: Nanos) -> TokioInstant {
        TokioInstant(self.0 + Duration::from(other))
    }
}

impl Reference for TokioInstant {
    fn duration_since(&self, earlier: Self) -> Nanos {
        Nanos::from(self.0.saturating_duration_since(earlier.0))
    }

    fn saturating_sub(&self, duration: Nanos) -> Self {
        self.0
            .checked_sub(Duration::from(duration))
            .map(TokioInstant)
            .unwrap_or(*self)
    }
}

impl Clock for TokioClock {
    type Instant = TokioInstant;

    fn now(&self) -> TokioInstant {
        TokioInstant(Instant::now())
    }
}

type DirectLimiter =
    governor::RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<TokioInstant>>;

/// Build a burst-one limiter for `period`. `None` when the period is zero.
fn direct(period: Duration) -> Option<Arc<DirectLimiter>> {
    let quota = Quota::with_period(period)?;
    Some(Arc::new(DirectLimiter::direct_with_clock(quota, TokioClock)))
}

/// Like [`direct`], but with the first cell already spent, so the next grant
/// is a full `period` away. Used when swapping quotas mid-stream.
fn primed(period: Duration) -> Option<Arc<DirectLimiter>> {
    let limiter = direct(period)?;
    let _ = limiter.check();
    Some(limiter)
}

pub struct RateLimiter {
    base_interval: Duration,
    /// Current slowdown factor (1 = normal, 2 = half rate, etc.).
    factor: AtomicU32,
    last_429: Mutex<Option<Instant>>,
    /// `None` disables spacing entirely (zero interval).
    limiter: ArcSwapOption<DirectLimiter>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            base_interval: min_interval,
            factor: AtomicU32::new(1),
            last_429: Mutex::new(None),
            limiter: ArcSwapOption::new(direct(min_interval)),
        }
    }

    /// The interval currently enforced, including any 429 slowdown.
    pub fn current_interval(&self) -> Duration {
        self.base_interval
            .saturating_mul(self.factor.load(Ordering::SeqCst))
    }

    /// Wait for permission to issue the next upstream request.
    ///
    /// Returns the grant instant. Grants are at least [`current_interval`]
    /// apart regardless of how many tasks wait concurrently.
    ///
    /// [`current_interval`]: RateLimiter::current_interval
    pub async fn wait_for_next_request(&self) -> Instant {
        self.try_decay();

        // Reload on every pass so queued waiters pick up a swapped quota.
        while let Some(limiter) = self.limiter.load_full() {
            let wait = match limiter.check() {
                Ok(()) => break,
                Err(not_until) => not_until.wait_time_from(TokioClock.now()),
            };
            tracing::trace!(wait_ms = wait.as_millis() as u64, "rate limiter wait");
            tokio::time::sleep(wait).await;
        }
        Instant::now()
    }

    /// Record a 429 from upstream. Doubles the slowdown factor and swaps in
    /// the slower quota.
    pub fn on_rate_limited(&self) {
        if let Ok(mut last) = self.last_429.lock() {
            *last = Some(Instant::now());
        }
        let previous = self
            .factor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                Some((f * 2).min(MAX_SLOWDOWN))
            })
            .unwrap_or(MAX_SLOWDOWN);
        let interval = self.current_interval();
        if previous < MAX_SLOWDOWN {
            self.limiter.store(primed(interval));
        }
        tracing::debug!(
            interval_ms = interval.as_millis() as u64,
            "upstream throttled, widening request interval"
        );
    }

    /// Restore the base quota once the provider has been quiet long enough.
    fn try_decay(&self) {
        let quiet = match self.last_429.lock() {
            Ok(last) => last.is_some_and(|t| t.elapsed() >= DECAY_AFTER),
            Err(_) => false,
        };

        if quiet && self.factor.swap(1, Ordering::SeqCst) > 1 {
            self.limiter.store(primed(self.base_interval));
            tracing::debug!("request interval restored");
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("base_interval", &self.base_interval)
            .field("factor", &self.factor.load(Ordering::SeqCst))
            .finish()
    }
}
