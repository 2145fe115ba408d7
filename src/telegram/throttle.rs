//! Outbound call throttling.
//!
//! A [`Throttler`] spaces out call starts by a minimum interval, optionally
//! caps how many calls may be in flight, and optionally enforces a
//! refreshing quota window (reservoir). Throttlers chain: a per-recipient
//! limiter admits a call first, then its account-wide parent must admit it
//! too. Admission is FIFO — waiters hold the pacing mutex through their
//! sleep, and the tokio mutex hands it over in queue order.

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Duration, Instant};

/// Refreshing quota window: at most `capacity` admissions per
/// `refresh_interval`.
#[derive(Debug, Clone, Copy)]
pub struct ReservoirOptions {
    pub capacity: u32,
    pub refresh_interval: Duration,
}

/// Shape of one throttling stage.
#[derive(Debug, Clone, Copy)]
pub struct ThrottlerOptions {
    /// Minimum gap between consecutive admissions.
    pub min_interval: Duration,
    /// Maximum calls in flight at once (admission-to-permit-drop), if any.
    pub max_concurrent: Option<usize>,
    pub reservoir: Option<ReservoirOptions>,
}

struct PacingState {
    last_admitted_at: Option<Instant>,
    reservoir_remaining: u32,
    reservoir_refreshed_at: Option<Instant>,
}

/// One stage of the outbound throttling chain.
pub struct Throttler {
    options: ThrottlerOptions,
    semaphore: Option<Arc<Semaphore>>,
    pacing: Mutex<PacingState>,
    parent: Option<Arc<Throttler>>,
}

/// Proof of admission. Holding it occupies a concurrency slot on every stage
/// that caps concurrency; drop it when the guarded call has completed.
#[derive(Default)]
pub struct ThrottlePermit {
    permits: Vec<OwnedSemaphorePermit>,
}

impl Throttler {
    pub fn new(options: ThrottlerOptions) -> Arc<Self> {
        Self::build(options, None)
    }

    /// A stage that must also be admitted by `parent` before a call starts.
    pub fn with_parent(options: ThrottlerOptions, parent: Arc<Throttler>) -> Arc<Self> {
        Self::build(options, Some(parent))
    }

    fn build(options: ThrottlerOptions, parent: Option<Arc<Throttler>>) -> Arc<Self> {
        let reservoir_remaining = options.reservoir.map_or(0, |r| r.capacity);
        Arc::new(Self {
            options,
            semaphore: options.max_concurrent.map(|n| Arc::new(Semaphore::new(n))),
            pacing: Mutex::new(PacingState {
                last_admitted_at: None,
                reservoir_remaining,
                reservoir_refreshed_at: None,
            }),
            parent,
        })
    }

    /// Wait until every stage of the chain admits one call.
    pub async fn acquire(&self) -> ThrottlePermit {
        let mut permit = ThrottlePermit::default();
        let mut stage = Some(self);
        while let Some(throttler) = stage {
            throttler.admit(&mut permit).await;
            stage = throttler.parent.as_deref();
        }
        permit
    }

    async fn admit(&self, permit: &mut ThrottlePermit) {
        if let Some(semaphore) = &self.semaphore {
            if let Ok(slot) = Arc::clone(semaphore).acquire_owned().await {
                permit.permits.push(slot);
            }
        }

        let mut pacing = self.pacing.lock().await;

        if let Some(reservoir) = self.options.reservoir {
            let now = Instant::now();
            let refreshed_at = *pacing.reservoir_refreshed_at.get_or_insert(now);
            if now.duration_since(refreshed_at) >= reservoir.refresh_interval {
                pacing.reservoir_remaining = reservoir.capacity;
                pacing.reservoir_refreshed_at = Some(now);
            }
            if pacing.reservoir_remaining == 0 {
                sleep_until(refreshed_at + reservoir.refresh_interval).await;
                pacing.reservoir_remaining = reservoir.capacity;
                pacing.reservoir_refreshed_at = Some(Instant::now());
            }
            pacing.reservoir_remaining = pacing.reservoir_remaining.saturating_sub(1);
        }

        if let Some(last) = pacing.last_admitted_at {
            sleep_until(last + self.options.min_interval).await;
        }
        pacing.last_admitted_at = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(min_interval: Duration) -> Arc<Throttler> {
        Throttler::new(ThrottlerOptions {
            min_interval,
            max_concurrent: None,
            reservoir: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn spaces_admissions_by_min_interval() {
        let throttler = plain(Duration::from_secs(1));
        let start = Instant::now();
        drop(throttler.acquire().await);
        assert_eq!(start.elapsed(), Duration::ZERO);
        drop(throttler.acquire().await);
        assert!(start.elapsed() >= Duration::from_secs(1));
        drop(throttler.acquire().await);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn reservoir_blocks_until_refresh() {
        let throttler = Throttler::new(ThrottlerOptions {
            min_interval: Duration::ZERO,
            max_concurrent: None,
            reservoir: Some(ReservoirOptions {
                capacity: 2,
                refresh_interval: Duration::from_secs(60),
            }),
        });

        let start = Instant::now();
        drop(throttler.acquire().await);
        drop(throttler.acquire().await);
        assert!(start.elapsed() < Duration::from_secs(1));

        drop(throttler.acquire().await);
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn chained_throttler_obeys_parent_interval() {
        let parent = plain(Duration::from_secs(2));
        let child = Throttler::with_parent(
            ThrottlerOptions {
                min_interval: Duration::ZERO,
                max_concurrent: None,
                reservoir: None,
            },
            parent,
        );

        let start = Instant::now();
        drop(child.acquire().await);
        drop(child.acquire().await);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_cap_holds_until_permit_drop() {
        let throttler = Throttler::new(ThrottlerOptions {
            min_interval: Duration::ZERO,
            max_concurrent: Some(1),
            reservoir: None,
        });

        let first = throttler.acquire().await;

        let contender = tokio::spawn({
            let throttler = Arc::clone(&throttler);
            async move {
                drop(throttler.acquire().await);
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!contender.is_finished());

        drop(first);
        contender.await.unwrap();
    }
}
