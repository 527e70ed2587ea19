// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backoff-and-retry for storage operations.
//!
//! SQLite can momentarily refuse work: `SQLITE_BUSY` under lock contention,
//! or a cache file still held by a dying process. Two schedules cover the
//! two places that matters here. Opening the database keeps attempts short
//! so a bad path or permission problem surfaces within seconds; a single
//! statement gets a couple of quick retries before the error reaches the
//! caller.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

/// An exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay inserted before the second attempt.
    pub first_delay: Duration,
    /// Upper bound any single delay may grow to.
    pub cap: Duration,
    /// Multiplier applied to the delay after each failure.
    pub growth: f64,
    /// Total attempts, the first one included.
    pub attempts: u32,
}

impl Backoff {
    /// Schedule for opening the cache database.
    #[must_use]
    pub fn open_database() -> Self {
        Self {
            attempts: 5,
            first_delay: Duration::from_millis(200),
            cap: Duration::from_secs(2),
            growth: 2.0,
        }
    }

    /// Schedule for one SQL statement. Rides out brief lock contention,
    /// then lets the caller handle the failure.
    #[must_use]
    pub fn statement() -> Self {
        Self {
            attempts: 3,
            first_delay: Duration::from_millis(100),
            cap: Duration::from_secs(2),
            growth: 2.0,
        }
    }

    /// No real sleeping in unit tests.
    #[cfg(test)]
    fn immediate() -> Self {
        Self {
            attempts: 3,
            first_delay: Duration::from_millis(1),
            cap: Duration::from_millis(4),
            growth: 2.0,
        }
    }

    /// The delay that precedes `attempt` (1-based; the first attempt starts
    /// immediately).
    fn delay_before(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2);
        self.first_delay
            .mul_f64(self.growth.powi(exponent as i32))
            .min(self.cap)
    }
}

/// Drive `operation` until it succeeds or the schedule runs out, sleeping
/// between attempts. The final error is handed back unchanged.
pub async fn with_backoff<F, Fut, T, E>(
    label: &str,
    schedule: &Backoff,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let total = schedule.attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("{label} recovered on attempt {attempt}/{total}");
                }
                return Ok(value);
            }
            Err(err) if attempt < total => {
                let delay = schedule.delay_before(attempt + 1);
                warn!("{label} failed on attempt {attempt}/{total}: {err}; backing off {delay:?}");
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `until` calls, numbering each failure.
    struct Flaky {
        calls: AtomicU32,
        until: u32,
    }

    impl Flaky {
        fn new(until: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                until,
            }
        }

        async fn poke(&self) -> Result<u32, String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.until {
                Err(format!("flake #{call}"))
            } else {
                Ok(call)
            }
        }
    }

    #[tokio::test]
    async fn single_clean_attempt() {
        let flaky = Flaky::new(0);
        let result = with_backoff("op", &Backoff::immediate(), || flaky.poke()).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_midway_through_the_schedule() {
        let flaky = Flaky::new(2);
        let result = with_backoff("op", &Backoff::immediate(), || flaky.poke()).await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_the_last_error() {
        let flaky = Flaky::new(u32::MAX);
        let result = with_backoff("op", &Backoff::immediate(), || flaky.poke()).await;
        // Three attempts, and the error we see is the third one's.
        assert_eq!(result.unwrap_err(), "flake #3");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn delays_double_from_the_second_attempt() {
        let schedule = Backoff {
            first_delay: Duration::from_millis(100),
            cap: Duration::from_secs(60),
            growth: 2.0,
            attempts: 5,
        };
        assert_eq!(schedule.delay_before(2), Duration::from_millis(100));
        assert_eq!(schedule.delay_before(3), Duration::from_millis(200));
        assert_eq!(schedule.delay_before(4), Duration::from_millis(400));
        assert_eq!(schedule.delay_before(5), Duration::from_millis(800));
    }

    #[test]
    fn delays_never_exceed_the_cap() {
        let schedule = Backoff {
            first_delay: Duration::from_secs(1),
            cap: Duration::from_secs(3),
            growth: 10.0,
            attempts: 6,
        };
        assert_eq!(schedule.delay_before(2), Duration::from_secs(1));
        assert_eq!(schedule.delay_before(3), Duration::from_secs(3));
        assert_eq!(schedule.delay_before(6), Duration::from_secs(3));
    }

    #[test]
    fn presets_fit_their_call_sites() {
        // Opening the database fails fast; statements retry even faster.
        let open = Backoff::open_database();
        assert_eq!(open.attempts, 5);
        let stmt = Backoff::statement();
        assert_eq!(stmt.attempts, 3);
        assert!(stmt.first_delay < open.first_delay);
    }
}
