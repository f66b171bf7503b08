use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};

const SYNC_INTERVAL_MS: i64 = 250;
const HARD_RESYNC_THRESHOLD_MS: i64 = 150;
const MAX_SLEW_MS_PER_SECOND: i64 = 4;

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;

    fn now_local(&self) -> DateTime<Local> {
        Local
            .timestamp_millis_opt(self.now_ms())
            .single()
            .unwrap_or_else(Local::now)
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// `Instant`-based time anchored to the wall clock. Large drift is applied at
/// once on resync, small drift is slewed.
pub struct SystemClock {
    wall_anchor_ms: i64,
    monotonic_anchor: Instant,
    correction_ms: AtomicI64,
    last_sync_elapsed_ms: AtomicI64,
    last_output_ms: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        let wall_anchor_ms = wall_now_ms();
        Self {
            wall_anchor_ms,
            monotonic_anchor: Instant::now(),
            correction_ms: AtomicI64::new(0),
            last_sync_elapsed_ms: AtomicI64::new(0),
            last_output_ms: AtomicI64::new(wall_anchor_ms),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }

    fn maybe_update_sync_correction(&self, elapsed_ms: i64, estimated_now_ms: i64) -> i64 {
        let previous_sync_elapsed = self.last_sync_elapsed_ms.load(Ordering::Relaxed);
        let delta_since_sync_ms = elapsed_ms.saturating_sub(previous_sync_elapsed);
        if delta_since_sync_ms < SYNC_INTERVAL_MS {
            return 0;
        }

        if self
            .last_sync_elapsed_ms
            .compare_exchange(
                previous_sync_elapsed,
                elapsed_ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return 0;
        }

        let error_ms = wall_now_ms() - estimated_now_ms;
        let adjustment_ms = if error_ms.abs() >= HARD_RESYNC_THRESHOLD_MS {
            error_ms
        } else {
            let max_step_ms = (MAX_SLEW_MS_PER_SECOND * delta_since_sync_ms / 1_000).max(1);
            (error_ms / 4).clamp(-max_step_ms, max_step_ms)
        };
        if adjustment_ms != 0 {
            self.correction_ms.fetch_add(adjustment_ms, Ordering::Relaxed);
        }
        adjustment_ms
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        let elapsed_ms =
            i64::try_from(self.monotonic_anchor.elapsed().as_millis()).unwrap_or(i64::MAX);
        let estimated_now_ms =
            self.wall_anchor_ms + elapsed_ms + self.correction_ms.load(Ordering::Relaxed);
        let proposed = estimated_now_ms + self.maybe_update_sync_correction(elapsed_ms, estimated_now_ms);
        let previous = self.last_output_ms.fetch_max(proposed, Ordering::Relaxed);
        previous.max(proposed)
    }
}

fn wall_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Settable clock. Clones share the same underlying instant, which lets a
/// test hold one handle while the engine holds another.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now_ms: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: Arc::new(AtomicI64::new(now_ms)),
        }
    }

    pub fn at_local(naive: NaiveDateTime) -> Self {
        let ms = Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.timestamp_millis())
            .unwrap_or_else(|| naive.and_utc().timestamp_millis());
        Self::new(ms)
    }

    pub fn set_ms(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let first = clock.now_ms();
        thread::sleep(Duration::from_millis(2));
        let second = clock.now_ms();
        assert!(second >= first);
    }

    #[test]
    fn system_clock_tracks_wall_time() {
        let clock = SystemClock::new();
        let drift = (clock.now_ms() - wall_now_ms()).abs();
        assert!(drift < 1_000, "drift was {drift} ms");
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();
        clock.advance(Duration::from_secs(90));
        assert_eq!(other.now_ms(), 91_000);
        other.set_ms(5);
        assert_eq!(clock.now_ms(), 5);
    }

    #[test]
    fn manual_clock_at_local_round_trips() {
        let naive = NaiveDate::from_ymd_opt(2026, 1, 14)
            .expect("date")
            .and_hms_opt(7, 0, 0)
            .expect("time");
        let clock = ManualClock::at_local(naive);
        assert_eq!(clock.now_local().naive_local(), naive);
    }
}
