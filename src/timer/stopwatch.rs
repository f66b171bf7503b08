use serde::Serialize;

use crate::error::EngineError;
use crate::format::format_stopwatch;

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopwatchState {
    #[default]
    Idle,
    Running,
    Paused,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct Lap {
    pub number: u32,
    pub segment_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct LapView {
    #[serde(flatten)]
    pub lap: Lap,
    pub segment: String,
    pub total: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct StopwatchSnapshot {
    pub state: StopwatchState,
    pub elapsed_ms: u64,
    pub formatted: String,
    pub laps: Vec<LapView>,
}

/// Single stopwatch. Elapsed time is the frozen accumulator plus the
/// current run, so pause/resume never drops or double counts time.
#[derive(Debug, Clone, Default)]
pub struct Stopwatch {
    state: StopwatchState,
    accumulated_ms: u64,
    run_started_at_ms: i64,
    laps: Vec<Lap>,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> StopwatchState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == StopwatchState::Running
    }

    pub fn elapsed_ms(&self, now_ms: i64) -> u64 {
        if self.is_running() {
            let run = u64::try_from(now_ms.saturating_sub(self.run_started_at_ms)).unwrap_or(0);
            self.accumulated_ms.saturating_add(run)
        } else {
            self.accumulated_ms
        }
    }

    pub fn start(&mut self, now_ms: i64) -> bool {
        if self.is_running() {
            return false;
        }
        self.run_started_at_ms = now_ms;
        self.state = StopwatchState::Running;
        true
    }

    pub fn pause(&mut self, now_ms: i64) -> bool {
        if !self.is_running() {
            return false;
        }
        self.accumulated_ms = self.elapsed_ms(now_ms);
        self.run_started_at_ms = 0;
        self.state = StopwatchState::Paused;
        true
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn record_lap(&mut self, now_ms: i64) -> Result<Lap, EngineError> {
        if !self.is_running() {
            return Err(EngineError::StopwatchNotRunning("record a lap"));
        }
        let total_ms = self.elapsed_ms(now_ms);
        let previous_total = self.laps.first().map(|lap| lap.total_ms).unwrap_or(0);
        let lap = Lap {
            number: u32::try_from(self.laps.len() + 1).unwrap_or(u32::MAX),
            segment_ms: total_ms.saturating_sub(previous_total),
            total_ms,
        };
        self.laps.insert(0, lap);
        Ok(lap)
    }

    pub fn laps(&self) -> &[Lap] {
        &self.laps
    }

    pub fn snapshot(&self, now_ms: i64) -> StopwatchSnapshot {
        let elapsed_ms = self.elapsed_ms(now_ms);
        StopwatchSnapshot {
            state: self.state,
            elapsed_ms,
            formatted: format_stopwatch(elapsed_ms),
            laps: self
                .laps
                .iter()
                .map(|lap| LapView {
                    lap: *lap,
                    segment: format_stopwatch(lap.segment_ms),
                    total: format_stopwatch(lap.total_ms),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    #[test]
    fn pause_resume_keeps_elapsed() {
        let mut watch = Stopwatch::new();
        assert!(watch.start(1_000));
        assert!(!watch.start(1_500));
        assert!(watch.pause(3_000));
        assert_eq!(watch.elapsed_ms(10_000), 2_000);
        assert!(!watch.pause(10_000));
        assert!(watch.start(20_000));
        assert_eq!(watch.elapsed_ms(20_250), 2_250);
    }

    #[test]
    fn laps_require_running() {
        let mut watch = Stopwatch::new();
        assert_eq!(
            watch.record_lap(0),
            Err(EngineError::StopwatchNotRunning("record a lap"))
        );
        watch.start(0);
        watch.pause(100);
        assert!(watch.record_lap(200).is_err());
    }

    #[test]
    fn laps_are_prepended_with_segments() {
        let mut watch = Stopwatch::new();
        watch.start(0);
        watch.record_lap(1_500).expect("lap");
        watch.record_lap(4_000).expect("lap");
        let laps = watch.laps();
        assert_eq!(laps[0].number, 2);
        assert_eq!(laps[0].segment_ms, 2_500);
        assert_eq!(laps[1].number, 1);
        assert_eq!(laps[1].segment_ms, 1_500);

        let snap = watch.snapshot(4_010);
        assert_eq!(snap.formatted, "00:04.01");
        assert_eq!(snap.laps[0].segment, "00:02.50");

        watch.reset();
        assert!(watch.laps().is_empty());
        assert_eq!(watch.elapsed_ms(99_999), 0);
        assert_eq!(watch.state(), StopwatchState::Idle);
    }

    #[test]
    fn randomized_lap_segments_match_totals() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let mut watch = Stopwatch::new();
            let mut now = rng.gen_range(0..1_000_000_i64);
            watch.start(now);
            for _ in 0..rng.gen_range(1..30) {
                now += rng.gen_range(0..5_000_i64);
                if rng.gen_bool(0.2) {
                    watch.pause(now);
                    now += rng.gen_range(0..5_000_i64);
                    watch.start(now);
                }
                watch.record_lap(now).expect("lap while running");
            }

            // laps are newest first, so lap[i + 1] precedes lap[i]
            let laps = watch.laps();
            for pair in laps.windows(2) {
                assert_eq!(pair[0].segment_ms, pair[0].total_ms - pair[1].total_ms);
                assert_eq!(pair[0].number, pair[1].number + 1);
            }
            let first = laps.last().expect("at least one lap");
            assert_eq!(first.segment_ms, first.total_ms);
            assert_eq!(first.number, 1);
        }
    }
}
