use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alarm::model::{SoundType, VibrationPattern};
use crate::error::EngineError;
use crate::format::format_countdown;
use crate::store::{TimerPreset, display_name_or_duration};

pub const ONE_MINUTE_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerState {
    Idle,
    Running,
    Paused,
    Finished,
}

impl TimerState {
    fn display_rank(self) -> u8 {
        match self {
            TimerState::Running => 0,
            TimerState::Paused => 1,
            TimerState::Finished => 2,
            TimerState::Idle => 3,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TimerSpec {
    #[serde(default)]
    pub name: String,
    pub duration_secs: u64,
    #[serde(default)]
    pub sound: SoundType,
    #[serde(default)]
    pub vibration: VibrationPattern,
    #[serde(default)]
    pub ringtone_uri: Option<String>,
}

impl TimerSpec {
    pub fn new(name: impl Into<String>, duration_secs: u64) -> Self {
        Self {
            name: name.into(),
            duration_secs,
            sound: SoundType::Default,
            vibration: VibrationPattern::Default,
            ringtone_uri: None,
        }
    }

    fn duration_ms(&self) -> Result<u64, EngineError> {
        if self.duration_secs == 0 {
            return Err(EngineError::ZeroDuration);
        }
        Ok(self.duration_secs.saturating_mul(1_000))
    }
}

impl From<&TimerPreset> for TimerSpec {
    fn from(preset: &TimerPreset) -> Self {
        Self {
            name: preset.name.clone(),
            duration_secs: preset.duration_seconds,
            sound: preset.sound,
            vibration: preset.vibration,
            ringtone_uri: preset.ringtone_uri.clone(),
        }
    }
}

/// One countdown owned by the engine.
///
/// While `Running`, `target_end_ms` is authoritative and `remaining_ms` is
/// the value from the last tick. In every other state `target_end_ms` is 0
/// and `remaining_ms` is frozen.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct RunningTimer {
    pub id: String,
    pub preset_id: i64,
    pub name: String,
    pub total_ms: u64,
    pub remaining_ms: u64,
    pub state: TimerState,
    pub sound: SoundType,
    pub vibration: VibrationPattern,
    pub ringtone_uri: Option<String>,
    pub target_end_ms: i64,
}

impl RunningTimer {
    fn new(preset_id: i64, spec: &TimerSpec, now_ms: i64) -> Result<Self, EngineError> {
        let duration_ms = spec.duration_ms()?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            preset_id,
            name: display_name_or_duration(&spec.name, spec.duration_secs),
            total_ms: duration_ms,
            remaining_ms: duration_ms,
            state: TimerState::Running,
            sound: spec.sound,
            vibration: spec.vibration,
            ringtone_uri: spec.ringtone_uri.clone(),
            target_end_ms: now_ms.saturating_add(ms_to_i64(duration_ms)),
        })
    }

    pub fn is_running(&self) -> bool {
        self.state == TimerState::Running
    }

    pub fn remaining_at(&self, now_ms: i64) -> u64 {
        if self.is_running() {
            remaining_until(self.target_end_ms, now_ms).min(self.total_ms)
        } else {
            self.remaining_ms
        }
    }

    pub fn progress(&self) -> f64 {
        if self.total_ms == 0 {
            return 0.0;
        }
        self.remaining_ms as f64 / self.total_ms as f64
    }

    pub fn formatted(&self) -> String {
        format_countdown(self.remaining_ms)
    }

    fn apply_spec(&mut self, spec: &TimerSpec) -> Result<(), EngineError> {
        let duration_ms = spec.duration_ms()?;
        self.name = display_name_or_duration(&spec.name, spec.duration_secs);
        self.total_ms = duration_ms;
        self.remaining_ms = duration_ms;
        self.sound = spec.sound;
        self.vibration = spec.vibration;
        self.ringtone_uri = spec.ringtone_uri.clone();
        self.target_end_ms = 0;
        self.state = TimerState::Idle;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimerView {
    #[serde(flatten)]
    pub timer: RunningTimer,
    pub progress: f64,
    pub formatted: String,
}

fn remaining_until(target_end_ms: i64, now_ms: i64) -> u64 {
    u64::try_from(target_end_ms.saturating_sub(now_ms)).unwrap_or(0)
}

fn ms_to_i64(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

#[derive(Debug, Default)]
pub struct TimerEngine {
    timers: Vec<RunningTimer>,
}

impl TimerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_from_preset(
        &mut self,
        preset: &TimerPreset,
        now_ms: i64,
    ) -> Result<&RunningTimer, EngineError> {
        let timer = RunningTimer::new(preset.id, &TimerSpec::from(preset), now_ms)?;
        Ok(self.push(timer))
    }

    pub fn start_adhoc(
        &mut self,
        spec: &TimerSpec,
        now_ms: i64,
    ) -> Result<&RunningTimer, EngineError> {
        let timer = RunningTimer::new(0, spec, now_ms)?;
        Ok(self.push(timer))
    }

    fn push(&mut self, timer: RunningTimer) -> &RunningTimer {
        self.timers.push(timer);
        let last = self.timers.len() - 1;
        &self.timers[last]
    }

    pub fn pause(&mut self, id: &str, now_ms: i64) -> Result<bool, EngineError> {
        let timer = self.get_mut(id)?;
        if !timer.is_running() {
            return Ok(false);
        }
        timer.remaining_ms = timer.remaining_at(now_ms);
        timer.target_end_ms = 0;
        timer.state = TimerState::Paused;
        Ok(true)
    }

    /// Starts a paused or idle timer. Already running is a no-op; a finished
    /// timer must be acknowledged first.
    pub fn resume(&mut self, id: &str, now_ms: i64) -> Result<bool, EngineError> {
        let timer = self.get_mut(id)?;
        match timer.state {
            TimerState::Running => Ok(false),
            TimerState::Finished => Err(EngineError::InvalidState {
                id: id.to_string(),
                state: timer.state,
                op: "resume",
            }),
            TimerState::Paused | TimerState::Idle => {
                timer.target_end_ms = now_ms.saturating_add(ms_to_i64(timer.remaining_ms));
                timer.state = TimerState::Running;
                Ok(true)
            }
        }
    }

    pub fn reset(&mut self, id: &str) -> Result<(), EngineError> {
        let timer = self.get_mut(id)?;
        timer.state = TimerState::Idle;
        timer.remaining_ms = timer.total_ms;
        timer.target_end_ms = 0;
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<RunningTimer, EngineError> {
        let index = self.index_of(id)?;
        Ok(self.timers.remove(index))
    }

    /// Extends the timer by a minute. A running timer keeps its elapsed
    /// progress because the deadline moves with the total.
    pub fn add_minute(&mut self, id: &str) -> Result<(), EngineError> {
        let timer = self.get_mut(id)?;
        timer.total_ms = timer.total_ms.saturating_add(ONE_MINUTE_MS);
        timer.remaining_ms = timer.remaining_ms.saturating_add(ONE_MINUTE_MS);
        if timer.is_running() {
            timer.target_end_ms = timer.target_end_ms.saturating_add(ms_to_i64(ONE_MINUTE_MS));
        }
        Ok(())
    }

    pub fn acknowledge(&mut self, id: &str) -> Result<bool, EngineError> {
        let timer = self.get_mut(id)?;
        if timer.state != TimerState::Finished {
            return Ok(false);
        }
        timer.state = TimerState::Idle;
        timer.remaining_ms = timer.total_ms;
        timer.target_end_ms = 0;
        Ok(true)
    }

    /// Replaces duration and metadata; the timer lands in `Idle`. Running
    /// timers must be paused first.
    pub fn edit(&mut self, id: &str, spec: &TimerSpec) -> Result<(), EngineError> {
        let timer = self.get_mut(id)?;
        if timer.is_running() {
            return Err(EngineError::InvalidState {
                id: id.to_string(),
                state: timer.state,
                op: "edit",
            });
        }
        timer.apply_spec(spec)
    }

    pub fn edit_and_start(
        &mut self,
        id: &str,
        spec: &TimerSpec,
        now_ms: i64,
    ) -> Result<(), EngineError> {
        self.edit(id, spec)?;
        self.resume(id, now_ms).map(|_| ())
    }

    pub fn tick(&mut self, now_ms: i64) -> Vec<String> {
        let mut finished = Vec::new();
        for timer in self.timers.iter_mut().filter(|timer| timer.is_running()) {
            timer.remaining_ms = timer.remaining_at(now_ms);
            if timer.remaining_ms == 0 {
                timer.state = TimerState::Finished;
                timer.target_end_ms = 0;
                finished.push(timer.id.clone());
            }
        }
        finished
    }

    pub fn has_running(&self) -> bool {
        self.timers.iter().any(RunningTimer::is_running)
    }

    pub fn first_running(&self) -> Option<&RunningTimer> {
        self.timers.iter().find(|timer| timer.is_running())
    }

    pub fn get(&self, id: &str) -> Option<&RunningTimer> {
        self.timers.iter().find(|timer| timer.id == id)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn snapshot(&self, now_ms: i64) -> Vec<TimerView> {
        let mut timers: Vec<RunningTimer> = self
            .timers
            .iter()
            .cloned()
            .map(|mut timer| {
                timer.remaining_ms = timer.remaining_at(now_ms);
                timer
            })
            .collect();
        timers.sort_by_key(|timer| timer.state.display_rank());
        timers
            .into_iter()
            .map(|timer| TimerView {
                progress: timer.progress(),
                formatted: timer.formatted(),
                timer,
            })
            .collect()
    }

    fn index_of(&self, id: &str) -> Result<usize, EngineError> {
        self.timers
            .iter()
            .position(|timer| timer.id == id)
            .ok_or_else(|| EngineError::UnknownTimer(id.to_string()))
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut RunningTimer, EngineError> {
        let index = self.index_of(id)?;
        Ok(&mut self.timers[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    fn start(engine: &mut TimerEngine, secs: u64) -> String {
        engine
            .start_adhoc(&TimerSpec::new("", secs), T0)
            .expect("start")
            .id
            .clone()
    }

    #[test]
    fn start_sets_deadline_and_default_name() {
        let mut engine = TimerEngine::new();
        let timer = engine
            .start_adhoc(&TimerSpec::new("", 5_400), T0)
            .expect("start");
        assert_eq!(timer.state, TimerState::Running);
        assert_eq!(timer.total_ms, 5_400_000);
        assert_eq!(timer.remaining_ms, 5_400_000);
        assert_eq!(timer.target_end_ms, T0 + 5_400_000);
        assert_eq!(timer.name, "1h 30m");
        assert_eq!(timer.preset_id, 0);
    }

    #[test]
    fn zero_duration_is_rejected() {
        let mut engine = TimerEngine::new();
        assert_eq!(
            engine.start_adhoc(&TimerSpec::new("x", 0), T0).map(|t| t.id.clone()),
            Err(EngineError::ZeroDuration)
        );
        assert!(engine.is_empty());
    }

    #[test]
    fn remaining_follows_wall_clock_across_missed_ticks() {
        let mut engine = TimerEngine::new();
        let id = start(&mut engine, 300);
        engine.tick(T0 + 1_000);
        // no ticks for 90 seconds
        let finished = engine.tick(T0 + 90_000);
        assert!(finished.is_empty());
        assert_eq!(engine.get(&id).expect("timer").remaining_ms, 210_000);
    }

    #[test]
    fn pause_and_start_are_idempotent() {
        let mut engine = TimerEngine::new();
        let id = start(&mut engine, 60);

        assert!(!engine.resume(&id, T0 + 5_000).expect("resume"));
        assert_eq!(engine.get(&id).expect("timer").target_end_ms, T0 + 60_000);

        assert!(engine.pause(&id, T0 + 10_000).expect("pause"));
        let paused = engine.get(&id).expect("timer").clone();
        assert_eq!(paused.remaining_ms, 50_000);
        assert_eq!(paused.target_end_ms, 0);

        assert!(!engine.pause(&id, T0 + 30_000).expect("pause again"));
        assert_eq!(engine.get(&id).expect("timer"), &paused);

        assert!(engine.resume(&id, T0 + 40_000).expect("resume"));
        assert_eq!(engine.get(&id).expect("timer").target_end_ms, T0 + 90_000);
    }

    #[test]
    fn finishing_reports_ids_once() {
        let mut engine = TimerEngine::new();
        let short = start(&mut engine, 5);
        let long = start(&mut engine, 50);

        let finished = engine.tick(T0 + 5_000);
        assert_eq!(finished, vec![short.clone()]);
        assert!(engine.tick(T0 + 6_000).is_empty());

        let timer = engine.get(&short).expect("timer");
        assert_eq!(timer.state, TimerState::Finished);
        assert_eq!(timer.remaining_ms, 0);
        assert_eq!(timer.target_end_ms, 0);
        assert!(engine.get(&long).expect("timer").is_running());
    }

    #[test]
    fn finished_timer_needs_acknowledge_before_restart() {
        let mut engine = TimerEngine::new();
        let id = start(&mut engine, 1);
        engine.tick(T0 + 1_000);
        assert!(matches!(
            engine.resume(&id, T0 + 2_000),
            Err(EngineError::InvalidState {
                state: TimerState::Finished,
                ..
            })
        ));
        assert!(engine.acknowledge(&id).expect("ack"));
        assert!(!engine.acknowledge(&id).expect("ack idle"));
        let timer = engine.get(&id).expect("timer");
        assert_eq!(timer.state, TimerState::Idle);
        assert_eq!(timer.remaining_ms, 1_000);
    }

    #[test]
    fn add_minute_extends_running_deadline() {
        let mut engine = TimerEngine::new();
        let id = start(&mut engine, 120);
        engine.tick(T0 + 30_000);
        engine.add_minute(&id).expect("extend");
        let timer = engine.get(&id).expect("timer");
        assert_eq!(timer.total_ms, 180_000);
        assert_eq!(timer.target_end_ms, T0 + 180_000);
        engine.tick(T0 + 40_000);
        assert_eq!(engine.get(&id).expect("timer").remaining_ms, 140_000);

        engine.pause(&id, T0 + 40_000).expect("pause");
        engine.add_minute(&id).expect("extend paused");
        let timer = engine.get(&id).expect("timer");
        assert_eq!(timer.remaining_ms, 200_000);
        assert_eq!(timer.total_ms, 240_000);
        assert!(timer.remaining_ms <= timer.total_ms);
    }

    #[test]
    fn edit_requires_pause_and_lands_idle() {
        let mut engine = TimerEngine::new();
        let id = start(&mut engine, 120);
        let spec = TimerSpec {
            vibration: VibrationPattern::Sos,
            ..TimerSpec::new("Pasta", 600)
        };
        assert!(matches!(
            engine.edit(&id, &spec),
            Err(EngineError::InvalidState { op: "edit", .. })
        ));

        engine.pause(&id, T0 + 10_000).expect("pause");
        engine.edit(&id, &spec).expect("edit");
        let timer = engine.get(&id).expect("timer");
        assert_eq!(timer.state, TimerState::Idle);
        assert_eq!(timer.name, "Pasta");
        assert_eq!(timer.total_ms, 600_000);
        assert_eq!(timer.remaining_ms, 600_000);
        assert_eq!(timer.vibration, VibrationPattern::Sos);

        engine
            .edit_and_start(&id, &TimerSpec::new("", 90), T0 + 20_000)
            .expect("edit and start");
        let timer = engine.get(&id).expect("timer");
        assert_eq!(timer.state, TimerState::Running);
        assert_eq!(timer.name, "1m 30s");
        assert_eq!(timer.target_end_ms, T0 + 110_000);
    }

    #[test]
    fn reset_and_remove() {
        let mut engine = TimerEngine::new();
        let id = start(&mut engine, 60);
        engine.tick(T0 + 20_000);
        engine.reset(&id).expect("reset");
        let timer = engine.get(&id).expect("timer");
        assert_eq!(
            (timer.state, timer.remaining_ms, timer.target_end_ms),
            (TimerState::Idle, 60_000, 0)
        );
        assert!(!engine.has_running());

        engine.remove(&id).expect("remove");
        assert_eq!(
            engine.remove(&id).map(|t| t.id),
            Err(EngineError::UnknownTimer(id))
        );
    }

    #[test]
    fn snapshot_orders_by_attention_then_insertion() {
        let mut engine = TimerEngine::new();
        let idle = start(&mut engine, 10);
        let finished = start(&mut engine, 1);
        let paused = start(&mut engine, 30);
        let running_a = start(&mut engine, 40);
        let running_b = start(&mut engine, 50);
        engine.reset(&idle).expect("reset");
        engine.pause(&paused, T0 + 500).expect("pause");
        engine.tick(T0 + 1_000);

        let order: Vec<String> = engine
            .snapshot(T0 + 1_000)
            .into_iter()
            .map(|view| view.timer.id)
            .collect();
        assert_eq!(order, vec![running_a, running_b, paused, finished, idle]);
    }

    #[test]
    fn snapshot_reports_progress_and_text() {
        let mut engine = TimerEngine::new();
        start(&mut engine, 200);
        let views = engine.snapshot(T0 + 50_000);
        assert_eq!(views[0].timer.remaining_ms, 150_000);
        assert!((views[0].progress - 0.75).abs() < f64::EPSILON);
        assert_eq!(views[0].formatted, "02:30");
    }

    #[test]
    fn preset_start_carries_preset_metadata() {
        let mut engine = TimerEngine::new();
        let mut preset = TimerPreset::new("Tea", 180);
        preset.id = 7;
        preset.sound = SoundType::Bell;
        let timer = engine.start_from_preset(&preset, T0).expect("start");
        assert_eq!(timer.preset_id, 7);
        assert_eq!(timer.name, "Tea");
        assert_eq!(timer.sound, SoundType::Bell);
    }
}
