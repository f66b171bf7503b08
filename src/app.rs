use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use crate::alarm::calculator::{Upcoming, next_fire_time, upcoming};
use crate::alarm::firing::{AlertBus, AlertSink, FiringHandler, LoggingAlertSink};
use crate::alarm::model::Alarm;
use crate::alarm::scheduling::{AlarmSchedulingService, RestoreReport, ScheduleOutcome};
use crate::alarm::trigger::{InProcessWakeScheduler, WakePayload};
use crate::clock::SharedClock;
use crate::config::AppSettings;
use crate::continuity::{ContinuityProcess, JsonMirror, NoopContinuity};
use crate::error::{CommandError, StoreError};
use crate::store::{AlarmStore, PresetStore, SqliteStore, TimerPreset};
use crate::timer::engine::TimerView;
use crate::timer::service::TimerService;

#[derive(Clone)]
pub struct AlarmCommands {
    store: Arc<dyn AlarmStore>,
    scheduling: AlarmSchedulingService,
    clock: SharedClock,
}

impl AlarmCommands {
    pub fn new(
        store: Arc<dyn AlarmStore>,
        scheduling: AlarmSchedulingService,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            scheduling,
            clock,
        }
    }

    pub fn add(&self, alarm: &Alarm) -> Result<(Alarm, ScheduleOutcome), StoreError> {
        let id = self.store.insert(alarm)?;
        let saved = self.get(id)?;
        let outcome = self.scheduling.schedule(&saved);
        info!(alarm_id = id, time = %saved.time.format("%H:%M"), "alarm added");
        Ok((saved, outcome))
    }

    pub fn update(&self, alarm: &Alarm) -> Result<ScheduleOutcome, StoreError> {
        self.store.update(alarm)?;
        self.scheduling.cancel(alarm.id);
        let saved = self.get(alarm.id)?;
        Ok(self.scheduling.schedule(&saved))
    }

    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.scheduling.cancel(id);
        self.store.delete_by_id(id)?;
        info!(alarm_id = id, "alarm deleted");
        Ok(())
    }

    pub fn toggle(&self, id: i64, enabled: bool) -> Result<ScheduleOutcome, StoreError> {
        self.store.set_enabled(id, enabled)?;
        if enabled {
            let alarm = self.get(id)?;
            Ok(self.scheduling.schedule(&alarm))
        } else {
            self.scheduling.cancel(id);
            Ok(ScheduleOutcome::Skipped)
        }
    }

    pub fn get(&self, id: i64) -> Result<Alarm, StoreError> {
        self.store.get_by_id(id)?.ok_or(StoreError::NotFound(id))
    }

    pub fn list(&self) -> Result<Vec<Alarm>, StoreError> {
        self.store.get_all()
    }

    pub fn next_fires(&self) -> Result<Vec<(Alarm, NaiveDateTime)>, StoreError> {
        let now = self.now();
        let mut fires: Vec<(Alarm, NaiveDateTime)> = self
            .store
            .get_enabled()?
            .into_iter()
            .map(|alarm| {
                let next = next_fire_time(&alarm, now);
                (alarm, next)
            })
            .collect();
        fires.sort_by_key(|(alarm, next)| (*next, alarm.id));
        Ok(fires)
    }

    pub fn upcoming(&self) -> Result<Upcoming, StoreError> {
        Ok(upcoming(&self.store.get_enabled()?, self.now()))
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now_local().naive_local()
    }
}

#[derive(Clone)]
pub struct PresetCommands {
    store: Arc<dyn PresetStore>,
    timers: Arc<TimerService>,
}

impl PresetCommands {
    pub fn new(store: Arc<dyn PresetStore>, timers: Arc<TimerService>) -> Self {
        Self { store, timers }
    }

    pub fn list(&self) -> Result<Vec<TimerPreset>, StoreError> {
        self.store.get_all_presets()
    }

    pub fn save(&self, preset: &TimerPreset) -> Result<TimerPreset, StoreError> {
        let id = if preset.id == 0 {
            self.store.insert_preset(preset)?
        } else {
            self.store.update_preset(preset)?;
            preset.id
        };
        self.store.get_preset(id)?.ok_or(StoreError::NotFound(id))
    }

    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.store.delete_preset(id)
    }

    /// Starts a timer from the preset and bumps its usage count. A failed
    /// usage update does not stop the timer.
    pub fn start(&self, id: i64) -> Result<TimerView, CommandError> {
        let preset = self.store.get_preset(id)?.ok_or(StoreError::NotFound(id))?;
        let view = self.timers.start_from_preset(preset)?;
        if let Err(err) = self.store.increment_usage(id) {
            warn!(preset_id = id, error = %err, "failed to record preset usage");
        }
        Ok(view)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    pub db_path: PathBuf,
    pub allow_destructive_migration: bool,
    pub mirror_path: Option<PathBuf>,
}

pub struct App {
    pub settings: AppSettings,
    pub clock: SharedClock,
    pub alarms: AlarmCommands,
    pub presets: PresetCommands,
    pub timers: Arc<TimerService>,
    pub firing: Arc<FiringHandler>,
    pub scheduling: AlarmSchedulingService,
    wake: Arc<InProcessWakeScheduler>,
    fire_thread: Option<JoinHandle<()>>,
}

impl App {
    pub fn start(options: &AppOptions, settings: AppSettings, clock: SharedClock) -> Result<Self> {
        let store = SqliteStore::open(&options.db_path, options.allow_destructive_migration)
            .with_context(|| format!("failed to open database {}", options.db_path.display()))?;
        let continuity: Box<dyn ContinuityProcess> = match &options.mirror_path {
            Some(path) => {
                info!(path = %path.display(), "mirroring timer state");
                Box::new(JsonMirror::start(path, Arc::clone(&clock)))
            }
            None => Box::new(NoopContinuity),
        };
        Ok(Self::assemble(
            Arc::new(store),
            settings,
            clock,
            continuity,
            Arc::new(LoggingAlertSink),
        ))
    }

    pub fn assemble(
        store: Arc<SqliteStore>,
        settings: AppSettings,
        clock: SharedClock,
        continuity: Box<dyn ContinuityProcess>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let (wake, wakes) = InProcessWakeScheduler::start(Arc::clone(&clock));
        let wake = Arc::new(wake);
        let scheduling = AlarmSchedulingService::with_retry(
            Arc::clone(&wake) as _,
            Arc::clone(&clock),
            settings.retry_policy(),
        );
        let firing = Arc::new(FiringHandler::new(
            Arc::clone(&store) as _,
            scheduling.clone(),
            Arc::clone(&alerts),
            AlertBus::new(),
        ));
        let fire_thread = spawn_fire_loop(Arc::clone(&firing), wakes);
        let timers = Arc::new(TimerService::spawn(
            Arc::clone(&clock),
            continuity,
            alerts,
            settings.tick_config(),
        ));

        Self {
            alarms: AlarmCommands::new(Arc::clone(&store) as _, scheduling.clone(), Arc::clone(&clock)),
            presets: PresetCommands::new(store as _, Arc::clone(&timers)),
            settings,
            clock,
            timers,
            firing,
            scheduling,
            wake,
            fire_thread,
        }
    }

    pub fn restore(&self) -> Result<RestoreReport, StoreError> {
        self.scheduling.restore_from_store(self.alarms.store.as_ref())
    }

    pub fn wake_scheduler(&self) -> &InProcessWakeScheduler {
        &self.wake
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.wake.shutdown();
        if let Some(join) = self.fire_thread.take() {
            let _ = join.join();
        }
        self.timers.shutdown();
        debug!("app stopped");
    }
}

fn spawn_fire_loop(firing: Arc<FiringHandler>, wakes: Receiver<WakePayload>) -> Option<JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name("alarm-fire".to_string())
        .spawn(move || {
            for payload in wakes {
                let outcome = firing.on_fire(&payload);
                debug!(alarm_id = payload.alarm_id, ?outcome, "wake handled");
            }
        });
    match spawned {
        Ok(join) => Some(join),
        Err(err) => {
            warn!(error = %err, "failed to spawn alarm fire loop; alarms will not ring");
            None
        }
    }
}
