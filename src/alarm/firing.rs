use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::alarm::model::{Alarm, SoundType, VibrationPattern};
use crate::alarm::scheduling::{AlarmSchedulingService, ScheduleOutcome};
use crate::alarm::trigger::WakePayload;
use crate::broadcast::Broadcast;
use crate::error::StoreError;
use crate::store::AlarmStore;
use crate::timer::engine::RunningTimer;

pub trait AlertSink: Send + Sync {
    fn start_sound(&self, sound: SoundType, ringtone_uri: Option<&str>) -> Result<()>;
    fn start_vibration(&self, pattern: VibrationPattern) -> Result<()>;
    fn show_alarm(&self, alarm: &Alarm);
    fn stop_alarm(&self, alarm_id: i64);
    fn timer_finished(&self, timer: &RunningTimer);
}

pub struct LoggingAlertSink;

impl AlertSink for LoggingAlertSink {
    fn start_sound(&self, sound: SoundType, ringtone_uri: Option<&str>) -> Result<()> {
        info!(sound = sound.name(), ringtone_uri, "sound started");
        Ok(())
    }

    fn start_vibration(&self, pattern: VibrationPattern) -> Result<()> {
        info!(pattern = pattern.name(), waveform = ?pattern.waveform_ms(), "vibration started");
        Ok(())
    }

    fn show_alarm(&self, alarm: &Alarm) {
        info!(alarm_id = alarm.id, label = %alarm.label, "alarm ringing");
    }

    fn stop_alarm(&self, alarm_id: i64) {
        info!(alarm_id, "alarm alert stopped");
    }

    fn timer_finished(&self, timer: &RunningTimer) {
        info!(instance_id = %timer.id, name = %timer.name, sound = timer.sound.name(), "timer finished");
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(tag = "event", content = "alarm_id", rename_all = "snake_case")]
pub enum AlertEvent {
    Dismissed(i64),
    Snoozed(i64),
}

pub type AlertBus = Broadcast<AlertEvent>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FireOutcome {
    Missing,
    Ringing { one_shot_disabled: bool },
}

pub struct FiringHandler {
    store: Arc<dyn AlarmStore>,
    scheduling: AlarmSchedulingService,
    alerts: Arc<dyn AlertSink>,
    bus: AlertBus,
}

impl FiringHandler {
    pub fn new(
        store: Arc<dyn AlarmStore>,
        scheduling: AlarmSchedulingService,
        alerts: Arc<dyn AlertSink>,
        bus: AlertBus,
    ) -> Self {
        Self {
            store,
            scheduling,
            alerts,
            bus,
        }
    }

    pub fn bus(&self) -> &AlertBus {
        &self.bus
    }

    pub fn on_fire(&self, payload: &WakePayload) -> FireOutcome {
        let alarm = match self.store.get_by_id(payload.alarm_id) {
            Ok(Some(alarm)) => alarm,
            Ok(None) => {
                error!(alarm_id = payload.alarm_id, "fired alarm no longer exists");
                return FireOutcome::Missing;
            }
            Err(err) => {
                error!(alarm_id = payload.alarm_id, error = %err, "failed to load fired alarm");
                return FireOutcome::Missing;
            }
        };

        if let Err(err) = self
            .alerts
            .start_sound(alarm.sound, alarm.ringtone_uri.as_deref())
        {
            warn!(alarm_id = alarm.id, error = %format!("{err:#}"), "failed to start alarm sound");
        }
        if let Err(err) = self.alerts.start_vibration(alarm.vibration) {
            warn!(alarm_id = alarm.id, error = %format!("{err:#}"), "failed to start vibration");
        }
        self.alerts.show_alarm(&alarm);

        let mut one_shot_disabled = false;
        if alarm.is_one_shot() && alarm.enabled {
            match self.store.set_enabled(alarm.id, false) {
                Ok(()) => {
                    one_shot_disabled = true;
                    info!(alarm_id = alarm.id, "one-shot alarm disabled after firing");
                }
                Err(err) => {
                    error!(alarm_id = alarm.id, error = %err, "failed to disable one-shot alarm");
                }
            }
        }
        FireOutcome::Ringing { one_shot_disabled }
    }

    pub fn dismiss(&self, alarm_id: i64) -> Result<ScheduleOutcome, StoreError> {
        self.alerts.stop_alarm(alarm_id);
        let outcome = match self.store.get_by_id(alarm_id)? {
            Some(alarm) if alarm.enabled && alarm.is_repeating() => self.scheduling.schedule(&alarm),
            _ => ScheduleOutcome::Skipped,
        };
        self.bus.publish(AlertEvent::Dismissed(alarm_id));
        Ok(outcome)
    }

    /// Stops the alert and arms a one-off wake `snooze_minutes` after the
    /// alarm's time of day. The stored alarm is left untouched.
    pub fn snooze(&self, alarm_id: i64) -> Result<ScheduleOutcome, StoreError> {
        let alarm = self
            .store
            .get_by_id(alarm_id)?
            .ok_or(StoreError::NotFound(alarm_id))?;
        if !alarm.snooze_enabled {
            warn!(alarm_id, "snooze disabled for alarm; dismissing instead");
            return self.dismiss(alarm_id);
        }
        self.alerts.stop_alarm(alarm_id);
        let outcome = self.scheduling.schedule(&alarm.snoozed());
        info!(alarm_id, minutes = alarm.snooze_minutes, "alarm snoozed");
        self.bus.publish(AlertEvent::Snoozed(alarm_id));
        Ok(outcome)
    }
}
