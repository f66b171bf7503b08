use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::alarm::calculator::next_trigger_ms;
use crate::alarm::model::Alarm;
use crate::alarm::trigger::{RegistrationError, TriggerAdapter, WakePayload};
use crate::clock::SharedClock;
use crate::error::StoreError;
use crate::store::AlarmStore;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

/// Result of one `schedule` call. Scheduling never fails the caller; every
/// problem is reported here and logged.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    Skipped,
    Registered { trigger_at_ms: i64, attempts: u32 },
    PermissionDenied,
    RetriesExhausted { attempts: u32 },
    Failed,
}

impl ScheduleOutcome {
    pub fn is_registered(self) -> bool {
        matches!(self, ScheduleOutcome::Registered { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub outcomes: Vec<(i64, ScheduleOutcome)>,
}

impl RestoreReport {
    pub fn registered(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_registered())
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.registered()
    }
}

#[derive(Clone)]
pub struct AlarmSchedulingService {
    adapter: Arc<dyn TriggerAdapter>,
    clock: SharedClock,
    retry: RetryPolicy,
}

impl AlarmSchedulingService {
    pub fn new(adapter: Arc<dyn TriggerAdapter>, clock: SharedClock) -> Self {
        Self::with_retry(adapter, clock, RetryPolicy::default())
    }

    pub fn with_retry(
        adapter: Arc<dyn TriggerAdapter>,
        clock: SharedClock,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            adapter,
            clock,
            retry: RetryPolicy {
                max_attempts: retry.max_attempts.max(1),
                delay: retry.delay,
            },
        }
    }

    pub fn schedule(&self, alarm: &Alarm) -> ScheduleOutcome {
        if !alarm.enabled {
            debug!(alarm_id = alarm.id, "alarm disabled; not scheduling");
            return ScheduleOutcome::Skipped;
        }
        if !self.adapter.can_register_exact() {
            // Alarm-clock class wakes are sometimes honored without the
            // exact permission, so the attempt still goes ahead.
            warn!(alarm_id = alarm.id, "exact wake permission not granted");
        }

        let trigger_at_ms = next_trigger_ms(alarm, &self.clock.now_local());
        let payload = WakePayload::for_alarm(alarm);

        for attempt in 1..=self.retry.max_attempts {
            match self.adapter.register_wake(trigger_at_ms, payload.clone()) {
                Ok(()) => {
                    debug!(alarm_id = alarm.id, trigger_at_ms, attempt, "alarm scheduled");
                    return ScheduleOutcome::Registered {
                        trigger_at_ms,
                        attempts: attempt,
                    };
                }
                Err(RegistrationError::PermissionDenied(reason)) => {
                    warn!(alarm_id = alarm.id, %reason, "wake registration refused; alarm left without a wake");
                    return ScheduleOutcome::PermissionDenied;
                }
                Err(RegistrationError::Transient(reason)) => {
                    warn!(alarm_id = alarm.id, attempt, %reason, "wake registration failed; retrying");
                    if attempt < self.retry.max_attempts && !self.retry.delay.is_zero() {
                        thread::sleep(self.retry.delay);
                    }
                }
                Err(RegistrationError::Unavailable(reason)) => {
                    error!(alarm_id = alarm.id, %reason, "wake facility unavailable");
                    return ScheduleOutcome::Failed;
                }
            }
        }

        error!(
            alarm_id = alarm.id,
            attempts = self.retry.max_attempts,
            "giving up on wake registration"
        );
        ScheduleOutcome::RetriesExhausted {
            attempts: self.retry.max_attempts,
        }
    }

    pub fn cancel(&self, alarm_id: i64) {
        if self.adapter.cancel(alarm_id) {
            debug!(alarm_id, "alarm wake cancelled");
        }
    }

    pub fn can_schedule_exact(&self) -> bool {
        self.adapter.can_register_exact()
    }

    pub fn restore_all(&self, alarms: &[Alarm]) -> RestoreReport {
        let outcomes: Vec<(i64, ScheduleOutcome)> = alarms
            .iter()
            .filter(|alarm| alarm.enabled)
            .map(|alarm| (alarm.id, self.schedule(alarm)))
            .collect();
        let report = RestoreReport { outcomes };
        info!(
            total = report.outcomes.len(),
            registered = report.registered(),
            failed = report.failed(),
            "alarm restore finished"
        );
        report
    }

    pub fn restore_from_store(&self, store: &dyn AlarmStore) -> Result<RestoreReport, StoreError> {
        let alarms = store.get_enabled()?;
        Ok(self.restore_all(&alarms))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use chrono::NaiveDate;

    use super::*;
    use crate::clock::{Clock, ManualClock};

    #[derive(Default)]
    pub(crate) struct RecordingAdapter {
        pub registrations: Mutex<Vec<(i64, WakePayload)>>,
        pub cancels: Mutex<Vec<i64>>,
        pub script: Mutex<Vec<RegistrationError>>,
        pub always: Option<RegistrationError>,
        pub attempts: Mutex<u32>,
        pub deny_exact: bool,
    }

    impl RecordingAdapter {
        pub(crate) fn failing_with(error: RegistrationError) -> Self {
            Self {
                always: Some(error),
                ..Self::default()
            }
        }

        pub(crate) fn registered_ids(&self) -> Vec<i64> {
            self.registrations
                .lock()
                .expect("lock")
                .iter()
                .map(|(_, payload)| payload.alarm_id)
                .collect()
        }
    }

    impl TriggerAdapter for RecordingAdapter {
        fn register_wake(&self, at_ms: i64, payload: WakePayload) -> Result<(), RegistrationError> {
            *self.attempts.lock().expect("lock") += 1;
            if let Some(error) = &self.always {
                return Err(error.clone());
            }
            let mut script = self.script.lock().expect("lock");
            if !script.is_empty() {
                return Err(script.remove(0));
            }
            self.registrations
                .lock()
                .expect("lock")
                .push((at_ms, payload));
            Ok(())
        }

        fn cancel(&self, alarm_id: i64) -> bool {
            self.cancels.lock().expect("lock").push(alarm_id);
            true
        }

        fn can_register_exact(&self) -> bool {
            !self.deny_exact
        }
    }

    pub(crate) fn clock_at(h: u32, m: u32) -> ManualClock {
        ManualClock::at_local(
            NaiveDate::from_ymd_opt(2026, 1, 14)
                .expect("date")
                .and_hms_opt(h, m, 0)
                .expect("time"),
        )
    }

    fn service(adapter: Arc<RecordingAdapter>) -> AlarmSchedulingService {
        AlarmSchedulingService::with_retry(
            adapter,
            Arc::new(clock_at(7, 0)),
            RetryPolicy {
                max_attempts: 3,
                delay: Duration::ZERO,
            },
        )
    }

    fn saved_alarm(id: i64, hour: u32) -> Alarm {
        let mut alarm = Alarm::at(hour, 0).expect("alarm");
        alarm.id = id;
        alarm
    }

    #[test]
    fn registers_next_fire_with_payload() {
        let adapter = Arc::new(RecordingAdapter::default());
        let scheduling = service(Arc::clone(&adapter));
        let clock = clock_at(8, 0);

        let outcome = scheduling.schedule(&saved_alarm(4, 8));
        assert_eq!(
            outcome,
            ScheduleOutcome::Registered {
                trigger_at_ms: clock.now_ms(),
                attempts: 1
            }
        );
        let registrations = adapter.registrations.lock().expect("lock");
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].1.alarm_id, 4);
        assert!(registrations[0].1.one_shot);
    }

    #[test]
    fn disabled_alarm_is_skipped() {
        let adapter = Arc::new(RecordingAdapter::default());
        let scheduling = service(Arc::clone(&adapter));
        let mut alarm = saved_alarm(1, 8);
        alarm.enabled = false;
        assert_eq!(scheduling.schedule(&alarm), ScheduleOutcome::Skipped);
        assert_eq!(*adapter.attempts.lock().expect("lock"), 0);
    }

    #[test]
    fn transient_failures_stop_after_three_attempts() {
        let adapter = Arc::new(RecordingAdapter::failing_with(RegistrationError::Transient(
            "busy".to_string(),
        )));
        let scheduling = service(Arc::clone(&adapter));
        assert_eq!(
            scheduling.schedule(&saved_alarm(1, 8)),
            ScheduleOutcome::RetriesExhausted { attempts: 3 }
        );
        assert_eq!(*adapter.attempts.lock().expect("lock"), 3);
    }

    #[test]
    fn transient_failure_then_success_reports_attempts() {
        let adapter = Arc::new(RecordingAdapter::default());
        adapter
            .script
            .lock()
            .expect("lock")
            .push(RegistrationError::Transient("busy".to_string()));
        let scheduling = service(Arc::clone(&adapter));
        assert!(matches!(
            scheduling.schedule(&saved_alarm(1, 8)),
            ScheduleOutcome::Registered { attempts: 2, .. }
        ));
    }

    #[test]
    fn permission_refusal_is_not_retried() {
        let adapter = Arc::new(RecordingAdapter::failing_with(
            RegistrationError::PermissionDenied("no".to_string()),
        ));
        let scheduling = service(Arc::clone(&adapter));
        assert_eq!(
            scheduling.schedule(&saved_alarm(1, 8)),
            ScheduleOutcome::PermissionDenied
        );
        assert_eq!(*adapter.attempts.lock().expect("lock"), 1);
    }

    #[test]
    fn missing_exact_permission_still_attempts() {
        let adapter = Arc::new(RecordingAdapter {
            deny_exact: true,
            ..RecordingAdapter::default()
        });
        let scheduling = service(Arc::clone(&adapter));
        assert!(!scheduling.can_schedule_exact());
        assert!(scheduling.schedule(&saved_alarm(1, 8)).is_registered());
    }

    #[test]
    fn default_policy_retries_three_times_100ms_apart() {
        assert_eq!(
            RetryPolicy::default(),
            RetryPolicy {
                max_attempts: 3,
                delay: Duration::from_millis(100),
            }
        );

        let adapter = Arc::new(RecordingAdapter::failing_with(RegistrationError::Transient(
            "busy".to_string(),
        )));
        let scheduling = AlarmSchedulingService::new(
            Arc::clone(&adapter) as Arc<dyn TriggerAdapter>,
            Arc::new(clock_at(7, 0)),
        );
        let started = std::time::Instant::now();
        assert_eq!(
            scheduling.schedule(&saved_alarm(1, 8)),
            ScheduleOutcome::RetriesExhausted { attempts: 3 }
        );
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(*adapter.attempts.lock().expect("lock"), 3);
    }

    #[test]
    fn restore_isolates_failures_per_alarm() {
        let adapter = Arc::new(RecordingAdapter::default());
        adapter
            .script
            .lock()
            .expect("lock")
            .push(RegistrationError::Unavailable("boom".to_string()));
        let scheduling = service(Arc::clone(&adapter));
        let mut disabled = saved_alarm(3, 10);
        disabled.enabled = false;

        let report = scheduling.restore_all(&[saved_alarm(1, 8), saved_alarm(2, 9), disabled]);
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.outcomes[0], (1, ScheduleOutcome::Failed));
        assert!(report.outcomes[1].1.is_registered());
        assert_eq!(report.registered(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(adapter.registered_ids(), vec![2]);
    }
}
