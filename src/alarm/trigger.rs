use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::alarm::model::{Alarm, SoundType, VibrationPattern};
use crate::clock::SharedClock;

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct WakePayload {
    pub alarm_id: i64,
    pub label: String,
    pub sound: SoundType,
    pub vibration: VibrationPattern,
    pub ringtone_uri: Option<String>,
    pub one_shot: bool,
    pub snooze_minutes: u32,
}

impl WakePayload {
    pub fn for_alarm(alarm: &Alarm) -> Self {
        Self {
            alarm_id: alarm.id,
            label: alarm.label.clone(),
            sound: alarm.sound,
            vibration: alarm.vibration,
            ringtone_uri: alarm.ringtone_uri.clone(),
            one_shot: alarm.is_one_shot(),
            snooze_minutes: alarm.snooze_minutes,
        }
    }
}

#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum RegistrationError {
    #[error("wake registration refused: {0}")]
    PermissionDenied(String),

    #[error("wake registration temporarily unavailable: {0}")]
    Transient(String),

    #[error("wake facility unavailable: {0}")]
    Unavailable(String),
}

/// Facility able to wake the process at an absolute instant. Registering
/// twice for the same alarm replaces the earlier registration and cancelling
/// an unknown alarm is not an error.
pub trait TriggerAdapter: Send + Sync {
    fn register_wake(&self, at_ms: i64, payload: WakePayload) -> Result<(), RegistrationError>;

    fn cancel(&self, alarm_id: i64) -> bool;

    fn can_register_exact(&self) -> bool;
}

const DEFAULT_CAPACITY: usize = 500;
const MAX_WAIT: Duration = Duration::from_millis(500);

struct Pending {
    at_ms: i64,
    payload: WakePayload,
}

#[derive(Default)]
struct WakeTable {
    pending: HashMap<i64, Pending>,
    shutdown: bool,
}

struct Shared {
    table: Mutex<WakeTable>,
    changed: Condvar,
    exact_permitted: AtomicBool,
    capacity: usize,
}

pub struct InProcessWakeScheduler {
    shared: Arc<Shared>,
    join: Option<JoinHandle<()>>,
}

impl InProcessWakeScheduler {
    pub fn start(clock: SharedClock) -> (Self, Receiver<WakePayload>) {
        Self::with_capacity(clock, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(clock: SharedClock, capacity: usize) -> (Self, Receiver<WakePayload>) {
        let (fire_tx, fire_rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            table: Mutex::new(WakeTable::default()),
            changed: Condvar::new(),
            exact_permitted: AtomicBool::new(true),
            capacity,
        });
        let shared_for_thread = Arc::clone(&shared);
        let join = thread::Builder::new()
            .name("wake-dispatch".to_string())
            .spawn(move || run_dispatch_loop(shared_for_thread, clock, fire_tx))
            .ok();
        if join.is_none() {
            warn!("failed to spawn wake dispatcher; registrations will never fire");
        }
        (Self { shared, join }, fire_rx)
    }

    pub fn set_exact_permitted(&self, permitted: bool) {
        self.shared.exact_permitted.store(permitted, Ordering::Relaxed);
    }

    pub fn pending_count(&self) -> usize {
        self.shared
            .table
            .lock()
            .map(|table| table.pending.len())
            .unwrap_or(0)
    }

    pub fn pending_at(&self, alarm_id: i64) -> Option<i64> {
        let table = self.shared.table.lock().ok()?;
        table.pending.get(&alarm_id).map(|pending| pending.at_ms)
    }

    pub fn shutdown(&self) {
        if let Ok(mut table) = self.shared.table.lock() {
            table.shutdown = true;
        }
        self.shared.changed.notify_all();
    }
}

impl TriggerAdapter for InProcessWakeScheduler {
    fn register_wake(&self, at_ms: i64, payload: WakePayload) -> Result<(), RegistrationError> {
        if !self.can_register_exact() {
            return Err(RegistrationError::PermissionDenied(
                "exact wake permission revoked".to_string(),
            ));
        }
        let mut table = self
            .shared
            .table
            .lock()
            .map_err(|_| RegistrationError::Unavailable("wake table poisoned".to_string()))?;
        if table.shutdown {
            return Err(RegistrationError::Unavailable(
                "wake dispatcher stopped".to_string(),
            ));
        }
        let replacing = table.pending.contains_key(&payload.alarm_id);
        if !replacing && table.pending.len() >= self.shared.capacity {
            return Err(RegistrationError::Transient(format!(
                "wake table full ({} entries)",
                self.shared.capacity
            )));
        }
        let alarm_id = payload.alarm_id;
        table.pending.insert(alarm_id, Pending { at_ms, payload });
        drop(table);
        self.shared.changed.notify_all();
        debug!(alarm_id, at_ms, replacing, "wake registered");
        Ok(())
    }

    fn cancel(&self, alarm_id: i64) -> bool {
        let removed = match self.shared.table.lock() {
            Ok(mut table) => table.pending.remove(&alarm_id).is_some(),
            Err(_) => false,
        };
        if removed {
            self.shared.changed.notify_all();
        }
        removed
    }

    fn can_register_exact(&self) -> bool {
        self.shared.exact_permitted.load(Ordering::Relaxed)
    }
}

impl Drop for InProcessWakeScheduler {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run_dispatch_loop(shared: Arc<Shared>, clock: SharedClock, fire_tx: Sender<WakePayload>) {
    let Ok(mut table) = shared.table.lock() else {
        return;
    };
    loop {
        if table.shutdown {
            return;
        }
        let now_ms = clock.now_ms();
        let due: Vec<i64> = table
            .pending
            .iter()
            .filter(|(_, pending)| pending.at_ms <= now_ms)
            .map(|(id, _)| *id)
            .collect();
        for alarm_id in due {
            if let Some(pending) = table.pending.remove(&alarm_id) {
                debug!(alarm_id, at_ms = pending.at_ms, now_ms, "wake fired");
                if fire_tx.send(pending.payload).is_err() {
                    warn!(alarm_id, "fire handler gone; dropping wake");
                }
            }
        }

        // Waits are capped so a wall-clock jump is noticed promptly.
        let wait = table
            .pending
            .values()
            .map(|pending| pending.at_ms.saturating_sub(now_ms))
            .min()
            .map(|ms| Duration::from_millis(ms.clamp(1, MAX_WAIT.as_millis() as i64) as u64))
            .unwrap_or(MAX_WAIT);
        table = match shared.changed.wait_timeout(table, wait) {
            Ok((guard, _)) => guard,
            Err(_) => return,
        };
    }
}
