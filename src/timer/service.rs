use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::alarm::firing::AlertSink;
use crate::broadcast::Broadcast;
use crate::clock::SharedClock;
use crate::continuity::ContinuityProcess;
use crate::error::EngineError;
use crate::store::TimerPreset;
use crate::timer::engine::{TimerEngine, TimerSpec, TimerState, TimerView};
use crate::timer::stopwatch::{Lap, Stopwatch, StopwatchSnapshot};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TickConfig {
    pub timer_tick: Duration,
    pub stopwatch_tick: Duration,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            timer_tick: Duration::from_secs(1),
            stopwatch_tick: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub timers: Vec<TimerView>,
    pub stopwatch: StopwatchSnapshot,
    pub ticking: bool,
    pub taken_at_ms: i64,
}

impl EngineSnapshot {
    pub fn timer(&self, id: &str) -> Option<&TimerView> {
        self.timers.iter().find(|view| view.timer.id == id)
    }
}

const SNAPSHOT_BACKLOG: usize = 16;

type Reply<T> = Sender<Result<T, EngineError>>;

enum TimerOp {
    Pause,
    Resume,
    Reset,
    Remove,
    AddMinute,
    Acknowledge,
}

enum StopwatchOp {
    Start,
    Pause,
    Reset,
}

enum Command {
    StartPreset(TimerPreset, Reply<TimerView>),
    StartAdhoc(TimerSpec, Reply<TimerView>),
    Timer(String, TimerOp, Reply<bool>),
    Edit {
        id: String,
        spec: TimerSpec,
        start: bool,
        reply: Reply<()>,
    },
    Stopwatch(StopwatchOp, Reply<bool>),
    Lap(Reply<Lap>),
    Snapshot(Sender<Arc<EngineSnapshot>>),
    Shutdown,
}

/// Handle to the actor thread that owns every timer and the stopwatch.
pub struct TimerService {
    tx: Sender<Command>,
    latest: Arc<Mutex<Arc<EngineSnapshot>>>,
    snapshots: Broadcast<Arc<EngineSnapshot>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn spawn(
        clock: SharedClock,
        continuity: Box<dyn ContinuityProcess>,
        alerts: Arc<dyn AlertSink>,
        config: TickConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let snapshots = Broadcast::with_capacity(SNAPSHOT_BACKLOG);
        let initial = Arc::new(EngineSnapshot {
            timers: Vec::new(),
            stopwatch: Stopwatch::new().snapshot(clock.now_ms()),
            ticking: false,
            taken_at_ms: clock.now_ms(),
        });
        let latest = Arc::new(Mutex::new(initial));

        let actor = TimerActor {
            engine: TimerEngine::new(),
            stopwatch: Stopwatch::new(),
            clock,
            continuity,
            alerts,
            config,
            timer_deadline: None,
            stopwatch_deadline: None,
            mirrored: Mirrored::Nothing,
            latest: Arc::clone(&latest),
            snapshots: snapshots.clone(),
        };
        let join = thread::spawn(move || actor.run(rx));

        Self {
            tx,
            latest,
            snapshots,
            join: Mutex::new(Some(join)),
        }
    }

    fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(command(reply_tx))
            .map_err(|_| EngineError::Stopped)?;
        reply_rx.recv().map_err(|_| EngineError::Stopped)?
    }

    fn timer_op(&self, id: &str, op: TimerOp) -> Result<bool, EngineError> {
        self.request(|reply| Command::Timer(id.to_string(), op, reply))
    }

    pub fn start_from_preset(&self, preset: TimerPreset) -> Result<TimerView, EngineError> {
        self.request(|reply| Command::StartPreset(preset, reply))
    }

    pub fn start_adhoc(&self, spec: TimerSpec) -> Result<TimerView, EngineError> {
        self.request(|reply| Command::StartAdhoc(spec, reply))
    }

    pub fn pause(&self, id: &str) -> Result<bool, EngineError> {
        self.timer_op(id, TimerOp::Pause)
    }

    pub fn resume(&self, id: &str) -> Result<bool, EngineError> {
        self.timer_op(id, TimerOp::Resume)
    }

    pub fn reset(&self, id: &str) -> Result<bool, EngineError> {
        self.timer_op(id, TimerOp::Reset)
    }

    pub fn remove(&self, id: &str) -> Result<bool, EngineError> {
        self.timer_op(id, TimerOp::Remove)
    }

    pub fn add_minute(&self, id: &str) -> Result<bool, EngineError> {
        self.timer_op(id, TimerOp::AddMinute)
    }

    pub fn acknowledge(&self, id: &str) -> Result<bool, EngineError> {
        self.timer_op(id, TimerOp::Acknowledge)
    }

    pub fn edit(&self, id: &str, spec: TimerSpec) -> Result<(), EngineError> {
        self.request(|reply| Command::Edit {
            id: id.to_string(),
            spec,
            start: false,
            reply,
        })
    }

    pub fn edit_and_start(&self, id: &str, spec: TimerSpec) -> Result<(), EngineError> {
        self.request(|reply| Command::Edit {
            id: id.to_string(),
            spec,
            start: true,
            reply,
        })
    }

    pub fn stopwatch_start(&self) -> Result<bool, EngineError> {
        self.request(|reply| Command::Stopwatch(StopwatchOp::Start, reply))
    }

    pub fn stopwatch_pause(&self) -> Result<bool, EngineError> {
        self.request(|reply| Command::Stopwatch(StopwatchOp::Pause, reply))
    }

    pub fn stopwatch_reset(&self) -> Result<bool, EngineError> {
        self.request(|reply| Command::Stopwatch(StopwatchOp::Reset, reply))
    }

    pub fn record_lap(&self) -> Result<Lap, EngineError> {
        self.request(Command::Lap)
    }

    pub fn snapshot(&self) -> Result<Arc<EngineSnapshot>, EngineError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Command::Snapshot(reply_tx))
            .map_err(|_| EngineError::Stopped)?;
        reply_rx.recv().map_err(|_| EngineError::Stopped)
    }

    pub fn latest(&self) -> Arc<EngineSnapshot> {
        match self.latest.lock() {
            Ok(latest) => Arc::clone(&latest),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Snapshots as they are published. A subscriber that stops reading
    /// misses new snapshots once its backlog is full; `latest` stays current.
    pub fn subscribe(&self) -> Receiver<Arc<EngineSnapshot>> {
        self.snapshots.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
        let join = self.join.lock().ok().and_then(|mut join| join.take());
        if let Some(join) = join {
            let _ = join.join();
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mirrored {
    Nothing,
    Running { id: String, total_ms: u64 },
    Paused { id: String },
}

enum Pending {
    View(Reply<TimerView>, Result<TimerView, EngineError>),
    Flag(Reply<bool>, Result<bool, EngineError>),
    Unit(Reply<()>, Result<(), EngineError>),
    Lap(Reply<Lap>, Result<Lap, EngineError>),
}

impl Pending {
    fn send(self) {
        let delivered = match self {
            Pending::View(reply, result) => reply.send(result).is_ok(),
            Pending::Flag(reply, result) => reply.send(result).is_ok(),
            Pending::Unit(reply, result) => reply.send(result).is_ok(),
            Pending::Lap(reply, result) => reply.send(result).is_ok(),
        };
        if !delivered {
            debug!("caller went away before the reply");
        }
    }
}

struct TimerActor {
    engine: TimerEngine,
    stopwatch: Stopwatch,
    clock: SharedClock,
    continuity: Box<dyn ContinuityProcess>,
    alerts: Arc<dyn AlertSink>,
    config: TickConfig,
    timer_deadline: Option<Instant>,
    stopwatch_deadline: Option<Instant>,
    mirrored: Mirrored,
    latest: Arc<Mutex<Arc<EngineSnapshot>>>,
    snapshots: Broadcast<Arc<EngineSnapshot>>,
}

impl TimerActor {
    fn run(mut self, rx: Receiver<Command>) {
        debug!("timer actor started");
        loop {
            let next_deadline = match (self.timer_deadline, self.stopwatch_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let received = match next_deadline {
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
            };
            match received {
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.run_due_ticks();
        }
        if self.mirrored != Mirrored::Nothing {
            self.continuity.notify_stopped();
        }
        debug!("timer actor stopped");
    }

    fn handle(&mut self, command: Command) {
        let now_ms = self.clock.now_ms();
        let (timers_touched, pending) = match command {
            Command::StartPreset(preset, reply) => {
                let result = self
                    .engine
                    .start_from_preset(&preset, now_ms)
                    .map(|timer| timer.id.clone())
                    .and_then(|id| self.view(&id, now_ms));
                (true, Pending::View(reply, result))
            }
            Command::StartAdhoc(spec, reply) => {
                let result = self
                    .engine
                    .start_adhoc(&spec, now_ms)
                    .map(|timer| timer.id.clone())
                    .and_then(|id| self.view(&id, now_ms));
                (true, Pending::View(reply, result))
            }
            Command::Timer(id, op, reply) => {
                let result = match op {
                    TimerOp::Pause => self.engine.pause(&id, now_ms),
                    TimerOp::Resume => self.engine.resume(&id, now_ms),
                    TimerOp::Reset => self.engine.reset(&id).map(|()| true),
                    TimerOp::Remove => self.engine.remove(&id).map(|_| true),
                    TimerOp::AddMinute => self.engine.add_minute(&id).map(|()| true),
                    TimerOp::Acknowledge => self.engine.acknowledge(&id),
                };
                (true, Pending::Flag(reply, result))
            }
            Command::Edit {
                id,
                spec,
                start,
                reply,
            } => {
                let result = if start {
                    self.engine.edit_and_start(&id, &spec, now_ms)
                } else {
                    self.engine.edit(&id, &spec)
                };
                (true, Pending::Unit(reply, result))
            }
            Command::Stopwatch(op, reply) => {
                let changed = match op {
                    StopwatchOp::Start => self.stopwatch.start(now_ms),
                    StopwatchOp::Pause => self.stopwatch.pause(now_ms),
                    StopwatchOp::Reset => {
                        self.stopwatch.reset();
                        true
                    }
                };
                (false, Pending::Flag(reply, Ok(changed)))
            }
            Command::Lap(reply) => {
                let result = self.stopwatch.record_lap(now_ms);
                (false, Pending::Lap(reply, result))
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot(now_ms));
                return;
            }
            Command::Shutdown => return,
        };

        // The caller must observe the mirror and snapshot its command produced.
        self.reconcile_ticking();
        if timers_touched {
            self.sync_continuity(now_ms);
        }
        self.publish(now_ms);
        pending.send();
    }

    fn view(&self, id: &str, now_ms: i64) -> Result<TimerView, EngineError> {
        self.engine
            .snapshot(now_ms)
            .into_iter()
            .find(|view| view.timer.id == id)
            .ok_or_else(|| EngineError::UnknownTimer(id.to_string()))
    }

    fn reconcile_ticking(&mut self) {
        let now = Instant::now();
        match (self.engine.has_running(), self.timer_deadline) {
            (true, None) => {
                debug!("timer tick loop started");
                self.timer_deadline = Some(now + self.config.timer_tick);
            }
            (false, Some(_)) => {
                debug!("timer tick loop stopped");
                self.timer_deadline = None;
            }
            _ => {}
        }
        match (self.stopwatch.is_running(), self.stopwatch_deadline) {
            (true, None) => self.stopwatch_deadline = Some(now + self.config.stopwatch_tick),
            (false, Some(_)) => self.stopwatch_deadline = None,
            _ => {}
        }
    }

    fn run_due_ticks(&mut self) {
        let now = Instant::now();
        let timer_due = self.timer_deadline.is_some_and(|deadline| deadline <= now);
        let stopwatch_due = self.stopwatch_deadline.is_some_and(|deadline| deadline <= now);
        if !timer_due && !stopwatch_due {
            return;
        }

        let now_ms = self.clock.now_ms();
        if timer_due {
            self.timer_deadline = Some(now + self.config.timer_tick);
            for id in self.engine.tick(now_ms) {
                if let Some(timer) = self.engine.get(&id) {
                    info!(instance_id = %id, name = %timer.name, "timer finished");
                    self.alerts.timer_finished(timer);
                }
            }
        }
        if stopwatch_due {
            self.stopwatch_deadline = Some(now + self.config.stopwatch_tick);
        }

        self.reconcile_ticking();
        if timer_due {
            self.sync_continuity(now_ms);
        }
        self.publish(now_ms);
    }

    /// Mirrors the first running timer. When it stops the mirror moves to
    /// the next running timer, shows it paused, or is cleared.
    fn sync_continuity(&mut self, now_ms: i64) {
        if let Some(timer) = self.engine.first_running() {
            let remaining_ms = timer.remaining_at(now_ms);
            match &self.mirrored {
                Mirrored::Running { id, total_ms } if *id == timer.id && *total_ms == timer.total_ms => {
                    self.continuity.notify_tick(remaining_ms);
                }
                _ => {
                    self.continuity
                        .notify_started(&timer.id, &timer.name, remaining_ms, timer.total_ms);
                    self.mirrored = Mirrored::Running {
                        id: timer.id.clone(),
                        total_ms: timer.total_ms,
                    };
                }
            }
            return;
        }

        let mirrored_id = match &self.mirrored {
            Mirrored::Nothing => return,
            Mirrored::Running { id, .. } | Mirrored::Paused { id } => id.clone(),
        };
        match self.engine.get(&mirrored_id) {
            Some(timer) if timer.state == TimerState::Paused => {
                if self.mirrored != (Mirrored::Paused { id: mirrored_id.clone() }) {
                    self.continuity.notify_paused(timer.remaining_ms);
                    self.mirrored = Mirrored::Paused { id: mirrored_id };
                }
            }
            _ => {
                self.continuity.notify_stopped();
                self.mirrored = Mirrored::Nothing;
            }
        }
    }

    fn snapshot(&self, now_ms: i64) -> Arc<EngineSnapshot> {
        Arc::new(EngineSnapshot {
            timers: self.engine.snapshot(now_ms),
            stopwatch: self.stopwatch.snapshot(now_ms),
            ticking: self.timer_deadline.is_some(),
            taken_at_ms: now_ms,
        })
    }

    fn publish(&self, now_ms: i64) {
        let snapshot = self.snapshot(now_ms);
        match self.latest.lock() {
            Ok(mut latest) => *latest = Arc::clone(&snapshot),
            Err(_) => warn!("snapshot lock poisoned"),
        }
        self.snapshots.publish(snapshot);
    }
}
