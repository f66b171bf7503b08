use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::SharedClock;

pub trait ContinuityProcess: Send {
    fn notify_started(&self, instance_id: &str, name: &str, remaining_ms: u64, total_ms: u64);
    fn notify_tick(&self, remaining_ms: u64);
    fn notify_paused(&self, remaining_ms: u64);
    fn notify_stopped(&self);
}

pub struct NoopContinuity;

impl ContinuityProcess for NoopContinuity {
    fn notify_started(&self, _: &str, _: &str, _: u64, _: u64) {}
    fn notify_tick(&self, _: u64) {}
    fn notify_paused(&self, _: u64) {}
    fn notify_stopped(&self) {}
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct WidgetMirrorState {
    pub is_running: bool,
    pub is_paused: bool,
    pub remaining_ms: u64,
    pub total_ms: u64,
    pub timer_name: String,
    pub timer_id: String,
    pub last_updated_at: i64,
}

impl WidgetMirrorState {
    pub fn is_empty(&self) -> bool {
        !self.is_running && !self.is_paused && self.remaining_ms == 0
    }

    pub fn progress(&self) -> f64 {
        if self.total_ms == 0 {
            return 0.0;
        }
        self.remaining_ms as f64 / self.total_ms as f64
    }
}

#[derive(Debug, Clone)]
enum MirrorEvent {
    Started {
        instance_id: String,
        name: String,
        remaining_ms: u64,
        total_ms: u64,
    },
    Tick(u64),
    Paused(u64),
    Stopped,
}

impl MirrorEvent {
    fn apply(self, state: &mut WidgetMirrorState) {
        match self {
            MirrorEvent::Started {
                instance_id,
                name,
                remaining_ms,
                total_ms,
            } => {
                *state = WidgetMirrorState {
                    is_running: true,
                    is_paused: false,
                    remaining_ms,
                    total_ms,
                    timer_name: name,
                    timer_id: instance_id,
                    last_updated_at: state.last_updated_at,
                };
            }
            MirrorEvent::Tick(remaining_ms) => state.remaining_ms = remaining_ms,
            MirrorEvent::Paused(remaining_ms) => {
                state.is_running = false;
                state.is_paused = true;
                state.remaining_ms = remaining_ms;
            }
            MirrorEvent::Stopped => {
                *state = WidgetMirrorState {
                    last_updated_at: state.last_updated_at,
                    ..WidgetMirrorState::default()
                };
            }
        }
    }
}

pub struct JsonMirror {
    tx: Option<Sender<MirrorEvent>>,
    join: Option<JoinHandle<()>>,
}

impl JsonMirror {
    pub fn start(path: impl Into<PathBuf>, clock: SharedClock) -> Self {
        let path = path.into();
        let (tx, rx) = mpsc::channel::<MirrorEvent>();
        let join = thread::Builder::new()
            .name("widget-mirror".to_string())
            .spawn(move || {
                let mut state = WidgetMirrorState::default();
                for event in rx {
                    event.apply(&mut state);
                    state.last_updated_at = clock.now_ms();
                    if let Err(err) = write_mirror(&path, &state) {
                        warn!(path = %path.display(), error = %format!("{err:#}"), "widget mirror write failed");
                    }
                }
            });
        let join = match join {
            Ok(join) => Some(join),
            Err(err) => {
                warn!(error = %err, "widget mirror disabled");
                None
            }
        };
        Self {
            tx: join.is_some().then_some(tx),
            join,
        }
    }

    fn send(&self, event: MirrorEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                debug!("widget mirror writer gone");
            }
        }
    }
}

impl ContinuityProcess for JsonMirror {
    fn notify_started(&self, instance_id: &str, name: &str, remaining_ms: u64, total_ms: u64) {
        self.send(MirrorEvent::Started {
            instance_id: instance_id.to_string(),
            name: name.to_string(),
            remaining_ms,
            total_ms,
        });
    }

    fn notify_tick(&self, remaining_ms: u64) {
        self.send(MirrorEvent::Tick(remaining_ms));
    }

    fn notify_paused(&self, remaining_ms: u64) {
        self.send(MirrorEvent::Paused(remaining_ms));
    }

    fn notify_stopped(&self) {
        self.send(MirrorEvent::Stopped);
    }
}

impl Drop for JsonMirror {
    fn drop(&mut self) {
        // Closing the channel lets the writer drain and exit.
        self.tx.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn write_mirror(path: &Path, state: &WidgetMirrorState) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let mut raw = serde_json::to_string_pretty(state).context("failed to serialize mirror")?;
    raw.push('\n');
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, raw).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Reads the mirror file. A missing or unreadable mirror is reported as
/// `None`; readers must tolerate it being stale or absent.
pub fn read_mirror(path: &Path) -> Option<WidgetMirrorState> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn mirror_follows_start_tick_pause_stop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("widget").join("timer.json");
        let clock = ManualClock::new(42);

        let mirror = JsonMirror::start(&path, Arc::new(clock.clone()));
        mirror.notify_started("abc", "Tea", 180_000, 180_000);
        mirror.notify_tick(120_000);
        drop(mirror);

        let state = read_mirror(&path).expect("mirror written");
        assert!(state.is_running);
        assert_eq!(state.timer_id, "abc");
        assert_eq!(state.timer_name, "Tea");
        assert_eq!(state.remaining_ms, 120_000);
        assert_eq!(state.last_updated_at, 42);
        assert!((state.progress() - 120.0 / 180.0).abs() < 1e-9);

        let mirror = JsonMirror::start(&path, Arc::new(clock));
        mirror.notify_started("abc", "Tea", 120_000, 180_000);
        mirror.notify_paused(100_000);
        drop(mirror);
        let paused = read_mirror(&path).expect("mirror written");
        assert!(paused.is_paused && !paused.is_running);
        assert_eq!(paused.remaining_ms, 100_000);

        let mirror = JsonMirror::start(&path, Arc::new(ManualClock::new(7)));
        mirror.notify_stopped();
        drop(mirror);
        let cleared = read_mirror(&path).expect("mirror written");
        assert!(cleared.is_empty());
        assert_eq!(cleared.last_updated_at, 7);
    }

    #[test]
    fn unwritable_mirror_never_fails_the_caller() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").expect("write");
        let mirror = JsonMirror::start(blocker.join("timer.json"), Arc::new(ManualClock::new(0)));
        mirror.notify_started("abc", "Tea", 1, 1);
        mirror.notify_stopped();
        drop(mirror);
        assert!(read_mirror(&blocker.join("timer.json")).is_none());
    }
}
