mod migrate;
mod sqlite;

use serde::{Deserialize, Serialize};

use crate::alarm::model::{Alarm, SoundType, VibrationPattern};
use crate::error::StoreError;
use crate::format::format_duration_words;

pub use migrate::{SCHEMA_VERSION, migrate, schema_version};
pub use sqlite::SqliteStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StoreChange {
    Alarms,
    Presets,
}

pub trait AlarmStore: Send + Sync {
    fn get_all(&self) -> StoreResult<Vec<Alarm>>;
    fn get_enabled(&self) -> StoreResult<Vec<Alarm>>;
    fn get_by_id(&self, id: i64) -> StoreResult<Option<Alarm>>;
    fn insert(&self, alarm: &Alarm) -> StoreResult<i64>;
    fn update(&self, alarm: &Alarm) -> StoreResult<()>;
    fn delete_by_id(&self, id: i64) -> StoreResult<()>;
    fn set_enabled(&self, id: i64, enabled: bool) -> StoreResult<()>;
}

pub trait PresetStore: Send + Sync {
    fn get_all_presets(&self) -> StoreResult<Vec<TimerPreset>>;
    fn get_preset(&self, id: i64) -> StoreResult<Option<TimerPreset>>;
    fn insert_preset(&self, preset: &TimerPreset) -> StoreResult<i64>;
    fn update_preset(&self, preset: &TimerPreset) -> StoreResult<()>;
    fn delete_preset(&self, id: i64) -> StoreResult<()>;
    fn increment_usage(&self, id: i64) -> StoreResult<()>;
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TimerPreset {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub duration_seconds: u64,
    #[serde(default)]
    pub usage_count: u32,
    #[serde(default)]
    pub sound: SoundType,
    #[serde(default)]
    pub vibration: VibrationPattern,
    #[serde(default)]
    pub ringtone_uri: Option<String>,
    #[serde(default)]
    pub created_at_ms: i64,
}

impl TimerPreset {
    pub fn new(name: impl Into<String>, duration_seconds: u64) -> Self {
        Self {
            id: 0,
            name: name.into(),
            duration_seconds,
            usage_count: 0,
            sound: SoundType::Default,
            vibration: VibrationPattern::Default,
            ringtone_uri: None,
            created_at_ms: 0,
        }
    }

    pub fn display_name(&self) -> String {
        display_name_or_duration(&self.name, self.duration_seconds)
    }
}

pub fn display_name_or_duration(name: &str, duration_seconds: u64) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        format_duration_words(duration_seconds)
    } else {
        trimmed.to_string()
    }
}
