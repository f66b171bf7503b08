use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, warn};

use crate::alarm::model::{Alarm, RepeatDays, SoundType, VibrationPattern};
use crate::broadcast::Broadcast;
use crate::error::StoreError;
use crate::store::migrate::{migrate, recreate};
use crate::store::{AlarmStore, PresetStore, StoreChange, StoreResult, TimerPreset};

const ALARM_COLUMNS: &str = "id, hour, minute, isEnabled, label, repeatDays, soundType, \
     vibrationPattern, ringtoneUri, snoozeDurationMinutes, isSnoozeEnabled, createdAt";

const PRESET_COLUMNS: &str =
    "id, name, durationSeconds, usageCount, soundType, vibrationPattern, ringtoneUri, createdAt";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    changes: Broadcast<StoreChange>,
}

impl SqliteStore {
    /// Opens `path` and migrates it. With `allow_destructive` a failed
    /// migration falls back to recreating the schema from scratch.
    pub fn open(path: impl AsRef<Path>, allow_destructive: bool) -> StoreResult<Self> {
        let mut conn = Connection::open(path.as_ref())?;
        match migrate(&mut conn) {
            Ok(version) => debug!(version, path = %path.as_ref().display(), "database ready"),
            Err(err) if allow_destructive => {
                warn!(error = %err, "migration failed; recreating database");
                recreate(&mut conn)?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            changes: Broadcast::new(),
        }
    }

    pub fn subscribe(&self) -> Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::InvalidRow("connection lock poisoned".to_string()))
    }

    fn query_alarms(&self, sql: &str) -> StoreResult<Vec<Alarm>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let raws = stmt.query_map([], RawAlarm::from_row)?;
        let mut out = Vec::new();
        for raw in raws {
            out.push(raw?.into_alarm()?);
        }
        Ok(out)
    }
}

struct RawAlarm {
    id: i64,
    hour: u32,
    minute: u32,
    enabled: bool,
    label: String,
    repeat_days: i64,
    sound: String,
    vibration: String,
    ringtone_uri: Option<String>,
    snooze_minutes: u32,
    snooze_enabled: bool,
    created_at_ms: i64,
}

impl RawAlarm {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            hour: row.get("hour")?,
            minute: row.get("minute")?,
            enabled: row.get("isEnabled")?,
            label: row.get("label")?,
            repeat_days: row.get("repeatDays")?,
            sound: row.get("soundType")?,
            vibration: row.get("vibrationPattern")?,
            ringtone_uri: row.get("ringtoneUri")?,
            snooze_minutes: row.get("snoozeDurationMinutes")?,
            snooze_enabled: row.get("isSnoozeEnabled")?,
            created_at_ms: row.get("createdAt")?,
        })
    }

    fn into_alarm(self) -> StoreResult<Alarm> {
        let time = NaiveTime::from_hms_opt(self.hour, self.minute, 0).ok_or_else(|| {
            StoreError::InvalidRow(format!(
                "alarm {} has invalid time {}:{}",
                self.id, self.hour, self.minute
            ))
        })?;
        let mask = u8::try_from(self.repeat_days).map_err(|_| {
            StoreError::InvalidRow(format!(
                "alarm {} has invalid repeat mask {}",
                self.id, self.repeat_days
            ))
        })?;
        Ok(Alarm {
            id: self.id,
            time,
            enabled: self.enabled,
            label: self.label,
            repeat_days: RepeatDays::from_bits(mask),
            sound: SoundType::from_name(&self.sound),
            vibration: VibrationPattern::from_name(&self.vibration),
            ringtone_uri: self.ringtone_uri,
            snooze_minutes: self.snooze_minutes,
            snooze_enabled: self.snooze_enabled,
            created_at_ms: self.created_at_ms,
        })
    }
}

struct RawPreset {
    id: i64,
    name: String,
    duration_seconds: i64,
    usage_count: u32,
    sound: String,
    vibration: String,
    ringtone_uri: Option<String>,
    created_at_ms: i64,
}

impl RawPreset {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            duration_seconds: row.get("durationSeconds")?,
            usage_count: row.get("usageCount")?,
            sound: row.get("soundType")?,
            vibration: row.get("vibrationPattern")?,
            ringtone_uri: row.get("ringtoneUri")?,
            created_at_ms: row.get("createdAt")?,
        })
    }

    fn into_preset(self) -> StoreResult<TimerPreset> {
        let duration_seconds = u64::try_from(self.duration_seconds).map_err(|_| {
            StoreError::InvalidRow(format!(
                "preset {} has invalid duration {}",
                self.id, self.duration_seconds
            ))
        })?;
        Ok(TimerPreset {
            id: self.id,
            name: self.name,
            duration_seconds,
            usage_count: self.usage_count,
            sound: SoundType::from_name(&self.sound),
            vibration: VibrationPattern::from_name(&self.vibration),
            ringtone_uri: self.ringtone_uri,
            created_at_ms: self.created_at_ms,
        })
    }
}

fn duration_column(preset: &TimerPreset) -> StoreResult<i64> {
    i64::try_from(preset.duration_seconds).map_err(|_| {
        StoreError::InvalidRow(format!(
            "preset duration {} does not fit in a column",
            preset.duration_seconds
        ))
    })
}

fn created_at_or_now(created_at_ms: i64) -> i64 {
    if created_at_ms > 0 {
        created_at_ms
    } else {
        Utc::now().timestamp_millis()
    }
}

impl AlarmStore for SqliteStore {
    fn get_all(&self) -> StoreResult<Vec<Alarm>> {
        self.query_alarms(&format!(
            "SELECT {ALARM_COLUMNS} FROM alarms ORDER BY createdAt DESC, id DESC"
        ))
    }

    fn get_enabled(&self) -> StoreResult<Vec<Alarm>> {
        self.query_alarms(&format!(
            "SELECT {ALARM_COLUMNS} FROM alarms WHERE isEnabled = 1 ORDER BY hour, minute, id"
        ))
    }

    fn get_by_id(&self, id: i64) -> StoreResult<Option<Alarm>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {ALARM_COLUMNS} FROM alarms WHERE id = ?1"),
                [id],
                RawAlarm::from_row,
            )
            .optional()?;
        raw.map(RawAlarm::into_alarm).transpose()
    }

    fn insert(&self, alarm: &Alarm) -> StoreResult<i64> {
        let id = {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO alarms (hour, minute, isEnabled, label, repeatDays, soundType,
                    vibrationPattern, ringtoneUri, snoozeDurationMinutes, isSnoozeEnabled, createdAt)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    alarm.hour(),
                    alarm.minute(),
                    alarm.enabled,
                    alarm.label,
                    alarm.repeat_days.bits(),
                    alarm.sound.name(),
                    alarm.vibration.name(),
                    alarm.ringtone_uri,
                    alarm.snooze_minutes,
                    alarm.snooze_enabled,
                    created_at_or_now(alarm.created_at_ms),
                ],
            )?;
            conn.last_insert_rowid()
        };
        self.changes.publish(StoreChange::Alarms);
        Ok(id)
    }

    fn update(&self, alarm: &Alarm) -> StoreResult<()> {
        let changed = {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE alarms SET hour = ?2, minute = ?3, isEnabled = ?4, label = ?5,
                    repeatDays = ?6, soundType = ?7, vibrationPattern = ?8, ringtoneUri = ?9,
                    snoozeDurationMinutes = ?10, isSnoozeEnabled = ?11
                 WHERE id = ?1",
                params![
                    alarm.id,
                    alarm.hour(),
                    alarm.minute(),
                    alarm.enabled,
                    alarm.label,
                    alarm.repeat_days.bits(),
                    alarm.sound.name(),
                    alarm.vibration.name(),
                    alarm.ringtone_uri,
                    alarm.snooze_minutes,
                    alarm.snooze_enabled,
                ],
            )?
        };
        if changed == 0 {
            return Err(StoreError::NotFound(alarm.id));
        }
        self.changes.publish(StoreChange::Alarms);
        Ok(())
    }

    fn delete_by_id(&self, id: i64) -> StoreResult<()> {
        let changed = self.lock()?.execute("DELETE FROM alarms WHERE id = ?1", [id])?;
        if changed > 0 {
            self.changes.publish(StoreChange::Alarms);
        }
        Ok(())
    }

    fn set_enabled(&self, id: i64, enabled: bool) -> StoreResult<()> {
        let changed = self.lock()?.execute(
            "UPDATE alarms SET isEnabled = ?2 WHERE id = ?1",
            params![id, enabled],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        self.changes.publish(StoreChange::Alarms);
        Ok(())
    }
}

impl PresetStore for SqliteStore {
    fn get_all_presets(&self) -> StoreResult<Vec<TimerPreset>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PRESET_COLUMNS} FROM timer_presets
             ORDER BY usageCount DESC, createdAt DESC, id DESC"
        ))?;
        let raws = stmt.query_map([], RawPreset::from_row)?;
        let mut out = Vec::new();
        for raw in raws {
            out.push(raw?.into_preset()?);
        }
        Ok(out)
    }

    fn get_preset(&self, id: i64) -> StoreResult<Option<TimerPreset>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {PRESET_COLUMNS} FROM timer_presets WHERE id = ?1"),
                [id],
                RawPreset::from_row,
            )
            .optional()?;
        raw.map(RawPreset::into_preset).transpose()
    }

    fn insert_preset(&self, preset: &TimerPreset) -> StoreResult<i64> {
        let duration_seconds = duration_column(preset)?;
        let id = {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO timer_presets (name, durationSeconds, usageCount, soundType,
                    vibrationPattern, ringtoneUri, createdAt)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    preset.name,
                    duration_seconds,
                    preset.usage_count,
                    preset.sound.name(),
                    preset.vibration.name(),
                    preset.ringtone_uri,
                    created_at_or_now(preset.created_at_ms),
                ],
            )?;
            conn.last_insert_rowid()
        };
        self.changes.publish(StoreChange::Presets);
        Ok(id)
    }

    fn update_preset(&self, preset: &TimerPreset) -> StoreResult<()> {
        let duration_seconds = duration_column(preset)?;
        let changed = self.lock()?.execute(
            "UPDATE timer_presets SET name = ?2, durationSeconds = ?3, soundType = ?4,
                vibrationPattern = ?5, ringtoneUri = ?6
             WHERE id = ?1",
            params![
                preset.id,
                preset.name,
                duration_seconds,
                preset.sound.name(),
                preset.vibration.name(),
                preset.ringtone_uri,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(preset.id));
        }
        self.changes.publish(StoreChange::Presets);
        Ok(())
    }

    fn delete_preset(&self, id: i64) -> StoreResult<()> {
        let changed = self
            .lock()?
            .execute("DELETE FROM timer_presets WHERE id = ?1", [id])?;
        if changed > 0 {
            self.changes.publish(StoreChange::Presets);
        }
        Ok(())
    }

    fn increment_usage(&self, id: i64) -> StoreResult<()> {
        let changed = self.lock()?.execute(
            "UPDATE timer_presets SET usageCount = usageCount + 1 WHERE id = ?1",
            [id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        self.changes.publish(StoreChange::Presets);
        Ok(())
    }
}
