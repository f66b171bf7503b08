use rusqlite::{Connection, OptionalExtension, Transaction};
use tracing::{error, info, warn};

use crate::error::MigrationError;

pub const SCHEMA_VERSION: i32 = 2;

const CREATE_ALARMS_V2: &str = r#"
    CREATE TABLE IF NOT EXISTS alarms (
        id                    INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        hour                  INTEGER NOT NULL,
        minute                INTEGER NOT NULL,
        isEnabled             INTEGER NOT NULL,
        label                 TEXT NOT NULL,
        repeatDays            INTEGER NOT NULL,
        soundType             TEXT NOT NULL DEFAULT 'DEFAULT',
        vibrationPattern      TEXT NOT NULL DEFAULT 'DEFAULT',
        ringtoneUri           TEXT,
        snoozeDurationMinutes INTEGER NOT NULL,
        isSnoozeEnabled       INTEGER NOT NULL,
        createdAt             INTEGER NOT NULL
    );
"#;

const CREATE_PRESETS_V2: &str = r#"
    CREATE TABLE IF NOT EXISTS timer_presets (
        id               INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        name             TEXT NOT NULL,
        durationSeconds  INTEGER NOT NULL,
        usageCount       INTEGER NOT NULL,
        soundType        TEXT NOT NULL DEFAULT 'DEFAULT',
        vibrationPattern TEXT NOT NULL DEFAULT 'DEFAULT',
        ringtoneUri      TEXT,
        createdAt        INTEGER NOT NULL
    );
"#;

pub fn schema_version(conn: &Connection) -> rusqlite::Result<i32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

/// Each step runs in its own transaction; a failing step leaves the database
/// at the previous version.
pub fn migrate(conn: &mut Connection) -> Result<i32, MigrationError> {
    let mut version = detect_version(conn)?;
    if version > SCHEMA_VERSION {
        return Err(MigrationError::UnsupportedVersion(version, SCHEMA_VERSION));
    }

    if version == 0 {
        info!(version = SCHEMA_VERSION, "creating fresh schema");
        let tx = conn
            .transaction()
            .map_err(MigrationError::step("begin create"))?;
        create_current_schema(&tx)?;
        tx.commit().map_err(MigrationError::step("commit create"))?;
        return Ok(SCHEMA_VERSION);
    }

    while version < SCHEMA_VERSION {
        let next = version + 1;
        info!(from = version, to = next, "running schema migration");
        let result = match version {
            1 => run_in_transaction(conn, migrate_v1_to_v2),
            other => Err(MigrationError::UnsupportedVersion(other, SCHEMA_VERSION)),
        };
        if let Err(err) = result {
            error!(from = version, to = next, error = %err, "schema migration failed");
            return Err(err);
        }
        version = next;
        info!(version, "schema migration finished");
    }
    Ok(version)
}

pub(crate) fn recreate(conn: &mut Connection) -> Result<i32, MigrationError> {
    warn!("recreating database schema; existing rows are discarded");
    run_in_transaction(conn, |tx| {
        tx.execute_batch(
            "DROP TABLE IF EXISTS alarms;
             DROP TABLE IF EXISTS alarms_new;
             DROP TABLE IF EXISTS timer_presets;
             DROP TABLE IF EXISTS timer_presets_new;",
        )
        .map_err(MigrationError::step("drop tables"))?;
        create_current_schema(tx)
    })?;
    Ok(SCHEMA_VERSION)
}

fn run_in_transaction(
    conn: &mut Connection,
    step: impl FnOnce(&Transaction<'_>) -> Result<(), MigrationError>,
) -> Result<(), MigrationError> {
    let tx = conn.transaction().map_err(MigrationError::step("begin"))?;
    step(&tx)?;
    tx.commit().map_err(MigrationError::step("commit"))
}

fn create_current_schema(tx: &Transaction<'_>) -> Result<(), MigrationError> {
    tx.execute_batch(CREATE_ALARMS_V2)
        .map_err(MigrationError::step("create alarms"))?;
    tx.execute_batch(CREATE_PRESETS_V2)
        .map_err(MigrationError::step("create timer_presets"))?;
    tx.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
        .map_err(MigrationError::step("set user_version"))
}

/// Legacy databases never set `user_version`; they are recognised by the
/// `isVibrate` column on `alarms`.
fn detect_version(conn: &Connection) -> Result<i32, MigrationError> {
    let stored = schema_version(conn).map_err(MigrationError::step("read user_version"))?;
    if stored != 0 {
        return Ok(stored);
    }
    if !table_exists(conn, "alarms").map_err(MigrationError::step("inspect schema"))? {
        return Ok(0);
    }
    let legacy = column_exists(conn, "alarms", "isVibrate")
        .map_err(MigrationError::step("inspect schema"))?;
    Ok(if legacy { 1 } else { SCHEMA_VERSION })
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let name: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(name.is_some())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info('{table}')"))?;
    let columns = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in columns {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// `alarms.isVibrate` becomes `vibrationPattern` and both tables gain sound
/// columns. SQLite cannot drop columns here, so both tables are rebuilt.
fn migrate_v1_to_v2(tx: &Transaction<'_>) -> Result<(), MigrationError> {
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS alarms_new (
            id                    INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            hour                  INTEGER NOT NULL,
            minute                INTEGER NOT NULL,
            isEnabled             INTEGER NOT NULL,
            label                 TEXT NOT NULL,
            repeatDays            INTEGER NOT NULL,
            soundType             TEXT NOT NULL DEFAULT 'DEFAULT',
            vibrationPattern      TEXT NOT NULL DEFAULT 'DEFAULT',
            ringtoneUri           TEXT,
            snoozeDurationMinutes INTEGER NOT NULL,
            isSnoozeEnabled       INTEGER NOT NULL,
            createdAt             INTEGER NOT NULL
        );
        "#,
    )
    .map_err(MigrationError::step("create alarms_new"))?;

    tx.execute_batch(
        r#"
        INSERT INTO alarms_new (id, hour, minute, isEnabled, label, repeatDays,
            soundType, vibrationPattern, ringtoneUri, snoozeDurationMinutes,
            isSnoozeEnabled, createdAt)
        SELECT id, hour, minute, isEnabled, label, repeatDays,
            'DEFAULT',
            CASE WHEN isVibrate = 0 THEN 'NONE' ELSE 'DEFAULT' END,
            ringtoneUri, snoozeDurationMinutes, isSnoozeEnabled, createdAt
        FROM alarms;
        "#,
    )
    .map_err(MigrationError::step("copy alarms"))?;

    tx.execute_batch(
        "DROP TABLE IF EXISTS alarms;
         ALTER TABLE alarms_new RENAME TO alarms;",
    )
    .map_err(MigrationError::step("swap alarms"))?;

    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS timer_presets_new (
            id               INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            name             TEXT NOT NULL,
            durationSeconds  INTEGER NOT NULL,
            usageCount       INTEGER NOT NULL,
            soundType        TEXT NOT NULL DEFAULT 'DEFAULT',
            vibrationPattern TEXT NOT NULL DEFAULT 'DEFAULT',
            ringtoneUri      TEXT,
            createdAt        INTEGER NOT NULL
        );
        "#,
    )
    .map_err(MigrationError::step("create timer_presets_new"))?;

    tx.execute_batch(
        r#"
        INSERT INTO timer_presets_new (id, name, durationSeconds, usageCount,
            soundType, vibrationPattern, ringtoneUri, createdAt)
        SELECT id, name, durationSeconds, usageCount,
            'DEFAULT', 'DEFAULT', NULL, createdAt
        FROM timer_presets;
        "#,
    )
    .map_err(MigrationError::step("copy timer_presets"))?;

    tx.execute_batch(
        "DROP TABLE IF EXISTS timer_presets;
         ALTER TABLE timer_presets_new RENAME TO timer_presets;",
    )
    .map_err(MigrationError::step("swap timer_presets"))?;

    tx.execute_batch("PRAGMA user_version = 2")
        .map_err(MigrationError::step("set user_version"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const LEGACY_ALARMS_V1: &str = r#"
        CREATE TABLE alarms (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            hour INTEGER NOT NULL,
            minute INTEGER NOT NULL,
            isEnabled INTEGER NOT NULL,
            label TEXT NOT NULL,
            repeatDays INTEGER NOT NULL,
            isVibrate INTEGER NOT NULL,
            ringtoneUri TEXT,
            snoozeDurationMinutes INTEGER NOT NULL,
            isSnoozeEnabled INTEGER NOT NULL,
            createdAt INTEGER NOT NULL
        );
    "#;

    pub(crate) const LEGACY_PRESETS_V1: &str = r#"
        CREATE TABLE timer_presets (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            name TEXT NOT NULL,
            durationSeconds INTEGER NOT NULL,
            usageCount INTEGER NOT NULL,
            createdAt INTEGER NOT NULL
        );
    "#;

    pub(crate) fn legacy_database() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(LEGACY_ALARMS_V1).expect("alarms v1");
        conn.execute_batch(LEGACY_PRESETS_V1).expect("presets v1");
        conn.execute_batch(
            "INSERT INTO alarms (hour, minute, isEnabled, label, repeatDays, isVibrate,
                ringtoneUri, snoozeDurationMinutes, isSnoozeEnabled, createdAt)
             VALUES (7, 30, 1, 'work', 62, 1, NULL, 5, 1, 100),
                    (9, 0, 0, 'weekend', 65, 0, 'content://bell', 10, 0, 200);
             INSERT INTO timer_presets (name, durationSeconds, usageCount, createdAt)
             VALUES ('Tea', 180, 4, 100);",
        )
        .expect("seed");
        conn
    }

    #[test]
    fn fresh_database_is_created_at_current_version() {
        let mut conn = Connection::open_in_memory().expect("open");
        assert_eq!(migrate(&mut conn).expect("migrate"), SCHEMA_VERSION);
        assert_eq!(schema_version(&conn).expect("version"), SCHEMA_VERSION);
        assert!(column_exists(&conn, "alarms", "vibrationPattern").expect("columns"));
        // second run is a no-op
        assert_eq!(migrate(&mut conn).expect("migrate"), SCHEMA_VERSION);
    }

    #[test]
    fn legacy_vibrate_flag_becomes_pattern() {
        let mut conn = legacy_database();
        assert_eq!(migrate(&mut conn).expect("migrate"), 2);
        assert!(!column_exists(&conn, "alarms", "isVibrate").expect("columns"));

        let mut stmt = conn
            .prepare("SELECT label, soundType, vibrationPattern, repeatDays FROM alarms ORDER BY id")
            .expect("prepare");
        let rows: Vec<(String, String, String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
            .expect("query")
            .collect::<rusqlite::Result<_>>()
            .expect("rows");
        assert_eq!(
            rows,
            vec![
                ("work".to_string(), "DEFAULT".to_string(), "DEFAULT".to_string(), 62),
                ("weekend".to_string(), "DEFAULT".to_string(), "NONE".to_string(), 65),
            ]
        );

        let preset: (String, String, Option<String>, i64) = conn
            .query_row(
                "SELECT soundType, vibrationPattern, ringtoneUri, usageCount FROM timer_presets",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .expect("preset");
        assert_eq!(
            preset,
            ("DEFAULT".to_string(), "DEFAULT".to_string(), None, 4)
        );
    }

    #[test]
    fn failed_step_rolls_back_everything() {
        let mut conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(LEGACY_ALARMS_V1).expect("alarms v1");
        conn.execute_batch("PRAGMA user_version = 1").expect("version");

        let err = migrate(&mut conn).expect_err("presets table is missing");
        assert!(matches!(
            err,
            MigrationError::Step {
                step: "copy timer_presets",
                ..
            }
        ));
        assert_eq!(schema_version(&conn).expect("version"), 1);
        assert!(column_exists(&conn, "alarms", "isVibrate").expect("columns"));
        assert!(!table_exists(&conn, "alarms_new").expect("tables"));
    }

    #[test]
    fn newer_schema_is_rejected() {
        let mut conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("PRAGMA user_version = 9").expect("version");
        assert!(matches!(
            migrate(&mut conn),
            Err(MigrationError::UnsupportedVersion(9, SCHEMA_VERSION))
        ));
    }

    #[test]
    fn recreate_discards_broken_schema() {
        let mut conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(LEGACY_ALARMS_V1).expect("alarms v1");
        conn.execute_batch("PRAGMA user_version = 1").expect("version");
        assert!(migrate(&mut conn).is_err());

        assert_eq!(recreate(&mut conn).expect("recreate"), SCHEMA_VERSION);
        assert!(column_exists(&conn, "alarms", "soundType").expect("columns"));
        assert!(table_exists(&conn, "timer_presets").expect("tables"));
    }
}
