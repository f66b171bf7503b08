use thiserror::Error;

use crate::timer::engine::TimerState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("no row with id {0}")]
    NotFound(i64),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error(transparent)]
    Migration(#[from] MigrationError),
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration step '{step}' failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("database schema version {0} is newer than supported version {1}")]
    UnsupportedVersion(i32, i32),
}

impl MigrationError {
    pub(crate) fn step(step: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| MigrationError::Step { step, source }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("unknown timer '{0}'")]
    UnknownTimer(String),

    #[error("cannot {op} timer '{id}' while it is {state:?}")]
    InvalidState {
        id: String,
        state: TimerState,
        op: &'static str,
    },

    #[error("stopwatch must be running to {0}")]
    StopwatchNotRunning(&'static str),

    #[error("timer duration must be greater than zero")]
    ZeroDuration,

    #[error("timer engine has stopped")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}
