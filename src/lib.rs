pub mod alarm;
pub mod api;
pub mod app;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod continuity;
pub mod error;
pub mod format;
pub mod logging;
pub mod store;
pub mod timer;
