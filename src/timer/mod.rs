pub mod engine;
pub mod service;
pub mod stopwatch;
