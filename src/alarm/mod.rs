pub mod calculator;
pub mod firing;
pub mod model;
pub mod scheduling;
pub mod trigger;
