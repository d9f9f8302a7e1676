//! Data-described recurring jobs, evaluated by one scheduling loop.

pub mod calendar;
pub mod scheduler;

pub use scheduler::{Scheduler, TickReport, TickStatus};
