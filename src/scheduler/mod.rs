//! Periodic trigger

pub mod periodic_scheduler;

pub use periodic_scheduler::{effective_interval, SchedulerState, SyncScheduler};
