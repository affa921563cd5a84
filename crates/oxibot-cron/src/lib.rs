//! Oxibot Cron — scheduled job storage and timer-driven execution.
//!
//! Jobs are persisted as JSON and fired by a single async timer loop that
//! sleeps until the nearest due time, re-arming whenever a job is added,
//! removed, or toggled. See [`service::CronService`] for the scheduler and
//! [`types::CronJob`] for the job shape.

pub mod service;
pub mod types;

pub use service::{CronService, OnJobFn};
pub use types::{CronJob, CronPayload, CronSchedule, CronStore, JobStatus, ScheduleKind};
