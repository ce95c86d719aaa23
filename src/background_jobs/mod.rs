//! Background job scheduling and execution system.
//!
//! Jobs run on a cron schedule evaluated in a timezone, optionally also on
//! process startup. At most one run of a given job is in flight at a time;
//! firings that arrive while a run is still going are skipped.

mod context;
mod handle;
mod job;
pub mod jobs;
mod schedule;
mod scheduler;

pub use context::JobContext;
pub use handle::{JobRun, JobRunStatus, SchedulerHandle};
pub use job::{BackgroundJob, HookEvent, JobError, JobSchedule, ShutdownBehavior};
pub use schedule::{CronSchedule, ScheduleError};
pub use scheduler::{create_scheduler, JobScheduler};
