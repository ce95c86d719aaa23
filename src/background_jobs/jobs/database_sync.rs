//! Database sync background job.
//!
//! Each run performs one dump → restore → cleanup cycle from the source to
//! the target database, retrying the whole cycle on failure.

use crate::background_jobs::{
    BackgroundJob, CronSchedule, HookEvent, JobContext, JobError, JobSchedule, ShutdownBehavior,
};
use crate::config::{AppConfig, ScheduleSettings};
use crate::server::metrics;
use crate::sync::{redact_connection_string, CommandRunner, Pipeline, RetryOutcome, RetryPolicy};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Background job that copies the source database into the target.
pub struct DatabaseSyncJob {
    pipeline: Pipeline,
    retry_policy: RetryPolicy,
    source_url: String,
    target_url: String,
    schedule: CronSchedule,
    run_on_startup: bool,
}

impl DatabaseSyncJob {
    pub fn new(
        pipeline: Pipeline,
        retry_policy: RetryPolicy,
        source_url: String,
        target_url: String,
        schedule: ScheduleSettings,
    ) -> Self {
        Self {
            pipeline,
            retry_policy,
            source_url,
            target_url,
            schedule: schedule.cron,
            run_on_startup: schedule.run_on_startup,
        }
    }

    pub fn from_config(config: &AppConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(
            Pipeline::new(config.pipeline.clone(), runner),
            RetryPolicy::new(&config.retry),
            config.source_url.clone(),
            config.target_url.clone(),
            config.schedule.clone(),
        )
    }
}

#[async_trait]
impl BackgroundJob for DatabaseSyncJob {
    fn id(&self) -> &'static str {
        "database_sync"
    }

    fn name(&self) -> &'static str {
        "Database Sync"
    }

    fn description(&self) -> &'static str {
        "Dump the source database and restore it into the target database"
    }

    fn schedule(&self) -> JobSchedule {
        if self.run_on_startup {
            JobSchedule::Combined {
                cron: self.schedule.clone(),
                hooks: vec![HookEvent::OnStartup],
            }
        } else {
            JobSchedule::Cron(self.schedule.clone())
        }
    }

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        // An external pg_dump/psql cannot be interrupted cleanly
        ShutdownBehavior::WaitForCompletion
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        info!(
            "Syncing {} into {}",
            redact_connection_string(&self.source_url),
            redact_connection_string(&self.target_url)
        );

        let running = metrics::cycle_running();
        let outcome = self
            .retry_policy
            .run_with_retry(
                |attempt| {
                    debug!(
                        "Sync attempt {}/{}",
                        attempt, self.retry_policy.max_attempts
                    );
                    self.pipeline.run_cycle(&self.source_url, &self.target_url)
                },
                &ctx.cancellation_token,
            )
            .await;
        drop(running);

        match outcome {
            RetryOutcome::Succeeded {
                value: report,
                attempts,
            } => {
                metrics::record_cycle_outcome("success");
                if report.artifact_orphaned() {
                    warn!(
                        "Sync {} succeeded but its artifact was left in {:?}",
                        report.artifact_id,
                        self.pipeline.settings().artifact_dir
                    );
                }
                info!(
                    "Sync {} completed after {} attempt(s) (dump {:?}, restore {:?})",
                    report.artifact_id, attempts, report.dump_duration, report.restore_duration
                );
                Ok(())
            }
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                metrics::record_cycle_outcome("exhausted");
                Err(JobError::ExecutionFailed(format!(
                    "gave up after {} attempt(s): {}",
                    attempts, last_error
                )))
            }
            RetryOutcome::Cancelled { attempts, .. } => {
                metrics::record_cycle_outcome("cancelled");
                info!("Sync abandoned during shutdown after {} attempt(s)", attempts);
                Err(JobError::Cancelled)
            }
        }
    }
}
