use super::context::JobContext;
use super::handle::{
    JobRun, JobRunStatus, RegisteredJob, SchedulerCommand, SchedulerHandle, SharedJobState,
};
use super::job::{BackgroundJob, HookEvent, JobError, ShutdownBehavior};
use crate::server::metrics;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on a single scheduler sleep, so wall-clock changes are noticed.
const MAX_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period for cancellable jobs during shutdown.
const CANCELLABLE_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// A run in flight: the bookkeeping task and the job task it awaits.
struct RunningJob {
    handle: JoinHandle<()>,
    job_abort: AbortHandle,
}

/// Manages background job scheduling and execution.
pub struct JobScheduler {
    /// Shared state accessible by SchedulerHandle
    shared_state: Arc<RwLock<SharedJobState>>,

    /// Currently running jobs with their task handles.
    running_handles: HashMap<String, RunningJob>,

    /// Receiver for commands from SchedulerHandle
    command_receiver: mpsc::Receiver<SchedulerCommand>,

    /// Token to signal scheduler shutdown.
    shutdown_token: CancellationToken,

    /// How long cancellable jobs may keep running after shutdown.
    cancellable_grace: Duration,
}

impl JobScheduler {
    fn new(
        command_receiver: mpsc::Receiver<SchedulerCommand>,
        shutdown_token: CancellationToken,
        shared_state: Arc<RwLock<SharedJobState>>,
    ) -> Self {
        Self {
            shared_state,
            running_handles: HashMap::new(),
            command_receiver,
            shutdown_token,
            cancellable_grace: CANCELLABLE_SHUTDOWN_GRACE,
        }
    }

    /// Override the time cancellable jobs get to stop once shutdown starts.
    pub fn set_cancellable_shutdown_grace(&mut self, grace: Duration) {
        self.cancellable_grace = grace;
    }

    /// Register a job with the scheduler.
    pub async fn register_job(&mut self, job: Arc<dyn BackgroundJob>) {
        let job_id = job.id().to_string();
        let schedule = job.schedule();
        info!(
            "Registering job: {} - {} (schedule: {})",
            job_id,
            job.description(),
            schedule.cron()
        );

        let mut state = self.shared_state.write().await;
        match schedule.cron().next_after(Utc::now()) {
            Some(next) => {
                info!("Next run of {} at {}", job_id, next);
                state.next_runs.insert(job_id.clone(), next);
            }
            None => warn!("Schedule of {} never fires", job_id),
        }
        state.jobs.insert(
            job_id,
            RegisteredJob {
                job,
                run_lock: Arc::new(Mutex::new(())),
            },
        );
    }

    /// Get the number of registered jobs.
    pub async fn job_count(&self) -> usize {
        self.shared_state.read().await.jobs.len()
    }

    /// Main scheduler loop. Returns once shutdown is requested and running
    /// jobs have been dealt with.
    pub async fn run(&mut self) {
        let job_count = self.job_count().await;
        info!("Starting job scheduler with {} registered jobs", job_count);

        // Fire OnStartup hooks
        self.trigger_jobs_for_hook(HookEvent::OnStartup).await;

        loop {
            // Clean up completed job handles
            self.cleanup_completed_jobs();

            let sleep_duration = self.time_until_next_scheduled_job().await;
            debug!(
                "Scheduler sleeping for {:?} until next scheduled job",
                sleep_duration
            );

            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {
                    self.run_due_jobs().await;
                }
                Some(cmd) = self.command_receiver.recv() => {
                    self.handle_command(cmd).await;
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    self.shutdown().await;
                    break;
                }
            }
        }

        info!("Job scheduler stopped");
    }

    /// Handle a command from the SchedulerHandle.
    async fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::TriggerJob { job_id, response } => {
                let result = self.spawn_job(&job_id, "manual").await;
                let _ = response.send(result);
            }
        }
    }

    /// Calculate time until the next scheduled job should run.
    async fn time_until_next_scheduled_job(&self) -> Duration {
        let now = Utc::now();
        let state = self.shared_state.read().await;
        state
            .next_runs
            .values()
            .map(|next| {
                (next.with_timezone(&Utc) - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            })
            .min()
            .unwrap_or(MAX_CHECK_INTERVAL)
            .min(MAX_CHECK_INTERVAL)
    }

    /// Run all jobs whose firing time has come, then schedule their next one.
    async fn run_due_jobs(&mut self) {
        let now = Utc::now();
        let due: Vec<String> = {
            let state = self.shared_state.read().await;
            state
                .next_runs
                .iter()
                .filter(|(_, next)| **next <= now)
                .map(|(job_id, _)| job_id.clone())
                .collect()
        };

        for job_id in due {
            // Already logged and counted when skipped
            let _ = self.spawn_job(&job_id, "schedule").await;

            let mut state = self.shared_state.write().await;
            let next = state
                .jobs
                .get(&job_id)
                .and_then(|registered| registered.job.schedule().cron().next_after(now));
            match next {
                Some(next) => {
                    info!("Next run of {} at {}", job_id, next);
                    state.next_runs.insert(job_id, next);
                }
                None => {
                    warn!("Schedule of {} has no further firings", job_id);
                    state.next_runs.remove(&job_id);
                }
            }
        }
    }

    /// Trigger all jobs that listen for a specific hook event.
    async fn trigger_jobs_for_hook(&mut self, event: HookEvent) {
        let jobs_to_trigger: Vec<String> = {
            let state = self.shared_state.read().await;
            state
                .jobs
                .iter()
                .filter(|(_, registered)| registered.job.schedule().listens_to(event))
                .map(|(job_id, _)| job_id.clone())
                .collect()
        };

        for job_id in jobs_to_trigger {
            let trigger = format!("hook:{}", event);
            let _ = self.spawn_job(&job_id, &trigger).await;
        }
    }

    /// Spawn a job execution task, unless a run of the same job is still in
    /// progress.
    async fn spawn_job(&mut self, job_id: &str, triggered_by: &str) -> Result<(), JobError> {
        let (job, run_lock) = {
            let state = self.shared_state.read().await;
            match state.jobs.get(job_id) {
                Some(registered) => (
                    Arc::clone(&registered.job),
                    Arc::clone(&registered.run_lock),
                ),
                None => {
                    error!("Attempted to spawn unknown job: {}", job_id);
                    return Err(JobError::NotFound);
                }
            }
        };

        let guard = match run_lock.try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(
                    "Skipping {} run of {}: previous run still in progress",
                    triggered_by, job_id
                );
                metrics::record_skipped_firing();
                return Err(JobError::AlreadyRunning);
            }
        };

        info!("Starting job: {} (triggered_by: {})", job_id, triggered_by);

        let ctx = JobContext::new(self.shutdown_token.child_token());
        let shared_state = Arc::clone(&self.shared_state);
        let job_id_owned = job_id.to_string();
        let triggered_by = triggered_by.to_string();

        let started_at = Utc::now();
        let start_time = Instant::now();

        // Separate task so a panicking job is reported instead of tearing
        // down the bookkeeping task. The run lock is held until it ends.
        let job_task = tokio::spawn(async move { job.execute(&ctx).await });
        let job_abort = job_task.abort_handle();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            let result = job_task.await;
            let elapsed = start_time.elapsed();

            let status = match result {
                Ok(Ok(())) => {
                    info!(
                        "Job {} completed successfully in {:?}",
                        job_id_owned, elapsed
                    );
                    JobRunStatus::Completed
                }
                Ok(Err(JobError::Cancelled)) => {
                    info!("Job {} was cancelled after {:?}", job_id_owned, elapsed);
                    JobRunStatus::Cancelled
                }
                Ok(Err(e)) => {
                    error!("Job {} failed after {:?}: {}", job_id_owned, elapsed, e);
                    JobRunStatus::Failed(e.to_string())
                }
                Err(e) if e.is_cancelled() => {
                    warn!("Job {} was aborted after {:?}", job_id_owned, elapsed);
                    JobRunStatus::Cancelled
                }
                Err(e) => {
                    error!("Job {} panicked after {:?}: {}", job_id_owned, elapsed, e);
                    JobRunStatus::Failed(format!("Task panic: {}", e))
                }
            };

            shared_state.write().await.last_runs.insert(
                job_id_owned,
                JobRun {
                    triggered_by,
                    started_at,
                    duration: elapsed,
                    status,
                },
            );
        });

        self.running_handles
            .insert(job_id.to_string(), RunningJob { handle, job_abort });
        Ok(())
    }

    /// Clean up handles for completed jobs.
    fn cleanup_completed_jobs(&mut self) {
        self.running_handles
            .retain(|_, running| !running.handle.is_finished());
    }

    /// Gracefully shut down the scheduler.
    ///
    /// Job contexts are children of the shutdown token, so running jobs have
    /// already been asked to stop at their next suspension point.
    async fn shutdown(&mut self) {
        info!("Shutting down scheduler...");

        let mut wait_jobs = Vec::new();
        {
            let state = self.shared_state.read().await;
            for (job_id, running) in self.running_handles.drain() {
                let behavior = state
                    .jobs
                    .get(&job_id)
                    .map(|registered| registered.job.shutdown_behavior())
                    .unwrap_or_default();
                wait_jobs.push((job_id, running, behavior));
            }
        }

        for (job_id, mut running, behavior) in wait_jobs {
            match behavior {
                ShutdownBehavior::WaitForCompletion => {
                    info!("Waiting for job {} to complete...", job_id);
                    let _ = running.handle.await;
                }
                ShutdownBehavior::Cancellable => {
                    if tokio::time::timeout(self.cancellable_grace, &mut running.handle)
                        .await
                        .is_err()
                    {
                        warn!("Job {} did not stop in time, aborting", job_id);
                        // Abort the job itself; bookkeeping then records the
                        // run and releases its lock.
                        running.job_abort.abort();
                        let _ = running.handle.await;
                    }
                }
            }
        }

        info!("Scheduler shutdown complete");
    }
}

/// Create a scheduler and its handle.
pub fn create_scheduler(shutdown_token: CancellationToken) -> (JobScheduler, SchedulerHandle) {
    let (command_tx, command_rx) = mpsc::channel(100);
    let shared_state = Arc::new(RwLock::new(SharedJobState::default()));

    let scheduler = JobScheduler::new(command_rx, shutdown_token, Arc::clone(&shared_state));
    let handle = SchedulerHandle::new(command_tx, shared_state);

    (scheduler, handle)
}
