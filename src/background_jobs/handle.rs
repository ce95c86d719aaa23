use super::job::{BackgroundJob, JobError};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

/// Final status of a job run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRunStatus {
    Completed,
    Failed(String),
    Cancelled,
}

/// Bookkeeping for the most recent run of a job.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub triggered_by: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub status: JobRunStatus,
}

pub(super) struct RegisteredJob {
    pub job: Arc<dyn BackgroundJob>,
    /// Held for the whole duration of a run.
    pub run_lock: Arc<Mutex<()>>,
}

#[derive(Default)]
pub(super) struct SharedJobState {
    pub jobs: HashMap<String, RegisteredJob>,
    pub last_runs: HashMap<String, JobRun>,
    pub next_runs: HashMap<String, DateTime<Tz>>,
}

pub(super) enum SchedulerCommand {
    TriggerJob {
        job_id: String,
        response: oneshot::Sender<Result<(), JobError>>,
    },
}

/// Handle for interacting with a running [`super::JobScheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    command_sender: mpsc::Sender<SchedulerCommand>,
    shared_state: Arc<RwLock<SharedJobState>>,
}

impl SchedulerHandle {
    pub(super) fn new(
        command_sender: mpsc::Sender<SchedulerCommand>,
        shared_state: Arc<RwLock<SharedJobState>>,
    ) -> Self {
        Self {
            command_sender,
            shared_state,
        }
    }

    /// Run a job now, outside its schedule.
    ///
    /// Fails with [`JobError::AlreadyRunning`] if a run of the same job is in
    /// progress.
    pub async fn trigger_job(&self, job_id: &str) -> Result<(), JobError> {
        let (response, receiver) = oneshot::channel();
        self.command_sender
            .send(SchedulerCommand::TriggerJob {
                job_id: job_id.to_string(),
                response,
            })
            .await
            .map_err(|_| JobError::ExecutionFailed("Scheduler is not running".to_string()))?;

        receiver
            .await
            .map_err(|_| JobError::ExecutionFailed("Scheduler dropped the request".to_string()))?
    }

    pub async fn job_exists(&self, job_id: &str) -> bool {
        self.shared_state.read().await.jobs.contains_key(job_id)
    }

    pub async fn is_running(&self, job_id: &str) -> bool {
        let state = self.shared_state.read().await;
        match state.jobs.get(job_id) {
            Some(registered) => registered.run_lock.try_lock().is_err(),
            None => false,
        }
    }

    pub async fn last_run(&self, job_id: &str) -> Option<JobRun> {
        self.shared_state.read().await.last_runs.get(job_id).cloned()
    }

    /// Next scheduled firing, in the job's timezone.
    pub async fn next_run(&self, job_id: &str) -> Option<DateTime<Tz>> {
        self.shared_state.read().await.next_runs.get(job_id).copied()
    }
}
