//! The dump → restore → cleanup pipeline.
//!
//! A cycle dumps the source database to a plain SQL artifact, applies the
//! artifact to the target database and deletes it. Stages are strictly
//! sequential: each one only starts if the previous one succeeded.

use super::artifact::new_artifact_id;
use super::connection::redact_connection_string;
use super::process::{CommandRunner, ExecError};
use crate::config::PipelineSettings;
use crate::server::metrics;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// One step of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Dump,
    Restore,
    Cleanup,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Dump => "dump",
            Stage::Restore => "restore",
            Stage::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pipeline state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Dumping,
    Restoring,
    Cleaning,
    Done,
    Failed(Stage),
}

/// The artifact could not be deleted after a successful restore.
#[derive(Debug, Error)]
#[error("failed to delete artifact {path:?}: {source}")]
pub struct FilesystemError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// A cycle failed. Carries the stage that failed and its cause.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("dump stage failed: {0}")]
    Dump(#[source] ExecError),

    #[error("restore stage failed: {0}")]
    Restore(#[source] ExecError),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Dump(_) => Stage::Dump,
            PipelineError::Restore(_) => Stage::Restore,
        }
    }

    pub fn exec_error(&self) -> &ExecError {
        match self {
            PipelineError::Dump(e) | PipelineError::Restore(e) => e,
        }
    }
}

/// What happened to the artifact at the end of a successful transfer.
#[derive(Debug)]
pub enum CleanupOutcome {
    Removed,
    /// Data was transferred but the artifact is still on disk.
    Orphaned(FilesystemError),
}

/// Summary of a successful cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub artifact_id: String,
    pub artifact_size: Option<u64>,
    pub dump_duration: Duration,
    pub restore_duration: Duration,
    pub cleanup: CleanupOutcome,
}

impl CycleReport {
    pub fn artifact_orphaned(&self) -> bool {
        matches!(self.cleanup, CleanupOutcome::Orphaned(_))
    }
}

/// Runs sync cycles with `pg_dump` and `psql`.
pub struct Pipeline {
    settings: PipelineSettings,
    runner: Arc<dyn CommandRunner>,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self { settings, runner }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Arguments for the dump command.
    ///
    /// Produces a plain SQL script that drops objects (if they exist) before
    /// recreating them, without ownership or privilege statements so it can
    /// be applied to a target with different roles.
    pub fn dump_args(&self, source: &str, artifact_path: &Path) -> Vec<String> {
        let mut args = vec![
            format!("--dbname={}", source),
            "--clean".to_string(),
            "--if-exists".to_string(),
            "--no-owner".to_string(),
            "--no-acl".to_string(),
        ];
        args.extend(self.settings.pg_dump_extra_args.iter().cloned());
        args.push("-f".to_string());
        args.push(artifact_path.to_string_lossy().into_owned());
        args
    }

    /// Arguments for the restore command.
    ///
    /// psql carries on past failing statements, so only connection or file
    /// errors fail the stage. Stricter behaviour (`-v ON_ERROR_STOP=1`,
    /// `--single-transaction`) is opted into through the extra arguments.
    pub fn restore_args(&self, target: &str, artifact_path: &Path) -> Vec<String> {
        let mut args = vec![format!("--dbname={}", target)];
        args.extend(self.settings.psql_extra_args.iter().cloned());
        args.push("-f".to_string());
        args.push(artifact_path.to_string_lossy().into_owned());
        args
    }

    /// Runs one full cycle: dump, restore, cleanup.
    ///
    /// A cleanup failure does not fail the cycle; it is reported through
    /// [`CycleReport::cleanup`].
    pub async fn run_cycle(&self, source: &str, target: &str) -> Result<CycleReport, PipelineError> {
        let artifact_id = new_artifact_id();
        let artifact_path = self.settings.artifact_dir.join(&artifact_id);
        let mut state = PipelineState::Idle;

        // Dump
        transition(&mut state, PipelineState::Dumping, &artifact_id);
        info!(
            "Database {} backup is being created at {:?}",
            redact_connection_string(source),
            artifact_path
        );
        let started = Instant::now();
        let dump = self
            .runner
            .run(
                &self.settings.pg_dump_bin,
                &self.dump_args(source, &artifact_path),
                self.settings.max_output_bytes,
            )
            .await;
        if let Err(e) = dump {
            return Err(self.fail(&mut state, &artifact_path, PipelineError::Dump(e)).await);
        }
        let dump_duration = started.elapsed();
        metrics::record_stage_duration(Stage::Dump, dump_duration);

        let artifact_size = tokio::fs::metadata(&artifact_path).await.ok().map(|m| m.len());
        match artifact_size {
            Some(size) => info!(
                "Backup created at {:?} ({:#}) in {:?}",
                artifact_path,
                byte_unit::Byte::from(size),
                dump_duration
            ),
            None => info!("Backup created at {:?} in {:?}", artifact_path, dump_duration),
        }

        // Restore
        transition(&mut state, PipelineState::Restoring, &artifact_id);
        info!(
            "Database {} is being restored with backup {:?}",
            redact_connection_string(target),
            artifact_path
        );
        let started = Instant::now();
        let restore = self
            .runner
            .run(
                &self.settings.psql_bin,
                &self.restore_args(target, &artifact_path),
                self.settings.max_output_bytes,
            )
            .await;
        if let Err(e) = restore {
            return Err(self
                .fail(&mut state, &artifact_path, PipelineError::Restore(e))
                .await);
        }
        let restore_duration = started.elapsed();
        metrics::record_stage_duration(Stage::Restore, restore_duration);
        info!(
            "Database {} restored in {:?}",
            redact_connection_string(target),
            restore_duration
        );

        // Cleanup
        transition(&mut state, PipelineState::Cleaning, &artifact_id);
        info!("Backup {:?} is being deleted", artifact_path);
        let started = Instant::now();
        let cleanup = match tokio::fs::remove_file(&artifact_path).await {
            Ok(()) => {
                info!("Backup file {:?} deleted", artifact_path);
                CleanupOutcome::Removed
            }
            Err(source) => {
                let err = FilesystemError {
                    path: artifact_path.clone(),
                    source,
                };
                warn!("Data transferred but backup file was left behind: {}", err);
                metrics::record_orphaned_artifact();
                CleanupOutcome::Orphaned(err)
            }
        };
        metrics::record_stage_duration(Stage::Cleanup, started.elapsed());

        transition(&mut state, PipelineState::Done, &artifact_id);

        Ok(CycleReport {
            artifact_id,
            artifact_size,
            dump_duration,
            restore_duration,
            cleanup,
        })
    }

    /// Moves to `Failed`, discards whatever the failed stage left on disk and
    /// hands the error back.
    async fn fail(
        &self,
        state: &mut PipelineState,
        artifact_path: &Path,
        err: PipelineError,
    ) -> PipelineError {
        let stage = err.stage();
        let artifact_id = artifact_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        transition(state, PipelineState::Failed(stage), &artifact_id);
        error!("Error during {} stage: {}", stage, err.exec_error());

        match tokio::fs::remove_file(artifact_path).await {
            Ok(()) => debug!("Discarded artifact {:?} of failed cycle", artifact_path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Could not discard artifact {:?} of failed cycle: {}",
                artifact_path, e
            ),
        }

        err
    }
}

fn transition(state: &mut PipelineState, next: PipelineState, artifact_id: &str) {
    debug!("Cycle {}: {:?} -> {:?}", artifact_id, state, next);
    *state = next;
}
