//! Database transfer: artifact naming, external commands, the
//! dump/restore/cleanup pipeline and its retry policy.

mod artifact;
mod connection;
mod pipeline;
mod process;
mod retry;

pub use artifact::{artifact_id_at, new_artifact_id, ARTIFACT_SUFFIX};
pub use connection::redact_connection_string;
pub use pipeline::{
    CleanupOutcome, CycleReport, FilesystemError, Pipeline, PipelineError, PipelineState, Stage,
};
pub use process::{CommandOutput, CommandRunner, ExecError, ProcessRunner, DEFAULT_MAX_OUTPUT_BYTES};
pub use retry::{RetryOutcome, RetryPolicy};
