//! External command execution with bounded output capture.

use async_trait::async_trait;
use std::io;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Default cap for each captured stream, 500000 KiB.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 500_000;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Errors that can occur while running an external command.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("`{program}` exited with {}: {stderr}", describe_exit_code(.exit_code))]
    Failed {
        program: String,
        /// `None` when the process was terminated by a signal.
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("I/O error while running `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl ExecError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecError::Failed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    pub fn stderr(&self) -> Option<&str> {
        match self {
            ExecError::Failed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

fn describe_exit_code(code: &Option<i32>) -> String {
    match *code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

/// Captured result of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// True if stdout exceeded the cap and the excess was discarded.
    pub stdout_truncated: bool,
    /// True if stderr exceeded the cap and the excess was discarded.
    pub stderr_truncated: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn is_truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }
}

/// Runs external commands.
///
/// Implementations suspend the calling task until the command exits and never
/// buffer more than `max_output_bytes` of each output stream.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        max_output_bytes: usize,
    ) -> Result<CommandOutput, ExecError>;
}

/// [`CommandRunner`] backed by `tokio::process`.
///
/// No shell is involved: arguments are passed to the program verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        max_output_bytes: usize,
    ) -> Result<CommandOutput, ExecError> {
        debug!("Spawning `{}` with {} argument(s)", program, args.len());

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Both pipes are drained concurrently with the wait, otherwise a chatty
        // child could block forever on a full pipe.
        let (stdout, stderr, status) = tokio::try_join!(
            read_capped(stdout, max_output_bytes),
            read_capped(stderr, max_output_bytes),
            child.wait(),
        )
        .map_err(|source| ExecError::Io {
            program: program.to_string(),
            source,
        })?;

        let output = build_output(status, stdout, stderr);

        if output.is_truncated() {
            warn!(
                "Output of `{}` exceeded {} bytes and was truncated",
                program, max_output_bytes
            );
        }

        if !status.success() {
            return Err(ExecError::Failed {
                program: program.to_string(),
                exit_code: status.code(),
                stderr: output.stderr_lossy().trim().to_string(),
            });
        }

        Ok(output)
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

fn build_output(status: ExitStatus, stdout: Captured, stderr: Captured) -> CommandOutput {
    CommandOutput {
        exit_code: status.code(),
        stdout: stdout.bytes,
        stderr: stderr.bytes,
        stdout_truncated: stdout.truncated,
        stderr_truncated: stderr.truncated,
    }
}

/// Reads `reader` to EOF keeping at most `cap` bytes. Anything past the cap is
/// read and dropped.
async fn read_capped<R>(reader: Option<R>, cap: usize) -> io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(Captured::default());
    };

    let mut captured = Captured::default();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(captured.bytes.len());
        if room > 0 {
            captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
        }
        if n > room {
            captured.truncated = true;
        }
    }
    Ok(captured)
}
