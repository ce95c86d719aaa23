//! Stand-ins for `pg_dump` and `psql`
//!
//! Small shell scripts written to a temp directory. They keep call counters
//! and argument logs next to themselves so tests can inspect what ran.

use super::constants::*;
use pg_sync::config::CliConfig;
use pg_sync::AppConfig;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// How the fake tools misbehave.
#[derive(Debug, Clone, Default)]
pub struct FakeToolsOptions {
    /// pg_dump exits 1 for this many calls before it starts succeeding.
    pub dump_failures: u32,
    /// pg_dump sleeps this long before writing anything.
    pub dump_delay_secs: u32,
    /// psql always exits 2, as it does when the target is unreachable.
    pub restore_fails: bool,
}

pub struct FakeTools {
    bin_dir: TempDir,
    artifact_dir: TempDir,
}

#[allow(dead_code)]
impl FakeTools {
    /// Writes the scripts and creates an empty artifact directory.
    pub fn install(options: FakeToolsOptions) -> Self {
        let bin_dir = TempDir::new().expect("Failed to create bin dir");
        let artifact_dir = TempDir::new().expect("Failed to create artifact dir");

        let pg_dump = format!(
            r#"#!/bin/sh
dir="$(dirname "$0")"
count=$(cat "$dir/dump_calls" 2>/dev/null || echo 0)
count=$((count + 1))
echo "$count" > "$dir/dump_calls"
echo "$*" >> "$dir/dump_args"
sleep {delay}
if [ "$count" -le {failures} ]; then
  echo "pg_dump: error: connection to server failed" >&2
  exit 1
fi
for out; do :; done
echo "{sql}" > "$out"
"#,
            delay = options.dump_delay_secs,
            failures = options.dump_failures,
            sql = FAKE_DUMP_SQL,
        );

        let psql = format!(
            r#"#!/bin/sh
dir="$(dirname "$0")"
count=$(cat "$dir/restore_calls" 2>/dev/null || echo 0)
echo $((count + 1)) > "$dir/restore_calls"
echo "$*" >> "$dir/restore_args"
for input; do :; done
if [ ! -f "$input" ]; then
  echo "psql: error: $input: No such file or directory" >&2
  exit 1
fi
if [ "{fail}" = "true" ]; then
  echo "psql: error: connection to server failed" >&2
  exit 2
fi
cp "$input" "$dir/restored.sql"
"#,
            fail = options.restore_fails,
        );

        write_script(&bin_dir.path().join("pg_dump"), &pg_dump);
        write_script(&bin_dir.path().join("psql"), &psql);

        Self {
            bin_dir,
            artifact_dir,
        }
    }

    pub fn pg_dump_bin(&self) -> String {
        self.bin_dir.path().join("pg_dump").display().to_string()
    }

    pub fn psql_bin(&self) -> String {
        self.bin_dir.path().join("psql").display().to_string()
    }

    pub fn artifact_dir(&self) -> &Path {
        self.artifact_dir.path()
    }

    /// Names of everything currently in the artifact directory.
    pub fn artifacts(&self) -> Vec<PathBuf> {
        fs::read_dir(self.artifact_dir.path())
            .expect("Failed to list artifact dir")
            .map(|entry| entry.expect("Failed to read dir entry").path())
            .collect()
    }

    pub fn dump_calls(&self) -> u32 {
        self.read_counter("dump_calls")
    }

    pub fn restore_calls(&self) -> u32 {
        self.read_counter("restore_calls")
    }

    /// Argument lines pg_dump was invoked with, one per call.
    pub fn dump_args(&self) -> Vec<String> {
        self.read_lines("dump_args")
    }

    /// Argument lines psql was invoked with, one per call.
    pub fn restore_args(&self) -> Vec<String> {
        self.read_lines("restore_args")
    }

    /// What psql was last fed, if it got that far.
    pub fn restored_sql(&self) -> Option<String> {
        fs::read_to_string(self.bin_dir.path().join("restored.sql")).ok()
    }

    /// Configuration wired to the fake tools.
    pub fn cli_config(&self, retries: u32, retry_delay_ms: u64) -> CliConfig {
        CliConfig {
            source_url: Some(FAKE_SOURCE_URL.to_string()),
            target_url: Some(FAKE_TARGET_URL.to_string()),
            schedule: Some("0 3 * * *".to_string()),
            retries,
            retry_delay_ms,
            artifact_dir: self.artifact_dir.path().to_path_buf(),
            pg_dump_bin: self.pg_dump_bin(),
            psql_bin: self.psql_bin(),
            ..CliConfig::default()
        }
    }

    pub fn app_config(&self, retries: u32, retry_delay_ms: u64) -> AppConfig {
        AppConfig::resolve(&self.cli_config(retries, retry_delay_ms), None)
            .expect("Fake tools config should be valid")
    }

    fn read_counter(&self, name: &str) -> u32 {
        fs::read_to_string(self.bin_dir.path().join(name))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    fn read_lines(&self, name: &str) -> Vec<String> {
        fs::read_to_string(self.bin_dir.path().join(name))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).expect("Failed to write script");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .expect("Failed to make script executable");
}
