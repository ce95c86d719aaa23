mod file_config;

pub use file_config::{FileConfig, PipelineConfig, RetryConfig, ScheduleConfig};

use crate::background_jobs::{CronSchedule, ScheduleError};
use crate::server::RequestsLoggingLevel;
use crate::sync::DEFAULT_MAX_OUTPUT_BYTES;
use clap::ValueEnum;
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{setting} must be specified via {flag}, {env} or in the config file")]
    Missing {
        setting: &'static str,
        flag: &'static str,
        env: &'static str,
    },

    #[error("Invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Retries must be at least 1")]
    ZeroRetries,

    #[error("Artifact directory does not exist: {0:?}")]
    ArtifactDirMissing(PathBuf),

    #[error("Artifact directory is not a directory: {0:?}")]
    ArtifactDirNotDirectory(PathBuf),

    #[error("Could not split {setting} into arguments: {value:?}")]
    InvalidExtraArgs { setting: &'static str, value: String },

    #[error("Unknown requests logging level: {0:?}")]
    InvalidLoggingLevel(String),
}

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub source_url: Option<String>,
    pub target_url: Option<String>,
    pub schedule: Option<String>,
    pub timezone: String,
    pub run_on_startup: bool,
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub host: String,
    pub port: u16,
    pub metrics_port: Option<u16>,
    pub logging_level: RequestsLoggingLevel,
    pub artifact_dir: PathBuf,
    pub pg_dump_bin: String,
    pub psql_bin: String,
    pub pg_dump_extra_args: Option<String>,
    pub psql_extra_args: Option<String>,
    pub max_output_bytes: usize,
}

impl Default for CliConfig {
    fn default() -> Self {
        let pipeline = PipelineSettings::default();
        Self {
            source_url: None,
            target_url: None,
            schedule: None,
            timezone: DEFAULT_TIMEZONE.to_string(),
            run_on_startup: false,
            retries: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            metrics_port: None,
            logging_level: RequestsLoggingLevel::default(),
            artifact_dir: pipeline.artifact_dir,
            pg_dump_bin: pipeline.pg_dump_bin,
            psql_bin: pipeline.psql_bin,
            pg_dump_extra_args: None,
            psql_extra_args: None,
            max_output_bytes: pipeline.max_output_bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub source_url: String,
    pub target_url: String,
    pub host: String,
    pub port: u16,
    pub metrics_port: Option<u16>,
    pub logging_level: RequestsLoggingLevel,

    // Feature settings
    pub schedule: ScheduleSettings,
    pub retry: RetrySettings,
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub cron: CronSchedule,
    pub run_on_startup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    /// Total attempts per firing, including the first.
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Directory where dump artifacts are written.
    pub artifact_dir: PathBuf,
    pub pg_dump_bin: String,
    pub psql_bin: String,
    pub pg_dump_extra_args: Vec<String>,
    pub psql_extra_args: Vec<String>,
    /// Per-stream cap on captured command output.
    pub max_output_bytes: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("."),
            pg_dump_bin: "pg_dump".to_string(),
            psql_bin: "psql".to_string(),
            pg_dump_extra_args: Vec::new(),
            psql_extra_args: Vec::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self, ConfigError> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let source_url = non_empty(file.source_url)
            .or_else(|| non_empty(cli.source_url.clone()))
            .ok_or(ConfigError::Missing {
                setting: "source_url",
                flag: "--source-url",
                env: "DATABASE_URL_SOURCE",
            })?;
        let target_url = non_empty(file.target_url)
            .or_else(|| non_empty(cli.target_url.clone()))
            .ok_or(ConfigError::Missing {
                setting: "target_url",
                flag: "--target-url",
                env: "DATABASE_URL_TARGET",
            })?;

        let host = file.host.unwrap_or_else(|| cli.host.clone());
        let port = file.port.unwrap_or(cli.port);
        let metrics_port = file.metrics_port.or(cli.metrics_port);

        let logging_level = match file.logging_level {
            Some(s) => parse_logging_level(&s).ok_or(ConfigError::InvalidLoggingLevel(s))?,
            None => cli.logging_level.clone(),
        };

        // Schedule
        let schedule_file = file.schedule.unwrap_or_default();
        let expression = non_empty(schedule_file.cron)
            .or_else(|| non_empty(cli.schedule.clone()))
            .ok_or(ConfigError::Missing {
                setting: "schedule",
                flag: "--schedule",
                env: "SCHEDULE_TIME",
            })?;
        let timezone = non_empty(schedule_file.timezone)
            .or_else(|| non_empty(Some(cli.timezone.clone())))
            .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
        let schedule = ScheduleSettings {
            cron: CronSchedule::parse(&expression, &timezone)?,
            run_on_startup: schedule_file.run_on_startup.unwrap_or(cli.run_on_startup),
        };

        // Retry
        let retry_file = file.retry.unwrap_or_default();
        let retry = RetrySettings {
            max_attempts: retry_file.max_attempts.unwrap_or(cli.retries),
            delay_ms: retry_file.delay_ms.unwrap_or(cli.retry_delay_ms),
        };
        if retry.max_attempts == 0 {
            return Err(ConfigError::ZeroRetries);
        }

        // Pipeline
        let pipeline_file = file.pipeline.unwrap_or_default();
        let artifact_dir = pipeline_file
            .artifact_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| cli.artifact_dir.clone());
        if !artifact_dir.exists() {
            return Err(ConfigError::ArtifactDirMissing(artifact_dir));
        }
        if !artifact_dir.is_dir() {
            return Err(ConfigError::ArtifactDirNotDirectory(artifact_dir));
        }

        let pg_dump_extra_args = match pipeline_file.pg_dump_extra_args {
            Some(args) => args,
            None => split_args("pg_dump_extra_args", cli.pg_dump_extra_args.as_deref())?,
        };
        let psql_extra_args = match pipeline_file.psql_extra_args {
            Some(args) => args,
            None => split_args("psql_extra_args", cli.psql_extra_args.as_deref())?,
        };

        let pipeline = PipelineSettings {
            artifact_dir,
            pg_dump_bin: pipeline_file
                .pg_dump_bin
                .unwrap_or_else(|| cli.pg_dump_bin.clone()),
            psql_bin: pipeline_file
                .psql_bin
                .unwrap_or_else(|| cli.psql_bin.clone()),
            pg_dump_extra_args,
            psql_extra_args,
            max_output_bytes: pipeline_file
                .max_output_bytes
                .unwrap_or(cli.max_output_bytes),
        };

        Ok(Self {
            source_url,
            target_url,
            host,
            port,
            metrics_port,
            logging_level,
            schedule,
            retry,
            pipeline,
        })
    }
}

/// Empty or whitespace-only values count as unset.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn split_args(setting: &'static str, value: Option<&str>) -> Result<Vec<String>, ConfigError> {
    match value {
        None => Ok(Vec::new()),
        Some(s) if s.trim().is_empty() => Ok(Vec::new()),
        Some(s) => shlex::split(s).ok_or_else(|| ConfigError::InvalidExtraArgs {
            setting,
            value: s.to_string(),
        }),
    }
}

fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli(dir: &TempDir) -> CliConfig {
        CliConfig {
            source_url: Some("postgres://prod/app".to_string()),
            target_url: Some("postgres://replica/app".to_string()),
            schedule: Some("0 3 * * *".to_string()),
            artifact_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_with_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::resolve(&cli(&dir), None).unwrap();

        assert_eq!(config.source_url, "postgres://prod/app");
        assert_eq!(config.target_url, "postgres://replica/app");
        assert_eq!(config.port, 3000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.logging_level, RequestsLoggingLevel::Path);
        assert_eq!(config.retry, RetrySettings::default());
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.delay_ms, 1000);
        assert_eq!(config.schedule.cron.expression(), "0 3 * * *");
        assert_eq!(config.schedule.cron.timezone(), chrono_tz::UTC);
        assert!(!config.schedule.run_on_startup);
        assert_eq!(config.pipeline.pg_dump_bin, "pg_dump");
        assert_eq!(config.pipeline.psql_bin, "psql");
        assert!(config.pipeline.pg_dump_extra_args.is_empty());
        assert_eq!(config.pipeline.max_output_bytes, 512_000_000);
    }

    #[test]
    fn test_toml_overrides_cli() {
        let dir = TempDir::new().unwrap();
        let file: FileConfig = toml::from_str(
            r#"
            target_url = "postgres://staging/app"
            port = 8080
            logging_level = "headers"

            [schedule]
            timezone = "Europe/Rome"
            run_on_startup = true

            [retry]
            max_attempts = 2
            "#,
        )
        .unwrap();

        let config = AppConfig::resolve(&cli(&dir), Some(file)).unwrap();

        assert_eq!(config.source_url, "postgres://prod/app");
        assert_eq!(config.target_url, "postgres://staging/app");
        assert_eq!(config.port, 8080);
        assert_eq!(config.logging_level, RequestsLoggingLevel::Headers);
        assert_eq!(config.schedule.cron.timezone(), chrono_tz::Europe::Rome);
        assert!(config.schedule.run_on_startup);
        assert_eq!(config.retry.max_attempts, 2);
        // Not in the file, so the CLI value stays
        assert_eq!(config.retry.delay_ms, 1000);
    }

    #[test]
    fn test_missing_required_settings() {
        let dir = TempDir::new().unwrap();

        let mut no_source = cli(&dir);
        no_source.source_url = None;
        let err = AppConfig::resolve(&no_source, None).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Missing {
                setting: "source_url",
                ..
            }
        ));
        assert!(err.to_string().contains("DATABASE_URL_SOURCE"));

        let mut blank_target = cli(&dir);
        blank_target.target_url = Some("  ".to_string());
        assert!(matches!(
            AppConfig::resolve(&blank_target, None).unwrap_err(),
            ConfigError::Missing {
                setting: "target_url",
                ..
            }
        ));

        let mut no_schedule = cli(&dir);
        no_schedule.schedule = None;
        assert!(matches!(
            AppConfig::resolve(&no_schedule, None).unwrap_err(),
            ConfigError::Missing {
                setting: "schedule",
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_schedule_and_timezone() {
        let dir = TempDir::new().unwrap();

        let mut bad_cron = cli(&dir);
        bad_cron.schedule = Some("every day".to_string());
        assert!(matches!(
            AppConfig::resolve(&bad_cron, None).unwrap_err(),
            ConfigError::Schedule(ScheduleError::FieldCount { count: 2, .. })
        ));

        let mut bad_tz = cli(&dir);
        bad_tz.timezone = "Nowhere/Land".to_string();
        assert!(matches!(
            AppConfig::resolve(&bad_tz, None).unwrap_err(),
            ConfigError::Schedule(ScheduleError::UnknownTimezone(_))
        ));
    }

    #[test]
    fn test_zero_retries_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = cli(&dir);
        config.retries = 0;
        assert!(matches!(
            AppConfig::resolve(&config, None).unwrap_err(),
            ConfigError::ZeroRetries
        ));
    }

    #[test]
    fn test_artifact_dir_validation() {
        let dir = TempDir::new().unwrap();

        let mut missing = cli(&dir);
        missing.artifact_dir = dir.path().join("does-not-exist");
        assert!(matches!(
            AppConfig::resolve(&missing, None).unwrap_err(),
            ConfigError::ArtifactDirMissing(_)
        ));

        let file_path = dir.path().join("a-file");
        std::fs::write(&file_path, "").unwrap();
        let mut not_dir = cli(&dir);
        not_dir.artifact_dir = file_path;
        assert!(matches!(
            AppConfig::resolve(&not_dir, None).unwrap_err(),
            ConfigError::ArtifactDirNotDirectory(_)
        ));
    }

    #[test]
    fn test_extra_args_are_shell_split() {
        let dir = TempDir::new().unwrap();
        let mut config = cli(&dir);
        config.pg_dump_extra_args =
            Some("--exclude-table=audit_log --schema 'my schema'".to_string());
        config.psql_extra_args = Some("".to_string());

        let resolved = AppConfig::resolve(&config, None).unwrap();
        assert_eq!(
            resolved.pipeline.pg_dump_extra_args,
            vec!["--exclude-table=audit_log", "--schema", "my schema"]
        );
        assert!(resolved.pipeline.psql_extra_args.is_empty());

        config.psql_extra_args = Some("--set 'unterminated".to_string());
        assert!(matches!(
            AppConfig::resolve(&config, None).unwrap_err(),
            ConfigError::InvalidExtraArgs {
                setting: "psql_extra_args",
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_logging_level_in_file() {
        let dir = TempDir::new().unwrap();
        let file = FileConfig {
            logging_level: Some("verbose".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            AppConfig::resolve(&cli(&dir), Some(file)).unwrap_err(),
            ConfigError::InvalidLoggingLevel(_)
        ));
    }
}
