use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub source_url: Option<String>,
    pub target_url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub logging_level: Option<String>,

    // Feature configs
    pub schedule: Option<ScheduleConfig>,
    pub retry: Option<RetryConfig>,
    pub pipeline: Option<PipelineConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Cron expression, 5, 6 or 7 fields.
    pub cron: Option<String>,
    /// IANA timezone name, e.g. "Europe/Rome".
    pub timezone: Option<String>,
    pub run_on_startup: Option<bool>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    pub artifact_dir: Option<String>,
    pub pg_dump_bin: Option<String>,
    pub psql_bin: Option<String>,
    pub pg_dump_extra_args: Option<Vec<String>>,
    pub psql_extra_args: Option<Vec<String>>,
    pub max_output_bytes: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
