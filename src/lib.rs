//! pg-sync library
//!
//! Periodically copies a PostgreSQL database into another one with
//! `pg_dump` and `psql`. The modules are exposed for the binary and for
//! integration tests.

pub mod background_jobs;
pub mod config;
pub mod server;
pub mod sync;

// Re-export commonly used types for convenience
pub use background_jobs::jobs::DatabaseSyncJob;
pub use config::{AppConfig, CliConfig, FileConfig};
pub use server::{run_server, RequestsLoggingLevel, ServerConfig};
pub use sync::{Pipeline, ProcessRunner, RetryPolicy};
