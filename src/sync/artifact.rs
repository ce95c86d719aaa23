//! Naming of the per-cycle dump artifact.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

/// Suffix of every dump artifact.
pub const ARTIFACT_SUFFIX: &str = ".sql";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Returns a new artifact identifier for a cycle starting now.
///
/// The identifier is an ISO-8601-like UTC timestamp with nanosecond
/// resolution, with `-` in place of `:` so it is safe on every filesystem,
/// followed by a process-wide sequence number, e.g.
/// `2024-05-01T03-00-00.123456789Z-0.sql`.
pub fn new_artifact_id() -> String {
    artifact_id_at(Utc::now())
}

/// Same as [`new_artifact_id`] but for an explicit instant.
pub fn artifact_id_at(at: DateTime<Utc>) -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}-{}{}",
        at.format("%Y-%m-%dT%H-%M-%S%.9fZ"),
        seq,
        ARTIFACT_SUFFIX
    )
}
