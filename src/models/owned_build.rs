use crate::results::BuildResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Denormalized row describing a recent build owned by a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnedBuild {
    pub builder_name: String,
    /// Display name from the builder resolver, falling back to `builder_name`
    pub friendly_name: String,
    pub complete: bool,
    pub build_id: i64,
    pub build_number: i64,
    pub reason: Option<String>,
    pub project: Option<String>,
    pub worker_name: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub complete_at: Option<DateTime<Utc>>,
    pub source_stamp_set_id: i64,
    pub results: Option<BuildResult>,
}
