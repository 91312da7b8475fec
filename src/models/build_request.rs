use super::{decode_results, decode_time};
use crate::results::BuildResult;
use crate::utils::clock::epoch_to_datetime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

/// Priority assigned to requests created without an explicit one
pub const DEFAULT_PRIORITY: i64 = 50;

/// A unit of requested work for one builder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: i64,
    pub build_set_id: i64,
    pub builder_name: String,
    pub priority: i64,
    pub complete: bool,
    pub results: Option<BuildResult>,
    pub submitted_at: DateTime<Utc>,
    pub complete_at: Option<DateTime<Utc>>,
    /// Request whose build satisfied this one, when merged
    pub merged_into: Option<i64>,
    pub worker_pool: Option<String>,
}

impl BuildRequest {
    pub fn is_merged(&self) -> bool {
        self.merged_into.is_some()
    }
}

impl<'r> FromRow<'r, SqliteRow> for BuildRequest {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let complete: i64 = row.try_get("complete")?;
        Ok(Self {
            id: row.try_get("id")?,
            build_set_id: row.try_get("buildsetid")?,
            builder_name: row.try_get("buildername")?,
            priority: row.try_get("priority")?,
            complete: complete != 0,
            results: decode_results(row.try_get("results")?)?,
            submitted_at: epoch_to_datetime(row.try_get("submitted_at")?),
            complete_at: decode_time(row.try_get("complete_at")?),
            merged_into: row.try_get("mergebrid")?,
            worker_pool: row.try_get("slavepool")?,
        })
    }
}

/// New build request for insertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBuildRequest {
    pub build_set_id: i64,
    pub builder_name: String,
    pub priority: i64,
    pub worker_pool: Option<String>,
}

impl NewBuildRequest {
    pub fn new(build_set_id: i64, builder_name: impl Into<String>) -> Self {
        Self {
            build_set_id,
            builder_name: builder_name.into(),
            priority: DEFAULT_PRIORITY,
            worker_pool: None,
        }
    }
}
