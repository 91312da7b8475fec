use super::{decode_results, decode_time};
use crate::results::BuildResult;
use crate::utils::clock::epoch_to_datetime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

/// One concrete execution attempt of a build request on a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: i64,
    pub build_request_id: i64,
    pub number: i64,
    pub worker_name: Option<String>,
    pub start_time: DateTime<Utc>,
    /// Absent while the build is running
    pub finish_time: Option<DateTime<Utc>>,
    pub results: Option<BuildResult>,
}

impl Build {
    pub fn is_finished(&self) -> bool {
        self.finish_time.is_some()
    }
}

impl<'r> FromRow<'r, SqliteRow> for Build {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            build_request_id: row.try_get("brid")?,
            number: row.try_get("number")?,
            worker_name: row.try_get("slavename")?,
            start_time: epoch_to_datetime(row.try_get("start_time")?),
            finish_time: decode_time(row.try_get("finish_time")?),
            results: decode_results(row.try_get("results")?)?,
        })
    }
}

/// Build request joined with whatever builds it has, including none.
///
/// Build columns are absent when the request has not started a build yet;
/// `results` always comes from the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildWithResult {
    pub id: Option<i64>,
    pub build_request_id: i64,
    pub number: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub results: Option<BuildResult>,
}

impl<'r> FromRow<'r, SqliteRow> for BuildWithResult {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            build_request_id: row.try_get("brid")?,
            number: row.try_get("number")?,
            start_time: decode_time(row.try_get("start_time")?),
            finish_time: decode_time(row.try_get("finish_time")?),
            results: decode_results(row.try_get("results")?)?,
        })
    }
}

/// Everything needed to record a complete historical build in one go:
/// source stamp set, source stamp, build set, build request and build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFullBuild {
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub repository: String,
    pub project: String,
    pub codebase: String,
    pub reason: Option<String>,
    pub submitted_at: i64,
    /// Absent while the build is still in progress
    pub complete_at: Option<i64>,
    pub builder_name: String,
    pub worker_pool: Option<String>,
    pub number: i64,
    pub worker_name: Option<String>,
    pub results: Option<BuildResult>,
}
