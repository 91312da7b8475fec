use super::{decode_results, decode_time};
use crate::results::BuildResult;
use crate::utils::clock::epoch_to_datetime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

/// A group of build requests submitted together against one source stamp set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSet {
    pub id: i64,
    pub external_id: Option<String>,
    pub reason: Option<String>,
    pub source_stamp_set_id: i64,
    pub submitted_at: DateTime<Utc>,
    pub complete: bool,
    pub complete_at: Option<DateTime<Utc>>,
    pub results: Option<BuildResult>,
}

impl<'r> FromRow<'r, SqliteRow> for BuildSet {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let complete: i64 = row.try_get("complete")?;
        Ok(Self {
            id: row.try_get("id")?,
            external_id: row.try_get("external_idstring")?,
            reason: row.try_get("reason")?,
            source_stamp_set_id: row.try_get("sourcestampsetid")?,
            submitted_at: epoch_to_datetime(row.try_get("submitted_at")?),
            complete: complete != 0,
            complete_at: decode_time(row.try_get("complete_at")?),
            results: decode_results(row.try_get("results")?)?,
        })
    }
}
