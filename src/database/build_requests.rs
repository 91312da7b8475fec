//! # Build Request Bookkeeping
//!
//! Creation, completion and merge marking for build requests and the build
//! sets and source stamps they hang off.

use super::{begin_write, push_in_list, PersistenceResult};
use crate::config::MAX_FINISH_BATCH_SIZE;
use crate::logging::log_database_operation;
use crate::models::{BuildRequest, BuildSet, NewBuildRequest, NewSourceStamp, SourceStamp};
use crate::results::BuildResult;
use crate::utils::clock::Clock;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::sync::Arc;

#[derive(Clone)]
pub struct BuildRequestsConnector {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl BuildRequestsConnector {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Create a source stamp set holding `source_stamps` and a build set on
    /// top of it; returns the build set id
    pub async fn insert_build_set(
        &self,
        reason: Option<&str>,
        source_stamps: &[NewSourceStamp],
    ) -> PersistenceResult<i64> {
        let submitted_at = self.clock.epoch_seconds();
        let mut tx = begin_write(&self.pool).await?;

        let source_stamp_set_id = sqlx::query("INSERT INTO sourcestampsets DEFAULT VALUES")
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        for stamp in source_stamps {
            sqlx::query(
                r#"
                INSERT INTO sourcestamps (branch, revision, repository, codebase, project, sourcestampsetid)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&stamp.branch)
            .bind(&stamp.revision)
            .bind(&stamp.repository)
            .bind(&stamp.codebase)
            .bind(&stamp.project)
            .bind(source_stamp_set_id)
            .execute(&mut *tx)
            .await?;
        }

        let build_set_id = sqlx::query(
            "INSERT INTO buildsets (reason, sourcestampsetid, submitted_at) VALUES (?, ?, ?)",
        )
        .bind(reason)
        .bind(source_stamp_set_id)
        .bind(submitted_at)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;
        Ok(build_set_id)
    }

    pub async fn get_build_set(&self, id: i64) -> PersistenceResult<Option<BuildSet>> {
        let build_set = sqlx::query_as::<_, BuildSet>("SELECT * FROM buildsets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(build_set)
    }

    pub async fn get_source_stamps(
        &self,
        source_stamp_set_id: i64,
    ) -> PersistenceResult<Vec<SourceStamp>> {
        let stamps = sqlx::query_as::<_, SourceStamp>(
            r#"
            SELECT id, branch, revision, repository, codebase, project, sourcestampsetid
            FROM sourcestamps WHERE sourcestampsetid = ? ORDER BY id
            "#,
        )
        .bind(source_stamp_set_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(stamps)
    }

    /// Queue a new, incomplete request; returns its id
    pub async fn insert_build_request(&self, new: &NewBuildRequest) -> PersistenceResult<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO buildrequests (buildsetid, buildername, priority, complete, submitted_at, slavepool)
            VALUES (?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(new.build_set_id)
        .bind(&new.builder_name)
        .bind(new.priority)
        .bind(self.clock.epoch_seconds())
        .bind(&new.worker_pool)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        tracing::debug!(request_id = id, builder = %new.builder_name, "Build request queued");
        Ok(id)
    }

    pub async fn get_build_request(&self, id: i64) -> PersistenceResult<Option<BuildRequest>> {
        let request =
            sqlx::query_as::<_, BuildRequest>("SELECT * FROM buildrequests WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(request)
    }

    /// Mark the listed requests complete with `result`, atomically.
    ///
    /// Requests that are already complete keep their recorded result.
    /// Returns the number of requests updated.
    pub async fn complete_build_requests(
        &self,
        ids: &[i64],
        result: BuildResult,
    ) -> PersistenceResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let now = self.clock.epoch_seconds();
        let mut tx = begin_write(&self.pool).await?;
        let updated = complete_requests_in(&mut tx, ids, result, now).await?;
        tx.commit().await?;
        log_database_operation(
            "complete_build_requests",
            Some("buildrequests"),
            Some(updated),
            "success",
            None,
        );
        Ok(updated)
    }

    /// Record that the listed requests are satisfied by request `into`
    pub async fn mark_merged(&self, ids: &[i64], into: i64) -> PersistenceResult<u64> {
        if ids.iter().all(|id| *id == into) {
            return Ok(0);
        }

        let mut tx = begin_write(&self.pool).await?;
        let updated = mark_merged_in(&mut tx, ids, into).await?;
        tx.commit().await?;

        tracing::debug!(into, merged = updated, "Build requests merged");
        Ok(updated)
    }
}

/// Complete the still-open requests among `ids`, batched on `conn`
pub(crate) async fn complete_requests_in(
    conn: &mut SqliteConnection,
    ids: &[i64],
    result: BuildResult,
    now: i64,
) -> Result<u64, sqlx::Error> {
    let mut updated = 0;
    for batch in ids.chunks(MAX_FINISH_BATCH_SIZE) {
        let mut query =
            QueryBuilder::<Sqlite>::new("UPDATE buildrequests SET complete = 1, results = ");
        query.push_bind(result.code());
        query.push(", complete_at = ");
        query.push_bind(now);
        query.push(" WHERE complete = 0 AND id IN ");
        push_in_list(&mut query, batch.iter().copied());
        updated += query.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(updated)
}

/// Point every request in `ids` other than `into` at `into`
pub(crate) async fn mark_merged_in(
    conn: &mut SqliteConnection,
    ids: &[i64],
    into: i64,
) -> Result<u64, sqlx::Error> {
    let merged: Vec<i64> = ids.iter().copied().filter(|id| *id != into).collect();
    let mut updated = 0;
    for batch in merged.chunks(MAX_FINISH_BATCH_SIZE) {
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE buildrequests SET mergebrid = ");
        query.push_bind(into);
        query.push(" WHERE id IN ");
        push_in_list(&mut query, batch.iter().copied());
        updated += query.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(updated)
}

impl std::fmt::Debug for BuildRequestsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildRequestsConnector").finish_non_exhaustive()
    }
}
