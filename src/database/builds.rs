//! # Builds Connector
//!
//! Reads and writes `builds` rows, propagates completion across merged
//! requests and answers the history queries used by status pages.
//!
//! ## History queries
//!
//! `get_last_builds_numbers*` only consider builds that have finished, whose
//! request completed, was not merged into another request and did not end in
//! a retry-class result ([`RETRY_CLASS_RESULTS`]). That exclusion applies
//! whatever result filter the caller passes. Limits are capped at
//! [`MAX_HISTORY_LIMIT`](crate::config::MAX_HISTORY_LIMIT).

use super::resolver::BuilderResolver;
use super::build_requests::{complete_requests_in, mark_merged_in};
use super::{begin_write, push_in_list, PersistenceError, PersistenceResult};
use crate::config::{ExecutionConfig, MAX_FINISH_BATCH_SIZE, MAX_HISTORY_LIMIT};
use crate::logging::log_database_operation;
use crate::models::{
    decode_results, decode_time, Build, BuildWithResult, NewFullBuild, OwnedBuild,
    SourceStampFilter,
};
use crate::results::{BuildResult, RETRY_CLASS_RESULTS};
use crate::utils::clock::Clock;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Rows touched by [`BuildsConnector::complete_merged_builds`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildCompletion {
    pub finished: u64,
    /// Sibling builds that received the representative's finish time
    pub merged: u64,
    pub requests_completed: u64,
}

#[derive(Clone)]
pub struct BuildsConnector {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    finish_batch_size: usize,
    history_limit_cap: u32,
}

impl BuildsConnector {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            finish_batch_size: MAX_FINISH_BATCH_SIZE,
            history_limit_cap: MAX_HISTORY_LIMIT,
        }
    }

    /// Apply batch size and history cap, clamped to the storage limits
    pub fn with_config(mut self, config: &ExecutionConfig) -> Self {
        self.finish_batch_size = config.finish_batch_size.clamp(1, MAX_FINISH_BATCH_SIZE);
        self.history_limit_cap = config.history_limit_cap.clamp(1, MAX_HISTORY_LIMIT);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get_build(&self, id: i64) -> PersistenceResult<Option<Build>> {
        let build = sqlx::query_as::<_, Build>("SELECT * FROM builds WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(build)
    }

    pub async fn get_builds_for_request(&self, request_id: i64) -> PersistenceResult<Vec<Build>> {
        let builds = sqlx::query_as::<_, Build>("SELECT * FROM builds WHERE brid = ? ORDER BY id")
            .bind(request_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(builds)
    }

    /// One row per build of the request, or a single build-less row carrying
    /// the request's result when no build exists yet. Empty only when the
    /// request itself does not exist.
    pub async fn get_builds_and_result_for_request(
        &self,
        request_id: i64,
    ) -> PersistenceResult<Vec<BuildWithResult>> {
        let rows = sqlx::query_as::<_, BuildWithResult>(
            r#"
            SELECT b.id AS id, b.number AS number, br.id AS brid, b.start_time AS start_time,
                   b.finish_time AS finish_time, br.results AS results
            FROM buildrequests br
            LEFT OUTER JOIN builds b ON br.id = b.brid
            WHERE br.id = ?
            ORDER BY b.id
            "#,
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Highest build number recorded for the request
    pub async fn get_build_number_for_request(
        &self,
        request_id: i64,
    ) -> PersistenceResult<Option<i64>> {
        let number = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(number) FROM builds WHERE brid = ?",
        )
        .bind(request_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(number)
    }

    /// Fails with [`PersistenceError::NotFound`] when no such build exists
    pub async fn get_build_id_for_request(
        &self,
        request_id: i64,
        number: i64,
    ) -> PersistenceResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM builds WHERE brid = ? AND number = ? ORDER BY id LIMIT 1",
        )
        .bind(request_id)
        .bind(number)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(PersistenceError::NotFound { request_id, number })
    }

    /// Distinct build numbers used by any of `request_ids`, ascending
    pub async fn get_build_numbers_for_requests(
        &self,
        request_ids: &[i64],
    ) -> PersistenceResult<Vec<i64>> {
        if request_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query =
            QueryBuilder::<Sqlite>::new("SELECT MAX(number) AS number, brid FROM builds WHERE brid IN ");
        push_in_list(&mut query, request_ids.iter().copied());
        query.push(" GROUP BY number, brid ORDER BY number");

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut numbers = Vec::new();
        for row in rows {
            let number: i64 = row.try_get("number")?;
            if !numbers.contains(&number) {
                numbers.push(number);
            }
        }
        Ok(numbers)
    }

    /// Record a build that has just started; returns its id
    pub async fn add_build(
        &self,
        request_id: i64,
        number: i64,
        worker_name: Option<&str>,
    ) -> PersistenceResult<i64> {
        let mut conn = self.pool.acquire().await?;
        let id = insert_build(
            &mut conn,
            request_id,
            number,
            worker_name,
            self.clock.epoch_seconds(),
        )
        .await?;
        tracing::debug!(build_id = id, request_id, number, worker_name, "Build added");
        Ok(id)
    }

    /// Start the build satisfying `request_ids`: one build row per request,
    /// all numbered `number`, and every request after the first marked as
    /// merged into it. Either all rows are written or none are.
    ///
    /// Returns the build ids in request order, the representative first.
    pub async fn start_merged_builds(
        &self,
        request_ids: &[i64],
        number: i64,
        worker_name: Option<&str>,
    ) -> PersistenceResult<Vec<i64>> {
        let Some((&representative, siblings)) = request_ids.split_first() else {
            return Ok(Vec::new());
        };

        let start_time = self.clock.epoch_seconds();
        let mut tx = begin_write(&self.pool).await?;
        let mut build_ids = Vec::with_capacity(request_ids.len());
        for request_id in request_ids {
            build_ids.push(insert_build(&mut tx, *request_id, number, worker_name, start_time).await?);
        }
        let merged = mark_merged_in(&mut tx, siblings, representative).await?;
        tx.commit().await?;

        tracing::debug!(
            build_id = build_ids[0],
            request_id = representative,
            number,
            merged,
            "Merged builds started"
        );
        Ok(build_ids)
    }

    /// Close out a build in one transaction: finish `build_id` with
    /// `result`, copy its finish time onto the sibling builds and complete
    /// every request in `request_ids`.
    pub async fn complete_merged_builds(
        &self,
        build_id: i64,
        request_ids: &[i64],
        number: i64,
        result: BuildResult,
    ) -> PersistenceResult<BuildCompletion> {
        let started = Instant::now();
        let now = self.clock.epoch_seconds();
        let mut tx = begin_write(&self.pool).await?;

        let finished =
            finish_builds_in(&mut tx, &[build_id], now, Some(result), self.finish_batch_size)
                .await?;
        let merged = propagate_merged_finish(&mut tx, request_ids, number).await?;
        let requests_completed = complete_requests_in(&mut tx, request_ids, result, now).await?;
        tx.commit().await?;

        log_database_operation(
            "complete_merged_builds",
            Some("builds"),
            Some(finished + merged),
            "success",
            Some(started.elapsed().as_millis() as u64),
        );
        Ok(BuildCompletion {
            finished,
            merged,
            requests_completed,
        })
    }

    /// Stamp every listed build as finished now, atomically
    pub async fn finish_builds(&self, ids: &[i64]) -> PersistenceResult<u64> {
        self.finish_builds_with_result(ids, None).await
    }

    /// Like [`finish_builds`](Self::finish_builds), also recording `result`
    /// on the build rows when given
    pub async fn finish_builds_with_result(
        &self,
        ids: &[i64],
        result: Option<BuildResult>,
    ) -> PersistenceResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        let now = self.clock.epoch_seconds();
        let mut tx = begin_write(&self.pool).await?;
        let updated = finish_builds_in(&mut tx, ids, now, result, self.finish_batch_size).await?;
        tx.commit().await?;
        log_database_operation(
            "finish_builds",
            Some("builds"),
            Some(updated),
            "success",
            Some(started.elapsed().as_millis() as u64),
        );
        Ok(updated)
    }

    /// Copy the finish time of `request_ids[0]`'s build `number` onto the
    /// still-unfinished builds with the same number of the sibling requests.
    ///
    /// Only the finish time is propagated; results are left untouched. Returns
    /// the number of rows updated, zero when there is nothing to propagate.
    pub async fn finished_merged_builds(
        &self,
        request_ids: &[i64],
        number: i64,
    ) -> PersistenceResult<u64> {
        if request_ids.len() < 2 {
            return Ok(0);
        }

        let mut tx = begin_write(&self.pool).await?;
        let updated = propagate_merged_finish(&mut tx, request_ids, number).await?;
        tx.commit().await?;

        log_database_operation(
            "finished_merged_builds",
            Some("builds"),
            Some(updated),
            "success",
            None,
        );
        Ok(updated)
    }

    /// Record that `user_id` owns build `build_id`
    pub async fn create_build_user(
        &self,
        build_id: i64,
        user_id: i64,
        finish_time: DateTime<Utc>,
    ) -> PersistenceResult<()> {
        sqlx::query("INSERT INTO build_user (buildid, userid, finish_time) VALUES (?, ?, ?)")
            .bind(build_id)
            .bind(user_id)
            .bind(finish_time.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn history_limit(&self, limit: u32) -> i64 {
        i64::from(limit.min(self.history_limit_cap))
    }

    /// Recent build numbers run on `worker_name`, grouped by builder name,
    /// most recently completed first
    pub async fn get_last_builds_numbers_by_worker(
        &self,
        worker_name: &str,
        results: Option<&[BuildResult]>,
        limit: u32,
    ) -> PersistenceResult<BTreeMap<String, Vec<i64>>> {
        let mut query = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT br.id AS brid, br.buildername AS buildername, b.number AS number,
                   MAX(br.complete_at) AS complete_at
            FROM buildrequests br
            JOIN builds b ON br.id = b.brid AND b.finish_time IS NOT NULL
            WHERE b.slavename = "#,
        );
        query.push_bind(worker_name.to_string());
        push_history_filters(&mut query, results);
        query.push(
            " GROUP BY br.id, br.buildername, b.number ORDER BY complete_at DESC, br.id DESC LIMIT ",
        );
        query.push_bind(self.history_limit(limit));

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut last_builds: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        for row in rows {
            let builder: String = row.try_get("buildername")?;
            let number: i64 = row.try_get("number")?;
            last_builds.entry(builder).or_default().push(number);
        }
        Ok(last_builds)
    }

    /// Recent distinct build numbers of `builder_name`, most recently
    /// completed first, optionally restricted to requests built from every
    /// one of `source_stamps`
    pub async fn get_last_builds_numbers(
        &self,
        builder_name: &str,
        source_stamps: Option<&[SourceStampFilter]>,
        results: Option<&[BuildResult]>,
        limit: u32,
    ) -> PersistenceResult<Vec<i64>> {
        let mut query = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT br.id AS brid, MAX(b.number) AS number, MAX(br.complete_at) AS complete_at
            FROM buildrequests br
            JOIN builds b ON br.id = b.brid AND b.finish_time IS NOT NULL
            WHERE br.buildername = "#,
        );
        query.push_bind(builder_name.to_string());
        push_history_filters(&mut query, results);

        for stamp in source_stamps.unwrap_or_default() {
            query.push(
                r#" AND EXISTS (
                    SELECT 1 FROM buildsets bs
                    JOIN sourcestamps ss ON ss.sourcestampsetid = bs.sourcestampsetid
                    WHERE bs.id = br.buildsetid AND ss.codebase = "#,
            );
            query.push_bind(stamp.codebase.clone());
            query.push(" AND ss.branch IS ");
            query.push_bind(stamp.branch.clone());
            if let Some(revision) = &stamp.revision {
                query.push(" AND ss.revision = ");
                query.push_bind(revision.clone());
            }
            query.push(")");
        }

        query.push(" GROUP BY br.id ORDER BY complete_at DESC, br.id DESC LIMIT ");
        query.push_bind(self.history_limit(limit));

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut numbers = Vec::new();
        for row in rows {
            let number: i64 = row.try_get("number")?;
            if !numbers.contains(&number) {
                numbers.push(number);
            }
        }
        Ok(numbers)
    }

    /// Builds owned by `user_id` that finished within the last `day_count`
    /// days, newest start first
    pub async fn get_last_builds_owned_by(
        &self,
        user_id: i64,
        resolver: &dyn BuilderResolver,
        day_count: u32,
    ) -> PersistenceResult<Vec<OwnedBuild>> {
        let from_time = self.clock.epoch_seconds() - i64::from(day_count) * SECONDS_PER_DAY;

        let rows = sqlx::query(
            r#"
            SELECT br.buildername AS buildername, br.complete AS complete,
                   b.id AS build_id, b.number AS build_number, bs.reason AS reason,
                   b.slavename AS slavename, br.submitted_at AS submitted_at,
                   br.complete_at AS complete_at, bs.sourcestampsetid AS sourcestampsetid,
                   br.results AS results
            FROM buildsets bs
            JOIN buildrequests br ON br.buildsetid = bs.id
            JOIN builds b ON b.brid = br.id
            JOIN build_user bu ON bu.buildid = b.id
            WHERE b.finish_time >= ? AND bu.userid = ?
            ORDER BY b.start_time DESC, b.id DESC
            "#,
        )
        .bind(from_time)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut owned = Vec::with_capacity(rows.len());
        for row in rows {
            let builder_name: String = row.try_get("buildername")?;
            let complete: i64 = row.try_get("complete")?;
            owned.push(OwnedBuild {
                friendly_name: resolver.display_name(&builder_name),
                project: resolver.project(&builder_name),
                complete: complete != 0,
                build_id: row.try_get("build_id")?,
                build_number: row.try_get("build_number")?,
                reason: row.try_get("reason")?,
                worker_name: row.try_get("slavename")?,
                submitted_at: decode_time(row.try_get("submitted_at")?),
                complete_at: decode_time(row.try_get("complete_at")?),
                source_stamp_set_id: row.try_get("sourcestampsetid")?,
                results: decode_results(row.try_get("results")?)?,
                builder_name,
            });
        }
        Ok(owned)
    }

    /// Create source stamp set, source stamp, build set, build request and
    /// build in one transaction; returns the build id. Any failure rolls the
    /// whole chain back.
    pub async fn create_full_build_object(&self, new: &NewFullBuild) -> PersistenceResult<i64> {
        let mut tx = begin_write(&self.pool).await?;
        match insert_full_build(&mut *tx, new).await {
            Ok(build_id) => {
                tx.commit().await?;
                tracing::debug!(build_id, builder = %new.builder_name, "Full build object created");
                Ok(build_id)
            }
            Err(e) => {
                crate::logging::log_error(
                    "builds_connector",
                    "create_full_build_object",
                    &e.to_string(),
                    Some(&new.builder_name),
                );
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback of full build object failed");
                }
                Err(e.into())
            }
        }
    }
}

impl std::fmt::Debug for BuildsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildsConnector")
            .field("finish_batch_size", &self.finish_batch_size)
            .field("history_limit_cap", &self.history_limit_cap)
            .finish_non_exhaustive()
    }
}

/// Conditions shared by the history queries
fn push_history_filters(query: &mut QueryBuilder<'_, Sqlite>, results: Option<&[BuildResult]>) {
    query.push(" AND br.mergebrid IS NULL AND br.complete = 1 AND br.results NOT IN ");
    push_in_list(query, RETRY_CLASS_RESULTS.iter().map(|r| r.code()));
    if let Some(results) = results.filter(|r| !r.is_empty()) {
        query.push(" AND br.results IN ");
        push_in_list(query, results.iter().map(|r| r.code()));
    }
}

async fn insert_build(
    conn: &mut SqliteConnection,
    request_id: i64,
    number: i64,
    worker_name: Option<&str>,
    start_time: i64,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO builds (number, brid, slavename, start_time, finish_time) VALUES (?, ?, ?, ?, NULL)",
    )
    .bind(number)
    .bind(request_id)
    .bind(worker_name)
    .bind(start_time)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// One `UPDATE` per `batch_size` ids, all on `conn`
async fn finish_builds_in(
    conn: &mut SqliteConnection,
    ids: &[i64],
    now: i64,
    result: Option<BuildResult>,
    batch_size: usize,
) -> Result<u64, sqlx::Error> {
    let mut updated = 0;
    for batch in ids.chunks(batch_size) {
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE builds SET finish_time = ");
        query.push_bind(now);
        if let Some(result) = result {
            query.push(", results = ");
            query.push_bind(result.code());
        }
        query.push(" WHERE id IN ");
        push_in_list(&mut query, batch.iter().copied());
        updated += query.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(updated)
}

async fn propagate_merged_finish(
    conn: &mut SqliteConnection,
    request_ids: &[i64],
    number: i64,
) -> Result<u64, sqlx::Error> {
    if request_ids.len() < 2 {
        return Ok(0);
    }
    let representative = request_ids[0];

    let finish_time = sqlx::query_scalar::<_, Option<i64>>(
        "SELECT finish_time FROM builds WHERE brid = ? AND number = ? ORDER BY id LIMIT 1",
    )
    .bind(representative)
    .bind(number)
    .fetch_optional(&mut *conn)
    .await?
    .flatten();

    let Some(finish_time) = finish_time else {
        tracing::debug!(
            request_id = representative,
            number,
            "No finished build to propagate to merged requests"
        );
        return Ok(0);
    };

    let mut query = QueryBuilder::<Sqlite>::new("UPDATE builds SET finish_time = ");
    query.push_bind(finish_time);
    query.push(" WHERE number = ");
    query.push_bind(number);
    query.push(" AND finish_time IS NULL AND brid IN ");
    push_in_list(&mut query, request_ids.iter().copied());
    Ok(query.build().execute(&mut *conn).await?.rows_affected())
}

async fn insert_full_build(
    conn: &mut SqliteConnection,
    new: &NewFullBuild,
) -> Result<i64, sqlx::Error> {
    let complete = new.complete_at.is_some();
    let results = new.results.map(BuildResult::code);

    let source_stamp_set_id = sqlx::query("INSERT INTO sourcestampsets DEFAULT VALUES")
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

    sqlx::query(
        r#"
        INSERT INTO sourcestamps (branch, revision, patchid, repository, codebase, project, sourcestampsetid)
        VALUES (?, ?, NULL, ?, ?, ?, ?)
        "#,
    )
    .bind(&new.branch)
    .bind(&new.revision)
    .bind(&new.repository)
    .bind(&new.codebase)
    .bind(&new.project)
    .bind(source_stamp_set_id)
    .execute(&mut *conn)
    .await?;

    let build_set_id = sqlx::query(
        r#"
        INSERT INTO buildsets (reason, sourcestampsetid, submitted_at, complete, complete_at, results)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&new.reason)
    .bind(source_stamp_set_id)
    .bind(new.submitted_at)
    .bind(complete)
    .bind(new.complete_at)
    .bind(results)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    let request_id = sqlx::query(
        r#"
        INSERT INTO buildrequests (buildsetid, buildername, priority, complete, results, submitted_at, complete_at, slavepool)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(build_set_id)
    .bind(&new.builder_name)
    .bind(crate::models::build_request::DEFAULT_PRIORITY)
    .bind(complete)
    .bind(results)
    .bind(new.submitted_at)
    .bind(new.complete_at)
    .bind(&new.worker_pool)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    let build_id = sqlx::query(
        "INSERT INTO builds (number, brid, slavename, start_time, finish_time) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(new.number)
    .bind(request_id)
    .bind(&new.worker_name)
    .bind(new.submitted_at)
    .bind(new.complete_at)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    Ok(build_id)
}
