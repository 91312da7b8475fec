//! # Schema Setup
//!
//! Creates the tables the connectors read and write. Every statement is
//! idempotent, so running the migrations against an existing database is a
//! no-op.
//!
//! `builds.brid` carries no foreign key constraint; a build may outlive or
//! predate the request row it points at.

use sqlx::SqlitePool;

const SCHEMA: &[(&str, &str)] = &[
    (
        "sourcestampsets",
        "CREATE TABLE IF NOT EXISTS sourcestampsets (
            id INTEGER PRIMARY KEY AUTOINCREMENT
        )",
    ),
    (
        "sourcestamps",
        "CREATE TABLE IF NOT EXISTS sourcestamps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            branch TEXT,
            revision TEXT,
            patchid INTEGER,
            repository TEXT NOT NULL DEFAULT '',
            codebase TEXT NOT NULL DEFAULT '',
            project TEXT NOT NULL DEFAULT '',
            sourcestampsetid INTEGER NOT NULL REFERENCES sourcestampsets(id)
        )",
    ),
    (
        "buildsets",
        "CREATE TABLE IF NOT EXISTS buildsets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_idstring TEXT,
            reason TEXT,
            sourcestampsetid INTEGER NOT NULL REFERENCES sourcestampsets(id),
            submitted_at INTEGER NOT NULL,
            complete INTEGER NOT NULL DEFAULT 0,
            complete_at INTEGER,
            results INTEGER
        )",
    ),
    (
        "buildrequests",
        "CREATE TABLE IF NOT EXISTS buildrequests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            buildsetid INTEGER NOT NULL REFERENCES buildsets(id),
            buildername TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            complete INTEGER NOT NULL DEFAULT 0,
            results INTEGER,
            submitted_at INTEGER NOT NULL,
            complete_at INTEGER,
            mergebrid INTEGER,
            slavepool TEXT
        )",
    ),
    (
        "builds",
        "CREATE TABLE IF NOT EXISTS builds (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            number INTEGER NOT NULL,
            brid INTEGER NOT NULL,
            slavename TEXT,
            start_time INTEGER NOT NULL,
            finish_time INTEGER,
            results INTEGER
        )",
    ),
    (
        "build_user",
        "CREATE TABLE IF NOT EXISTS build_user (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            buildid INTEGER NOT NULL REFERENCES builds(id),
            userid INTEGER NOT NULL,
            finish_time INTEGER NOT NULL
        )",
    ),
    (
        "builds_brid",
        "CREATE INDEX IF NOT EXISTS builds_brid ON builds (brid, number)",
    ),
    (
        "buildrequests_buildername",
        "CREATE INDEX IF NOT EXISTS buildrequests_buildername ON buildrequests (buildername, complete)",
    ),
    (
        "build_user_userid",
        "CREATE INDEX IF NOT EXISTS build_user_userid ON build_user (userid)",
    ),
];

/// Creates the engine schema.
pub struct DatabaseMigrations;

impl DatabaseMigrations {
    /// Create every table and index, inside one transaction
    pub async fn run(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        for (name, statement) in SCHEMA {
            tracing::trace!(object = name, "Applying schema statement");
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        crate::logging::log_database_operation(
            "migrate",
            None,
            Some(SCHEMA.len() as u64),
            "success",
            None,
        );
        Ok(())
    }

    /// Names of the tables and indexes the schema defines
    pub fn objects() -> impl Iterator<Item = &'static str> {
        SCHEMA.iter().map(|(name, _)| *name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseConnection;
    use sqlx::Row;

    #[tokio::test]
    async fn test_run_is_idempotent() {
        let db = DatabaseConnection::in_memory().await.unwrap();
        DatabaseMigrations::run(db.pool()).await.unwrap();
        DatabaseMigrations::run(db.pool()).await.unwrap();

        let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type IN ('table', 'index')")
            .fetch_all(db.pool())
            .await
            .unwrap();
        let names: Vec<String> = rows.iter().map(|r| r.get("name")).collect();
        for object in DatabaseMigrations::objects() {
            assert!(names.iter().any(|n| n == object), "missing {object}");
        }
    }
}
