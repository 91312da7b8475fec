use crate::database::{
    BuildRequestsConnector, BuildsConnector, DatabaseConnection, DatabaseMigrations,
};
use crate::models::{NewBuildRequest, NewSourceStamp};
use crate::utils::clock::{Clock, FixedClock};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Instant the test clock starts at
pub const TEST_EPOCH: i64 = 1_700_000_000;

/// Migrated database with a pinned clock, in memory unless built
/// [`with_connection`](Self::with_connection)
pub struct TestDatabase {
    connection: DatabaseConnection,
    clock: Arc<FixedClock>,
}

impl TestDatabase {
    pub async fn new() -> Result<Self, sqlx::Error> {
        Self::with_connection(DatabaseConnection::in_memory().await?).await
    }

    /// Migrate `connection` and pin the clock; used for file-backed pools
    /// with more than one connection
    pub async fn with_connection(connection: DatabaseConnection) -> Result<Self, sqlx::Error> {
        DatabaseMigrations::run(connection.pool()).await?;
        Ok(Self {
            connection,
            clock: Arc::new(FixedClock::at_epoch(TEST_EPOCH)),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        self.connection.pool()
    }

    pub fn clock(&self) -> &Arc<FixedClock> {
        &self.clock
    }

    pub fn shared_clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock) as Arc<dyn Clock>
    }

    pub fn builds(&self) -> BuildsConnector {
        BuildsConnector::new(self.pool().clone(), self.shared_clock())
    }

    pub fn requests(&self) -> BuildRequestsConnector {
        BuildRequestsConnector::new(self.pool().clone(), self.shared_clock())
    }

    /// Build set with one source stamp plus one request for `builder_name`
    pub async fn build_request(
        &self,
        builder_name: &str,
        codebase: &str,
        branch: Option<&str>,
    ) -> Result<i64, crate::database::PersistenceError> {
        let requests = self.requests();
        let build_set_id = requests
            .insert_build_set(
                Some("test"),
                &[NewSourceStamp {
                    branch: branch.map(str::to_string),
                    revision: Some("abc123".to_string()),
                    repository: "https://example.org/repo.git".to_string(),
                    codebase: codebase.to_string(),
                    project: "test-project".to_string(),
                }],
            )
            .await?;
        requests
            .insert_build_request(&NewBuildRequest::new(build_set_id, builder_name))
            .await
    }
}
