//! Integration tests for the builds and build request connectors against a
//! migrated in-memory database, plus file-backed pools with several
//! connections for the concurrent cases.

use buildstep_engine::config::{DatabaseConfig, ExecutionConfig};
use buildstep_engine::database::{BuildCompletion, DatabaseConnection, StaticBuilderResolver};
use buildstep_engine::models::{NewFullBuild, SourceStampFilter};
use buildstep_engine::results::BuildResult;
use buildstep_engine::test_helpers::{TestDatabase, TEST_EPOCH};
use buildstep_engine::utils::clock::epoch_to_datetime;
use chrono::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

fn full_build(builder: &str, number: i64, complete_at: Option<i64>) -> NewFullBuild {
    NewFullBuild {
        branch: Some("main".to_string()),
        revision: Some("deadbeef".to_string()),
        repository: "https://example.org/repo.git".to_string(),
        project: "test-project".to_string(),
        codebase: "app".to_string(),
        reason: Some("forced".to_string()),
        submitted_at: TEST_EPOCH - 7200,
        complete_at,
        builder_name: builder.to_string(),
        worker_pool: None,
        number,
        worker_name: Some("w1".to_string()),
        results: Some(BuildResult::Success),
    }
}

/// Migrated WAL database file in `dir` behind a pool of `max_connections`
async fn file_database(dir: &TempDir, max_connections: u32) -> TestDatabase {
    let config = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("engine.db").display()),
        max_connections,
        acquire_timeout_seconds: 30,
        busy_timeout_seconds: 30,
    };
    let connection = DatabaseConnection::from_config(&config).await.unwrap();
    TestDatabase::with_connection(connection).await.unwrap()
}

async fn count(db: &TestDatabase, table: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(db.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_add_build_then_lookup() {
    let db = TestDatabase::new().await.unwrap();
    let builds = db.builds();

    let build_id = assert_ok!(builds.add_build(7, 3, Some("w1")).await);

    assert_eq!(assert_ok!(builds.get_build_number_for_request(7).await), Some(3));
    assert_eq!(assert_ok!(builds.get_build_id_for_request(7, 3).await), build_id);

    let build = builds.get_build(build_id).await.unwrap().unwrap();
    assert_eq!(build.build_request_id, 7);
    assert_eq!(build.number, 3);
    assert_eq!(build.worker_name.as_deref(), Some("w1"));
    assert_eq!(build.start_time, epoch_to_datetime(TEST_EPOCH));
    assert!(!build.is_finished());
    assert_eq!(build.results, None);
}

#[tokio::test]
async fn test_missing_build_is_not_found() {
    let db = TestDatabase::new().await.unwrap();
    let builds = db.builds();
    builds.add_build(7, 3, None).await.unwrap();

    let err = assert_err!(builds.get_build_id_for_request(7, 4).await);
    assert!(err.is_not_found());
    assert_eq!(
        err.to_string(),
        "There is no build for brid: 7 and build number 4"
    );
    assert_eq!(builds.get_build_number_for_request(99).await.unwrap(), None);
}

#[tokio::test]
async fn test_build_numbers_for_requests_are_distinct() {
    let db = TestDatabase::new().await.unwrap();
    let builds = db.builds();
    builds.add_build(1, 4, None).await.unwrap();
    builds.add_build(2, 4, None).await.unwrap();
    builds.add_build(2, 6, None).await.unwrap();
    builds.add_build(3, 9, None).await.unwrap();

    let numbers = builds.get_build_numbers_for_requests(&[1, 2]).await.unwrap();
    assert_eq!(numbers, vec![4, 6]);
    assert!(builds
        .get_build_numbers_for_requests(&[])
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_finish_many_builds_at_one_instant() {
    let db = TestDatabase::new().await.unwrap();
    let builds = db.builds();

    let mut ids = Vec::new();
    for request_id in 0..250 {
        ids.push(builds.add_build(request_id, 1, None).await.unwrap());
    }
    db.clock().advance(Duration::seconds(60));

    let updated = builds.finish_builds(&ids).await.unwrap();
    assert_eq!(updated, 250);

    let finish_times: Vec<Option<i64>> =
        sqlx::query_scalar("SELECT DISTINCT finish_time FROM builds")
            .fetch_all(db.pool())
            .await
            .unwrap();
    assert_eq!(finish_times, vec![Some(TEST_EPOCH + 60)]);
    assert_eq!(builds.finish_builds(&[]).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_finish_builds_is_never_partially_visible() {
    let dir = tempfile::tempdir().unwrap();
    let db = file_database(&dir, 4).await;
    let builds = db.builds().with_config(&ExecutionConfig {
        finish_batch_size: 10,
        ..ExecutionConfig::default()
    });

    let mut ids = Vec::new();
    for request_id in 0..250 {
        ids.push(builds.add_build(request_id, 1, None).await.unwrap());
    }

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let done = Arc::clone(&done);
        let pool = db.pool().clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                let finished = done.load(Ordering::Acquire);
                let n: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM builds WHERE finish_time IS NOT NULL",
                )
                .fetch_one(&pool)
                .await
                .unwrap();
                seen.push(n);
                if finished {
                    break;
                }
                tokio::task::yield_now().await;
            }
            seen
        })
    };

    assert_eq!(builds.finish_builds(&ids).await.unwrap(), 250);
    done.store(true, Ordering::Release);

    let seen = reader.await.unwrap();
    assert!(seen.iter().all(|n| *n == 0 || *n == 250), "partial finish seen: {seen:?}");
    assert_eq!(seen.last(), Some(&250));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_merged_finish_on_shared_file() {
    let dir = tempfile::tempdir().unwrap();
    let db = file_database(&dir, 8).await;
    let builds = db.builds();

    for group in 0..40i64 {
        let representative = builds.add_build(2 * group + 1, 1, None).await.unwrap();
        builds.finish_builds(&[representative]).await.unwrap();
        builds.add_build(2 * group + 2, 1, None).await.unwrap();
    }

    let tasks: Vec<_> = (0..40i64)
        .map(|group| {
            let builds = builds.clone();
            tokio::spawn(async move {
                builds
                    .finished_merged_builds(&[2 * group + 1, 2 * group + 2], 1)
                    .await
            })
        })
        .collect();
    for task in tasks {
        assert_eq!(assert_ok!(task.await.unwrap()), 1);
    }

    let unfinished: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM builds WHERE finish_time IS NULL")
            .fetch_one(db.pool())
            .await
            .unwrap();
    assert_eq!(unfinished, 0);
}

#[tokio::test]
async fn test_start_and_complete_merged_builds() {
    let db = TestDatabase::new().await.unwrap();
    let primary = db.build_request("linux", "app", Some("main")).await.unwrap();
    let sibling = db.build_request("linux", "app", Some("main")).await.unwrap();
    let builds = db.builds();
    let requests = db.requests();

    let build_ids = builds
        .start_merged_builds(&[primary, sibling], 4, Some("w1"))
        .await
        .unwrap();
    assert_eq!(build_ids.len(), 2);
    assert_eq!(
        requests.get_build_request(sibling).await.unwrap().unwrap().merged_into,
        Some(primary)
    );

    db.clock().advance(Duration::seconds(30));
    let completion = builds
        .complete_merged_builds(build_ids[0], &[primary, sibling], 4, BuildResult::Warnings)
        .await
        .unwrap();
    assert_eq!(
        completion,
        BuildCompletion {
            finished: 1,
            merged: 1,
            requests_completed: 2,
        }
    );

    let representative = builds.get_build(build_ids[0]).await.unwrap().unwrap();
    let merged = builds.get_build(build_ids[1]).await.unwrap().unwrap();
    assert_eq!(representative.results, Some(BuildResult::Warnings));
    assert_eq!(merged.finish_time, Some(epoch_to_datetime(TEST_EPOCH + 30)));
    assert_eq!(merged.finish_time, representative.finish_time);

    assert!(builds.start_merged_builds(&[], 1, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_start_merged_builds_rolls_back_on_failure() {
    let db = TestDatabase::new().await.unwrap();
    sqlx::query("DROP TABLE buildrequests")
        .execute(db.pool())
        .await
        .unwrap();

    assert_err!(db.builds().start_merged_builds(&[1, 2], 1, None).await);
    assert_eq!(count(&db, "builds").await, 0);
}

#[tokio::test]
async fn test_finish_with_result_records_result() {
    let db = TestDatabase::new().await.unwrap();
    let builds = db.builds();
    let build_id = builds.add_build(1, 1, None).await.unwrap();

    builds
        .finish_builds_with_result(&[build_id], Some(BuildResult::Warnings))
        .await
        .unwrap();

    let build = builds.get_build(build_id).await.unwrap().unwrap();
    assert!(build.is_finished());
    assert_eq!(build.results, Some(BuildResult::Warnings));
}

#[tokio::test]
async fn test_merged_builds_follow_representative() {
    let db = TestDatabase::new().await.unwrap();
    let builds = db.builds();

    let primary = builds.add_build(1, 5, Some("w1")).await.unwrap();
    let second = builds.add_build(2, 5, Some("w1")).await.unwrap();
    let third = builds.add_build(3, 5, Some("w1")).await.unwrap();

    // Nothing to copy while the representative is still running
    assert_eq!(builds.finished_merged_builds(&[1, 2, 3], 5).await.unwrap(), 0);

    db.clock().advance(Duration::seconds(90));
    builds.finish_builds(&[primary]).await.unwrap();
    db.clock().advance(Duration::seconds(30));

    assert_eq!(builds.finished_merged_builds(&[1, 2, 3], 5).await.unwrap(), 2);
    assert_eq!(builds.finished_merged_builds(&[1, 2, 3], 5).await.unwrap(), 0);

    let expected = Some(epoch_to_datetime(TEST_EPOCH + 90));
    for id in [primary, second, third] {
        let build = builds.get_build(id).await.unwrap().unwrap();
        assert_eq!(build.finish_time, expected);
    }
}

#[tokio::test]
async fn test_merged_builds_single_request_is_noop() {
    let db = TestDatabase::new().await.unwrap();
    let builds = db.builds();
    let id = builds.add_build(1, 5, None).await.unwrap();
    builds.finish_builds(&[id]).await.unwrap();

    assert_eq!(builds.finished_merged_builds(&[1], 5).await.unwrap(), 0);
    assert_eq!(builds.finished_merged_builds(&[], 5).await.unwrap(), 0);
}

#[tokio::test]
async fn test_builds_and_result_outer_join() {
    let db = TestDatabase::new().await.unwrap();
    let request_id = db.build_request("linux", "app", Some("main")).await.unwrap();
    let builds = db.builds();

    let rows = builds
        .get_builds_and_result_for_request(request_id)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].build_request_id, request_id);
    assert_eq!(rows[0].id, None);
    assert_eq!(rows[0].number, None);
    assert_eq!(rows[0].results, None);

    let build_id = builds.add_build(request_id, 1, Some("w1")).await.unwrap();
    db.requests()
        .complete_build_requests(&[request_id], BuildResult::Failure)
        .await
        .unwrap();

    let rows = builds
        .get_builds_and_result_for_request(request_id)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, Some(build_id));
    assert_eq!(rows[0].number, Some(1));
    assert_eq!(rows[0].results, Some(BuildResult::Failure));

    assert!(builds
        .get_builds_and_result_for_request(9_999)
        .await
        .unwrap()
        .is_empty());
}

/// Request on `builder` whose build `number` finished and whose request
/// completed with `result`; the clock moves forward one minute per call.
async fn finished_request(
    db: &TestDatabase,
    builder: &str,
    branch: Option<&str>,
    number: i64,
    worker: &str,
    result: BuildResult,
) -> i64 {
    let request_id = db.build_request(builder, "app", branch).await.unwrap();
    let builds = db.builds();
    let build_id = builds.add_build(request_id, number, Some(worker)).await.unwrap();
    db.clock().advance(Duration::seconds(60));
    builds.finish_builds(&[build_id]).await.unwrap();
    db.requests()
        .complete_build_requests(&[request_id], result)
        .await
        .unwrap();
    request_id
}

#[tokio::test]
async fn test_history_excludes_retry_class() {
    let db = TestDatabase::new().await.unwrap();
    finished_request(&db, "linux", Some("main"), 1, "w1", BuildResult::Success).await;
    finished_request(&db, "linux", Some("main"), 2, "w1", BuildResult::Failure).await;
    finished_request(&db, "linux", Some("main"), 3, "w1", BuildResult::Resume).await;
    finished_request(&db, "linux", Some("main"), 4, "w1", BuildResult::Warnings).await;

    let builds = db.builds();
    let numbers = builds
        .get_last_builds_numbers("linux", None, None, 10)
        .await
        .unwrap();
    assert_eq!(numbers, vec![4, 2, 1]);

    let limited = builds
        .get_last_builds_numbers("linux", None, None, 2)
        .await
        .unwrap();
    assert_eq!(limited, vec![4, 2]);

    let failures = builds
        .get_last_builds_numbers("linux", None, Some(&[BuildResult::Failure]), 10)
        .await
        .unwrap();
    assert_eq!(failures, vec![2]);

    // Asking for the retry class explicitly still yields nothing
    let resumed = builds
        .get_last_builds_numbers("linux", None, Some(&[BuildResult::Resume]), 10)
        .await
        .unwrap();
    assert!(resumed.is_empty());
}

#[tokio::test]
async fn test_history_skips_merged_and_incomplete_requests() {
    let db = TestDatabase::new().await.unwrap();
    let primary =
        finished_request(&db, "linux", Some("main"), 1, "w1", BuildResult::Success).await;
    let merged = finished_request(&db, "linux", Some("main"), 2, "w1", BuildResult::Success).await;
    db.requests().mark_merged(&[merged], primary).await.unwrap();

    let pending = db.build_request("linux", "app", Some("main")).await.unwrap();
    let build_id = db.builds().add_build(pending, 3, Some("w1")).await.unwrap();
    db.builds().finish_builds(&[build_id]).await.unwrap();

    let numbers = db
        .builds()
        .get_last_builds_numbers("linux", None, None, 10)
        .await
        .unwrap();
    assert_eq!(numbers, vec![1]);
}

#[tokio::test]
async fn test_history_by_source_stamp() {
    let db = TestDatabase::new().await.unwrap();
    finished_request(&db, "linux", Some("main"), 1, "w1", BuildResult::Success).await;
    finished_request(&db, "linux", Some("dev"), 2, "w1", BuildResult::Success).await;
    finished_request(&db, "linux", None, 3, "w1", BuildResult::Success).await;

    let builds = db.builds();
    let main = [SourceStampFilter::new("app", Some("main".to_string()))];
    assert_eq!(
        builds
            .get_last_builds_numbers("linux", Some(&main), None, 10)
            .await
            .unwrap(),
        vec![1]
    );

    let no_branch = [SourceStampFilter::new("app", None)];
    assert_eq!(
        builds
            .get_last_builds_numbers("linux", Some(&no_branch), None, 10)
            .await
            .unwrap(),
        vec![3]
    );

    let other_revision =
        [SourceStampFilter::new("app", Some("main".to_string())).with_revision("cafebabe")];
    assert!(builds
        .get_last_builds_numbers("linux", Some(&other_revision), None, 10)
        .await
        .unwrap()
        .is_empty());

    let other_codebase = [SourceStampFilter::new("lib", Some("main".to_string()))];
    assert!(builds
        .get_last_builds_numbers("linux", Some(&other_codebase), None, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_history_by_worker_groups_by_builder() {
    let db = TestDatabase::new().await.unwrap();
    finished_request(&db, "linux", Some("main"), 1, "w1", BuildResult::Success).await;
    finished_request(&db, "windows", Some("main"), 7, "w1", BuildResult::Failure).await;
    finished_request(&db, "linux", Some("main"), 2, "w1", BuildResult::Success).await;
    finished_request(&db, "linux", Some("main"), 3, "w2", BuildResult::Success).await;
    finished_request(&db, "linux", Some("main"), 4, "w1", BuildResult::Running).await;

    let builds = db.builds();
    let by_worker = builds
        .get_last_builds_numbers_by_worker("w1", None, 10)
        .await
        .unwrap();
    assert_eq!(by_worker.len(), 2);
    assert_eq!(by_worker["linux"], vec![2, 1]);
    assert_eq!(by_worker["windows"], vec![7]);

    let failures = builds
        .get_last_builds_numbers_by_worker("w1", Some(&[BuildResult::Failure]), 10)
        .await
        .unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures["windows"], vec![7]);
}

#[tokio::test]
async fn test_builds_owned_by_user() {
    let db = TestDatabase::new().await.unwrap();
    let builds = db.builds();

    let recent = builds
        .create_full_build_object(&full_build("linux", 12, Some(TEST_EPOCH - 3600)))
        .await
        .unwrap();
    let stale = builds
        .create_full_build_object(&full_build("linux", 11, Some(TEST_EPOCH - 10 * 86_400)))
        .await
        .unwrap();
    let foreign = builds
        .create_full_build_object(&full_build("windows", 3, Some(TEST_EPOCH - 60)))
        .await
        .unwrap();

    let at = epoch_to_datetime(TEST_EPOCH);
    builds.create_build_user(recent, 42, at).await.unwrap();
    builds.create_build_user(stale, 42, at).await.unwrap();
    builds.create_build_user(foreign, 7, at).await.unwrap();

    let resolver = StaticBuilderResolver::new().with_builder("linux", Some("Linux"), Some("core"));
    let owned = builds
        .get_last_builds_owned_by(42, &resolver, 1)
        .await
        .unwrap();

    assert_eq!(owned.len(), 1);
    let build = &owned[0];
    assert_eq!(build.build_id, recent);
    assert_eq!(build.build_number, 12);
    assert_eq!(build.builder_name, "linux");
    assert_eq!(build.friendly_name, "Linux");
    assert_eq!(build.project.as_deref(), Some("core"));
    assert!(build.complete);
    assert_eq!(build.results, Some(BuildResult::Success));
    assert_eq!(build.reason.as_deref(), Some("forced"));
    assert_eq!(build.worker_name.as_deref(), Some("w1"));
    assert_eq!(build.complete_at, Some(epoch_to_datetime(TEST_EPOCH - 3600)));

    let wider = builds
        .get_last_builds_owned_by(42, &resolver, 30)
        .await
        .unwrap();
    assert_eq!(
        wider.iter().map(|b| b.build_id).collect::<Vec<_>>(),
        vec![stale, recent]
    );
}

#[tokio::test]
async fn test_full_build_object_links_every_row() {
    let db = TestDatabase::new().await.unwrap();
    let builds = db.builds();

    let build_id = builds
        .create_full_build_object(&full_build("linux", 5, Some(TEST_EPOCH)))
        .await
        .unwrap();

    let build = builds.get_build(build_id).await.unwrap().unwrap();
    assert_eq!(build.number, 5);
    assert!(build.is_finished());

    let request = db
        .requests()
        .get_build_request(build.build_request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.builder_name, "linux");
    assert!(request.complete);
    assert_eq!(request.results, Some(BuildResult::Success));

    let build_set = db
        .requests()
        .get_build_set(request.build_set_id)
        .await
        .unwrap()
        .unwrap();
    assert!(build_set.complete);
    let stamps = db
        .requests()
        .get_source_stamps(build_set.source_stamp_set_id)
        .await
        .unwrap();
    assert_eq!(stamps.len(), 1);
    assert_eq!(stamps[0].revision.as_deref(), Some("deadbeef"));
}

#[tokio::test]
async fn test_full_build_object_rolls_back_on_failure() {
    let db = TestDatabase::new().await.unwrap();
    sqlx::query("DROP TABLE builds")
        .execute(db.pool())
        .await
        .unwrap();

    let result = db
        .builds()
        .create_full_build_object(&full_build("linux", 5, None))
        .await;
    assert!(result.is_err());

    for table in ["sourcestampsets", "sourcestamps", "buildsets", "buildrequests"] {
        assert_eq!(count(&db, table).await, 0, "{table} should be empty");
    }
}

#[tokio::test]
async fn test_complete_requests_keeps_first_result() {
    let db = TestDatabase::new().await.unwrap();
    let request_id = db.build_request("linux", "app", Some("main")).await.unwrap();
    let requests = db.requests();

    assert_eq!(
        requests
            .complete_build_requests(&[request_id], BuildResult::Exception)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        requests
            .complete_build_requests(&[request_id], BuildResult::Success)
            .await
            .unwrap(),
        0
    );

    let request = requests.get_build_request(request_id).await.unwrap().unwrap();
    assert!(request.complete);
    assert_eq!(request.results, Some(BuildResult::Exception));
    assert_eq!(request.complete_at, Some(epoch_to_datetime(TEST_EPOCH)));
}
