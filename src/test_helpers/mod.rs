// Test Helpers Module - shared fixtures for unit and integration tests
//
// A scripted worker connection that answers dispatched commands without a
// network, and an in-memory database with the schema applied.

pub mod scripted_worker;
pub mod test_database;

pub use scripted_worker::{ScriptedWorker, StartedCommand, WorkerScript};
pub use test_database::{TestDatabase, TEST_EPOCH};
