#![allow(clippy::doc_markdown)] // Allow technical terms like SQLite, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Build Step Engine
//!
//! Execution core of a distributed CI build orchestrator.
//!
//! ## Overview
//!
//! A build is an ordered list of steps run against one worker. Each step
//! passes through a small state machine: a `do_step_if` gate decides whether
//! it runs, its action runs (locally or as a remote command on the worker),
//! the command output is classified into a result, and a `hide_step_if` gate
//! decides whether it is shown. The sequencer folds step results into a build
//! result and records completion durably.
//!
//! ## Module Organization
//!
//! - [`results`] - result codes and severity ordering
//! - [`state_machine`] - step states, gating predicates, step definitions and actions
//! - [`remote`] - remote command dispatch and the reference table backing it
//! - [`orchestration`] - log evaluation, failure reporting and build sequencing
//! - [`database`] - builds and build request persistence
//! - [`models`] - persisted row types
//! - [`events`] - lifecycle message bus contract
//! - [`config`] - configuration management
//! - [`logging`] - structured logging setup
//! - [`error`] - structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use buildstep_engine::database::{DatabaseConnection, DatabaseMigrations, BuildsConnector};
//! use buildstep_engine::utils::clock::SystemClock;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = DatabaseConnection::in_memory().await?;
//! DatabaseMigrations::run(db.pool()).await?;
//!
//! let builds = BuildsConnector::new(db.pool().clone(), Arc::new(SystemClock));
//! let build_id = builds.add_build(7, 3, Some("w1")).await?;
//! assert_eq!(builds.get_build_number_for_request(7).await?, Some(3));
//! assert_eq!(builds.get_build_id_for_request(7, 3).await?, build_id);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod remote;
pub mod results;
pub mod state_machine;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
pub mod utils;

pub use config::{ConfigurationError, EngineConfig};
pub use database::{BuildRequestsConnector, BuildsConnector, PersistenceError};
pub use error::{EngineError, Result};
pub use events::{BusMessage, InMemoryMessageBus, MessageBus};
pub use orchestration::{BuildPlan, BuildSequencer, BuildSummary, FailureReporter, LogEvaluator};
pub use remote::{RemoteCommand, RemoteError, RemoteShellCommand, WorkerConnection};
pub use results::BuildResult;
pub use state_machine::{BuildStep, GatingPredicate, StepError, StepOutcome, StepStateMachine};
