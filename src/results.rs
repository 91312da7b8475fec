//! # Build Results
//!
//! Stored result codes for steps, builds and build requests, and the severity
//! ordering used whenever two outcomes are combined.
//!
//! The numeric codes are the values persisted in the `results` columns, so they
//! must never be renumbered.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Outcome classification of a step, build or build request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildResult {
    /// Request has not produced a result yet
    Running,
    Success,
    Warnings,
    Failure,
    Skipped,
    Exception,
    Retry,
    Cancelled,
    NotRebuilt,
    DependencyFailure,
    /// Request is parked waiting for a dependency and will be resumed
    Resume,
    /// Request was satisfied by another request's build
    Merged,
    Interrupted,
}

/// Results that mark a request as not really finished. History queries always
/// exclude them, whatever filter the caller passes.
pub const RETRY_CLASS_RESULTS: [BuildResult; 2] = [BuildResult::Resume, BuildResult::Running];

impl BuildResult {
    /// Every known result, in code order
    pub const ALL: [BuildResult; 13] = [
        Self::Running,
        Self::Success,
        Self::Warnings,
        Self::Failure,
        Self::Skipped,
        Self::Exception,
        Self::Retry,
        Self::Cancelled,
        Self::NotRebuilt,
        Self::DependencyFailure,
        Self::Resume,
        Self::Merged,
        Self::Interrupted,
    ];

    /// Numeric code stored in the database
    pub fn code(self) -> i64 {
        match self {
            Self::Running => -1,
            Self::Success => 0,
            Self::Warnings => 1,
            Self::Failure => 2,
            Self::Skipped => 3,
            Self::Exception => 4,
            Self::Retry => 5,
            Self::Cancelled => 6,
            Self::NotRebuilt => 7,
            Self::DependencyFailure => 8,
            Self::Resume => 9,
            Self::Merged => 10,
            Self::Interrupted => 11,
        }
    }

    /// Inverse of [`BuildResult::code`]
    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|result| result.code() == code)
    }

    /// Human readable name, as shown in status listings
    pub fn name(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Warnings => "warnings",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
            Self::Exception => "exception",
            Self::Retry => "retry",
            Self::Cancelled => "cancelled",
            Self::NotRebuilt => "not-rebuilt",
            Self::DependencyFailure => "dependency-failure",
            Self::Resume => "resume",
            Self::Merged => "merged",
            Self::Interrupted => "interrupted",
        }
    }

    /// Rank used to decide which of two results is worse
    pub fn severity(self) -> u8 {
        match self {
            Self::Success | Self::NotRebuilt | Self::Merged => 0,
            Self::Skipped => 1,
            Self::Warnings => 2,
            Self::Failure => 3,
            Self::DependencyFailure => 4,
            Self::Exception => 5,
            Self::Interrupted => 6,
            Self::Retry | Self::Resume | Self::Running => 7,
            Self::Cancelled => 8,
        }
    }

    /// The worse of two results. Ties keep `self`.
    pub fn worst(self, other: BuildResult) -> BuildResult {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Compare by severity only
    pub fn cmp_severity(self, other: BuildResult) -> Ordering {
        self.severity().cmp(&other.severity())
    }

    /// True for the results history queries never report
    pub fn is_retry_class(self) -> bool {
        RETRY_CLASS_RESULTS.contains(&self)
    }

    /// True when a step with `halt_on_failure` must stop the build
    pub fn is_failure_or_worse(self) -> bool {
        self.severity() >= Self::Failure.severity() && self != Self::Skipped
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for BuildResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|result| result.name() == s)
            .ok_or_else(|| format!("Invalid build result: {s}"))
    }
}

impl Default for BuildResult {
    fn default() -> Self {
        Self::Success
    }
}
