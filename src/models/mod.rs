//! # Persistence Models
//!
//! Row types read and written by the builds and build request connectors.
//!
//! Timestamps are stored as whole epoch seconds and surfaced as
//! `DateTime<Utc>`; result columns are stored as their numeric code and
//! surfaced as [`BuildResult`](crate::results::BuildResult).

pub mod build;
pub mod build_request;
pub mod build_set;
pub mod owned_build;
pub mod source_stamp;

pub use build::{Build, BuildWithResult, NewFullBuild};
pub use build_request::{BuildRequest, NewBuildRequest};
pub use build_set::BuildSet;
pub use owned_build::OwnedBuild;
pub use source_stamp::{NewSourceStamp, SourceStamp, SourceStampFilter};

use crate::results::BuildResult;
use crate::utils::clock::epoch_to_datetime;
use chrono::{DateTime, Utc};

/// Decode a nullable result code column
pub(crate) fn decode_results(code: Option<i64>) -> Result<Option<BuildResult>, sqlx::Error> {
    code.map(|code| {
        BuildResult::from_code(code)
            .ok_or_else(|| sqlx::Error::Decode(format!("Unknown result code {code}").into()))
    })
    .transpose()
}

/// Decode a nullable epoch-seconds column. Zero is treated as unset.
pub(crate) fn decode_time(epoch: Option<i64>) -> Option<DateTime<Utc>> {
    epoch.filter(|seconds| *seconds != 0).map(epoch_to_datetime)
}
