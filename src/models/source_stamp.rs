use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Repository state a build set was built from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SourceStamp {
    pub id: i64,
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub repository: String,
    pub codebase: String,
    pub project: String,
    #[sqlx(rename = "sourcestampsetid")]
    pub source_stamp_set_id: i64,
}

/// Source stamp match used to narrow history queries.
///
/// A build request matches when its build set contains a source stamp with
/// the same codebase and branch, and the same revision when one is given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStampFilter {
    pub codebase: String,
    pub branch: Option<String>,
    pub revision: Option<String>,
}

impl SourceStampFilter {
    pub fn new(codebase: impl Into<String>, branch: Option<String>) -> Self {
        Self {
            codebase: codebase.into(),
            branch,
            revision: None,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }
}

/// Source stamp to record with a new build set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSourceStamp {
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub repository: String,
    pub codebase: String,
    pub project: String,
}
