//! # Failure Reporting
//!
//! Unexpected errors (anything that ends a step in `EXCEPTION`) are captured
//! into a [`FailureRecord`], serialized to JSON and handed to a
//! [`FailureSink`].
//!
//! Two forms exist. A failure captured where it happened with
//! [`capture_failure!`] carries the enclosing function name, file and line.
//! A failure built from an error value alone omits those three keys.

use crate::utils::clock::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Where a failure was captured
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureLocation {
    pub method: String,
    pub file: String,
    pub line: u32,
}

/// Strip the helper item and closure frames from a `type_name` path and keep
/// the enclosing function's own name
#[doc(hidden)]
pub fn enclosing_function_name(path: &str) -> String {
    let trimmed = path.strip_suffix("::__here").unwrap_or(path);
    trimmed
        .split("::")
        .filter(|segment| *segment != "{{closure}}")
        .last()
        .unwrap_or(trimmed)
        .to_string()
}

/// Location of the invocation site, including the enclosing function name
#[macro_export]
macro_rules! failure_location {
    () => {{
        fn __here() {}
        $crate::orchestration::failure_reporter::FailureLocation {
            method: $crate::orchestration::failure_reporter::enclosing_function_name(
                ::std::any::type_name_of_val(&__here),
            ),
            file: file!().to_string(),
            line: line!(),
        }
    }};
}

/// Attach the invocation site to a [`Failure`]
#[macro_export]
macro_rules! capture_failure {
    ($failure:expr) => {
        $crate::orchestration::failure_reporter::Failure::at($failure, $crate::failure_location!())
    };
}

/// An in-flight error plus the chain of failures it wraps
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    failure_type: String,
    value: String,
    sub_failures: Vec<String>,
    location: Option<FailureLocation>,
}

impl Failure {
    pub fn new(failure_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            failure_type: failure_type.into(),
            value: value.into(),
            sub_failures: Vec::new(),
            location: None,
        }
    }

    /// From a typed error; the source chain becomes the sub-failures
    pub fn from_error<E>(error: &E) -> Self
    where
        E: std::error::Error + 'static,
    {
        let mut failure = Self::new(std::any::type_name::<E>(), error.to_string());
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
        while let Some(err) = source {
            failure.sub_failures.push(err.to_string());
            source = err.source();
        }
        failure
    }

    /// From an `anyhow` error; the context chain becomes the sub-failures
    pub fn from_anyhow(error: &anyhow::Error) -> Self {
        let mut failure = Self::new("anyhow::Error", error.to_string());
        failure.sub_failures = error.chain().map(ToString::to_string).collect();
        failure
    }

    /// Several failures reported as one; the first supplies type and value
    pub fn aggregate(failures: Vec<Failure>) -> Option<Self> {
        let mut failures = failures.into_iter();
        let mut combined = failures.next()?;
        if combined.sub_failures.is_empty() {
            combined.sub_failures.push(combined.summary());
        }
        for failure in failures {
            if failure.sub_failures.is_empty() {
                combined.sub_failures.push(failure.summary());
            } else {
                combined.sub_failures.extend(failure.sub_failures);
            }
        }
        Some(combined)
    }

    /// Record where the failure was captured
    pub fn at(mut self, location: FailureLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_sub_failure(mut self, message: impl Into<String>) -> Self {
        self.sub_failures.push(message.into());
        self
    }

    pub fn failure_type(&self) -> &str {
        &self.failure_type
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn location(&self) -> Option<&FailureLocation> {
        self.location.as_ref()
    }

    pub fn sub_failures(&self) -> &[String] {
        &self.sub_failures
    }

    fn summary(&self) -> String {
        format!("{}: {}", self.failure_type, self.value)
    }

    /// Sub-failures rendered as one bracketed list of text tokens
    pub fn rendered_messages(&self) -> Vec<String> {
        let mut messages = if self.sub_failures.is_empty() {
            vec![self.summary()]
        } else {
            self.sub_failures.clone()
        };
        if let Some(first) = messages.first_mut() {
            first.insert(0, '[');
        }
        if let Some(last) = messages.last_mut() {
            last.push(']');
        }
        messages
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Serialized shape handed to the sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    #[serde(rename = "type")]
    pub failure_type: String,
    pub value: String,
    pub messages: Vec<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_line: Option<u32>,
    pub header: Option<String>,
}

/// Destination for serialized failure records
pub trait FailureSink: Send + Sync {
    fn emit(&self, serialized: &str);
}

/// Writes each record to the log at error level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingFailureSink;

impl FailureSink for TracingFailureSink {
    fn emit(&self, serialized: &str) {
        tracing::error!(target: "buildstep_engine::failures", failure = %serialized, "Unexpected failure");
    }
}

/// Keeps every record in memory
#[derive(Debug, Default)]
pub struct MemoryFailureSink {
    records: Mutex<Vec<String>>,
}

impl MemoryFailureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw JSON strings in emission order
    pub fn raw(&self) -> Vec<String> {
        self.records.lock().clone()
    }

    /// Parsed records in emission order
    pub fn records(&self) -> Vec<serde_json::Value> {
        self.records
            .lock()
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FailureSink for MemoryFailureSink {
    fn emit(&self, serialized: &str) {
        self.records.lock().push(serialized.to_string());
    }
}

#[derive(Clone)]
pub struct FailureReporter {
    sink: Arc<dyn FailureSink>,
    clock: Arc<dyn Clock>,
}

impl FailureReporter {
    pub fn new(sink: Arc<dyn FailureSink>, clock: Arc<dyn Clock>) -> Self {
        Self { sink, clock }
    }

    /// Build the record for `failure`, hand it to the sink and return it
    pub fn report(&self, failure: &Failure, why: Option<&str>) -> FailureRecord {
        let record = FailureRecord {
            failure_type: failure.failure_type.clone(),
            value: failure.value.clone(),
            messages: failure.rendered_messages(),
            timestamp: self.clock.now(),
            method: failure.location.as_ref().map(|l| l.method.clone()),
            source_file: failure.location.as_ref().map(|l| l.file.clone()),
            source_line: failure.location.as_ref().map(|l| l.line),
            header: why.map(str::to_string),
        };

        match serde_json::to_string(&record) {
            Ok(serialized) => self.sink.emit(&serialized),
            Err(e) => crate::logging::log_error(
                "failure_reporter",
                "serialize",
                &e.to_string(),
                Some(&failure.to_string()),
            ),
        }
        record
    }
}

impl Default for FailureReporter {
    fn default() -> Self {
        Self::new(Arc::new(TracingFailureSink), Arc::new(SystemClock))
    }
}

impl fmt::Debug for FailureReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureReporter").finish_non_exhaustive()
    }
}
