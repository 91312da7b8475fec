//! # Log Evaluation
//!
//! Turns a finished command into a [`BuildResult`]. The exit code gives the
//! starting point (`SUCCESS` for zero, `FAILURE` otherwise); each rule whose
//! matcher occurs in the captured stdout can only make the result worse.
//! Stderr is never scanned.

use crate::remote::CommandOutcome;
use crate::results::BuildResult;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// What a rule looks for in stdout
#[derive(Debug, Clone)]
pub enum LogMatcher {
    Pattern(Regex),
    Substring(String),
}

impl LogMatcher {
    pub fn is_found_in(&self, text: &str) -> bool {
        match self {
            Self::Pattern(regex) => regex.is_match(text),
            Self::Substring(needle) => text.contains(needle.as_str()),
        }
    }
}

impl From<Regex> for LogMatcher {
    fn from(regex: Regex) -> Self {
        Self::Pattern(regex)
    }
}

impl From<&str> for LogMatcher {
    fn from(needle: &str) -> Self {
        Self::Substring(needle.to_string())
    }
}

impl From<String> for LogMatcher {
    fn from(needle: String) -> Self {
        Self::Substring(needle)
    }
}

#[derive(Debug, Clone)]
pub struct LogRule {
    pub matcher: LogMatcher,
    pub result: BuildResult,
}

impl LogRule {
    pub fn new(matcher: impl Into<LogMatcher>, result: BuildResult) -> Self {
        Self {
            matcher: matcher.into(),
            result,
        }
    }
}

/// Result derived from the exit code alone
pub fn exit_code_result(rc: Option<i32>) -> BuildResult {
    match rc {
        Some(0) => BuildResult::Success,
        _ => BuildResult::Failure,
    }
}

/// Rule scan over stdout, starting from the exit-code result
pub fn regex_log_evaluator(rc: Option<i32>, stdout: &str, rules: &[LogRule]) -> BuildResult {
    rules
        .iter()
        .filter(|rule| rule.matcher.is_found_in(stdout))
        .fold(exit_code_result(rc), |worst, rule| worst.worst(rule.result))
}

pub type CustomEvaluator = Arc<dyn Fn(&CommandOutcome) -> BuildResult + Send + Sync>;

/// How a command-backed step decides its result
#[derive(Clone)]
pub enum LogEvaluator {
    Rules(Vec<LogRule>),
    /// Replaces the rule scan entirely; its answer is used verbatim
    Custom(CustomEvaluator),
}

impl LogEvaluator {
    pub fn custom<F>(evaluator: F) -> Self
    where
        F: Fn(&CommandOutcome) -> BuildResult + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(evaluator))
    }

    pub fn evaluate(&self, outcome: &CommandOutcome) -> BuildResult {
        match self {
            Self::Rules(rules) => regex_log_evaluator(outcome.rc, &outcome.stdout, rules),
            Self::Custom(evaluator) => evaluator(outcome),
        }
    }
}

impl Default for LogEvaluator {
    fn default() -> Self {
        Self::Rules(Vec::new())
    }
}

impl fmt::Debug for LogEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rules(rules) => f.debug_tuple("Rules").field(rules).finish(),
            Self::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}
