//! # Step Definitions
//!
//! A [`BuildStep`] bundles a name, the two gating predicates, the
//! halt-on-failure flag and the action to run. Steps are built in code with
//! [`BuildStep::builder`] or from a declarative [`StepConfig`].
//!
//! Construction is where configuration errors surface: unknown keys, a
//! non-string name and malformed gating values are all rejected before any
//! step runs.
//!
//! ```json
//! {
//!   "name": "compile",
//!   "do_step_if": [true, true],
//!   "halt_on_failure": true,
//!   "command": {"command": ["make", "all"], "workdir": "build", "timeout_seconds": 600},
//!   "log_rules": [{"substring": "warning:", "result": "warnings"}]
//! }
//! ```

use super::actions::{LocalAction, ShellCommandAction, StepAction};
use super::predicates::GatingPredicate;
use crate::config::{ConfigResult, ConfigurationError};
use crate::orchestration::log_evaluator::{LogEvaluator, LogMatcher, LogRule};
use crate::remote::{RemoteShellCommand, ShellCommand};
use crate::results::BuildResult;
use crate::utils::serde::deserialize_optional_seconds;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_WORKDIR: &str = "build";

#[derive(Clone)]
pub struct BuildStep {
    name: String,
    do_step_if: GatingPredicate,
    hide_step_if: GatingPredicate,
    halt_on_failure: bool,
    action: Arc<dyn StepAction>,
}

impl BuildStep {
    pub fn builder(name: impl Into<String>) -> BuildStepBuilder {
        BuildStepBuilder::new(name)
    }

    /// Build from untyped configuration, checking the name before anything else
    pub fn from_value(value: serde_json::Value) -> ConfigResult<Self> {
        let Some(fields) = value.as_object() else {
            return Err(ConfigurationError::InvalidStep(
                "BuildStep definition must be a mapping".to_string(),
            ));
        };
        if !matches!(fields.get("name"), Some(serde_json::Value::String(_))) {
            return Err(ConfigurationError::InvalidStep(
                "BuildStep name must be a string".to_string(),
            ));
        }

        let config: StepConfig = serde_json::from_value(value)
            .map_err(|e| ConfigurationError::InvalidStep(e.to_string()))?;
        Self::from_config(config)
    }

    pub fn from_config(config: StepConfig) -> ConfigResult<Self> {
        let mut builder = Self::builder(config.name).halt_on_failure(config.halt_on_failure);

        if let Some(value) = &config.do_step_if {
            builder = builder.do_step_if(GatingPredicate::from_value("doStepIf", value)?);
        }
        if let Some(value) = &config.hide_step_if {
            builder = builder.hide_step_if(GatingPredicate::from_value("hideStepIf", value)?);
        }

        let rules = config
            .log_rules
            .iter()
            .map(LogRuleConfig::to_rule)
            .collect::<ConfigResult<Vec<_>>>()?;

        builder = match config.command {
            Some(command) => {
                if config.result.is_some() {
                    return Err(ConfigurationError::InvalidStep(
                        "result cannot be declared for a command step".to_string(),
                    ));
                }
                builder.action(command.into_action(rules))
            }
            None => {
                if !rules.is_empty() {
                    return Err(ConfigurationError::InvalidStep(
                        "log_rules require a command".to_string(),
                    ));
                }
                builder.action(LocalAction::returning(config.result.unwrap_or_default()))
            }
        };

        builder.build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn do_step_if(&self) -> &GatingPredicate {
        &self.do_step_if
    }

    pub fn hide_step_if(&self) -> &GatingPredicate {
        &self.hide_step_if
    }

    pub fn halt_on_failure(&self) -> bool {
        self.halt_on_failure
    }

    pub fn action(&self) -> &Arc<dyn StepAction> {
        &self.action
    }

    /// Status tokens for a finished step
    pub fn status_text(&self, result: BuildResult) -> Vec<String> {
        let suffix = match result {
            BuildResult::Success => return vec![self.name.clone()],
            BuildResult::Skipped => "skipped",
            BuildResult::Exception => "exception",
            BuildResult::Warnings => "warnings",
            BuildResult::Failure => "failed",
            BuildResult::Cancelled => "cancelled",
            other => other.name(),
        };
        vec![self.name.clone(), suffix.to_string()]
    }
}

impl fmt::Debug for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildStep")
            .field("name", &self.name)
            .field("do_step_if", &self.do_step_if)
            .field("hide_step_if", &self.hide_step_if)
            .field("halt_on_failure", &self.halt_on_failure)
            .field("action", &self.action.description())
            .finish()
    }
}

pub struct BuildStepBuilder {
    name: String,
    do_step_if: GatingPredicate,
    hide_step_if: GatingPredicate,
    halt_on_failure: bool,
    action: Option<Arc<dyn StepAction>>,
}

impl BuildStepBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            do_step_if: GatingPredicate::Constant(true),
            hide_step_if: GatingPredicate::Constant(false),
            halt_on_failure: false,
            action: None,
        }
    }

    pub fn do_step_if(mut self, predicate: impl Into<GatingPredicate>) -> Self {
        self.do_step_if = predicate.into();
        self
    }

    pub fn hide_step_if(mut self, predicate: impl Into<GatingPredicate>) -> Self {
        self.hide_step_if = predicate.into();
        self
    }

    pub fn halt_on_failure(mut self, halt: bool) -> Self {
        self.halt_on_failure = halt;
        self
    }

    pub fn action(mut self, action: impl StepAction + 'static) -> Self {
        self.action = Some(Arc::new(action));
        self
    }

    pub fn shared_action(mut self, action: Arc<dyn StepAction>) -> Self {
        self.action = Some(action);
        self
    }

    /// Validate and build. Steps without an action succeed without doing anything.
    pub fn build(self) -> ConfigResult<BuildStep> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::InvalidStep(
                "BuildStep name must not be empty".to_string(),
            ));
        }
        self.do_step_if.validate("doStepIf")?;
        self.hide_step_if.validate("hideStepIf")?;

        Ok(BuildStep {
            name: self.name,
            do_step_if: self.do_step_if,
            hide_step_if: self.hide_step_if,
            halt_on_failure: self.halt_on_failure,
            action: self
                .action
                .unwrap_or_else(|| Arc::new(LocalAction::returning(BuildResult::Success))),
        })
    }
}

/// Declarative step definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    pub name: String,
    /// A boolean or a list of booleans
    #[serde(default, alias = "doStepIf")]
    pub do_step_if: Option<serde_json::Value>,
    #[serde(default, alias = "hideStepIf")]
    pub hide_step_if: Option<serde_json::Value>,
    #[serde(default, alias = "haltOnFailure")]
    pub halt_on_failure: bool,
    #[serde(default)]
    pub command: Option<CommandConfig>,
    #[serde(default)]
    pub log_rules: Vec<LogRuleConfig>,
    /// Result of a step without a command
    #[serde(default)]
    pub result: Option<BuildResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub command: ShellCommand,
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_seconds")]
    pub timeout_seconds: Option<u64>,
}

fn default_workdir() -> String {
    DEFAULT_WORKDIR.to_string()
}

impl CommandConfig {
    fn into_action(self, rules: Vec<LogRule>) -> ShellCommandAction {
        let command = RemoteShellCommand::new(self.workdir, self.command)
            .with_env(self.env)
            .with_user(self.user);
        ShellCommandAction::new(command)
            .with_evaluator(LogEvaluator::Rules(rules))
            .with_timeout(self.timeout_seconds.map(Duration::from_secs))
    }
}

/// One log rule; exactly one of `pattern` and `substring` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogRuleConfig {
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub substring: Option<String>,
    pub result: BuildResult,
}

impl LogRuleConfig {
    fn to_rule(&self) -> ConfigResult<LogRule> {
        let matcher = match (&self.pattern, &self.substring) {
            (Some(pattern), None) => LogMatcher::Pattern(Regex::new(pattern).map_err(|e| {
                ConfigurationError::InvalidStep(format!("Invalid log rule pattern {pattern:?}: {e}"))
            })?),
            (None, Some(substring)) => LogMatcher::Substring(substring.clone()),
            _ => {
                return Err(ConfigurationError::InvalidStep(
                    "log rule needs exactly one of pattern or substring".to_string(),
                ))
            }
        };
        Ok(LogRule::new(matcher, self.result))
    }
}
