//! # Gating Predicates
//!
//! `do_step_if` and `hide_step_if` are either a constant, a callable, or a
//! flat list of those combined with logical AND. Lists may not nest.
//!
//! Callables come in four shapes, all normalized to one signature taking an
//! owned [`StepSnapshot`] and, for `hide_step_if`, the step's result:
//!
//! - [`GatingPredicate::from_fn`]: no arguments
//! - [`GatingPredicate::from_step_fn`]: the step
//! - [`GatingPredicate::from_result_fn`]: the result and the step
//! - [`GatingPredicate::from_async`]: asynchronous, both arguments

use crate::config::{ConfigResult, ConfigurationError};
use crate::results::BuildResult;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// What a predicate sees of the step it gates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub name: String,
    pub build_id: Option<i64>,
    pub step_number: usize,
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl StepSnapshot {
    pub fn property(&self, name: &str) -> Option<&serde_json::Value> {
        self.properties.get(name)
    }
}

pub type PredicateFuture = BoxFuture<'static, anyhow::Result<bool>>;
pub type PredicateFn =
    Arc<dyn Fn(StepSnapshot, Option<BuildResult>) -> PredicateFuture + Send + Sync>;

#[derive(Clone)]
pub enum GatingPredicate {
    Constant(bool),
    Predicate(PredicateFn),
    /// Logical AND of the elements; elements are never themselves lists
    All(Vec<GatingPredicate>),
}

impl GatingPredicate {
    pub fn constant(value: bool) -> Self {
        Self::Constant(value)
    }

    /// Predicate that ignores the step
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::Predicate(Arc::new(move |_: StepSnapshot, _: Option<BuildResult>| {
            let f = Arc::clone(&f);
            async move { f() }.boxed()
        }))
    }

    pub fn from_step_fn<F>(f: F) -> Self
    where
        F: Fn(&StepSnapshot) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::Predicate(Arc::new(move |step: StepSnapshot, _: Option<BuildResult>| {
            let f = Arc::clone(&f);
            async move { f(&step) }.boxed()
        }))
    }

    /// `result` is `None` while deciding whether the step runs
    pub fn from_result_fn<F>(f: F) -> Self
    where
        F: Fn(Option<BuildResult>, &StepSnapshot) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::Predicate(Arc::new(move |step: StepSnapshot, result: Option<BuildResult>| {
            let f = Arc::clone(&f);
            async move { f(result, &step) }.boxed()
        }))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(StepSnapshot, Option<BuildResult>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Self::Predicate(Arc::new(move |step: StepSnapshot, result: Option<BuildResult>| {
            f(step, result).boxed()
        }))
    }

    /// AND of `items`; fails when an element is itself a list
    pub fn all(items: Vec<GatingPredicate>) -> ConfigResult<Self> {
        let predicate = Self::All(items);
        predicate.validate("doStepIf")?;
        Ok(predicate)
    }

    /// Check the shape; `label` names the setting in the error message
    pub fn validate(&self, label: &str) -> ConfigResult<()> {
        match self {
            Self::Constant(_) | Self::Predicate(_) => Ok(()),
            Self::All(items) => {
                if items.iter().any(|item| matches!(item, Self::All(_))) {
                    Err(invalid_gating(label))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Parse the declarative form: a boolean or a flat list of booleans
    pub fn from_value(label: &str, value: &serde_json::Value) -> ConfigResult<Self> {
        match value {
            serde_json::Value::Bool(b) => Ok(Self::Constant(*b)),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| item.as_bool().map(Self::Constant).ok_or_else(|| invalid_gating(label)))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Self::All),
            _ => Err(invalid_gating(label)),
        }
    }

    /// Evaluate against `step`. Errors raised by callables propagate.
    pub fn evaluate<'a>(
        &'a self,
        step: &'a StepSnapshot,
        result: Option<BuildResult>,
    ) -> BoxFuture<'a, anyhow::Result<bool>> {
        async move {
            match self {
                Self::Constant(value) => Ok(*value),
                Self::Predicate(f) => f(step.clone(), result).await,
                Self::All(items) => {
                    for item in items {
                        if !item.evaluate(step, result).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
            }
        }
        .boxed()
    }
}

fn invalid_gating(label: &str) -> ConfigurationError {
    ConfigurationError::InvalidStep(format!(
        "{label} (must be callable/bool or a list containing those types)"
    ))
}

impl From<bool> for GatingPredicate {
    fn from(value: bool) -> Self {
        Self::Constant(value)
    }
}

impl Default for GatingPredicate {
    fn default() -> Self {
        Self::Constant(true)
    }
}

impl fmt::Debug for GatingPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
            Self::All(items) => f.debug_tuple("All").field(items).finish(),
        }
    }
}
