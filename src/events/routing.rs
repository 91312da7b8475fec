//! Routing keys and consumer filters.
//!
//! A routing key is an ordered tuple of strings. A filter has the same shape
//! but any position may be `None`, which matches every value at that position.

use super::BusError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingKey(Vec<String>);

impl RoutingKey {
    /// Build a key from its parts. An empty key is a caller error.
    pub fn new<I, S>(parts: I) -> Result<Self, BusError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let parts: Vec<String> = parts.into_iter().map(Into::into).collect();
        if parts.is_empty() {
            return Err(BusError::InvalidRoutingKey(
                "routing key must have at least one element".to_string(),
            ));
        }
        Ok(Self(parts))
    }

    pub(crate) fn from_vec(parts: Vec<String>) -> Self {
        debug_assert!(!parts.is_empty());
        Self(parts)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or_default()
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingFilter(Vec<Option<String>>);

impl RoutingFilter {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(|part| part.map(Into::into)).collect())
    }

    /// Filter matching exactly one key
    pub fn exact(key: &RoutingKey) -> Self {
        Self(key.parts().iter().cloned().map(Some).collect())
    }

    pub fn parts(&self) -> &[Option<String>] {
        &self.0
    }

    /// Positional match; lengths must agree
    pub fn matches(&self, key: &RoutingKey) -> bool {
        self.0.len() == key.len()
            && self
                .0
                .iter()
                .zip(key.parts())
                .all(|(wanted, actual)| wanted.as_deref().map_or(true, |w| w == actual))
    }
}

impl fmt::Display for RoutingFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self.0.iter().map(|p| p.as_deref().unwrap_or("*")).collect();
        write!(f, "({})", parts.join(", "))
    }
}
