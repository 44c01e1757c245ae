//! Declarative guard predicates.
//!
//! A guard is a conjunction of equality/inequality conditions over property
//! values. Keeping guards declarative makes exclusivity decidable, so
//! overlapping transitions are rejected when a model is built instead of being
//! resolved by declaration order at runtime.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Properties;

/// Single condition on one property. A missing property reads as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Equals { property: String, value: Value },
    NotEquals { property: String, value: Value },
}

impl Condition {
    pub fn property(&self) -> &str {
        match self {
            Condition::Equals { property, .. } | Condition::NotEquals { property, .. } => property,
        }
    }

    fn matches(&self, properties: &Properties) -> bool {
        match self {
            Condition::Equals { property, value } => {
                properties.get(property).unwrap_or(&Value::Null) == value
            }
            Condition::NotEquals { property, value } => {
                properties.get(property).unwrap_or(&Value::Null) != value
            }
        }
    }

    /// True when no property value can satisfy both conditions.
    fn contradicts(&self, other: &Condition) -> bool {
        if self.property() != other.property() {
            return false;
        }
        match (self, other) {
            (Condition::Equals { value: a, .. }, Condition::Equals { value: b, .. }) => a != b,
            (Condition::Equals { value: a, .. }, Condition::NotEquals { value: b, .. })
            | (Condition::NotEquals { value: b, .. }, Condition::Equals { value: a, .. }) => a == b,
            (Condition::NotEquals { .. }, Condition::NotEquals { .. }) => false,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Equals { property, value } => write!(f, "{property} == {value}"),
            Condition::NotEquals { property, value } => write!(f, "{property} != {value}"),
        }
    }
}

/// Conjunction of conditions. The empty guard always matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guard {
    conditions: Vec<Condition>,
}

impl Guard {
    pub fn always() -> Self {
        Self::default()
    }

    pub fn equals(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            conditions: vec![Condition::Equals {
                property: property.into(),
                value: value.into(),
            }],
        }
    }

    pub fn not_equals(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            conditions: vec![Condition::NotEquals {
                property: property.into(),
                value: value.into(),
            }],
        }
    }

    pub fn is_true(property: impl Into<String>) -> Self {
        Self::equals(property, true)
    }

    pub fn is_false(property: impl Into<String>) -> Self {
        Self::equals(property, false)
    }

    pub fn from_conditions(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    /// Both guards must hold.
    pub fn and(mut self, other: Guard) -> Self {
        self.conditions.extend(other.conditions);
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_unconditional(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Evaluate against proposed property values.
    pub fn matches(&self, properties: &Properties) -> bool {
        self.conditions.iter().all(|c| c.matches(properties))
    }

    /// True when the two guards can never hold at the same time.
    ///
    /// Conservative: guards that are not provably disjoint count as overlapping.
    pub fn excludes(&self, other: &Guard) -> bool {
        self.conditions
            .iter()
            .any(|a| other.conditions.iter().any(|b| a.contradicts(b)))
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.conditions.is_empty() {
            return f.write_str("always");
        }
        for (i, condition) in self.conditions.iter().enumerate() {
            if i > 0 {
                f.write_str(" && ")?;
            }
            write!(f, "{condition}")?;
        }
        Ok(())
    }
}
