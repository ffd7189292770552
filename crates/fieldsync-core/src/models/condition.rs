//! Task conditions and their evaluation
//!
//! A condition decides whether a task is active given the answers already
//! recorded in the same submission. Evaluation is pure: no I/O, no state.
//! Unknown match or expression types are schema skew and fail loudly rather
//! than defaulting to a visibility guess.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

use super::ids::{OptionId, TaskId};
use super::submission::TaskSelections;

/// How the results of a condition's expressions combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    /// Every expression fulfilled (vacuously true when there are none)
    MatchAll,
    /// At least one expression fulfilled
    MatchAny,
    /// Exactly one expression fulfilled
    MatchOne,
    #[serde(other)]
    Unknown,
}

/// How one expression tests the referenced task's selected options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpressionType {
    AnyOfSelected,
    AllOfSelected,
    OneOfSelected,
    #[serde(other)]
    Unknown,
}

impl MatchType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MatchAll => "MATCH_ALL",
            Self::MatchAny => "MATCH_ANY",
            Self::MatchOne => "MATCH_ONE",
            Self::Unknown => "UNKNOWN",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "MATCH_ALL" => Self::MatchAll,
            "MATCH_ANY" => Self::MatchAny,
            "MATCH_ONE" => Self::MatchOne,
            _ => Self::Unknown,
        }
    }
}

impl ExpressionType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AnyOfSelected => "ANY_OF_SELECTED",
            Self::AllOfSelected => "ALL_OF_SELECTED",
            Self::OneOfSelected => "ONE_OF_SELECTED",
            Self::Unknown => "UNKNOWN",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "ANY_OF_SELECTED" => Self::AnyOfSelected,
            "ALL_OF_SELECTED" => Self::AllOfSelected,
            "ONE_OF_SELECTED" => Self::OneOfSelected,
            _ => Self::Unknown,
        }
    }
}

/// Data-integrity failure raised during evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("Condition has unknown match type")]
    UnknownMatchType,
    #[error("Expression on task {0} has unknown expression type")]
    UnknownExpressionType(TaskId),
}

/// Test against a single task's recorded multiple-choice selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expression {
    pub expression_type: ExpressionType,
    pub task_id: TaskId,
    pub option_ids: BTreeSet<OptionId>,
}

impl Expression {
    /// Missing answers and non-multiple-choice answers are unfulfilled, not errors.
    pub fn fulfilled_by(&self, selections: &TaskSelections) -> Result<bool, ConditionError> {
        let selected = selections
            .get(&self.task_id)
            .and_then(super::submission::TaskValue::selected_options);

        match (self.expression_type, selected) {
            (ExpressionType::Unknown, _) => {
                Err(ConditionError::UnknownExpressionType(self.task_id.clone()))
            }
            (_, None) => Ok(false),
            (ExpressionType::AnyOfSelected, Some(selected)) => {
                Ok(self.option_ids.intersection(selected).next().is_some())
            }
            (ExpressionType::AllOfSelected, Some(selected)) => {
                Ok(self.option_ids.is_subset(selected))
            }
            (ExpressionType::OneOfSelected, Some(selected)) => {
                Ok(self.option_ids.intersection(selected).count() == 1)
            }
        }
    }
}

/// Rule deciding whether a task is currently active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub match_type: MatchType,
    pub expressions: Vec<Expression>,
}

impl Condition {
    /// Evaluate against the answers recorded so far.
    ///
    /// Every expression is evaluated before combining, so an unknown
    /// expression type is reported regardless of its position.
    pub fn fulfilled_by(&self, selections: &TaskSelections) -> Result<bool, ConditionError> {
        let combine: fn(usize, usize) -> bool = match self.match_type {
            MatchType::MatchAll => |fulfilled, total| fulfilled == total,
            MatchType::MatchAny => |fulfilled, _| fulfilled > 0,
            MatchType::MatchOne => |fulfilled, _| fulfilled == 1,
            MatchType::Unknown => return Err(ConditionError::UnknownMatchType),
        };

        let results = self
            .expressions
            .iter()
            .map(|expression| expression.fulfilled_by(selections))
            .collect::<Result<Vec<bool>, _>>()?;
        let fulfilled = results.iter().filter(|result| **result).count();

        Ok(combine(fulfilled, results.len()))
    }
}
