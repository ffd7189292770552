//! Submission model and task values

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use super::ids::{JobId, LoiId, OptionId, SubmissionId, SurveyId, TaskId};
use super::loi::{AuditInfo, Coordinate, Geometry};
use super::survey::TaskType;

/// A recorded answer to a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskValue {
    Text {
        text: String,
    },
    Number {
        value: f64,
    },
    /// Date as Unix ms at local midnight
    Date {
        millis: i64,
    },
    Time {
        millis: i64,
    },
    MultipleChoice {
        selected: BTreeSet<OptionId>,
        #[serde(default)]
        other_text: Option<String>,
    },
    Photo {
        remote_path: String,
    },
    Location {
        coordinate: Coordinate,
        accuracy_meters: Option<f64>,
    },
    Geometry {
        geometry: Geometry,
    },
    /// Explicitly skipped by the data collector
    Skipped,
}

impl TaskValue {
    /// Selected option ids when this is a multiple-choice answer.
    #[must_use]
    pub const fn selected_options(&self) -> Option<&BTreeSet<OptionId>> {
        match self {
            Self::MultipleChoice { selected, .. } => Some(selected),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text { text } => text.trim().is_empty(),
            Self::MultipleChoice {
                selected,
                other_text,
            } => selected.is_empty() && other_text.as_deref().is_none_or(str::is_empty),
            Self::Photo { remote_path } => remote_path.is_empty(),
            Self::Skipped => true,
            _ => false,
        }
    }
}

/// Answers keyed by task.
pub type TaskSelections = HashMap<TaskId, TaskValue>;

/// Change to one task's value; `new_value = None` clears it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueDelta {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub new_value: Option<TaskValue>,
}

/// One set of task answers for one location of interest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub survey_id: SurveyId,
    pub loi_id: LoiId,
    pub job_id: JobId,
    pub values: TaskSelections,
    pub created: AuditInfo,
    pub last_modified: AuditInfo,
}

impl Submission {
    /// Apply deltas in order; later deltas for the same task win.
    pub fn apply_deltas(&mut self, deltas: &[ValueDelta]) {
        for delta in deltas {
            match &delta.new_value {
                Some(value) => {
                    self.values.insert(delta.task_id.clone(), value.clone());
                }
                None => {
                    self.values.remove(&delta.task_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserId;

    fn text(value: &str) -> TaskValue {
        TaskValue::Text {
            text: value.to_string(),
        }
    }

    #[test]
    fn apply_deltas_sets_and_clears_values() {
        let mut submission = Submission {
            id: SubmissionId::from("sub-1"),
            survey_id: SurveyId::from("s1"),
            loi_id: LoiId::from("l1"),
            job_id: JobId::from("j1"),
            values: TaskSelections::new(),
            created: AuditInfo::now(UserId::from("u1")),
            last_modified: AuditInfo::now(UserId::from("u1")),
        };

        submission.apply_deltas(&[
            ValueDelta {
                task_id: TaskId::from("t1"),
                task_type: TaskType::Text,
                new_value: Some(text("first")),
            },
            ValueDelta {
                task_id: TaskId::from("t1"),
                task_type: TaskType::Text,
                new_value: Some(text("second")),
            },
            ValueDelta {
                task_id: TaskId::from("t2"),
                task_type: TaskType::Text,
                new_value: Some(text("gone")),
            },
            ValueDelta {
                task_id: TaskId::from("t2"),
                task_type: TaskType::Text,
                new_value: None,
            },
        ]);

        assert_eq!(submission.values.get(&TaskId::from("t1")), Some(&text("second")));
        assert!(!submission.values.contains_key(&TaskId::from("t2")));
    }

    #[test]
    fn selected_options_only_for_multiple_choice() {
        let choice = TaskValue::MultipleChoice {
            selected: [OptionId::from("x")].into_iter().collect(),
            other_text: None,
        };
        assert_eq!(choice.selected_options().map(BTreeSet::len), Some(1));
        assert!(text("x").selected_options().is_none());
        assert!(TaskValue::Skipped.is_empty());
    }
}
