//! Survey schema: surveys, jobs, tasks, and options

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::condition::{Condition, ConditionError};
use super::ids::{JobId, OptionId, SurveyId, TaskId};
use super::submission::TaskSelections;

/// Kind of prompt a task presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Text,
    Number,
    Date,
    Time,
    MultipleChoice,
    Photo,
    DropPin,
    DrawArea,
    CaptureLocation,
    Instructions,
    #[serde(other)]
    Unknown,
}

impl TaskType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Number => "NUMBER",
            Self::Date => "DATE",
            Self::Time => "TIME",
            Self::MultipleChoice => "MULTIPLE_CHOICE",
            Self::Photo => "PHOTO",
            Self::DropPin => "DROP_PIN",
            Self::DrawArea => "DRAW_AREA",
            Self::CaptureLocation => "CAPTURE_LOCATION",
            Self::Instructions => "INSTRUCTIONS",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = std::convert::Infallible;

    /// Unrecognized values map to `Unknown` (schema skew), never an error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "TEXT" => Self::Text,
            "NUMBER" => Self::Number,
            "DATE" => Self::Date,
            "TIME" => Self::Time,
            "MULTIPLE_CHOICE" => Self::MultipleChoice,
            "PHOTO" => Self::Photo,
            "DROP_PIN" => Self::DropPin,
            "DRAW_AREA" => Self::DrawArea,
            "CAPTURE_LOCATION" => Self::CaptureLocation,
            "INSTRUCTIONS" => Self::Instructions,
            _ => Self::Unknown,
        })
    }
}

/// How many options a multiple-choice task accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Cardinality {
    SelectOne,
    SelectMultiple,
}

impl Cardinality {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SelectOne => "SELECT_ONE",
            Self::SelectMultiple => "SELECT_MULTIPLE",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SELECT_ONE" => Some(Self::SelectOne),
            "SELECT_MULTIPLE" => Some(Self::SelectMultiple),
            _ => None,
        }
    }
}

/// One selectable option of a multiple-choice task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOption {
    pub id: OptionId,
    pub index: i64,
    pub code: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipleChoice {
    pub cardinality: Cardinality,
    pub options: Vec<TaskOption>,
    /// Whether a free-text "other" answer is allowed
    pub has_other: bool,
}

/// A single question definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub index: i64,
    pub task_type: TaskType,
    pub label: String,
    pub is_required: bool,
    pub multiple_choice: Option<MultipleChoice>,
    /// Shown only while this condition is fulfilled
    pub condition: Option<Condition>,
    /// Whether this task adds the LOI itself (drop pin / draw area)
    pub is_add_loi_task: bool,
}

impl Task {
    /// Whether the task is active given the other answers in the submission.
    ///
    /// Unconditional tasks are always active.
    pub fn is_active(&self, selections: &TaskSelections) -> Result<bool, ConditionError> {
        self.condition
            .as_ref()
            .map_or(Ok(true), |condition| condition.fulfilled_by(selections))
    }
}

/// How LOIs of a job come into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataCollectionStrategy {
    /// Only against LOIs imported by organizers
    Predefined,
    /// Collectors add LOIs in the field
    AdHoc,
    Mixed,
    #[serde(other)]
    Unknown,
}

impl DataCollectionStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Predefined => "PREDEFINED",
            Self::AdHoc => "AD_HOC",
            Self::Mixed => "MIXED",
            Self::Unknown => "UNKNOWN",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "PREDEFINED" => Self::Predefined,
            "AD_HOC" => Self::AdHoc,
            "MIXED" => Self::Mixed,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn allows_ad_hoc(self) -> bool {
        matches!(self, Self::AdHoc | Self::Mixed)
    }
}

/// A grouping of tasks applicable to LOIs of one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub style_color: Option<String>,
    pub strategy: DataCollectionStrategy,
    pub tasks: Vec<Task>,
}

impl Job {
    #[must_use]
    pub fn task(&self, task_id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|task| &task.id == task_id)
    }

    /// Tasks ordered by index.
    #[must_use]
    pub fn tasks_sorted(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.iter().collect();
        tasks.sort_by_key(|task| task.index);
        tasks
    }

    /// Tasks currently active for the given answers, in index order.
    pub fn active_tasks(&self, selections: &TaskSelections) -> Result<Vec<&Task>, ConditionError> {
        let mut active = Vec::new();
        for task in self.tasks_sorted() {
            if task.is_active(selections)? {
                active.push(task);
            }
        }
        Ok(active)
    }
}

/// Survey schema snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Survey {
    pub id: SurveyId,
    pub title: String,
    pub description: String,
    pub jobs: BTreeMap<JobId, Job>,
    /// Remote last-modified stamp (Unix ms), used to detect schema changes
    pub last_modified: i64,
}

impl Survey {
    #[must_use]
    pub fn job(&self, job_id: &JobId) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    /// Data can be collected if predefined LOIs exist or some job lets
    /// collectors add LOIs themselves.
    #[must_use]
    pub fn is_usable(&self, has_predefined_lois: bool) -> bool {
        has_predefined_lois || self.jobs.values().any(|job| job.strategy.allows_ad_hoc())
    }
}
