//! JSON wire format of the remote API
//!
//! These types mirror the remote schema and are converted to and from the
//! domain models explicitly. They never reach the local store.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::models::{
    AuditInfo, Cardinality, Condition, Coordinate, DataCollectionStrategy, Expression,
    ExpressionType, Geometry, Job, JobId, LocationOfInterest, LoiId, MatchType, MultipleChoice,
    Mutation, MutationPayload, MutationType, OptionId, Survey, SurveyId, Task, TaskId,
    TaskOption, TaskType, TaskValue, UserId, ValueDelta,
};

use super::remote::{RemoteError, RemoteResult};

/// Remote operation of a wire mutation. Unknown types cannot be encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireOperation {
    Create,
    Update,
    Delete,
}

impl WireOperation {
    fn from_type(mutation_type: MutationType) -> RemoteResult<Self> {
        match mutation_type {
            MutationType::Create => Ok(Self::Create),
            MutationType::Update => Ok(Self::Update),
            MutationType::Delete => Ok(Self::Delete),
            MutationType::Unknown => Err(RemoteError::invalid_payload(
                "mutation type UNKNOWN cannot be sent",
            )),
        }
    }
}

/// GeoJSON-style geometry; positions are `[lng, lat]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireGeometry {
    Point {
        coordinates: [f64; 2],
    },
    LineString {
        coordinates: Vec<[f64; 2]>,
    },
    Polygon {
        coordinates: Vec<Vec<[f64; 2]>>,
    },
    MultiPolygon {
        coordinates: Vec<Vec<Vec<[f64; 2]>>>,
    },
}

fn position(coordinate: Coordinate) -> [f64; 2] {
    [coordinate.lng, coordinate.lat]
}

fn ring(coordinates: &[Coordinate]) -> Vec<[f64; 2]> {
    coordinates.iter().copied().map(position).collect()
}

fn coordinate([lng, lat]: [f64; 2]) -> Coordinate {
    Coordinate::new(lat, lng)
}

fn coordinates(ring: Vec<[f64; 2]>) -> Vec<Coordinate> {
    ring.into_iter().map(coordinate).collect()
}

impl From<&Geometry> for WireGeometry {
    fn from(geometry: &Geometry) -> Self {
        match geometry {
            Geometry::Point { coordinate } => Self::Point {
                coordinates: position(*coordinate),
            },
            Geometry::LineString { coordinates } => Self::LineString {
                coordinates: ring(coordinates),
            },
            Geometry::Polygon { shell, holes } => Self::Polygon {
                coordinates: std::iter::once(ring(shell))
                    .chain(holes.iter().map(|hole| ring(hole)))
                    .collect(),
            },
            // Multipolygons are carried as one shell per polygon.
            Geometry::MultiPolygon { polygons } => Self::MultiPolygon {
                coordinates: polygons.iter().map(|shell| vec![ring(shell)]).collect(),
            },
        }
    }
}

impl TryFrom<WireGeometry> for Geometry {
    type Error = RemoteError;

    fn try_from(geometry: WireGeometry) -> RemoteResult<Self> {
        Ok(match geometry {
            WireGeometry::Point { coordinates } => Self::Point {
                coordinate: coordinate(coordinates),
            },
            WireGeometry::LineString { coordinates: line } => Self::LineString {
                coordinates: coordinates(line),
            },
            WireGeometry::Polygon { coordinates: rings } => {
                let mut rings = rings.into_iter();
                let shell = rings
                    .next()
                    .ok_or_else(|| RemoteError::invalid_payload("polygon without shell"))?;
                Self::Polygon {
                    shell: coordinates(shell),
                    holes: rings.map(coordinates).collect(),
                }
            }
            WireGeometry::MultiPolygon { coordinates: polygons } => Self::MultiPolygon {
                polygons: polygons
                    .into_iter()
                    .filter_map(|rings| rings.into_iter().next())
                    .map(coordinates)
                    .collect(),
            },
        })
    }
}

/// Task answer on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WireValue {
    Text {
        text: String,
    },
    Number {
        number: f64,
    },
    Date {
        epoch_millis: i64,
    },
    Time {
        epoch_millis: i64,
    },
    MultipleChoice {
        selected_option_ids: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        other_text: Option<String>,
    },
    Photo {
        media_path: String,
    },
    Location {
        coordinates: [f64; 2],
        #[serde(default, skip_serializing_if = "Option::is_none")]
        accuracy: Option<f64>,
    },
    Geometry {
        geometry: WireGeometry,
    },
    Skipped,
}

impl From<&TaskValue> for WireValue {
    fn from(value: &TaskValue) -> Self {
        match value {
            TaskValue::Text { text } => Self::Text { text: text.clone() },
            TaskValue::Number { value } => Self::Number { number: *value },
            TaskValue::Date { millis } => Self::Date {
                epoch_millis: *millis,
            },
            TaskValue::Time { millis } => Self::Time {
                epoch_millis: *millis,
            },
            TaskValue::MultipleChoice {
                selected,
                other_text,
            } => Self::MultipleChoice {
                selected_option_ids: selected.iter().map(ToString::to_string).collect(),
                other_text: other_text.clone(),
            },
            TaskValue::Photo { remote_path } => Self::Photo {
                media_path: remote_path.clone(),
            },
            TaskValue::Location {
                coordinate,
                accuracy_meters,
            } => Self::Location {
                coordinates: position(*coordinate),
                accuracy: *accuracy_meters,
            },
            TaskValue::Geometry { geometry } => Self::Geometry {
                geometry: geometry.into(),
            },
            TaskValue::Skipped => Self::Skipped,
        }
    }
}

impl TryFrom<WireValue> for TaskValue {
    type Error = RemoteError;

    fn try_from(value: WireValue) -> RemoteResult<Self> {
        Ok(match value {
            WireValue::Text { text } => Self::Text { text },
            WireValue::Number { number } => Self::Number { value: number },
            WireValue::Date { epoch_millis } => Self::Date {
                millis: epoch_millis,
            },
            WireValue::Time { epoch_millis } => Self::Time {
                millis: epoch_millis,
            },
            WireValue::MultipleChoice {
                selected_option_ids,
                other_text,
            } => Self::MultipleChoice {
                selected: selected_option_ids.into_iter().map(OptionId::new).collect(),
                other_text,
            },
            WireValue::Photo { media_path } => Self::Photo {
                remote_path: media_path,
            },
            WireValue::Location {
                coordinates,
                accuracy,
            } => Self::Location {
                coordinate: coordinate(coordinates),
                accuracy_meters: accuracy,
            },
            WireValue::Geometry { geometry } => Self::Geometry {
                geometry: geometry.try_into()?,
            },
            WireValue::Skipped => Self::Skipped,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireValueDelta {
    pub task_id: String,
    pub task_type: String,
    /// `None` clears the answer
    pub value: Option<WireValue>,
}

/// Record mutation as submitted in a batch. Media is uploaded separately
/// and has no wire mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WireMutation {
    LocationOfInterest {
        client_mutation_id: i64,
        operation: WireOperation,
        survey_id: String,
        loi_id: String,
        job_id: String,
        user_id: String,
        client_timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        geometry: Option<WireGeometry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        custom_id: Option<String>,
        #[serde(default)]
        properties: BTreeMap<String, String>,
    },
    Submission {
        client_mutation_id: i64,
        operation: WireOperation,
        survey_id: String,
        loi_id: String,
        submission_id: String,
        job_id: String,
        user_id: String,
        client_timestamp: i64,
        deltas: Vec<WireValueDelta>,
    },
}

impl WireMutation {
    /// Encode a queued record mutation.
    pub fn from_mutation(mutation: &Mutation) -> RemoteResult<Self> {
        let operation = WireOperation::from_type(mutation.mutation_type)?;
        match &mutation.payload {
            MutationPayload::LocationOfInterest(change) => Ok(Self::LocationOfInterest {
                client_mutation_id: mutation.id.get(),
                operation,
                survey_id: mutation.survey_id.to_string(),
                loi_id: mutation.loi_id.to_string(),
                job_id: change.job_id.to_string(),
                user_id: mutation.user_id.to_string(),
                client_timestamp: mutation.client_timestamp,
                geometry: change.geometry.as_ref().map(WireGeometry::from),
                custom_id: change.custom_id.clone(),
                properties: change.properties.clone(),
            }),
            MutationPayload::Submission(change) => Ok(Self::Submission {
                client_mutation_id: mutation.id.get(),
                operation,
                survey_id: mutation.survey_id.to_string(),
                loi_id: mutation.loi_id.to_string(),
                submission_id: change.submission_id.to_string(),
                job_id: change.job_id.to_string(),
                user_id: mutation.user_id.to_string(),
                client_timestamp: mutation.client_timestamp,
                deltas: change
                    .deltas
                    .iter()
                    .map(|delta| WireValueDelta {
                        task_id: delta.task_id.to_string(),
                        task_type: delta.task_type.as_str().to_string(),
                        value: delta.new_value.as_ref().map(WireValue::from),
                    })
                    .collect(),
            }),
            MutationPayload::Media(_) => Err(RemoteError::invalid_payload(
                "media mutations are uploaded, not batched",
            )),
        }
    }
}

/// Decode wire deltas back into domain deltas.
pub fn decode_deltas(deltas: Vec<WireValueDelta>) -> RemoteResult<Vec<ValueDelta>> {
    deltas
        .into_iter()
        .map(|delta| {
            Ok(ValueDelta {
                task_id: TaskId::new(delta.task_id),
                task_type: delta.task_type.parse().unwrap_or(TaskType::Unknown),
                new_value: delta.value.map(TaskValue::try_from).transpose()?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireBatchRequest {
    pub user_id: String,
    pub mutations: Vec<WireMutation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMutationFailure {
    pub client_mutation_id: i64,
    /// One of `PERMISSION_DENIED`, `INVALID_PAYLOAD`, `NOT_FOUND`,
    /// `UNAVAILABLE`, `THROTTLED`
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireBatchRejection {
    #[serde(default)]
    pub failures: Vec<WireMutationFailure>,
}

// ---------------------------------------------------------------------------
// Survey schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSurvey {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub last_modified: i64,
    #[serde(default)]
    pub jobs: Vec<WireJob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireJob {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub style_color: Option<String>,
    pub strategy: String,
    #[serde(default)]
    pub tasks: Vec<WireTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTask {
    pub id: String,
    pub index: i64,
    #[serde(rename = "type")]
    pub task_type: String,
    pub label: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub add_loi_task: bool,
    #[serde(default)]
    pub multiple_choice: Option<WireMultipleChoice>,
    #[serde(default)]
    pub condition: Option<WireCondition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMultipleChoice {
    pub cardinality: String,
    #[serde(default)]
    pub options: Vec<WireOption>,
    #[serde(default)]
    pub has_other: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOption {
    pub id: String,
    pub index: i64,
    #[serde(default)]
    pub code: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCondition {
    pub match_type: String,
    #[serde(default)]
    pub expressions: Vec<WireExpression>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireExpression {
    pub expression_type: String,
    pub task_id: String,
    #[serde(default)]
    pub option_ids: Vec<String>,
}

impl TryFrom<WireSurvey> for Survey {
    type Error = RemoteError;

    fn try_from(survey: WireSurvey) -> RemoteResult<Self> {
        let mut jobs = BTreeMap::new();
        for job in survey.jobs {
            let tasks = job
                .tasks
                .into_iter()
                .map(Task::try_from)
                .collect::<RemoteResult<Vec<_>>>()?;
            let id = JobId::new(job.id);
            jobs.insert(
                id.clone(),
                Job {
                    id,
                    name: job.name,
                    style_color: job.style_color,
                    strategy: DataCollectionStrategy::parse(&job.strategy),
                    tasks,
                },
            );
        }
        Ok(Self {
            id: SurveyId::new(survey.id),
            title: survey.title,
            description: survey.description,
            jobs,
            last_modified: survey.last_modified,
        })
    }
}

impl TryFrom<WireTask> for Task {
    type Error = RemoteError;

    fn try_from(task: WireTask) -> RemoteResult<Self> {
        let multiple_choice = task
            .multiple_choice
            .map(|choice| {
                let cardinality = Cardinality::parse(&choice.cardinality).ok_or_else(|| {
                    RemoteError::invalid_payload(format!(
                        "task {} has unknown cardinality '{}'",
                        task.id, choice.cardinality
                    ))
                })?;
                Ok::<_, RemoteError>(MultipleChoice {
                    cardinality,
                    options: choice
                        .options
                        .into_iter()
                        .map(|option| TaskOption {
                            id: OptionId::new(option.id),
                            index: option.index,
                            code: option.code,
                            label: option.label,
                        })
                        .collect(),
                    has_other: choice.has_other,
                })
            })
            .transpose()?;

        // Unknown match/expression types are kept so evaluation can flag them.
        let condition = task.condition.map(|condition| Condition {
            match_type: MatchType::parse(&condition.match_type),
            expressions: condition
                .expressions
                .into_iter()
                .map(|expression| Expression {
                    expression_type: ExpressionType::parse(&expression.expression_type),
                    task_id: TaskId::new(expression.task_id),
                    option_ids: expression
                        .option_ids
                        .into_iter()
                        .map(OptionId::new)
                        .collect::<BTreeSet<_>>(),
                })
                .collect(),
        });

        Ok(Self {
            id: TaskId::new(task.id),
            index: task.index,
            task_type: task.task_type.parse().unwrap_or(TaskType::Unknown),
            label: task.label,
            is_required: task.required,
            multiple_choice,
            condition,
            is_add_loi_task: task.add_loi_task,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireLoi {
    pub id: String,
    pub job_id: String,
    #[serde(default)]
    pub custom_id: Option<String>,
    pub geometry: WireGeometry,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    pub created_by: String,
    pub created_at: i64,
    #[serde(default)]
    pub modified_at: Option<i64>,
}

impl WireLoi {
    /// Decode a predefined LOI of `survey_id`.
    pub fn into_predefined(self, survey_id: &SurveyId) -> RemoteResult<LocationOfInterest> {
        let user_id = UserId::new(self.created_by);
        let modified_at = self.modified_at.unwrap_or(self.created_at);
        Ok(LocationOfInterest {
            id: LoiId::new(self.id),
            survey_id: survey_id.clone(),
            job_id: JobId::new(self.job_id),
            custom_id: self.custom_id,
            geometry: self.geometry.try_into()?,
            properties: self.properties,
            is_predefined: true,
            created: AuditInfo {
                user_id: user_id.clone(),
                client_timestamp: self.created_at,
                server_timestamp: Some(self.created_at),
            },
            last_modified: AuditInfo {
                user_id,
                client_timestamp: modified_at,
                server_timestamp: Some(modified_at),
            },
        })
    }
}
