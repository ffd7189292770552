//! Survey cache and collected data repository implementation
//!
//! Writes here are not transactional on their own; callers open one
//! transaction per logical operation and build the repository over it.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::{
    AuditInfo, Cardinality, Condition, DataCollectionStrategy, Expression, ExpressionType, Job,
    JobId, LoiId, LocationOfInterest, MatchType, MultipleChoice, OptionId, Submission,
    SubmissionId, Survey, SurveyId, Task, TaskId, TaskOption, TaskType, UserId,
};

/// Trait for survey schema and collected data storage operations
pub trait SurveyRepository {
    /// Load a cached survey with its full schema
    fn get_survey(&self, id: &SurveyId) -> Result<Option<Survey>>;

    /// Whether the survey schema is cached locally
    fn contains_survey(&self, id: &SurveyId) -> Result<bool>;

    /// Cached survey ids and titles, ordered by title
    fn list_surveys(&self) -> Result<Vec<(SurveyId, String)>>;

    /// Replace the cached schema: rows missing from `survey` are deleted,
    /// the rest upserted
    fn replace_survey(&self, survey: &Survey) -> Result<()>;

    /// Delete a survey, its schema, LOIs and submissions. Returns whether
    /// anything was cached.
    fn delete_survey(&self, id: &SurveyId) -> Result<bool>;

    /// Insert or update a location of interest
    fn upsert_loi(&self, loi: &LocationOfInterest) -> Result<()>;

    /// Soft delete a location of interest
    fn mark_loi_deleted(&self, id: &LoiId) -> Result<()>;

    /// Get a non-deleted location of interest
    fn get_loi(&self, id: &LoiId) -> Result<Option<LocationOfInterest>>;

    /// Non-deleted LOIs of a survey
    fn list_lois(&self, survey_id: &SurveyId) -> Result<Vec<LocationOfInterest>>;

    /// Replace the predefined LOIs of a survey; field-added LOIs are kept
    fn replace_predefined_lois(
        &self,
        survey_id: &SurveyId,
        lois: &[LocationOfInterest],
    ) -> Result<()>;

    /// Whether a survey has any non-deleted predefined LOI
    fn has_predefined_lois(&self, survey_id: &SurveyId) -> Result<bool>;

    /// Insert or update a submission
    fn upsert_submission(&self, submission: &Submission) -> Result<()>;

    /// Soft delete a submission
    fn mark_submission_deleted(&self, id: &SubmissionId) -> Result<()>;

    /// Get a non-deleted submission
    fn get_submission(&self, id: &SubmissionId) -> Result<Option<Submission>>;

    /// Non-deleted submissions for one LOI
    fn list_submissions(&self, loi_id: &LoiId) -> Result<Vec<Submission>>;
}

/// `SQLite` implementation of `SurveyRepository`
pub struct SqliteSurveyRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSurveyRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn ids(&self, sql: &str, parent: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(sql)?;
        let ids = stmt
            .query_map(params![parent], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    fn delete_condition(&self, task_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM expression WHERE condition_task_id = ?1",
            params![task_id],
        )?;
        self.conn
            .execute("DELETE FROM condition WHERE task_id = ?1", params![task_id])?;
        Ok(())
    }

    fn delete_task(&self, task_id: &str) -> Result<()> {
        self.delete_condition(task_id)?;
        self.conn
            .execute("DELETE FROM task_option WHERE task_id = ?1", params![task_id])?;
        self.conn
            .execute("DELETE FROM task WHERE id = ?1", params![task_id])?;
        Ok(())
    }

    fn delete_job(&self, job_id: &str) -> Result<()> {
        for task_id in self.ids("SELECT id FROM task WHERE job_id = ?1", job_id)? {
            self.delete_task(&task_id)?;
        }
        self.conn
            .execute("DELETE FROM job WHERE id = ?1", params![job_id])?;
        Ok(())
    }

    fn upsert_job(&self, survey_id: &SurveyId, job: &Job) -> Result<()> {
        self.conn.execute(
            "INSERT INTO job (id, survey_id, name, style_color, strategy)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                survey_id = excluded.survey_id, name = excluded.name,
                style_color = excluded.style_color, strategy = excluded.strategy",
            params![
                job.id.as_str(),
                survey_id.as_str(),
                job.name,
                job.style_color,
                job.strategy.as_str(),
            ],
        )?;

        let keep: HashSet<&str> = job.tasks.iter().map(|task| task.id.as_str()).collect();
        for task_id in self.ids("SELECT id FROM task WHERE job_id = ?1", job.id.as_str())? {
            if !keep.contains(task_id.as_str()) {
                self.delete_task(&task_id)?;
            }
        }
        for task in &job.tasks {
            self.upsert_task(&job.id, task)?;
        }
        Ok(())
    }

    fn upsert_task(&self, job_id: &JobId, task: &Task) -> Result<()> {
        let (cardinality, has_other) = task
            .multiple_choice
            .as_ref()
            .map_or((None, false), |choice| {
                (Some(choice.cardinality.as_str()), choice.has_other)
            });
        self.conn.execute(
            "INSERT INTO task (id, job_id, idx, task_type, label, is_required,
                               is_add_loi_task, cardinality, has_other)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                job_id = excluded.job_id, idx = excluded.idx,
                task_type = excluded.task_type, label = excluded.label,
                is_required = excluded.is_required,
                is_add_loi_task = excluded.is_add_loi_task,
                cardinality = excluded.cardinality, has_other = excluded.has_other",
            params![
                task.id.as_str(),
                job_id.as_str(),
                task.index,
                task.task_type.as_str(),
                task.label,
                task.is_required,
                task.is_add_loi_task,
                cardinality,
                has_other,
            ],
        )?;

        let options = task
            .multiple_choice
            .as_ref()
            .map_or(&[][..], |choice| choice.options.as_slice());
        let keep: HashSet<&str> = options.iter().map(|option| option.id.as_str()).collect();
        for option_id in self.ids(
            "SELECT id FROM task_option WHERE task_id = ?1",
            task.id.as_str(),
        )? {
            if !keep.contains(option_id.as_str()) {
                self.conn
                    .execute("DELETE FROM task_option WHERE id = ?1", params![option_id])?;
            }
        }
        for option in options {
            self.conn.execute(
                "INSERT INTO task_option (id, task_id, idx, code, label)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    task_id = excluded.task_id, idx = excluded.idx,
                    code = excluded.code, label = excluded.label",
                params![
                    option.id.as_str(),
                    task.id.as_str(),
                    option.index,
                    option.code,
                    option.label,
                ],
            )?;
        }

        // Conditions carry no ids of their own, so they are rewritten whole.
        self.delete_condition(task.id.as_str())?;
        if let Some(condition) = &task.condition {
            self.conn.execute(
                "INSERT INTO condition (task_id, match_type) VALUES (?1, ?2)",
                params![task.id.as_str(), condition.match_type.as_str()],
            )?;
            for (position, expression) in condition.expressions.iter().enumerate() {
                self.conn.execute(
                    "INSERT INTO expression
                        (condition_task_id, position, expression_type, task_id, option_ids)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        task.id.as_str(),
                        i64::try_from(position).unwrap_or(i64::MAX),
                        expression.expression_type.as_str(),
                        expression.task_id.as_str(),
                        serde_json::to_string(&expression.option_ids)?,
                    ],
                )?;
            }
        }
        Ok(())
    }

    fn load_jobs(&self, survey_id: &SurveyId) -> Result<BTreeMap<JobId, Job>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, style_color, strategy FROM job WHERE survey_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![survey_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut jobs = BTreeMap::new();
        for (id, name, style_color, strategy) in rows {
            let job_id = JobId::new(id);
            let tasks = self.load_tasks(&job_id)?;
            jobs.insert(
                job_id.clone(),
                Job {
                    id: job_id,
                    name,
                    style_color,
                    strategy: DataCollectionStrategy::parse(&strategy),
                    tasks,
                },
            );
        }
        Ok(jobs)
    }

    fn load_tasks(&self, job_id: &JobId) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, idx, task_type, label, is_required, is_add_loi_task,
                    cardinality, has_other
             FROM task WHERE job_id = ?1 ORDER BY idx, id",
        )?;
        let rows = stmt
            .query_map(params![job_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, bool>(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut tasks = Vec::with_capacity(rows.len());
        for (id, index, task_type, label, is_required, is_add_loi_task, cardinality, has_other) in
            rows
        {
            let multiple_choice = match cardinality.as_deref().and_then(Cardinality::parse) {
                Some(cardinality) => Some(MultipleChoice {
                    cardinality,
                    options: self.load_options(&id)?,
                    has_other,
                }),
                None => None,
            };
            let condition = self.load_condition(&id)?;
            tasks.push(Task {
                id: TaskId::new(id),
                index,
                task_type: task_type.parse().unwrap_or(TaskType::Unknown),
                label,
                is_required,
                multiple_choice,
                condition,
                is_add_loi_task,
            });
        }
        Ok(tasks)
    }

    fn load_options(&self, task_id: &str) -> Result<Vec<TaskOption>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, idx, code, label FROM task_option WHERE task_id = ?1 ORDER BY idx, id",
        )?;
        let options = stmt
            .query_map(params![task_id], |row| {
                Ok(TaskOption {
                    id: OptionId::new(row.get::<_, String>(0)?),
                    index: row.get(1)?,
                    code: row.get(2)?,
                    label: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(options)
    }

    fn load_condition(&self, task_id: &str) -> Result<Option<Condition>> {
        let match_type: Option<String> = self
            .conn
            .query_row(
                "SELECT match_type FROM condition WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(match_type) = match_type else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT expression_type, task_id, option_ids FROM expression
             WHERE condition_task_id = ?1 ORDER BY position",
        )?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut expressions = Vec::with_capacity(rows.len());
        for (expression_type, referenced, option_ids) in rows {
            expressions.push(Expression {
                expression_type: ExpressionType::parse(&expression_type),
                task_id: TaskId::new(referenced),
                option_ids: serde_json::from_str::<BTreeSet<OptionId>>(&option_ids)?,
            });
        }

        Ok(Some(Condition {
            match_type: MatchType::parse(&match_type),
            expressions,
        }))
    }

    fn query_lois(&self, sql: &str, key: &str) -> Result<Vec<LocationOfInterest>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![key], parse_loi_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(LoiRow::into_loi).collect()
    }

    fn query_submissions(&self, sql: &str, key: &str) -> Result<Vec<Submission>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![key], parse_submission_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(SubmissionRow::into_submission).collect()
    }
}

const LOI_COLUMNS: &str = "SELECT id, survey_id, job_id, custom_id, geometry, properties,
        is_predefined, created_by, created_at, modified_by, modified_at, server_modified_at
     FROM location_of_interest";

const SUBMISSION_COLUMNS: &str = "SELECT id, survey_id, loi_id, job_id, task_values,
        created_by, created_at, modified_by, modified_at
     FROM submission";

impl SurveyRepository for SqliteSurveyRepository<'_> {
    fn get_survey(&self, id: &SurveyId) -> Result<Option<Survey>> {
        let row = self
            .conn
            .query_row(
                "SELECT title, description, last_modified FROM survey WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((title, description, last_modified)) = row else {
            return Ok(None);
        };

        Ok(Some(Survey {
            id: id.clone(),
            title,
            description,
            jobs: self.load_jobs(id)?,
            last_modified,
        }))
    }

    fn contains_survey(&self, id: &SurveyId) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM survey WHERE id = ?1)",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn list_surveys(&self) -> Result<Vec<(SurveyId, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, title FROM survey ORDER BY title, id")?;
        let surveys = stmt
            .query_map([], |row| {
                Ok((SurveyId::new(row.get::<_, String>(0)?), row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(surveys)
    }

    fn replace_survey(&self, survey: &Survey) -> Result<()> {
        self.conn.execute(
            "INSERT INTO survey (id, title, description, last_modified)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title, description = excluded.description,
                last_modified = excluded.last_modified",
            params![
                survey.id.as_str(),
                survey.title,
                survey.description,
                survey.last_modified,
            ],
        )?;

        for job_id in self.ids("SELECT id FROM job WHERE survey_id = ?1", survey.id.as_str())? {
            if !survey.jobs.contains_key(&JobId::new(job_id.clone())) {
                self.delete_job(&job_id)?;
            }
        }
        for job in survey.jobs.values() {
            self.upsert_job(&survey.id, job)?;
        }

        tracing::debug!(
            "Replaced cached schema for survey {} ({} jobs)",
            survey.id,
            survey.jobs.len()
        );
        Ok(())
    }

    fn delete_survey(&self, id: &SurveyId) -> Result<bool> {
        for job_id in self.ids("SELECT id FROM job WHERE survey_id = ?1", id.as_str())? {
            self.delete_job(&job_id)?;
        }
        self.conn.execute(
            "DELETE FROM submission WHERE survey_id = ?1",
            params![id.as_str()],
        )?;
        self.conn.execute(
            "DELETE FROM location_of_interest WHERE survey_id = ?1",
            params![id.as_str()],
        )?;
        let rows = self
            .conn
            .execute("DELETE FROM survey WHERE id = ?1", params![id.as_str()])?;
        Ok(rows > 0)
    }

    fn upsert_loi(&self, loi: &LocationOfInterest) -> Result<()> {
        self.conn.execute(
            "INSERT INTO location_of_interest (
                id, survey_id, job_id, custom_id, geometry, properties, is_predefined,
                created_by, created_at, modified_by, modified_at, server_modified_at, is_deleted
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0)
             ON CONFLICT(id) DO UPDATE SET
                job_id = excluded.job_id, custom_id = excluded.custom_id,
                geometry = excluded.geometry, properties = excluded.properties,
                is_predefined = excluded.is_predefined,
                modified_by = excluded.modified_by, modified_at = excluded.modified_at,
                server_modified_at = excluded.server_modified_at, is_deleted = 0",
            params![
                loi.id.as_str(),
                loi.survey_id.as_str(),
                loi.job_id.as_str(),
                loi.custom_id,
                serde_json::to_string(&loi.geometry)?,
                serde_json::to_string(&loi.properties)?,
                loi.is_predefined,
                loi.created.user_id.as_str(),
                loi.created.client_timestamp,
                loi.last_modified.user_id.as_str(),
                loi.last_modified.client_timestamp,
                loi.last_modified.server_timestamp,
            ],
        )?;
        Ok(())
    }

    fn mark_loi_deleted(&self, id: &LoiId) -> Result<()> {
        self.conn.execute(
            "UPDATE location_of_interest SET is_deleted = 1 WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(())
    }

    fn get_loi(&self, id: &LoiId) -> Result<Option<LocationOfInterest>> {
        let sql = format!("{LOI_COLUMNS} WHERE id = ?1 AND is_deleted = 0");
        Ok(self.query_lois(&sql, id.as_str())?.into_iter().next())
    }

    fn list_lois(&self, survey_id: &SurveyId) -> Result<Vec<LocationOfInterest>> {
        let sql = format!("{LOI_COLUMNS} WHERE survey_id = ?1 AND is_deleted = 0 ORDER BY id");
        self.query_lois(&sql, survey_id.as_str())
    }

    fn replace_predefined_lois(
        &self,
        survey_id: &SurveyId,
        lois: &[LocationOfInterest],
    ) -> Result<()> {
        let keep: HashSet<&str> = lois.iter().map(|loi| loi.id.as_str()).collect();
        for loi_id in self.ids(
            "SELECT id FROM location_of_interest WHERE survey_id = ?1 AND is_predefined = 1",
            survey_id.as_str(),
        )? {
            if !keep.contains(loi_id.as_str()) {
                self.conn.execute(
                    "DELETE FROM location_of_interest WHERE id = ?1",
                    params![loi_id],
                )?;
            }
        }
        for loi in lois {
            self.upsert_loi(loi)?;
        }
        Ok(())
    }

    fn has_predefined_lois(&self, survey_id: &SurveyId) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM location_of_interest
                WHERE survey_id = ?1 AND is_predefined = 1 AND is_deleted = 0
             )",
            params![survey_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn upsert_submission(&self, submission: &Submission) -> Result<()> {
        self.conn.execute(
            "INSERT INTO submission (
                id, survey_id, loi_id, job_id, task_values,
                created_by, created_at, modified_by, modified_at, is_deleted
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)
             ON CONFLICT(id) DO UPDATE SET
                task_values = excluded.task_values,
                modified_by = excluded.modified_by, modified_at = excluded.modified_at,
                is_deleted = 0",
            params![
                submission.id.as_str(),
                submission.survey_id.as_str(),
                submission.loi_id.as_str(),
                submission.job_id.as_str(),
                serde_json::to_string(&submission.values)?,
                submission.created.user_id.as_str(),
                submission.created.client_timestamp,
                submission.last_modified.user_id.as_str(),
                submission.last_modified.client_timestamp,
            ],
        )?;
        Ok(())
    }

    fn mark_submission_deleted(&self, id: &SubmissionId) -> Result<()> {
        self.conn.execute(
            "UPDATE submission SET is_deleted = 1 WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(())
    }

    fn get_submission(&self, id: &SubmissionId) -> Result<Option<Submission>> {
        let sql = format!("{SUBMISSION_COLUMNS} WHERE id = ?1 AND is_deleted = 0");
        Ok(self.query_submissions(&sql, id.as_str())?.into_iter().next())
    }

    fn list_submissions(&self, loi_id: &LoiId) -> Result<Vec<Submission>> {
        let sql = format!(
            "{SUBMISSION_COLUMNS} WHERE loi_id = ?1 AND is_deleted = 0 ORDER BY created_at, id"
        );
        self.query_submissions(&sql, loi_id.as_str())
    }
}

struct LoiRow {
    id: String,
    survey_id: String,
    job_id: String,
    custom_id: Option<String>,
    geometry: String,
    properties: String,
    is_predefined: bool,
    created_by: String,
    created_at: i64,
    modified_by: String,
    modified_at: i64,
    server_modified_at: Option<i64>,
}

fn parse_loi_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LoiRow> {
    Ok(LoiRow {
        id: row.get(0)?,
        survey_id: row.get(1)?,
        job_id: row.get(2)?,
        custom_id: row.get(3)?,
        geometry: row.get(4)?,
        properties: row.get(5)?,
        is_predefined: row.get(6)?,
        created_by: row.get(7)?,
        created_at: row.get(8)?,
        modified_by: row.get(9)?,
        modified_at: row.get(10)?,
        server_modified_at: row.get(11)?,
    })
}

impl LoiRow {
    fn into_loi(self) -> Result<LocationOfInterest> {
        Ok(LocationOfInterest {
            id: LoiId::new(self.id),
            survey_id: SurveyId::new(self.survey_id),
            job_id: JobId::new(self.job_id),
            custom_id: self.custom_id,
            geometry: serde_json::from_str(&self.geometry)?,
            properties: serde_json::from_str(&self.properties)?,
            is_predefined: self.is_predefined,
            created: AuditInfo {
                user_id: UserId::new(self.created_by),
                client_timestamp: self.created_at,
                server_timestamp: None,
            },
            last_modified: AuditInfo {
                user_id: UserId::new(self.modified_by),
                client_timestamp: self.modified_at,
                server_timestamp: self.server_modified_at,
            },
        })
    }
}

struct SubmissionRow {
    id: String,
    survey_id: String,
    loi_id: String,
    job_id: String,
    task_values: String,
    created_by: String,
    created_at: i64,
    modified_by: String,
    modified_at: i64,
}

fn parse_submission_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubmissionRow> {
    Ok(SubmissionRow {
        id: row.get(0)?,
        survey_id: row.get(1)?,
        loi_id: row.get(2)?,
        job_id: row.get(3)?,
        task_values: row.get(4)?,
        created_by: row.get(5)?,
        created_at: row.get(6)?,
        modified_by: row.get(7)?,
        modified_at: row.get(8)?,
    })
}

impl SubmissionRow {
    fn into_submission(self) -> Result<Submission> {
        Ok(Submission {
            id: SubmissionId::new(self.id),
            survey_id: SurveyId::new(self.survey_id),
            loi_id: LoiId::new(self.loi_id),
            job_id: JobId::new(self.job_id),
            values: serde_json::from_str(&self.task_values)?,
            created: AuditInfo {
                user_id: UserId::new(self.created_by),
                client_timestamp: self.created_at,
                server_timestamp: None,
            },
            last_modified: AuditInfo {
                user_id: UserId::new(self.modified_by),
                client_timestamp: self.modified_at,
                server_timestamp: None,
            },
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{Coordinate, Geometry, TaskSelections, TaskValue};
    use pretty_assertions::assert_eq;

    /// Survey `s1` with job `j1`: multiple-choice `t1` (options x, y) and a
    /// text task `t2` shown when `x` is selected.
    pub(crate) fn sample_survey() -> Survey {
        let t1 = Task {
            id: TaskId::from("t1"),
            index: 0,
            task_type: TaskType::MultipleChoice,
            label: "Has water?".to_string(),
            is_required: true,
            multiple_choice: Some(MultipleChoice {
                cardinality: Cardinality::SelectOne,
                options: vec![
                    TaskOption {
                        id: OptionId::from("x"),
                        index: 0,
                        code: "X".to_string(),
                        label: "Yes".to_string(),
                    },
                    TaskOption {
                        id: OptionId::from("y"),
                        index: 1,
                        code: "Y".to_string(),
                        label: "No".to_string(),
                    },
                ],
                has_other: false,
            }),
            condition: None,
            is_add_loi_task: false,
        };
        let t2 = Task {
            id: TaskId::from("t2"),
            index: 1,
            task_type: TaskType::Text,
            label: "Describe the source".to_string(),
            is_required: false,
            multiple_choice: None,
            condition: Some(Condition {
                match_type: MatchType::MatchAny,
                expressions: vec![Expression {
                    expression_type: ExpressionType::AnyOfSelected,
                    task_id: TaskId::from("t1"),
                    option_ids: [OptionId::from("x")].into_iter().collect(),
                }],
            }),
            is_add_loi_task: false,
        };
        let job = Job {
            id: JobId::from("j1"),
            name: "Wells".to_string(),
            style_color: Some("#3366ff".to_string()),
            strategy: DataCollectionStrategy::AdHoc,
            tasks: vec![t1, t2],
        };
        Survey {
            id: SurveyId::from("s1"),
            title: "Water points".to_string(),
            description: "Rural water survey".to_string(),
            jobs: [(job.id.clone(), job)].into_iter().collect(),
            last_modified: 1_000,
        }
    }

    pub(crate) fn sample_loi(id: &str, predefined: bool) -> LocationOfInterest {
        LocationOfInterest {
            id: LoiId::from(id),
            survey_id: SurveyId::from("s1"),
            job_id: JobId::from("j1"),
            custom_id: None,
            geometry: Geometry::Point {
                coordinate: Coordinate::new(1.0, 2.0),
            },
            properties: BTreeMap::new(),
            is_predefined: predefined,
            created: AuditInfo {
                user_id: UserId::from("u1"),
                client_timestamp: 10,
                server_timestamp: None,
            },
            last_modified: AuditInfo {
                user_id: UserId::from("u1"),
                client_timestamp: 10,
                server_timestamp: None,
            },
        }
    }

    fn count(db: &Database, table: &str) -> i64 {
        db.connection()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_replace_and_load_survey() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteSurveyRepository::new(db.connection());

        let survey = sample_survey();
        repo.replace_survey(&survey).unwrap();

        let loaded = repo.get_survey(&survey.id).unwrap().unwrap();
        assert_eq!(loaded, survey);
    }

    #[test]
    fn test_replace_deletes_rows_missing_from_payload() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteSurveyRepository::new(db.connection());
        repo.replace_survey(&sample_survey()).unwrap();

        let mut updated = sample_survey();
        let job = updated.jobs.get_mut(&JobId::from("j1")).unwrap();
        job.tasks.retain(|task| task.id.as_str() == "t1");
        if let Some(choice) = job.tasks[0].multiple_choice.as_mut() {
            choice.options.truncate(1);
        }
        repo.replace_survey(&updated).unwrap();

        assert_eq!(repo.get_survey(&updated.id).unwrap().unwrap(), updated);
        assert_eq!(count(&db, "task"), 1);
        assert_eq!(count(&db, "task_option"), 1);
        assert_eq!(count(&db, "condition"), 0);
        assert_eq!(count(&db, "expression"), 0);
    }

    #[test]
    fn test_delete_survey_cascades() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteSurveyRepository::new(db.connection());
        let survey = sample_survey();
        repo.replace_survey(&survey).unwrap();
        repo.upsert_loi(&sample_loi("l1", true)).unwrap();

        assert!(repo.delete_survey(&survey.id).unwrap());
        for table in [
            "survey",
            "job",
            "task",
            "task_option",
            "condition",
            "expression",
            "location_of_interest",
        ] {
            assert_eq!(count(&db, table), 0, "{table}");
        }
        assert!(!repo.delete_survey(&survey.id).unwrap());
    }

    #[test]
    fn test_predefined_lois() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteSurveyRepository::new(db.connection());
        let survey_id = SurveyId::from("s1");
        assert!(!repo.has_predefined_lois(&survey_id).unwrap());

        repo.upsert_loi(&sample_loi("field", false)).unwrap();
        repo.replace_predefined_lois(&survey_id, &[sample_loi("p1", true), sample_loi("p2", true)])
            .unwrap();
        assert!(repo.has_predefined_lois(&survey_id).unwrap());

        repo.replace_predefined_lois(&survey_id, &[sample_loi("p2", true)])
            .unwrap();
        let ids: Vec<String> = repo
            .list_lois(&survey_id)
            .unwrap()
            .into_iter()
            .map(|loi| loi.id.to_string())
            .collect();
        assert_eq!(ids, vec!["field", "p2"]);

        repo.mark_loi_deleted(&LoiId::from("p2")).unwrap();
        assert!(repo.get_loi(&LoiId::from("p2")).unwrap().is_none());
        assert!(!repo.has_predefined_lois(&survey_id).unwrap());
    }

    #[test]
    fn test_submission_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteSurveyRepository::new(db.connection());

        let mut values = TaskSelections::new();
        values.insert(
            TaskId::from("t1"),
            TaskValue::MultipleChoice {
                selected: [OptionId::from("x")].into_iter().collect(),
                other_text: None,
            },
        );
        let submission = Submission {
            id: SubmissionId::from("sub-1"),
            survey_id: SurveyId::from("s1"),
            loi_id: LoiId::from("l1"),
            job_id: JobId::from("j1"),
            values,
            created: AuditInfo {
                user_id: UserId::from("u1"),
                client_timestamp: 5,
                server_timestamp: None,
            },
            last_modified: AuditInfo {
                user_id: UserId::from("u1"),
                client_timestamp: 6,
                server_timestamp: None,
            },
        };
        repo.upsert_submission(&submission).unwrap();

        let loaded = repo.get_submission(&submission.id).unwrap().unwrap();
        assert_eq!(loaded, submission);
        assert_eq!(repo.list_submissions(&LoiId::from("l1")).unwrap().len(), 1);
    }
}
