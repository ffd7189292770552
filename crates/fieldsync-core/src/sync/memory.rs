//! In-memory remote store for tests and offline demos
//!
//! Batches are encoded to the wire format and applied to an in-memory copy
//! of the remote entities with last-write-wins semantics. Failures can be
//! scripted per call or per mutation.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::models::{
    Geometry, JobId, LocationOfInterest, Mutation, MutationId, SubmissionId, Survey, SurveyId,
    TaskSelections, UserId,
};

use super::remote::{
    BatchOutcome, MutationFailure, RemoteError, RemoteResult, RemoteStore, SurveyUpdate,
};
use super::wire::{decode_deltas, WireMutation, WireOperation};

/// Remote copy of a location of interest.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteLoi {
    pub job_id: JobId,
    pub geometry: Option<Geometry>,
    pub custom_id: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub deleted: bool,
    pub last_modified: i64,
}

/// Remote copy of a submission.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSubmission {
    pub job_id: JobId,
    pub values: TaskSelections,
    pub deleted: bool,
    pub last_modified: i64,
}

#[derive(Debug, Default)]
struct RemoteState {
    surveys: HashMap<SurveyId, Survey>,
    predefined: HashMap<SurveyId, Vec<LocationOfInterest>>,
    lois: BTreeMap<String, RemoteLoi>,
    submissions: BTreeMap<String, RemoteSubmission>,
    media: BTreeSet<String>,
    applied: Vec<MutationId>,
    batch_failures: VecDeque<RemoteError>,
    batch_rejections: VecDeque<Vec<MutationFailure>>,
    rejections: HashMap<MutationId, RemoteError>,
    upload_failures: VecDeque<RemoteError>,
    fetch_failures: VecDeque<RemoteError>,
    subscribers: Vec<(SurveyId, mpsc::Sender<SurveyUpdate>)>,
}

/// Scriptable `RemoteStore` backed by process memory.
#[derive(Debug, Default)]
pub struct InMemoryRemoteStore {
    state: Mutex<RemoteState>,
    fetch_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    upload_calls: AtomicUsize,
}

impl InMemoryRemoteStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a survey and its predefined LOIs.
    pub fn put_survey(&self, survey: Survey, predefined: Vec<LocationOfInterest>) {
        let mut state = self.state();
        state.predefined.insert(survey.id.clone(), predefined);
        state.surveys.insert(survey.id.clone(), survey);
    }

    /// Delete a survey remotely.
    pub fn remove_survey(&self, survey_id: &SurveyId) {
        let mut state = self.state();
        state.surveys.remove(survey_id);
        state.predefined.remove(survey_id);
    }

    /// Fail the next `count` batch calls with `error`.
    pub fn fail_next_batches(&self, count: usize, error: &RemoteError) {
        let mut state = self.state();
        state
            .batch_failures
            .extend(std::iter::repeat_n(error.clone(), count));
    }

    /// Answer the next batch call with `failures` verbatim, whatever ids the
    /// batch holds.
    pub fn reject_next_batch(&self, failures: Vec<MutationFailure>) {
        self.state().batch_rejections.push_back(failures);
    }

    /// Reject every batch containing `mutation_id` until cleared.
    pub fn reject_mutation(&self, mutation_id: MutationId, error: RemoteError) {
        self.state().rejections.insert(mutation_id, error);
    }

    pub fn clear_rejections(&self) {
        self.state().rejections.clear();
    }

    /// Fail the next `count` media uploads with `error`.
    pub fn fail_next_uploads(&self, count: usize, error: &RemoteError) {
        let mut state = self.state();
        state
            .upload_failures
            .extend(std::iter::repeat_n(error.clone(), count));
    }

    /// Fail the next `count` survey fetches with `error`.
    pub fn fail_next_fetches(&self, count: usize, error: &RemoteError) {
        let mut state = self.state();
        state
            .fetch_failures
            .extend(std::iter::repeat_n(error.clone(), count));
    }

    /// Notify survey subscribers of a change; closed subscriptions are dropped.
    pub fn publish_update(&self, survey_id: &SurveyId, changed_at: i64) {
        let mut state = self.state();
        state.subscribers.retain(|(subscribed, sender)| {
            if subscribed != survey_id {
                return !sender.is_closed();
            }
            sender
                .try_send(SurveyUpdate {
                    survey_id: survey_id.clone(),
                    changed_at,
                })
                .is_ok()
        });
    }

    /// End every update stream.
    pub fn close_streams(&self) {
        self.state().subscribers.clear();
    }

    #[must_use]
    pub fn loi(&self, loi_id: &str) -> Option<RemoteLoi> {
        self.state().lois.get(loi_id).cloned()
    }

    #[must_use]
    pub fn lois(&self) -> BTreeMap<String, RemoteLoi> {
        self.state().lois.clone()
    }

    #[must_use]
    pub fn submission(&self, submission_id: &SubmissionId) -> Option<RemoteSubmission> {
        self.state().submissions.get(submission_id.as_str()).cloned()
    }

    #[must_use]
    pub fn has_media(&self, remote_path: &str) -> bool {
        self.state().media.contains(remote_path)
    }

    /// Mutation ids applied so far, in application order.
    #[must_use]
    pub fn applied(&self) -> Vec<MutationId> {
        self.state().applied.clone()
    }

    #[must_use]
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }
}

fn apply_wire(
    lois: &mut BTreeMap<String, RemoteLoi>,
    submissions: &mut BTreeMap<String, RemoteSubmission>,
    mutation: WireMutation,
) -> RemoteResult<()> {
    match mutation {
        WireMutation::LocationOfInterest {
            operation,
            loi_id,
            job_id,
            client_timestamp,
            geometry,
            custom_id,
            properties,
            ..
        } => {
            let geometry = geometry.map(Geometry::try_from).transpose()?;
            let entry = lois.entry(loi_id).or_insert_with(|| RemoteLoi {
                job_id: JobId::new(job_id.clone()),
                geometry: None,
                custom_id: None,
                properties: BTreeMap::new(),
                deleted: false,
                last_modified: client_timestamp,
            });
            entry.last_modified = client_timestamp;
            if operation == WireOperation::Delete {
                entry.deleted = true;
                return Ok(());
            }
            entry.deleted = false;
            entry.job_id = JobId::new(job_id);
            if geometry.is_some() {
                entry.geometry = geometry;
            }
            entry.custom_id = custom_id;
            entry.properties = properties;
        }
        WireMutation::Submission {
            operation,
            submission_id,
            job_id,
            client_timestamp,
            deltas,
            ..
        } => {
            let deltas = decode_deltas(deltas)?;
            let entry = submissions
                .entry(submission_id)
                .or_insert_with(|| RemoteSubmission {
                    job_id: JobId::new(job_id),
                    values: TaskSelections::new(),
                    deleted: false,
                    last_modified: client_timestamp,
                });
            entry.last_modified = client_timestamp;
            if operation == WireOperation::Delete {
                entry.deleted = true;
                return Ok(());
            }
            entry.deleted = false;
            for delta in deltas {
                match delta.new_value {
                    Some(value) => {
                        entry.values.insert(delta.task_id, value);
                    }
                    None => {
                        entry.values.remove(&delta.task_id);
                    }
                }
            }
        }
    }
    Ok(())
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn fetch_survey(&self, survey_id: &SurveyId) -> RemoteResult<Option<Survey>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(error) = state.fetch_failures.pop_front() {
            return Err(error);
        }
        Ok(state.surveys.get(survey_id).cloned())
    }

    async fn fetch_predefined_lois(&self, survey: &Survey) -> RemoteResult<Vec<LocationOfInterest>> {
        Ok(self
            .state()
            .predefined
            .get(&survey.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn apply_mutation_batch(
        &self,
        mutations: &[Mutation],
        _user_id: &UserId,
    ) -> RemoteResult<BatchOutcome> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(error) = state.batch_failures.pop_front() {
            return Err(error);
        }
        if let Some(failures) = state.batch_rejections.pop_front() {
            return Ok(BatchOutcome::Rejected(failures));
        }

        let failures: Vec<MutationFailure> = mutations
            .iter()
            .filter_map(|mutation| {
                state
                    .rejections
                    .get(&mutation.id)
                    .map(|error| MutationFailure {
                        mutation_id: mutation.id,
                        error: error.clone(),
                    })
            })
            .collect();
        if !failures.is_empty() {
            return Ok(BatchOutcome::Rejected(failures));
        }

        // Apply to copies so a failing member leaves the remote untouched.
        let mut lois = state.lois.clone();
        let mut submissions = state.submissions.clone();
        let mut failures = Vec::new();
        for mutation in mutations {
            let applied = WireMutation::from_mutation(mutation)
                .and_then(|wire| apply_wire(&mut lois, &mut submissions, wire));
            if let Err(error) = applied {
                failures.push(MutationFailure {
                    mutation_id: mutation.id,
                    error,
                });
            }
        }
        if !failures.is_empty() {
            return Ok(BatchOutcome::Rejected(failures));
        }

        state.lois = lois;
        state.submissions = submissions;
        state
            .applied
            .extend(mutations.iter().map(|mutation| mutation.id));
        Ok(BatchOutcome::Applied)
    }

    async fn upload_media(&self, _local_path: &Path, remote_path: &str) -> RemoteResult<()> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(error) = state.upload_failures.pop_front() {
            return Err(error);
        }
        state.media.insert(remote_path.to_string());
        Ok(())
    }

    async fn download_url(&self, remote_path: &str) -> RemoteResult<String> {
        if self.state().media.contains(remote_path) {
            Ok(format!("memory://media/{remote_path}"))
        } else {
            Err(RemoteError::not_found(format!("media {remote_path}")))
        }
    }

    async fn stream_survey_updates(
        &self,
        survey_id: &SurveyId,
    ) -> RemoteResult<mpsc::Receiver<SurveyUpdate>> {
        let (sender, receiver) = mpsc::channel(16);
        self.state().subscribers.push((survey_id.clone(), sender));
        Ok(receiver)
    }
}
