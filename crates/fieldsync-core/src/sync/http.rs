//! `RemoteStore` over the JSON HTTP API.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::models::{LocationOfInterest, Mutation, MutationId, Survey, SurveyId, UserId};
use crate::util::{excerpt, is_http_url, non_blank, ERROR_EXCERPT_CHARS};

use super::remote::{
    BatchOutcome, MutationFailure, RemoteError, RemoteErrorKind, RemoteResult, RemoteStore,
    SurveyUpdate,
};
use super::wire::{WireBatchRejection, WireBatchRequest, WireLoi, WireMutation, WireSurvey};

/// Default period between survey update polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct HttpRemoteStore {
    base_url: String,
    client: reqwest::Client,
    poll_interval: Duration,
}

impl std::fmt::Debug for HttpRemoteStore {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteStore")
            .field("base_url", &self.base_url)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSurveyChanges {
    #[serde(default)]
    changed_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireDownloadUrl {
    url: String,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|error| Error::InvalidInput(format!("HTTP client: {error}")))?;
        Ok(Self {
            base_url,
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.base_url)
    }

    fn survey_url(&self, survey_id: &SurveyId, suffix: &str) -> String {
        self.url(&format!(
            "surveys/{}{suffix}",
            urlencoding::encode(survey_id.as_str())
        ))
    }

    fn media_url(&self, remote_path: &str, suffix: &str) -> String {
        let encoded: Vec<_> = remote_path
            .trim_start_matches('/')
            .split('/')
            .map(urlencoding::encode)
            .collect();
        self.url(&format!("media/{}{suffix}", encoded.join("/")))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn fetch_survey(&self, survey_id: &SurveyId) -> RemoteResult<Option<Survey>> {
        let response = self
            .client
            .get(self.survey_url(survey_id, ""))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let survey: WireSurvey = read_json(response).await?;
        Survey::try_from(survey).map(Some)
    }

    async fn fetch_predefined_lois(
        &self,
        survey: &Survey,
    ) -> RemoteResult<Vec<LocationOfInterest>> {
        let response = self
            .client
            .get(self.survey_url(&survey.id, "/lois"))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(transport_error)?;
        let lois: Vec<WireLoi> = read_json(response).await?;
        lois.into_iter()
            .map(|loi| loi.into_predefined(&survey.id))
            .collect()
    }

    async fn apply_mutation_batch(
        &self,
        mutations: &[Mutation],
        user_id: &UserId,
    ) -> RemoteResult<BatchOutcome> {
        let mut encoded = Vec::with_capacity(mutations.len());
        let mut unencodable = Vec::new();
        for mutation in mutations {
            match WireMutation::from_mutation(mutation) {
                Ok(wire) => encoded.push(wire),
                Err(error) => unencodable.push(MutationFailure {
                    mutation_id: mutation.id,
                    error,
                }),
            }
        }
        if !unencodable.is_empty() {
            return Ok(BatchOutcome::Rejected(unencodable));
        }

        let request = WireBatchRequest {
            user_id: user_id.to_string(),
            mutations: encoded,
        };
        let response = self
            .client
            .post(self.url("mutations/batch"))
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(BatchOutcome::Applied);
        }
        let body = response.text().await.unwrap_or_default();
        if matches!(
            status,
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY
        ) {
            if let Ok(rejection) = serde_json::from_str::<WireBatchRejection>(&body) {
                if !rejection.failures.is_empty() {
                    return Ok(BatchOutcome::Rejected(
                        rejection
                            .failures
                            .into_iter()
                            .map(|failure| MutationFailure {
                                mutation_id: MutationId::new(failure.client_mutation_id),
                                error: error_from_code(&failure.code, failure.message),
                            })
                            .collect(),
                    ));
                }
            }
        }
        Err(classify_status(status, &body))
    }

    async fn upload_media(&self, local_path: &Path, remote_path: &str) -> RemoteResult<()> {
        let bytes = tokio::fs::read(local_path).await.map_err(|error| {
            RemoteError::invalid_payload(format!(
                "cannot read {}: {error}",
                local_path.display()
            ))
        })?;
        let response = self
            .client
            .put(self.media_url(remote_path, ""))
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(transport_error)?;
        ensure_success(response).await?;
        tracing::debug!("Uploaded media to {remote_path}");
        Ok(())
    }

    async fn download_url(&self, remote_path: &str) -> RemoteResult<String> {
        let response = self
            .client
            .get(self.media_url(remote_path, "/url"))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(transport_error)?;
        let payload: WireDownloadUrl = read_json(response).await?;
        Ok(payload.url)
    }

    async fn stream_survey_updates(
        &self,
        survey_id: &SurveyId,
    ) -> RemoteResult<mpsc::Receiver<SurveyUpdate>> {
        let (sender, receiver) = mpsc::channel(16);
        let store = self.clone();
        let survey_id = survey_id.clone();
        tokio::spawn(async move {
            let mut since = 0_i64;
            let mut ticker = tokio::time::interval(store.poll_interval);
            loop {
                tokio::select! {
                    () = sender.closed() => break,
                    _ = ticker.tick() => {}
                }
                match store.poll_changes(&survey_id, since).await {
                    Ok(Some(changed_at)) if changed_at > since => {
                        since = changed_at;
                        let update = SurveyUpdate {
                            survey_id: survey_id.clone(),
                            changed_at,
                        };
                        if sender.send(update).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(error) if error.is_not_found() => {
                        tracing::info!("Survey {survey_id} no longer exists remotely");
                        break;
                    }
                    Err(error) => {
                        tracing::debug!("Polling updates for survey {survey_id} failed: {error}");
                    }
                }
            }
        });
        Ok(receiver)
    }
}

impl HttpRemoteStore {
    async fn poll_changes(&self, survey_id: &SurveyId, since: i64) -> RemoteResult<Option<i64>> {
        let response = self
            .client
            .get(self.survey_url(survey_id, "/updates"))
            .query(&[("since", since)])
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(transport_error)?;
        let changes: WireSurveyChanges = read_json(response).await?;
        Ok(changes.changed_at)
    }
}

async fn ensure_success(response: Response) -> RemoteResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> RemoteResult<T> {
    let response = ensure_success(response).await?;
    response
        .json::<T>()
        .await
        .map_err(|error| RemoteError::invalid_payload(format!("unexpected response: {error}")))
}

fn transport_error(error: reqwest::Error) -> RemoteError {
    if error.is_decode() || error.is_builder() {
        RemoteError::invalid_payload(error.to_string())
    } else {
        RemoteError::unavailable(error.to_string())
    }
}

/// Map an HTTP failure status to a remote error class.
fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    let kind = match status.as_u16() {
        401 | 403 => RemoteErrorKind::PermissionDenied,
        404 => RemoteErrorKind::NotFound,
        400 | 409 | 422 => RemoteErrorKind::InvalidPayload,
        408 | 500..=599 => RemoteErrorKind::Unavailable,
        429 => RemoteErrorKind::Throttled,
        _ => RemoteErrorKind::Other,
    };
    RemoteError::new(kind, parse_api_error(status, body))
}

fn error_from_code(code: &str, message: String) -> RemoteError {
    let kind = match code {
        "PERMISSION_DENIED" => RemoteErrorKind::PermissionDenied,
        "INVALID_PAYLOAD" => RemoteErrorKind::InvalidPayload,
        "NOT_FOUND" => RemoteErrorKind::NotFound,
        "UNAVAILABLE" => RemoteErrorKind::Unavailable,
        "THROTTLED" => RemoteErrorKind::Throttled,
        _ => RemoteErrorKind::Other,
    };
    RemoteError::new(kind, message)
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", excerpt(&message, ERROR_EXCERPT_CHARS), status.as_u16());
        }
    }

    let trimmed = excerpt(body, ERROR_EXCERPT_CHARS);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_base_url(raw: String) -> Result<String> {
    let base_url = non_blank(Some(raw))
        .ok_or_else(|| Error::InvalidInput("API base URL must not be empty".to_string()))?;
    if is_http_url(&base_url) {
        Ok(base_url.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "API base URL must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_base_url_rejects_invalid_values() {
        assert!(normalize_base_url(String::new()).is_err());
        assert!(normalize_base_url("api.example.com".to_string()).is_err());
        assert_eq!(
            normalize_base_url(" https://api.example.com/ ".to_string()).unwrap(),
            "https://api.example.com"
        );
    }

    #[test]
    fn statuses_map_to_error_classes() {
        let kind = |code: u16| {
            classify_status(StatusCode::from_u16(code).unwrap(), "")
                .kind
        };
        assert_eq!(kind(401), RemoteErrorKind::PermissionDenied);
        assert_eq!(kind(403), RemoteErrorKind::PermissionDenied);
        assert_eq!(kind(404), RemoteErrorKind::NotFound);
        assert_eq!(kind(422), RemoteErrorKind::InvalidPayload);
        assert_eq!(kind(429), RemoteErrorKind::Throttled);
        assert_eq!(kind(503), RemoteErrorKind::Unavailable);
        assert_eq!(kind(418), RemoteErrorKind::Other);
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
    }

    #[test]
    fn api_error_prefers_json_message() {
        assert_eq!(
            parse_api_error(StatusCode::FORBIDDEN, r#"{"message":" survey is closed "}"#),
            "survey is closed (403)"
        );
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, "  "), "HTTP 502");
        assert_eq!(
            parse_api_error(StatusCode::BAD_REQUEST, "bad geometry"),
            "bad geometry (400)"
        );
    }

    #[test]
    fn failure_codes_keep_their_class() {
        assert!(error_from_code("THROTTLED", String::new()).is_transient());
        assert!(error_from_code("NOT_FOUND", String::new()).is_not_found());
        assert_eq!(
            error_from_code("PERMISSION_DENIED", "no".to_string()).kind,
            RemoteErrorKind::PermissionDenied
        );
        assert_eq!(error_from_code("???", String::new()).kind, RemoteErrorKind::Other);
    }

    #[test]
    fn media_paths_are_encoded_per_segment() {
        let store = HttpRemoteStore::new("https://api.example.com").unwrap();
        assert_eq!(
            store.media_url("/user media/a b.jpg", "/url"),
            "https://api.example.com/v1/media/user%20media/a%20b.jpg/url"
        );
        assert_eq!(
            store.survey_url(&SurveyId::from("s/1"), "/lois"),
            "https://api.example.com/v1/surveys/s%2F1/lois"
        );
    }
}
