//! Sync engine configuration.
//!
//! `SyncConfig` is read from an optional JSON file and then overridden from
//! `FIELDSYNC_*` environment variables. Every field has a default so an
//! empty object is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::{is_http_url, non_blank};

pub const ENV_API_BASE_URL: &str = "FIELDSYNC_API_BASE_URL";
pub const ENV_USER_ID: &str = "FIELDSYNC_USER_ID";
pub const ENV_SYNC_INTERVAL_SECS: &str = "FIELDSYNC_SYNC_INTERVAL_SECS";

/// Tunables for the queue, orchestrator and background worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct SyncConfig {
    /// Periodic sync trigger; `None` or 0 disables it
    pub sync_interval_secs: Option<u64>,
    /// Attempts before a transient failure becomes permanent
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    /// How long COMPLETED queue rows are kept for diagnostics
    pub completed_retention_hours: u64,
    pub api_base_url: Option<String>,
    pub user_id: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: Some(60),
            max_attempts: 5,
            backoff_initial_ms: 2_000,
            backoff_max_ms: 300_000,
            backoff_multiplier: 2.0,
            completed_retention_hours: 24,
            api_base_url: None,
            user_id: None,
        }
    }
}

impl SyncConfig {
    /// Apply `FIELDSYNC_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, String> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup, then validate.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, String> {
        if let Some(url) = non_blank(lookup(ENV_API_BASE_URL)) {
            self.api_base_url = Some(url);
        }
        if let Some(user_id) = non_blank(lookup(ENV_USER_ID)) {
            self.user_id = Some(user_id);
        }
        if let Some(interval) = non_blank(lookup(ENV_SYNC_INTERVAL_SECS)) {
            let secs = interval
                .parse::<u64>()
                .map_err(|error| {
                    format!("invalid {ENV_SYNC_INTERVAL_SECS} '{interval}': {error}")
                })?;
            self.sync_interval_secs = Some(secs);
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings the retry policy or HTTP client cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be at least 1.0".to_string());
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err("backoff_initial_ms must not exceed backoff_max_ms".to_string());
        }
        if let Some(url) = &self.api_base_url {
            if !is_http_url(url) {
                return Err("api_base_url must include http:// or https://".to_string());
            }
        }
        Ok(())
    }

    /// Periodic trigger interval, if enabled.
    #[must_use]
    pub fn sync_interval(&self) -> Option<Duration> {
        self.sync_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Retention window for COMPLETED queue rows.
    #[must_use]
    pub const fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_hours.saturating_mul(3_600))
    }

    /// Base URL without a trailing slash.
    #[must_use]
    pub fn api_base_url(&self) -> Option<String> {
        non_blank(self.api_base_url.clone())
            .map(|url| url.trim_end_matches('/').to_string())
    }
}

/// Parse and validate a JSON configuration payload.
pub fn parse_sync_config(payload: &str) -> Result<SyncConfig, String> {
    let config: SyncConfig = serde_json::from_str(payload)
        .map_err(|error| format!("invalid sync config JSON: {error}"))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_object_yields_defaults() {
        let config = parse_sync_config("{}").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.sync_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.completed_retention(), Duration::from_secs(86_400));
    }

    #[test]
    fn parse_rejects_unknown_fields() {
        let error = parse_sync_config(r#"{ "max_attempts": 3, "turbo": true }"#).unwrap_err();
        assert!(error.contains("unknown field"));
    }

    #[test]
    fn validation_rejects_bad_backoff() {
        assert!(parse_sync_config(r#"{ "max_attempts": 0 }"#).is_err());
        assert!(parse_sync_config(r#"{ "backoff_multiplier": 0.5 }"#).is_err());
        assert!(
            parse_sync_config(r#"{ "backoff_initial_ms": 10, "backoff_max_ms": 5 }"#).is_err()
        );
        assert!(parse_sync_config(r#"{ "api_base_url": "api.example.com" }"#).is_err());
    }

    #[test]
    fn zero_interval_disables_periodic_sync() {
        let config = parse_sync_config(r#"{ "sync_interval_secs": 0 }"#).unwrap();
        assert_eq!(config.sync_interval(), None);
    }

    #[test]
    fn env_overrides_take_precedence() {
        let config = SyncConfig::default()
            .with_overrides(|key| match key {
                ENV_API_BASE_URL => Some(" https://api.example.com/ ".to_string()),
                ENV_USER_ID => Some("u-7".to_string()),
                ENV_SYNC_INTERVAL_SECS => Some("15".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.api_base_url().as_deref(), Some("https://api.example.com"));
        assert_eq!(config.user_id.as_deref(), Some("u-7"));
        assert_eq!(config.sync_interval(), Some(Duration::from_secs(15)));
    }

    #[test]
    fn env_override_rejects_non_numeric_interval() {
        let error = SyncConfig::default()
            .with_overrides(|key| (key == ENV_SYNC_INTERVAL_SECS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(error.contains(ENV_SYNC_INTERVAL_SECS));
    }
}
