//! Small helpers shared by config parsing, the HTTP store and the queue.

/// Longest excerpt of a remote error body kept in `last_error`.
pub const ERROR_EXCERPT_CHARS: usize = 180;

/// Trimmed value, or `None` when missing or blank.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Whether `value` is an absolute http(s) URL with something after the scheme.
pub fn is_http_url(value: &str) -> bool {
    value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"))
        .is_some_and(|rest| !rest.trim_matches('/').is_empty())
}

/// Single-line excerpt of at most `max_chars` characters.
pub fn excerpt(value: &str, max_chars: usize) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(max_chars)
        .collect()
}

/// Current Unix timestamp in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
