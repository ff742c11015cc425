use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Classified causes of a failed dispatch. Drives the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NetworkError,
    ServiceUnavailable,
    RateLimited,
    Timeout,
    QuotaExceeded,
    AuthenticationFailed,
    RecipientBlocked,
    InvalidRecipient,
    ContentRejected,
    InvalidTemplate,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NetworkError => "network_error",
            FailureKind::ServiceUnavailable => "service_unavailable",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Timeout => "timeout",
            FailureKind::QuotaExceeded => "quota_exceeded",
            FailureKind::AuthenticationFailed => "authentication_failed",
            FailureKind::RecipientBlocked => "recipient_blocked",
            FailureKind::InvalidRecipient => "invalid_recipient",
            FailureKind::ContentRejected => "content_rejected",
            FailureKind::InvalidTemplate => "invalid_template",
            FailureKind::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "network_error" => Some(FailureKind::NetworkError),
            "service_unavailable" => Some(FailureKind::ServiceUnavailable),
            "rate_limited" => Some(FailureKind::RateLimited),
            "timeout" => Some(FailureKind::Timeout),
            "quota_exceeded" => Some(FailureKind::QuotaExceeded),
            "authentication_failed" => Some(FailureKind::AuthenticationFailed),
            "recipient_blocked" => Some(FailureKind::RecipientBlocked),
            "invalid_recipient" => Some(FailureKind::InvalidRecipient),
            "content_rejected" => Some(FailureKind::ContentRejected),
            "invalid_template" => Some(FailureKind::InvalidTemplate),
            "unknown" => Some(FailureKind::Unknown),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FailureKind::AuthenticationFailed
                | FailureKind::RecipientBlocked
                | FailureKind::InvalidRecipient
                | FailureKind::ContentRejected
                | FailureKind::InvalidTemplate
        )
    }
}

/// Classify a failure from its error message and/or provider response code.
///
/// Message heuristics run first so provider-specific phrasings win; the HTTP
/// status code is the fallback.
pub fn classify_failure(error_message: Option<&str>, response_code: Option<u16>) -> FailureKind {
    if error_message.is_none() && response_code.is_none() {
        return FailureKind::Unknown;
    }

    let msg = error_message.unwrap_or("").to_lowercase();

    if ["timeout", "timed out"].iter().any(|t| msg.contains(t)) {
        return FailureKind::Timeout;
    }
    if ["connection", "network", "refused"]
        .iter()
        .any(|t| msg.contains(t))
    {
        return FailureKind::NetworkError;
    }
    if ["auth", "unauthorized", "invalid key", "invalid token"]
        .iter()
        .any(|t| msg.contains(t))
    {
        return FailureKind::AuthenticationFailed;
    }
    if msg.contains("quota") || msg.contains("daily cap") {
        return FailureKind::QuotaExceeded;
    }
    if ["rate limit", "throttle", "too many requests"]
        .iter()
        .any(|t| msg.contains(t))
    {
        return FailureKind::RateLimited;
    }
    if ["invalid recipient", "not found", "does not exist", "bad address"]
        .iter()
        .any(|t| msg.contains(t))
    {
        return FailureKind::InvalidRecipient;
    }
    if ["spam", "blocked", "rejected", "policy"]
        .iter()
        .any(|t| msg.contains(t))
    {
        return FailureKind::ContentRejected;
    }

    match response_code {
        Some(401) => FailureKind::AuthenticationFailed,
        Some(403) => FailureKind::RecipientBlocked,
        Some(404) => FailureKind::InvalidRecipient,
        Some(429) => FailureKind::RateLimited,
        Some(code) if code >= 500 => FailureKind::ServiceUnavailable,
        _ => FailureKind::Unknown,
    }
}

/// The full delivery history of one notification on one channel.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: String,
    pub notification_id: String,
    pub user_id: String,
    pub channel: String,

    /// Resolved contact address (email, phone, device token, session id,
    /// webhook URL depending on channel).
    pub recipient_address: String,

    /// 'queued', 'sending', 'sent', 'delivered', 'read', 'failed'
    pub status: String,

    pub failure_kind: Option<String>,
    pub error_message: Option<String>,

    /// Identifier assigned by the provider; used to match status callbacks.
    pub provider_delivery_id: Option<String>,

    /// When set, the retry sweeper promotes the record back to the queue once
    /// due.
    pub next_retry_at: Option<NaiveDateTime>,

    pub delivered_at: Option<NaiveDateTime>,
    pub read_at: Option<NaiveDateTime>,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// One dispatch transaction against a provider. Immutable once appended.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: String,
    pub record_id: String,
    pub attempt_number: i32,
    pub status: String,
    pub error_message: Option<String>,
    pub response_code: Option<i32>,
    pub duration_ms: i64,
    pub created_at: NaiveDateTime,
}

/// Data appended atomically with the owning record update.
#[derive(Debug, Clone)]
pub struct CreateAttempt {
    pub status: String,
    pub error_message: Option<String>,
    pub response_code: Option<i32>,
    pub duration_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(FailureKind::NetworkError.is_retryable());
        assert!(FailureKind::ServiceUnavailable.is_retryable());
        assert!(FailureKind::RateLimited.is_retryable());
        assert!(FailureKind::Timeout.is_retryable());
        assert!(FailureKind::QuotaExceeded.is_retryable());
        assert!(FailureKind::Unknown.is_retryable());

        assert!(!FailureKind::AuthenticationFailed.is_retryable());
        assert!(!FailureKind::RecipientBlocked.is_retryable());
        assert!(!FailureKind::InvalidRecipient.is_retryable());
        assert!(!FailureKind::ContentRejected.is_retryable());
        assert!(!FailureKind::InvalidTemplate.is_retryable());
    }

    #[test]
    fn classify_from_message() {
        assert_eq!(
            classify_failure(Some("connection refused"), None),
            FailureKind::NetworkError
        );
        assert_eq!(
            classify_failure(Some("request timed out"), None),
            FailureKind::Timeout
        );
        assert_eq!(
            classify_failure(Some("daily quota exceeded"), None),
            FailureKind::QuotaExceeded
        );
        assert_eq!(
            classify_failure(Some("marked as spam"), None),
            FailureKind::ContentRejected
        );
    }

    #[test]
    fn classify_from_status_code() {
        assert_eq!(
            classify_failure(None, Some(401)),
            FailureKind::AuthenticationFailed
        );
        assert_eq!(
            classify_failure(None, Some(403)),
            FailureKind::RecipientBlocked
        );
        assert_eq!(
            classify_failure(None, Some(404)),
            FailureKind::InvalidRecipient
        );
        assert_eq!(classify_failure(None, Some(429)), FailureKind::RateLimited);
        assert_eq!(
            classify_failure(None, Some(500)),
            FailureKind::ServiceUnavailable
        );
        assert_eq!(
            classify_failure(None, Some(503)),
            FailureKind::ServiceUnavailable
        );
    }

    #[test]
    fn classify_unknown_when_nothing_matches() {
        assert_eq!(classify_failure(None, None), FailureKind::Unknown);
        assert_eq!(
            classify_failure(Some("weird provider hiccup"), Some(418)),
            FailureKind::Unknown
        );
    }

    #[test]
    fn message_heuristics_win_over_code() {
        // A 500 with a quota message is a quota problem, not a 5xx.
        assert_eq!(
            classify_failure(Some("quota exhausted"), Some(500)),
            FailureKind::QuotaExceeded
        );
    }
}
