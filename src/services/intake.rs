//! Admission: validates incoming requests, creates the notification record
//! and either enqueues it or parks it in the scheduled set.

use chrono::{NaiveDateTime, Utc};
use serde::Deserialize;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db::models::{
    Channel, CreateNotification, Notification, NotificationStatus, NotificationType, Priority,
};
use crate::db::repository::{NotificationRepository, QueueRepository, TemplateRepository};
use crate::error::{AppError, AppResult};

/// Channel-specific content bounds (characters).
const EMAIL_SUBJECT_MAX: usize = 200;
const EMAIL_BODY_MAX: usize = 50_000;
const SMS_BODY_MAX: usize = 1_600;
const PUSH_TITLE_MAX: usize = 50;
const PUSH_BODY_MAX: usize = 200;
const IN_APP_TITLE_MAX: usize = 100;
const IN_APP_BODY_MAX: usize = 1_000;

pub const BULK_MAX: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct IntakeRequest {
    pub user_id: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub channel: String,
    pub content: Option<String>,
    pub template_id: Option<String>,
    pub variables: Option<serde_json::Value>,
    pub subject: Option<String>,
    pub priority: Option<String>,
    pub scheduled_at: Option<NaiveDateTime>,
    pub max_retries: Option<i32>,
}

/// Validate and admit one request. Returns the created notification, already
/// queued (or scheduled).
pub async fn admit(
    pool: &SqlitePool,
    config: &Config,
    request: IntakeRequest,
) -> AppResult<Notification> {
    let (ntype, channel, priority) = validate(pool, &request).await?;

    let max_retries = request
        .max_retries
        .unwrap_or_else(|| config.channels.settings(channel).max_retries);
    if max_retries < 0 {
        return Err(AppError::Validation("max_retries must be >= 0".to_string()));
    }

    let notification = NotificationRepository::create(
        pool,
        CreateNotification {
            user_id: request.user_id,
            notification_type: ntype,
            channel,
            priority,
            subject: request.subject,
            content: request.content,
            template_name: request.template_id,
            variables: request.variables.unwrap_or_else(|| serde_json::json!({})),
            scheduled_at: request.scheduled_at,
            max_retries,
            is_digest: false,
        },
    )
    .await?;

    // Scheduled notifications stay out of the queue until the sweeper
    // promotes them.
    if notification.status() == Some(NotificationStatus::Queued) {
        QueueRepository::enqueue(
            pool,
            &notification.id,
            priority.rank(),
            Utc::now().naive_utc(),
        )
        .await?;
    }

    tracing::info!(
        notification_id = %notification.id,
        channel = %notification.channel,
        priority = %priority.as_str(),
        "Notification admitted"
    );

    Ok(notification)
}

/// Admit up to [`BULK_MAX`] requests; each item succeeds or fails on its own.
pub async fn admit_bulk(
    pool: &SqlitePool,
    config: &Config,
    requests: Vec<IntakeRequest>,
) -> AppResult<Vec<Result<Notification, String>>> {
    if requests.len() > BULK_MAX {
        return Err(AppError::Validation(format!(
            "at most {} notifications per bulk request",
            BULK_MAX
        )));
    }

    let mut results = Vec::with_capacity(requests.len());
    for request in requests {
        match admit(pool, config, request).await {
            Ok(n) => results.push(Ok(n)),
            Err(e) => results.push(Err(e.to_string())),
        }
    }
    Ok(results)
}

async fn validate(
    pool: &SqlitePool,
    request: &IntakeRequest,
) -> AppResult<(NotificationType, Channel, Priority)> {
    if request.user_id.trim().is_empty() {
        return Err(AppError::Validation("user_id must not be empty".to_string()));
    }

    let ntype = NotificationType::parse(&request.notification_type).ok_or_else(|| {
        AppError::Validation(format!(
            "unrecognized notification type: {}",
            request.notification_type
        ))
    })?;

    let channel = Channel::parse(&request.channel)
        .ok_or_else(|| AppError::Validation(format!("unrecognized channel: {}", request.channel)))?;

    let priority = match &request.priority {
        Some(p) => Priority::parse(p)
            .ok_or_else(|| AppError::Validation(format!("unrecognized priority: {}", p)))?,
        None => Priority::Normal,
    };

    // Exactly one content source.
    match (&request.content, &request.template_id) {
        (Some(_), Some(_)) => {
            return Err(AppError::Validation(
                "provide either content or template_id, not both".to_string(),
            ))
        }
        (None, None) => {
            return Err(AppError::Validation(
                "one of content or template_id is required".to_string(),
            ))
        }
        (None, Some(template)) => {
            if TemplateRepository::find_by_name(pool, template).await?.is_none() {
                return Err(AppError::Validation(format!(
                    "unknown template: {}",
                    template
                )));
            }
        }
        (Some(content), None) => check_bounds(channel, request.subject.as_deref(), content)?,
    }

    Ok((ntype, channel, priority))
}

fn check_bounds(channel: Channel, subject: Option<&str>, body: &str) -> AppResult<()> {
    let (subject_max, body_max) = match channel {
        Channel::Email => (EMAIL_SUBJECT_MAX, EMAIL_BODY_MAX),
        Channel::Sms => (usize::MAX, SMS_BODY_MAX),
        Channel::Push => (PUSH_TITLE_MAX, PUSH_BODY_MAX),
        Channel::InApp => (IN_APP_TITLE_MAX, IN_APP_BODY_MAX),
        Channel::Webhook => (usize::MAX, usize::MAX),
    };

    if let Some(subject) = subject {
        if subject.chars().count() > subject_max {
            return Err(AppError::Validation(format!(
                "subject exceeds {} characters for {}",
                subject_max,
                channel.as_str()
            )));
        }
    }
    if body.chars().count() > body_max {
        return Err(AppError::Validation(format!(
            "body exceeds {} characters for {}",
            body_max,
            channel.as_str()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn request() -> IntakeRequest {
        IntakeRequest {
            user_id: "u1".to_string(),
            notification_type: "message".to_string(),
            channel: "email".to_string(),
            content: Some("hello".to_string()),
            template_id: None,
            variables: None,
            subject: Some("subject".to_string()),
            priority: None,
            scheduled_at: None,
            max_retries: None,
        }
    }

    #[tokio::test]
    async fn admit_creates_and_enqueues() {
        let pool = test_pool().await;
        let config = Config::default();
        let n = admit(&pool, &config, request()).await.unwrap();
        assert_eq!(n.status, "queued");
        assert_eq!(n.priority, Priority::Normal.rank());
        assert_eq!(n.max_retries, 3);

        // The queue row exists and is claimable.
        let entry = QueueRepository::claim_next(&pool, 30).await.unwrap().unwrap();
        assert_eq!(entry.notification_id, n.id);
    }

    #[tokio::test]
    async fn admit_scheduled_stays_out_of_queue() {
        let pool = test_pool().await;
        let config = Config::default();
        let mut req = request();
        req.scheduled_at = Some(Utc::now().naive_utc() + chrono::Duration::hours(2));
        let n = admit(&pool, &config, req).await.unwrap();
        assert_eq!(n.status, "pending");
        assert!(QueueRepository::claim_next(&pool, 30).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_empty_user() {
        let pool = test_pool().await;
        let mut req = request();
        req.user_id = "  ".to_string();
        let err = admit(&pool, &Config::default(), req).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn rejects_unknown_enums() {
        let pool = test_pool().await;
        let config = Config::default();

        let mut req = request();
        req.notification_type = "carrier_pigeon".to_string();
        assert!(admit(&pool, &config, req).await.is_err());

        let mut req = request();
        req.channel = "fax".to_string();
        assert!(admit(&pool, &config, req).await.is_err());

        let mut req = request();
        req.priority = Some("mega".to_string());
        assert!(admit(&pool, &config, req).await.is_err());
    }

    #[tokio::test]
    async fn rejects_both_or_neither_content_source() {
        let pool = test_pool().await;
        let config = Config::default();

        let mut req = request();
        req.template_id = Some("welcome_email".to_string());
        assert!(admit(&pool, &config, req).await.is_err());

        let mut req = request();
        req.content = None;
        assert!(admit(&pool, &config, req).await.is_err());
    }

    #[tokio::test]
    async fn rejects_unknown_template() {
        let pool = test_pool().await;
        let mut req = request();
        req.content = None;
        req.template_id = Some("no_such_template".to_string());
        assert!(admit(&pool, &Config::default(), req).await.is_err());
    }

    #[tokio::test]
    async fn accepts_seeded_template() {
        let pool = test_pool().await;
        let mut req = request();
        req.content = None;
        req.subject = None;
        req.template_id = Some("welcome_email".to_string());
        req.variables = Some(serde_json::json!({"name": "Ali", "joined_at": "2025-06-01"}));
        assert!(admit(&pool, &Config::default(), req).await.is_ok());
    }

    #[tokio::test]
    async fn enforces_channel_bounds() {
        let pool = test_pool().await;
        let config = Config::default();

        // Email subject over 200.
        let mut req = request();
        req.subject = Some("s".repeat(201));
        assert!(admit(&pool, &config, req).await.is_err());

        // SMS body over the concatenated cap.
        let mut req = request();
        req.channel = "sms".to_string();
        req.subject = None;
        req.content = Some("x".repeat(1601));
        assert!(admit(&pool, &config, req).await.is_err());

        // SMS body at the cap is accepted (truncation is the adapter's job).
        let mut req = request();
        req.channel = "sms".to_string();
        req.subject = None;
        req.content = Some("x".repeat(1600));
        assert!(admit(&pool, &config, req).await.is_ok());

        // Push title over 50.
        let mut req = request();
        req.channel = "push".to_string();
        req.subject = Some("t".repeat(51));
        req.content = Some("ok".to_string());
        assert!(admit(&pool, &config, req).await.is_err());

        // In-app body over 1000.
        let mut req = request();
        req.channel = "in_app".to_string();
        req.subject = None;
        req.content = Some("b".repeat(1001));
        assert!(admit(&pool, &config, req).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_noop() {
        let pool = test_pool().await;
        let config = Config::default();
        let n = admit(&pool, &config, request()).await.unwrap();
        // Simulate an at-least-once producer re-enqueueing the same id.
        let inserted =
            QueueRepository::enqueue(&pool, &n.id, n.priority, Utc::now().naive_utc())
                .await
                .unwrap();
        assert!(!inserted);
    }

    #[tokio::test]
    async fn bulk_reports_per_item_results() {
        let pool = test_pool().await;
        let config = Config::default();
        let mut bad = request();
        bad.channel = "fax".to_string();
        let results = admit_bulk(&pool, &config, vec![request(), bad]).await.unwrap();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
