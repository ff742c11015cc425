use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::db::models::{DeliveryAttempt, DeliveryRecord, Notification, NotificationStatus};
use crate::db::repository::{DeliveryRecordRepository, NotificationRepository, QueueRepository};
use crate::error::{AppError, AppResult};
use crate::services::intake::{self, IntakeRequest};
use crate::services::worker;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_notification))
        .route("/bulk", post(create_bulk))
        .route("/:id", get(get_notification))
        .route("/:id/cancel", post(cancel_notification))
        .route("/:id/retry", post(retry_notification))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct CreateNotificationResponse {
    pub notification_id: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct BulkItemResponse {
    pub notification_id: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RecordWithAttempts {
    #[serde(flatten)]
    pub record: DeliveryRecord,
    pub attempts: Vec<DeliveryAttempt>,
}

#[derive(Debug, Serialize)]
pub struct NotificationDetailResponse {
    #[serde(flatten)]
    pub notification: Notification,
    pub deliveries: Vec<RecordWithAttempts>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub notification_id: String,
    pub status: String,
    pub reason: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Admit one notification. 202 on success, 400/422 on validation failure.
async fn create_notification(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IntakeRequest>,
) -> AppResult<(StatusCode, Json<CreateNotificationResponse>)> {
    let notification = intake::admit(&state.db, &state.config, request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CreateNotificationResponse {
            notification_id: notification.id,
            status: notification.status,
        }),
    ))
}

/// Admit up to 100 notifications; each item succeeds or fails on its own.
async fn create_bulk(
    State(state): State<Arc<AppState>>,
    Json(requests): Json<Vec<IntakeRequest>>,
) -> AppResult<(StatusCode, Json<Vec<BulkItemResponse>>)> {
    let results = intake::admit_bulk(&state.db, &state.config, requests).await?;
    let items = results
        .into_iter()
        .map(|result| match result {
            Ok(n) => BulkItemResponse {
                notification_id: Some(n.id),
                status: n.status,
                error: None,
            },
            Err(e) => BulkItemResponse {
                notification_id: None,
                status: "rejected".to_string(),
                error: Some(e),
            },
        })
        .collect();
    Ok((StatusCode::ACCEPTED, Json(items)))
}

/// Full record plus every delivery attempt.
async fn get_notification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<NotificationDetailResponse>> {
    let notification = NotificationRepository::find_by_id(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Notification not found: {}", id)))?;

    let records = DeliveryRecordRepository::find_by_notification(&state.db, &id).await?;
    let mut deliveries = Vec::with_capacity(records.len());
    for record in records {
        let attempts = DeliveryRecordRepository::attempts(&state.db, &record.id).await?;
        deliveries.push(RecordWithAttempts { record, attempts });
    }

    Ok(Json(NotificationDetailResponse {
        notification,
        deliveries,
    }))
}

/// Cancel a notification that has not been handed to a provider yet.
/// 200 when cancelled, 409 otherwise.
async fn cancel_notification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<CancelResponse>> {
    let notification = NotificationRepository::find_by_id(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Notification not found: {}", id)))?;

    let cancelled = NotificationRepository::cas_status(
        &state.db,
        &id,
        &[NotificationStatus::Pending, NotificationStatus::Queued],
        NotificationStatus::Cancelled,
    )
    .await?;

    match cancelled {
        Some(_) => {
            NotificationRepository::set_status(
                &state.db,
                &id,
                NotificationStatus::Cancelled,
                Some("cancelled by request"),
            )
            .await?;
            QueueRepository::complete(&state.db, &id).await?;
            Ok(Json(CancelResponse {
                notification_id: id,
                status: "cancelled".to_string(),
                reason: Some("cancelled by request".to_string()),
            }))
        }
        None => Err(AppError::Conflict(format!(
            "notification is {} and cannot be cancelled",
            notification.status
        ))),
    }
}

/// Manual retry of a terminally failed notification. 200 if eligible, 409
/// otherwise.
async fn retry_notification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<CreateNotificationResponse>> {
    let notification = worker::manual_retry(&state, &id).await?;
    Ok(Json(CreateNotificationResponse {
        notification_id: notification.id,
        status: notification.status,
    }))
}
