use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::db::models::{
    Channel, Frequency, InboxEntry, Notification, NotificationType, UpdateUserPreference,
    UserPreference,
};
use crate::db::repository::{
    DeliveryRecordRepository, InboxRepository, NotificationRepository, PreferenceRepository,
};
use crate::error::{AppError, AppResult};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:user_id/notifications", get(list_notifications))
        .route(
            "/:user_id/preferences",
            get(get_preferences).put(put_preferences),
        )
        .route("/:user_id/inbox", get(list_inbox))
        .route("/:user_id/inbox/:entry_id/read", post(mark_inbox_read))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListNotificationsQuery {
    pub channel: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub page: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct NotificationsListResponse {
    pub items: Vec<Notification>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

#[derive(Debug, Deserialize)]
pub struct PreferenceUpdateItem {
    #[serde(rename = "type")]
    pub notification_type: String,
    pub channel: String,
    pub enabled: Option<bool>,
    pub frequency: Option<Frequency>,
    pub quiet_start: Option<String>,
    pub quiet_end: Option<String>,
    pub time_zone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PreferencesResponse {
    pub preferences: Vec<UserPreference>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Paginated notification history for one user, filterable by channel and
/// status.
async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<ListNotificationsQuery>,
) -> AppResult<Json<NotificationsListResponse>> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.limit.unwrap_or(20).clamp(1, 100);
    let offset = (page - 1) * per_page;

    let items = NotificationRepository::find_by_user(
        &state.db,
        &user_id,
        query.channel.as_deref(),
        query.status.as_deref(),
        per_page,
        offset,
    )
    .await?;

    let total = NotificationRepository::count_by_user(
        &state.db,
        &user_id,
        query.channel.as_deref(),
        query.status.as_deref(),
    )
    .await?;

    Ok(Json(NotificationsListResponse {
        items,
        total,
        page,
        per_page,
    }))
}

async fn get_preferences(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> AppResult<Json<PreferencesResponse>> {
    let preferences = PreferenceRepository::list_for_user(&state.db, &user_id).await?;
    Ok(Json(PreferencesResponse { preferences }))
}

/// Upsert one or more (type, channel) preference rows.
async fn put_preferences(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(updates): Json<Vec<PreferenceUpdateItem>>,
) -> AppResult<Json<PreferencesResponse>> {
    let mut written = Vec::with_capacity(updates.len());
    for item in updates {
        let ntype = NotificationType::parse(&item.notification_type).ok_or_else(|| {
            AppError::Validation(format!(
                "unrecognized notification type: {}",
                item.notification_type
            ))
        })?;
        let channel = Channel::parse(&item.channel)
            .ok_or_else(|| AppError::Validation(format!("unrecognized channel: {}", item.channel)))?;

        if let Some(tz) = &item.time_zone {
            if tz.parse::<chrono_tz::Tz>().is_err() {
                return Err(AppError::Validation(format!("unknown time zone: {}", tz)));
            }
        }
        for bound in [&item.quiet_start, &item.quiet_end] {
            if let Some(bound) = bound {
                if crate::db::models::preference::parse_hhmm(bound).is_none() {
                    return Err(AppError::Validation(format!(
                        "quiet hours must be HH:MM, got {}",
                        bound
                    )));
                }
            }
        }

        let updated = PreferenceRepository::upsert(
            &state.db,
            &user_id,
            ntype,
            channel,
            UpdateUserPreference {
                enabled: item.enabled,
                frequency: item.frequency,
                quiet_start: item.quiet_start,
                quiet_end: item.quiet_end,
                time_zone: item.time_zone,
            },
        )
        .await?;
        written.push(updated);
    }

    Ok(Json(PreferencesResponse {
        preferences: written,
    }))
}

#[derive(Debug, Deserialize)]
pub struct InboxQuery {
    pub limit: Option<i64>,
}

async fn list_inbox(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<InboxQuery>,
) -> AppResult<Json<Vec<InboxEntry>>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 100);
    let entries = InboxRepository::list_for_user(&state.db, &user_id, limit).await?;
    Ok(Json(entries))
}

/// In-app read receipt: marks the inbox entry and propagates the read event
/// onto the matching delivery record.
async fn mark_inbox_read(
    State(state): State<Arc<AppState>>,
    Path((user_id, entry_id)): Path<(String, String)>,
) -> AppResult<Json<serde_json::Value>> {
    let changed = InboxRepository::mark_read(&state.db, &entry_id).await?;

    if changed {
        // The inbox entry id is the in-app provider delivery id.
        if let Some(record) =
            DeliveryRecordRepository::find_by_provider_delivery_id(&state.db, &entry_id).await?
        {
            let now = chrono::Utc::now().naive_utc();
            if DeliveryRecordRepository::mark_read(&state.db, &record.id, now).await? {
                NotificationRepository::set_status(
                    &state.db,
                    &record.notification_id,
                    crate::db::models::NotificationStatus::Read,
                    None,
                )
                .await?;

                state.metrics.increment(
                    "notifications_read",
                    &[
                        ("channel", "in_app"),
                        ("bucket", &crate::services::metrics::user_bucket(&user_id)),
                    ],
                    1.0,
                );
                if let Some(delivered_at) = record.delivered_at {
                    let read_ms = (now - delivered_at).num_milliseconds().max(0) as f64;
                    state.metrics.histogram(
                        "engagement_score",
                        &[("channel", "in_app")],
                        crate::services::metrics::engagement_score(read_ms),
                    );
                }
            }
        }
    }

    Ok(Json(serde_json::json!({ "read": changed })))
}
