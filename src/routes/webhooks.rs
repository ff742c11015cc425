use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::db::models::{classify_failure, Channel, NotificationStatus};
use crate::db::repository::{DeliveryRecordRepository, NotificationRepository};
use crate::error::{AppError, AppResult};
use crate::services::metrics::{engagement_score, user_bucket};
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

const HEADER_MESSAGE_ID: &str = "x-provider-message-id";
const HEADER_TIMESTAMP: &str = "x-provider-timestamp";
const HEADER_SIGNATURE: &str = "x-provider-signature";

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/provider/:channel", post(handle_provider_callback))
}

/// Delivery-status callback payload. Idempotent by provider_delivery_id.
#[derive(Debug, Deserialize)]
pub struct ProviderCallback {
    pub provider_delivery_id: String,
    /// "delivered", "read" or "failed"
    pub event: String,
    pub error_message: Option<String>,
    pub response_code: Option<u16>,
}

fn extract_headers(headers: &HeaderMap) -> AppResult<(String, String, String)> {
    let take = |name: &str| -> AppResult<String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| AppError::BadRequest(format!("Missing header: {}", name)))
    };
    Ok((
        take(HEADER_MESSAGE_ID)?,
        take(HEADER_TIMESTAMP)?,
        take(HEADER_SIGNATURE)?,
    ))
}

/// Verify `sha256=<hex>` over message_id + timestamp + body with the shared
/// callback secret, and reject stale timestamps (10 minute window).
fn verify_signature(
    secret: &str,
    message_id: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
) -> AppResult<()> {
    if secret.is_empty() {
        return Err(AppError::Config(
            "PROVIDER_CALLBACK_SECRET is not configured".to_string(),
        ));
    }

    let mut message = Vec::new();
    message.extend_from_slice(message_id.as_bytes());
    message.extend_from_slice(timestamp.as_bytes());
    message.extend_from_slice(body);

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::Internal(anyhow::anyhow!("Failed to create HMAC")))?;
    mac.update(&message);

    let expected_sig = if let Some(hex_sig) = signature.strip_prefix("sha256=") {
        hex::decode(hex_sig)
            .map_err(|_| AppError::BadRequest("Invalid signature format".to_string()))?
    } else {
        return Err(AppError::BadRequest("Invalid signature format".to_string()));
    };

    mac.verify_slice(&expected_sig)
        .map_err(|_| AppError::Unauthorized)?;

    if let Ok(msg_time) = chrono::DateTime::parse_from_rfc3339(timestamp) {
        let age = chrono::Utc::now().signed_duration_since(msg_time.with_timezone(&chrono::Utc));
        if age > chrono::Duration::minutes(10) {
            return Err(AppError::BadRequest("Timestamp too old".to_string()));
        }
    }

    Ok(())
}

async fn handle_provider_callback(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, String), AppError> {
    let channel = Channel::parse(&channel)
        .ok_or_else(|| AppError::BadRequest(format!("unrecognized channel: {}", channel)))?;

    let (message_id, timestamp, signature) = extract_headers(&headers)?;
    verify_signature(
        &state.config.providers.callback_secret,
        &message_id,
        &timestamp,
        &body,
        &signature,
    )?;

    let payload: ProviderCallback = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid payload: {}", e)))?;

    tracing::info!(
        channel = %channel.as_str(),
        provider_delivery_id = %payload.provider_delivery_id,
        event = %payload.event,
        "Provider status callback"
    );

    let record = DeliveryRecordRepository::find_by_provider_delivery_id(
        &state.db,
        &payload.provider_delivery_id,
    )
    .await?
    .ok_or_else(|| {
        AppError::NotFound(format!(
            "No delivery record for provider id {}",
            payload.provider_delivery_id
        ))
    })?;

    let now = chrono::Utc::now().naive_utc();
    match payload.event.as_str() {
        "delivered" => {
            if DeliveryRecordRepository::mark_delivered(&state.db, &record.id, now).await? {
                NotificationRepository::set_status(
                    &state.db,
                    &record.notification_id,
                    NotificationStatus::Delivered,
                    None,
                )
                .await?;
                state.metrics.increment(
                    "notifications_delivered",
                    &[
                        ("channel", channel.as_str()),
                        ("bucket", &user_bucket(&record.user_id)),
                    ],
                    1.0,
                );
            }
        }
        "read" => {
            // An out-of-order read implies delivery happened.
            DeliveryRecordRepository::mark_delivered(&state.db, &record.id, now).await?;
            if DeliveryRecordRepository::mark_read(&state.db, &record.id, now).await? {
                NotificationRepository::set_status(
                    &state.db,
                    &record.notification_id,
                    NotificationStatus::Read,
                    None,
                )
                .await?;
                state.metrics.increment(
                    "notifications_read",
                    &[
                        ("channel", channel.as_str()),
                        ("bucket", &user_bucket(&record.user_id)),
                    ],
                    1.0,
                );
                if let Some(delivered_at) = record.delivered_at {
                    let read_ms = (now - delivered_at).num_milliseconds().max(0) as f64;
                    state.metrics.histogram(
                        "engagement_score",
                        &[("channel", channel.as_str())],
                        engagement_score(read_ms),
                    );
                }
            }
        }
        "failed" => {
            // Asynchronous provider rejection after our ack: bounces and
            // policy rejections are terminal for this notification.
            let kind = classify_failure(
                payload.error_message.as_deref(),
                payload.response_code,
            );
            DeliveryRecordRepository::set_status(&state.db, &record.id, "failed").await?;
            NotificationRepository::set_status(
                &state.db,
                &record.notification_id,
                NotificationStatus::FailedFinal,
                Some(&format!(
                    "{}: {}",
                    kind.as_str(),
                    payload.error_message.as_deref().unwrap_or("provider callback")
                )),
            )
            .await?;
            state.metrics.increment(
                "notifications_failed",
                &[("channel", channel.as_str())],
                1.0,
            );
        }
        other => {
            return Err(AppError::BadRequest(format!(
                "unrecognized callback event: {}",
                other
            )))
        }
    }

    Ok((StatusCode::OK, "OK".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, message_id: &str, timestamp: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(message_id.as_bytes());
        mac.update(timestamp.as_bytes());
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_passes() {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let body = br#"{"event":"delivered"}"#;
        let sig = sign("secret", "m1", &timestamp, body);
        assert!(verify_signature("secret", "m1", &timestamp, body, &sig).is_ok());
    }

    #[test]
    fn tampered_body_fails() {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let sig = sign("secret", "m1", &timestamp, b"original");
        assert!(matches!(
            verify_signature("secret", "m1", &timestamp, b"tampered", &sig),
            Err(AppError::Unauthorized)
        ));
    }

    #[test]
    fn missing_prefix_rejected() {
        let timestamp = chrono::Utc::now().to_rfc3339();
        assert!(matches!(
            verify_signature("secret", "m1", &timestamp, b"x", "deadbeef"),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn stale_timestamp_rejected() {
        let timestamp = (chrono::Utc::now() - chrono::Duration::minutes(11)).to_rfc3339();
        let body = b"x";
        let sig = sign("secret", "m1", &timestamp, body);
        assert!(matches!(
            verify_signature("secret", "m1", &timestamp, body, &sig),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn unconfigured_secret_is_config_error() {
        let timestamp = chrono::Utc::now().to_rfc3339();
        assert!(matches!(
            verify_signature("", "m1", &timestamp, b"x", "sha256=00"),
            Err(AppError::Config(_))
        ));
    }
}
