use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::db::models::Channel;
use crate::error::{AppError, AppResult};
use crate::services::dispatch::{ChannelAdapter, DispatchOutcome, DispatchRequest};

/// Webhook adapter: POSTs the rendered payload as JSON to the recipient URL.
/// Any non-2xx response is a retryable failure.
pub struct WebhookAdapter {
    client: reqwest::Client,
}

impl WebhookAdapter {
    pub fn new(timeout_seconds: u64) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(AppError::Request)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ChannelAdapter for WebhookAdapter {
    fn channel(&self) -> Channel {
        Channel::Webhook
    }

    async fn send(&self, request: &DispatchRequest) -> DispatchOutcome {
        let url = match url::Url::parse(&request.recipient) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => url,
            _ => {
                return DispatchOutcome::failed(
                    format!("invalid recipient webhook URL: {}", request.recipient),
                    Some(404),
                )
            }
        };

        let payload = json!({
            "notification_id": request.notification_id,
            "user_id": request.user_id,
            "subject": request.subject,
            "body": request.body,
        });

        let response = self
            .client
            .post(url)
            .header("Idempotency-Key", &request.notification_id)
            .json(&payload)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let code = resp.status().as_u16();
                if resp.status().is_success() {
                    DispatchOutcome::ok(Some(request.notification_id.clone()), Some(code))
                } else {
                    // Non-2xx: retryable per contract, regardless of code class.
                    DispatchOutcome::failed_with_kind(
                        format!("webhook endpoint returned {}", code),
                        Some(code),
                        crate::db::models::FailureKind::ServiceUnavailable,
                    )
                }
            }
            Err(e) => DispatchOutcome::failed(format!("webhook request failed: {}", e), None),
        }
    }

    fn validate_config(&self) -> AppResult<()> {
        Ok(())
    }
}
