use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::config::PushProviderConfig;
use crate::db::models::Channel;
use crate::error::{AppError, AppResult};
use crate::services::dispatch::{ChannelAdapter, DispatchOutcome, DispatchRequest};

/// Push adapter speaking an FCM-style JSON API. The recipient address is the
/// device token from the user directory.
pub struct PushAdapter {
    client: reqwest::Client,
    config: PushProviderConfig,
}

impl PushAdapter {
    pub fn new(config: PushProviderConfig, timeout_seconds: u64) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(AppError::Request)?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ChannelAdapter for PushAdapter {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(&self, request: &DispatchRequest) -> DispatchOutcome {
        let server_key = match &self.config.server_key {
            Some(key) => key,
            None => {
                return DispatchOutcome::failed("push provider server key not configured", Some(401))
            }
        };

        let payload = json!({
            "to": request.recipient,
            "notification": {
                "title": request.subject.as_deref().unwrap_or(""),
                "body": request.body,
            },
            "data": {
                "notification_id": request.notification_id,
            }
        });

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Authorization", format!("key={}", server_key))
            .json(&payload)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let code = resp.status().as_u16();
                if resp.status().is_success() {
                    let body: Option<serde_json::Value> = resp.json().await.ok();
                    // FCM reports per-token failures inside a 200 response.
                    if let Some(failure) = body
                        .as_ref()
                        .and_then(|b| b.get("failure"))
                        .and_then(|f| f.as_i64())
                        .filter(|f| *f > 0)
                    {
                        let error = body
                            .as_ref()
                            .and_then(|b| b.pointer("/results/0/error"))
                            .and_then(|e| e.as_str())
                            .unwrap_or("unknown push failure");
                        return DispatchOutcome::failed(
                            format!("push provider reported {} failure(s): {}", failure, error),
                            Some(code),
                        );
                    }
                    let provider_id = body
                        .as_ref()
                        .and_then(|b| b.get("multicast_id"))
                        .map(|id| id.to_string());
                    DispatchOutcome::ok(provider_id, Some(code))
                } else {
                    let text = resp.text().await.unwrap_or_default();
                    DispatchOutcome::failed(
                        format!("push provider error ({}): {}", code, text),
                        Some(code),
                    )
                }
            }
            Err(e) => DispatchOutcome::failed(format!("push request failed: {}", e), None),
        }
    }

    fn validate_config(&self) -> AppResult<()> {
        if self.config.server_key.is_none() {
            return Err(AppError::Config("PUSH_SERVER_KEY is not set".to_string()));
        }
        Ok(())
    }
}
