use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::config::EmailProviderConfig;
use crate::db::models::Channel;
use crate::error::{AppError, AppResult};
use crate::services::dispatch::{ChannelAdapter, DispatchOutcome, DispatchRequest};

/// Email adapter speaking a SendGrid-style JSON mail API.
pub struct EmailAdapter {
    client: reqwest::Client,
    config: EmailProviderConfig,
}

impl EmailAdapter {
    pub fn new(config: EmailProviderConfig, timeout_seconds: u64) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(AppError::Request)?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, request: &DispatchRequest) -> DispatchOutcome {
        let api_key = match &self.config.api_key {
            Some(key) => key,
            None => {
                return DispatchOutcome::failed("email provider api key not configured", Some(401))
            }
        };

        let payload = json!({
            "personalizations": [{
                "to": [{"email": request.recipient}],
                "custom_args": {"idempotency_key": request.notification_id}
            }],
            "from": {"email": self.config.from_address},
            "subject": request.subject.as_deref().unwrap_or(""),
            "content": [{"type": "text/html", "value": request.body}]
        });

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let code = resp.status().as_u16();
                if resp.status().is_success() {
                    let provider_id = resp
                        .headers()
                        .get("x-message-id")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string());
                    DispatchOutcome::ok(provider_id, Some(code))
                } else {
                    let body = resp.text().await.unwrap_or_default();
                    DispatchOutcome::failed(
                        format!("email provider error ({}): {}", code, body),
                        Some(code),
                    )
                }
            }
            Err(e) => DispatchOutcome::failed(format!("email request failed: {}", e), None),
        }
    }

    fn validate_config(&self) -> AppResult<()> {
        if self.config.api_key.is_none() {
            return Err(AppError::Config("EMAIL_API_KEY is not set".to_string()));
        }
        if self.config.from_address.is_empty() {
            return Err(AppError::Config("EMAIL_FROM_ADDRESS is empty".to_string()));
        }
        Ok(())
    }
}
