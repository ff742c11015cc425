use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;

use crate::config::SmsProviderConfig;
use crate::db::models::Channel;
use crate::error::{AppError, AppResult};
use crate::services::dispatch::{ChannelAdapter, DispatchOutcome, DispatchRequest};

/// Single-segment SMS length; longer bodies are truncated with an ellipsis.
const SMS_SINGLE_SEGMENT: usize = 160;

/// SMS adapter speaking a Twilio-style form API with basic auth.
pub struct SmsAdapter {
    client: reqwest::Client,
    config: SmsProviderConfig,
}

impl SmsAdapter {
    pub fn new(config: SmsProviderConfig, timeout_seconds: u64) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(AppError::Request)?;
        Ok(Self { client, config })
    }
}

/// Bodies up to one segment pass unchanged; anything longer is cut to fit
/// with a trailing ellipsis.
pub fn truncate_sms_body(body: &str) -> String {
    let chars: Vec<char> = body.chars().collect();
    if chars.len() <= SMS_SINGLE_SEGMENT {
        return body.to_string();
    }
    let kept: String = chars[..SMS_SINGLE_SEGMENT - 3].iter().collect();
    format!("{}...", kept)
}

#[async_trait]
impl ChannelAdapter for SmsAdapter {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, request: &DispatchRequest) -> DispatchOutcome {
        let (sid, token) = match (&self.config.account_sid, &self.config.auth_token) {
            (Some(sid), Some(token)) => (sid, token),
            _ => {
                return DispatchOutcome::failed("sms provider credentials not configured", Some(401))
            }
        };

        let url = format!("{}/Accounts/{}/Messages.json", self.config.endpoint, sid);
        let auth = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", sid, token));
        let body = truncate_sms_body(&request.body);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Basic {}", auth))
            .header("Idempotency-Key", &request.notification_id)
            .form(&[
                ("From", self.config.from_number.as_str()),
                ("To", request.recipient.as_str()),
                ("Body", body.as_str()),
            ])
            .send()
            .await;

        match response {
            Ok(resp) => {
                let code = resp.status().as_u16();
                if resp.status().is_success() {
                    let provider_id = resp
                        .json::<serde_json::Value>()
                        .await
                        .ok()
                        .and_then(|v| v.get("sid").and_then(|s| s.as_str()).map(String::from));
                    DispatchOutcome::ok(provider_id, Some(code))
                } else {
                    let text = resp.text().await.unwrap_or_default();
                    DispatchOutcome::failed(
                        format!("sms provider error ({}): {}", code, text),
                        Some(code),
                    )
                }
            }
            Err(e) => DispatchOutcome::failed(format!("sms request failed: {}", e), None),
        }
    }

    fn validate_config(&self) -> AppResult<()> {
        if self.config.account_sid.is_none() || self.config.auth_token.is_none() {
            return Err(AppError::Config(
                "SMS_ACCOUNT_SID / SMS_AUTH_TOKEN are not set".to_string(),
            ));
        }
        if self.config.from_number.is_empty() {
            return Err(AppError::Config("SMS_FROM_NUMBER is empty".to_string()));
        }
        Ok(())
    }

    async fn poll_status(&self, provider_delivery_id: &str) -> AppResult<Option<String>> {
        let (sid, token) = match (&self.config.account_sid, &self.config.auth_token) {
            (Some(sid), Some(token)) => (sid, token),
            _ => return Ok(None),
        };

        let url = format!(
            "{}/Accounts/{}/Messages/{}.json",
            self.config.endpoint, sid, provider_delivery_id
        );
        let auth = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", sid, token));

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Basic {}", auth))
            .send()
            .await
            .map_err(AppError::Request)?;

        if !response.status().is_success() {
            return Ok(None);
        }
        let body: serde_json::Value = response.json().await.map_err(AppError::Request)?;
        Ok(body
            .get("status")
            .and_then(|s| s.as_str())
            .map(String::from))
    }
}
