//! Client for the external user directory, which maps (user, channel) to a
//! contact address: email address, phone number, device token, session id or
//! webhook URL.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::DirectoryConfig;
use crate::db::models::Channel;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Deserialize)]
pub struct RecipientInfo {
    pub address: String,
    /// Preferred language, used to pick the render locale.
    pub language: Option<String>,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// None means the user has no address for this channel.
    async fn resolve(&self, user_id: &str, channel: Channel) -> AppResult<Option<RecipientInfo>>;
}

/// HTTP implementation against the platform's user service.
pub struct HttpUserDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUserDirectory {
    pub fn new(config: &DirectoryConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(AppError::Request)?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    async fn resolve(&self, user_id: &str, channel: Channel) -> AppResult<Option<RecipientInfo>> {
        let url = format!(
            "{}/users/{}/contacts?channel={}",
            self.base_url,
            user_id,
            channel.as_str()
        );

        let response = self.client.get(&url).send().await.map_err(AppError::Request)?;

        match response.status().as_u16() {
            404 => Ok(None),
            code if code >= 400 => Err(AppError::ServiceUnavailable(format!(
                "user directory returned {}",
                code
            ))),
            _ => {
                let info: RecipientInfo = response.json().await.map_err(AppError::Request)?;
                if info.address.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(info))
                }
            }
        }
    }
}

/// In-memory directory for tests and the worker CLI's dry runs.
#[derive(Default)]
pub struct StaticDirectory {
    entries: HashMap<(String, Channel), RecipientInfo>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contact(
        mut self,
        user_id: &str,
        channel: Channel,
        address: &str,
        language: Option<&str>,
    ) -> Self {
        self.entries.insert(
            (user_id.to_string(), channel),
            RecipientInfo {
                address: address.to_string(),
                language: language.map(|s| s.to_string()),
            },
        );
        self
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn resolve(&self, user_id: &str, channel: Channel) -> AppResult<Option<RecipientInfo>> {
        Ok(self.entries.get(&(user_id.to_string(), channel)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_directory_resolves_registered_contacts() {
        let dir = StaticDirectory::new().with_contact("u1", Channel::Email, "a@b.c", Some("ar"));
        let info = dir.resolve("u1", Channel::Email).await.unwrap().unwrap();
        assert_eq!(info.address, "a@b.c");
        assert_eq!(info.language.as_deref(), Some("ar"));

        assert!(dir.resolve("u1", Channel::Sms).await.unwrap().is_none());
        assert!(dir.resolve("u2", Channel::Email).await.unwrap().is_none());
    }
}
