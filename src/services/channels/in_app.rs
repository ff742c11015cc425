use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::broadcast;

use crate::db::models::Channel;
use crate::db::repository::InboxRepository;
use crate::error::AppResult;
use crate::services::dispatch::{ChannelAdapter, DispatchOutcome, DispatchRequest};

/// Event published on a user's live channel when an inbox entry lands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxEvent {
    pub event: String,
    pub entry_id: String,
    pub title: Option<String>,
    pub body: String,
}

/// Per-user live channels. A user without an open session simply has no
/// subscribers; publishing is then a no-op.
pub struct InAppBus {
    channels: Mutex<HashMap<String, broadcast::Sender<InboxEvent>>>,
}

impl InAppBus {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<InboxEvent> {
        let mut channels = self.channels.lock().expect("in-app bus poisoned");
        channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe()
    }

    pub fn publish(&self, user_id: &str, event: InboxEvent) {
        let channels = self.channels.lock().expect("in-app bus poisoned");
        if let Some(sender) = channels.get(user_id) {
            // Receivers may have gone away; that is fine.
            let _ = sender.send(event);
        }
    }
}

impl Default for InAppBus {
    fn default() -> Self {
        Self::new()
    }
}

/// In-app adapter: writes the rendered payload to the user's inbox (capped,
/// TTL'd) and publishes a `new_notification` event on their live channel.
/// The only failure mode is storage; there is no external provider.
pub struct InAppAdapter {
    pool: SqlitePool,
    bus: std::sync::Arc<InAppBus>,
}

impl InAppAdapter {
    pub fn new(pool: SqlitePool, bus: std::sync::Arc<InAppBus>) -> Self {
        Self { pool, bus }
    }
}

#[async_trait]
impl ChannelAdapter for InAppAdapter {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    async fn send(&self, request: &DispatchRequest) -> DispatchOutcome {
        match InboxRepository::push(
            &self.pool,
            &request.user_id,
            request.subject.as_deref(),
            &request.body,
        )
        .await
        {
            Ok(entry) => {
                self.bus.publish(
                    &request.user_id,
                    InboxEvent {
                        event: "new_notification".to_string(),
                        entry_id: entry.id.clone(),
                        title: entry.title.clone(),
                        body: entry.body.clone(),
                    },
                );
                DispatchOutcome::ok(Some(entry.id), None)
            }
            Err(e) => DispatchOutcome::failed(format!("inbox write failed: {}", e), None),
        }
    }

    fn validate_config(&self) -> AppResult<()> {
        Ok(())
    }
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

    fn request(user: &str) -> DispatchRequest {
        DispatchRequest {
            notification_id: "n1".to_string(),
            user_id: user.to_string(),
            channel: Channel::InApp,
            recipient: user.to_string(),
            subject: Some("Hi".to_string()),
            body: "there".to_string(),
        }
    }

    #[tokio::test]
    async fn send_stores_and_publishes() {
        let pool = test_pool().await;
        let bus = std::sync::Arc::new(InAppBus::new());
        let mut rx = bus.subscribe("u1");

        let adapter = InAppAdapter::new(pool.clone(), bus);
        let outcome = adapter.send(&request("u1")).await;
        assert!(outcome.success);
        assert!(outcome.provider_delivery_id.is_some());

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event, "new_notification");
        assert_eq!(event.body, "there");

        let entries = InboxRepository::list_for_user(&pool, "u1", 10).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn send_without_subscriber_still_succeeds() {
        let pool = test_pool().await;
        let adapter = InAppAdapter::new(pool, std::sync::Arc::new(InAppBus::new()));
        let outcome = adapter.send(&request("u2")).await;
        assert!(outcome.success);
    }
}
