//! Channel adapter contract and registry.
//!
//! The engine depends only on this contract; concrete providers plug in
//! behind it. Adapters receive the notification id as an idempotency key so
//! an at-least-once engine never produces duplicate provider submissions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::db::models::{classify_failure, Channel, FailureKind};
use crate::error::AppResult;

/// Everything an adapter needs for one dispatch.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Notification id, passed to providers as the idempotency key.
    pub notification_id: String,
    pub user_id: String,
    pub channel: Channel,
    /// Resolved contact address for this channel.
    pub recipient: String,
    pub subject: Option<String>,
    pub body: String,
}

/// Outcome of one dispatch transaction.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub success: bool,
    pub provider_response: serde_json::Value,
    pub error_message: Option<String>,
    pub provider_delivery_id: Option<String>,
    pub response_code: Option<u16>,
    pub failure_kind: Option<FailureKind>,
}

impl DispatchOutcome {
    pub fn ok(provider_delivery_id: Option<String>, response_code: Option<u16>) -> Self {
        Self {
            success: true,
            provider_response: serde_json::Value::Null,
            error_message: None,
            provider_delivery_id,
            response_code,
            failure_kind: None,
        }
    }

    /// A failure classified from its message and response code.
    pub fn failed(error_message: impl Into<String>, response_code: Option<u16>) -> Self {
        let message = error_message.into();
        let kind = classify_failure(Some(&message), response_code);
        Self {
            success: false,
            provider_response: serde_json::Value::Null,
            error_message: Some(message),
            provider_delivery_id: None,
            response_code,
            failure_kind: Some(kind),
        }
    }

    /// A failure with an explicit classification.
    pub fn failed_with_kind(
        error_message: impl Into<String>,
        response_code: Option<u16>,
        kind: FailureKind,
    ) -> Self {
        Self {
            success: false,
            provider_response: serde_json::Value::Null,
            error_message: Some(error_message.into()),
            provider_delivery_id: None,
            response_code,
            failure_kind: Some(kind),
        }
    }

    pub fn with_response(mut self, response: serde_json::Value) -> Self {
        self.provider_response = response;
        self
    }
}

/// Uniform dispatch interface to a delivery provider.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, request: &DispatchRequest) -> DispatchOutcome;

    /// Checked once at startup; a misconfigured adapter refuses to register.
    fn validate_config(&self) -> AppResult<()>;

    /// Optional provider-side status poll by provider delivery id.
    async fn poll_status(&self, _provider_delivery_id: &str) -> AppResult<Option<String>> {
        Ok(None)
    }
}

/// Channel -> adapter lookup used by the workers.
pub struct AdapterRegistry {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.channel(), adapter);
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&channel).cloned()
    }

    /// Validate every registered adapter; errors carry the channel name.
    pub fn validate_all(&self) -> AppResult<()> {
        for (channel, adapter) in &self.adapters {
            adapter.validate_config().map_err(|e| {
                crate::error::AppError::Config(format!(
                    "Adapter for {} misconfigured: {}",
                    channel.as_str(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.adapters.keys().copied().collect()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub mod testing {
    //! A scriptable adapter for worker and scenario tests.

    use std::sync::Mutex;

    use super::*;

    pub struct ScriptedAdapter {
        channel: Channel,
        outcomes: Mutex<Vec<DispatchOutcome>>,
        pub sent: Mutex<Vec<DispatchRequest>>,
    }

    impl ScriptedAdapter {
        /// Outcomes are consumed in order; once exhausted every send succeeds.
        pub fn new(channel: Channel, outcomes: Vec<DispatchOutcome>) -> Self {
            Self {
                channel,
                outcomes: Mutex::new(outcomes),
                sent: Mutex::new(Vec::new()),
            }
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChannelAdapter for ScriptedAdapter {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn send(&self, request: &DispatchRequest) -> DispatchOutcome {
            self.sent.lock().unwrap().push(request.clone());
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                DispatchOutcome::ok(Some(format!("prov-{}", request.notification_id)), Some(200))
            } else {
                outcomes.remove(0)
            }
        }

        fn validate_config(&self) -> AppResult<()> {
            Ok(())
        }
    }
}
