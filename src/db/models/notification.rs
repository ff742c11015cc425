use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Delivery mediums supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Push,
    InApp,
    Webhook,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Email,
        Channel::Sms,
        Channel::Push,
        Channel::InApp,
        Channel::Webhook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Push => "push",
            Channel::InApp => "in_app",
            Channel::Webhook => "webhook",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(Channel::Email),
            "sms" => Some(Channel::Sms),
            "push" => Some(Channel::Push),
            "in_app" => Some(Channel::InApp),
            "webhook" => Some(Channel::Webhook),
            _ => None,
        }
    }
}

/// Categories of notifications, used for preference lookups and templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Welcome,
    Security,
    Message,
    Complaint,
    Election,
    System,
    Reminder,
    Marketing,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Welcome => "welcome",
            NotificationType::Security => "security",
            NotificationType::Message => "message",
            NotificationType::Complaint => "complaint",
            NotificationType::Election => "election",
            NotificationType::System => "system",
            NotificationType::Reminder => "reminder",
            NotificationType::Marketing => "marketing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "welcome" => Some(NotificationType::Welcome),
            "security" => Some(NotificationType::Security),
            "message" => Some(NotificationType::Message),
            "complaint" => Some(NotificationType::Complaint),
            "election" => Some(NotificationType::Election),
            "system" => Some(NotificationType::System),
            "reminder" => Some(NotificationType::Reminder),
            "marketing" => Some(NotificationType::Marketing),
            _ => None,
        }
    }
}

/// Five scheduling tiers. Workers drain higher tiers first; a tier waiting
/// past the aging threshold is treated one tier higher for the next dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
    Critical,
}

impl Priority {
    /// Numeric rank persisted in the queue; higher drains first.
    pub fn rank(&self) -> i32 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
            Priority::Critical => 4,
        }
    }

    pub fn from_rank(rank: i32) -> Self {
        match rank {
            i32::MIN..=0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            3 => Priority::Urgent,
            _ => Priority::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
            Priority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "urgent" => Some(Priority::Urgent),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }

    /// Urgent and Critical bypass preference filters entirely.
    pub fn bypasses_preferences(&self) -> bool {
        matches!(self, Priority::Urgent | Priority::Critical)
    }

    /// High and above ignore quiet hours.
    pub fn ignores_quiet_hours(&self) -> bool {
        matches!(self, Priority::High | Priority::Urgent | Priority::Critical)
    }
}

/// Notification lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Queued,
    Sending,
    Sent,
    Delivered,
    Read,
    FailedRetryable,
    FailedFinal,
    Cancelled,
    Expired,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Queued => "queued",
            NotificationStatus::Sending => "sending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::Read => "read",
            NotificationStatus::FailedRetryable => "failed_retryable",
            NotificationStatus::FailedFinal => "failed_final",
            NotificationStatus::Cancelled => "cancelled",
            NotificationStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(NotificationStatus::Pending),
            "queued" => Some(NotificationStatus::Queued),
            "sending" => Some(NotificationStatus::Sending),
            "sent" => Some(NotificationStatus::Sent),
            "delivered" => Some(NotificationStatus::Delivered),
            "read" => Some(NotificationStatus::Read),
            "failed_retryable" => Some(NotificationStatus::FailedRetryable),
            "failed_final" => Some(NotificationStatus::FailedFinal),
            "cancelled" => Some(NotificationStatus::Cancelled),
            "expired" => Some(NotificationStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Delivered
                | NotificationStatus::Read
                | NotificationStatus::FailedFinal
                | NotificationStatus::Cancelled
                | NotificationStatus::Expired
        )
    }

    /// Cancellation is allowed only before the provider has been handed the
    /// message.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Pending | NotificationStatus::Queued
        )
    }
}

/// A notification record. Created by intake, mutated by workers only.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,

    /// Notification type ('welcome', 'security', ...)
    pub notification_type: String,

    /// Delivery channel ('email', 'sms', 'push', 'in_app', 'webhook')
    pub channel: String,

    /// Numeric priority rank (0 = low .. 4 = critical)
    pub priority: i32,

    pub subject: Option<String>,

    /// Literal content; mutually exclusive with template_name.
    pub content: Option<String>,

    /// Name of the template to render; mutually exclusive with content.
    pub template_name: Option<String>,

    /// JSON object of render variables.
    pub variables: String,

    /// If set in the future at admission, the notification waits in the
    /// scheduled set until due.
    pub scheduled_at: Option<NaiveDateTime>,

    pub status: String,

    /// Human-readable reason for Cancelled / Failed-Final states.
    pub status_reason: Option<String>,

    pub retry_count: i32,
    pub max_retries: i32,

    /// Synthesized digest notifications skip the frequency rules; they are
    /// the output of batching, not its input.
    pub is_digest: bool,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Notification {
    pub fn status(&self) -> Option<NotificationStatus> {
        NotificationStatus::parse(&self.status)
    }

    pub fn channel(&self) -> Option<Channel> {
        Channel::parse(&self.channel)
    }

    pub fn notification_type(&self) -> Option<NotificationType> {
        NotificationType::parse(&self.notification_type)
    }

    pub fn priority(&self) -> Priority {
        Priority::from_rank(self.priority)
    }

    pub fn variables_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.variables).unwrap_or(serde_json::Value::Null)
    }
}

/// Data required to create a notification at admission time.
#[derive(Debug, Clone)]
pub struct CreateNotification {
    pub user_id: String,
    pub notification_type: NotificationType,
    pub channel: Channel,
    pub priority: Priority,
    pub subject: Option<String>,
    pub content: Option<String>,
    pub template_name: Option<String>,
    pub variables: serde_json::Value,
    pub scheduled_at: Option<NaiveDateTime>,
    pub max_retries: i32,
    pub is_digest: bool,
}

/// A row in the durable delivery queue.
#[derive(Debug, Clone, FromRow)]
pub struct QueueEntry {
    /// Monotonic sequence; FIFO order within a priority tier.
    pub seq: i64,
    pub notification_id: String,
    pub priority: i32,
    /// Entries become claimable once available_at <= now.
    pub available_at: NaiveDateTime,
    pub enqueued_at: NaiveDateTime,
    pub status: String,
    pub claimed_at: Option<NaiveDateTime>,
}
