use chrono::{NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::notification::{Channel, NotificationType};

/// Batching cadence for a (user, type, channel) combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Immediate,
    Daily,
    Weekly,
    Disabled,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Immediate => "immediate",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "immediate" => Some(Frequency::Immediate),
            "daily" => Some(Frequency::Daily),
            "weekly" => Some(Frequency::Weekly),
            "disabled" => Some(Frequency::Disabled),
            _ => None,
        }
    }
}

/// Per (user, type, channel) delivery settings.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserPreference {
    pub id: String,
    pub user_id: String,
    pub notification_type: String,
    pub channel: String,
    pub enabled: bool,

    /// 'immediate', 'daily', 'weekly', 'disabled'
    pub frequency: String,

    /// Quiet hours window in the user's local time, "HH:MM". The window may
    /// wrap past midnight (start > end).
    pub quiet_start: Option<String>,
    pub quiet_end: Option<String>,

    /// IANA time zone name.
    pub time_zone: String,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl UserPreference {
    pub fn frequency(&self) -> Frequency {
        Frequency::parse(&self.frequency).unwrap_or(Frequency::Immediate)
    }

    pub fn quiet_window(&self) -> Option<(NaiveTime, NaiveTime)> {
        let start = parse_hhmm(self.quiet_start.as_deref()?)?;
        let end = parse_hhmm(self.quiet_end.as_deref()?)?;
        Some((start, end))
    }

    /// Built-in defaults for a (user, type, channel) with no stored record:
    /// everything enabled and immediate, except marketing (disabled) and
    /// system email (batched daily).
    pub fn default_for(user_id: &str, ntype: NotificationType, channel: Channel) -> Self {
        let (enabled, frequency) = match (ntype, channel) {
            (NotificationType::Marketing, _) => (false, Frequency::Immediate),
            (NotificationType::System, Channel::Email) => (true, Frequency::Daily),
            _ => (true, Frequency::Immediate),
        };

        let now = Utc::now().naive_utc();
        Self {
            id: String::new(),
            user_id: user_id.to_string(),
            notification_type: ntype.as_str().to_string(),
            channel: channel.as_str().to_string(),
            enabled,
            frequency: frequency.as_str().to_string(),
            quiet_start: None,
            quiet_end: None,
            time_zone: "UTC".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

/// Partial update applied over an existing (or default) preference.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateUserPreference {
    pub enabled: Option<bool>,
    pub frequency: Option<Frequency>,
    pub quiet_start: Option<String>,
    pub quiet_end: Option<String>,
    pub time_zone: Option<String>,
}
