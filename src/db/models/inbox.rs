use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One entry in a user's in-app inbox. The inbox is capped at 100 entries per
/// user with a 7 day TTL; the in-app adapter enforces both on write.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct InboxEntry {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub body: String,
    pub read: bool,
    pub created_at: NaiveDateTime,
}
