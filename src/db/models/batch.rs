use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One summary line waiting in a user's daily/weekly digest bucket.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PendingBatchEntry {
    pub id: String,
    pub user_id: String,
    pub notification_type: String,
    pub channel: String,
    pub summary: String,
    pub created_at: NaiveDateTime,
}

/// A (user, type, channel) bucket with at least one pending summary.
#[derive(Debug, Clone, FromRow)]
pub struct BatchBucket {
    pub user_id: String,
    pub notification_type: String,
    pub channel: String,
    pub entry_count: i64,
}
