use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{BatchBucket, PendingBatchEntry};
use crate::error::{AppError, AppResult};

/// Repository for pending digest entries. Deferred notifications append a
/// summary line here; the batch sweepers drain whole (user, type, channel)
/// buckets at the user-local digest time.
pub struct BatchRepository;

impl BatchRepository {
    pub async fn append(
        pool: &SqlitePool,
        user_id: &str,
        notification_type: &str,
        channel: &str,
        summary: &str,
    ) -> AppResult<PendingBatchEntry> {
        let row = sqlx::query_as::<_, PendingBatchEntry>(
            r#"
            INSERT INTO pending_batches (id, user_id, notification_type, channel, summary, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(notification_type)
        .bind(channel)
        .bind(summary)
        .bind(Utc::now().naive_utc())
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(row)
    }

    /// Every bucket with at least one pending entry.
    pub async fn buckets(pool: &SqlitePool) -> AppResult<Vec<BatchBucket>> {
        let rows = sqlx::query_as::<_, BatchBucket>(
            r#"
            SELECT user_id, notification_type, channel, COUNT(*) AS entry_count
            FROM pending_batches
            GROUP BY user_id, notification_type, channel
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(rows)
    }

    /// Drain a bucket: remove and return all of its entries, oldest first.
    /// The digest caps how many it lists; the count still reflects them all.
    pub async fn drain(
        pool: &SqlitePool,
        user_id: &str,
        notification_type: &str,
        channel: &str,
    ) -> AppResult<Vec<PendingBatchEntry>> {
        let mut tx = pool.begin().await.map_err(AppError::Database)?;

        let rows = sqlx::query_as::<_, PendingBatchEntry>(
            r#"
            SELECT * FROM pending_batches
            WHERE user_id = ? AND notification_type = ? AND channel = ?
            ORDER BY created_at
            "#,
        )
        .bind(user_id)
        .bind(notification_type)
        .bind(channel)
        .fetch_all(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        sqlx::query(
            "DELETE FROM pending_batches WHERE user_id = ? AND notification_type = ? AND channel = ?",
        )
        .bind(user_id)
        .bind(notification_type)
        .bind(channel)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        tx.commit().await.map_err(AppError::Database)?;
        Ok(rows)
    }
}
