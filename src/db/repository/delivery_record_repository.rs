use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateAttempt, DeliveryAttempt, DeliveryRecord};
use crate::error::{AppError, AppResult};

/// Repository for delivery records and their append-only attempt history.
///
/// Attempts are appended in the same transaction as the owning record update
/// so the two can never diverge.
pub struct DeliveryRecordRepository;

impl DeliveryRecordRepository {
    /// Find the record for (notification, channel) or create it in `queued`.
    /// A notification keeps one record per channel across retries.
    pub async fn get_or_create(
        pool: &SqlitePool,
        notification_id: &str,
        user_id: &str,
        channel: &str,
        recipient_address: &str,
    ) -> AppResult<DeliveryRecord> {
        if let Some(existing) = sqlx::query_as::<_, DeliveryRecord>(
            "SELECT * FROM delivery_records WHERE notification_id = ? AND channel = ?",
        )
        .bind(notification_id)
        .bind(channel)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?
        {
            // Refresh the address: the directory may have changed between
            // attempts.
            if existing.recipient_address != recipient_address {
                sqlx::query(
                    "UPDATE delivery_records SET recipient_address = ?, updated_at = ? WHERE id = ?",
                )
                .bind(recipient_address)
                .bind(Utc::now().naive_utc())
                .bind(&existing.id)
                .execute(pool)
                .await
                .map_err(AppError::Database)?;
            }
            return Ok(DeliveryRecord {
                recipient_address: recipient_address.to_string(),
                ..existing
            });
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let row = sqlx::query_as::<_, DeliveryRecord>(
            r#"
            INSERT INTO delivery_records (
                id, notification_id, user_id, channel, recipient_address,
                status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 'queued', ?, ?)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(notification_id)
        .bind(user_id)
        .bind(channel)
        .bind(recipient_address)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn set_status(pool: &SqlitePool, id: &str, status: &str) -> AppResult<()> {
        sqlx::query("UPDATE delivery_records SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now().naive_utc())
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }

    /// Append an attempt and update the owning record in one transaction.
    ///
    /// The record's status, failure kind, error message, provider id and
    /// retry schedule all reflect this attempt's outcome after the call.
    #[allow(clippy::too_many_arguments)]
    pub async fn append_attempt(
        pool: &SqlitePool,
        record_id: &str,
        attempt: CreateAttempt,
        record_status: &str,
        failure_kind: Option<&str>,
        provider_delivery_id: Option<&str>,
        next_retry_at: Option<NaiveDateTime>,
        delivered_at: Option<NaiveDateTime>,
    ) -> AppResult<DeliveryAttempt> {
        let mut tx = pool.begin().await.map_err(AppError::Database)?;
        let now = Utc::now().naive_utc();

        let next_number: (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(attempt_number), 0) + 1 FROM delivery_attempts WHERE record_id = ?",
        )
        .bind(record_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        let row = sqlx::query_as::<_, DeliveryAttempt>(
            r#"
            INSERT INTO delivery_attempts (
                id, record_id, attempt_number, status, error_message,
                response_code, duration_ms, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(record_id)
        .bind(next_number.0)
        .bind(&attempt.status)
        .bind(&attempt.error_message)
        .bind(attempt.response_code)
        .bind(attempt.duration_ms)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = ?,
                failure_kind = ?,
                error_message = ?,
                provider_delivery_id = COALESCE(?, provider_delivery_id),
                next_retry_at = ?,
                delivered_at = COALESCE(?, delivered_at),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(record_status)
        .bind(failure_kind)
        .bind(&attempt.error_message)
        .bind(provider_delivery_id)
        .bind(next_retry_at)
        .bind(delivered_at)
        .bind(now)
        .bind(record_id)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        tx.commit().await.map_err(AppError::Database)?;
        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<DeliveryRecord>> {
        let row = sqlx::query_as::<_, DeliveryRecord>("SELECT * FROM delivery_records WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(row)
    }

    pub async fn find_by_notification(
        pool: &SqlitePool,
        notification_id: &str,
    ) -> AppResult<Vec<DeliveryRecord>> {
        let rows = sqlx::query_as::<_, DeliveryRecord>(
            "SELECT * FROM delivery_records WHERE notification_id = ? ORDER BY created_at",
        )
        .bind(notification_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(rows)
    }

    pub async fn find_by_provider_delivery_id(
        pool: &SqlitePool,
        provider_delivery_id: &str,
    ) -> AppResult<Option<DeliveryRecord>> {
        let row = sqlx::query_as::<_, DeliveryRecord>(
            "SELECT * FROM delivery_records WHERE provider_delivery_id = ?",
        )
        .bind(provider_delivery_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(row)
    }

    pub async fn attempts(pool: &SqlitePool, record_id: &str) -> AppResult<Vec<DeliveryAttempt>> {
        let rows = sqlx::query_as::<_, DeliveryAttempt>(
            "SELECT * FROM delivery_attempts WHERE record_id = ? ORDER BY attempt_number",
        )
        .bind(record_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(rows)
    }

    /// Records whose retry is due. The caller clears next_retry_at when it
    /// re-enqueues the owning notification.
    pub async fn due_retries(
        pool: &SqlitePool,
        now: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<DeliveryRecord>> {
        let rows = sqlx::query_as::<_, DeliveryRecord>(
            r#"
            SELECT * FROM delivery_records
            WHERE next_retry_at IS NOT NULL AND next_retry_at <= ?
            ORDER BY next_retry_at
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(rows)
    }

    /// Drop any pending retry schedule for a notification's records, e.g.
    /// when the notification expires or is cancelled.
    pub async fn clear_retry_for_notification(
        pool: &SqlitePool,
        notification_id: &str,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE delivery_records SET next_retry_at = NULL, updated_at = ? WHERE notification_id = ?",
        )
        .bind(Utc::now().naive_utc())
        .bind(notification_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(())
    }

    pub async fn clear_retry_schedule(pool: &SqlitePool, id: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE delivery_records SET next_retry_at = NULL, status = 'queued', updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now().naive_utc())
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(())
    }

    /// Provider delivery receipt. Idempotent: a record already delivered is
    /// left untouched.
    pub async fn mark_delivered(
        pool: &SqlitePool,
        id: &str,
        at: NaiveDateTime,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = 'delivered', delivered_at = ?, updated_at = ?
            WHERE id = ? AND delivered_at IS NULL
            "#,
        )
        .bind(at)
        .bind(Utc::now().naive_utc())
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Recipient read event. Idempotent on read_at.
    pub async fn mark_read(pool: &SqlitePool, id: &str, at: NaiveDateTime) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = 'read', read_at = ?, updated_at = ?
            WHERE id = ? AND read_at IS NULL
            "#,
        )
        .bind(at)
        .bind(Utc::now().naive_utc())
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_by_user(
        pool: &SqlitePool,
        user_id: &str,
        channel: Option<&str>,
        status: Option<&str>,
        limit: i64,
    ) -> AppResult<Vec<DeliveryRecord>> {
        let rows = sqlx::query_as::<_, DeliveryRecord>(
            r#"
            SELECT * FROM delivery_records
            WHERE user_id = ?
              AND (? IS NULL OR channel = ?)
              AND (? IS NULL OR status = ?)
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(channel)
        .bind(channel)
        .bind(status)
        .bind(status)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(rows)
    }

    /// TTL cleanup: terminal records (and their attempts) untouched since the
    /// cutoff are removed. Returns the number of records deleted.
    pub async fn purge_terminal_older_than(
        pool: &SqlitePool,
        cutoff: NaiveDateTime,
    ) -> AppResult<u64> {
        let mut tx = pool.begin().await.map_err(AppError::Database)?;

        sqlx::query(
            r#"
            DELETE FROM delivery_attempts WHERE record_id IN (
                SELECT id FROM delivery_records
                WHERE status IN ('delivered', 'read', 'failed') AND updated_at <= ?
            )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        let result = sqlx::query(
            "DELETE FROM delivery_records WHERE status IN ('delivered', 'read', 'failed') AND updated_at <= ?",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        tx.commit().await.map_err(AppError::Database)?;
        Ok(result.rows_affected())
    }
}
