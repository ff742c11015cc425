use chrono::{Duration, NaiveDateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateNotification, Notification, NotificationStatus, QueueEntry};
use crate::error::{AppError, AppResult};

/// Repository for notification records.
///
/// Status transitions from workers go through `cas_status` so that two
/// workers racing on the same notification cannot both proceed; the loser
/// sees no row returned and abandons.
pub struct NotificationRepository;

impl NotificationRepository {
    pub async fn create(pool: &SqlitePool, input: CreateNotification) -> AppResult<Notification> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let status = if input
            .scheduled_at
            .map(|at| at > now)
            .unwrap_or(false)
        {
            NotificationStatus::Pending
        } else {
            NotificationStatus::Queued
        };

        let row = sqlx::query_as::<_, Notification>(
            r#"
            INSERT INTO notifications (
                id, user_id, notification_type, channel, priority,
                subject, content, template_name, variables, scheduled_at,
                status, status_reason, retry_count, max_retries, is_digest,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&input.user_id)
        .bind(input.notification_type.as_str())
        .bind(input.channel.as_str())
        .bind(input.priority.rank())
        .bind(&input.subject)
        .bind(&input.content)
        .bind(&input.template_name)
        .bind(input.variables.to_string())
        .bind(input.scheduled_at)
        .bind(status.as_str())
        .bind::<Option<String>>(None)
        .bind(0i32)
        .bind(input.max_retries)
        .bind(input.is_digest)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Notification>> {
        let row = sqlx::query_as::<_, Notification>("SELECT * FROM notifications WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(row)
    }

    /// Compare-and-swap the status. Returns the updated row, or None when the
    /// current status was not in `from` (another worker won the race).
    pub async fn cas_status(
        pool: &SqlitePool,
        id: &str,
        from: &[NotificationStatus],
        to: NotificationStatus,
    ) -> AppResult<Option<Notification>> {
        let placeholders = from.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "UPDATE notifications SET status = ?, updated_at = ? \
             WHERE id = ? AND status IN ({}) RETURNING *",
            placeholders
        );

        let mut query = sqlx::query_as::<_, Notification>(&sql)
            .bind(to.as_str())
            .bind(Utc::now().naive_utc())
            .bind(id);
        for status in from {
            query = query.bind(status.as_str());
        }

        let row = query.fetch_optional(pool).await.map_err(AppError::Database)?;
        Ok(row)
    }

    pub async fn set_status(
        pool: &SqlitePool,
        id: &str,
        status: NotificationStatus,
        reason: Option<&str>,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE notifications SET status = ?, status_reason = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(Utc::now().naive_utc())
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(())
    }

    /// Increment the retry counter and park the notification in
    /// Failed-Retryable; the retry sweeper moves it back to Queued when its
    /// backoff elapses.
    pub async fn register_retry(pool: &SqlitePool, id: &str) -> AppResult<Notification> {
        let row = sqlx::query_as::<_, Notification>(
            r#"
            UPDATE notifications
            SET retry_count = retry_count + 1, status = 'failed_retryable', updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(Utc::now().naive_utc())
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(row)
    }

    /// Promote scheduled notifications whose time has arrived into Queued.
    /// Returns the promoted rows so the caller can enqueue them.
    pub async fn promote_scheduled(
        pool: &SqlitePool,
        now: NaiveDateTime,
    ) -> AppResult<Vec<Notification>> {
        let rows = sqlx::query_as::<_, Notification>(
            r#"
            UPDATE notifications
            SET status = 'queued', updated_at = ?
            WHERE status = 'pending' AND scheduled_at IS NOT NULL AND scheduled_at <= ?
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(rows)
    }

    /// Expire every non-terminal notification older than the lifetime cutoff.
    pub async fn expire_older_than(
        pool: &SqlitePool,
        cutoff: NaiveDateTime,
    ) -> AppResult<Vec<Notification>> {
        let rows = sqlx::query_as::<_, Notification>(
            r#"
            UPDATE notifications
            SET status = 'expired', status_reason = 'max lifetime exceeded', updated_at = ?
            WHERE created_at <= ?
              AND status NOT IN ('delivered', 'read', 'failed_final', 'cancelled', 'expired')
            RETURNING *
            "#,
        )
        .bind(Utc::now().naive_utc())
        .bind(cutoff)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(rows)
    }

    pub async fn find_by_user(
        pool: &SqlitePool,
        user_id: &str,
        channel: Option<&str>,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Notification>> {
        let rows = sqlx::query_as::<_, Notification>(
            r#"
            SELECT * FROM notifications
            WHERE user_id = ?
              AND (? IS NULL OR channel = ?)
              AND (? IS NULL OR status = ?)
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(user_id)
        .bind(channel)
        .bind(channel)
        .bind(status)
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(rows)
    }

    pub async fn count_by_user(
        pool: &SqlitePool,
        user_id: &str,
        channel: Option<&str>,
        status: Option<&str>,
    ) -> AppResult<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM notifications
            WHERE user_id = ?
              AND (? IS NULL OR channel = ?)
              AND (? IS NULL OR status = ?)
            "#,
        )
        .bind(user_id)
        .bind(channel)
        .bind(channel)
        .bind(status)
        .bind(status)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(count.0)
    }
}

/// Repository for the durable delivery queue.
///
/// Implementation notes:
/// - Claiming uses an atomic single-statement UPDATE with a subselect:
///   `UPDATE ... WHERE seq = (SELECT seq FROM ... LIMIT 1) RETURNING ...`
///   This avoids a long-lived transaction and reduces contention on SQLite.
/// - `UNIQUE(notification_id)` plus `INSERT OR IGNORE` makes enqueue
///   idempotent on the notification id.
pub struct QueueRepository;

impl QueueRepository {
    /// Enqueue a notification. Re-enqueueing an id already present is a no-op.
    /// Returns true when a new row was inserted.
    pub async fn enqueue(
        pool: &SqlitePool,
        notification_id: &str,
        priority: i32,
        available_at: NaiveDateTime,
    ) -> AppResult<bool> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO delivery_queue
                (notification_id, priority, available_at, enqueued_at, status)
            VALUES (?, ?, ?, ?, 'ready')
            "#,
        )
        .bind(notification_id)
        .bind(priority)
        .bind(available_at)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomically claim the next ready entry.
    ///
    /// Ordering is by effective priority (entries older than the aging
    /// threshold count one tier higher, capped at critical) descending, then
    /// by sequence ascending, which preserves FIFO within a tier.
    pub async fn claim_next(
        pool: &SqlitePool,
        aging_threshold_seconds: i64,
    ) -> AppResult<Option<QueueEntry>> {
        let now = Utc::now().naive_utc();
        let aged_cutoff = now - Duration::seconds(aging_threshold_seconds);

        let row = sqlx::query_as::<_, QueueEntry>(
            r#"
            UPDATE delivery_queue
            SET status = 'claimed', claimed_at = ?
            WHERE seq = (
                SELECT seq FROM delivery_queue
                WHERE status = 'ready' AND available_at <= ?
                ORDER BY
                    CASE WHEN enqueued_at <= ? AND priority < 4
                         THEN priority + 1
                         ELSE priority
                    END DESC,
                    seq ASC
                LIMIT 1
            )
            RETURNING seq, notification_id, priority, available_at, enqueued_at, status, claimed_at
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(aged_cutoff)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Remove a processed entry from the queue.
    pub async fn complete(pool: &SqlitePool, notification_id: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM delivery_queue WHERE notification_id = ?")
            .bind(notification_id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }

    /// Return a claimed entry to ready with a new availability time. The
    /// original enqueue time is kept so the entry does not lose its place for
    /// aging purposes.
    pub async fn release(
        pool: &SqlitePool,
        notification_id: &str,
        available_at: NaiveDateTime,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE delivery_queue
            SET status = 'ready', claimed_at = NULL, available_at = ?
            WHERE notification_id = ?
            "#,
        )
        .bind(available_at)
        .bind(notification_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(())
    }

    /// Crash recovery: entries claimed by a process that never completed them
    /// go back to ready once their lease expires.
    pub async fn recover_stale_claims(
        pool: &SqlitePool,
        lease_seconds: i64,
    ) -> AppResult<u64> {
        let cutoff = Utc::now().naive_utc() - Duration::seconds(lease_seconds);
        let result = sqlx::query(
            r#"
            UPDATE delivery_queue
            SET status = 'ready', claimed_at = NULL
            WHERE status = 'claimed' AND claimed_at <= ?
            "#,
        )
        .bind(cutoff)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(result.rows_affected())
    }

    /// Ready-entry count per priority rank, highest first. Used by health and
    /// the stats API.
    pub async fn depth_by_priority(pool: &SqlitePool) -> AppResult<Vec<(i32, i64)>> {
        let rows: Vec<(i32, i64)> = sqlx::query_as(
            r#"
            SELECT priority, COUNT(*) FROM delivery_queue
            WHERE status = 'ready'
            GROUP BY priority
            ORDER BY priority DESC
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(rows)
    }
}
