use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::InboxEntry;
use crate::error::{AppError, AppResult};

const INBOX_CAP: i64 = 100;
const INBOX_TTL_DAYS: i64 = 7;

/// Repository for the per-user in-app inbox. Writes enforce the per-user cap
/// and TTL so the table never grows unbounded.
pub struct InboxRepository;

impl InboxRepository {
    pub async fn push(
        pool: &SqlitePool,
        user_id: &str,
        title: Option<&str>,
        body: &str,
    ) -> AppResult<InboxEntry> {
        let mut tx = pool.begin().await.map_err(AppError::Database)?;
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, InboxEntry>(
            r#"
            INSERT INTO inbox_entries (id, user_id, title, body, read, created_at)
            VALUES (?, ?, ?, ?, 0, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(title)
        .bind(body)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        // Evict beyond the cap, oldest first, then expired entries.
        sqlx::query(
            r#"
            DELETE FROM inbox_entries
            WHERE user_id = ? AND id NOT IN (
                SELECT id FROM inbox_entries
                WHERE user_id = ?
                ORDER BY created_at DESC, id DESC
                LIMIT ?
            )
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(INBOX_CAP)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        sqlx::query("DELETE FROM inbox_entries WHERE created_at <= ?")
            .bind(now - Duration::days(INBOX_TTL_DAYS))
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;

        tx.commit().await.map_err(AppError::Database)?;
        Ok(row)
    }

    pub async fn list_for_user(
        pool: &SqlitePool,
        user_id: &str,
        limit: i64,
    ) -> AppResult<Vec<InboxEntry>> {
        let rows = sqlx::query_as::<_, InboxEntry>(
            "SELECT * FROM inbox_entries WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(rows)
    }

    pub async fn mark_read(pool: &SqlitePool, id: &str) -> AppResult<bool> {
        let result = sqlx::query("UPDATE inbox_entries SET read = 1 WHERE id = ? AND read = 0")
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(result.rows_affected() > 0)
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

    #[tokio::test]
    async fn push_caps_inbox_at_limit() {
        let pool = test_pool().await;
        for i in 0..(INBOX_CAP + 10) {
            InboxRepository::push(&pool, "u1", None, &format!("m{}", i))
                .await
                .unwrap();
        }
        let entries = InboxRepository::list_for_user(&pool, "u1", 500).await.unwrap();
        assert_eq!(entries.len(), INBOX_CAP as usize);
        // Newest survives.
        assert_eq!(entries[0].body, format!("m{}", INBOX_CAP + 9));
    }

    #[tokio::test]
    async fn mark_read_is_idempotent() {
        let pool = test_pool().await;
        let entry = InboxRepository::push(&pool, "u1", Some("t"), "body").await.unwrap();
        assert!(InboxRepository::mark_read(&pool, &entry.id).await.unwrap());
        assert!(!InboxRepository::mark_read(&pool, &entry.id).await.unwrap());
    }
}
