use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{
    Channel, NotificationType, UpdateUserPreference, UserPreference,
};
use crate::error::{AppError, AppResult};

/// Repository for per (user, type, channel) preference rows.
pub struct PreferenceRepository;

impl PreferenceRepository {
    pub async fn get(
        pool: &SqlitePool,
        user_id: &str,
        ntype: NotificationType,
        channel: Channel,
    ) -> AppResult<Option<UserPreference>> {
        let row = sqlx::query_as::<_, UserPreference>(
            "SELECT * FROM user_preferences WHERE user_id = ? AND notification_type = ? AND channel = ?",
        )
        .bind(user_id)
        .bind(ntype.as_str())
        .bind(channel.as_str())
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(row)
    }

    /// Stored preference, or the built-in default when none exists. The
    /// default is not persisted; registration seeds rows via `init_defaults`.
    pub async fn get_or_default(
        pool: &SqlitePool,
        user_id: &str,
        ntype: NotificationType,
        channel: Channel,
    ) -> AppResult<UserPreference> {
        match Self::get(pool, user_id, ntype, channel).await? {
            Some(p) => Ok(p),
            None => Ok(UserPreference::default_for(user_id, ntype, channel)),
        }
    }

    pub async fn list_for_user(
        pool: &SqlitePool,
        user_id: &str,
    ) -> AppResult<Vec<UserPreference>> {
        let rows = sqlx::query_as::<_, UserPreference>(
            "SELECT * FROM user_preferences WHERE user_id = ? ORDER BY notification_type, channel",
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(rows)
    }

    /// Apply a partial update, inserting the row from defaults first if it
    /// does not exist yet.
    pub async fn upsert(
        pool: &SqlitePool,
        user_id: &str,
        ntype: NotificationType,
        channel: Channel,
        update: UpdateUserPreference,
    ) -> AppResult<UserPreference> {
        let existing = Self::get(pool, user_id, ntype, channel).await?;
        let base = match existing {
            Some(p) => p,
            None => {
                let defaults = UserPreference::default_for(user_id, ntype, channel);
                Self::insert(pool, &defaults).await?
            }
        };

        let now = Utc::now().naive_utc();
        let enabled = update.enabled.unwrap_or(base.enabled);
        let frequency = update
            .frequency
            .map(|f| f.as_str().to_string())
            .unwrap_or(base.frequency);
        let quiet_start = update.quiet_start.or(base.quiet_start);
        let quiet_end = update.quiet_end.or(base.quiet_end);
        let time_zone = update.time_zone.unwrap_or(base.time_zone);

        let row = sqlx::query_as::<_, UserPreference>(
            r#"
            UPDATE user_preferences
            SET enabled = ?, frequency = ?, quiet_start = ?, quiet_end = ?,
                time_zone = ?, updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(enabled)
        .bind(frequency)
        .bind(quiet_start)
        .bind(quiet_end)
        .bind(time_zone)
        .bind(now)
        .bind(&base.id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Seed default rows for every (type, channel) pair a user can configure.
    /// Existing rows are left untouched.
    pub async fn init_defaults(pool: &SqlitePool, user_id: &str) -> AppResult<usize> {
        let mut created = 0usize;
        for ntype in [
            NotificationType::Welcome,
            NotificationType::Security,
            NotificationType::Message,
            NotificationType::Complaint,
            NotificationType::Election,
            NotificationType::System,
            NotificationType::Reminder,
            NotificationType::Marketing,
        ] {
            for channel in Channel::ALL {
                if Self::get(pool, user_id, ntype, channel).await?.is_none() {
                    let defaults = UserPreference::default_for(user_id, ntype, channel);
                    Self::insert(pool, &defaults).await?;
                    created += 1;
                }
            }
        }
        Ok(created)
    }

    async fn insert(pool: &SqlitePool, p: &UserPreference) -> AppResult<UserPreference> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let row = sqlx::query_as::<_, UserPreference>(
            r#"
            INSERT INTO user_preferences (
                id, user_id, notification_type, channel, enabled, frequency,
                quiet_start, quiet_end, time_zone, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&p.user_id)
        .bind(&p.notification_type)
        .bind(&p.channel)
        .bind(p.enabled)
        .bind(&p.frequency)
        .bind(&p.quiet_start)
        .bind(&p.quiet_end)
        .bind(&p.time_zone)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Frequency;

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
    async fn read_after_write_returns_written_value() {
        let pool = test_pool().await;
        let written = PreferenceRepository::upsert(
            &pool,
            "u1",
            NotificationType::Message,
            Channel::Email,
            UpdateUserPreference {
                enabled: Some(false),
                frequency: Some(Frequency::Weekly),
                quiet_start: Some("22:00".to_string()),
                quiet_end: Some("06:00".to_string()),
                time_zone: Some("Africa/Cairo".to_string()),
            },
        )
        .await
        .unwrap();

        let read = PreferenceRepository::get(&pool, "u1", NotificationType::Message, Channel::Email)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.enabled, written.enabled);
        assert_eq!(read.frequency, "weekly");
        assert_eq!(read.quiet_start.as_deref(), Some("22:00"));
        assert_eq!(read.time_zone, "Africa/Cairo");
    }

    #[tokio::test]
    async fn get_or_default_falls_back_to_builtin() {
        let pool = test_pool().await;
        let p = PreferenceRepository::get_or_default(
            &pool,
            "u1",
            NotificationType::Marketing,
            Channel::Email,
        )
        .await
        .unwrap();
        assert!(!p.enabled);
        assert!(p.id.is_empty());
    }

    #[tokio::test]
    async fn init_defaults_is_idempotent() {
        let pool = test_pool().await;
        let first = PreferenceRepository::init_defaults(&pool, "u1").await.unwrap();
        assert_eq!(first, 8 * 5);
        let second = PreferenceRepository::init_defaults(&pool, "u1").await.unwrap();
        assert_eq!(second, 0);
    }
}
