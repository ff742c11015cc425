use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateTemplate, Template};
use crate::error::{AppError, AppResult};

/// Repository for templates and their version history. The partial unique
/// index on (type, channel) WHERE active guarantees at most one active
/// template per combination; activation swaps happen inside a transaction.
pub struct TemplateRepository;

impl TemplateRepository {
    /// The active template for a (type, channel), if any.
    pub async fn active_for(
        pool: &SqlitePool,
        notification_type: &str,
        channel: &str,
    ) -> AppResult<Option<Template>> {
        let row = sqlx::query_as::<_, Template>(
            "SELECT * FROM templates WHERE notification_type = ? AND channel = ? AND active = 1",
        )
        .bind(notification_type)
        .bind(channel)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(row)
    }

    /// Latest version of a named template.
    pub async fn find_by_name(pool: &SqlitePool, name: &str) -> AppResult<Option<Template>> {
        let row = sqlx::query_as::<_, Template>(
            "SELECT * FROM templates WHERE name = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(row)
    }

    pub async fn find_version(
        pool: &SqlitePool,
        name: &str,
        version: i64,
    ) -> AppResult<Option<Template>> {
        let row = sqlx::query_as::<_, Template>(
            "SELECT * FROM templates WHERE name = ? AND version = ?",
        )
        .bind(name)
        .bind(version)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(row)
    }

    /// Latest version of every template name.
    pub async fn list(pool: &SqlitePool) -> AppResult<Vec<Template>> {
        let rows = sqlx::query_as::<_, Template>(
            r#"
            SELECT t.* FROM templates t
            JOIN (SELECT name, MAX(version) AS v FROM templates GROUP BY name) latest
              ON t.name = latest.name AND t.version = latest.v
            ORDER BY t.name
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(rows)
    }

    /// Insert a new version of a template. When `activate` is set, the
    /// previous active template for the (type, channel) is deactivated in the
    /// same transaction.
    pub async fn create_version(
        pool: &SqlitePool,
        input: &CreateTemplate,
        activate: bool,
    ) -> AppResult<Template> {
        let mut tx = pool.begin().await.map_err(AppError::Database)?;
        let now = Utc::now().naive_utc();

        let next_version: (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) + 1 FROM templates WHERE name = ?")
                .bind(&input.name)
                .fetch_one(&mut *tx)
                .await
                .map_err(AppError::Database)?;

        if activate {
            sqlx::query(
                "UPDATE templates SET active = 0, updated_at = ? WHERE notification_type = ? AND channel = ? AND active = 1",
            )
            .bind(now)
            .bind(&input.notification_type)
            .bind(&input.channel)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;
        }

        let variables = serde_json::to_string(&input.variables)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        let row = sqlx::query_as::<_, Template>(
            r#"
            INSERT INTO templates (
                id, name, notification_type, channel, subject, body,
                variables, language, active, version, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&input.name)
        .bind(&input.notification_type)
        .bind(&input.channel)
        .bind(&input.subject)
        .bind(&input.body)
        .bind(variables)
        .bind(input.language.as_deref().unwrap_or("en"))
        .bind(activate)
        .bind(next_version.0)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        tx.commit().await.map_err(AppError::Database)?;
        Ok(row)
    }

    /// Activate the named template's latest version (or a specific version),
    /// deactivating the current active one for its (type, channel).
    pub async fn activate(
        pool: &SqlitePool,
        name: &str,
        version: Option<i64>,
    ) -> AppResult<Template> {
        let target = match version {
            Some(v) => Self::find_version(pool, name, v).await?,
            None => Self::find_by_name(pool, name).await?,
        }
        .ok_or_else(|| AppError::NotFound(format!("Template not found: {}", name)))?;

        let mut tx = pool.begin().await.map_err(AppError::Database)?;
        let now = Utc::now().naive_utc();

        sqlx::query(
            "UPDATE templates SET active = 0, updated_at = ? WHERE notification_type = ? AND channel = ? AND active = 1",
        )
        .bind(now)
        .bind(&target.notification_type)
        .bind(&target.channel)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        let row = sqlx::query_as::<_, Template>(
            "UPDATE templates SET active = 1, updated_at = ? WHERE id = ? RETURNING *",
        )
        .bind(now)
        .bind(&target.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        tx.commit().await.map_err(AppError::Database)?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    async fn test_pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn input(name: &str) -> CreateTemplate {
        CreateTemplate {
            name: name.to_string(),
            notification_type: "reminder".to_string(),
            channel: "sms".to_string(),
            subject: None,
            body: "{{text}}".to_string(),
            variables: HashMap::new(),
            language: None,
        }
    }

    #[tokio::test]
    async fn create_version_bumps_and_swaps_active() {
        let pool = test_pool().await;

        let v1 = TemplateRepository::create_version(&pool, &input("reminder_sms"), true)
            .await
            .unwrap();
        assert_eq!(v1.version, 1);
        assert!(v1.active);

        let v2 = TemplateRepository::create_version(&pool, &input("reminder_sms"), true)
            .await
            .unwrap();
        assert_eq!(v2.version, 2);

        let active = TemplateRepository::active_for(&pool, "reminder", "sms")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.id, v2.id);
    }

    #[tokio::test]
    async fn activate_older_version() {
        let pool = test_pool().await;
        let v1 = TemplateRepository::create_version(&pool, &input("reminder_sms"), true)
            .await
            .unwrap();
        TemplateRepository::create_version(&pool, &input("reminder_sms"), true)
            .await
            .unwrap();

        let reactivated = TemplateRepository::activate(&pool, "reminder_sms", Some(1))
            .await
            .unwrap();
        assert_eq!(reactivated.id, v1.id);

        let active = TemplateRepository::active_for(&pool, "reminder", "sms")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.version, 1);
    }

    #[tokio::test]
    async fn seeded_default_templates_are_active() {
        let pool = test_pool().await;
        let welcome = TemplateRepository::active_for(&pool, "welcome", "email")
            .await
            .unwrap();
        assert!(welcome.is_some());
    }
}
