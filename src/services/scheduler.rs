//! Background sweepers: scheduled-set promotion, retry promotion, expiry and
//! record TTL, and the daily/weekly digest emission.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;

use crate::db::models::{Channel, Frequency, NotificationType};
use crate::db::repository::{
    BatchRepository, DeliveryRecordRepository, NotificationRepository, QueueRepository,
};
use crate::error::AppResult;
use crate::services::worker;
use crate::AppState;

/// Promote scheduled notifications whose time has arrived into the queue.
pub async fn sweep_scheduled(state: &AppState) -> AppResult<usize> {
    let now = Utc::now().naive_utc();
    let promoted = NotificationRepository::promote_scheduled(&state.db, now).await?;
    for notification in &promoted {
        QueueRepository::enqueue(&state.db, &notification.id, notification.priority, now).await?;
    }
    if !promoted.is_empty() {
        tracing::debug!("Promoted {} scheduled notifications", promoted.len());
    }
    Ok(promoted.len())
}

/// Move records whose `next_retry_at` has arrived back into the queue.
pub async fn sweep_retries(state: &AppState) -> AppResult<usize> {
    let now = Utc::now().naive_utc();
    let due = DeliveryRecordRepository::due_retries(&state.db, now, 100).await?;
    let count = due.len();

    for record in due {
        DeliveryRecordRepository::clear_retry_schedule(&state.db, &record.id).await?;
        if let Some(notification) =
            NotificationRepository::find_by_id(&state.db, &record.notification_id).await?
        {
            // Failed-Retryable -> Queued; a notification cancelled or expired
            // in the meantime stays where it is.
            NotificationRepository::cas_status(
                &state.db,
                &notification.id,
                &[crate::db::models::NotificationStatus::FailedRetryable],
                crate::db::models::NotificationStatus::Queued,
            )
            .await?;
            QueueRepository::enqueue(&state.db, &notification.id, notification.priority, now)
                .await?;
        }
    }

    if count > 0 {
        tracing::debug!("Promoted {} due retries", count);
    }
    Ok(count)
}

/// Expire notifications past their lifetime and purge terminal delivery
/// records past their TTL.
pub async fn sweep_expiry(state: &AppState) -> AppResult<usize> {
    let lifetime = Duration::hours(state.config.retry.max_lifetime_hours);
    let cutoff = Utc::now().naive_utc() - lifetime;

    let expired = NotificationRepository::expire_older_than(&state.db, cutoff).await?;
    for notification in &expired {
        QueueRepository::complete(&state.db, &notification.id).await?;
        DeliveryRecordRepository::clear_retry_for_notification(&state.db, &notification.id)
            .await?;
        state.metrics.increment(
            "notifications_expired",
            &[("channel", notification.channel.as_str())],
            1.0,
        );
    }

    let record_cutoff = Utc::now().naive_utc() - Duration::days(7);
    let purged =
        DeliveryRecordRepository::purge_terminal_older_than(&state.db, record_cutoff).await?;
    if purged > 0 {
        tracing::debug!("Purged {} terminal delivery records", purged);
    }

    Ok(expired.len())
}

/// Remembers which (user, type, channel) buckets already fired on a given
/// user-local date, so a digest is emitted once per due day.
#[derive(Default)]
pub struct DigestGuard {
    fired: HashMap<(String, String, String), NaiveDate>,
}

impl DigestGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn should_fire(&mut self, key: (String, String, String), local_date: NaiveDate) -> bool {
        match self.fired.get(&key) {
            Some(date) if *date == local_date => false,
            _ => {
                self.fired.insert(key, local_date);
                true
            }
        }
    }
}

/// Emit digests for every bucket whose user-local digest time has arrived:
/// daily buckets at `batch_daily_hour`, weekly buckets on `batch_weekly_day`
/// at the same hour.
pub async fn sweep_batches(
    state: &AppState,
    guard: &mut DigestGuard,
    now: DateTime<Utc>,
) -> AppResult<usize> {
    let buckets = BatchRepository::buckets(&state.db).await?;
    let mut emitted = 0usize;

    for bucket in buckets {
        let (ntype, channel) = match (
            NotificationType::parse(&bucket.notification_type),
            Channel::parse(&bucket.channel),
        ) {
            (Some(t), Some(c)) => (t, c),
            _ => continue,
        };

        let pref = crate::db::repository::PreferenceRepository::get_or_default(
            &state.db,
            &bucket.user_id,
            ntype,
            channel,
        )
        .await?;

        let tz: Tz = pref.time_zone.parse().unwrap_or(chrono_tz::UTC);
        let local = now.with_timezone(&tz);

        let due = match pref.frequency() {
            Frequency::Daily => local.hour() == state.config.batching.daily_hour,
            Frequency::Weekly => {
                local.weekday().number_from_monday() == state.config.batching.weekly_day
                    && local.hour() == state.config.batching.daily_hour
            }
            // Preference changed since the entries were deferred; flush the
            // bucket at the next daily boundary rather than stranding it.
            _ => local.hour() == state.config.batching.daily_hour,
        };
        if !due {
            continue;
        }

        let key = (
            bucket.user_id.clone(),
            bucket.notification_type.clone(),
            bucket.channel.clone(),
        );
        if !guard.should_fire(key, local.date_naive()) {
            continue;
        }

        let entries =
            BatchRepository::drain(&state.db, &bucket.user_id, &bucket.notification_type, &bucket.channel)
                .await?;
        let summaries: Vec<String> = entries.into_iter().map(|e| e.summary).collect();

        if worker::synthesize_digest(state, &bucket.user_id, ntype, channel, summaries)
            .await?
            .is_some()
        {
            emitted += 1;
        }
    }

    Ok(emitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::models::{Priority, UpdateUserPreference};
    use crate::db::repository::PreferenceRepository;
    use crate::services::dispatch::testing::ScriptedAdapter;
    use crate::services::dispatch::AdapterRegistry;
    use crate::services::directory::StaticDirectory;
    use crate::services::intake::{self, IntakeRequest};
    use crate::services::limiter::{BreakerRegistry, RateLimiter};
    use crate::services::metrics::MetricsCollector;
    use chrono::TimeZone;
    use std::sync::Arc;

    async fn test_state() -> Arc<AppState> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let config = Config::default();
        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::new(ScriptedAdapter::new(Channel::Email, vec![])));

        Arc::new(AppState {
            db: pool,
            limiter: RateLimiter::new(&config.channels),
            breakers: BreakerRegistry::new(&config.breaker),
            adapters,
            directory: Arc::new(
                StaticDirectory::new().with_contact("u1", Channel::Email, "u1@example.com", None),
            ),
            metrics: MetricsCollector::new(),
            in_app_bus: Arc::new(crate::services::channels::InAppBus::new()),
            config,
        })
    }

    fn request(user: &str) -> IntakeRequest {
        IntakeRequest {
            user_id: user.to_string(),
            notification_type: "message".to_string(),
            channel: "email".to_string(),
            content: Some("hello".to_string()),
            template_id: None,
            variables: None,
            subject: None,
            priority: None,
            scheduled_at: None,
            max_retries: None,
        }
    }

    #[tokio::test]
    async fn scheduled_sweep_promotes_due_notifications() {
        let state = test_state().await;

        let mut req = request("u1");
        req.scheduled_at = Some(Utc::now().naive_utc() - Duration::seconds(1));
        // Force the "pending" path by scheduling slightly in the future, then
        // sweeping after it becomes due.
        let mut future_req = request("u1");
        future_req.scheduled_at = Some(Utc::now().naive_utc() + Duration::hours(1));

        let due = intake::admit(&state.db, &state.config, req).await.unwrap();
        let later = intake::admit(&state.db, &state.config, future_req)
            .await
            .unwrap();
        // A scheduled_at in the past is admitted straight to the queue.
        assert_eq!(due.status, "queued");
        assert_eq!(later.status, "pending");

        assert_eq!(sweep_scheduled(&state).await.unwrap(), 0);

        // Make the future one due by rewriting its schedule.
        sqlx::query("UPDATE notifications SET scheduled_at = ? WHERE id = ?")
            .bind(Utc::now().naive_utc() - Duration::seconds(1))
            .bind(&later.id)
            .execute(&state.db)
            .await
            .unwrap();
        assert_eq!(sweep_scheduled(&state).await.unwrap(), 1);

        let stored = NotificationRepository::find_by_id(&state.db, &later.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "queued");
    }

    #[tokio::test]
    async fn retry_sweep_reenqueues_due_records() {
        let state = test_state().await;
        let n = intake::admit(&state.db, &state.config, request("u1"))
            .await
            .unwrap();
        // Drain the queue row so only the sweeper can bring it back.
        QueueRepository::complete(&state.db, &n.id).await.unwrap();

        let record = DeliveryRecordRepository::get_or_create(
            &state.db,
            &n.id,
            "u1",
            "email",
            "u1@example.com",
        )
        .await
        .unwrap();
        DeliveryRecordRepository::append_attempt(
            &state.db,
            &record.id,
            crate::db::models::CreateAttempt {
                status: "failed".to_string(),
                error_message: Some("503".to_string()),
                response_code: Some(503),
                duration_ms: 5,
            },
            "queued",
            Some("service_unavailable"),
            None,
            Some(Utc::now().naive_utc() - Duration::seconds(1)),
            None,
        )
        .await
        .unwrap();

        assert_eq!(sweep_retries(&state).await.unwrap(), 1);

        // Record's schedule is cleared and the queue row is back.
        let record = DeliveryRecordRepository::find_by_id(&state.db, &record.id)
            .await
            .unwrap()
            .unwrap();
        assert!(record.next_retry_at.is_none());
        let entry = QueueRepository::claim_next(&state.db, 30).await.unwrap();
        assert_eq!(entry.unwrap().notification_id, n.id);

        // Nothing left due.
        assert_eq!(sweep_retries(&state).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expiry_sweep_expires_old_notifications() {
        let state = test_state().await;
        let n = intake::admit(&state.db, &state.config, request("u1"))
            .await
            .unwrap();

        // Age the notification past the lifetime.
        sqlx::query("UPDATE notifications SET created_at = ? WHERE id = ?")
            .bind(Utc::now().naive_utc() - Duration::hours(25))
            .bind(&n.id)
            .execute(&state.db)
            .await
            .unwrap();

        assert_eq!(sweep_expiry(&state).await.unwrap(), 1);
        let stored = NotificationRepository::find_by_id(&state.db, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "expired");
        // Its queue entry is gone too.
        assert!(QueueRepository::claim_next(&state.db, 30).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_sweep_fires_once_at_local_digest_hour() {
        let state = test_state().await;

        PreferenceRepository::upsert(
            &state.db,
            "u1",
            NotificationType::Message,
            Channel::Email,
            UpdateUserPreference {
                frequency: Some(Frequency::Daily),
                time_zone: Some("UTC".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        BatchRepository::append(&state.db, "u1", "message", "email", "first")
            .await
            .unwrap();
        BatchRepository::append(&state.db, "u1", "message", "email", "second")
            .await
            .unwrap();

        let mut guard = DigestGuard::new();

        // 12:00 UTC: not the digest hour (default 0).
        let noon = Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap();
        assert_eq!(sweep_batches(&state, &mut guard, noon).await.unwrap(), 0);

        // Midnight UTC: fires exactly once.
        let midnight = Utc.with_ymd_and_hms(2025, 6, 11, 0, 0, 30).unwrap();
        assert_eq!(sweep_batches(&state, &mut guard, midnight).await.unwrap(), 1);
        assert_eq!(sweep_batches(&state, &mut guard, midnight).await.unwrap(), 0);

        // The digest is queued, flagged, and carries the count.
        let entry = QueueRepository::claim_next(&state.db, 30).await.unwrap().unwrap();
        let digest = NotificationRepository::find_by_id(&state.db, &entry.notification_id)
            .await
            .unwrap()
            .unwrap();
        assert!(digest.is_digest);
        assert_eq!(digest.subject.as_deref(), Some("2 new notifications"));
        assert_eq!(digest.priority, Priority::Normal.rank());
    }

    #[tokio::test]
    async fn weekly_buckets_fire_only_on_configured_weekday() {
        let state = test_state().await;

        PreferenceRepository::upsert(
            &state.db,
            "u1",
            NotificationType::Message,
            Channel::Email,
            UpdateUserPreference {
                frequency: Some(Frequency::Weekly),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        BatchRepository::append(&state.db, "u1", "message", "email", "weekly item")
            .await
            .unwrap();

        let mut guard = DigestGuard::new();

        // 2025-06-10 is a Tuesday; weekly_day default is 1 (Monday).
        let tuesday = Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap();
        assert_eq!(sweep_batches(&state, &mut guard, tuesday).await.unwrap(), 0);

        // 2025-06-09 is a Monday.
        let monday = Utc.with_ymd_and_hms(2025, 6, 9, 0, 0, 0).unwrap();
        assert_eq!(sweep_batches(&state, &mut guard, monday).await.unwrap(), 1);
    }
}
