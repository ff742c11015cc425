//! The delivery engine: workers claim queue entries one at a time and walk a
//! notification through preference check, render, recipient resolution,
//! rate-limit and breaker gates, dispatch, outcome recording and retry
//! scheduling. Every path ends in a recorded state; nothing is silently
//! dropped.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use rand::Rng;

use crate::db::models::{
    Channel, CreateAttempt, CreateNotification, FailureKind, Notification, NotificationStatus,
    NotificationType, Priority, QueueEntry,
};
use crate::db::repository::{
    BatchRepository, DeliveryRecordRepository, NotificationRepository, QueueRepository,
    TemplateRepository,
};
use crate::error::{AppError, AppResult};
use crate::services::dispatch::{DispatchOutcome, DispatchRequest};
use crate::services::preferences::{self, Decision};
use crate::services::render;
use crate::AppState;

/// Long-lived worker loop: claim, process, repeat. Honours the shutdown
/// signal between notifications; an in-flight dispatch finishes or times out
/// at the adapter boundary.
pub async fn run_worker(
    state: Arc<AppState>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
    worker_id: usize,
) {
    tracing::info!(worker_id, "Delivery worker started");
    loop {
        if shutdown.try_recv().is_ok() {
            tracing::info!(worker_id, "Delivery worker shutting down");
            break;
        }

        match process_next(&state).await {
            Ok(true) => continue,
            Ok(false) => {
                // Queue empty: bounded wait before the next poll.
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::info!(worker_id, "Delivery worker shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(StdDuration::from_secs(
                        state.config.workers.queue_poll_seconds,
                    )) => {}
                }
            }
            Err(e) => {
                tracing::warn!(worker_id, "Worker iteration failed: {:?}", e);
                tokio::time::sleep(StdDuration::from_secs(1)).await;
            }
        }
    }
}

/// Claim and process one queue entry. Returns false when the queue is empty.
pub async fn process_next(state: &AppState) -> AppResult<bool> {
    let entry = QueueRepository::claim_next(
        &state.db,
        state.config.workers.aging_threshold_seconds,
    )
    .await?;

    match entry {
        Some(entry) => {
            process_entry(state, entry).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Rendered subject and body for one dispatch.
struct RenderOutput {
    subject: Option<String>,
    body: String,
}

pub async fn process_entry(state: &AppState, entry: QueueEntry) -> AppResult<()> {
    let pool = &state.db;

    let notification = match NotificationRepository::find_by_id(pool, &entry.notification_id).await? {
        Some(n) => n,
        None => {
            tracing::warn!(
                "Queue entry for unknown notification {}; dropping",
                entry.notification_id
            );
            QueueRepository::complete(pool, &entry.notification_id).await?;
            return Ok(());
        }
    };

    // CAS lease: only the worker that moves the status to Sending proceeds.
    let notification = match NotificationRepository::cas_status(
        pool,
        &notification.id,
        &[NotificationStatus::Pending, NotificationStatus::Queued],
        NotificationStatus::Sending,
    )
    .await?
    {
        Some(n) => n,
        None => {
            tracing::debug!(
                "Lost claim on notification {} (already {})",
                notification.id,
                notification.status
            );
            QueueRepository::complete(pool, &notification.id).await?;
            return Ok(());
        }
    };

    let channel = match notification.channel() {
        Some(c) => c,
        None => {
            return finish_final(
                state,
                &notification,
                FailureKind::Unknown,
                "unrecognized channel on stored notification",
            )
            .await
        }
    };
    let ntype = notification
        .notification_type()
        .unwrap_or(NotificationType::System);
    let priority = notification.priority();

    // Preference check. Digests are the output of batching and skip it.
    if !notification.is_digest {
        let decision = preferences::evaluate(
            pool,
            &notification.user_id,
            ntype,
            channel,
            priority,
            Utc::now(),
        )
        .await?;

        match decision {
            Decision::Block { reason } => {
                NotificationRepository::set_status(
                    pool,
                    &notification.id,
                    NotificationStatus::Cancelled,
                    Some(&reason),
                )
                .await?;
                QueueRepository::complete(pool, &notification.id).await?;
                state.metrics.increment(
                    "notifications_blocked",
                    &[("channel", channel.as_str()), ("type", ntype.as_str())],
                    1.0,
                );
                tracing::info!(
                    notification_id = %notification.id,
                    reason = %reason,
                    "Notification blocked by preferences"
                );
                return Ok(());
            }
            Decision::DeferToBatch => {
                return defer_to_batch(state, &notification, ntype, channel).await;
            }
            Decision::Send => {}
        }
    }

    // Render.
    let rendered = match render_notification(state, &notification).await {
        Ok(r) => r,
        Err(AppError::Render(e)) => {
            tracing::warn!(
                notification_id = %notification.id,
                "Render failed: {}",
                e
            );
            return finish_final(
                state,
                &notification,
                FailureKind::InvalidTemplate,
                &e.to_string(),
            )
            .await;
        }
        Err(e) => return Err(e),
    };

    // Recipient resolution via the external user directory.
    let recipient = match state.directory.resolve(&notification.user_id, channel).await {
        Ok(Some(info)) => info.address,
        Ok(None) => {
            return finish_final(
                state,
                &notification,
                FailureKind::InvalidRecipient,
                "no address registered for this channel",
            )
            .await
        }
        Err(e) => {
            // Directory outage is transient; charge the retry budget.
            tracing::warn!("User directory lookup failed: {:?}", e);
            return handle_failure(
                state,
                &notification,
                channel,
                ntype,
                None,
                DispatchOutcome::failed_with_kind(
                    format!("user directory unavailable: {}", e),
                    None,
                    FailureKind::ServiceUnavailable,
                ),
                0,
            )
            .await;
        }
    };

    let record = DeliveryRecordRepository::get_or_create(
        pool,
        &notification.id,
        &notification.user_id,
        channel.as_str(),
        &recipient,
    )
    .await?;

    // Rate-limit gate: refusal defers without touching the retry budget.
    if !state.limiter.try_acquire(channel) {
        let defer_ms = state.config.retry.rate_limited_defer_ms;
        let jitter = rand::thread_rng().gen_range(0..=defer_ms.max(1));
        let available_at = Utc::now().naive_utc() + Duration::milliseconds(defer_ms + jitter);

        NotificationRepository::set_status(
            pool,
            &notification.id,
            NotificationStatus::Queued,
            None,
        )
        .await?;
        DeliveryRecordRepository::set_status(pool, &record.id, "queued").await?;
        QueueRepository::release(pool, &notification.id, available_at).await?;

        state.metrics.increment(
            "rate_limited",
            &[("channel", channel.as_str()), ("type", ntype.as_str())],
            1.0,
        );
        tracing::debug!(
            notification_id = %notification.id,
            "Deferred by local rate limit until {}",
            available_at
        );
        return Ok(());
    }

    DeliveryRecordRepository::set_status(pool, &record.id, "sending").await?;

    // Circuit check: an open breaker is a ServiceUnavailable failure that
    // honours backoff and charges the retry budget.
    let provider = channel.as_str();
    if !state.breakers.allows(provider) {
        return handle_failure(
            state,
            &notification,
            channel,
            ntype,
            Some(&record.id),
            DispatchOutcome::failed_with_kind(
                "circuit breaker open",
                None,
                FailureKind::ServiceUnavailable,
            ),
            0,
        )
        .await;
    }

    // Dispatch under the per-channel timeout.
    let adapter = state
        .adapters
        .get(channel)
        .ok_or_else(|| AppError::Config(format!("no adapter for {}", channel.as_str())))?;

    let request = DispatchRequest {
        notification_id: notification.id.clone(),
        user_id: notification.user_id.clone(),
        channel,
        recipient,
        subject: rendered.subject,
        body: rendered.body,
    };

    let timeout = StdDuration::from_secs(state.config.channels.settings(channel).timeout_seconds);
    let started = std::time::Instant::now();
    let outcome = match tokio::time::timeout(timeout, adapter.send(&request)).await {
        Ok(outcome) => outcome,
        Err(_) => DispatchOutcome::failed_with_kind(
            format!("adapter exceeded {}s timeout", timeout.as_secs()),
            None,
            FailureKind::Timeout,
        ),
    };
    let duration_ms = started.elapsed().as_millis() as i64;

    if outcome.success {
        state.breakers.record_success(provider);
        finish_success(state, &notification, channel, ntype, &record.id, outcome, duration_ms)
            .await
    } else {
        if matches!(
            outcome.failure_kind,
            Some(FailureKind::NetworkError)
                | Some(FailureKind::ServiceUnavailable)
                | Some(FailureKind::Timeout)
        ) {
            state.breakers.record_failure(provider);
        }
        handle_failure(
            state,
            &notification,
            channel,
            ntype,
            Some(&record.id),
            outcome,
            duration_ms,
        )
        .await
    }
}

async fn render_notification(
    state: &AppState,
    notification: &Notification,
) -> AppResult<RenderOutput> {
    match &notification.template_name {
        Some(name) => {
            let template = TemplateRepository::find_by_name(&state.db, name)
                .await?
                .ok_or_else(|| {
                    AppError::Render(render::RenderError::Syntax(format!(
                        "template not found: {}",
                        name
                    )))
                })?;
            let locale = if template.language.is_empty() {
                state.config.locale.default_language.clone()
            } else {
                template.language.clone()
            };
            let rendered =
                render::render_template(&template, &notification.variables_json(), &locale)?;
            Ok(RenderOutput {
                subject: rendered.subject,
                body: rendered.body,
            })
        }
        None => {
            let body = notification.content.clone().ok_or_else(|| {
                AppError::Render(render::RenderError::Syntax(
                    "notification has neither template nor content".to_string(),
                ))
            })?;
            Ok(RenderOutput {
                subject: notification.subject.clone(),
                body,
            })
        }
    }
}

/// Frequency said daily/weekly: record a summary line for the digest and
/// close out the notification as locally sent.
async fn defer_to_batch(
    state: &AppState,
    notification: &Notification,
    ntype: NotificationType,
    channel: Channel,
) -> AppResult<()> {
    let summary = match render_notification(state, notification).await {
        Ok(rendered) => {
            let line = rendered.subject.unwrap_or(rendered.body);
            let trimmed: String = line.chars().take(120).collect();
            trimmed
        }
        Err(_) => format!("{} notification", ntype.as_str()),
    };

    BatchRepository::append(
        &state.db,
        &notification.user_id,
        ntype.as_str(),
        channel.as_str(),
        &summary,
    )
    .await?;

    NotificationRepository::set_status(
        &state.db,
        &notification.id,
        NotificationStatus::Sent,
        Some("deferred to batch"),
    )
    .await?;
    QueueRepository::complete(&state.db, &notification.id).await?;

    state.metrics.increment(
        "notifications_batched",
        &[("channel", channel.as_str()), ("type", ntype.as_str())],
        1.0,
    );
    Ok(())
}

async fn finish_success(
    state: &AppState,
    notification: &Notification,
    channel: Channel,
    ntype: NotificationType,
    record_id: &str,
    outcome: DispatchOutcome,
    duration_ms: i64,
) -> AppResult<()> {
    let pool = &state.db;
    let now = Utc::now().naive_utc();

    // In-app delivery is confirmed the moment the inbox write lands; other
    // channels wait for the provider's delivery receipt.
    let instant_delivery = channel == Channel::InApp;
    let (record_status, delivered_at) = if instant_delivery {
        ("delivered", Some(now))
    } else {
        ("sent", None)
    };

    DeliveryRecordRepository::append_attempt(
        pool,
        record_id,
        CreateAttempt {
            status: "sent".to_string(),
            error_message: None,
            response_code: outcome.response_code.map(|c| c as i32),
            duration_ms,
        },
        record_status,
        None,
        outcome.provider_delivery_id.as_deref(),
        None,
        delivered_at,
    )
    .await?;

    let status = if instant_delivery {
        NotificationStatus::Delivered
    } else {
        NotificationStatus::Sent
    };
    NotificationRepository::set_status(pool, &notification.id, status, None).await?;
    QueueRepository::complete(pool, &notification.id).await?;

    let bucket = crate::services::metrics::user_bucket(&notification.user_id);
    let labels = [
        ("bucket", bucket.as_str()),
        ("channel", channel.as_str()),
        ("type", ntype.as_str()),
    ];
    state.metrics.increment("notifications_sent", &labels, 1.0);
    if instant_delivery {
        state.metrics.increment("notifications_delivered", &labels, 1.0);
    }
    state.metrics.timer("delivery_time_ms", &labels, duration_ms as f64);

    tracing::info!(
        notification_id = %notification.id,
        channel = %channel.as_str(),
        duration_ms,
        "Dispatch succeeded"
    );
    Ok(())
}

/// Failed dispatch: classify, then retry with backoff or finish terminally.
async fn handle_failure(
    state: &AppState,
    notification: &Notification,
    channel: Channel,
    ntype: NotificationType,
    record_id: Option<&str>,
    outcome: DispatchOutcome,
    duration_ms: i64,
) -> AppResult<()> {
    let pool = &state.db;
    let now = Utc::now().naive_utc();
    let kind = outcome.failure_kind.unwrap_or(FailureKind::Unknown);
    let message = outcome
        .error_message
        .unwrap_or_else(|| "unclassified failure".to_string());

    let age = now - notification.created_at;
    let within_lifetime = age < Duration::hours(state.config.retry.max_lifetime_hours);
    let retryable =
        kind.is_retryable() && notification.retry_count < notification.max_retries && within_lifetime;

    let bucket = crate::services::metrics::user_bucket(&notification.user_id);
    let labels = [
        ("bucket", bucket.as_str()),
        ("channel", channel.as_str()),
        ("type", ntype.as_str()),
    ];

    if retryable {
        let updated = NotificationRepository::register_retry(pool, &notification.id).await?;
        let mut delay = backoff_delay(&state.config.retry, updated.retry_count);
        if kind == FailureKind::QuotaExceeded {
            delay = delay.max(Duration::seconds(state.config.retry.quota_defer_seconds));
        }
        let next_retry_at = now + delay;

        match record_id {
            Some(record_id) => {
                DeliveryRecordRepository::append_attempt(
                    pool,
                    record_id,
                    CreateAttempt {
                        status: "failed".to_string(),
                        error_message: Some(message.clone()),
                        response_code: outcome.response_code.map(|c| c as i32),
                        duration_ms,
                    },
                    "queued",
                    Some(kind.as_str()),
                    None,
                    Some(next_retry_at),
                    None,
                )
                .await?;
                // The retry sweeper re-enqueues once next_retry_at arrives.
                QueueRepository::complete(pool, &notification.id).await?;
            }
            None => {
                // No record yet (failure before dispatch): keep the queue
                // entry, defer it directly and stay claimable.
                NotificationRepository::set_status(
                    pool,
                    &notification.id,
                    NotificationStatus::Queued,
                    None,
                )
                .await?;
                QueueRepository::release(pool, &notification.id, next_retry_at).await?;
            }
        }
        state.metrics.increment("notifications_retried", &labels, 1.0);

        tracing::info!(
            notification_id = %notification.id,
            kind = %kind.as_str(),
            retry_count = updated.retry_count,
            "Dispatch failed, retry scheduled at {}",
            next_retry_at
        );
        return Ok(());
    }

    if let Some(record_id) = record_id {
        DeliveryRecordRepository::append_attempt(
            pool,
            record_id,
            CreateAttempt {
                status: "failed".to_string(),
                error_message: Some(message.clone()),
                response_code: outcome.response_code.map(|c| c as i32),
                duration_ms,
            },
            "failed",
            Some(kind.as_str()),
            None,
            None,
            None,
        )
        .await?;
    }

    finish_final_with_labels(state, notification, kind, &message, &labels).await
}

async fn finish_final(
    state: &AppState,
    notification: &Notification,
    kind: FailureKind,
    message: &str,
) -> AppResult<()> {
    let channel = notification.channel.clone();
    let ntype = notification.notification_type.clone();
    let labels = [("channel", channel.as_str()), ("type", ntype.as_str())];
    finish_final_with_labels(state, notification, kind, message, &labels).await
}

async fn finish_final_with_labels(
    state: &AppState,
    notification: &Notification,
    kind: FailureKind,
    message: &str,
    labels: &[(&str, &str)],
) -> AppResult<()> {
    NotificationRepository::set_status(
        &state.db,
        &notification.id,
        NotificationStatus::FailedFinal,
        Some(&format!("{}: {}", kind.as_str(), message)),
    )
    .await?;
    QueueRepository::complete(&state.db, &notification.id).await?;
    state.metrics.increment("notifications_failed", labels, 1.0);

    tracing::warn!(
        notification_id = %notification.id,
        kind = %kind.as_str(),
        "Notification terminally failed: {}",
        message
    );
    Ok(())
}

/// Deterministic backoff: delays indexed by retry_count - 1, clamped to the
/// last entry.
pub fn backoff_delay(config: &crate::config::RetryConfig, retry_count: i32) -> Duration {
    let idx = ((retry_count - 1).max(0) as usize).min(config.delays_seconds.len() - 1);
    Duration::seconds(config.delays_seconds[idx])
}

/// Manual retry of a terminally failed notification (operator API).
pub async fn manual_retry(state: &AppState, notification_id: &str) -> AppResult<Notification> {
    let notification = NotificationRepository::find_by_id(&state.db, notification_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Notification not found: {}", notification_id)))?;

    match notification.status() {
        Some(NotificationStatus::FailedFinal) | Some(NotificationStatus::Expired) => {}
        _ => {
            return Err(AppError::Conflict(format!(
                "notification is {} and cannot be retried",
                notification.status
            )))
        }
    }

    NotificationRepository::set_status(
        &state.db,
        notification_id,
        NotificationStatus::Queued,
        Some("manual retry"),
    )
    .await?;
    QueueRepository::enqueue(
        &state.db,
        notification_id,
        notification.priority,
        Utc::now().naive_utc(),
    )
    .await?;

    NotificationRepository::find_by_id(&state.db, notification_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Notification disappeared".to_string()))
}

/// Synthesize one digest notification from a drained batch bucket.
pub async fn synthesize_digest(
    state: &AppState,
    user_id: &str,
    ntype: NotificationType,
    channel: Channel,
    summaries: Vec<String>,
) -> AppResult<Option<Notification>> {
    if summaries.is_empty() {
        return Ok(None);
    }
    let total = summaries.len();
    let max = state.config.batching.max_summaries;
    let lines: Vec<&String> = summaries.iter().take(max).collect();

    let mut body = String::new();
    for line in &lines {
        body.push_str("- ");
        body.push_str(line);
        body.push('\n');
    }

    let notification = NotificationRepository::create(
        &state.db,
        CreateNotification {
            user_id: user_id.to_string(),
            notification_type: ntype,
            channel,
            priority: Priority::Normal,
            subject: Some(format!("{} new notifications", total)),
            content: Some(body),
            template_name: None,
            variables: serde_json::json!({}),
            scheduled_at: None,
            max_retries: state.config.channels.settings(channel).max_retries,
            is_digest: true,
        },
    )
    .await?;

    QueueRepository::enqueue(
        &state.db,
        &notification.id,
        notification.priority,
        Utc::now().naive_utc(),
    )
    .await?;

    tracing::info!(
        user_id,
        count = total,
        channel = %channel.as_str(),
        "Digest notification synthesized"
    );
    Ok(Some(notification))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::models::UpdateUserPreference;
    use crate::db::repository::PreferenceRepository;
    use crate::services::dispatch::testing::ScriptedAdapter;
    use crate::services::dispatch::AdapterRegistry;
    use crate::services::directory::StaticDirectory;
    use crate::services::intake::{self, IntakeRequest};
    use crate::services::limiter::{BreakerRegistry, RateLimiter};
    use crate::services::metrics::MetricsCollector;

    async fn state_with(
        adapter: Arc<ScriptedAdapter>,
        config: Config,
    ) -> (Arc<AppState>, Arc<ScriptedAdapter>) {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let mut adapters = AdapterRegistry::new();
        adapters.register(adapter.clone());

        let directory = StaticDirectory::new()
            .with_contact("u1", Channel::Email, "u1@example.com", None)
            .with_contact("u2", Channel::Sms, "+100200300", None)
            .with_contact("u4", Channel::Sms, "+400500600", None);

        let state = Arc::new(AppState {
            db: pool,
            limiter: RateLimiter::new(&config.channels),
            breakers: BreakerRegistry::new(&config.breaker),
            adapters,
            directory: Arc::new(directory),
            metrics: MetricsCollector::new(),
            in_app_bus: Arc::new(crate::services::channels::InAppBus::new()),
            config,
        });
        (state, adapter)
    }

    fn email_request(user: &str) -> IntakeRequest {
        IntakeRequest {
            user_id: user.to_string(),
            notification_type: "message".to_string(),
            channel: "email".to_string(),
            content: Some("hello".to_string()),
            template_id: None,
            variables: None,
            subject: Some("hi".to_string()),
            priority: None,
            scheduled_at: None,
            max_retries: None,
        }
    }

    /// Promote a scheduled retry as the sweeper would, ignoring the delay.
    async fn force_retry_promotion(state: &AppState, notification_id: &str) {
        let records = DeliveryRecordRepository::find_by_notification(&state.db, notification_id)
            .await
            .unwrap();
        for record in records {
            if record.next_retry_at.is_some() {
                DeliveryRecordRepository::clear_retry_schedule(&state.db, &record.id)
                    .await
                    .unwrap();
            }
        }
        let n = NotificationRepository::find_by_id(&state.db, notification_id)
            .await
            .unwrap()
            .unwrap();
        NotificationRepository::cas_status(
            &state.db,
            notification_id,
            &[NotificationStatus::FailedRetryable],
            NotificationStatus::Queued,
        )
        .await
        .unwrap();
        QueueRepository::enqueue(&state.db, notification_id, n.priority, Utc::now().naive_utc())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn successful_email_dispatch_reaches_sent_with_one_attempt() {
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Email, vec![]));
        let (state, adapter) = state_with(adapter, Config::default()).await;

        let n = intake::admit(&state.db, &state.config, email_request("u1"))
            .await
            .unwrap();
        assert!(process_next(&state).await.unwrap());

        let n = NotificationRepository::find_by_id(&state.db, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n.status, "sent");
        assert_eq!(adapter.sent_count(), 1);

        let records = DeliveryRecordRepository::find_by_notification(&state.db, &n.id)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, "sent");
        assert_eq!(records[0].recipient_address, "u1@example.com");

        let attempts = DeliveryRecordRepository::attempts(&state.db, &records[0].id)
            .await
            .unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, "sent");
    }

    #[tokio::test]
    async fn provider_429_twice_then_success_retries_with_backoff() {
        let adapter = Arc::new(ScriptedAdapter::new(
            Channel::Sms,
            vec![
                DispatchOutcome::failed("HTTP 429 too many requests", Some(429)),
                DispatchOutcome::failed("HTTP 429 too many requests", Some(429)),
            ],
        ));
        let (state, adapter) = state_with(adapter, Config::default()).await;

        let mut req = email_request("u2");
        req.channel = "sms".to_string();
        req.subject = None;
        let n = intake::admit(&state.db, &state.config, req).await.unwrap();

        // First attempt: 429, retry scheduled at >= +60s.
        assert!(process_next(&state).await.unwrap());
        let stored = NotificationRepository::find_by_id(&state.db, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "failed_retryable");
        assert_eq!(stored.retry_count, 1);
        let record = &DeliveryRecordRepository::find_by_notification(&state.db, &n.id)
            .await
            .unwrap()[0];
        let gap = record.next_retry_at.unwrap() - record.updated_at;
        assert!(gap >= Duration::seconds(59));

        // Second attempt: 429 again, backoff >= 300s.
        force_retry_promotion(&state, &n.id).await;
        assert!(process_next(&state).await.unwrap());
        let stored = NotificationRepository::find_by_id(&state.db, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.retry_count, 2);
        let record = &DeliveryRecordRepository::find_by_notification(&state.db, &n.id)
            .await
            .unwrap()[0];
        let gap = record.next_retry_at.unwrap() - record.updated_at;
        assert!(gap >= Duration::seconds(299));

        // Third attempt succeeds.
        force_retry_promotion(&state, &n.id).await;
        assert!(process_next(&state).await.unwrap());
        let stored = NotificationRepository::find_by_id(&state.db, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "sent");
        assert_eq!(stored.retry_count, 2);

        let record = &DeliveryRecordRepository::find_by_notification(&state.db, &n.id)
            .await
            .unwrap()[0];
        let attempts = DeliveryRecordRepository::attempts(&state.db, &record.id)
            .await
            .unwrap();
        assert_eq!(attempts.len(), 3);
        assert_eq!(adapter.sent_count(), 3);
    }

    #[tokio::test]
    async fn marketing_without_preference_cancelled_without_dispatch() {
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Email, vec![]));
        let (state, adapter) = state_with(adapter, Config::default()).await;

        let mut req = email_request("u3");
        req.notification_type = "marketing".to_string();
        let n = intake::admit(&state.db, &state.config, req).await.unwrap();
        assert!(process_next(&state).await.unwrap());

        let stored = NotificationRepository::find_by_id(&state.db, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "cancelled");
        assert_eq!(stored.status_reason.as_deref(), Some("disabled by default"));
        assert_eq!(adapter.sent_count(), 0);
    }

    #[tokio::test]
    async fn user_disabled_preference_cancels_with_reason() {
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Email, vec![]));
        let (state, adapter) = state_with(adapter, Config::default()).await;

        PreferenceRepository::upsert(
            &state.db,
            "u1",
            NotificationType::Message,
            Channel::Email,
            UpdateUserPreference {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let n = intake::admit(&state.db, &state.config, email_request("u1"))
            .await
            .unwrap();
        assert!(process_next(&state).await.unwrap());

        let stored = NotificationRepository::find_by_id(&state.db, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "cancelled");
        assert_eq!(stored.status_reason.as_deref(), Some("disabled by user"));
        assert_eq!(adapter.sent_count(), 0);
    }

    #[tokio::test]
    async fn urgent_bypasses_quiet_hours() {
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Sms, vec![]));
        let (state, adapter) = state_with(adapter, Config::default()).await;

        // Quiet hours covering the entire day.
        PreferenceRepository::upsert(
            &state.db,
            "u4",
            NotificationType::Security,
            Channel::Sms,
            UpdateUserPreference {
                quiet_start: Some("00:00".to_string()),
                quiet_end: Some("23:59".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let mut req = email_request("u4");
        req.notification_type = "security".to_string();
        req.channel = "sms".to_string();
        req.subject = None;
        req.priority = Some("urgent".to_string());
        let n = intake::admit(&state.db, &state.config, req).await.unwrap();
        assert!(process_next(&state).await.unwrap());

        let stored = NotificationRepository::find_by_id(&state.db, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "sent");
        assert_eq!(adapter.sent_count(), 1);
    }

    #[tokio::test]
    async fn missing_address_is_invalid_recipient() {
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Email, vec![]));
        let (state, adapter) = state_with(adapter, Config::default()).await;

        // u9 has no directory entry.
        let n = intake::admit(&state.db, &state.config, email_request("u9"))
            .await
            .unwrap();
        assert!(process_next(&state).await.unwrap());

        let stored = NotificationRepository::find_by_id(&state.db, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "failed_final");
        assert!(stored
            .status_reason
            .unwrap()
            .starts_with("invalid_recipient"));
        assert_eq!(adapter.sent_count(), 0);
    }

    #[tokio::test]
    async fn render_failure_is_invalid_template() {
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Email, vec![]));
        let (state, adapter) = state_with(adapter, Config::default()).await;

        let mut req = email_request("u1");
        req.content = None;
        req.subject = None;
        req.template_id = Some("welcome_email".to_string());
        // Missing the required `name` variable.
        req.variables = Some(serde_json::json!({"joined_at": "2025-06-01"}));
        let n = intake::admit(&state.db, &state.config, req).await.unwrap();
        assert!(process_next(&state).await.unwrap());

        let stored = NotificationRepository::find_by_id(&state.db, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "failed_final");
        assert!(stored
            .status_reason
            .unwrap()
            .starts_with("invalid_template"));
        assert_eq!(adapter.sent_count(), 0);
    }

    #[tokio::test]
    async fn open_breaker_requeues_as_service_unavailable() {
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Email, vec![]));
        let (state, adapter) = state_with(adapter, Config::default()).await;

        // Trip the breaker.
        for _ in 0..state.config.breaker.failure_threshold {
            state.breakers.record_failure("email");
        }

        let n = intake::admit(&state.db, &state.config, email_request("u1"))
            .await
            .unwrap();
        assert!(process_next(&state).await.unwrap());

        let stored = NotificationRepository::find_by_id(&state.db, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "failed_retryable");
        assert_eq!(stored.retry_count, 1);
        assert_eq!(adapter.sent_count(), 0);

        let record = &DeliveryRecordRepository::find_by_notification(&state.db, &n.id)
            .await
            .unwrap()[0];
        assert_eq!(record.failure_kind.as_deref(), Some("service_unavailable"));
    }

    #[tokio::test]
    async fn consecutive_500s_open_the_breaker() {
        let outcomes = (0..5)
            .map(|_| DispatchOutcome::failed("HTTP 500 internal error", Some(500)))
            .collect();
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Email, outcomes));
        let (state, adapter) = state_with(adapter, Config::default()).await;

        for i in 0..5 {
            let n = intake::admit(
                &state.db,
                &state.config,
                email_request("u1"),
            )
            .await;
            // Each admission is a distinct notification.
            assert!(n.is_ok(), "admission {} failed", i);
            assert!(process_next(&state).await.unwrap());
        }
        assert_eq!(adapter.sent_count(), 5);
        assert_eq!(
            state.breakers.state("email"),
            crate::services::limiter::BreakerState::Open
        );

        // Subsequent dispatches are refused without touching the adapter.
        intake::admit(&state.db, &state.config, email_request("u1"))
            .await
            .unwrap();
        assert!(process_next(&state).await.unwrap());
        assert_eq!(adapter.sent_count(), 5);
    }

    #[tokio::test]
    async fn local_rate_limit_defers_without_charging_budget() {
        let mut config = Config::default();
        config.channels.email.burst = 0;
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Email, vec![]));
        let (state, adapter) = state_with(adapter, config).await;

        let n = intake::admit(&state.db, &state.config, email_request("u1"))
            .await
            .unwrap();
        assert!(process_next(&state).await.unwrap());

        let stored = NotificationRepository::find_by_id(&state.db, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "queued");
        assert_eq!(stored.retry_count, 0);
        assert_eq!(adapter.sent_count(), 0);

        // The queue row is still present, deferred a few hundred ms out.
        let depth = QueueRepository::depth_by_priority(&state.db).await.unwrap();
        assert_eq!(depth.iter().map(|(_, c)| c).sum::<i64>(), 1);
    }

    #[tokio::test]
    async fn zero_max_retries_fails_final_on_first_retryable_failure() {
        let adapter = Arc::new(ScriptedAdapter::new(
            Channel::Email,
            vec![DispatchOutcome::failed("HTTP 503", Some(503))],
        ));
        let (state, _) = state_with(adapter, Config::default()).await;

        let mut req = email_request("u1");
        req.max_retries = Some(0);
        let n = intake::admit(&state.db, &state.config, req).await.unwrap();
        assert!(process_next(&state).await.unwrap());

        let stored = NotificationRepository::find_by_id(&state.db, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "failed_final");
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_terminal() {
        let adapter = Arc::new(ScriptedAdapter::new(
            Channel::Email,
            vec![DispatchOutcome::failed("unauthorized api key", Some(401))],
        ));
        let (state, _) = state_with(adapter, Config::default()).await;

        let n = intake::admit(&state.db, &state.config, email_request("u1"))
            .await
            .unwrap();
        assert!(process_next(&state).await.unwrap());

        let stored = NotificationRepository::find_by_id(&state.db, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "failed_final");
        assert!(stored
            .status_reason
            .unwrap()
            .starts_with("authentication_failed"));
    }

    #[tokio::test]
    async fn retry_budget_is_never_exceeded() {
        let outcomes = (0..10)
            .map(|_| DispatchOutcome::failed("HTTP 503", Some(503)))
            .collect();
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Email, outcomes));
        let (state, _) = state_with(adapter, Config::default()).await;

        let n = intake::admit(&state.db, &state.config, email_request("u1"))
            .await
            .unwrap();

        for _ in 0..10 {
            if !process_next(&state).await.unwrap() {
                force_retry_promotion(&state, &n.id).await;
                continue;
            }
            let stored = NotificationRepository::find_by_id(&state.db, &n.id)
                .await
                .unwrap()
                .unwrap();
            assert!(stored.retry_count <= stored.max_retries);
            if stored.status == "failed_final" {
                break;
            }
        }

        let stored = NotificationRepository::find_by_id(&state.db, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "failed_final");
        assert_eq!(stored.retry_count, stored.max_retries);
    }

    #[tokio::test]
    async fn daily_frequency_defers_to_batch() {
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Email, vec![]));
        let (state, adapter) = state_with(adapter, Config::default()).await;

        PreferenceRepository::upsert(
            &state.db,
            "u1",
            NotificationType::Message,
            Channel::Email,
            UpdateUserPreference {
                frequency: Some(crate::db::models::Frequency::Daily),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let n = intake::admit(&state.db, &state.config, email_request("u1"))
            .await
            .unwrap();
        assert!(process_next(&state).await.unwrap());

        let stored = NotificationRepository::find_by_id(&state.db, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "sent");
        assert_eq!(stored.status_reason.as_deref(), Some("deferred to batch"));
        assert_eq!(adapter.sent_count(), 0);

        let buckets = BatchRepository::buckets(&state.db).await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].entry_count, 1);
    }

    #[tokio::test]
    async fn digest_notification_skips_frequency_rules() {
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Email, vec![]));
        let (state, adapter) = state_with(adapter, Config::default()).await;

        PreferenceRepository::upsert(
            &state.db,
            "u1",
            NotificationType::Message,
            Channel::Email,
            UpdateUserPreference {
                frequency: Some(crate::db::models::Frequency::Daily),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let digest = synthesize_digest(
            &state,
            "u1",
            NotificationType::Message,
            Channel::Email,
            vec!["line one".to_string(), "line two".to_string()],
        )
        .await
        .unwrap()
        .unwrap();

        assert!(process_next(&state).await.unwrap());
        let stored = NotificationRepository::find_by_id(&state.db, &digest.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "sent");
        assert_eq!(adapter.sent_count(), 1);

        let request = &adapter.sent.lock().unwrap()[0];
        assert_eq!(request.subject.as_deref(), Some("2 new notifications"));
        assert!(request.body.contains("line one"));
    }

    #[tokio::test]
    async fn manual_retry_requires_terminal_failure() {
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Email, vec![]));
        let (state, _) = state_with(adapter, Config::default()).await;

        let n = intake::admit(&state.db, &state.config, email_request("u1"))
            .await
            .unwrap();
        // Still queued: conflict.
        assert!(matches!(
            manual_retry(&state, &n.id).await,
            Err(AppError::Conflict(_))
        ));

        NotificationRepository::set_status(
            &state.db,
            &n.id,
            NotificationStatus::FailedFinal,
            None,
        )
        .await
        .unwrap();
        QueueRepository::complete(&state.db, &n.id).await.unwrap();

        let retried = manual_retry(&state, &n.id).await.unwrap();
        assert_eq!(retried.status, "queued");
    }

    #[test]
    fn backoff_table_clamps() {
        let config = Config::default();
        assert_eq!(backoff_delay(&config.retry, 1), Duration::seconds(60));
        assert_eq!(backoff_delay(&config.retry, 2), Duration::seconds(300));
        assert_eq!(backoff_delay(&config.retry, 3), Duration::seconds(900));
        assert_eq!(backoff_delay(&config.retry, 4), Duration::seconds(1800));
        assert_eq!(backoff_delay(&config.retry, 5), Duration::seconds(3600));
        assert_eq!(backoff_delay(&config.retry, 99), Duration::seconds(3600));
    }
}
