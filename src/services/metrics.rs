//! In-process metric collection and the analytics read-side.
//!
//! Workers append points to a buffer; a flush task drains it every
//! `metric_flush_interval` seconds and writes one batched transaction into
//! the tiered rollups. Derived quantities (rates, percentiles, engagement and
//! channel scores) are computed on read, never stored.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use chrono::{NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::db::models::{label_string, MetricKind};
use crate::db::repository::{FlushPoint, Granularity, MetricRepository};
use crate::error::AppResult;

#[derive(Debug, Clone)]
struct MetricPoint {
    metric: String,
    labels: String,
    kind: MetricKind,
    value: f64,
    at: NaiveDateTime,
}

/// Buffered, thread-safe collector shared by every worker.
pub struct MetricsCollector {
    buffer: Mutex<Vec<MetricPoint>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn increment(&self, metric: &str, labels: &[(&str, &str)], value: f64) {
        self.push(metric, labels, MetricKind::Counter, value);
    }

    pub fn gauge(&self, metric: &str, labels: &[(&str, &str)], value: f64) {
        self.push(metric, labels, MetricKind::Gauge, value);
    }

    pub fn histogram(&self, metric: &str, labels: &[(&str, &str)], value: f64) {
        self.push(metric, labels, MetricKind::Histogram, value);
    }

    pub fn timer(&self, metric: &str, labels: &[(&str, &str)], duration_ms: f64) {
        self.push(metric, labels, MetricKind::Timer, duration_ms);
    }

    fn push(&self, metric: &str, labels: &[(&str, &str)], kind: MetricKind, value: f64) {
        let point = MetricPoint {
            metric: metric.to_string(),
            labels: label_string(labels),
            kind,
            value,
            at: Utc::now().naive_utc(),
        };
        self.buffer.lock().expect("metric buffer poisoned").push(point);
    }

    pub fn pending(&self) -> usize {
        self.buffer.lock().expect("metric buffer poisoned").len()
    }

    /// Drain the buffer, aggregate per (metric, labels, minute) and persist
    /// in one transaction. Called periodically and once more at shutdown so
    /// no unflushed points are lost.
    pub async fn flush(&self, pool: &SqlitePool) -> AppResult<usize> {
        let drained: Vec<MetricPoint> = {
            let mut buffer = self.buffer.lock().expect("metric buffer poisoned");
            std::mem::take(&mut *buffer)
        };
        if drained.is_empty() {
            return Ok(0);
        }
        let count = drained.len();

        let mut grouped: HashMap<(String, String, NaiveDateTime), FlushPoint> = HashMap::new();
        for point in drained {
            let bucket = Granularity::Minute.bucket_of(point.at);
            let entry = grouped
                .entry((point.metric.clone(), point.labels.clone(), bucket))
                .or_insert_with(|| FlushPoint {
                    metric: point.metric.clone(),
                    labels: point.labels.clone(),
                    kind: point.kind,
                    bucket,
                    value: 0.0,
                    samples: Vec::new(),
                });

            match point.kind {
                MetricKind::Counter => entry.value += point.value,
                MetricKind::Gauge => entry.value = point.value,
                MetricKind::Histogram | MetricKind::Timer => {
                    entry.value += point.value;
                    entry.samples.push(point.value);
                }
            }
        }

        let points: Vec<FlushPoint> = grouped.into_values().collect();
        MetricRepository::record_batch(pool, &points).await?;
        Ok(count)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded-cardinality bucket for the user-id label.
pub fn user_bucket(user_id: &str) -> String {
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    format!("{:02}", hasher.finish() % 16)
}

// ---------------------------------------------------------------------------
// Derived quantities
// ---------------------------------------------------------------------------

/// Engagement score from time-to-read. Interval boundaries belong to the
/// lower interval: exactly one minute scores 100, exactly ten minutes uses
/// the middle formula.
pub fn engagement_score(time_to_read_ms: f64) -> f64 {
    let minutes = time_to_read_ms / 60_000.0;
    if minutes <= 1.0 {
        100.0
    } else if minutes <= 10.0 {
        (100.0 - (minutes - 1.0) * 5.5).max(50.0)
    } else {
        (50.0 - (minutes - 10.0) * 2.0).max(10.0)
    }
}

/// Weighted channel health: 50% delivery rate, 30% read rate, 20% speed.
pub fn channel_score(delivery_rate: f64, read_rate: f64, avg_delivery_time_ms: f64) -> f64 {
    let speed_score = (100.0 - avg_delivery_time_ms / 1000.0).max(0.0);
    let score = delivery_rate * 0.5 + read_rate * 0.3 + speed_score * 0.2;
    (score * 100.0).round() / 100.0
}

/// Index-based percentile over a sample list, clamped to the last element.
pub fn percentile(values: &[f64], p: u8) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let index = ((p as f64 / 100.0) * sorted.len() as f64) as usize;
    sorted[index.min(sorted.len() - 1)]
}

fn rate(numerator: f64, denominator: f64) -> f64 {
    if denominator <= 0.0 {
        0.0
    } else {
        (numerator / denominator * 100.0 * 100.0).round() / 100.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub channel: String,
    pub sent: f64,
    pub delivered: f64,
    pub failed: f64,
    pub read: f64,
    pub delivery_rate: f64,
    pub read_rate: f64,
    pub failure_rate: f64,
    pub avg_delivery_time_ms: f64,
    pub p95_delivery_time_ms: f64,
    pub channel_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSummary {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub total_sent: f64,
    pub total_delivered: f64,
    pub total_failed: f64,
    pub total_read: f64,
    pub total_blocked: f64,
    pub total_rate_limited: f64,
    pub delivery_rate: f64,
    pub read_rate: f64,
    pub failure_rate: f64,
    pub by_channel: Vec<ChannelStats>,
}

/// Analytics rollup over an interval, optionally narrowed to one channel.
/// The granularity follows the interval span (§ tier selection); queries
/// spanning prefix boundaries are plain range scans, so adjacent ranges
/// aggregate naturally.
pub async fn summarize(
    pool: &SqlitePool,
    start: NaiveDateTime,
    end: NaiveDateTime,
    channel: Option<&str>,
) -> AppResult<AnalyticsSummary> {
    let channel_filter = channel.map(|c| format!("channel:{}", c));
    let filter = channel_filter.as_deref();

    let total_sent =
        MetricRepository::sum_counter_like(pool, "notifications_sent", filter, start, end).await?;
    let total_delivered =
        MetricRepository::sum_counter_like(pool, "notifications_delivered", filter, start, end)
            .await?;
    let total_failed =
        MetricRepository::sum_counter_like(pool, "notifications_failed", filter, start, end)
            .await?;
    let total_read =
        MetricRepository::sum_counter_like(pool, "notifications_read", filter, start, end).await?;
    let total_blocked =
        MetricRepository::sum_counter_like(pool, "notifications_blocked", filter, start, end)
            .await?;
    let total_rate_limited =
        MetricRepository::sum_counter_like(pool, "rate_limited", filter, start, end).await?;

    let channels: Vec<&str> = match channel {
        Some(c) => vec![c],
        None => vec!["email", "sms", "push", "in_app", "webhook"],
    };

    let mut by_channel = Vec::new();
    for ch in channels {
        let f = format!("channel:{}", ch);
        let sent =
            MetricRepository::sum_counter_like(pool, "notifications_sent", Some(&f), start, end)
                .await?;
        if sent == 0.0 {
            continue;
        }
        let delivered = MetricRepository::sum_counter_like(
            pool,
            "notifications_delivered",
            Some(&f),
            start,
            end,
        )
        .await?;
        let failed =
            MetricRepository::sum_counter_like(pool, "notifications_failed", Some(&f), start, end)
                .await?;
        let read =
            MetricRepository::sum_counter_like(pool, "notifications_read", Some(&f), start, end)
                .await?;

        let (sum, count) =
            MetricRepository::sample_stats_like(pool, "delivery_time_ms", Some(&f), start, end)
                .await?;
        let avg = if count > 0 { sum / count as f64 } else { 0.0 };
        let samples =
            MetricRepository::samples_like(pool, "delivery_time_ms", Some(&f), start, end).await?;

        let delivery_rate = rate(delivered, sent);
        let read_rate = rate(read, delivered);
        by_channel.push(ChannelStats {
            channel: ch.to_string(),
            sent,
            delivered,
            failed,
            read,
            delivery_rate,
            read_rate,
            failure_rate: rate(failed, sent),
            avg_delivery_time_ms: avg,
            p95_delivery_time_ms: percentile(&samples, 95),
            channel_score: channel_score(delivery_rate, read_rate, avg),
        });
    }

    Ok(AnalyticsSummary {
        start,
        end,
        total_sent,
        total_delivered,
        total_failed,
        total_read,
        total_blocked,
        total_rate_limited,
        delivery_rate: rate(total_delivered, total_sent),
        read_rate: rate(total_read, total_delivered),
        failure_rate: rate(total_failed, total_sent),
        by_channel,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engagement_score_intervals() {
        assert_eq!(engagement_score(30_000.0), 100.0);
        // Exactly one minute: lower interval, still 100.
        assert_eq!(engagement_score(60_000.0), 100.0);
        // Five minutes: 100 - 4 * 5.5 = 78.
        assert_eq!(engagement_score(5.0 * 60_000.0), 78.0);
        // Exactly ten minutes: middle formula, 100 - 9 * 5.5 = 50.5.
        assert_eq!(engagement_score(10.0 * 60_000.0), 50.5);
        // Fifteen minutes: 50 - 5 * 2 = 40.
        assert_eq!(engagement_score(15.0 * 60_000.0), 40.0);
        // Floor of 10 far out.
        assert_eq!(engagement_score(120.0 * 60_000.0), 10.0);
    }

    #[test]
    fn channel_score_weighting() {
        // Perfect channel: 100 * 0.5 + 100 * 0.3 + 100 * 0.2.
        assert_eq!(channel_score(100.0, 100.0, 0.0), 100.0);
        // Slow delivery eats the speed component.
        assert_eq!(channel_score(100.0, 100.0, 100_000.0), 80.0);
        // Speed component clamps at zero, never negative.
        assert_eq!(channel_score(0.0, 0.0, 1_000_000.0), 0.0);
    }

    #[test]
    fn percentile_index_formula() {
        let values = vec![10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&values, 50), 30.0);
        assert_eq!(percentile(&values, 95), 40.0);
        assert_eq!(percentile(&values, 100), 40.0);
        assert_eq!(percentile(&values, 0), 10.0);
        assert_eq!(percentile(&[], 95), 0.0);
    }

    #[test]
    fn user_bucket_is_stable_and_bounded() {
        assert_eq!(user_bucket("u1"), user_bucket("u1"));
        let bucket: u32 = user_bucket("anyone").parse().unwrap();
        assert!(bucket < 16);
    }

    #[tokio::test]
    async fn flush_drains_buffer_and_persists() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let collector = MetricsCollector::new();
        collector.increment("notifications_sent", &[("channel", "email")], 1.0);
        collector.increment("notifications_sent", &[("channel", "email")], 1.0);
        collector.timer("delivery_time_ms", &[("channel", "email")], 120.0);
        assert_eq!(collector.pending(), 3);

        let flushed = collector.flush(&pool).await.unwrap();
        assert_eq!(flushed, 3);
        assert_eq!(collector.pending(), 0);

        let now = Utc::now().naive_utc();
        let sum = MetricRepository::sum_counter_like(
            &pool,
            "notifications_sent",
            Some("channel:email"),
            now - chrono::Duration::minutes(5),
            now + chrono::Duration::minutes(5),
        )
        .await
        .unwrap();
        assert_eq!(sum, 2.0);
    }

    #[tokio::test]
    async fn summarize_computes_rates() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let collector = MetricsCollector::new();
        for _ in 0..4 {
            collector.increment(
                "notifications_sent",
                &[("channel", "email"), ("type", "welcome")],
                1.0,
            );
        }
        for _ in 0..3 {
            collector.increment(
                "notifications_delivered",
                &[("channel", "email"), ("type", "welcome")],
                1.0,
            );
        }
        collector.increment(
            "notifications_failed",
            &[("channel", "email"), ("type", "welcome")],
            1.0,
        );
        collector.flush(&pool).await.unwrap();

        let now = Utc::now().naive_utc();
        let summary = summarize(
            &pool,
            now - chrono::Duration::hours(1),
            now + chrono::Duration::hours(1),
            None,
        )
        .await
        .unwrap();

        assert_eq!(summary.total_sent, 4.0);
        assert_eq!(summary.delivery_rate, 75.0);
        assert_eq!(summary.failure_rate, 25.0);
        assert_eq!(summary.by_channel.len(), 1);
        assert_eq!(summary.by_channel[0].channel, "email");
    }
}
