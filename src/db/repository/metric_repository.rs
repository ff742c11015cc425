use chrono::{Duration, NaiveDateTime, NaiveTime, Timelike, Utc};
use sqlx::SqlitePool;

use crate::db::models::{MetricBucket, MetricKind, MinuteMetricBucket};
use crate::error::{AppError, AppResult};

/// Rollup tiers. Minute buckets keep raw samples; hour and day buckets keep
/// aggregates only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    pub fn table(&self) -> &'static str {
        match self {
            Granularity::Minute => "metrics_minute",
            Granularity::Hour => "metrics_hour",
            Granularity::Day => "metrics_day",
        }
    }

    /// Floor a timestamp to this tier's bucket boundary.
    pub fn bucket_of(&self, ts: NaiveDateTime) -> NaiveDateTime {
        match self {
            Granularity::Minute => ts
                .with_second(0)
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(ts),
            Granularity::Hour => ts
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(ts),
            Granularity::Day => ts.date().and_time(NaiveTime::MIN),
        }
    }

    pub fn retention(&self) -> Duration {
        match self {
            Granularity::Minute => Duration::hours(24),
            Granularity::Hour => Duration::days(30),
            Granularity::Day => Duration::days(365),
        }
    }

    /// Coarsest tier whose minute/hour resolution still fully serves the
    /// interval: <= 24h uses minute, <= 30d uses hour, else day.
    pub fn for_interval(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        let span = end - start;
        if span <= Duration::hours(24) {
            Granularity::Minute
        } else if span <= Duration::days(30) {
            Granularity::Hour
        } else {
            Granularity::Day
        }
    }
}

/// One flushed aggregate headed for the rollup tables. `bucket` is the minute
/// bucket; the repository derives the hour and day buckets from it.
#[derive(Debug, Clone)]
pub struct FlushPoint {
    pub metric: String,
    pub labels: String,
    pub kind: MetricKind,
    pub bucket: NaiveDateTime,
    pub value: f64,
    pub samples: Vec<f64>,
}

/// Minute-tier sample lists are capped; extra samples still count toward
/// sums and counts.
const MAX_MINUTE_SAMPLES: usize = 512;

pub struct MetricRepository;

impl MetricRepository {
    /// Write a batch of flushed points into all three tiers in one
    /// transaction. Counters add into existing buckets, gauges overwrite,
    /// histograms/timers merge their sample statistics, which keeps hour and
    /// day buckets equal to the sum of their finer-grained parts.
    pub async fn record_batch(pool: &SqlitePool, points: &[FlushPoint]) -> AppResult<()> {
        if points.is_empty() {
            return Ok(());
        }

        let mut tx = pool.begin().await.map_err(AppError::Database)?;

        for point in points {
            let sample_sum: f64 = point.samples.iter().sum();
            let sample_count = point.samples.len() as i64;

            for granularity in [Granularity::Minute, Granularity::Hour, Granularity::Day] {
                let bucket = granularity.bucket_of(point.bucket);
                let table = granularity.table();

                let value_update = match point.kind {
                    MetricKind::Counter => "value = value + excluded.value",
                    MetricKind::Gauge => "value = excluded.value",
                    MetricKind::Histogram | MetricKind::Timer => "value = value + excluded.value",
                };

                let sql = format!(
                    "INSERT INTO {} (metric, labels, kind, bucket, value, sample_sum, sample_count) \
                     VALUES (?, ?, ?, ?, ?, ?, ?) \
                     ON CONFLICT (metric, labels, bucket) DO UPDATE SET \
                        {}, \
                        sample_sum = sample_sum + excluded.sample_sum, \
                        sample_count = sample_count + excluded.sample_count",
                    table, value_update
                );

                sqlx::query(&sql)
                    .bind(&point.metric)
                    .bind(&point.labels)
                    .bind(point.kind.as_str())
                    .bind(bucket)
                    .bind(point.value)
                    .bind(sample_sum)
                    .bind(sample_count)
                    .execute(&mut *tx)
                    .await
                    .map_err(AppError::Database)?;
            }

            // Raw samples live only in the minute tier.
            if point.kind.has_samples() && !point.samples.is_empty() {
                let bucket = Granularity::Minute.bucket_of(point.bucket);
                let existing: Option<(Option<String>,)> = sqlx::query_as(
                    "SELECT samples FROM metrics_minute WHERE metric = ? AND labels = ? AND bucket = ?",
                )
                .bind(&point.metric)
                .bind(&point.labels)
                .bind(bucket)
                .fetch_optional(&mut *tx)
                .await
                .map_err(AppError::Database)?;

                let mut merged: Vec<f64> = existing
                    .and_then(|(s,)| s)
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or_default();
                merged.extend(point.samples.iter().copied());
                merged.truncate(MAX_MINUTE_SAMPLES);

                let encoded = serde_json::to_string(&merged)
                    .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
                sqlx::query(
                    "UPDATE metrics_minute SET samples = ? WHERE metric = ? AND labels = ? AND bucket = ?",
                )
                .bind(encoded)
                .bind(&point.metric)
                .bind(&point.labels)
                .bind(bucket)
                .execute(&mut *tx)
                .await
                .map_err(AppError::Database)?;
            }
        }

        tx.commit().await.map_err(AppError::Database)?;
        Ok(())
    }

    /// Range query at an explicit granularity. A label prefix filter of None
    /// returns every label set for the metric.
    pub async fn query_range(
        pool: &SqlitePool,
        granularity: Granularity,
        metric: &str,
        labels: Option<&str>,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> AppResult<Vec<MetricBucket>> {
        let sql = format!(
            "SELECT metric, labels, kind, bucket, value, sample_sum, sample_count \
             FROM {} WHERE metric = ? AND (? IS NULL OR labels = ?) AND bucket >= ? AND bucket <= ? \
             ORDER BY bucket",
            granularity.table()
        );
        let rows = sqlx::query_as::<_, MetricBucket>(&sql)
            .bind(metric)
            .bind(labels)
            .bind(labels)
            .bind(start)
            .bind(end)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(rows)
    }

    /// Sum of a counter over an interval at the tier matching the span.
    pub async fn sum_counter(
        pool: &SqlitePool,
        metric: &str,
        labels: Option<&str>,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> AppResult<f64> {
        let granularity = Granularity::for_interval(start, end);
        let sql = format!(
            "SELECT COALESCE(SUM(value), 0.0) FROM {} \
             WHERE metric = ? AND (? IS NULL OR labels = ?) AND bucket >= ? AND bucket <= ?",
            granularity.table()
        );
        let row: (f64,) = sqlx::query_as(&sql)
            .bind(metric)
            .bind(labels)
            .bind(labels)
            .bind(start)
            .bind(end)
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(row.0)
    }

    /// Sum of a counter across every label set containing the filter
    /// substring (e.g. "channel:email"). None sums all label sets.
    pub async fn sum_counter_like(
        pool: &SqlitePool,
        metric: &str,
        label_filter: Option<&str>,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> AppResult<f64> {
        let granularity = Granularity::for_interval(start, end);
        let sql = format!(
            "SELECT COALESCE(SUM(value), 0.0) FROM {} \
             WHERE metric = ? AND (? IS NULL OR labels LIKE '%' || ? || '%') \
               AND bucket >= ? AND bucket <= ?",
            granularity.table()
        );
        let row: (f64,) = sqlx::query_as(&sql)
            .bind(metric)
            .bind(label_filter)
            .bind(label_filter)
            .bind(start)
            .bind(end)
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(row.0)
    }

    /// Merged raw samples across label sets matching the filter substring.
    pub async fn samples_like(
        pool: &SqlitePool,
        metric: &str,
        label_filter: Option<&str>,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> AppResult<Vec<f64>> {
        let rows = sqlx::query_as::<_, MinuteMetricBucket>(
            "SELECT * FROM metrics_minute \
             WHERE metric = ? AND (? IS NULL OR labels LIKE '%' || ? || '%') \
               AND bucket >= ? AND bucket <= ? \
             ORDER BY bucket",
        )
        .bind(metric)
        .bind(label_filter)
        .bind(label_filter)
        .bind(start)
        .bind(end)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        let mut out = Vec::new();
        for row in rows {
            if let Some(samples) = row.samples {
                if let Ok(values) = serde_json::from_str::<Vec<f64>>(&samples) {
                    out.extend(values);
                }
            }
        }
        Ok(out)
    }

    /// Aggregate sum and count across label sets matching the filter.
    pub async fn sample_stats_like(
        pool: &SqlitePool,
        metric: &str,
        label_filter: Option<&str>,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> AppResult<(f64, i64)> {
        let granularity = Granularity::for_interval(start, end);
        let sql = format!(
            "SELECT COALESCE(SUM(sample_sum), 0.0), COALESCE(SUM(sample_count), 0) FROM {} \
             WHERE metric = ? AND (? IS NULL OR labels LIKE '%' || ? || '%') \
               AND bucket >= ? AND bucket <= ?",
            granularity.table()
        );
        let row: (f64, i64) = sqlx::query_as(&sql)
            .bind(metric)
            .bind(label_filter)
            .bind(label_filter)
            .bind(start)
            .bind(end)
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(row)
    }

    /// Raw samples for a histogram/timer over an interval (minute tier).
    pub async fn samples(
        pool: &SqlitePool,
        metric: &str,
        labels: Option<&str>,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> AppResult<Vec<f64>> {
        let rows = sqlx::query_as::<_, MinuteMetricBucket>(
            "SELECT * FROM metrics_minute \
             WHERE metric = ? AND (? IS NULL OR labels = ?) AND bucket >= ? AND bucket <= ? \
             ORDER BY bucket",
        )
        .bind(metric)
        .bind(labels)
        .bind(labels)
        .bind(start)
        .bind(end)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        let mut out = Vec::new();
        for row in rows {
            if let Some(samples) = row.samples {
                if let Ok(values) = serde_json::from_str::<Vec<f64>>(&samples) {
                    out.extend(values);
                }
            }
        }
        Ok(out)
    }

    /// Aggregate sum and count for a histogram/timer over an interval.
    pub async fn sample_stats(
        pool: &SqlitePool,
        metric: &str,
        labels: Option<&str>,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> AppResult<(f64, i64)> {
        let granularity = Granularity::for_interval(start, end);
        let sql = format!(
            "SELECT COALESCE(SUM(sample_sum), 0.0), COALESCE(SUM(sample_count), 0) FROM {} \
             WHERE metric = ? AND (? IS NULL OR labels = ?) AND bucket >= ? AND bucket <= ?",
            granularity.table()
        );
        let row: (f64, i64) = sqlx::query_as(&sql)
            .bind(metric)
            .bind(labels)
            .bind(labels)
            .bind(start)
            .bind(end)
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(row)
    }

    /// Drop buckets past each tier's retention.
    pub async fn prune(pool: &SqlitePool) -> AppResult<()> {
        let now = Utc::now().naive_utc();
        for granularity in [Granularity::Minute, Granularity::Hour, Granularity::Day] {
            let sql = format!("DELETE FROM {} WHERE bucket < ?", granularity.table());
            sqlx::query(&sql)
                .bind(now - granularity.retention())
                .execute(pool)
                .await
                .map_err(AppError::Database)?;
        }
        Ok(())
    }
}
