use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Kinds of metric points. Counters aggregate additively, gauges keep the
/// last value, histograms and timers accumulate sample distributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Timer,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Timer => "timer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "counter" => Some(MetricKind::Counter),
            "gauge" => Some(MetricKind::Gauge),
            "histogram" => Some(MetricKind::Histogram),
            "timer" => Some(MetricKind::Timer),
            _ => None,
        }
    }

    pub fn has_samples(&self) -> bool {
        matches!(self, MetricKind::Histogram | MetricKind::Timer)
    }
}

/// One stored rollup bucket at some granularity.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MetricBucket {
    pub metric: String,
    pub labels: String,
    pub kind: String,
    pub bucket: NaiveDateTime,
    pub value: f64,
    pub sample_sum: f64,
    pub sample_count: i64,
}

/// A minute-tier bucket additionally carries its raw sample list.
#[derive(Debug, Clone, FromRow)]
pub struct MinuteMetricBucket {
    pub metric: String,
    pub labels: String,
    pub kind: String,
    pub bucket: NaiveDateTime,
    pub value: f64,
    pub sample_sum: f64,
    pub sample_count: i64,
    pub samples: Option<String>,
}

/// Canonical label-set string: sorted `k:v` pairs joined with `_`, empty for
/// no labels. Keeps one row per distinct label combination.
pub fn label_string(labels: &[(&str, &str)]) -> String {
    let mut pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{}:{}", k, v)).collect();
    pairs.sort();
    pairs.join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_string_is_order_independent() {
        assert_eq!(
            label_string(&[("channel", "email"), ("type", "welcome")]),
            label_string(&[("type", "welcome"), ("channel", "email")]),
        );
        assert_eq!(label_string(&[]), "");
    }

    #[test]
    fn kind_round_trip() {
        for k in [
            MetricKind::Counter,
            MetricKind::Gauge,
            MetricKind::Histogram,
            MetricKind::Timer,
        ] {
            assert_eq!(MetricKind::parse(k.as_str()), Some(k));
        }
    }
}
