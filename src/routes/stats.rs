use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{Duration, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::services::metrics::{self, AnalyticsSummary};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(get_stats))
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    /// ISO timestamps ("2025-06-10T00:00:00"). Defaults to the last 24 hours.
    pub start: Option<String>,
    pub end: Option<String>,
    pub channel: Option<String>,
}

fn parse_timestamp(value: &str) -> AppResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| {
            chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .map(|d| d.and_time(chrono::NaiveTime::MIN))
        })
        .map_err(|_| AppError::BadRequest(format!("unparseable timestamp: {}", value)))
}

/// Analytics rollup over the requested interval. The tier queried follows
/// the interval span: minute for <= 24h, hour for <= 30d, day beyond.
async fn get_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> AppResult<Json<AnalyticsSummary>> {
    let end = match &query.end {
        Some(v) => parse_timestamp(v)?,
        None => Utc::now().naive_utc(),
    };
    let start = match &query.start {
        Some(v) => parse_timestamp(v)?,
        None => end - Duration::hours(24),
    };
    if start >= end {
        return Err(AppError::BadRequest("start must precede end".to_string()));
    }

    if let Some(channel) = &query.channel {
        if crate::db::models::Channel::parse(channel).is_none() {
            return Err(AppError::BadRequest(format!(
                "unrecognized channel: {}",
                channel
            )));
        }
    }

    let summary = metrics::summarize(&state.db, start, end, query.channel.as_deref()).await?;
    Ok(Json(summary))
}
