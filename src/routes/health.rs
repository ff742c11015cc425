use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::db::repository::QueueRepository;
use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    pub queue_depth: i64,
    pub breakers: Vec<BreakerStatus>,
}

#[derive(Serialize)]
pub struct BreakerStatus {
    pub provider: String,
    pub state: String,
    pub failure_count: u32,
}

/// Liveness and readiness: a failing database read reports unhealthy with
/// a 503 so orchestrators stop routing traffic here.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status_code, status, queue_depth) =
        match QueueRepository::depth_by_priority(&state.db).await {
            Ok(depths) => (
                StatusCode::OK,
                "healthy".to_string(),
                depths.iter().map(|(_, count)| count).sum(),
            ),
            Err(e) => {
                tracing::error!("Health check database probe failed: {:?}", e);
                (StatusCode::SERVICE_UNAVAILABLE, "unhealthy".to_string(), 0)
            }
        };

    let breakers = state
        .breakers
        .snapshot()
        .into_iter()
        .map(|(provider, breaker_state, failure_count)| BreakerStatus {
            provider,
            state: breaker_state.as_str().to_string(),
            failure_count,
        })
        .collect();

    let response = HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        queue_depth,
        breakers,
    };

    (status_code, Json(response))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::services::channels::InAppBus;
    use crate::services::directory::StaticDirectory;
    use crate::services::dispatch::AdapterRegistry;
    use crate::services::limiter::{BreakerRegistry, RateLimiter};
    use crate::services::metrics::MetricsCollector;

    /// Minimal engine state over an in-memory database, shared by route tests.
    pub(crate) async fn test_state() -> Arc<AppState> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let config = Config::default();
        Arc::new(AppState {
            db: pool,
            limiter: RateLimiter::new(&config.channels),
            breakers: BreakerRegistry::new(&config.breaker),
            adapters: AdapterRegistry::new(),
            directory: Arc::new(StaticDirectory::new()),
            metrics: MetricsCollector::new(),
            in_app_bus: Arc::new(InAppBus::new()),
            config,
        })
    }

    #[tokio::test]
    async fn healthy_when_database_reachable() {
        let state = test_state().await;
        let app = Router::new()
            .route("/health", get(health_check))
            .with_state(state);

        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["queue_depth"], 0);
    }
}
