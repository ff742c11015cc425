use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use http::{HeaderValue, StatusCode};
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::{GovernorError, GovernorLayer};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod db;
mod error;
mod i18n;
mod routes;
mod services;

use config::Config;
use services::channels::InAppBus;
use services::directory::UserDirectory;
use services::dispatch::AdapterRegistry;
use services::init;
use services::limiter::{BreakerRegistry, RateLimiter};
use services::metrics::MetricsCollector;

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub adapters: AdapterRegistry,
    pub limiter: RateLimiter,
    pub breakers: BreakerRegistry,
    pub directory: Arc<dyn UserDirectory>,
    pub metrics: MetricsCollector,
    pub in_app_bus: Arc<InAppBus>,
}

#[derive(Parser)]
#[command(name = "notification-engine", about = "Multi-channel notification delivery engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API and the delivery engine.
    Serve,
    /// Run the delivery engine and sweepers without the HTTP API.
    Worker,
    /// Flush any durable metric buffers and prune expired rollups.
    FlushMetrics,
    /// Promote every due scheduled notification into the queue.
    ReplayScheduled,
    /// Seed default preference rows for a user.
    InitPreferences {
        #[arg(long)]
        user: String,
    },
    /// Inspect and manage templates.
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// List the latest version of every template.
    List,
    /// Show one template by name.
    Get { name: String },
    /// Create a new version from a JSON file and activate it.
    Set {
        /// Path to a JSON file with {name, notification_type, channel,
        /// subject?, body, variables?, language?}.
        #[arg(long)]
        file: String,
    },
    /// Activate a template (latest version unless --version is given).
    Activate {
        name: String,
        #[arg(long)]
        version: Option<i64>,
    },
}

/// Exit codes: 0 ok, 1 transient failure, 2 configuration error, 3 fatal.
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notification_engine=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Configuration error: {}", e);
            return ExitCode::from(2);
        }
    };

    let result = match cli.command {
        Command::Serve => serve(config, true).await,
        Command::Worker => serve(config, false).await,
        Command::FlushMetrics => flush_metrics(config).await,
        Command::ReplayScheduled => replay_scheduled(config).await,
        Command::InitPreferences { user } => init_preferences(config, &user).await,
        Command::Template { action } => template_command(config, action).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(CommandError::Transient(e)) => {
            tracing::error!("Transient failure: {:#}", e);
            ExitCode::from(1)
        }
        Err(CommandError::Config(e)) => {
            tracing::error!("Configuration error: {:#}", e);
            ExitCode::from(2)
        }
        Err(CommandError::Fatal(e)) => {
            tracing::error!("Fatal error: {:#}", e);
            ExitCode::from(3)
        }
    }
}

enum CommandError {
    Transient(anyhow::Error),
    Config(anyhow::Error),
    Fatal(anyhow::Error),
}

async fn serve(config: Config, with_http: bool) -> Result<(), CommandError> {
    tracing::info!("Starting notification delivery engine");

    let state = init::build_state(config)
        .await
        .map_err(CommandError::Fatal)?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let handles = init::spawn_background_workers(state.clone(), shutdown_tx.clone());

    if with_http {
        let app = build_router(&state).map_err(CommandError::Config)?;

        let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
        tracing::info!("Server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| CommandError::Fatal(e.into()))?;

        let shutdown = shutdown_tx.clone();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            wait_for_shutdown_signal().await;
            let _ = shutdown.send(());
        })
        .await
        .map_err(|e| CommandError::Fatal(e.into()))?;
    } else {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(());
    }

    // Drain: in-flight workers finish or time out at the adapter boundary;
    // the metric flusher performs its final flush before exiting.
    for handle in handles {
        let _ = handle.await;
    }
    tracing::info!("Engine stopped");
    Ok(())
}

fn build_router(state: &Arc<AppState>) -> anyhow::Result<Router> {
    // Per-IP limiter for the public producer endpoints.
    let mut producer_builder = GovernorConfigBuilder::default();
    producer_builder.per_second(state.config.rate_limit.producer_per_second.into());
    producer_builder.burst_size(state.config.rate_limit.producer_burst.into());
    producer_builder.key_extractor(SmartIpKeyExtractor);
    producer_builder.error_handler(governor_error_response);
    let producer_conf = Arc::new(
        producer_builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Failed to build producer governor config"))?,
    );

    // Background cleanup for the producer limiter's per-IP storage.
    {
        let limiter = producer_conf.limiter().clone();
        let interval = Duration::from_secs(60);
        std::thread::spawn(move || loop {
            std::thread::sleep(interval);
            tracing::debug!("producer rate limiter size: {}", limiter.len());
            limiter.retain_recent();
        });
    }

    // Per-IP limiter for provider callback endpoints.
    let mut callback_builder = GovernorConfigBuilder::default();
    callback_builder.per_second(state.config.rate_limit.callback_per_second.into());
    callback_builder.burst_size(state.config.rate_limit.callback_burst.into());
    callback_builder.key_extractor(SmartIpKeyExtractor);
    callback_builder.error_handler(governor_error_response);
    let callback_conf = Arc::new(
        callback_builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Failed to build callback governor config"))?,
    );

    // Background cleanup for the callback limiter's per-IP storage.
    {
        let limiter = callback_conf.limiter().clone();
        let interval = Duration::from_secs(60);
        std::thread::spawn(move || loop {
            std::thread::sleep(interval);
            tracing::debug!("callback rate limiter size: {}", limiter.len());
            limiter.retain_recent();
        });
    }

    let router = Router::new()
        .route("/health", get(routes::health::health_check))
        .nest(
            "/notifications",
            routes::notifications::router().layer(GovernorLayer {
                config: producer_conf,
            }),
        )
        .nest("/users", routes::users::router())
        .nest("/stats", routes::stats::router())
        .nest(
            "/webhooks",
            routes::webhooks::router().layer(GovernorLayer {
                config: callback_conf,
            }),
        )
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(
                    state
                        .config
                        .server
                        .cors_origin
                        .parse::<HeaderValue>()
                        .map_err(|_| anyhow::anyhow!("Invalid CORS_ORIGIN"))?,
                )
                .allow_methods([
                    http::Method::GET,
                    http::Method::POST,
                    http::Method::PUT,
                    http::Method::OPTIONS,
                ])
                .allow_headers([http::header::CONTENT_TYPE, http::header::ACCEPT]),
        );

    Ok(router)
}

/// Shared 429/400 response shape for both governor layers, matching the
/// `{error: {code, message, details?}}` envelope the API uses elsewhere.
fn governor_error_response(error: GovernorError) -> http::Response<Body> {
    match error {
        GovernorError::TooManyRequests { wait_time, headers } => {
            let body = serde_json::json!({
                "error": {
                    "code": "RATE_LIMITED",
                    "message": "Rate limit exceeded",
                    "details": { "retry_after_seconds": wait_time }
                }
            })
            .to_string();

            let mut resp = http::Response::new(Body::from(body));
            *resp.status_mut() = StatusCode::TOO_MANY_REQUESTS;
            resp.headers_mut().insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            if let Some(hmap) = headers {
                for (name, value) in hmap.iter() {
                    resp.headers_mut().append(name.clone(), value.clone());
                }
            }
            if let Ok(value) = HeaderValue::from_str(&wait_time.to_string()) {
                resp.headers_mut().insert(http::header::RETRY_AFTER, value);
            }
            resp
        }
        GovernorError::UnableToExtractKey => {
            let body = serde_json::json!({
                "error": {
                    "code": "INVALID_REQUEST",
                    "message": "Unable to determine client IP for rate limiting"
                }
            })
            .to_string();

            let mut resp = http::Response::new(Body::from(body));
            *resp.status_mut() = StatusCode::BAD_REQUEST;
            resp.headers_mut().insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            resp
        }
        GovernorError::Other { code, msg, headers } => {
            let body = msg.unwrap_or_else(|| "Rate limiting error".to_string());
            let mut resp = http::Response::new(Body::from(body));
            *resp.status_mut() =
                StatusCode::from_u16(code.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if let Some(hmap) = headers {
                for (name, value) in hmap.iter() {
                    resp.headers_mut().append(name.clone(), value.clone());
                }
            }
            resp
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

async fn flush_metrics(config: Config) -> Result<(), CommandError> {
    let pool = init::init_db(&config).await.map_err(CommandError::Fatal)?;
    db::repository::MetricRepository::prune(&pool)
        .await
        .map_err(|e| CommandError::Transient(anyhow::anyhow!(e)))?;
    tracing::info!("Metric rollups pruned to retention");
    Ok(())
}

async fn replay_scheduled(config: Config) -> Result<(), CommandError> {
    let pool = init::init_db(&config).await.map_err(CommandError::Fatal)?;
    let now = chrono::Utc::now().naive_utc();
    let promoted = db::repository::NotificationRepository::promote_scheduled(&pool, now)
        .await
        .map_err(|e| CommandError::Transient(anyhow::anyhow!(e)))?;
    for notification in &promoted {
        db::repository::QueueRepository::enqueue(&pool, &notification.id, notification.priority, now)
            .await
            .map_err(|e| CommandError::Transient(anyhow::anyhow!(e)))?;
    }
    println!("Promoted {} scheduled notifications", promoted.len());
    Ok(())
}

async fn init_preferences(config: Config, user: &str) -> Result<(), CommandError> {
    if user.trim().is_empty() {
        return Err(CommandError::Config(anyhow::anyhow!("--user must not be empty")));
    }
    let pool = init::init_db(&config).await.map_err(CommandError::Fatal)?;
    let created = db::repository::PreferenceRepository::init_defaults(&pool, user)
        .await
        .map_err(|e| CommandError::Transient(anyhow::anyhow!(e)))?;
    println!("Created {} preference rows for {}", created, user);
    Ok(())
}

async fn template_command(config: Config, action: TemplateAction) -> Result<(), CommandError> {
    let pool = init::init_db(&config).await.map_err(CommandError::Fatal)?;

    match action {
        TemplateAction::List => {
            let templates = db::repository::TemplateRepository::list(&pool)
                .await
                .map_err(|e| CommandError::Transient(anyhow::anyhow!(e)))?;
            for t in templates {
                println!(
                    "{:30} {:10} {:8} v{:<3} {}",
                    t.name,
                    t.notification_type,
                    t.channel,
                    t.version,
                    if t.active { "active" } else { "" }
                );
            }
            Ok(())
        }
        TemplateAction::Get { name } => {
            let template = db::repository::TemplateRepository::find_by_name(&pool, &name)
                .await
                .map_err(|e| CommandError::Transient(anyhow::anyhow!(e)))?
                .ok_or_else(|| CommandError::Config(anyhow::anyhow!("no such template: {}", name)))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&template)
                    .map_err(|e| CommandError::Fatal(e.into()))?
            );
            Ok(())
        }
        TemplateAction::Set { file } => {
            let raw = std::fs::read_to_string(&file)
                .map_err(|e| CommandError::Config(anyhow::anyhow!("cannot read {}: {}", file, e)))?;
            let input: db::models::CreateTemplate = serde_json::from_str(&raw)
                .map_err(|e| CommandError::Config(anyhow::anyhow!("invalid template JSON: {}", e)))?;

            services::render::validate(&input.body, input.subject.as_deref(), &input.variables)
                .map_err(|e| CommandError::Config(anyhow::anyhow!("template invalid: {}", e)))?;

            let created = db::repository::TemplateRepository::create_version(&pool, &input, true)
                .await
                .map_err(|e| CommandError::Transient(anyhow::anyhow!(e)))?;
            println!("Created {} v{} (active)", created.name, created.version);
            Ok(())
        }
        TemplateAction::Activate { name, version } => {
            let activated = db::repository::TemplateRepository::activate(&pool, &name, version)
                .await
                .map_err(|e| CommandError::Transient(anyhow::anyhow!(e)))?;
            println!("Activated {} v{}", activated.name, activated.version);
            Ok(())
        }
    }
}
