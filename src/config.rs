use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub directory: DirectoryConfig,
    pub workers: WorkerConfig,
    pub channels: ChannelConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub metrics: MetricsConfig,
    pub batching: BatchConfig,
    pub locale: LocaleConfig,
    pub providers: ProviderConfig,
    pub rate_limit: HttpRateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// External user directory supplying contact addresses per (user, channel).
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Number of delivery workers. 0 means cpu_count * io_multiplier.
    pub worker_count: usize,
    pub io_multiplier: usize,
    /// How often (seconds) an idle worker polls the queue for ready entries.
    pub queue_poll_seconds: u64,
    /// Queue entries waiting longer than this are treated one priority tier
    /// higher on the next dequeue.
    pub aging_threshold_seconds: i64,
    /// Claimed queue entries older than this are returned to ready on startup
    /// (crash recovery).
    pub claim_lease_seconds: i64,
}

/// Per-channel dispatch settings: token bucket rate, burst, retry budget and
/// adapter timeout.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChannelSettings {
    pub rate_per_minute: u32,
    pub burst: u32,
    pub max_retries: i32,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub email: ChannelSettings,
    pub sms: ChannelSettings,
    pub push: ChannelSettings,
    pub in_app: ChannelSettings,
    pub webhook: ChannelSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Backoff table in seconds, indexed by retry_count - 1 and clamped.
    pub delays_seconds: Vec<i64>,
    /// How often (seconds) the sweeper scans for records with next_retry_at due.
    pub sweep_interval_seconds: u64,
    /// How often (seconds) scheduled notifications are promoted to the queue.
    pub scheduled_sweep_seconds: u64,
    /// Base deferral (milliseconds) when a dispatch is refused by the local
    /// token bucket; jitter is added on top. Does not consume retry budget.
    pub rate_limited_defer_ms: i64,
    /// Long deferral (seconds) for provider quota exhaustion.
    pub quota_defer_seconds: i64,
    /// Notifications older than this are expired rather than retried.
    pub max_lifetime_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub flush_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// User-local hour at which daily digests are emitted.
    pub daily_hour: u32,
    /// User-local weekday for weekly digests (1 = Monday).
    pub weekly_day: u32,
    /// Maximum summary lines included in one digest.
    pub max_summaries: usize,
    /// How often (seconds) the batch sweeper checks for due user buckets.
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocaleConfig {
    pub default_language: String,
    pub supported_languages: Vec<String>,
    pub default_timezone: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub email: EmailProviderConfig,
    pub sms: SmsProviderConfig,
    pub push: PushProviderConfig,
    /// Shared secret for inbound provider status callbacks (HMAC-SHA256).
    pub callback_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailProviderConfig {
    pub api_key: Option<String>,
    pub endpoint: String,
    pub from_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmsProviderConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub from_number: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushProviderConfig {
    pub server_key: Option<String>,
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpRateLimitConfig {
    /// Allowed requests per second (per IP) for the producer endpoints.
    pub producer_per_second: u32,
    pub producer_burst: u32,
    /// Allowed requests per second (per IP) for provider callback endpoints.
    pub callback_per_second: u32,
    pub callback_burst: u32,
}

fn env_str(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn channel_settings(prefix: &str, defaults: ChannelSettings) -> ChannelSettings {
    ChannelSettings {
        rate_per_minute: env_parse(
            &format!("{}_RATE_PER_MINUTE", prefix),
            defaults.rate_per_minute,
        ),
        burst: env_parse(&format!("{}_BURST", prefix), defaults.burst),
        max_retries: env_parse(&format!("{}_MAX_RETRIES", prefix), defaults.max_retries),
        timeout_seconds: env_parse(
            &format!("{}_TIMEOUT_SECONDS", prefix),
            defaults.timeout_seconds,
        ),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let retry_delays = env::var("RETRY_DELAYS_SECONDS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|p| p.trim().parse::<i64>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| ConfigError::InvalidValue("RETRY_DELAYS_SECONDS".to_string()))
            })
            .transpose()?
            .unwrap_or_else(|| vec![60, 300, 900, 1800, 3600]);

        if retry_delays.is_empty() {
            return Err(ConfigError::InvalidValue(
                "RETRY_DELAYS_SECONDS".to_string(),
            ));
        }

        let supported_languages: Vec<String> = env_str("SUPPORTED_LANGUAGES", "en,ar")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            server: ServerConfig {
                host: env_str("HOST", "0.0.0.0"),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8003".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                cors_origin: env_str("CORS_ORIGIN", "http://localhost:3000"),
            },
            database: DatabaseConfig {
                url: env_str("DATABASE_URL", "sqlite://data/notifications.db"),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 5),
            },
            directory: DirectoryConfig {
                base_url: env_str("USER_DIRECTORY_URL", "http://localhost:8001"),
                timeout_seconds: env_parse("USER_DIRECTORY_TIMEOUT_SECONDS", 5),
            },
            workers: WorkerConfig {
                worker_count: env_parse("WORKER_COUNT", 0),
                io_multiplier: env_parse("WORKER_IO_MULTIPLIER", 4),
                queue_poll_seconds: env_parse("QUEUE_POLL_SECONDS", 1),
                aging_threshold_seconds: env_parse("QUEUE_AGING_THRESHOLD_SECONDS", 30),
                claim_lease_seconds: env_parse("QUEUE_CLAIM_LEASE_SECONDS", 300),
            },
            channels: ChannelConfig {
                email: channel_settings(
                    "CHANNEL_EMAIL",
                    ChannelSettings {
                        rate_per_minute: 100,
                        burst: 20,
                        max_retries: 3,
                        timeout_seconds: 30,
                    },
                ),
                sms: channel_settings(
                    "CHANNEL_SMS",
                    ChannelSettings {
                        rate_per_minute: 50,
                        burst: 10,
                        max_retries: 3,
                        timeout_seconds: 30,
                    },
                ),
                push: channel_settings(
                    "CHANNEL_PUSH",
                    ChannelSettings {
                        rate_per_minute: 1000,
                        burst: 100,
                        max_retries: 3,
                        timeout_seconds: 30,
                    },
                ),
                in_app: channel_settings(
                    "CHANNEL_IN_APP",
                    ChannelSettings {
                        rate_per_minute: 2000,
                        burst: 200,
                        max_retries: 3,
                        timeout_seconds: 30,
                    },
                ),
                webhook: channel_settings(
                    "CHANNEL_WEBHOOK",
                    ChannelSettings {
                        rate_per_minute: 200,
                        burst: 50,
                        max_retries: 3,
                        timeout_seconds: 30,
                    },
                ),
            },
            retry: RetryConfig {
                delays_seconds: retry_delays,
                sweep_interval_seconds: env_parse("RETRY_SWEEP_INTERVAL_SECONDS", 5),
                scheduled_sweep_seconds: env_parse("SCHEDULED_SWEEP_INTERVAL_SECONDS", 1),
                rate_limited_defer_ms: env_parse("RATE_LIMITED_DEFER_MS", 300),
                quota_defer_seconds: env_parse("QUOTA_DEFER_SECONDS", 3600),
                max_lifetime_hours: env_parse("NOTIFICATION_MAX_LIFETIME_HOURS", 24),
            },
            breaker: BreakerConfig {
                failure_threshold: env_parse("BREAKER_FAILURE_THRESHOLD", 5),
                recovery_seconds: env_parse("BREAKER_RECOVERY_SECONDS", 60),
            },
            metrics: MetricsConfig {
                flush_interval_seconds: env_parse("METRIC_FLUSH_INTERVAL_SECONDS", 10),
            },
            batching: BatchConfig {
                daily_hour: env_parse("BATCH_DAILY_HOUR", 0),
                weekly_day: env_parse("BATCH_WEEKLY_DAY", 1),
                max_summaries: env_parse("BATCH_MAX_SUMMARIES", 50),
                sweep_interval_seconds: env_parse("BATCH_SWEEP_INTERVAL_SECONDS", 60),
            },
            locale: LocaleConfig {
                default_language: env_str("DEFAULT_LANGUAGE", "en"),
                supported_languages,
                default_timezone: env_str("DEFAULT_TIMEZONE", "UTC"),
            },
            providers: ProviderConfig {
                email: EmailProviderConfig {
                    api_key: env::var("EMAIL_API_KEY").ok(),
                    endpoint: env_str(
                        "EMAIL_API_ENDPOINT",
                        "https://api.sendgrid.com/v3/mail/send",
                    ),
                    from_address: env_str("EMAIL_FROM_ADDRESS", "no-reply@example.com"),
                },
                sms: SmsProviderConfig {
                    account_sid: env::var("SMS_ACCOUNT_SID").ok(),
                    auth_token: env::var("SMS_AUTH_TOKEN").ok(),
                    from_number: env_str("SMS_FROM_NUMBER", ""),
                    endpoint: env_str("SMS_API_ENDPOINT", "https://api.twilio.com/2010-04-01"),
                },
                push: PushProviderConfig {
                    server_key: env::var("PUSH_SERVER_KEY").ok(),
                    endpoint: env_str("PUSH_API_ENDPOINT", "https://fcm.googleapis.com/fcm/send"),
                },
                callback_secret: env_str("PROVIDER_CALLBACK_SECRET", ""),
            },
            rate_limit: HttpRateLimitConfig {
                producer_per_second: env_parse("RATE_LIMIT_PRODUCER_PER_SECOND", 50),
                producer_burst: env_parse("RATE_LIMIT_PRODUCER_BURST", 100),
                callback_per_second: env_parse("RATE_LIMIT_CALLBACK_PER_SECOND", 20),
                callback_burst: env_parse("RATE_LIMIT_CALLBACK_BURST", 50),
            },
        })
    }

    /// Effective worker count: explicit value, or cpu_count * io_multiplier.
    pub fn effective_worker_count(&self) -> usize {
        if self.workers.worker_count > 0 {
            self.workers.worker_count
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                * self.workers.io_multiplier.max(1)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        let channel = |rate, burst| ChannelSettings {
            rate_per_minute: rate,
            burst,
            max_retries: 3,
            timeout_seconds: 30,
        };

        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8003,
                cors_origin: "http://localhost:3000".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/notifications.db".to_string(),
                max_connections: 5,
            },
            directory: DirectoryConfig {
                base_url: "http://localhost:8001".to_string(),
                timeout_seconds: 5,
            },
            workers: WorkerConfig {
                worker_count: 0,
                io_multiplier: 4,
                queue_poll_seconds: 1,
                aging_threshold_seconds: 30,
                claim_lease_seconds: 300,
            },
            channels: ChannelConfig {
                email: channel(100, 20),
                sms: channel(50, 10),
                push: channel(1000, 100),
                in_app: channel(2000, 200),
                webhook: channel(200, 50),
            },
            retry: RetryConfig {
                delays_seconds: vec![60, 300, 900, 1800, 3600],
                sweep_interval_seconds: 5,
                scheduled_sweep_seconds: 1,
                rate_limited_defer_ms: 300,
                quota_defer_seconds: 3600,
                max_lifetime_hours: 24,
            },
            breaker: BreakerConfig {
                failure_threshold: 5,
                recovery_seconds: 60,
            },
            metrics: MetricsConfig {
                flush_interval_seconds: 10,
            },
            batching: BatchConfig {
                daily_hour: 0,
                weekly_day: 1,
                max_summaries: 50,
                sweep_interval_seconds: 60,
            },
            locale: LocaleConfig {
                default_language: "en".to_string(),
                supported_languages: vec!["en".to_string(), "ar".to_string()],
                default_timezone: "UTC".to_string(),
            },
            providers: ProviderConfig {
                email: EmailProviderConfig {
                    api_key: None,
                    endpoint: "https://api.sendgrid.com/v3/mail/send".to_string(),
                    from_address: "no-reply@example.com".to_string(),
                },
                sms: SmsProviderConfig {
                    account_sid: None,
                    auth_token: None,
                    from_number: String::new(),
                    endpoint: "https://api.twilio.com/2010-04-01".to_string(),
                },
                push: PushProviderConfig {
                    server_key: None,
                    endpoint: "https://fcm.googleapis.com/fcm/send".to_string(),
                },
                callback_secret: String::new(),
            },
            rate_limit: HttpRateLimitConfig {
                producer_per_second: 50,
                producer_burst: 100,
                callback_per_second: 20,
                callback_burst: 50,
            },
        }
    }
}

impl ChannelConfig {
    pub fn settings(&self, channel: crate::db::models::Channel) -> ChannelSettings {
        use crate::db::models::Channel;
        match channel {
            Channel::Email => self.email,
            Channel::Sms => self.sms,
            Channel::Push => self.push,
            Channel::InApp => self.in_app,
            Channel::Webhook => self.webhook,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retry_delays_match_backoff_table() {
        let cfg = Config::default();
        assert_eq!(cfg.retry.delays_seconds, vec![60, 300, 900, 1800, 3600]);
    }

    #[test]
    fn effective_worker_count_uses_multiplier_when_unset() {
        let cfg = Config::default();
        assert!(cfg.effective_worker_count() >= cfg.workers.io_multiplier);
    }
}
