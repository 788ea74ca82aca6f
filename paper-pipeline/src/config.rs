use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use chrono_tz::Tz;
use thiserror::Error;

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
pub(crate) static ENV_MUTEX: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

/// Deployment mode. `Development` fires both dispatch jobs once at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Development,
    Test,
    Production,
}

impl FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "test" => Ok(Self::Test),
            "production" | "prod" => Ok(Self::Production),
            other => Err(anyhow::anyhow!("unknown run mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    run_mode: RunMode,
    amqp_url: String,
    database_url: String,
    database_max_connections: u32,
    database_acquire_timeout: Duration,
    gateway_http_bind: SocketAddr,
    scheduler_start_hour: u32,
    scheduler_end_hour: u32,
    publication_hour: u32,
    timezone: Tz,
    publication_window: chrono::Duration,
    max_delivery_attempts: u32,
    retry_backoff_base_ms: u64,
    retry_backoff_cap_ms: u64,
    idempotency_ledger_enabled: bool,
    openai_api_key: Option<String>,
    openai_base_url: String,
    openai_model: String,
    summary_max_length: usize,
    summary_timeout: Duration,
    bot_token: Option<String>,
    owner_chat_id: Option<String>,
    channel_chat_id: Option<String>,
    telegram_api_base_url: String,
    dry_run_telegram: bool,
    log_level: String,
    otel_exporter_endpoint: Option<String>,
    otel_sampling_ratio: f64,
}

/// Settings the summarizer role needs beyond the shared core.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_length: usize,
    pub timeout: Duration,
}

/// Settings the publisher role needs beyond the shared core.
#[derive(Debug, Clone, PartialEq)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub owner_chat_id: String,
    pub channel_chat_id: String,
    pub api_base_url: String,
    pub dry_run: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Config {
    /// 環境変数からパイプラインの設定値を読み込み、検証する。
    ///
    /// プロセス起動時に一度だけ呼び出し、結果を各コンポーネントのコンストラクタへ渡す。
    ///
    /// # Errors
    /// `RABBITMQ_URL` / `DATABASE_URL` が未設定、もしくは各種値のパースに失敗した場合は
    /// [`ConfigError`] を返す。
    pub fn from_env() -> Result<Self, ConfigError> {
        let run_mode = parse_from_str("PIPELINE_ENV", "development")?;
        let amqp_url = env_var("RABBITMQ_URL")?;
        let database_url = env_var("DATABASE_URL")?;
        let database_max_connections = parse_u32("DATABASE_MAX_CONNECTIONS", 10)?;
        let database_acquire_timeout = parse_duration_secs("DATABASE_ACQUIRE_TIMEOUT_SECS", 30)?;
        let gateway_http_bind = parse_socket_addr("GATEWAY_HTTP_BIND", "0.0.0.0:3000")?;

        // Dispatch timers
        let scheduler_start_hour = parse_hour("SCHEDULER_START_HOUR", 3)?;
        let scheduler_end_hour = parse_hour("SCHEDULER_END_HOUR", 5)?;
        let publication_hour = parse_hour("PUBLICATION_HOUR", 11)?;
        let timezone = parse_from_str("TIMEZONE_PUBLICATION", "Europe/Moscow")?;
        let window_hours = parse_u32("PUBLICATION_WINDOW_HOURS", 24)?;
        if window_hours == 0 {
            return Err(ConfigError::Invalid {
                name: "PUBLICATION_WINDOW_HOURS",
                source: anyhow::anyhow!("window must be at least one hour"),
            });
        }
        let publication_window = chrono::Duration::hours(i64::from(window_hours));

        // Consumer retry budget (0 = unbounded requeue)
        let max_delivery_attempts = parse_u32("MAX_DELIVERY_ATTEMPTS", 5)?;
        let retry_backoff_base_ms = parse_u64("RETRY_BACKOFF_BASE_MS", 500)?;
        let retry_backoff_cap_ms = parse_u64("RETRY_BACKOFF_CAP_MS", 30_000)?;
        let idempotency_ledger_enabled = parse_bool("IDEMPOTENCY_LEDGER_ENABLED", true)?;

        // Summarization
        let openai_api_key = optional_var("OPENAI_API_KEY");
        let openai_base_url =
            env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/".to_string());
        let openai_model = env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let summary_max_length = parse_usize("SUMMARY_MAX_LENGTH", 1000)?;
        let summary_timeout = parse_duration_secs("SUMMARY_TIMEOUT_SECS", 60)?;

        // Telegram delivery
        let bot_token = optional_var("BOT_TOKEN");
        let owner_chat_id = optional_var("OWNER_TELEGRAM_USER_ID");
        let channel_chat_id = optional_var("CHANNEL_CHAT_ID");
        let telegram_api_base_url = env::var("TELEGRAM_API_BASE_URL")
            .unwrap_or_else(|_| "https://api.telegram.org/".to_string());
        let dry_run_telegram = parse_bool("DRY_RUN_TELEGRAM", true)?;

        // Observability
        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let otel_exporter_endpoint = optional_var("OTEL_EXPORTER_OTLP_ENDPOINT");
        let otel_sampling_ratio = parse_f64("OTEL_SAMPLING_RATIO", 1.0)?;

        Ok(Self {
            run_mode,
            amqp_url,
            database_url,
            database_max_connections,
            database_acquire_timeout,
            gateway_http_bind,
            scheduler_start_hour,
            scheduler_end_hour,
            publication_hour,
            timezone,
            publication_window,
            max_delivery_attempts,
            retry_backoff_base_ms,
            retry_backoff_cap_ms,
            idempotency_ledger_enabled,
            openai_api_key,
            openai_base_url,
            openai_model,
            summary_max_length,
            summary_timeout,
            bot_token,
            owner_chat_id,
            channel_chat_id,
            telegram_api_base_url,
            dry_run_telegram,
            log_level,
            otel_exporter_endpoint,
            otel_sampling_ratio,
        })
    }

    /// Validates and returns the summarizer settings.
    ///
    /// # Errors
    /// Returns [`ConfigError::Missing`] when `OPENAI_API_KEY` is not set.
    pub fn require_openai(&self) -> Result<OpenAiSettings, ConfigError> {
        let api_key = self
            .openai_api_key
            .clone()
            .ok_or(ConfigError::Missing("OPENAI_API_KEY"))?;
        Ok(OpenAiSettings {
            api_key,
            base_url: self.openai_base_url.clone(),
            model: self.openai_model.clone(),
            max_length: self.summary_max_length,
            timeout: self.summary_timeout,
        })
    }

    /// Validates and returns the publisher settings.
    ///
    /// Dry-run mode only needs placeholder chats, so the token and chat ids are
    /// required only when messages are really sent.
    ///
    /// # Errors
    /// Returns [`ConfigError::Missing`] for the first absent variable.
    pub fn require_telegram(&self) -> Result<TelegramSettings, ConfigError> {
        let pick = |value: &Option<String>, name: &'static str| -> Result<String, ConfigError> {
            match (value, self.dry_run_telegram) {
                (Some(value), _) => Ok(value.clone()),
                (None, true) => Ok(String::new()),
                (None, false) => Err(ConfigError::Missing(name)),
            }
        };
        Ok(TelegramSettings {
            bot_token: pick(&self.bot_token, "BOT_TOKEN")?,
            owner_chat_id: pick(&self.owner_chat_id, "OWNER_TELEGRAM_USER_ID")?,
            channel_chat_id: pick(&self.channel_chat_id, "CHANNEL_CHAT_ID")?,
            api_base_url: self.telegram_api_base_url.clone(),
            dry_run: self.dry_run_telegram,
        })
    }

    #[must_use]
    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    #[must_use]
    pub fn is_development(&self) -> bool {
        self.run_mode == RunMode::Development
    }

    #[must_use]
    pub fn amqp_url(&self) -> &str {
        &self.amqp_url
    }

    #[must_use]
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    #[must_use]
    pub fn database_max_connections(&self) -> u32 {
        self.database_max_connections
    }

    #[must_use]
    pub fn database_acquire_timeout(&self) -> Duration {
        self.database_acquire_timeout
    }

    #[must_use]
    pub fn gateway_http_bind(&self) -> SocketAddr {
        self.gateway_http_bind
    }

    #[must_use]
    pub fn scheduler_start_hour(&self) -> u32 {
        self.scheduler_start_hour
    }

    #[must_use]
    pub fn scheduler_end_hour(&self) -> u32 {
        self.scheduler_end_hour
    }

    #[must_use]
    pub fn publication_hour(&self) -> u32 {
        self.publication_hour
    }

    #[must_use]
    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    #[must_use]
    pub fn publication_window(&self) -> chrono::Duration {
        self.publication_window
    }

    #[must_use]
    pub fn max_delivery_attempts(&self) -> u32 {
        self.max_delivery_attempts
    }

    #[must_use]
    pub fn retry_backoff_base_ms(&self) -> u64 {
        self.retry_backoff_base_ms
    }

    #[must_use]
    pub fn retry_backoff_cap_ms(&self) -> u64 {
        self.retry_backoff_cap_ms
    }

    #[must_use]
    pub fn idempotency_ledger_enabled(&self) -> bool {
        self.idempotency_ledger_enabled
    }

    #[must_use]
    pub fn channel_chat_id(&self) -> Option<&str> {
        self.channel_chat_id.as_deref()
    }

    #[must_use]
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    #[must_use]
    pub fn otel_exporter_endpoint(&self) -> Option<&str> {
        self.otel_exporter_endpoint.as_deref()
    }

    #[must_use]
    pub fn otel_sampling_ratio(&self) -> f64 {
        self.otel_sampling_ratio
    }
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn optional_var(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_socket_addr(name: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_from_str<T>(name: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim().parse::<T>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::anyhow!("{error}"),
    })
}

fn parse_hour(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    let hour = parse_u32(name, default)?;
    if hour > 23 {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("hour must be between 0 and 23, got {hour}"),
        });
    }
    Ok(hour)
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim().parse::<u32>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim().parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim().parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_f64(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim().parse::<f64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_duration_secs(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse_u64(name, default).map(Duration::from_secs)
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Ok(true),
        "false" | "0" | "no" | "n" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("invalid boolean value: {raw}"),
        }),
    }
}
