use std::{env, fmt, net::SocketAddr, str::FromStr};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://hooksink.db";
/// Longest accepted rate limit window (one day).
pub const MAX_RATE_LIMIT_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;
pub const DEFAULT_CLIENT_IP_HEADERS: &str = "x-real-ip,x-forwarded-for,cf-connecting-ip,x-client-ip";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Limits applied to the webhook ingestion path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestLimits {
    pub rate_limit_window_ms: u64,
    pub rate_limit_max_requests: u32,
    pub rate_limit_sweep_threshold: usize,
    pub max_requests_per_listener: u64,
    pub max_body_bytes: usize,
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            rate_limit_window_ms: 60_000,
            rate_limit_max_requests: 100,
            rate_limit_sweep_threshold: 10_000,
            max_requests_per_listener: 1000,
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub public_url: String,
    pub database_url: String,
    pub database_max_connections: u32,
    pub limits: IngestLimits,
    /// Headers consulted, in order, to resolve the caller's address.
    pub client_ip_headers: Vec<String>,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr: SocketAddr = env::var("APP_BIND_ADDR")
            .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .map_err(ConfigError::BindAddress)?;

        let public_url = env::var("APP_PUBLIC_URL")
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| format!("http://{bind_addr}"));
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        let database_max_connections = read_number("DATABASE_MAX_CONNECTIONS", 5)?;

        let defaults = IngestLimits::default();
        let limits = IngestLimits {
            rate_limit_window_ms: read_number("RATE_LIMIT_WINDOW_MS", defaults.rate_limit_window_ms)?,
            rate_limit_max_requests: read_number(
                "RATE_LIMIT_MAX_REQUESTS",
                defaults.rate_limit_max_requests,
            )?,
            rate_limit_sweep_threshold: read_number(
                "RATE_LIMIT_SWEEP_THRESHOLD",
                defaults.rate_limit_sweep_threshold,
            )?,
            max_requests_per_listener: read_number(
                "MAX_REQUESTS_PER_LISTENER",
                defaults.max_requests_per_listener,
            )?,
            max_body_bytes: read_number("WEBHOOK_MAX_BODY_BYTES", defaults.max_body_bytes)?,
        };

        if limits.rate_limit_window_ms > MAX_RATE_LIMIT_WINDOW_MS {
            return Err(ConfigError::WindowTooLong(limits.rate_limit_window_ms));
        }

        let raw_headers = env::var("CLIENT_IP_HEADERS")
            .unwrap_or_else(|_| DEFAULT_CLIENT_IP_HEADERS.to_string());
        let client_ip_headers = parse_header_list(&raw_headers);
        if client_ip_headers.is_empty() {
            return Err(ConfigError::EmptyClientIpHeaders);
        }

        Ok(Self {
            bind_addr,
            environment,
            public_url,
            database_url,
            database_max_connections,
            limits,
            client_ip_headers,
        })
    }
}

fn parse_header_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Reads a positive number, falling back to `default` when the variable is unset.
fn read_number<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
{
    let Ok(raw) = env::var(name) else {
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value != T::default() => Ok(value),
        _ => Err(ConfigError::InvalidNumber { name, value: raw }),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidNumber { name: &'static str, value: String },
    WindowTooLong(u64),
    EmptyClientIpHeaders,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidNumber { name, value } => {
                write!(f, "{name} must be a positive integer (got {value})")
            }
            Self::WindowTooLong(value) => write!(
                f,
                "RATE_LIMIT_WINDOW_MS must not exceed {MAX_RATE_LIMIT_WINDOW_MS} (got {value})"
            ),
            Self::EmptyClientIpHeaders => {
                write!(f, "CLIENT_IP_HEADERS must name at least one header")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
