use std::env;

/// Runtime configuration, read once at startup.
///
/// Required values abort immediately with a clear message; everything else
/// carries a default.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Base URL of the hosted database service.
    pub database_url: String,
    pub database_service_key: String,
    pub email_api_url: String,
    pub email_api_key: String,
    pub email_from: String,
    /// Portal base URL, injected into template payloads as `app_url`.
    pub app_base_url: String,
    /// Shared secret for the queue trigger; empty disables the check.
    pub cron_secret: String,
    /// Empty list means "allow all" (reflect `*`).
    pub allowed_origins: Vec<String>,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window_ms: i64,
    pub email_batch_size: usize,
    pub email_max_attempts: i32,
    /// In-process queue scheduler interval; 0 disables it.
    pub email_queue_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let database_service_key =
            env::var("DATABASE_SERVICE_KEY").expect("DATABASE_SERVICE_KEY must be set");
        let email_api_key = env::var("EMAIL_API_KEY").expect("EMAIL_API_KEY must be set");
        let email_from = env::var("EMAIL_FROM").expect("EMAIL_FROM must be set");
        let app_base_url = env::var("APP_BASE_URL").expect("APP_BASE_URL must be set");

        Config {
            port: env_parsed("PORT", 8080),
            database_url,
            database_service_key,
            email_api_url: env::var("EMAIL_API_URL")
                .unwrap_or_else(|_| "https://api.resend.com/emails".into()),
            email_api_key,
            email_from,
            app_base_url,
            cron_secret: env::var("CRON_SECRET").unwrap_or_default(),
            allowed_origins: parse_origins(&env::var("ALLOWED_ORIGINS").unwrap_or_default()),
            rate_limit_max_requests: env_parsed("RATE_LIMIT_MAX_REQUESTS", 60),
            rate_limit_window_ms: env_parsed("RATE_LIMIT_WINDOW_MS", 60_000),
            email_batch_size: env_parsed("EMAIL_BATCH_SIZE", 10),
            email_max_attempts: env_parsed("EMAIL_MAX_ATTEMPTS", 3),
            email_queue_interval_secs: env_parsed("EMAIL_QUEUE_INTERVAL_SECS", 0),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Comma-separated allow-list; entries are trimmed, empties dropped.
pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
