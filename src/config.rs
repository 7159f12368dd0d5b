use std::{env, path::PathBuf, time::Duration};

/// Runtime settings for the worker process, read once at startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub job_attempts: u32,
    pub job_backoff: Duration,
    pub poll_interval: Duration,
    pub queue_tick: Duration,
    pub session_idle: Duration,
    pub session_dir: PathBuf,
    pub screenshot_dir: PathBuf,
    pub webdriver_url: String,
    pub headless: bool,
    pub action_timeout: Duration,
    pub navigation_timeout: Duration,
    pub amazon_base_url: String,
    pub default_currency: String,
    pub selectors_path: Option<PathBuf>,
    pub alert_webhook_url: Option<String>,
    pub credentials_key: Option<String>,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            concurrency: env_parse("WORKER_CONCURRENCY", 2usize).max(1),
            job_attempts: env_parse("JOB_ATTEMPTS", 3u32).max(1),
            job_backoff: Duration::from_millis(env_parse("JOB_BACKOFF_MS", 5_000u64)),
            poll_interval: Duration::from_secs(env_parse("POLL_INTERVAL_SECS", 60u64).max(1)),
            queue_tick: Duration::from_millis(env_parse("QUEUE_TICK_MS", 1_000u64).max(50)),
            session_idle: Duration::from_secs(env_parse("SESSION_IDLE_SECS", 600u64)),
            session_dir: env_path("SESSION_DIR", "./data/sessions"),
            screenshot_dir: env_path("SCREENSHOT_DIR", "./data/screenshots"),
            webdriver_url: env::var("WEBDRIVER_URL")
                .unwrap_or_else(|_| "http://localhost:9515".to_string()),
            headless: env::var("BROWSER_HEADLESS")
                .map(|_| parse_env_bool("BROWSER_HEADLESS"))
                .unwrap_or(true),
            action_timeout: Duration::from_millis(env_parse("ACTION_TIMEOUT_MS", 5_000u64)),
            navigation_timeout: Duration::from_millis(env_parse(
                "NAVIGATION_TIMEOUT_MS",
                30_000u64,
            )),
            amazon_base_url: env::var("AMAZON_BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "https://www.amazon.co.jp".to_string()),
            default_currency: env::var("DEFAULT_CURRENCY").unwrap_or_else(|_| "JPY".to_string()),
            selectors_path: env::var("SELECTORS_PATH").ok().map(PathBuf::from),
            alert_webhook_url: non_empty_var("ALERT_WEBHOOK_URL"),
            credentials_key: non_empty_var("CREDENTIALS_AES_KEY"),
        }
    }
}

pub fn parse_env_bool(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

pub fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

pub fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    PathBuf::from(non_empty_var(key).unwrap_or_else(|| default.to_string()))
}
