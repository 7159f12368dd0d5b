use once_cell::sync::Lazy;
use std::env;

pub static SHOPEE_ENV: Lazy<String> =
    Lazy::new(|| env::var("SHOPEE_ENV").unwrap_or_else(|_| "SANDBOX".to_string()));

pub static PARTNER_ID: Lazy<Option<i64>> = Lazy::new(|| {
    env::var("SHOPEE_PARTNER_ID")
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
});

pub static PARTNER_KEY: Lazy<String> =
    Lazy::new(|| env::var("SHOPEE_PARTNER_KEY").unwrap_or_default());

pub static ROOT: Lazy<String> = Lazy::new(|| {
    if let Ok(host) = env::var("SHOPEE_HOST") {
        return host.trim_end_matches('/').to_string();
    }
    if SHOPEE_ENV.as_str().eq_ignore_ascii_case("PROD") {
        "https://partner.shopeemobile.com".to_string()
    } else {
        "https://partner.test-stable.shopeemobile.com".to_string()
    }
});

/// Shopee rejects order-list windows wider than fifteen days.
pub const MAX_WINDOW_DAYS: i64 = 15;

pub const PAGE_SIZE: u32 = 100;
