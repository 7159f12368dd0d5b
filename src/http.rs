use crate::config::env_parse;
use reqwest::Client;
use std::time::Duration;

pub fn build_client() -> Client {
    let timeout = env_parse("HTTP_TIMEOUT_SECS", 15u64);
    let connect = env_parse("HTTP_CONNECT_TIMEOUT_SECS", 5u64);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .user_agent(concat!("dropship-worker/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Client for the browser driver. Navigation calls block until the page
/// loads, so the request timeout has to sit above the navigation ceiling.
pub fn build_driver_client(navigation_timeout: Duration) -> Client {
    Client::builder()
        .timeout(navigation_timeout + Duration::from_secs(10))
        .connect_timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_else(|_| Client::new())
}
