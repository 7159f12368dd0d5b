use crate::http::build_client;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shop_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn shop(shop_id: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            order_id: None,
            shop_id: Some(shop_id.to_string()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_order(mut self, order_id: &str) -> Self {
        self.order_id = Some(order_id.to_string());
        self
    }
}

/// Operational alert channel. Implementations must never fail the caller.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: Alert);
}

pub struct WebhookAlerts {
    url: Option<String>,
    http: Client,
}

impl WebhookAlerts {
    pub fn new(url: Option<String>) -> Self {
        if url.is_none() {
            info!(
                target = "dropship.alerts",
                "ALERT_WEBHOOK_URL not set; alerts will only be logged"
            );
        }
        Self {
            url,
            http: build_client(),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlerts {
    async fn send(&self, alert: Alert) {
        warn!(
            target = "dropship.alerts",
            code = %alert.code,
            shop_id = alert.shop_id.as_deref().unwrap_or("-"),
            order_id = alert.order_id.as_deref().unwrap_or("-"),
            "{}",
            alert.message
        );
        let Some(url) = &self.url else {
            return;
        };
        match self.http.post(url).json(&alert).send().await {
            Ok(response) if !response.status().is_success() => {
                warn!(target = "dropship.alerts", status = %response.status(), "alert_webhook_rejected");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(target = "dropship.alerts", error = %err, "alert_webhook_failed");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_webhook_is_swallowed() {
        let alerts = WebhookAlerts::new(Some("http://127.0.0.1:9/hook".into()));
        alerts
            .send(Alert::shop("shop-1", "SHOPEE_POLL_FAILED", "boom").with_order("250101ABC"))
            .await;
    }

    #[test]
    fn payload_uses_camel_case_and_omits_missing_ids() {
        let mut alert = Alert::shop("shop-1", "CODE", "msg");
        alert.shop_id = None;
        let value = serde_json::to_value(alert.with_order("o-1")).unwrap();
        assert_eq!(value["orderId"], "o-1");
        assert!(value.get("shopId").is_none());
        assert!(value.get("timestamp").is_some());
    }
}
