use crate::http::build_client;
use crate::shopee::config::{PARTNER_ID, PARTNER_KEY, ROOT};
use crate::shopee::orders::{self, OrderDetail, OrderListing};
use crate::shopee::shop::{self, ShopInfo};
use crate::shopee::sign::sign_request;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ShopeeError {
    #[error("shopee partner credentials are not configured")]
    MissingPartner,
    #[error("shopee request failed: {0}")]
    Transport(String),
    #[error("shopee returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("shopee api error `{error}`: {message}")]
    Api { error: String, message: String },
    #[error("invalid shopee response: {0}")]
    Decode(String),
}

/// Decrypted per-shop credentials.
#[derive(Debug, Clone)]
pub struct ShopAuth {
    pub shop_id: i64,
    pub access_token: String,
}

/// Read-only view of the source marketplace. Never retries on its own:
/// each attempt must be re-signed with a fresh timestamp.
#[async_trait]
pub trait ShopeeApi: Send + Sync {
    async fn list_new_orders(
        &self,
        auth: &ShopAuth,
        since: Option<DateTime<Utc>>,
    ) -> Result<OrderListing, ShopeeError>;

    async fn get_order_detail(
        &self,
        auth: &ShopAuth,
        order_sn: &str,
    ) -> Result<Option<OrderDetail>, ShopeeError>;

    async fn get_shop_identity(&self, auth: &ShopAuth) -> Result<ShopInfo, ShopeeError>;
}

#[derive(Clone)]
pub struct ShopeeClient {
    root: String,
    partner_id: Option<i64>,
    partner_key: String,
    http: Client,
}

impl ShopeeClient {
    pub fn from_env() -> Self {
        Self {
            root: ROOT.clone(),
            partner_id: *PARTNER_ID,
            partner_key: PARTNER_KEY.clone(),
            http: build_client(),
        }
    }

    /// Signed GET against a shop-level endpoint; unwraps Shopee's
    /// `{error, message}` envelope, which can report failures under HTTP 200.
    pub(crate) async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        auth: &ShopAuth,
        params: &[(&str, String)],
    ) -> Result<T, ShopeeError> {
        let partner_id = self.partner_id.ok_or(ShopeeError::MissingPartner)?;
        if self.partner_key.is_empty() {
            return Err(ShopeeError::MissingPartner);
        }
        let signed = sign_request(
            partner_id,
            &self.partner_key,
            path,
            Utc::now().timestamp(),
            Some(&auth.access_token),
            Some(auth.shop_id),
        );
        let url = format!("{}{}", self.root, path);
        debug!(target = "dropship.shopee", path, shop_id = auth.shop_id, "shopee_request");
        let response = self
            .http
            .get(url)
            .query(&signed.as_query())
            .query(params)
            .send()
            .await
            .map_err(|err| ShopeeError::Transport(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ShopeeError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(ShopeeError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let value: Value =
            serde_json::from_str(&body).map_err(|err| ShopeeError::Decode(err.to_string()))?;
        check_envelope(&value)?;
        serde_json::from_value(value).map_err(|err| ShopeeError::Decode(err.to_string()))
    }
}

pub(crate) fn check_envelope(value: &Value) -> Result<(), ShopeeError> {
    let error = value.get("error").and_then(Value::as_str).unwrap_or("");
    if error.is_empty() {
        return Ok(());
    }
    Err(ShopeeError::Api {
        error: error.to_string(),
        message: value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

#[async_trait]
impl ShopeeApi for ShopeeClient {
    async fn list_new_orders(
        &self,
        auth: &ShopAuth,
        since: Option<DateTime<Utc>>,
    ) -> Result<OrderListing, ShopeeError> {
        orders::list_orders_since(self, auth, since, Utc::now()).await
    }

    async fn get_order_detail(
        &self,
        auth: &ShopAuth,
        order_sn: &str,
    ) -> Result<Option<OrderDetail>, ShopeeError> {
        orders::fetch_order_detail(self, auth, order_sn).await
    }

    async fn get_shop_identity(&self, auth: &ShopAuth) -> Result<ShopInfo, ShopeeError> {
        shop::fetch_shop_info(self, auth).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_error_under_http_200_is_api_error() {
        let err = check_envelope(&json!({
            "error": "error_auth",
            "message": "Invalid access_token.",
            "response": {}
        }))
        .unwrap_err();
        match err {
            ShopeeError::Api { error, message } => {
                assert_eq!(error, "error_auth");
                assert_eq!(message, "Invalid access_token.");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(check_envelope(&json!({"error": "", "response": {}})).is_ok());
        assert!(check_envelope(&json!({"response": {}})).is_ok());
    }

    #[tokio::test]
    async fn missing_partner_config_fails_before_network() {
        let client = ShopeeClient {
            root: "http://127.0.0.1:9".into(),
            partner_id: None,
            partner_key: String::new(),
            http: build_client(),
        };
        let auth = ShopAuth {
            shop_id: 1,
            access_token: "t".into(),
        };
        let err = client.get_shop_identity(&auth).await.unwrap_err();
        assert!(matches!(err, ShopeeError::MissingPartner));
        assert_eq!(err.status(), None);
    }
}
