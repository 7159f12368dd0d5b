use crate::config::non_empty_var;
use crate::http::build_client;
use crate::models::{
    AmazonCredentialRecord, ErrorRecord, NewOrder, Order, OrderUpdate, ProcessingMode,
    ProcessingStatus, ProductMapping, ShopConfig, ShopeeCredentialRecord, TargetOrder,
};
use crate::store::{Store, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

const SHOPS: &str = "shop_automation_settings";
const ORDERS: &str = "orders";
const MAPPINGS: &str = "product_mappings";
const SHOPEE_CREDENTIALS: &str = "shopee_credentials";
const AMAZON_CREDENTIALS: &str = "amazon_credentials";
const TARGET_ORDERS: &str = "amazon_orders";
const ERRORS: &str = "order_errors";

/// PostgREST access with the service-role key.
#[derive(Debug, Clone)]
pub struct SupabaseStore {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Serialize)]
struct OrderInsert<'a> {
    #[serde(flatten)]
    order: &'a NewOrder,
    processing_status: ProcessingStatus,
    processing_mode: ProcessingMode,
}

fn eq(value: &str) -> String {
    format!("eq.{}", urlencoding::encode(value))
}

impl SupabaseStore {
    pub fn from_env() -> Option<Self> {
        let base_url = non_empty_var("SUPABASE_URL")?;
        let service_key = non_empty_var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|| non_empty_var("SUPABASE_SERVICE_KEY"))?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(),
        })
    }

    fn table_url(&self, table: &str, query: &[(&str, String)]) -> String {
        let mut url = format!("{}/rest/v1/{}", self.base_url, table);
        for (index, (key, value)) in query.iter().enumerate() {
            url.push(if index == 0 { '?' } else { '&' });
            url.push_str(key);
            url.push('=');
            url.push_str(value);
        }
        url
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let response = self
            .authed(request)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, StoreError> {
        let url = self.table_url(table, query);
        debug!(target = "dropship.pipeline", table, "store_select");
        self.send(self.http.get(url))
            .await?
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))
    }

    async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, StoreError> {
        let mut query = query.to_vec();
        query.push(("limit", "1".into()));
        Ok(self.select(table, &query).await?.pop())
    }

    async fn insert<T: Serialize + ?Sized>(&self, table: &str, row: &T) -> Result<(), StoreError> {
        let url = self.table_url(table, &[]);
        self.send(
            self.http
                .post(url)
                .header("Prefer", "return=minimal")
                .json(row),
        )
        .await
        .map(|_| ())
    }

    async fn patch<T: Serialize + ?Sized>(
        &self,
        table: &str,
        query: &[(&str, String)],
        body: &T,
    ) -> Result<(), StoreError> {
        let url = self.table_url(table, query);
        self.send(
            self.http
                .patch(url)
                .header("Prefer", "return=minimal")
                .json(body),
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl Store for SupabaseStore {
    async fn shop_config(&self, shop_id: &str) -> Result<Option<ShopConfig>, StoreError> {
        self.select_one(SHOPS, &[("shop_id", eq(shop_id)), ("select", "*".into())])
            .await
    }

    async fn touch_last_polled(&self, shop_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.patch(
            SHOPS,
            &[("shop_id", eq(shop_id))],
            &json!({ "last_polled_at": at }),
        )
        .await
    }

    async fn order_by_ref(&self, shopee_order_id: &str) -> Result<Option<Order>, StoreError> {
        self.select_one(
            ORDERS,
            &[("shopee_order_id", eq(shopee_order_id)), ("select", "*".into())],
        )
        .await
    }

    // Insert-or-refresh in two steps: an existing row only gets its upstream
    // fields patched, so processing state is never clobbered by a re-poll.
    async fn upsert_order(&self, order: &NewOrder) -> Result<Order, StoreError> {
        if self.order_by_ref(&order.shopee_order_id).await?.is_some() {
            self.patch(
                ORDERS,
                &[("shopee_order_id", eq(&order.shopee_order_id))],
                &json!({
                    "total_amount": order.total_amount,
                    "currency": order.currency,
                    "marketplace_status": order.marketplace_status,
                    "payload": order.payload,
                    "updated_at": Utc::now(),
                }),
            )
            .await?;
        } else {
            let url = self.table_url(ORDERS, &[("on_conflict", "shopee_order_id".into())]);
            let row = OrderInsert {
                order,
                processing_status: ProcessingStatus::Unprocessed,
                processing_mode: ProcessingMode::Manual,
            };
            self.send(
                self.http
                    .post(url)
                    .header("Prefer", "resolution=ignore-duplicates,return=minimal")
                    .json(&row),
            )
            .await?;
        }
        self.order_by_ref(&order.shopee_order_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "order",
                key: order.shopee_order_id.clone(),
            })
    }

    async fn update_order(&self, id: Uuid, update: &OrderUpdate) -> Result<(), StoreError> {
        let mut body = serde_json::to_value(update)
            .map_err(|err| StoreError::Deserialize(err.to_string()))?;
        body["updated_at"] = json!(Utc::now());
        self.patch(ORDERS, &[("id", eq(&id.to_string()))], &body)
            .await
    }

    async fn unprocessed_orders(&self, shop_id: &str) -> Result<Vec<Order>, StoreError> {
        self.select(
            ORDERS,
            &[
                ("shop_id", eq(shop_id)),
                ("processing_status", eq(ProcessingStatus::Unprocessed.as_str())),
                ("order", "updated_at.asc".into()),
                ("select", "*".into()),
            ],
        )
        .await
    }

    async fn active_mapping(
        &self,
        shop_id: &str,
        shopee_item_id: &str,
    ) -> Result<Option<ProductMapping>, StoreError> {
        self.select_one(
            MAPPINGS,
            &[
                ("shop_id", eq(shop_id)),
                ("shopee_item_id", eq(shopee_item_id)),
                ("is_active", "is.true".into()),
                ("select", "*".into()),
            ],
        )
        .await
    }

    async fn shopee_credentials(
        &self,
        shop_id: &str,
    ) -> Result<Option<ShopeeCredentialRecord>, StoreError> {
        self.select_one(
            SHOPEE_CREDENTIALS,
            &[("shop_id", eq(shop_id)), ("select", "*".into())],
        )
        .await
    }

    async fn amazon_credentials(
        &self,
        shop_id: &str,
    ) -> Result<Option<AmazonCredentialRecord>, StoreError> {
        self.select_one(
            AMAZON_CREDENTIALS,
            &[("shop_id", eq(shop_id)), ("select", "*".into())],
        )
        .await
    }

    async fn insert_target_order(&self, target: &TargetOrder) -> Result<(), StoreError> {
        self.insert(TARGET_ORDERS, target).await
    }

    async fn insert_error(&self, record: &ErrorRecord) -> Result<(), StoreError> {
        self.insert(ERRORS, record).await
    }

    async fn target_orders_for(&self, order_id: Uuid) -> Result<Vec<TargetOrder>, StoreError> {
        self.select(
            TARGET_ORDERS,
            &[("order_id", eq(&order_id.to_string())), ("select", "*".into())],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MarketplaceStatus, OrderPayload};

    fn store() -> SupabaseStore {
        SupabaseStore {
            base_url: "https://db.test".into(),
            service_key: "key".into(),
            http: build_client(),
        }
    }

    #[test]
    fn filters_are_url_encoded() {
        let url = store().table_url(
            ORDERS,
            &[("shopee_order_id", eq("SN 1&x")), ("select", "*".into())],
        );
        assert_eq!(
            url,
            "https://db.test/rest/v1/orders?shopee_order_id=eq.SN%201%26x&select=*"
        );
    }

    #[test]
    fn insert_row_carries_initial_processing_state() {
        let order = NewOrder {
            shop_id: "shop-1".into(),
            shopee_order_id: "SN1".into(),
            total_amount: 15000.0,
            currency: "JPY".into(),
            marketplace_status: MarketplaceStatus::ReadyToShip,
            payload: OrderPayload::default(),
        };
        let row = serde_json::to_value(OrderInsert {
            order: &order,
            processing_status: ProcessingStatus::Unprocessed,
            processing_mode: ProcessingMode::Manual,
        })
        .unwrap();
        assert_eq!(row["shopee_order_id"], "SN1");
        assert_eq!(row["processing_status"], "UNPROCESSED");
        assert_eq!(row["processing_mode"], "MANUAL");
        assert_eq!(row["marketplace_status"], "READY_TO_SHIP");
    }

    #[tokio::test]
    async fn transport_failure_is_a_request_error() {
        let store = SupabaseStore {
            base_url: "http://127.0.0.1:9".into(),
            service_key: "key".into(),
            http: build_client(),
        };
        let err = store.shop_config("shop-1").await.unwrap_err();
        assert!(matches!(err, StoreError::Request(_)));
    }
}
