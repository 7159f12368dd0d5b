//! Read/write contracts the worker has with the shared database.

pub mod memory;
pub mod supabase;

use crate::models::{
    AmazonCredentialRecord, ErrorRecord, NewOrder, Order, OrderUpdate, ProductMapping, ShopConfig,
    ShopeeCredentialRecord, TargetOrder,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(String),
    #[error("store returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("invalid store response: {0}")]
    Deserialize(String),
    #[error("{entity} `{key}` not found")]
    NotFound { entity: &'static str, key: String },
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn shop_config(&self, shop_id: &str) -> Result<Option<ShopConfig>, StoreError>;

    /// The only shop-config field the worker writes.
    async fn touch_last_polled(&self, shop_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn order_by_ref(&self, shopee_order_id: &str) -> Result<Option<Order>, StoreError>;

    /// Inserts as UNPROCESSED/MANUAL, or refreshes only the upstream fields
    /// of an existing row. Never duplicates a marketplace reference.
    async fn upsert_order(&self, order: &NewOrder) -> Result<Order, StoreError>;

    async fn update_order(&self, id: Uuid, update: &OrderUpdate) -> Result<(), StoreError>;

    async fn unprocessed_orders(&self, shop_id: &str) -> Result<Vec<Order>, StoreError>;

    async fn active_mapping(
        &self,
        shop_id: &str,
        shopee_item_id: &str,
    ) -> Result<Option<ProductMapping>, StoreError>;

    async fn shopee_credentials(
        &self,
        shop_id: &str,
    ) -> Result<Option<ShopeeCredentialRecord>, StoreError>;

    async fn amazon_credentials(
        &self,
        shop_id: &str,
    ) -> Result<Option<AmazonCredentialRecord>, StoreError>;

    async fn insert_target_order(&self, target: &TargetOrder) -> Result<(), StoreError>;

    async fn insert_error(&self, record: &ErrorRecord) -> Result<(), StoreError>;

    async fn target_orders_for(&self, order_id: Uuid) -> Result<Vec<TargetOrder>, StoreError>;
}
