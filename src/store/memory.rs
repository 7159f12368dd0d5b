use crate::models::{
    AmazonCredentialRecord, ErrorRecord, NewOrder, Order, OrderUpdate, ProcessingMode,
    ProcessingStatus, ProductMapping, ShopConfig, ShopeeCredentialRecord, TargetOrder,
};
use crate::store::{Store, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    shops: HashMap<String, ShopConfig>,
    orders: HashMap<Uuid, Order>,
    mappings: Vec<ProductMapping>,
    shopee_credentials: HashMap<String, ShopeeCredentialRecord>,
    amazon_credentials: HashMap<String, AmazonCredentialRecord>,
    target_orders: Vec<TargetOrder>,
    errors: Vec<ErrorRecord>,
    #[cfg(test)]
    faults: Faults,
}

#[cfg(test)]
#[derive(Default)]
struct Faults {
    upsert_refs: std::collections::HashSet<String>,
    target_orders: bool,
}

/// In-process store. Backs the tests and runs the worker without a database.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn shop_config(&self, shop_id: &str) -> Result<Option<ShopConfig>, StoreError> {
        Ok(self.tables().shops.get(shop_id).cloned())
    }

    async fn touch_last_polled(&self, shop_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let shop = tables
            .shops
            .get_mut(shop_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "shop",
                key: shop_id.to_string(),
            })?;
        shop.last_polled_at = Some(at);
        Ok(())
    }

    async fn order_by_ref(&self, shopee_order_id: &str) -> Result<Option<Order>, StoreError> {
        Ok(self
            .tables()
            .orders
            .values()
            .find(|order| order.shopee_order_id == shopee_order_id)
            .cloned())
    }

    async fn upsert_order(&self, new: &NewOrder) -> Result<Order, StoreError> {
        let mut tables = self.tables();
        #[cfg(test)]
        if tables.faults.upsert_refs.contains(&new.shopee_order_id) {
            return Err(StoreError::Request("injected upsert failure".into()));
        }
        let now = Utc::now();
        if let Some(existing) = tables
            .orders
            .values_mut()
            .find(|order| order.shopee_order_id == new.shopee_order_id)
        {
            existing.total_amount = new.total_amount;
            existing.currency = new.currency.clone();
            existing.marketplace_status = new.marketplace_status;
            existing.payload = new.payload.clone();
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let order = Order {
            id: Uuid::new_v4(),
            shop_id: new.shop_id.clone(),
            shopee_order_id: new.shopee_order_id.clone(),
            total_amount: new.total_amount,
            currency: new.currency.clone(),
            marketplace_status: new.marketplace_status,
            processing_status: ProcessingStatus::Unprocessed,
            processing_mode: ProcessingMode::Manual,
            payload: new.payload.clone(),
            expected_profit: None,
            shipping_days: None,
            error_code: None,
            error_message: None,
            updated_at: now,
        };
        tables.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn update_order(&self, id: Uuid, update: &OrderUpdate) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let order = tables.orders.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "order",
            key: id.to_string(),
        })?;
        update.apply(order);
        order.updated_at = Utc::now();
        Ok(())
    }

    async fn unprocessed_orders(&self, shop_id: &str) -> Result<Vec<Order>, StoreError> {
        let mut orders: Vec<Order> = self
            .tables()
            .orders
            .values()
            .filter(|o| o.shop_id == shop_id && o.processing_status == ProcessingStatus::Unprocessed)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.updated_at);
        Ok(orders)
    }

    async fn active_mapping(
        &self,
        shop_id: &str,
        shopee_item_id: &str,
    ) -> Result<Option<ProductMapping>, StoreError> {
        Ok(self
            .tables()
            .mappings
            .iter()
            .find(|m| m.shop_id == shop_id && m.shopee_item_id == shopee_item_id && m.is_active)
            .cloned())
    }

    async fn shopee_credentials(
        &self,
        shop_id: &str,
    ) -> Result<Option<ShopeeCredentialRecord>, StoreError> {
        Ok(self.tables().shopee_credentials.get(shop_id).cloned())
    }

    async fn amazon_credentials(
        &self,
        shop_id: &str,
    ) -> Result<Option<AmazonCredentialRecord>, StoreError> {
        Ok(self.tables().amazon_credentials.get(shop_id).cloned())
    }

    async fn insert_target_order(&self, target: &TargetOrder) -> Result<(), StoreError> {
        let mut tables = self.tables();
        #[cfg(test)]
        if tables.faults.target_orders {
            return Err(StoreError::Request("injected target order failure".into()));
        }
        tables.target_orders.push(target.clone());
        Ok(())
    }

    async fn insert_error(&self, record: &ErrorRecord) -> Result<(), StoreError> {
        self.tables().errors.push(record.clone());
        Ok(())
    }

    async fn target_orders_for(&self, order_id: Uuid) -> Result<Vec<TargetOrder>, StoreError> {
        Ok(self
            .tables()
            .target_orders
            .iter()
            .filter(|t| t.order_id == order_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
impl MemoryStore {
    pub fn put_shop(&self, shop: ShopConfig) {
        self.tables().shops.insert(shop.shop_id.clone(), shop);
    }

    pub fn put_order(&self, order: Order) {
        self.tables().orders.insert(order.id, order);
    }

    pub fn put_mapping(&self, mapping: ProductMapping) {
        self.tables().mappings.push(mapping);
    }

    pub fn put_shopee_credentials(&self, record: ShopeeCredentialRecord) {
        self.tables()
            .shopee_credentials
            .insert(record.shop_id.clone(), record);
    }

    pub fn put_amazon_credentials(&self, record: AmazonCredentialRecord) {
        self.tables()
            .amazon_credentials
            .insert(record.shop_id.clone(), record);
    }

    pub fn order(&self, shopee_order_id: &str) -> Option<Order> {
        self.tables()
            .orders
            .values()
            .find(|o| o.shopee_order_id == shopee_order_id)
            .cloned()
    }

    pub fn shop(&self, shop_id: &str) -> Option<ShopConfig> {
        self.tables().shops.get(shop_id).cloned()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.tables().orders.values().cloned().collect()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.tables().errors.clone()
    }

    pub fn target_orders(&self) -> Vec<TargetOrder> {
        self.tables().target_orders.clone()
    }

    pub fn fail_upsert_for(&self, shopee_order_id: &str) {
        self.tables()
            .faults
            .upsert_refs
            .insert(shopee_order_id.to_string());
    }

    pub fn fail_target_orders(&self) {
        self.tables().faults.target_orders = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MarketplaceStatus, OrderPayload};

    fn new_order(status: MarketplaceStatus, total: f64) -> NewOrder {
        NewOrder {
            shop_id: "shop-1".into(),
            shopee_order_id: "SN1".into(),
            total_amount: total,
            currency: "JPY".into(),
            marketplace_status: status,
            payload: OrderPayload::default(),
        }
    }

    #[tokio::test]
    async fn upsert_inserts_once_and_preserves_processing_fields() {
        let store = MemoryStore::new();
        let first = store
            .upsert_order(&new_order(MarketplaceStatus::Unpaid, 100.0))
            .await
            .unwrap();
        assert_eq!(first.processing_status, ProcessingStatus::Unprocessed);

        store
            .update_order(
                first.id,
                &OrderUpdate::status(ProcessingStatus::Fulfilled, ProcessingMode::Auto),
            )
            .await
            .unwrap();
        let second = store
            .upsert_order(&new_order(MarketplaceStatus::ReadyToShip, 120.0))
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.processing_status, ProcessingStatus::Fulfilled);
        assert_eq!(second.marketplace_status, MarketplaceStatus::ReadyToShip);
        assert_eq!(second.total_amount, 120.0);
        assert_eq!(store.orders().len(), 1);
    }

    #[tokio::test]
    async fn updating_a_missing_order_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update_order(Uuid::new_v4(), &OrderUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "order", .. }));
    }
}
