use crate::crypto::EncryptedSecret;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use uuid::Uuid;

/// Order state as reported by the source marketplace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketplaceStatus {
    #[default]
    Unpaid,
    ReadyToShip,
    Shipped,
    Completed,
    Cancelled,
    Returned,
}

impl MarketplaceStatus {
    /// Total mapping from Shopee's free-text status. Anything unrecognised
    /// lands on `Unpaid`, which is never actionable.
    pub fn from_shopee(input: &str) -> Self {
        match input.trim().to_uppercase().as_str() {
            "READY_TO_SHIP" | "PROCESSED" | "RETRY_SHIP" => Self::ReadyToShip,
            "SHIPPED" | "TO_CONFIRM_RECEIVE" => Self::Shipped,
            "COMPLETED" => Self::Completed,
            "CANCELLED" | "IN_CANCEL" => Self::Cancelled,
            "TO_RETURN" | "RETURNED" => Self::Returned,
            _ => Self::Unpaid,
        }
    }

    pub fn is_actionable(&self) -> bool {
        matches!(self, Self::ReadyToShip | Self::Shipped | Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    #[default]
    Unprocessed,
    Queued,
    Processing,
    ManualReview,
    Skipped,
    Fulfilled,
}

impl ProcessingStatus {
    /// Orders in these states are owned by an in-flight or finished job and
    /// must not be picked up again by the poller.
    pub fn blocks_requeue(&self) -> bool {
        matches!(self, Self::Queued | Self::Processing | Self::Fulfilled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprocessed => "UNPROCESSED",
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::ManualReview => "MANUAL_REVIEW",
            Self::Skipped => "SKIPPED",
            Self::Fulfilled => "FULFILLED",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingMode {
    #[default]
    Manual,
    Auto,
    AutoDryRun,
}

impl ProcessingMode {
    pub fn for_dry_run(is_dry_run: bool) -> Self {
        if is_dry_run {
            Self::AutoDryRun
        } else {
            Self::Auto
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutonomyMode {
    #[default]
    ManualOnly,
    AutoWithReviewBand,
    AutoStrict,
}

/// Per-tenant automation settings. Only `last_polled_at` is written by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShopConfig {
    pub shop_id: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub is_dry_run: bool,
    #[serde(default)]
    pub autonomy_mode: AutonomyMode,
    #[serde(default)]
    pub min_expected_profit: f64,
    pub max_shipping_days: u32,
    #[serde(default)]
    pub review_band_percent: Option<f64>,
    #[serde(default)]
    pub include_loyalty_credit: bool,
    #[serde(default)]
    pub include_domestic_shipping: bool,
    #[serde(default)]
    pub domestic_shipping_cost: f64,
    #[serde(default)]
    pub last_polled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItem {
    pub item_id: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default = "LineItem::default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub target_url: Option<String>,
}

impl LineItem {
    fn default_quantity() -> u32 {
        1
    }
}

/// Order payload: the resolved destination product is kept apart from the
/// opaque upstream blob so no caller has to probe raw JSON for it.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct OrderPayload {
    #[serde(default)]
    pub resolved_target_url: Option<String>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub upstream: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub shop_id: String,
    pub shopee_order_id: String,
    pub total_amount: f64,
    pub currency: String,
    pub marketplace_status: MarketplaceStatus,
    pub processing_status: ProcessingStatus,
    pub processing_mode: ProcessingMode,
    #[serde(default)]
    pub payload: OrderPayload,
    #[serde(default)]
    pub expected_profit: Option<f64>,
    #[serde(default)]
    pub shipping_days: Option<u32>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Upstream fields written by the poller. Processing fields are only set when
/// the row is first inserted.
#[derive(Debug, Clone, Serialize)]
pub struct NewOrder {
    pub shop_id: String,
    pub shopee_order_id: String,
    pub total_amount: f64,
    pub currency: String,
    pub marketplace_status: MarketplaceStatus,
    pub payload: OrderPayload,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct OrderUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_status: Option<ProcessingStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_mode: Option<ProcessingMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_profit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipping_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<Option<String>>,
}

impl OrderUpdate {
    pub fn status(status: ProcessingStatus, mode: ProcessingMode) -> Self {
        Self {
            processing_status: Some(status),
            processing_mode: Some(mode),
            ..Self::default()
        }
    }

    pub fn estimate(expected_profit: f64, shipping_days: u32) -> Self {
        Self {
            expected_profit: Some(expected_profit),
            shipping_days: Some(shipping_days),
            ..Self::default()
        }
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = Some(Some(code.into()));
        self.error_message = Some(Some(message.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error_code = Some(None);
        self.error_message = Some(None);
        self
    }

    pub fn apply(&self, order: &mut Order) {
        if let Some(status) = self.processing_status {
            order.processing_status = status;
        }
        if let Some(mode) = self.processing_mode {
            order.processing_mode = mode;
        }
        if let Some(profit) = self.expected_profit {
            order.expected_profit = Some(profit);
        }
        if let Some(days) = self.shipping_days {
            order.shipping_days = Some(days);
        }
        if let Some(code) = &self.error_code {
            order.error_code = code.clone();
        }
        if let Some(message) = &self.error_message {
            order.error_message = message.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductMapping {
    pub shop_id: String,
    pub shopee_item_id: String,
    pub amazon_url: String,
    #[serde(default = "ProductMapping::default_active")]
    pub is_active: bool,
}

impl ProductMapping {
    fn default_active() -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShopeeCredentialRecord {
    pub shop_id: String,
    pub shopee_shop_id: i64,
    pub access_token: EncryptedSecret,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmazonCredentialRecord {
    pub shop_id: String,
    pub email: String,
    pub password: EncryptedSecret,
    #[serde(default)]
    pub address_label: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetOrderStatus {
    Created,
    Placed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetOrder {
    pub id: Uuid,
    pub order_id: Uuid,
    pub shop_id: String,
    pub external_order_id: Option<String>,
    pub status: TargetOrderStatus,
    pub purchase_price: f64,
    pub currency: String,
    pub shipping_cost: f64,
    pub loyalty_credit_used: f64,
    pub placed_at: Option<DateTime<Utc>>,
}

/// Append-only audit/triage row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub shop_id: String,
    pub order_id: Option<Uuid>,
    pub shopee_order_id: Option<String>,
    pub product_url: Option<String>,
    pub error_code: String,
    pub reason: String,
    pub filter_failure_type: Option<String>,
    pub expected_profit: Option<f64>,
    pub shipping_days: Option<u32>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn for_order(order: &Order, code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            shop_id: order.shop_id.clone(),
            order_id: Some(order.id),
            shopee_order_id: Some(order.shopee_order_id.clone()),
            product_url: order.payload.resolved_target_url.clone(),
            error_code: code.into(),
            reason: reason.into(),
            filter_failure_type: None,
            expected_profit: order.expected_profit,
            shipping_days: order.shipping_days,
            metadata: json!({}),
            created_at: Utc::now(),
        }
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.product_url = Some(url.to_string());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_failure_type = Some(filter.into());
        self
    }

    pub fn with_estimate(mut self, expected_profit: f64, shipping_days: Option<u32>) -> Self {
        self.expected_profit = Some(expected_profit);
        self.shipping_days = shipping_days;
        self
    }

    pub fn with_screenshot(mut self, path: Option<&str>) -> Self {
        if let Some(path) = path {
            self.metadata["screenshotPath"] = json!(path);
        }
        self
    }
}

/// Error codes stamped by the pipeline itself. Browser automation codes live
/// on `AutomationErrorCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    MissingMapping,
    AmazonOutOfStock,
    AmazonUsedOnly,
    AmazonDeliveryUnknown,
    MissingAmazonCredentials,
    CredentialDecryptFailed,
    CheckoutInterrupted,
    TargetOrderPersistFailed,
    DecisionRejected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingMapping => "MISSING_MAPPING",
            Self::AmazonOutOfStock => "AMAZON_OUT_OF_STOCK",
            Self::AmazonUsedOnly => "AMAZON_USED_ONLY",
            Self::AmazonDeliveryUnknown => "AMAZON_DELIVERY_UNKNOWN",
            Self::MissingAmazonCredentials => "MISSING_AMAZON_CREDENTIALS",
            Self::CredentialDecryptFailed => "CREDENTIAL_DECRYPT_FAILED",
            Self::CheckoutInterrupted => "CHECKOUT_INTERRUPTED",
            Self::TargetOrderPersistFailed => "TARGET_ORDER_PERSIST_FAILED",
            Self::DecisionRejected => "DECISION_REJECTED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shopee_status_mapping_is_total() {
        assert_eq!(
            MarketplaceStatus::from_shopee("READY_TO_SHIP"),
            MarketplaceStatus::ReadyToShip
        );
        assert_eq!(
            MarketplaceStatus::from_shopee("processed"),
            MarketplaceStatus::ReadyToShip
        );
        assert_eq!(
            MarketplaceStatus::from_shopee("TO_CONFIRM_RECEIVE"),
            MarketplaceStatus::Shipped
        );
        assert_eq!(
            MarketplaceStatus::from_shopee("IN_CANCEL"),
            MarketplaceStatus::Cancelled
        );
        assert_eq!(
            MarketplaceStatus::from_shopee("TO_RETURN"),
            MarketplaceStatus::Returned
        );
        assert_eq!(
            MarketplaceStatus::from_shopee("SOMETHING_NEW"),
            MarketplaceStatus::Unpaid
        );
        assert_eq!(MarketplaceStatus::from_shopee(""), MarketplaceStatus::Unpaid);
    }

    #[test]
    fn only_shipping_states_are_actionable() {
        assert!(MarketplaceStatus::ReadyToShip.is_actionable());
        assert!(MarketplaceStatus::Shipped.is_actionable());
        assert!(MarketplaceStatus::Completed.is_actionable());
        assert!(!MarketplaceStatus::Unpaid.is_actionable());
        assert!(!MarketplaceStatus::Cancelled.is_actionable());
        assert!(!MarketplaceStatus::Returned.is_actionable());
    }

    #[test]
    fn order_update_serializes_only_set_fields() {
        let update = OrderUpdate::status(ProcessingStatus::ManualReview, ProcessingMode::Auto)
            .with_error("MISSING_MAPPING", "no mapping");
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["processing_status"], json!("MANUAL_REVIEW"));
        assert_eq!(value["processing_mode"], json!("AUTO"));
        assert_eq!(value["error_code"], json!("MISSING_MAPPING"));
        assert!(value.get("expected_profit").is_none());

        let cleared = serde_json::to_value(OrderUpdate::default().clear_error()).unwrap();
        assert_eq!(cleared["error_code"], Value::Null);
        assert!(cleared.as_object().unwrap().contains_key("error_code"));
    }
}
