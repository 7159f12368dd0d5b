use crate::alerts::testing::RecordingAlerts;
use crate::browser::testing::{ScriptedBrowser, Site};
use crate::browser::automation::{AutomationError, AutomationErrorCode};
use crate::browser::scrape::{ProductScrape, ScrapeSession};
use crate::browser::{Automation, Browser, PurchaseRequest, PurchaseResult, ScrapedProduct};
use crate::crypto::{SecretBox, test_box};
use crate::jobs::{Backoff, MemoryQueue};
use crate::models::{
    AmazonCredentialRecord, AutonomyMode, LineItem, MarketplaceStatus, Order, OrderPayload,
    ProcessingMode, ProcessingStatus, ProductMapping, ShopConfig, ShopeeCredentialRecord,
};
use crate::pipeline::Pipeline;
use crate::shopee::client::ShopeeError;
use crate::shopee::orders::{OrderDetail, OrderListing};
use crate::shopee::shop::ShopInfo;
use crate::shopee::{OrderSummary, ShopAuth, ShopeeApi, Truncation};
use crate::store::MemoryStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use serde_json::json;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use uuid::Uuid;

pub const PRODUCT_URL: &str = "https://shop.test/dp/B1";
pub const ITEM_ID: &str = "884422";

pub fn product() -> ScrapedProduct {
    ScrapedProduct {
        price: Some(12000.0),
        currency: "JPY".into(),
        is_available: true,
        is_new: true,
        estimated_delivery_date: Some(Local::now().date_naive() + ChronoDuration::days(3)),
        loyalty_credit: Some(1200.0),
        shipping_text: None,
    }
}

pub fn shop() -> ShopConfig {
    ShopConfig {
        shop_id: "shop-1".into(),
        is_active: true,
        is_dry_run: false,
        autonomy_mode: AutonomyMode::AutoStrict,
        min_expected_profit: 1000.0,
        max_shipping_days: 7,
        review_band_percent: None,
        include_loyalty_credit: true,
        include_domestic_shipping: true,
        domestic_shipping_cost: 800.0,
        last_polled_at: None,
    }
}

/// Automation double. Scrape sessions are real scripted pages so closes can
/// be counted.
pub struct FakeAutomation {
    browser: ScriptedBrowser,
    product: Mutex<ScrapedProduct>,
    purchase: Mutex<Result<PurchaseResult, AutomationError>>,
    fail_scrape: AtomicBool,
    stall_purchase: AtomicBool,
    pub scrapes: AtomicUsize,
    pub purchases: Mutex<Vec<PurchaseRequest>>,
}

impl FakeAutomation {
    fn new() -> Self {
        Self {
            browser: ScriptedBrowser::new(Site::default()),
            product: Mutex::new(product()),
            purchase: Mutex::new(Ok(PurchaseResult {
                external_order_id: "503-1234567-7654321".into(),
                final_price: Some(12480.0),
                currency: Some("JPY".into()),
            })),
            fail_scrape: AtomicBool::new(false),
            stall_purchase: AtomicBool::new(false),
            scrapes: AtomicUsize::new(0),
            purchases: Mutex::new(Vec::new()),
        }
    }

    pub fn set_product(&self, product: ScrapedProduct) {
        *self.product.lock().unwrap() = product;
    }

    pub fn fail_purchase(&self, code: AutomationErrorCode, message: &str) {
        *self.purchase.lock().unwrap() = Err(AutomationError::new(code, message)
            .with_screenshot(Some(format!("/shots/{}.png", code.as_str().to_lowercase()))));
    }

    pub fn set_purchase(&self, result: PurchaseResult) {
        *self.purchase.lock().unwrap() = Ok(result);
    }

    pub fn fail_scrapes(&self) {
        self.fail_scrape.store(true, Ordering::SeqCst);
    }

    /// Checkout hangs until the caller gives up on it.
    pub fn stall_purchases(&self) {
        self.stall_purchase.store(true, Ordering::SeqCst);
    }

    pub fn contexts(&self) -> usize {
        self.browser.recorder.contexts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.browser.recorder.closes()
    }

    pub fn purchase_count(&self) -> usize {
        self.purchases.lock().unwrap().len()
    }
}

#[async_trait]
impl Automation for FakeAutomation {
    async fn scrape_product(&self, _url: &str) -> Result<ProductScrape, AutomationError> {
        self.scrapes.fetch_add(1, Ordering::SeqCst);
        if self.fail_scrape.load(Ordering::SeqCst) {
            return Err(AutomationError::new(
                AutomationErrorCode::AmazonScrapeFailed,
                "navigation timed out",
            ));
        }
        let page = self.browser.new_context().await.unwrap();
        Ok(ProductScrape {
            product: self.product.lock().unwrap().clone(),
            session: ScrapeSession::new(page),
        })
    }

    async fn purchase(&self, request: &PurchaseRequest) -> Result<PurchaseResult, AutomationError> {
        self.purchases.lock().unwrap().push(request.clone());
        if self.stall_purchase.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        self.purchase.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct FakeShopee {
    pub summaries: Mutex<Vec<OrderSummary>>,
    pub details: Mutex<HashMap<String, OrderDetail>>,
    pub fail_list: AtomicBool,
    pub truncation: Mutex<Option<Truncation>>,
    pub list_calls: Mutex<Vec<Option<DateTime<Utc>>>>,
}

impl FakeShopee {
    pub fn add_order(&self, order_sn: &str, status: MarketplaceStatus, total: f64) {
        self.summaries.lock().unwrap().push(OrderSummary {
            order_sn: order_sn.into(),
            status,
        });
        self.details.lock().unwrap().insert(
            order_sn.into(),
            OrderDetail {
                order_sn: order_sn.into(),
                status,
                currency: "JPY".into(),
                total_amount: total,
                items: vec![line_item()],
                raw: json!({ "order_sn": order_sn }),
            },
        );
    }
}

#[async_trait]
impl ShopeeApi for FakeShopee {
    async fn list_new_orders(
        &self,
        _auth: &ShopAuth,
        since: Option<DateTime<Utc>>,
    ) -> Result<OrderListing, ShopeeError> {
        self.list_calls.lock().unwrap().push(since);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(ShopeeError::Http {
                status: 503,
                body: "upstream unavailable".into(),
            });
        }
        Ok(OrderListing {
            orders: self.summaries.lock().unwrap().clone(),
            truncated: *self.truncation.lock().unwrap(),
        })
    }

    async fn get_order_detail(
        &self,
        _auth: &ShopAuth,
        order_sn: &str,
    ) -> Result<Option<OrderDetail>, ShopeeError> {
        Ok(self.details.lock().unwrap().get(order_sn).cloned())
    }

    async fn get_shop_identity(&self, _auth: &ShopAuth) -> Result<ShopInfo, ShopeeError> {
        Ok(ShopInfo {
            shop_name: "Test Shop".into(),
            region: "JP".into(),
            status: "NORMAL".into(),
        })
    }
}

fn line_item() -> LineItem {
    LineItem {
        item_id: ITEM_ID.into(),
        model_id: None,
        name: "Desk lamp".into(),
        quantity: 1,
        target_url: None,
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryQueue>,
    pub automation: Arc<FakeAutomation>,
    pub shopee: Arc<FakeShopee>,
    pub alerts: Arc<RecordingAlerts>,
    pub secrets: SecretBox,
    pub pipeline: Pipeline,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(Backoff::new(Duration::from_millis(10), 3)));
        let automation = Arc::new(FakeAutomation::new());
        let shopee = Arc::new(FakeShopee::default());
        let alerts = Arc::new(RecordingAlerts::default());
        let secrets = test_box();
        store.put_shop(shop());
        store.put_mapping(ProductMapping {
            shop_id: "shop-1".into(),
            shopee_item_id: ITEM_ID.into(),
            amazon_url: PRODUCT_URL.into(),
            is_active: true,
        });
        let pipeline = Pipeline::new(
            store.clone(),
            queue.clone(),
            automation.clone(),
            shopee.clone(),
            alerts.clone(),
            secrets.clone(),
            Duration::from_secs(60),
        );
        Self {
            store,
            queue,
            automation,
            shopee,
            alerts,
            secrets,
            pipeline,
        }
    }

    pub fn update_shop(&self, change: impl FnOnce(&mut ShopConfig)) {
        let mut shop = self.store.shop("shop-1").unwrap();
        change(&mut shop);
        self.store.put_shop(shop);
    }

    pub fn put_order(&self, order_sn: &str, status: ProcessingStatus) -> Order {
        let order = Order {
            id: Uuid::new_v4(),
            shop_id: "shop-1".into(),
            shopee_order_id: order_sn.into(),
            total_amount: 15000.0,
            currency: "JPY".into(),
            marketplace_status: MarketplaceStatus::ReadyToShip,
            processing_status: status,
            processing_mode: ProcessingMode::Auto,
            payload: OrderPayload {
                resolved_target_url: None,
                line_items: vec![line_item()],
                upstream: json!({}),
            },
            expected_profit: None,
            shipping_days: None,
            error_code: None,
            error_message: None,
            updated_at: Utc::now(),
        };
        self.store.put_order(order.clone());
        order
    }

    pub fn put_shopee_credentials(&self) {
        self.store.put_shopee_credentials(ShopeeCredentialRecord {
            shop_id: "shop-1".into(),
            shopee_shop_id: 77001,
            access_token: self.secrets.seal("shopee-token", [3; 12]).unwrap(),
        });
    }

    pub fn put_amazon_credentials(&self) {
        self.store.put_amazon_credentials(AmazonCredentialRecord {
            shop_id: "shop-1".into(),
            email: "buyer@example.com".into(),
            password: self.secrets.seal("hunter2", [7; 12]).unwrap(),
            address_label: "Warehouse Tokyo".into(),
        });
    }
}
