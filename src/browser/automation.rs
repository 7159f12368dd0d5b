use crate::browser::checkout::CheckoutFlow;
use crate::browser::pool::SessionPool;
use crate::browser::scrape::{ProductScrape, ScrapeSession, ScrapedProduct, extract_product};
use crate::browser::screenshots::ScreenshotStore;
use crate::browser::{Browser, BrowserError, SelectorSet};
use crate::config::WorkerConfig;
use async_trait::async_trait;
use chrono::Local;
use serde::Serialize;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

/// Failure codes of the browser flows. Each checkout step has its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutomationErrorCode {
    #[serde(rename = "AMAZON_2FA_REQUIRED")]
    Amazon2faRequired,
    AmazonLoginFailed,
    AmazonAddToCartFailed,
    AmazonCheckoutFailed,
    AddressNotFound,
    AmazonPurchaseFailed,
    OrderConfirmationFailed,
    OrderIdNotFound,
    AmazonScrapeFailed,
}

impl AutomationErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amazon2faRequired => "AMAZON_2FA_REQUIRED",
            Self::AmazonLoginFailed => "AMAZON_LOGIN_FAILED",
            Self::AmazonAddToCartFailed => "AMAZON_ADD_TO_CART_FAILED",
            Self::AmazonCheckoutFailed => "AMAZON_CHECKOUT_FAILED",
            Self::AddressNotFound => "ADDRESS_NOT_FOUND",
            Self::AmazonPurchaseFailed => "AMAZON_PURCHASE_FAILED",
            Self::OrderConfirmationFailed => "ORDER_CONFIRMATION_FAILED",
            Self::OrderIdNotFound => "ORDER_ID_NOT_FOUND",
            Self::AmazonScrapeFailed => "AMAZON_SCRAPE_FAILED",
        }
    }

    /// Only a scrape can be repeated safely; checkout may already have
    /// spent money.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::AmazonScrapeFailed)
    }

    fn invalidates_session(&self) -> bool {
        matches!(self, Self::Amazon2faRequired | Self::AmazonLoginFailed)
    }
}

impl fmt::Display for AutomationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct AutomationError {
    pub code: AutomationErrorCode,
    pub message: String,
    pub screenshot: Option<String>,
}

impl AutomationError {
    pub fn new(code: AutomationErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            screenshot: None,
        }
    }

    pub fn with_screenshot(mut self, path: Option<String>) -> Self {
        self.screenshot = path;
        self
    }
}

#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    pub product_url: String,
    pub shipping_label: String,
    pub login_email: String,
    pub login_password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseResult {
    pub external_order_id: String,
    pub final_price: Option<f64>,
    pub currency: Option<String>,
}

/// The two things the pipeline asks of the destination marketplace.
#[async_trait]
pub trait Automation: Send + Sync {
    /// Scrapes in a fresh context. The caller owns the returned session and
    /// must release it.
    async fn scrape_product(&self, url: &str) -> Result<ProductScrape, AutomationError>;

    async fn purchase(&self, request: &PurchaseRequest) -> Result<PurchaseResult, AutomationError>;
}

pub struct BrowserAutomation {
    browser: Arc<dyn Browser>,
    pool: Arc<SessionPool>,
    selectors: Arc<SelectorSet>,
    screenshots: ScreenshotStore,
    base_url: String,
    default_currency: String,
    action_timeout: Duration,
    pace: Duration,
}

impl BrowserAutomation {
    pub fn new(
        browser: Arc<dyn Browser>,
        pool: Arc<SessionPool>,
        selectors: Arc<SelectorSet>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            browser,
            pool,
            selectors,
            screenshots: ScreenshotStore::new(&config.screenshot_dir),
            base_url: config.amazon_base_url.clone(),
            default_currency: config.default_currency.clone(),
            action_timeout: config.action_timeout,
            pace: Duration::from_millis(400),
        }
    }

    /// Upper bound of the random pause between checkout steps.
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }
}

#[async_trait]
impl Automation for BrowserAutomation {
    async fn scrape_product(&self, url: &str) -> Result<ProductScrape, AutomationError> {
        let page = self.browser.new_context().await.map_err(|err| {
            AutomationError::new(AutomationErrorCode::AmazonScrapeFailed, err.to_string())
        })?;
        let today = Local::now().date_naive();
        let outcome: Result<ScrapedProduct, BrowserError> = async {
            page.goto(url).await?;
            extract_product(page.as_ref(), &self.selectors, &self.default_currency, today).await
        }
        .await;
        let session = ScrapeSession::new(page);
        match outcome {
            Ok(product) => Ok(ProductScrape { product, session }),
            Err(err) => {
                warn!(target = "dropship.browser", url, error = %err, "scrape_failed");
                session.release().await;
                Err(AutomationError::new(
                    AutomationErrorCode::AmazonScrapeFailed,
                    err.to_string(),
                ))
            }
        }
    }

    async fn purchase(&self, request: &PurchaseRequest) -> Result<PurchaseResult, AutomationError> {
        let lease = self
            .pool
            .acquire(&request.login_email)
            .await
            .map_err(|err| {
                AutomationError::new(
                    AutomationErrorCode::AmazonPurchaseFailed,
                    format!("no browser session: {err}"),
                )
            })?;
        let flow = CheckoutFlow::new(
            lease.page(),
            &self.selectors,
            &self.base_url,
            self.action_timeout,
            self.pace,
        );
        match flow.run(request).await {
            Ok(result) => {
                if let Err(err) = self.pool.persist(&lease).await {
                    warn!(target = "dropship.browser", error = %err, "session_persist_failed");
                }
                info!(
                    target = "dropship.browser",
                    external_order_id = %result.external_order_id,
                    "purchase_completed"
                );
                Ok(result)
            }
            Err(failure) => {
                let screenshot = self
                    .screenshots
                    .capture(lease.page(), failure.code.as_str())
                    .await;
                warn!(
                    target = "dropship.browser",
                    code = failure.code.as_str(),
                    message = %failure.message,
                    "purchase_failed"
                );
                if failure.code.invalidates_session() {
                    self.pool.discard(lease).await;
                }
                Err(AutomationError::new(failure.code, failure.message).with_screenshot(screenshot))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::{Recorder, Screen, ScriptedBrowser, Site};
    use uuid::Uuid;

    const BASE: &str = "https://shop.test";
    const PRODUCT: &str = "https://shop.test/dp/B000TEST";

    fn config() -> WorkerConfig {
        let mut config = WorkerConfig::from_env();
        let root = std::env::temp_dir().join(format!("automation-{}", Uuid::new_v4()));
        config.session_dir = root.join("sessions");
        config.screenshot_dir = root.join("shots");
        config.amazon_base_url = BASE.into();
        config.action_timeout = Duration::from_millis(20);
        config
    }

    fn signed_in_account() -> Screen {
        Screen::new().text("#nav-item-signout", &["Sign Out"])
    }

    fn cart_with_items() -> Screen {
        Screen::new()
            .text("input[value='Delete']", &["", ""])
            .on_click("input[name='proceedToRetailCheckout']", "address")
    }

    fn address_page() -> Screen {
        Screen::new()
            .text(
                ".list-address-selection-container .a-radio",
                &["Warehouse Osaka\n1-2-3 Namba", "Warehouse Tokyo\n4-5-6 Shibuya"],
            )
            .on_click("#shipToThisAddressButton input", "review")
    }

    fn review_page(confirmation: &str) -> Screen {
        Screen::new()
            .text("#subtotals-marketplace-table .grand-total-price", &["￥12,480"])
            .on_click("#placeYourOrder input", confirmation)
    }

    fn site(account: Screen, confirmation: Screen) -> Site {
        Site::default()
            .screen("account", account)
            .screen("cart", cart_with_items())
            .screen(
                "product",
                Screen::new().on_click("#add-to-cart-button", "added"),
            )
            .screen("address", address_page())
            .screen("review", review_page("confirmation"))
            .screen("confirmation", confirmation)
            .route("/gp/css/homepage.html", "account")
            .route("/gp/cart/view.html", "cart")
            .route("/dp/", "product")
    }

    fn confirmed() -> Screen {
        Screen::new()
            .text("#widget-purchaseConfirmationStatus", &["注文が確定しました"])
            .text(
                "#widget-purchaseConfirmationDetails bdi",
                &["503-1234567-7654321"],
            )
    }

    fn automation(site: Site) -> (BrowserAutomation, Arc<Recorder>, WorkerConfig) {
        let config = config();
        let browser = ScriptedBrowser::new(site);
        let recorder = browser.recorder.clone();
        let browser: Arc<dyn Browser> = Arc::new(browser);
        let pool = Arc::new(SessionPool::new(
            browser.clone(),
            &config.session_dir,
            config.session_idle,
        ));
        let selectors = Arc::new(SelectorSet::builtin().unwrap());
        let automation =
            BrowserAutomation::new(browser, pool, selectors, &config).with_pace(Duration::ZERO);
        (automation, recorder, config)
    }

    fn request(label: &str) -> PurchaseRequest {
        PurchaseRequest {
            product_url: PRODUCT.into(),
            shipping_label: label.into(),
            login_email: "buyer@example.com".into(),
            login_password: "hunter2".into(),
        }
    }

    #[tokio::test]
    async fn happy_path_places_order_and_persists_session() {
        let (automation, recorder, config) = automation(site(signed_in_account(), confirmed()));
        let result = automation.purchase(&request("Warehouse Tokyo")).await.unwrap();
        assert_eq!(result.external_order_id, "503-1234567-7654321");
        assert_eq!(result.final_price, Some(12480.0));
        assert_eq!(result.currency.as_deref(), Some("JPY"));
        assert!(recorder.clicked("input[value='Delete']"));
        assert!(
            recorder
                .events()
                .contains(&"click .list-address-selection-container .a-radio#1".to_string())
        );
        assert!(config.session_dir.join("buyer_example.com.json").exists());
    }

    #[tokio::test]
    async fn missing_confirmation_marker_fails_with_screenshot() {
        let (automation, _, _) = automation(site(signed_in_account(), Screen::new()));
        let err = automation.purchase(&request("Warehouse Tokyo")).await.unwrap_err();
        assert_eq!(err.code, AutomationErrorCode::OrderConfirmationFailed);
        assert!(err.screenshot.is_some());
    }

    #[tokio::test]
    async fn confirmation_without_order_number_is_ambiguous() {
        let confirmation = Screen::new()
            .text("#widget-purchaseConfirmationStatus", &["Order placed, thanks!"])
            .text("body", &["Order placed, thanks!"]);
        let (automation, _, _) = automation(site(signed_in_account(), confirmation));
        let err = automation.purchase(&request("Warehouse Tokyo")).await.unwrap_err();
        assert_eq!(err.code, AutomationErrorCode::OrderIdNotFound);
    }

    #[tokio::test]
    async fn unknown_address_label_is_rejected() {
        let (automation, recorder, _) = automation(site(signed_in_account(), confirmed()));
        let err = automation.purchase(&request("Warehouse Nagoya")).await.unwrap_err();
        assert_eq!(err.code, AutomationErrorCode::AddressNotFound);
        assert!(!recorder.clicked("#placeYourOrder input"));
    }

    #[tokio::test]
    async fn address_confirm_failure_is_an_address_error() {
        let site = site(signed_in_account(), confirmed())
            .screen("address", address_page().broken("#shipToThisAddressButton input"));
        let (automation, recorder, _) = automation(site);
        let err = automation.purchase(&request("Warehouse Tokyo")).await.unwrap_err();
        assert_eq!(err.code, AutomationErrorCode::AddressNotFound);
        assert!(err.message.contains("stale element reference"));
        assert!(!recorder.clicked("#placeYourOrder input"));
    }

    #[tokio::test]
    async fn missing_add_to_cart_button_fails_that_step() {
        let site = site(signed_in_account(), confirmed()).screen("product", Screen::new());
        let (automation, _, _) = automation(site);
        let err = automation.purchase(&request("Warehouse Tokyo")).await.unwrap_err();
        assert_eq!(err.code, AutomationErrorCode::AmazonAddToCartFailed);
    }

    #[tokio::test]
    async fn sign_in_then_second_factor_challenge() {
        let account = Screen::new()
            .text("#ap_email", &[""])
            .on_click("#continue", "password");
        let site = site(account, confirmed())
            .screen(
                "password",
                Screen::new()
                    .text("#ap_password", &[""])
                    .on_click("#signInSubmit", "otp"),
            )
            .screen("otp", Screen::new().text("#auth-mfa-otpcode", &[""]));
        let (automation, recorder, _) = automation(site);
        let err = automation.purchase(&request("Warehouse Tokyo")).await.unwrap_err();
        assert_eq!(err.code, AutomationErrorCode::Amazon2faRequired);
        let events = recorder.events();
        assert!(events.contains(&"fill #ap_email=buyer@example.com".to_string()));
        assert!(events.contains(&"fill #ap_password=hunter2".to_string()));
        // The challenged context is discarded.
        assert_eq!(recorder.closes(), 1);
    }

    #[tokio::test]
    async fn empty_product_page_scrapes_to_absent_fields() {
        let (automation, recorder, _) = automation(Site::default());
        let scrape = automation.scrape_product(PRODUCT).await.unwrap();
        assert_eq!(scrape.product.price, None);
        assert!(!scrape.product.is_available);
        scrape.session.release().await;
        assert_eq!(recorder.closes(), 1);
    }
}
