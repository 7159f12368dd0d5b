use crate::browser::automation::{AutomationErrorCode, PurchaseRequest, PurchaseResult};
use crate::browser::parse::{detect_currency, extract_order_id, match_address, parse_price};
use crate::browser::{BrowserError, Page, SelectorSet};
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

/// Most line items the cart sweep will remove before giving up.
const MAX_CART_REMOVALS: usize = 20;

#[derive(Debug)]
pub(crate) struct StepFailure {
    pub code: AutomationErrorCode,
    pub message: String,
}

impl StepFailure {
    fn new(code: AutomationErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

// Anything a step did not translate itself.
impl From<BrowserError> for StepFailure {
    fn from(err: BrowserError) -> Self {
        Self::new(AutomationErrorCode::AmazonPurchaseFailed, err.to_string())
    }
}

trait StepResultExt<T> {
    fn step(self, code: AutomationErrorCode) -> Result<T, StepFailure>;
}

impl<T> StepResultExt<T> for Result<T, BrowserError> {
    fn step(self, code: AutomationErrorCode) -> Result<T, StepFailure> {
        self.map_err(|err| StepFailure::new(code, err.to_string()))
    }
}

/// One purchase, run start to finish on a leased context. There is no
/// cancellation point once the flow starts clicking.
pub(crate) struct CheckoutFlow<'a> {
    page: &'a dyn Page,
    selectors: &'a SelectorSet,
    base_url: &'a str,
    action_timeout: Duration,
    pace: Duration,
}

impl<'a> CheckoutFlow<'a> {
    pub fn new(
        page: &'a dyn Page,
        selectors: &'a SelectorSet,
        base_url: &'a str,
        action_timeout: Duration,
        pace: Duration,
    ) -> Self {
        Self {
            page,
            selectors,
            base_url,
            action_timeout,
            pace,
        }
    }

    pub async fn run(&self, request: &PurchaseRequest) -> Result<PurchaseResult, StepFailure> {
        self.sign_in(&request.login_email, &request.login_password)
            .await?;
        self.clear_cart().await;
        self.add_to_cart(&request.product_url).await?;
        self.proceed_to_checkout().await?;
        self.select_address(&request.shipping_label).await?;
        let (final_price, currency) = self.order_total().await;
        self.place_order().await?;
        self.confirm().await?;
        let external_order_id = self.order_id().await?;
        Ok(PurchaseResult {
            external_order_id,
            final_price,
            currency,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn pause(&self) {
        let ceiling = self.pace.as_millis() as u64;
        if ceiling == 0 {
            return;
        }
        let millis = rand::rng().random_range(ceiling / 2..=ceiling);
        sleep(Duration::from_millis(millis)).await;
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<(), StepFailure> {
        use AutomationErrorCode::{Amazon2faRequired, AmazonLoginFailed};
        let account = &self.selectors.account;
        self.page.goto(&self.url(&self.selectors.paths.account)).await?;
        if account.signed_in.any_present(self.page).await? {
            debug!(target = "dropship.browser", "already_signed_in");
            return Ok(());
        }
        if !account.email.any_present(self.page).await?
            && !account.password.any_present(self.page).await?
        {
            self.page.goto(&self.url(&self.selectors.paths.sign_in)).await?;
        }

        if account.email.any_present(self.page).await? {
            account
                .email
                .fill_first(self.page, email, self.action_timeout)
                .await?;
            account
                .continue_button
                .click_first(self.page, self.action_timeout)
                .await?;
            self.pause().await;
        }
        if !account
            .password
            .fill_first(self.page, password, self.action_timeout)
            .await?
        {
            if account.two_factor.any_present(self.page).await? {
                return Err(StepFailure::new(Amazon2faRequired, "verification challenge before password"));
            }
            return Err(StepFailure::new(AmazonLoginFailed, "password field not found"));
        }
        if !account
            .submit
            .click_first(self.page, self.action_timeout)
            .await?
        {
            return Err(StepFailure::new(AmazonLoginFailed, "sign-in submit not found"));
        }
        self.pause().await;

        if account.two_factor.any_present(self.page).await? {
            return Err(StepFailure::new(
                Amazon2faRequired,
                "second-factor challenge after sign-in",
            ));
        }
        if let Some(message) = account.sign_in_error.first_text(self.page).await? {
            return Err(StepFailure::new(AmazonLoginFailed, message));
        }
        if account.password.any_present(self.page).await? {
            return Err(StepFailure::new(AmazonLoginFailed, "still on the sign-in form"));
        }
        info!(target = "dropship.browser", "signed_in");
        Ok(())
    }

    /// Best effort: a cart that cannot be emptied is not a reason to stop.
    async fn clear_cart(&self) {
        if let Err(err) = self.page.goto(&self.url(&self.selectors.paths.cart)).await {
            debug!(target = "dropship.browser", error = %err, "cart_open_failed");
            return;
        }
        let mut removed = 0;
        for selector in self.selectors.cart.delete_item.iter() {
            let present = self.page.texts(selector).await.map(|t| t.len()).unwrap_or(0);
            for _ in 0..present.min(MAX_CART_REMOVALS - removed) {
                if let Err(err) = self.page.click(selector, 0).await {
                    debug!(target = "dropship.browser", selector, error = %err, "cart_item_remove_failed");
                    break;
                }
                removed += 1;
                self.pause().await;
            }
        }
        if removed > 0 {
            debug!(target = "dropship.browser", removed, "cart_cleared");
        }
    }

    async fn add_to_cart(&self, product_url: &str) -> Result<(), StepFailure> {
        use AutomationErrorCode::AmazonAddToCartFailed;
        self.page.goto(product_url).await.step(AmazonAddToCartFailed)?;
        self.pause().await;
        let clicked = self
            .selectors
            .product
            .add_to_cart
            .click_first(self.page, self.action_timeout)
            .await
            .step(AmazonAddToCartFailed)?;
        if !clicked {
            return Err(StepFailure::new(AmazonAddToCartFailed, "no add-to-cart control accepted a click"));
        }
        Ok(())
    }

    async fn proceed_to_checkout(&self) -> Result<(), StepFailure> {
        use AutomationErrorCode::AmazonCheckoutFailed;
        self.page
            .goto(&self.url(&self.selectors.paths.cart))
            .await
            .step(AmazonCheckoutFailed)?;
        let clicked = self
            .selectors
            .cart
            .proceed
            .click_first(self.page, self.action_timeout)
            .await
            .step(AmazonCheckoutFailed)?;
        if !clicked {
            return Err(StepFailure::new(AmazonCheckoutFailed, "proceed-to-checkout control not found"));
        }
        self.pause().await;
        Ok(())
    }

    async fn select_address(&self, label: &str) -> Result<(), StepFailure> {
        use AutomationErrorCode::AddressNotFound;
        let checkout = &self.selectors.checkout;
        checkout
            .address_options
            .wait_any(self.page, self.action_timeout)
            .await
            .step(AddressNotFound)?;
        let Some((selector, options)) = checkout
            .address_options
            .all_texts(self.page)
            .await
            .step(AddressNotFound)?
        else {
            return Err(StepFailure::new(AddressNotFound, "no saved addresses offered"));
        };
        let Some(index) = match_address(&options, label) else {
            return Err(StepFailure::new(
                AddressNotFound,
                format!("no saved address matches `{label}`"),
            ));
        };
        self.page
            .click(&selector, index)
            .await
            .step(AddressNotFound)?;
        // Some layouts apply the selection immediately.
        checkout
            .address_submit
            .click_first(self.page, self.action_timeout)
            .await
            .step(AddressNotFound)?;
        self.pause().await;
        Ok(())
    }

    async fn order_total(&self) -> (Option<f64>, Option<String>) {
        match self.selectors.checkout.order_total.first_text(self.page).await {
            Ok(Some(text)) => (
                parse_price(&text),
                detect_currency(&text).map(str::to_string),
            ),
            _ => (None, None),
        }
    }

    async fn place_order(&self) -> Result<(), StepFailure> {
        use AutomationErrorCode::AmazonPurchaseFailed;
        let clicked = self
            .selectors
            .checkout
            .place_order
            .click_first(self.page, self.action_timeout)
            .await
            .step(AmazonPurchaseFailed)?;
        if !clicked {
            return Err(StepFailure::new(AmazonPurchaseFailed, "place-order control not found"));
        }
        Ok(())
    }

    async fn confirm(&self) -> Result<(), StepFailure> {
        use AutomationErrorCode::OrderConfirmationFailed;
        let confirmed = self
            .selectors
            .confirmation
            .marker
            .wait_any(self.page, self.action_timeout * 2)
            .await
            .step(OrderConfirmationFailed)?;
        if !confirmed {
            return Err(StepFailure::new(
                OrderConfirmationFailed,
                "no confirmation marker after placing the order",
            ));
        }
        Ok(())
    }

    async fn order_id(&self) -> Result<String, StepFailure> {
        use AutomationErrorCode::OrderIdNotFound;
        let confirmation = &self.selectors.confirmation;
        for candidates in [&confirmation.order_id, &confirmation.body] {
            for selector in candidates.iter() {
                let texts = self.page.texts(selector).await.step(OrderIdNotFound)?;
                if let Some(id) = texts.iter().find_map(|text| extract_order_id(text)) {
                    return Ok(id);
                }
            }
        }
        Err(StepFailure::new(
            OrderIdNotFound,
            "order confirmed but no order number on the page; reconcile manually",
        ))
    }
}
