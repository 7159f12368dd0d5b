use crate::browser::parse::{
    detect_currency, is_affirmative_availability, is_new_condition, parse_delivery_date,
    parse_points, parse_price,
};
use crate::browser::{BrowserError, Page, SelectorSet};
use chrono::NaiveDate;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{error, warn};

/// What the product page showed. Missing data is `None`/`false`, never an
/// error: the pipeline decides what an absent price means.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScrapedProduct {
    pub price: Option<f64>,
    pub currency: String,
    pub is_available: bool,
    pub is_new: bool,
    pub estimated_delivery_date: Option<NaiveDate>,
    pub loyalty_credit: Option<f64>,
    pub shipping_text: Option<String>,
}

/// Owns the browsing context a scrape ran in. `release` closes it; consuming
/// `self` makes a second close impossible. A session dropped unreleased
/// (cancelled job, panic) closes its context on a spawned task.
pub struct ScrapeSession {
    page: Option<Box<dyn Page>>,
}

impl ScrapeSession {
    pub fn new(page: Box<dyn Page>) -> Self {
        Self { page: Some(page) }
    }

    pub async fn release(mut self) {
        if let Some(page) = self.page.take() {
            close_context(page).await;
        }
    }
}

async fn close_context(page: Box<dyn Page>) {
    if let Err(err) = page.close().await {
        warn!(target = "dropship.browser", error = %err, "scrape_context_close_failed");
    }
}

impl Drop for ScrapeSession {
    fn drop(&mut self) {
        let Some(page) = self.page.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                warn!(target = "dropship.browser", "scrape_context_dropped_unreleased");
                handle.spawn(close_context(page));
            }
            Err(_) => {
                error!(target = "dropship.browser", "scrape_context_leaked_outside_runtime");
            }
        }
    }
}

pub struct ProductScrape {
    pub product: ScrapedProduct,
    pub session: ScrapeSession,
}

pub(crate) async fn extract_product(
    page: &dyn Page,
    selectors: &SelectorSet,
    default_currency: &str,
    today: NaiveDate,
) -> Result<ScrapedProduct, BrowserError> {
    let product = &selectors.product;

    let price_text = product.price.first_text(page).await?;
    let price = price_text.as_deref().and_then(parse_price);
    let currency = price_text
        .as_deref()
        .and_then(detect_currency)
        .unwrap_or(default_currency)
        .to_string();

    let is_available = match product.availability.first_text(page).await? {
        Some(text) => is_affirmative_availability(
            &text,
            &selectors.availability_phrases,
            &selectors.unavailable_phrases,
        ),
        // Some layouts drop the availability line but still sell the item.
        None => product.add_to_cart.any_present(page).await?,
    };

    let is_new = if product.used_only.any_present(page).await? {
        false
    } else {
        let condition = product.condition.first_text(page).await?;
        is_new_condition(condition.as_deref(), &selectors.used_markers)
    };

    let estimated_delivery_date = product
        .delivery
        .first_text(page)
        .await?
        .and_then(|text| parse_delivery_date(&text, today));
    let loyalty_credit = product
        .loyalty
        .first_text(page)
        .await?
        .and_then(|text| parse_points(&text));
    let shipping_text = product.shipping.first_text(page).await?;

    Ok(ScrapedProduct {
        price,
        currency,
        is_available,
        is_new,
        estimated_delivery_date,
        loyalty_credit,
        shipping_text,
    })
}
