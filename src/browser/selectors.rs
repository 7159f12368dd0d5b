use crate::browser::{BrowserError, Page};
use serde::Deserialize;
use std::{path::Path, time::Duration};
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::debug;

const BUILTIN: &str = include_str!("selectors.yaml");
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("failed to read selector file {path}: {message}")]
    Io { path: String, message: String },
    #[error("invalid selector yaml: {0}")]
    Parse(String),
}

/// Ordered fallbacks for one logical element.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Candidates(Vec<String>);

impl Candidates {
    pub fn new<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(items.into_iter().map(Into::into).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// First non-empty text from the first candidate that yields one.
    pub async fn first_text(&self, page: &dyn Page) -> Result<Option<String>, BrowserError> {
        for selector in self.iter() {
            let found = page
                .texts(selector)
                .await?
                .into_iter()
                .map(|text| text.trim().to_string())
                .find(|text| !text.is_empty());
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// All texts of the first candidate that matches anything.
    pub async fn all_texts(&self, page: &dyn Page) -> Result<Option<(String, Vec<String>)>, BrowserError> {
        for selector in self.iter() {
            let texts = page.texts(selector).await?;
            if !texts.is_empty() {
                return Ok(Some((selector.to_string(), texts)));
            }
        }
        Ok(None)
    }

    pub async fn any_present(&self, page: &dyn Page) -> Result<bool, BrowserError> {
        for selector in self.iter() {
            if !page.texts(selector).await?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Polls every candidate until one appears or `timeout` elapses.
    pub async fn wait_any(&self, page: &dyn Page, timeout: Duration) -> Result<bool, BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.any_present(page).await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(PROBE_INTERVAL).await;
        }
    }

    /// Clicks the first present candidate that accepts the click. Returns
    /// `false` when none did within `timeout`.
    pub async fn click_first(&self, page: &dyn Page, timeout: Duration) -> Result<bool, BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            for selector in self.iter() {
                if page.texts(selector).await?.is_empty() {
                    continue;
                }
                match page.click(selector, 0).await {
                    Ok(()) => return Ok(true),
                    Err(err) => {
                        debug!(target = "dropship.browser", selector, error = %err, "click_candidate_failed")
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(PROBE_INTERVAL).await;
        }
    }

    pub async fn fill_first(
        &self,
        page: &dyn Page,
        value: &str,
        timeout: Duration,
    ) -> Result<bool, BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            for selector in self.iter() {
                if page.texts(selector).await?.is_empty() {
                    continue;
                }
                if page.fill(selector, value).await.is_ok() {
                    return Ok(true);
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(PROBE_INTERVAL).await;
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProductSelectors {
    pub price: Candidates,
    pub availability: Candidates,
    pub condition: Candidates,
    pub used_only: Candidates,
    pub delivery: Candidates,
    pub loyalty: Candidates,
    pub shipping: Candidates,
    pub add_to_cart: Candidates,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountSelectors {
    pub signed_in: Candidates,
    pub email: Candidates,
    #[serde(rename = "continue")]
    pub continue_button: Candidates,
    pub password: Candidates,
    pub submit: Candidates,
    pub two_factor: Candidates,
    pub sign_in_error: Candidates,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CartSelectors {
    pub delete_item: Candidates,
    pub proceed: Candidates,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSelectors {
    pub address_options: Candidates,
    pub address_submit: Candidates,
    pub order_total: Candidates,
    pub place_order: Candidates,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmationSelectors {
    pub marker: Candidates,
    pub order_id: Candidates,
    pub body: Candidates,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SitePaths {
    pub account: String,
    pub sign_in: String,
    pub cart: String,
}

/// Every selector and phrase list the scrape and checkout flows read.
#[derive(Debug, Clone, Deserialize)]
pub struct SelectorSet {
    pub product: ProductSelectors,
    pub account: AccountSelectors,
    pub cart: CartSelectors,
    pub checkout: CheckoutSelectors,
    pub confirmation: ConfirmationSelectors,
    pub paths: SitePaths,
    pub availability_phrases: Vec<String>,
    #[serde(default)]
    pub unavailable_phrases: Vec<String>,
    pub used_markers: Vec<String>,
}

impl SelectorSet {
    pub fn builtin() -> Result<Self, SelectorError> {
        Self::parse(BUILTIN)
    }

    pub fn parse(raw: &str) -> Result<Self, SelectorError> {
        serde_yaml::from_str(raw).map_err(|err| SelectorError::Parse(err.to_string()))
    }

    /// Reads `path` when given, the compiled-in set otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, SelectorError> {
        let Some(path) = path else {
            return Self::builtin();
        };
        let raw = std::fs::read_to_string(path).map_err(|err| SelectorError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        Self::parse(&raw)
    }
}
