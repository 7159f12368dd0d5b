//! Browser automation against the destination marketplace.
//!
//! The driver sits behind [`Browser`]/[`Page`] so the scrape and checkout
//! flows never touch protocol details, and tests can script a fake site.

pub mod automation;
pub mod checkout;
pub mod parse;
pub mod pool;
pub mod scrape;
pub mod screenshots;
pub mod selectors;
pub mod webdriver;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

pub use automation::{Automation, BrowserAutomation, PurchaseRequest, PurchaseResult};
pub use pool::SessionPool;
pub use scrape::ScrapedProduct;
pub use selectors::SelectorSet;
pub use webdriver::WebDriverBrowser;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser driver request failed: {0}")]
    Transport(String),
    #[error("browser driver error `{error}`: {message}")]
    Driver { error: String, message: String },
    #[error("timed out waiting for `{0}`")]
    Timeout(String),
    #[error("unexpected driver response: {0}")]
    Protocol(String),
    #[error("session storage failed: {0}")]
    Storage(String),
}

/// Cookie and local-storage snapshot of an authenticated context.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StorageState {
    pub origin: String,
    #[serde(default)]
    pub cookies: Vec<Value>,
    #[serde(default)]
    pub local_storage: BTreeMap<String, String>,
}

/// The shared browser process. Closing it tears down every context.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn new_context(&self) -> Result<Box<dyn Page>, BrowserError>;
    async fn close(&self) -> Result<(), BrowserError>;
}

/// One isolated browsing context with a single tab.
#[async_trait]
pub trait Page: Send + Sync {
    /// Navigates and waits for the network to go idle.
    async fn goto(&self, url: &str) -> Result<(), BrowserError>;
    /// Visible text of every element matching `selector`, in document order.
    async fn texts(&self, selector: &str) -> Result<Vec<String>, BrowserError>;
    /// Clicks the `index`-th match, waiting up to the action timeout for it.
    async fn click(&self, selector: &str, index: usize) -> Result<(), BrowserError>;
    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError>;
    /// PNG bytes.
    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError>;
    async fn storage_state(&self) -> Result<StorageState, BrowserError>;
    async fn restore_state(&self, state: &StorageState) -> Result<(), BrowserError>;
    async fn close(&self) -> Result<(), BrowserError>;
}
