pub mod client;
pub mod config;
pub mod orders;
pub mod shop;
pub mod sign;

pub use client::{ShopAuth, ShopeeApi, ShopeeClient};
pub use orders::{OrderSummary, Truncation};
