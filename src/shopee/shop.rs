use crate::shopee::client::{ShopAuth, ShopeeClient, ShopeeError};
use serde::{Deserialize, Serialize};

const SHOP_INFO_PATH: &str = "/api/v2/shop/get_shop_info";

/// Shop identity, only used to prove that stored credentials still work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShopInfo {
    #[serde(default)]
    pub shop_name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub status: String,
}

pub(crate) async fn fetch_shop_info(
    client: &ShopeeClient,
    auth: &ShopAuth,
) -> Result<ShopInfo, ShopeeError> {
    client.get(SHOP_INFO_PATH, auth, &[]).await
}
