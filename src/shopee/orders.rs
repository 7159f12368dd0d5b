use crate::models::{LineItem, MarketplaceStatus};
use crate::shopee::client::{ShopAuth, ShopeeClient, ShopeeError};
use crate::shopee::config::{MAX_WINDOW_DAYS, PAGE_SIZE};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DefaultOnNull, DisplayFromStr, PickFirst, serde_as};

const ORDER_LIST_PATH: &str = "/api/v2/order/get_order_list";
const ORDER_DETAIL_PATH: &str = "/api/v2/order/get_order_detail";
const DETAIL_FIELDS: &str = "item_list,total_amount,buyer_user_id,pay_time,shipping_carrier";
const MAX_PAGES: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct OrderSummary {
    pub order_sn: String,
    pub status: MarketplaceStatus,
}

/// Why a listing may be missing orders from the requested window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Truncation {
    /// More pages remained after the page cap.
    PageLimit,
    /// The previous poll is older than Shopee's maximum window.
    WindowClamped,
}

impl Truncation {
    pub fn as_str(self) -> &'static str {
        match self {
            Truncation::PageLimit => "page_limit",
            Truncation::WindowClamped => "window_clamped",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderListing {
    pub orders: Vec<OrderSummary>,
    pub truncated: Option<Truncation>,
}

#[derive(Debug, Clone)]
pub struct OrderDetail {
    pub order_sn: String,
    pub status: MarketplaceStatus,
    pub currency: String,
    pub total_amount: f64,
    pub items: Vec<LineItem>,
    pub raw: Value,
}

#[derive(Deserialize)]
struct Envelope<T> {
    response: Option<T>,
}

#[serde_as]
#[derive(Deserialize)]
struct OrderListPage {
    #[serde(default)]
    more: bool,
    #[serde(default)]
    next_cursor: String,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    order_list: Vec<RawSummary>,
}

#[derive(Deserialize)]
struct RawSummary {
    order_sn: String,
    #[serde(default)]
    order_status: String,
}

#[serde_as]
#[derive(Deserialize)]
struct OrderDetailPage {
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    order_list: Vec<Value>,
}

#[serde_as]
#[derive(Deserialize)]
struct RawDetail {
    order_sn: String,
    #[serde(default)]
    order_status: String,
    #[serde(default)]
    currency: String,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    total_amount: f64,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    item_list: Vec<RawItem>,
}

#[serde_as]
#[derive(Deserialize)]
struct RawItem {
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    item_id: i64,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    model_id: Option<i64>,
    #[serde(default)]
    item_name: String,
    #[serde(default)]
    model_quantity_purchased: Option<u32>,
}

/// Orders updated since `since`, clamped to Shopee's maximum window.
/// Without a previous poll the window starts one day back.
pub(crate) fn poll_window(
    since: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let floor = now - Duration::days(MAX_WINDOW_DAYS);
    let from = since.unwrap_or(now - Duration::days(1)).max(floor).min(now);
    (from, now)
}

/// A hit page cap outranks a clamped window: only the former leaves
/// orders behind inside the window that was actually listed.
pub(crate) fn listing_truncation(
    since: Option<DateTime<Utc>>,
    from: DateTime<Utc>,
    pages_exhausted: bool,
) -> Option<Truncation> {
    if !pages_exhausted {
        Some(Truncation::PageLimit)
    } else if since.is_some_and(|since| since < from) {
        Some(Truncation::WindowClamped)
    } else {
        None
    }
}

pub(crate) async fn list_orders_since(
    client: &ShopeeClient,
    auth: &ShopAuth,
    since: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<OrderListing, ShopeeError> {
    let (from, to) = poll_window(since, now);
    let mut cursor = String::new();
    let mut summaries = Vec::new();
    let mut exhausted = false;
    for _ in 0..MAX_PAGES {
        let params = [
            ("time_range_field", "update_time".to_string()),
            ("time_from", from.timestamp().to_string()),
            ("time_to", to.timestamp().to_string()),
            ("page_size", PAGE_SIZE.to_string()),
            ("cursor", cursor.clone()),
            ("response_optional_fields", "order_status".to_string()),
        ];
        let envelope: Envelope<OrderListPage> =
            client.get(ORDER_LIST_PATH, auth, &params).await?;
        let Some(page) = envelope.response else {
            exhausted = true;
            break;
        };
        summaries.extend(page.order_list.into_iter().map(|raw| OrderSummary {
            status: MarketplaceStatus::from_shopee(&raw.order_status),
            order_sn: raw.order_sn,
        }));
        if !page.more || page.next_cursor.is_empty() {
            exhausted = true;
            break;
        }
        cursor = page.next_cursor;
    }
    Ok(OrderListing {
        orders: summaries,
        truncated: listing_truncation(since, from, exhausted),
    })
}

pub(crate) async fn fetch_order_detail(
    client: &ShopeeClient,
    auth: &ShopAuth,
    order_sn: &str,
) -> Result<Option<OrderDetail>, ShopeeError> {
    let params = [
        ("order_sn_list", order_sn.to_string()),
        ("response_optional_fields", DETAIL_FIELDS.to_string()),
    ];
    let envelope: Envelope<OrderDetailPage> =
        client.get(ORDER_DETAIL_PATH, auth, &params).await?;
    let Some(raw) = envelope
        .response
        .and_then(|page| page.order_list.into_iter().next())
    else {
        return Ok(None);
    };
    parse_detail(raw).map(Some)
}

pub(crate) fn parse_detail(raw: Value) -> Result<OrderDetail, ShopeeError> {
    let detail: RawDetail =
        serde_json::from_value(raw.clone()).map_err(|err| ShopeeError::Decode(err.to_string()))?;
    Ok(OrderDetail {
        order_sn: detail.order_sn,
        status: MarketplaceStatus::from_shopee(&detail.order_status),
        currency: detail.currency,
        total_amount: detail.total_amount,
        items: detail
            .item_list
            .into_iter()
            .map(|item| LineItem {
                item_id: item.item_id.to_string(),
                model_id: item.model_id.map(|id| id.to_string()),
                name: item.item_name,
                quantity: item.model_quantity_purchased.unwrap_or(1),
                target_url: None,
            })
            .collect(),
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn window_is_clamped_to_fifteen_days() {
        let now = Utc.with_ymd_and_hms(2026, 5, 20, 0, 0, 0).unwrap();
        let (from, to) = poll_window(Some(now - Duration::days(40)), now);
        assert_eq!(from, now - Duration::days(15));
        assert_eq!(to, now);
        let (from, _) = poll_window(None, now);
        assert_eq!(from, now - Duration::days(1));
        let recent = now - Duration::minutes(2);
        assert_eq!(poll_window(Some(recent), now).0, recent);
    }

    #[test]
    fn truncation_is_reported() {
        let now = Utc.with_ymd_and_hms(2026, 5, 20, 0, 0, 0).unwrap();
        let stale = Some(now - Duration::days(40));
        let (from, _) = poll_window(stale, now);
        assert_eq!(listing_truncation(stale, from, true), Some(Truncation::WindowClamped));
        assert_eq!(listing_truncation(stale, from, false), Some(Truncation::PageLimit));

        let recent = Some(now - Duration::minutes(2));
        let (from, _) = poll_window(recent, now);
        assert_eq!(listing_truncation(recent, from, true), None);
        assert_eq!(listing_truncation(recent, from, false), Some(Truncation::PageLimit));
        let (from, _) = poll_window(None, now);
        assert_eq!(listing_truncation(None, from, true), None);
    }

    #[test]
    fn detail_parses_numeric_and_string_fields() {
        let detail = parse_detail(json!({
            "order_sn": "250101ABCDEF",
            "order_status": "READY_TO_SHIP",
            "currency": "JPY",
            "total_amount": "15000",
            "item_list": [
                {"item_id": 884422, "model_id": 0, "item_name": "Desk lamp", "model_quantity_purchased": 2},
                {"item_id": "991", "item_name": "Cable"}
            ]
        }))
        .unwrap();
        assert_eq!(detail.status, MarketplaceStatus::ReadyToShip);
        assert_eq!(detail.total_amount, 15000.0);
        assert_eq!(detail.items.len(), 2);
        assert_eq!(detail.items[0].item_id, "884422");
        assert_eq!(detail.items[0].quantity, 2);
        assert_eq!(detail.items[1].item_id, "991");
        assert_eq!(detail.items[1].quantity, 1);
        assert_eq!(detail.raw["order_sn"], "250101ABCDEF");
    }

    #[test]
    fn detail_tolerates_null_item_list() {
        let detail = parse_detail(json!({
            "order_sn": "X",
            "order_status": "UNKNOWN_STATE",
            "total_amount": 10.5,
            "item_list": null
        }))
        .unwrap();
        assert!(detail.items.is_empty());
        assert_eq!(detail.status, MarketplaceStatus::Unpaid);
    }
}
