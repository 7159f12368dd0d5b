use crate::alerts::Alert;
use crate::models::{NewOrder, OrderPayload, ShopConfig};
use crate::pipeline::order::{OnFulfil, OrderOutcome};
use crate::pipeline::{Pipeline, PipelineError};
use crate::shopee::{OrderSummary, ShopAuth, Truncation};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PollSummary {
    pub shop_id: String,
    pub fetched: usize,
    pub upserted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub queued: usize,
    pub advanced: bool,
    pub truncated: Option<Truncation>,
}

impl PollSummary {
    fn new(shop_id: &str) -> Self {
        Self {
            shop_id: shop_id.to_string(),
            ..Self::default()
        }
    }
}

enum Ingested {
    Upserted,
    Skipped,
}

impl Pipeline {
    /// One polling pass for a shop. Upstream trouble is alerted and reported
    /// in the summary rather than failing the job: the repeatable timer is
    /// the retry, and the poll window only advances after a clean pass that
    /// listed every page.
    pub async fn poll_shop(&self, shop_id: &str) -> Result<PollSummary, PipelineError> {
        let mut summary = PollSummary::new(shop_id);

        let Some(shop) = self
            .store
            .shop_config(shop_id)
            .await
            .map_err(|err| PipelineError::transient("poll", err))?
        else {
            self.alert(Alert::shop(shop_id, "SHOP_CONFIG_MISSING", "shop has no automation settings"))
                .await;
            return Ok(summary);
        };
        let Some(auth) = self.shop_auth(shop_id).await? else {
            return Ok(summary);
        };

        let window_end = Utc::now();
        let listed = match self.shopee.list_new_orders(&auth, shop.last_polled_at).await {
            Ok(listed) => listed,
            Err(err) => {
                self.alert(Alert::shop(shop_id, "SHOPEE_POLL_FAILED", err.to_string()))
                    .await;
                return Ok(summary);
            }
        };
        summary.fetched = listed.orders.len();
        summary.truncated = listed.truncated;
        if let Some(truncation) = listed.truncated {
            warn!(
                target = "dropship.poll",
                shop_id,
                reason = truncation.as_str(),
                fetched = summary.fetched,
                "order_listing_truncated"
            );
            self.alert(Alert::shop(
                shop_id,
                "SHOPEE_POLL_TRUNCATED",
                format!("order listing incomplete: {}", truncation.as_str()),
            ))
            .await;
        }

        for order in &listed.orders {
            match self.ingest(&shop, &auth, order).await {
                Ok(Ingested::Upserted) => summary.upserted += 1,
                Ok(Ingested::Skipped) => summary.skipped += 1,
                Err(message) => {
                    summary.failed += 1;
                    warn!(
                        target = "dropship.poll",
                        shop_id,
                        order_sn = %order.order_sn,
                        error = %message,
                        "order_ingest_failed"
                    );
                    self.alert(
                        Alert::shop(shop_id, "ORDER_UPSERT_FAILED", message)
                            .with_order(&order.order_sn),
                    )
                    .await;
                }
            }
        }

        // A clamped window is re-clamped on every pass, so only the page cap holds it.
        if summary.failed == 0 && summary.truncated != Some(Truncation::PageLimit) {
            self.store
                .touch_last_polled(shop_id, window_end)
                .await
                .map_err(|err| PipelineError::transient("poll", err))?;
            summary.advanced = true;
        }

        summary.queued = self.classify_unprocessed(&shop).await?;
        info!(
            target = "dropship.poll",
            shop_id,
            fetched = summary.fetched,
            upserted = summary.upserted,
            skipped = summary.skipped,
            failed = summary.failed,
            queued = summary.queued,
            "poll_finished"
        );
        Ok(summary)
    }

    /// Runs the decision steps over every UNPROCESSED order of the shop and
    /// queues the ones cleared for purchase. Returns how many were queued.
    pub async fn classify_unprocessed(&self, shop: &ShopConfig) -> Result<usize, PipelineError> {
        let pending = self
            .store
            .unprocessed_orders(&shop.shop_id)
            .await
            .map_err(|err| PipelineError::transient("classify", err))?;
        let mut queued = 0;
        for order in pending {
            match self.evaluate(&order, shop, OnFulfil::Enqueue).await {
                Ok(OrderOutcome::Queued) => queued += 1,
                Ok(outcome) => {
                    info!(
                        target = "dropship.poll",
                        order_sn = %order.shopee_order_id,
                        outcome = outcome.as_str(),
                        "order_classified"
                    );
                }
                Err(err) => {
                    warn!(
                        target = "dropship.poll",
                        order_sn = %order.shopee_order_id,
                        stage = err.stage(),
                        error = %err.detail(),
                        "order_classification_failed"
                    );
                }
            }
        }
        Ok(queued)
    }

    async fn shop_auth(&self, shop_id: &str) -> Result<Option<ShopAuth>, PipelineError> {
        let record = self
            .store
            .shopee_credentials(shop_id)
            .await
            .map_err(|err| PipelineError::transient("poll", err))?;
        let Some(record) = record else {
            self.alert(Alert::shop(shop_id, "SHOPEE_CREDENTIALS_MISSING", "no Shopee credentials stored"))
                .await;
            return Ok(None);
        };
        match self.secrets.open(&record.access_token) {
            Ok(access_token) => Ok(Some(ShopAuth {
                shop_id: record.shopee_shop_id,
                access_token,
            })),
            Err(err) => {
                self.alert(Alert::shop(shop_id, "SHOPEE_CREDENTIALS_INVALID", err.to_string()))
                    .await;
                Ok(None)
            }
        }
    }

    async fn ingest(
        &self,
        shop: &ShopConfig,
        auth: &ShopAuth,
        summary: &OrderSummary,
    ) -> Result<Ingested, String> {
        let existing = self
            .store
            .order_by_ref(&summary.order_sn)
            .await
            .map_err(|err| err.to_string())?;
        if existing
            .as_ref()
            .is_some_and(|order| order.processing_status.blocks_requeue())
        {
            return Ok(Ingested::Skipped);
        }
        if !summary.status.is_actionable() {
            return Ok(Ingested::Skipped);
        }

        let Some(detail) = self
            .shopee
            .get_order_detail(auth, &summary.order_sn)
            .await
            .map_err(|err| err.to_string())?
        else {
            return Err("order detail not returned".to_string());
        };

        let mut line_items = detail.items;
        for item in &mut line_items {
            if item.target_url.is_some() {
                continue;
            }
            item.target_url = self
                .store
                .active_mapping(&shop.shop_id, &item.item_id)
                .await
                .map_err(|err| err.to_string())?
                .map(|mapping| mapping.amazon_url);
        }
        let resolved_target_url = line_items
            .first()
            .and_then(|item| item.target_url.clone())
            .or_else(|| existing.and_then(|order| order.payload.resolved_target_url));

        self.store
            .upsert_order(&NewOrder {
                shop_id: shop.shop_id.clone(),
                shopee_order_id: detail.order_sn,
                total_amount: detail.total_amount,
                currency: detail.currency,
                marketplace_status: detail.status,
                payload: OrderPayload {
                    resolved_target_url,
                    line_items,
                    upstream: detail.raw,
                },
            })
            .await
            .map_err(|err| err.to_string())?;
        Ok(Ingested::Upserted)
    }
}
