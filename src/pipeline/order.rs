use crate::alerts::Alert;
use crate::browser::{PurchaseRequest, PurchaseResult, ScrapedProduct};
use crate::decision::{DecisionAction, DecisionInput, decide};
use crate::jobs::JobMessage;
use crate::metrics;
use crate::models::{
    ErrorCode, ErrorRecord, Order, OrderUpdate, ProcessingMode, ProcessingStatus, ShopConfig,
    TargetOrder, TargetOrderStatus,
};
use crate::pipeline::{Pipeline, PipelineError};
use crate::profit::{ProfitInputs, calculate_profit, calculate_shipping_days};
use chrono::{Local, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// Where a single pass over an order left it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderOutcome {
    AlreadyFulfilled,
    NotQueued,
    CheckoutInterrupted,
    InactiveShop,
    NotActionable,
    MissingMapping,
    ProductRejected,
    DeliveryUnknown,
    Skipped,
    ManualReview,
    DryRun,
    Queued,
    MissingCredentials,
    CredentialError,
    PurchaseFailed,
    PersistFailed,
    Fulfilled,
}

impl OrderOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyFulfilled => "already_fulfilled",
            Self::NotQueued => "not_queued",
            Self::CheckoutInterrupted => "checkout_interrupted",
            Self::InactiveShop => "inactive_shop",
            Self::NotActionable => "not_actionable",
            Self::MissingMapping => "missing_mapping",
            Self::ProductRejected => "product_rejected",
            Self::DeliveryUnknown => "delivery_unknown",
            Self::Skipped => "skipped",
            Self::ManualReview => "manual_review",
            Self::DryRun => "dry_run",
            Self::Queued => "queued",
            Self::MissingCredentials => "missing_credentials",
            Self::CredentialError => "credential_error",
            Self::PurchaseFailed => "purchase_failed",
            Self::PersistFailed => "persist_failed",
            Self::Fulfilled => "fulfilled",
        }
    }
}

/// What to do with an order the decision engine clears for fulfilment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnFulfil {
    /// Buy it now (the `process-order` job).
    Purchase,
    /// Hand it to the queue (classification after a poll).
    Enqueue,
}

struct Evaluated<'a> {
    url: &'a str,
    product: &'a ScrapedProduct,
    replacement_cost: f64,
    loyalty_used: f64,
    shipping_cost: f64,
    profit: f64,
    shipping_days: u32,
}

impl Evaluated<'_> {
    /// Error row carrying the estimate computed on this pass; the order
    /// loaded before evaluation still holds the previous one.
    fn error(&self, order: &Order, code: &str, reason: &str) -> ErrorRecord {
        ErrorRecord::for_order(order, code, reason)
            .with_url(self.url)
            .with_estimate(self.profit, Some(self.shipping_days))
    }
}

fn whole_days_until(delivery: NaiveDate, today: NaiveDate) -> u32 {
    calculate_shipping_days(
        delivery.and_time(NaiveTime::MIN).and_utc(),
        today.and_time(NaiveTime::MIN).and_utc(),
    )
}

impl Pipeline {
    pub async fn process_order(&self, shopee_order_id: &str) -> Result<OrderOutcome, PipelineError> {
        let order = self
            .store
            .order_by_ref(shopee_order_id)
            .await
            .map_err(|err| PipelineError::transient("load_order", err))?
            .ok_or_else(|| {
                PipelineError::configuration("load_order", format!("order {shopee_order_id} not found"))
            })?;

        match order.processing_status {
            ProcessingStatus::Fulfilled => {
                info!(target = "dropship.pipeline", order_sn = %shopee_order_id, "order_already_fulfilled");
                return Ok(OrderOutcome::AlreadyFulfilled);
            }
            // A previous attempt died mid-checkout. Buying again could double
            // the purchase, so an operator has to look.
            ProcessingStatus::Processing => {
                let reason = "a previous checkout attempt did not finish; verify the account before retrying";
                self.park(&order, ProcessingMode::Auto, ErrorCode::CheckoutInterrupted.as_str(), reason)
                    .await?;
                self.record(ErrorRecord::for_order(&order, ErrorCode::CheckoutInterrupted.as_str(), reason))
                    .await?;
                return Ok(self.finish(&order, OrderOutcome::CheckoutInterrupted));
            }
            ProcessingStatus::Queued => {}
            // Only a queued order may move on to PROCESSING. Anything else is a
            // stale or redelivered job.
            other => {
                info!(
                    target = "dropship.pipeline",
                    order_sn = %shopee_order_id,
                    status = other.as_str(),
                    "order_not_queued"
                );
                return Ok(self.finish(&order, OrderOutcome::NotQueued));
            }
        }

        // A placed purchase already exists (the status write after checkout
        // was lost). Settle the bookkeeping instead of buying again.
        let placed = self
            .store
            .target_orders_for(order.id)
            .await
            .map_err(|err| PipelineError::transient("load_target_orders", err))?
            .iter()
            .any(|target| target.status == TargetOrderStatus::Placed);
        if placed {
            self.update(
                &order,
                &OrderUpdate::status(ProcessingStatus::Fulfilled, ProcessingMode::Auto).clear_error(),
            )
            .await?;
            return Ok(self.finish(&order, OrderOutcome::AlreadyFulfilled));
        }

        let shop = self
            .store
            .shop_config(&order.shop_id)
            .await
            .map_err(|err| PipelineError::transient("load_shop", err))?
            .ok_or_else(|| {
                PipelineError::configuration("load_shop", format!("shop {} has no settings", order.shop_id))
            })?;

        let outcome = self.evaluate(&order, &shop, OnFulfil::Purchase).await?;
        Ok(self.finish(&order, outcome))
    }

    /// Steps shared by the `process-order` job and post-poll classification:
    /// gatekeeping, URL resolution, scrape, estimate, decision.
    pub(crate) async fn evaluate(
        &self,
        order: &Order,
        shop: &ShopConfig,
        on_fulfil: OnFulfil,
    ) -> Result<OrderOutcome, PipelineError> {
        if !shop.is_active {
            self.set_status(order, ProcessingStatus::ManualReview, ProcessingMode::Manual)
                .await?;
            return Ok(OrderOutcome::InactiveShop);
        }
        if !order.marketplace_status.is_actionable() {
            let update = OrderUpdate {
                processing_status: Some(ProcessingStatus::Unprocessed),
                ..OrderUpdate::default()
            };
            self.update(order, &update).await?;
            return Ok(OrderOutcome::NotActionable);
        }

        let Some(url) = self.resolve_target_url(order).await? else {
            let reason = "no active product mapping for the order's first line item";
            self.record(ErrorRecord::for_order(order, ErrorCode::MissingMapping.as_str(), reason))
                .await?;
            self.park(order, ProcessingMode::Manual, ErrorCode::MissingMapping.as_str(), reason)
                .await?;
            return Ok(OrderOutcome::MissingMapping);
        };

        let scrape = self.automation.scrape_product(&url).await.map_err(|err| {
            warn!(target = "dropship.pipeline", order_sn = %order.shopee_order_id, code = %err.code, "scrape_failed");
            if err.code.is_transient() {
                PipelineError::transient("scrape", err)
            } else {
                PipelineError::configuration("scrape", err)
            }
        })?;
        let outcome = self
            .after_scrape(order, shop, &url, &scrape.product, on_fulfil)
            .await;
        scrape.session.release().await;
        outcome
    }

    async fn after_scrape(
        &self,
        order: &Order,
        shop: &ShopConfig,
        url: &str,
        product: &ScrapedProduct,
        on_fulfil: OnFulfil,
    ) -> Result<OrderOutcome, PipelineError> {
        let rejection = match product.price {
            _ if !product.is_available => Some((ErrorCode::AmazonOutOfStock, "product is not available")),
            None => Some((ErrorCode::AmazonOutOfStock, "product price could not be read")),
            Some(_) if !product.is_new => Some((ErrorCode::AmazonUsedOnly, "only used offers are listed")),
            Some(_) => None,
        };
        if let Some((code, reason)) = rejection {
            self.record(ErrorRecord::for_order(order, code.as_str(), reason).with_url(url))
                .await?;
            self.park(order, ProcessingMode::Auto, code.as_str(), reason).await?;
            return Ok(OrderOutcome::ProductRejected);
        }
        let replacement_cost = product.price.unwrap_or_default();

        let Some(delivery) = product.estimated_delivery_date else {
            let reason = "delivery estimate missing on the product page";
            self.record(
                ErrorRecord::for_order(order, ErrorCode::AmazonDeliveryUnknown.as_str(), reason)
                    .with_url(url),
            )
            .await?;
            self.park(order, ProcessingMode::Auto, ErrorCode::AmazonDeliveryUnknown.as_str(), reason)
                .await?;
            return Ok(OrderOutcome::DeliveryUnknown);
        };
        let shipping_days = whole_days_until(delivery, Local::now().date_naive());

        let loyalty = product.loyalty_credit.unwrap_or_default();
        let estimate = calculate_profit(&ProfitInputs {
            sale_price: order.total_amount,
            replacement_cost,
            loyalty_credit: loyalty,
            domestic_shipping_cost: shop.domestic_shipping_cost,
            include_loyalty: shop.include_loyalty_credit,
            include_domestic_shipping: shop.include_domestic_shipping,
        });
        let profit = estimate.expected_profit;
        self.update(order, &OrderUpdate::estimate(profit, shipping_days))
            .await?;

        let decision = decide(&DecisionInput::for_shop(shop, profit, shipping_days));
        info!(
            target = "dropship.pipeline",
            order_sn = %order.shopee_order_id,
            profit,
            shipping_days,
            action = ?decision.action,
            reason = decision.reason.map(|r| r.as_str()).unwrap_or("-"),
            "order_decided"
        );
        let mode = ProcessingMode::for_dry_run(shop.is_dry_run);
        let evaluated = Evaluated {
            url,
            product,
            replacement_cost,
            loyalty_used: if shop.include_loyalty_credit { loyalty } else { 0.0 },
            shipping_cost: if shop.include_domestic_shipping {
                shop.domestic_shipping_cost
            } else {
                0.0
            },
            profit,
            shipping_days,
        };

        match decision.action {
            DecisionAction::Skip => {
                let reason = decision.reason.map(|r| r.as_str()).unwrap_or("REJECTED");
                let message = format!("decision engine skipped the order: {reason}");
                self.record(
                    evaluated
                        .error(order, ErrorCode::DecisionRejected.as_str(), &message)
                        .with_filter(reason),
                )
                .await?;
                self.set_status(order, ProcessingStatus::Skipped, mode).await?;
                Ok(OrderOutcome::Skipped)
            }
            DecisionAction::ManualReview => {
                self.set_status(order, ProcessingStatus::ManualReview, mode).await?;
                Ok(OrderOutcome::ManualReview)
            }
            DecisionAction::DryRun => {
                let target = self.target_order(order, &evaluated, None);
                self.store
                    .insert_target_order(&target)
                    .await
                    .map_err(|err| PipelineError::transient("dry_run", err))?;
                self.set_status(order, ProcessingStatus::ManualReview, ProcessingMode::AutoDryRun)
                    .await?;
                Ok(OrderOutcome::DryRun)
            }
            DecisionAction::AutoFulfill => match on_fulfil {
                OnFulfil::Enqueue => {
                    self.set_status(order, ProcessingStatus::Queued, ProcessingMode::Auto)
                        .await?;
                    self.queue
                        .enqueue(JobMessage::ProcessOrder {
                            shopee_order_id: order.shopee_order_id.clone(),
                            shop_id: order.shop_id.clone(),
                            retry_source: None,
                        })
                        .await
                        .map_err(|err| PipelineError::transient("enqueue", err))?;
                    Ok(OrderOutcome::Queued)
                }
                OnFulfil::Purchase => self.purchase(order, &evaluated).await,
            },
        }
    }

    async fn purchase(&self, order: &Order, evaluated: &Evaluated<'_>) -> Result<OrderOutcome, PipelineError> {
        let credentials = self
            .store
            .amazon_credentials(&order.shop_id)
            .await
            .map_err(|err| PipelineError::transient("load_credentials", err))?;
        let Some(credentials) = credentials else {
            let reason = "no Amazon credentials stored for this shop";
            self.record(evaluated.error(order, ErrorCode::MissingAmazonCredentials.as_str(), reason))
                .await?;
            self.park(order, ProcessingMode::Auto, ErrorCode::MissingAmazonCredentials.as_str(), reason)
                .await?;
            return Ok(OrderOutcome::MissingCredentials);
        };
        let password = match self.secrets.open(&credentials.password) {
            Ok(password) => password,
            Err(err) => {
                let reason = format!("stored Amazon password could not be decrypted: {err}");
                self.record(evaluated.error(order, ErrorCode::CredentialDecryptFailed.as_str(), &reason))
                    .await?;
                self.park(order, ProcessingMode::Auto, ErrorCode::CredentialDecryptFailed.as_str(), &reason)
                    .await?;
                return Ok(OrderOutcome::CredentialError);
            }
        };

        self.set_status(order, ProcessingStatus::Processing, ProcessingMode::Auto)
            .await?;
        let request = PurchaseRequest {
            product_url: evaluated.url.to_string(),
            shipping_label: credentials.address_label.clone(),
            login_email: credentials.email.clone(),
            login_password: password,
        };
        let result = match self.automation.purchase(&request).await {
            Ok(result) => result,
            Err(err) => {
                self.record(
                    evaluated
                        .error(order, err.code.as_str(), &err.message)
                        .with_screenshot(err.screenshot.as_deref()),
                )
                .await?;
                self.park(order, ProcessingMode::Auto, err.code.as_str(), &err.message)
                    .await?;
                return Ok(OrderOutcome::PurchaseFailed);
            }
        };

        let target = self.target_order(order, evaluated, Some(&result));
        if let Err(err) = self.store.insert_target_order(&target).await {
            let reason = format!(
                "purchase {} placed but its record could not be saved: {err}",
                result.external_order_id
            );
            self.alert(
                Alert::shop(&order.shop_id, ErrorCode::TargetOrderPersistFailed.as_str(), &reason)
                    .with_order(&order.shopee_order_id),
            )
            .await;
            self.record(evaluated.error(order, ErrorCode::TargetOrderPersistFailed.as_str(), &reason))
                .await?;
            self.park(order, ProcessingMode::Auto, ErrorCode::TargetOrderPersistFailed.as_str(), &reason)
                .await?;
            return Ok(OrderOutcome::PersistFailed);
        }

        self.update(
            order,
            &OrderUpdate::status(ProcessingStatus::Fulfilled, ProcessingMode::Auto).clear_error(),
        )
        .await?;
        info!(
            target = "dropship.pipeline",
            order_sn = %order.shopee_order_id,
            external_order_id = %result.external_order_id,
            "order_fulfilled"
        );
        Ok(OrderOutcome::Fulfilled)
    }

    fn target_order(
        &self,
        order: &Order,
        evaluated: &Evaluated<'_>,
        placed: Option<&PurchaseResult>,
    ) -> TargetOrder {
        let (status, external_order_id, placed_at) = match placed {
            Some(result) => (
                TargetOrderStatus::Placed,
                Some(result.external_order_id.clone()),
                Some(Utc::now()),
            ),
            None => (TargetOrderStatus::Created, None, None),
        };
        TargetOrder {
            id: Uuid::new_v4(),
            order_id: order.id,
            shop_id: order.shop_id.clone(),
            external_order_id,
            status,
            // Checkout may not report a total; fall back to the scraped price.
            purchase_price: placed
                .and_then(|r| r.final_price)
                .unwrap_or(evaluated.replacement_cost),
            currency: placed
                .and_then(|r| r.currency.clone())
                .unwrap_or_else(|| evaluated.product.currency.clone()),
            shipping_cost: evaluated.shipping_cost,
            loyalty_credit_used: evaluated.loyalty_used,
            placed_at,
        }
    }

    async fn resolve_target_url(&self, order: &Order) -> Result<Option<String>, PipelineError> {
        if let Some(url) = order
            .payload
            .resolved_target_url
            .as_deref()
            .filter(|u| !u.is_empty())
        {
            return Ok(Some(url.to_string()));
        }
        let Some(item) = order.payload.line_items.first() else {
            return Ok(None);
        };
        Ok(self
            .store
            .active_mapping(&order.shop_id, &item.item_id)
            .await
            .map_err(|err| PipelineError::transient("resolve_mapping", err))?
            .map(|mapping| mapping.amazon_url))
    }

    async fn update(&self, order: &Order, update: &OrderUpdate) -> Result<(), PipelineError> {
        self.store
            .update_order(order.id, update)
            .await
            .map_err(|err| PipelineError::transient("update_order", err))
    }

    async fn set_status(
        &self,
        order: &Order,
        status: ProcessingStatus,
        mode: ProcessingMode,
    ) -> Result<(), PipelineError> {
        self.update(order, &OrderUpdate::status(status, mode)).await
    }

    /// MANUAL_REVIEW with the error stamped on the order for the dashboard.
    async fn park(
        &self,
        order: &Order,
        mode: ProcessingMode,
        code: &str,
        message: &str,
    ) -> Result<(), PipelineError> {
        self.update(
            order,
            &OrderUpdate::status(ProcessingStatus::ManualReview, mode).with_error(code, message),
        )
        .await
    }

    async fn record(&self, record: ErrorRecord) -> Result<(), PipelineError> {
        warn!(
            target = "dropship.pipeline",
            order_sn = record.shopee_order_id.as_deref().unwrap_or("-"),
            code = %record.error_code,
            "{}",
            record.reason
        );
        self.store
            .insert_error(&record)
            .await
            .map_err(|err| PipelineError::transient("record_error", err))
    }

    fn finish(&self, order: &Order, outcome: OrderOutcome) -> OrderOutcome {
        metrics::order_outcome(outcome.as_str());
        info!(
            target = "dropship.pipeline",
            order_sn = %order.shopee_order_id,
            shop_id = %order.shop_id,
            outcome = outcome.as_str(),
            "order_processed"
        );
        outcome
    }
}
