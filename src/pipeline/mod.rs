//! Order fulfillment orchestration.
//!
//! Every collaborator is injected, so the same pipeline runs against
//! PostgREST + Redis + chromedriver in production and against the in-memory
//! fakes in tests.

mod order;
mod poll;
#[cfg(test)]
pub(crate) mod testing;

use crate::alerts::{Alert, AlertSink};
use crate::browser::{Automation, ScrapedProduct};
use crate::crypto::SecretBox;
use crate::jobs::{JobMessage, JobQueue, poll_repeat_key};
use crate::models::{OrderUpdate, ProcessingStatus};
use crate::shopee::{ShopAuth, ShopeeApi};
use crate::store::Store;
use serde::Serialize;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub use order::OrderOutcome;
pub use poll::PollSummary;

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    /// Worth another attempt: nothing irreversible happened.
    Transient,
    /// Needs an operator; retrying cannot help.
    Configuration,
}

impl PipelineError {
    pub fn transient(stage: &'static str, message: impl fmt::Display) -> Self {
        Self {
            stage,
            message: message.to_string(),
            kind: PipelineErrorKind::Transient,
        }
    }

    pub fn configuration(stage: &'static str, message: impl fmt::Display) -> Self {
        Self {
            stage,
            message: message.to_string(),
            kind: PipelineErrorKind::Configuration,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }

    pub fn is_transient(&self) -> bool {
        self.kind == PipelineErrorKind::Transient
    }
}

/// What a job did, logged by the worker when it completes.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobReport {
    Order {
        shopee_order_id: String,
        outcome: OrderOutcome,
    },
    Poll(PollSummary),
    Toggle {
        shop_id: String,
        active: bool,
        changed: bool,
    },
    Credentials(CredentialCheck),
    Preview {
        product: ScrapedProduct,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialCheck {
    pub shop_id: String,
    pub shopee_ok: bool,
    pub amazon_ok: bool,
    pub problems: Vec<String>,
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    automation: Arc<dyn Automation>,
    shopee: Arc<dyn ShopeeApi>,
    alerts: Arc<dyn AlertSink>,
    secrets: SecretBox,
    poll_interval: Duration,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        automation: Arc<dyn Automation>,
        shopee: Arc<dyn ShopeeApi>,
        alerts: Arc<dyn AlertSink>,
        secrets: SecretBox,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            automation,
            shopee,
            alerts,
            secrets,
            poll_interval,
        }
    }

    pub async fn handle(&self, message: &JobMessage) -> Result<JobReport, PipelineError> {
        match message {
            JobMessage::ProcessOrder {
                shopee_order_id,
                shop_id,
                retry_source,
            } => {
                if let Some(source) = retry_source {
                    info!(
                        target = "dropship.pipeline",
                        order_sn = %shopee_order_id,
                        shop_id = %shop_id,
                        retry_source = %source,
                        "order_retry"
                    );
                }
                let outcome = self.process_order(shopee_order_id).await?;
                Ok(JobReport::Order {
                    shopee_order_id: shopee_order_id.clone(),
                    outcome,
                })
            }
            JobMessage::PollShop { shop_id } => Ok(JobReport::Poll(self.poll_shop(shop_id).await?)),
            JobMessage::ToggleAutoShipping { shop_id, active } => {
                let changed = self.toggle_auto_shipping(shop_id, *active).await?;
                Ok(JobReport::Toggle {
                    shop_id: shop_id.clone(),
                    active: *active,
                    changed,
                })
            }
            JobMessage::VerifyCredentials { shop_id } => Ok(JobReport::Credentials(
                self.verify_credentials(shop_id).await?,
            )),
            JobMessage::ScrapePreview { product_url } => Ok(JobReport::Preview {
                product: self.scrape_preview(product_url).await?,
            }),
        }
    }

    /// Registers or removes the shop's polling timer. Re-registering an
    /// enabled shop is a no-op. Returns whether anything changed.
    pub async fn toggle_auto_shipping(&self, shop_id: &str, active: bool) -> Result<bool, PipelineError> {
        let key = poll_repeat_key(shop_id);
        if active {
            let message = JobMessage::PollShop {
                shop_id: shop_id.to_string(),
            };
            let created = self
                .queue
                .upsert_repeatable(&key, message, self.poll_interval)
                .await
                .map_err(|err| PipelineError::transient("toggle", err))?;
            info!(target = "dropship.pipeline", shop_id, created, "auto_shipping_enabled");
            return Ok(created);
        }

        let registered = self
            .queue
            .repeatables()
            .await
            .map_err(|err| PipelineError::transient("toggle", err))?;
        let mut removed = 0;
        for spec in registered {
            let polls_this_shop = matches!(
                &spec.message,
                JobMessage::PollShop { shop_id: s } if s == shop_id
            );
            if spec.key != key && !polls_this_shop {
                continue;
            }
            if self
                .queue
                .remove_repeatable(&spec.key)
                .await
                .map_err(|err| PipelineError::transient("toggle", err))?
            {
                removed += 1;
            }
        }
        info!(target = "dropship.pipeline", shop_id, removed, "auto_shipping_disabled");
        Ok(removed > 0)
    }

    /// Operator retry: a parked order goes back in line.
    pub async fn retry_order(&self, shopee_order_id: &str) -> Result<Uuid, PipelineError> {
        let order = self
            .store
            .order_by_ref(shopee_order_id)
            .await
            .map_err(|err| PipelineError::transient("retry", err))?
            .ok_or_else(|| {
                PipelineError::configuration("retry", format!("order {shopee_order_id} not found"))
            })?;
        if !matches!(
            order.processing_status,
            ProcessingStatus::ManualReview | ProcessingStatus::Skipped
        ) {
            return Err(PipelineError::configuration(
                "retry",
                format!(
                    "order {shopee_order_id} is {}, only MANUAL_REVIEW or SKIPPED orders can be retried",
                    order.processing_status.as_str()
                ),
            ));
        }
        let update = OrderUpdate {
            processing_status: Some(ProcessingStatus::Queued),
            ..OrderUpdate::default()
        }
        .clear_error();
        self.store
            .update_order(order.id, &update)
            .await
            .map_err(|err| PipelineError::transient("retry", err))?;
        self.queue
            .enqueue(JobMessage::ProcessOrder {
                shopee_order_id: order.shopee_order_id.clone(),
                shop_id: order.shop_id.clone(),
                retry_source: Some("manual".into()),
            })
            .await
            .map_err(|err| PipelineError::transient("retry", err))
    }

    pub async fn verify_credentials(&self, shop_id: &str) -> Result<CredentialCheck, PipelineError> {
        let mut problems = Vec::new();

        let shopee = self
            .store
            .shopee_credentials(shop_id)
            .await
            .map_err(|err| PipelineError::transient("verify_credentials", err))?;
        let shopee_ok = match shopee {
            None => {
                problems.push("shopee credentials missing".to_string());
                false
            }
            Some(record) => match self.secrets.open(&record.access_token) {
                Err(err) => {
                    problems.push(format!("shopee token: {err}"));
                    false
                }
                Ok(access_token) => {
                    let auth = ShopAuth {
                        shop_id: record.shopee_shop_id,
                        access_token,
                    };
                    match self.shopee.get_shop_identity(&auth).await {
                        Ok(info) => {
                            info!(
                                target = "dropship.pipeline",
                                shop_id,
                                shop_name = %info.shop_name,
                                "shopee_credentials_ok"
                            );
                            true
                        }
                        Err(err) => {
                            problems.push(format!("shopee identity: {err}"));
                            false
                        }
                    }
                }
            },
        };

        let amazon = self
            .store
            .amazon_credentials(shop_id)
            .await
            .map_err(|err| PipelineError::transient("verify_credentials", err))?;
        let amazon_ok = match amazon {
            None => {
                problems.push("amazon credentials missing".to_string());
                false
            }
            Some(record) => match self.secrets.open(&record.password) {
                Ok(_) => true,
                Err(err) => {
                    problems.push(format!("amazon password: {err}"));
                    false
                }
            },
        };

        if !problems.is_empty() {
            self.alerts
                .send(Alert::shop(shop_id, "CREDENTIALS_INVALID", problems.join("; ")))
                .await;
        }
        Ok(CredentialCheck {
            shop_id: shop_id.to_string(),
            shopee_ok,
            amazon_ok,
            problems,
        })
    }

    pub async fn scrape_preview(&self, product_url: &str) -> Result<ScrapedProduct, PipelineError> {
        let scrape = self
            .automation
            .scrape_product(product_url)
            .await
            .map_err(|err| PipelineError::transient("scrape_preview", err))?;
        scrape.session.release().await;
        Ok(scrape.product)
    }

    async fn alert(&self, alert: Alert) {
        self.alerts.send(alert).await;
    }
}

#[cfg(test)]
mod tests {
    use super::testing::Harness;
    use super::*;
    use crate::jobs::JobQueue;
    use crate::models::{ProcessingMode, ProcessingStatus};

    #[tokio::test]
    async fn toggling_on_twice_registers_one_timer() {
        let h = Harness::new();
        assert!(h.pipeline.toggle_auto_shipping("shop-1", true).await.unwrap());
        assert!(!h.pipeline.toggle_auto_shipping("shop-1", true).await.unwrap());
        let timers = h.queue.repeatables().await.unwrap();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].key, "poll-shop:shop-1");
    }

    #[tokio::test]
    async fn toggling_off_removes_only_that_shops_timers() {
        let h = Harness::new();
        h.pipeline.toggle_auto_shipping("shop-1", true).await.unwrap();
        h.pipeline.toggle_auto_shipping("shop-2", true).await.unwrap();
        assert!(h.pipeline.toggle_auto_shipping("shop-1", false).await.unwrap());
        assert!(!h.pipeline.toggle_auto_shipping("shop-1", false).await.unwrap());
        let keys: Vec<String> = h
            .queue
            .repeatables()
            .await
            .unwrap()
            .into_iter()
            .map(|spec| spec.key)
            .collect();
        assert_eq!(keys, vec!["poll-shop:shop-2".to_string()]);
    }

    #[tokio::test]
    async fn manual_retry_requeues_parked_orders_only() {
        let h = Harness::new();
        h.put_order("SN-PARKED", ProcessingStatus::ManualReview);
        h.put_order("SN-DONE", ProcessingStatus::Fulfilled);

        h.pipeline.retry_order("SN-PARKED").await.unwrap();
        let order = h.store.order("SN-PARKED").unwrap();
        assert_eq!(order.processing_status, ProcessingStatus::Queued);
        assert_eq!(order.processing_mode, ProcessingMode::Auto);
        assert_eq!(order.error_code, None);
        let waiting = h.queue.waiting();
        assert_eq!(waiting.len(), 1);
        assert_eq!(
            waiting[0].message,
            JobMessage::ProcessOrder {
                shopee_order_id: "SN-PARKED".into(),
                shop_id: "shop-1".into(),
                retry_source: Some("manual".into()),
            }
        );

        let err = h.pipeline.retry_order("SN-DONE").await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::Configuration);
        let err = h.pipeline.retry_order("SN-MISSING").await.unwrap_err();
        assert_eq!(err.stage(), "retry");
    }

    #[tokio::test]
    async fn credential_check_reports_and_alerts_problems() {
        let h = Harness::new();
        h.put_shopee_credentials();
        let check = h.pipeline.verify_credentials("shop-1").await.unwrap();
        assert!(check.shopee_ok);
        assert!(!check.amazon_ok);
        assert_eq!(check.problems, vec!["amazon credentials missing".to_string()]);
        assert_eq!(h.alerts.codes(), vec!["CREDENTIALS_INVALID".to_string()]);

        h.put_amazon_credentials();
        let check = h.pipeline.verify_credentials("shop-1").await.unwrap();
        assert!(check.shopee_ok && check.amazon_ok);
        assert_eq!(h.alerts.codes().len(), 1);
    }

    #[tokio::test]
    async fn preview_releases_its_context() {
        let h = Harness::new();
        let product = h.pipeline.scrape_preview("https://shop.test/dp/B1").await.unwrap();
        assert_eq!(product.price, Some(12000.0));
        assert_eq!(h.automation.closes(), 1);
    }

    #[tokio::test]
    async fn handle_dispatches_by_message_name() {
        let h = Harness::new();
        let report = h
            .pipeline
            .handle(&JobMessage::ToggleAutoShipping {
                shop_id: "shop-1".into(),
                active: true,
            })
            .await
            .unwrap();
        assert_eq!(
            report,
            JobReport::Toggle {
                shop_id: "shop-1".into(),
                active: true,
                changed: true
            }
        );
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["kind"], "toggle");
    }
}
