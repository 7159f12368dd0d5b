//! Fulfillment decision engine.
//!
//! Guardrails (profit floor, shipping ceiling) are checked before anything
//! mode-specific, so no autonomy setting can let a loss or a slow delivery
//! through. The review band only ever sees orders that already cleared both.

use crate::models::{AutonomyMode, ShopConfig};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionAction {
    Skip,
    ManualReview,
    DryRun,
    AutoFulfill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionReason {
    ProfitBelowMin,
    ShippingDaysTooLong,
    InactiveShop,
    ManualMode,
    ReviewBand,
    DryRunOnly,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProfitBelowMin => "PROFIT_BELOW_MIN",
            Self::ShippingDaysTooLong => "SHIPPING_DAYS_TOO_LONG",
            Self::InactiveShop => "INACTIVE_SHOP",
            Self::ManualMode => "MANUAL_MODE",
            Self::ReviewBand => "REVIEW_BAND",
            Self::DryRunOnly => "DRY_RUN_ONLY",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub action: DecisionAction,
    pub reason: Option<DecisionReason>,
}

impl Decision {
    fn new(action: DecisionAction, reason: DecisionReason) -> Self {
        Self {
            action,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionInput {
    pub is_active: bool,
    pub is_dry_run: bool,
    pub autonomy_mode: AutonomyMode,
    pub min_profit: f64,
    pub max_shipping_days: u32,
    pub review_band_percent: Option<f64>,
    pub profit: f64,
    pub shipping_days: u32,
}

impl DecisionInput {
    pub fn for_shop(shop: &ShopConfig, profit: f64, shipping_days: u32) -> Self {
        Self {
            is_active: shop.is_active,
            is_dry_run: shop.is_dry_run,
            autonomy_mode: shop.autonomy_mode,
            min_profit: shop.min_expected_profit,
            max_shipping_days: shop.max_shipping_days,
            review_band_percent: shop.review_band_percent,
            profit,
            shipping_days,
        }
    }
}

pub fn decide(input: &DecisionInput) -> Decision {
    if input.profit < input.min_profit {
        return Decision::new(DecisionAction::Skip, DecisionReason::ProfitBelowMin);
    }
    if input.shipping_days > input.max_shipping_days {
        return Decision::new(DecisionAction::Skip, DecisionReason::ShippingDaysTooLong);
    }
    if !input.is_active {
        return Decision::new(DecisionAction::ManualReview, DecisionReason::InactiveShop);
    }
    if input.autonomy_mode == AutonomyMode::ManualOnly {
        return Decision::new(DecisionAction::ManualReview, DecisionReason::ManualMode);
    }
    if input.autonomy_mode == AutonomyMode::AutoWithReviewBand && in_review_band(input) {
        return Decision::new(DecisionAction::ManualReview, DecisionReason::ReviewBand);
    }
    if input.is_dry_run {
        return Decision::new(DecisionAction::DryRun, DecisionReason::DryRunOnly);
    }
    Decision {
        action: DecisionAction::AutoFulfill,
        reason: None,
    }
}

// Band is relative to the floor, so a floor of zero or below disables it.
fn in_review_band(input: &DecisionInput) -> bool {
    let Some(band) = input.review_band_percent.filter(|b| *b > 0.0) else {
        return false;
    };
    if input.min_profit <= 0.0 {
        return false;
    }
    let margin_over_min = (input.profit - input.min_profit) / input.min_profit;
    margin_over_min >= 0.0 && margin_over_min <= band / 100.0
}
