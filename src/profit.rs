use chrono::{DateTime, Utc};
use serde::Serialize;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProfitInputs {
    pub sale_price: f64,
    pub replacement_cost: f64,
    pub loyalty_credit: f64,
    pub domestic_shipping_cost: f64,
    pub include_loyalty: bool,
    pub include_domestic_shipping: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfitBreakdown {
    pub base: f64,
    pub loyalty: f64,
    pub domestic_shipping: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfitEstimate {
    pub expected_profit: f64,
    pub breakdown: ProfitBreakdown,
}

/// Signed profit for one order. The breakdown holds the amounts that were
/// applied, so a disabled component reads zero and the parts always sum up.
pub fn calculate_profit(inputs: &ProfitInputs) -> ProfitEstimate {
    let base = inputs.sale_price - inputs.replacement_cost;
    let loyalty = if inputs.include_loyalty {
        inputs.loyalty_credit
    } else {
        0.0
    };
    let shipping = if inputs.include_domestic_shipping {
        inputs.domestic_shipping_cost
    } else {
        0.0
    };
    ProfitEstimate {
        expected_profit: base + loyalty - shipping,
        breakdown: ProfitBreakdown {
            base,
            loyalty,
            domestic_shipping: shipping,
        },
    }
}

/// Whole days until delivery, rounded up and floored at zero.
pub fn calculate_shipping_days(estimated_delivery: DateTime<Utc>, reference: DateTime<Utc>) -> u32 {
    let diff_ms = (estimated_delivery - reference).num_milliseconds();
    if diff_ms <= 0 {
        return 0;
    }
    let days = (diff_ms + DAY_MS - 1) / DAY_MS;
    u32::try_from(days).unwrap_or(u32::MAX)
}
