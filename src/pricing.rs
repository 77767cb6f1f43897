// =============================================================================
// Entry-price and TP/SL calculation — spec §4.7
// =============================================================================

use tracing::debug;

use crate::store::SymbolFilterRow;
use crate::types::Side;

/// Order type to submit for a computed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Limit,
    Market,
}

/// Fully computed and filter-rounded order plan.
#[derive(Debug, Clone)]
pub struct PricedOrder {
    pub kind: OrderKind,
    pub entry_price: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: Option<f64>,
    pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PricingError {
    /// Counter-trend tick fell outside the extend admission window and
    /// passive-limit-on-extend-miss is disabled.
    ExtendMissed,
    /// Notional remains below `min_notional` even after rounding up one step.
    BelowMinNotional,
}

impl std::fmt::Display for PricingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExtendMissed => write!(f, "tick outside extend admission window"),
            Self::BelowMinNotional => write!(f, "order notional below minimum even after step-up"),
        }
    }
}

/// Round `price` to the nearest multiple of `tick_size`.
pub fn round_to_tick(price: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 {
        return price;
    }
    (price / tick_size).round() * tick_size
}

/// Floor `quantity` to the nearest multiple of `step_size`.
pub fn floor_to_step(quantity: f64, step_size: f64) -> f64 {
    if step_size <= 0.0 {
        return quantity;
    }
    (quantity / step_size).floor() * step_size
}

/// The counter-trend pullback target computed once at match time: `entry` and
/// `delta` are then pinned for the lifetime of the pending signal, and every
/// later tick is re-checked against them via [`extend_admission_ratio`].
#[derive(Debug, Clone, Copy)]
pub struct ExtendTarget {
    pub entry: f64,
    pub delta: f64,
}

/// Desired counter-trend entry and the open/current delta it was derived
/// from, per spec §4.7. Computed once when a strategy first matches.
pub fn compute_extend_target(side: Side, open: f64, current: f64, extend_pct: u32) -> ExtendTarget {
    let delta = (current - open).abs();
    let extend_ratio = extend_pct as f64 / 100.0;
    let entry = match side {
        Side::Long => current - extend_ratio * delta,
        Side::Short => current + extend_ratio * delta,
    };
    ExtendTarget { entry, delta }
}

/// `|current - entry| / delta`, per spec §4.7 / S4. `delta == 0` admits
/// unconditionally (there is no window to miss).
pub fn extend_admission_ratio(target: ExtendTarget, current: f64) -> f64 {
    if target.delta <= 0.0 {
        return 0.0;
    }
    (current - target.entry).abs() / target.delta
}

/// Entry-price calculation plus TP/SL and filter rounding, spec §4.7.
///
/// `match_price` is the tick that caused the strategy to match and is used,
/// together with `open`, to derive the counter-trend target via
/// [`compute_extend_target`]. `admission_price` is the latest known tick at
/// the moment the Order Service is about to submit — it may have moved since
/// `match_price` was observed (tick batching, dispatch latency) — and is the
/// price checked against the extend admission window. Callers with no later
/// tick available pass the same value for both.
#[allow(clippy::too_many_arguments)]
pub fn price_signal(
    side: Side,
    is_reverse_strategy: bool,
    open: f64,
    match_price: f64,
    admission_price: f64,
    extend_pct: u32,
    take_profit_tenths: u32,
    stoploss_tenths: u32,
    amount_quote: f64,
    extend_max_diff_ratio: f64,
    passive_limit_on_extend_miss: bool,
    filter: SymbolFilterRow,
) -> Result<PricedOrder, PricingError> {
    let tp_effective = take_profit_tenths as f64 / 10.0 / 100.0;
    let sl_effective = stoploss_tenths as f64 / 10.0 / 100.0;

    let (kind, raw_entry) = if is_reverse_strategy {
        let target = compute_extend_target(side, open, match_price, extend_pct);

        if extend_pct > 0 {
            let diff_ratio = extend_admission_ratio(target, admission_price);
            if diff_ratio > extend_max_diff_ratio {
                if passive_limit_on_extend_miss {
                    debug!(diff_ratio, "extend window missed — resting passive limit at entry");
                } else {
                    return Err(PricingError::ExtendMissed);
                }
            }
        }

        (OrderKind::Limit, target.entry)
    } else {
        (OrderKind::Market, match_price)
    };

    let take_profit_price = match side {
        Side::Long => raw_entry * (1.0 + tp_effective),
        Side::Short => raw_entry * (1.0 - tp_effective),
    };

    let stop_loss_price = if stoploss_tenths == 0 {
        None
    } else {
        Some(match side {
            Side::Long => raw_entry * (1.0 - sl_effective),
            Side::Short => raw_entry * (1.0 + sl_effective),
        })
    };

    let entry_price = round_to_tick(raw_entry, filter.tick_size);
    let take_profit_price = round_to_tick(take_profit_price, filter.tick_size);
    let stop_loss_price = stop_loss_price.map(|sl| round_to_tick(sl, filter.tick_size));

    let raw_quantity = if entry_price > 0.0 { amount_quote / entry_price } else { 0.0 };
    let mut quantity = floor_to_step(raw_quantity, filter.step_size);

    if quantity * entry_price < filter.min_notional {
        quantity = floor_to_step(quantity + filter.step_size, filter.step_size);
        if quantity * entry_price < filter.min_notional {
            return Err(PricingError::BelowMinNotional);
        }
    }

    Ok(PricedOrder { kind, entry_price, take_profit_price, stop_loss_price, quantity })
}
