//! Close-condition evaluation.
//!
//! Every open position is checked against three thresholds on each tick for its
//! symbol: the liquidation loss limit, take-profit and stop-loss. Liquidation
//! dominates. The exit price and pnl are computed exactly once, in
//! [`CloseDecision::at`], and the same values flow into both the status
//! transition and the balance credit.

use crate::position::{ArithmeticOverflow, CloseReason, Position};
use crate::types::{OrderId, Price, Quote, Side};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskParams {
    /// Fraction of margin an unrealized loss may consume before forced closure.
    pub liquidation_loss_fraction: Decimal,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            liquidation_loss_fraction: dec!(0.9),
        }
    }
}

impl RiskParams {
    /// The pnl at or below which a position with `margin` is liquidated.
    pub fn liquidation_threshold(&self, margin: Quote) -> Quote {
        margin.mul(self.liquidation_loss_fraction).negate()
    }

    pub fn is_liquidatable(&self, pnl: Quote, margin: Quote) -> bool {
        pnl <= self.liquidation_threshold(margin)
    }
}

/// How the trigger price should be compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerCondition {
    /// Triggers when price is at or above the trigger.
    Above,
    /// Triggers when price is at or below the trigger.
    Below,
}

impl TriggerCondition {
    pub fn is_met(&self, price: Price, trigger: Price) -> bool {
        match self {
            TriggerCondition::Above => price >= trigger,
            TriggerCondition::Below => price <= trigger,
        }
    }
}

// take profit fires when price moves in favor of the position
pub fn take_profit_condition(side: Side) -> TriggerCondition {
    match side {
        Side::Buy => TriggerCondition::Above,
        Side::Sell => TriggerCondition::Below,
    }
}

// stop loss fires when price moves against the position
pub fn stop_loss_condition(side: Side) -> TriggerCondition {
    match side {
        Side::Buy => TriggerCondition::Below,
        Side::Sell => TriggerCondition::Above,
    }
}

/// A settled outcome for one position: the single source of truth for the
/// conditional close and the credit that follows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseDecision {
    pub order_id: OrderId,
    pub reason: CloseReason,
    pub exit_price: Price,
    pub pnl: Quote,
    /// `margin + pnl`, floored at zero. Losses past the margin are not charged
    /// to the free balance, which may never go negative.
    pub credited: Quote,
}

impl CloseDecision {
    pub fn at(position: &Position, reason: CloseReason, exit_price: Price) -> Result<Self, ArithmeticOverflow> {
        let pnl = position.unrealized_pnl(exit_price)?;
        let gross = position.margin.checked_add(pnl).ok_or(ArithmeticOverflow("credit"))?;
        let credited = if gross.is_negative() { Quote::zero() } else { gross };
        Ok(Self {
            order_id: position.id,
            reason,
            exit_price,
            pnl,
            credited,
        })
    }
}

/// Decide whether `position` closes at `price`. Exit is always the tick price.
pub fn evaluate_close(
    position: &Position,
    price: Price,
    params: &RiskParams,
) -> Result<Option<CloseDecision>, ArithmeticOverflow> {
    if !position.is_active() {
        return Ok(None);
    }

    let pnl = position.unrealized_pnl(price)?;
    let reason = if params.is_liquidatable(pnl, position.margin) {
        CloseReason::Liquidated
    } else if position
        .take_profit_price
        .is_some_and(|tp| take_profit_condition(position.side).is_met(price, tp))
    {
        CloseReason::TakeProfit
    } else if position
        .stop_loss_price
        .is_some_and(|sl| stop_loss_condition(position.side).is_met(price, sl))
    {
        CloseReason::StopLoss
    } else {
        return Ok(None);
    };

    CloseDecision::at(position, reason, price).map(Some)
}

/// Price at which the liquidation threshold is reached. `None` when the
/// threshold is unreachable (a short that would need a non-positive price
/// cannot happen, a long can bottom out at zero).
pub fn liquidation_price(position: &Position, params: &RiskParams) -> Option<Price> {
    if position.quantity.is_zero() {
        return None;
    }
    let move_size = position
        .margin
        .value()
        .checked_mul(params.liquidation_loss_fraction)?
        .checked_div(position.quantity)?;
    let level = match position.side {
        Side::Buy => position.entry_price.value().checked_sub(move_size)?,
        Side::Sell => position.entry_price.value().checked_add(move_size)?,
    };
    Price::new(level)
}

/// Take-profit and stop-loss levels `pct` away from entry, in the profitable
/// and losing direction respectively.
pub fn protective_levels(side: Side, entry_price: Price, pct: Decimal) -> (Option<Price>, Option<Price>) {
    let scaled = |factor: Option<Decimal>| {
        factor
            .and_then(|f| entry_price.value().checked_mul(f))
            .and_then(Price::new)
    };
    let up = scaled(Decimal::ONE.checked_add(pct));
    let down = scaled(Decimal::ONE.checked_sub(pct));
    match side {
        Side::Buy => (up, down),
        Side::Sell => (down, up),
    }
}

/// Rejects thresholds that would fire immediately against the entry price.
pub fn validate_protective_levels(
    side: Side,
    entry_price: Price,
    take_profit: Option<Price>,
    stop_loss: Option<Price>,
) -> Result<(), String> {
    if let Some(tp) = take_profit {
        let ok = match side {
            Side::Buy => tp > entry_price,
            Side::Sell => tp < entry_price,
        };
        if !ok {
            return Err(format!(
                "take profit {tp} is on the wrong side of entry {entry_price} for a {} position",
                side.as_str()
            ));
        }
    }
    if let Some(sl) = stop_loss {
        let ok = match side {
            Side::Buy => sl < entry_price,
            Side::Sell => sl > entry_price,
        };
        if !ok {
            return Err(format!(
                "stop loss {sl} is on the wrong side of entry {entry_price} for a {} position",
                side.as_str()
            ));
        }
    }
    Ok(())
}
