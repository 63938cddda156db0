//! Reward shaping: the capital-discipline policy tying trade outcomes to
//! the learner.
//!
//! Contract: BUY is non-positive and grows with committed capital, HOLD
//! is a small constant opportunity cost, SELL is the raw realized P&L,
//! and refusals reinforce nothing.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::config::Config;
use crate::qlearn::Action;

#[derive(Debug, Clone, Copy)]
pub struct RewardParams {
    pub hold_penalty: f64,
    pub buy_penalty: f64,
    /// Unscaled BUY penalty, for checkpoints trained before exposure
    /// scaling existed.
    pub flat_buy: bool,
}

impl RewardParams {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            hold_penalty: cfg.hold_penalty,
            buy_penalty: cfg.buy_penalty,
            flat_buy: cfg.flat_buy_penalty,
        }
    }
}

/// Reward for one completed step. `exposure_ratio` is open cost basis
/// over starting cash, sampled when the action was chosen.
pub fn shape(
    action: Action,
    executed: bool,
    realized_pnl: Decimal,
    exposure_ratio: f64,
    params: &RewardParams,
) -> f64 {
    if !executed {
        return 0.0;
    }
    match action {
        Action::Hold => params.hold_penalty,
        Action::Buy => {
            if params.flat_buy {
                params.buy_penalty
            } else {
                params.buy_penalty * (1.0 + (exposure_ratio - 0.5).max(0.0))
            }
        }
        Action::Sell => realized_pnl.to_f64().unwrap_or(0.0),
    }
}
