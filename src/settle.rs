//! Settlement: end-of-session closer.
//!
//! Forces every open lot closed at the last known price and feeds the
//! realized P&L back as a terminal TD update (done = true, no bootstrap),
//! so a session's final outcome cannot leak value from a next state that
//! will never happen. Symbols without any stored bar are refused with a
//! warning rather than settled at a made-up price.

use crate::config::Config;
use crate::decisions::DecisionLog;
use crate::discretize::{discretize, Snapshot, StateKey};
use crate::error::{BotError, BotResult};
use crate::indicators::IndicatorKind;
use crate::ledger::{ExecOutcome, RefusalReason, TradeLedger};
use crate::logging::{json_log, json_warn, obj, v_int, v_num, v_str};
use crate::qlearn::{Action, QStore};
use crate::reward::{shape, RewardParams};
use crate::store::PriceStore;

#[derive(Debug, Default)]
pub struct SettlementReport {
    /// (symbol, realized P&L) per settled symbol.
    pub settled: Vec<(String, f64)>,
    /// Symbols refused for lack of a price.
    pub skipped: Vec<String>,
}

pub fn run_settlement(
    cfg: &Config,
    prices: &PriceStore,
    ledger: &mut TradeLedger,
    qstore: &QStore,
    decisions: &DecisionLog,
    now: i64,
) -> BotResult<SettlementReport> {
    let mut report = SettlementReport::default();

    for symbol in ledger.symbols_with_open_lots()? {
        let qty = ledger.open_quantity(&symbol)?;
        if qty == 0 {
            continue;
        }
        let mut table = qstore.load(&symbol, cfg)?;

        let Some(last) = prices.latest_bar(&symbol)? else {
            json_warn(
                "settle_no_price",
                obj(&[("symbol", v_str(&symbol)), ("open_qty", v_int(qty))]),
            );
            decisions.append(
                &symbol,
                now,
                &StateKey::fallback().to_string(),
                Action::Sell,
                false,
                false,
                &format!("settlement refused: {}", RefusalReason::NoPrice.as_str()),
                table.values(&StateKey::fallback()),
            )?;
            report.skipped.push(symbol);
            continue;
        };

        // Pre-sale observation for the terminal update.
        let pre = discretize(&Snapshot {
            close: last.close,
            prev_close: prices
                .recent_bars(&symbol, 2)?
                .first()
                .filter(|b| b.ts < last.ts)
                .map(|b| b.close),
            rsi: prices.indicator_at(&symbol, last.ts, IndicatorKind::Rsi)?,
            sma_50: prices.indicator_at(&symbol, last.ts, IndicatorKind::Sma50)?,
            vwap: prices.indicator_at(&symbol, last.ts, IndicatorKind::Vwap)?,
            position_qty: qty,
            cash: ledger.cash_balance()?,
            open_cost_basis: ledger.open_cost_basis(None)?,
            starting_cash: ledger.starting_cash(),
        });

        let receipt = match ledger.sell(&symbol, qty, last.close, "settlement", now)? {
            ExecOutcome::Executed(receipt) => receipt,
            ExecOutcome::Refused(reason) => {
                // Open quantity was read moments ago; a refusal here means
                // the ledger and this loop disagree about reality.
                return Err(BotError::Invariant(format!(
                    "settlement SELL {symbol} x{qty} refused: {}",
                    reason.as_str()
                )));
            }
        };

        let reward = shape(
            Action::Sell,
            true,
            receipt.realized_pnl,
            0.0,
            &RewardParams::from_config(cfg),
        );

        // Terminal update only from a learnable state; a fallback tuple
        // never receives reinforcement, even at settlement.
        if pre.learnable {
            table.update(&pre.key, Action::Sell, reward, &pre.key, true);
            qstore.save(&symbol, &table, now)?;
        }
        decisions.append(
            &symbol,
            now,
            &pre.key.to_string(),
            Action::Sell,
            true,
            false,
            "settlement",
            table.values(&pre.key),
        )?;

        json_log(
            "settled",
            obj(&[
                ("symbol", v_str(&symbol)),
                ("qty", v_int(qty)),
                ("price", v_str(&last.close.to_string())),
                ("realized_pnl", v_num(reward)),
            ]),
        );
        report.settled.push((symbol, reward));
    }

    Ok(report)
}
