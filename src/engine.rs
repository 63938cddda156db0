//! Trading loop: per-symbol, per-tick orchestration.
//!
//! One tick is the fixed sequence observe -> discretize -> select ->
//! execute -> reward -> observe again -> learn -> persist, with the
//! decision log entry written last. Symbols are processed serially; a
//! failure in one symbol is logged and does not stop the others. Nothing
//! here talks to the market feed - ticks run entirely off the stores, so
//! a feed outage degrades to the fallback state instead of an abort.

use rand::Rng;
use rust_decimal::Decimal;

use crate::config::Config;
use crate::decisions::DecisionLog;
use crate::discretize::{discretize, exposure_ratio, Observation, Snapshot, StateKey};
use crate::error::BotResult;
use crate::indicators::IndicatorKind;
use crate::ledger::{ExecOutcome, RefusalReason, TradeLedger};
use crate::logging::{json_log, json_warn, obj, v_bool, v_num, v_str};
use crate::qlearn::{Action, QStore, QTable, Selection};
use crate::reward::{shape, RewardParams};
use crate::store::{Bar, PriceStore};

/// What one symbol's tick did, for reporting and tests.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub symbol: String,
    pub action: Action,
    pub executed: bool,
    pub refusal: Option<RefusalReason>,
    pub exploratory: bool,
    /// None when the step was non-learnable (fallback state or refusal).
    pub reward: Option<f64>,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub outcomes: Vec<TickOutcome>,
    pub failures: usize,
}

pub struct TradingEngine<'a> {
    cfg: &'a Config,
    prices: &'a PriceStore,
    ledger: &'a mut TradeLedger,
    qstore: &'a QStore,
    decisions: &'a DecisionLog,
    params: RewardParams,
    exploit: bool,
}

impl<'a> TradingEngine<'a> {
    pub fn new(
        cfg: &'a Config,
        prices: &'a PriceStore,
        ledger: &'a mut TradeLedger,
        qstore: &'a QStore,
        decisions: &'a DecisionLog,
        exploit: bool,
    ) -> Self {
        let params = RewardParams::from_config(cfg);
        Self { cfg, prices, ledger, qstore, decisions, params, exploit }
    }

    /// Run one tick across the whole symbol universe. Per-symbol errors
    /// are logged and counted, not propagated.
    pub fn run_tick(&mut self, rng: &mut impl Rng, now: i64) -> TickReport {
        let mut report = TickReport::default();
        for symbol in self.cfg.symbols.clone() {
            match self.tick_symbol(&symbol, rng, now) {
                Ok(outcome) => {
                    json_log(
                        "tick",
                        obj(&[
                            ("symbol", v_str(&symbol)),
                            ("action", v_str(outcome.action.as_str())),
                            ("executed", v_bool(outcome.executed)),
                            ("exploratory", v_bool(outcome.exploratory)),
                            ("reward", outcome.reward.map(v_num).unwrap_or(serde_json::Value::Null)),
                        ]),
                    );
                    report.outcomes.push(outcome);
                }
                Err(err) => {
                    json_warn(
                        "tick_failed",
                        obj(&[("symbol", v_str(&symbol)), ("error", v_str(&err.to_string()))]),
                    );
                    report.failures += 1;
                }
            }
        }
        report
    }

    fn tick_symbol(&mut self, symbol: &str, rng: &mut impl Rng, now: i64) -> BotResult<TickOutcome> {
        let mut table = self.qstore.load(symbol, self.cfg)?;
        table.set_exploit(self.exploit);

        // 1-2. Observe and discretize; missing data lands on the fallback
        // state, which never learns and never trades.
        let Some((snap, last)) = self.snapshot(symbol)? else {
            return self.record_fallback(symbol, &table, now, "no bars in store");
        };
        let obs = discretize(&snap);
        if !obs.learnable {
            return self.record_fallback(symbol, &table, now, "indicators not ready");
        }

        // 3. Select.
        let selection = table.select(&obs.key, rng);
        let pre_exposure = exposure_ratio(snap.open_cost_basis, snap.starting_cash);

        // 4. Execute against the ledger.
        let (executed, refusal, realized_pnl) =
            self.execute(symbol, selection.action, last.close, selection.exploratory, now)?;

        // 5-6. Reward and learn. Refused steps get no environment
        // response: nothing is reinforced and the table is untouched.
        let reward_value;
        if executed {
            let r = shape(selection.action, true, realized_pnl, pre_exposure, &self.params);
            // An update must never bootstrap across an undefined boundary;
            // if the next observation is somehow unlearnable, s' = s.
            let next_key = self
                .snapshot(symbol)?
                .map(|(s, _)| discretize(&s))
                .filter(|next: &Observation| next.learnable)
                .map(|next| next.key)
                .unwrap_or(obs.key);
            table.update(&obs.key, selection.action, r, &next_key, false);
            self.qstore.save(symbol, &table, now)?;
            reward_value = Some(r);
        } else {
            reward_value = None;
        }

        // 7. Decision event, exactly one per selection.
        let rationale = decision_rationale(&selection, refusal);
        self.decisions.append(
            symbol,
            now,
            &obs.key.to_string(),
            selection.action,
            executed,
            selection.exploratory,
            &rationale,
            selection.values,
        )?;

        Ok(TickOutcome {
            symbol: symbol.to_string(),
            action: selection.action,
            executed,
            refusal,
            exploratory: selection.exploratory,
            reward: reward_value,
        })
    }

    /// Translate the chosen action into a ledger call. BUY uses the
    /// configured position size; SELL flattens the whole open quantity.
    fn execute(
        &mut self,
        symbol: &str,
        action: Action,
        price: Decimal,
        exploratory: bool,
        now: i64,
    ) -> BotResult<(bool, Option<RefusalReason>, Decimal)> {
        let rationale = if exploratory { "exploration" } else { "greedy" };
        match action {
            Action::Hold => Ok((true, None, Decimal::ZERO)),
            Action::Buy => {
                match self.ledger.buy(symbol, self.cfg.max_position_size, price, rationale, now)? {
                    ExecOutcome::Executed(_) => Ok((true, None, Decimal::ZERO)),
                    ExecOutcome::Refused(reason) => Ok((false, Some(reason), Decimal::ZERO)),
                }
            }
            Action::Sell => {
                let qty = self.ledger.open_quantity(symbol)?;
                if qty == 0 {
                    return Ok((false, Some(RefusalReason::InsufficientPosition), Decimal::ZERO));
                }
                match self.ledger.sell(symbol, qty, price, rationale, now)? {
                    ExecOutcome::Executed(receipt) => Ok((true, None, receipt.realized_pnl)),
                    ExecOutcome::Refused(reason) => Ok((false, Some(reason), Decimal::ZERO)),
                }
            }
        }
    }

    /// Snapshot of everything the discretizer needs, plus the latest bar.
    /// `None` when the store has no bars for the symbol at all.
    fn snapshot(&self, symbol: &str) -> BotResult<Option<(Snapshot, Bar)>> {
        let bars = self.prices.recent_bars(symbol, 2)?;
        let Some(last) = bars.last().copied() else {
            return Ok(None);
        };
        let prev_close = if bars.len() == 2 { Some(bars[0].close) } else { None };

        let snap = Snapshot {
            close: last.close,
            prev_close,
            rsi: self.prices.indicator_at(symbol, last.ts, IndicatorKind::Rsi)?,
            sma_50: self.prices.indicator_at(symbol, last.ts, IndicatorKind::Sma50)?,
            vwap: self.prices.indicator_at(symbol, last.ts, IndicatorKind::Vwap)?,
            position_qty: self.ledger.open_quantity(symbol)?,
            cash: self.ledger.cash_balance()?,
            open_cost_basis: self.ledger.open_cost_basis(None)?,
            starting_cash: self.ledger.starting_cash(),
        };
        Ok(Some((snap, last)))
    }

    /// Fallback tick: forced HOLD, not executed, no learning.
    fn record_fallback(
        &self,
        symbol: &str,
        table: &QTable,
        now: i64,
        why: &str,
    ) -> BotResult<TickOutcome> {
        let key = StateKey::fallback();
        self.decisions.append(
            symbol,
            now,
            &key.to_string(),
            Action::Hold,
            false,
            false,
            &format!("fallback state: {why}"),
            table.values(&key),
        )?;
        Ok(TickOutcome {
            symbol: symbol.to_string(),
            action: Action::Hold,
            executed: false,
            refusal: None,
            exploratory: false,
            reward: None,
        })
    }
}

fn decision_rationale(selection: &Selection, refusal: Option<RefusalReason>) -> String {
    let base = if selection.exploratory { "exploration" } else { "greedy" };
    match refusal {
        Some(reason) => format!("{base}: refused {}", reason.as_str()),
        None => base.to_string(),
    }
}
