//! Trade ledger & bankroll: the single source of truth for paper trades.
//!
//! The trades table is append-only except for the targeted OPEN -> CLOSED
//! transitions a SELL performs, and each SELL runs as one transaction:
//! lot selection, lot updates, residual split, and the new SELL row all
//! commit or none do. Cash, positions, and the bankroll summary are pure
//! queries over the table; nothing derived is ever written back.
//!
//! FIFO matching: a SELL consumes the oldest OPEN BUY lots first. A
//! partially consumed lot is split - the consumed part becomes the CLOSED
//! row carrying realized P&L, the residual stays OPEN with the original
//! opened_at so later sells see the same queue order. Residual rows carry
//! `split_from` so trade counts ignore the bookkeeping artifact.

use rusqlite::{params, Connection};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::error::{BotError, BotResult};
use crate::money;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefusalReason {
    InsufficientCash,
    InsufficientPosition,
    NoPrice,
}

impl RefusalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefusalReason::InsufficientCash => "INSUFFICIENT_CASH",
            RefusalReason::InsufficientPosition => "INSUFFICIENT_POSITION",
            RefusalReason::NoPrice => "NO_PRICE",
        }
    }
}

/// What a ledger call did. Refusals are values, not errors: the caller
/// records them in the decision log and moves on.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    Executed(ExecReceipt),
    Refused(RefusalReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecReceipt {
    pub trade_id: i64,
    /// Aggregate realized P&L of this call (zero for a BUY).
    pub realized_pnl: Decimal,
    /// BUY lots this SELL closed, oldest first.
    pub closed_lot_ids: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct OpenLot {
    pub id: i64,
    pub qty: i64,
    pub price: Decimal,
    pub opened_at: i64,
}

#[derive(Debug, Clone)]
pub struct TradeRow {
    pub id: i64,
    pub symbol: String,
    pub action: String,
    pub qty: i64,
    pub price: Decimal,
    pub status: String,
    pub opened_at: i64,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<i64>,
    pub realized_pnl: Option<Decimal>,
    pub rationale: String,
}

/// Derived bankroll view; computed on demand, never stored.
#[derive(Debug, Clone)]
pub struct BankrollSummary {
    pub cash: Decimal,
    pub open_cost_basis: Decimal,
    pub open_market_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub total_pnl: Decimal,
    pub net_worth: Decimal,
    pub roi_pct: f64,
    pub win_rate_pct: f64,
    pub total_trades: i64,
}

pub struct TradeLedger {
    conn: Connection,
    starting_cash: Decimal,
}

impl TradeLedger {
    pub fn new(path: &str, starting_cash: Decimal) -> BotResult<Self> {
        let ledger = Self { conn: Connection::open(path)?, starting_cash };
        ledger.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                action TEXT NOT NULL CHECK (action IN ('BUY', 'SELL')),
                qty INTEGER NOT NULL CHECK (qty > 0),
                price TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('OPEN', 'CLOSED')),
                opened_at INTEGER NOT NULL,
                exit_price TEXT,
                exit_time INTEGER,
                realized_pnl TEXT,
                rationale TEXT NOT NULL DEFAULT '',
                split_from INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_trades_open
                ON trades (symbol, status, opened_at, id);",
        )?;
        Ok(ledger)
    }

    pub fn starting_cash(&self) -> Decimal {
        self.starting_cash
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Open a new lot, or refuse with INSUFFICIENT_CASH.
    pub fn buy(
        &mut self,
        symbol: &str,
        qty: i64,
        price: Decimal,
        rationale: &str,
        now: i64,
    ) -> BotResult<ExecOutcome> {
        validate_order(qty, price)?;
        let notional = money::round(price * Decimal::from(qty));
        if self.cash_balance()? < notional {
            return Ok(ExecOutcome::Refused(RefusalReason::InsufficientCash));
        }

        self.conn.execute(
            "INSERT INTO trades (symbol, action, qty, price, status, opened_at, rationale)
             VALUES (?1, 'BUY', ?2, ?3, 'OPEN', ?4, ?5)",
            params![symbol, qty, price.to_string(), now, rationale],
        )?;
        let trade_id = self.conn.last_insert_rowid();
        Ok(ExecOutcome::Executed(ExecReceipt {
            trade_id,
            realized_pnl: Decimal::ZERO,
            closed_lot_ids: Vec::new(),
        }))
    }

    /// Close open lots FIFO, or refuse with INSUFFICIENT_POSITION.
    pub fn sell(
        &mut self,
        symbol: &str,
        qty: i64,
        price: Decimal,
        rationale: &str,
        now: i64,
    ) -> BotResult<ExecOutcome> {
        validate_order(qty, price)?;
        if self.open_quantity(symbol)? < qty {
            return Ok(ExecOutcome::Refused(RefusalReason::InsufficientPosition));
        }

        let lots = self.open_lots(symbol)?;
        let tx = self.conn.transaction()?;

        let mut remaining = qty;
        let mut aggregate_pnl = Decimal::ZERO;
        let mut closed_lot_ids = Vec::new();

        for lot in lots {
            if remaining == 0 {
                break;
            }
            let matched = remaining.min(lot.qty);
            let lot_pnl = money::round((price - lot.price) * Decimal::from(matched));

            if matched == lot.qty {
                tx.execute(
                    "UPDATE trades SET status = 'CLOSED', exit_price = ?1,
                         exit_time = ?2, realized_pnl = ?3
                     WHERE id = ?4",
                    params![price.to_string(), now, lot_pnl.to_string(), lot.id],
                )?;
            } else {
                // Split: the matched part closes under the original id, the
                // residual stays OPEN at the original opened_at.
                tx.execute(
                    "UPDATE trades SET qty = ?1, status = 'CLOSED', exit_price = ?2,
                         exit_time = ?3, realized_pnl = ?4
                     WHERE id = ?5",
                    params![matched, price.to_string(), now, lot_pnl.to_string(), lot.id],
                )?;
                tx.execute(
                    "INSERT INTO trades (symbol, action, qty, price, status, opened_at,
                                         rationale, split_from)
                     SELECT symbol, action, ?1, price, 'OPEN', opened_at, rationale, id
                     FROM trades WHERE id = ?2",
                    params![lot.qty - matched, lot.id],
                )?;
            }

            aggregate_pnl += lot_pnl;
            closed_lot_ids.push(lot.id);
            remaining -= matched;
        }

        if remaining != 0 {
            return Err(BotError::Invariant(format!(
                "SELL {symbol} x{qty} left {remaining} unmatched after consuming open lots"
            )));
        }

        tx.execute(
            "INSERT INTO trades (symbol, action, qty, price, status, opened_at,
                                 realized_pnl, rationale)
             VALUES (?1, 'SELL', ?2, ?3, 'CLOSED', ?4, ?5, ?6)",
            params![symbol, qty, price.to_string(), now, aggregate_pnl.to_string(), rationale],
        )?;
        let trade_id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(ExecOutcome::Executed(ExecReceipt {
            trade_id,
            realized_pnl: aggregate_pnl,
            closed_lot_ids,
        }))
    }

    // =========================================================================
    // Derived views (pure queries)
    // =========================================================================

    /// Open quantity per symbol; zero when flat. Never negative (no
    /// shorting: SELL rows are born CLOSED).
    pub fn open_quantity(&self, symbol: &str) -> BotResult<i64> {
        let qty: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(qty), 0) FROM trades
             WHERE symbol = ?1 AND action = 'BUY' AND status = 'OPEN'",
            params![symbol],
            |row| row.get(0),
        )?;
        if qty < 0 {
            return Err(BotError::Invariant(format!("negative open quantity for {symbol}")));
        }
        Ok(qty)
    }

    /// Open BUY lots in FIFO (opened_at, id) order.
    pub fn open_lots(&self, symbol: &str) -> BotResult<Vec<OpenLot>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, qty, price, opened_at FROM trades
             WHERE symbol = ?1 AND action = 'BUY' AND status = 'OPEN'
             ORDER BY opened_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![symbol], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        let mut lots = Vec::new();
        for row in rows {
            let (id, qty, price, opened_at) = row?;
            lots.push(OpenLot { id, qty, price: money::parse(&price)?, opened_at });
        }
        Ok(lots)
    }

    /// Cash is always recomputed from the full trade history, never
    /// independently stored.
    pub fn cash_balance(&self) -> BotResult<Decimal> {
        let mut stmt = self.conn.prepare("SELECT action, qty, price FROM trades")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut cash = self.starting_cash;
        for row in rows {
            let (action, qty, price) = row?;
            let notional = money::round(money::parse(&price)? * Decimal::from(qty));
            match action.as_str() {
                "BUY" => cash -= notional,
                "SELL" => cash += notional,
                other => {
                    return Err(BotError::Invariant(format!("unknown trade action {other:?}")))
                }
            }
        }
        Ok(cash)
    }

    /// Cost basis of open lots, one symbol or the whole book.
    pub fn open_cost_basis(&self, symbol: Option<&str>) -> BotResult<Decimal> {
        let lots = match symbol {
            Some(sym) => self.open_lots(sym)?,
            None => {
                let mut all = Vec::new();
                for sym in self.symbols_with_open_lots()? {
                    all.extend(self.open_lots(&sym)?);
                }
                all
            }
        };
        Ok(lots
            .iter()
            .map(|lot| money::round(lot.price * Decimal::from(lot.qty)))
            .sum())
    }

    pub fn symbols_with_open_lots(&self) -> BotResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT symbol FROM trades
             WHERE action = 'BUY' AND status = 'OPEN' ORDER BY symbol",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut symbols = Vec::new();
        for row in rows {
            symbols.push(row?);
        }
        Ok(symbols)
    }

    /// Full bankroll view at the given marks (latest close per symbol).
    pub fn bankroll(&self, marks: &HashMap<String, Decimal>) -> BotResult<BankrollSummary> {
        let cash = self.cash_balance()?;
        let open_cost_basis = self.open_cost_basis(None)?;

        let mut open_market_value = Decimal::ZERO;
        for sym in self.symbols_with_open_lots()? {
            let qty = self.open_quantity(&sym)?;
            // Symbols without a mark fall back to cost (no fresh bar yet).
            let mark = match marks.get(&sym) {
                Some(px) => *px * Decimal::from(qty),
                None => self.open_cost_basis(Some(&sym))?,
            };
            open_market_value += money::round(mark);
        }

        let (realized_pnl, wins, closed_lots): (Decimal, i64, i64) = {
            let mut stmt = self.conn.prepare(
                "SELECT realized_pnl FROM trades
                 WHERE action = 'BUY' AND status = 'CLOSED'",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, Option<String>>(0))?;
            let mut total = Decimal::ZERO;
            let mut wins = 0;
            let mut closed = 0;
            for row in rows {
                let pnl = match row? {
                    Some(s) => money::parse(&s)?,
                    None => Decimal::ZERO,
                };
                total += pnl;
                closed += 1;
                if pnl > Decimal::ZERO {
                    wins += 1;
                }
            }
            (total, wins, closed)
        };

        let unrealized_pnl = open_market_value - open_cost_basis;
        let total_pnl = realized_pnl + unrealized_pnl;
        let net_worth = cash + open_market_value;
        let total_trades: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE split_from IS NULL",
            [],
            |row| row.get(0),
        )?;

        let roi_pct = ((total_pnl / self.starting_cash) * Decimal::from(100))
            .to_f64()
            .unwrap_or(0.0);
        let win_rate_pct = if closed_lots > 0 {
            wins as f64 / closed_lots as f64 * 100.0
        } else {
            0.0
        };

        Ok(BankrollSummary {
            cash,
            open_cost_basis,
            open_market_value,
            unrealized_pnl,
            realized_pnl,
            total_pnl,
            net_worth,
            roi_pct,
            win_rate_pct,
            total_trades,
        })
    }

    /// Every row for a symbol, insertion order. Mostly for tests and the
    /// status report.
    pub fn trades_for(&self, symbol: &str) -> BotResult<Vec<TradeRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, symbol, action, qty, price, status, opened_at,
                    exit_price, exit_time, realized_pnl, rationale
             FROM trades WHERE symbol = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![symbol], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<i64>>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, String>(10)?,
            ))
        })?;
        let mut trades = Vec::new();
        for row in rows {
            let (id, symbol, action, qty, price, status, opened_at, exit_price, exit_time, pnl, rationale) =
                row?;
            trades.push(TradeRow {
                id,
                symbol,
                action,
                qty,
                price: money::parse(&price)?,
                status,
                opened_at,
                exit_price: exit_price.as_deref().map(money::parse).transpose()?,
                exit_time,
                realized_pnl: pnl.as_deref().map(money::parse).transpose()?,
                rationale,
            });
        }
        Ok(trades)
    }
}

fn validate_order(qty: i64, price: Decimal) -> BotResult<()> {
    if qty <= 0 {
        return Err(BotError::Invariant(format!("order quantity {qty} must be positive")));
    }
    if price <= Decimal::ZERO {
        return Err(BotError::Invariant(format!("order price {price} must be positive")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn ledger() -> TradeLedger {
        TradeLedger::new(":memory:", d("100000")).unwrap()
    }

    fn must_exec(outcome: ExecOutcome) -> ExecReceipt {
        match outcome {
            ExecOutcome::Executed(r) => r,
            ExecOutcome::Refused(r) => panic!("unexpected refusal: {}", r.as_str()),
        }
    }

    #[test]
    fn break_even_round_trip() {
        // Buy 5 @ 248.75, sell 5 @ 248.75: everything closes at zero.
        let mut ledger = ledger();
        must_exec(ledger.buy("AAPL", 5, d("248.75"), "t", 100).unwrap());
        let receipt = must_exec(ledger.sell("AAPL", 5, d("248.75"), "t", 200).unwrap());
        assert_eq!(receipt.realized_pnl, Decimal::ZERO);

        let rows = ledger.trades_for("AAPL").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == "CLOSED"));
        assert_eq!(rows[0].realized_pnl, Some(d("0.00")));

        let summary = ledger.bankroll(&HashMap::new()).unwrap();
        assert_eq!(summary.cash, d("100000.00"));
        assert_eq!(summary.total_trades, 2);
        assert_eq!(summary.win_rate_pct, 0.0);
    }

    #[test]
    fn profitable_round_trip() {
        // Buy 5 @ 184.05, sell 5 @ 185.00.
        let mut ledger = ledger();
        must_exec(ledger.buy("AAPL", 5, d("184.05"), "t", 100).unwrap());
        let receipt = must_exec(ledger.sell("AAPL", 5, d("185.00"), "t", 200).unwrap());
        assert_eq!(receipt.realized_pnl, d("4.75"));

        let summary = ledger.bankroll(&HashMap::new()).unwrap();
        assert_eq!(summary.cash, d("100004.75"));
        assert_eq!(summary.realized_pnl, d("4.75"));
        assert_eq!(summary.total_pnl, d("4.75"));
        assert_eq!(summary.win_rate_pct, 100.0);
    }

    #[test]
    fn partial_close_splits_lot_fifo() {
        // Buy 5 @ 100, buy 5 @ 110, sell 8 @ 120.
        let mut ledger = ledger();
        let b1 = must_exec(ledger.buy("AAPL", 5, d("100"), "t", 100).unwrap());
        let b2 = must_exec(ledger.buy("AAPL", 5, d("110"), "t", 200).unwrap());
        let receipt = must_exec(ledger.sell("AAPL", 8, d("120"), "t", 300).unwrap());

        assert_eq!(receipt.realized_pnl, d("130.00"));
        assert_eq!(receipt.closed_lot_ids, vec![b1.trade_id, b2.trade_id]);

        let lots = ledger.open_lots("AAPL").unwrap();
        assert_eq!(lots.len(), 1);
        assert_eq!(lots[0].qty, 2);
        assert_eq!(lots[0].price, d("110"));
        assert_eq!(lots[0].opened_at, 200);
        assert_eq!(ledger.open_quantity("AAPL").unwrap(), 2);

        // Cash = 100000 - 500 - 550 + 960.
        assert_eq!(ledger.cash_balance().unwrap(), d("99910.00"));

        let rows = ledger.trades_for("AAPL").unwrap();
        let closed_pnls: Vec<Decimal> = rows
            .iter()
            .filter(|r| r.action == "BUY" && r.status == "CLOSED")
            .map(|r| r.realized_pnl.unwrap())
            .collect();
        assert_eq!(closed_pnls, vec![d("100.00"), d("30.00")]);
    }

    #[test]
    fn residual_lot_keeps_fifo_priority() {
        let mut ledger = ledger();
        must_exec(ledger.buy("AAPL", 5, d("100"), "t", 100).unwrap());
        must_exec(ledger.buy("AAPL", 5, d("110"), "t", 200).unwrap());
        must_exec(ledger.sell("AAPL", 7, d("120"), "t", 300).unwrap());
        // Residual 3 @ 110 (opened_at 200) must close before nothing else.
        let receipt = must_exec(ledger.sell("AAPL", 3, d("115"), "t", 400).unwrap());
        assert_eq!(receipt.realized_pnl, d("15.00"));
        assert_eq!(ledger.open_quantity("AAPL").unwrap(), 0);
    }

    #[test]
    fn buy_refused_on_insufficient_cash() {
        // A tiny bankroll cannot afford 5 @ 248.75.
        let mut ledger = TradeLedger::new(":memory:", d("100")).unwrap();
        let outcome = ledger.buy("AAPL", 5, d("248.75"), "t", 100).unwrap();
        assert_eq!(outcome, ExecOutcome::Refused(RefusalReason::InsufficientCash));
        assert_eq!(ledger.cash_balance().unwrap(), d("100"));
        assert!(ledger.trades_for("AAPL").unwrap().is_empty());
    }

    #[test]
    fn sell_refused_on_insufficient_position() {
        let mut ledger = ledger();
        must_exec(ledger.buy("AAPL", 5, d("100"), "t", 100).unwrap());
        let outcome = ledger.sell("AAPL", 6, d("100"), "t", 200).unwrap();
        assert_eq!(outcome, ExecOutcome::Refused(RefusalReason::InsufficientPosition));
        assert_eq!(ledger.open_quantity("AAPL").unwrap(), 5);

        let outcome = ledger.sell("MSFT", 1, d("100"), "t", 200).unwrap();
        assert_eq!(outcome, ExecOutcome::Refused(RefusalReason::InsufficientPosition));
    }

    #[test]
    fn rejects_nonpositive_orders() {
        let mut ledger = ledger();
        assert!(ledger.buy("AAPL", 0, d("100"), "t", 100).is_err());
        assert!(ledger.buy("AAPL", 5, d("0"), "t", 100).is_err());
        assert!(ledger.sell("AAPL", -1, d("100"), "t", 100).is_err());
    }

    #[test]
    fn unrealized_pnl_marks_open_lots() {
        let mut ledger = ledger();
        must_exec(ledger.buy("AAPL", 10, d("100"), "t", 100).unwrap());
        let marks = HashMap::from([("AAPL".to_string(), d("105"))]);
        let summary = ledger.bankroll(&marks).unwrap();
        assert_eq!(summary.open_cost_basis, d("1000.00"));
        assert_eq!(summary.open_market_value, d("1050.00"));
        assert_eq!(summary.unrealized_pnl, d("50.00"));
        assert_eq!(summary.net_worth, d("100050.00"));
    }

    #[test]
    fn cross_symbol_isolation() {
        let mut ledger = ledger();
        must_exec(ledger.buy("AAPL", 5, d("100"), "t", 100).unwrap());
        must_exec(ledger.buy("MSFT", 3, d("200"), "t", 100).unwrap());
        must_exec(ledger.sell("AAPL", 5, d("110"), "t", 200).unwrap());
        assert_eq!(ledger.open_quantity("AAPL").unwrap(), 0);
        assert_eq!(ledger.open_quantity("MSFT").unwrap(), 3);
        assert_eq!(ledger.symbols_with_open_lots().unwrap(), vec!["MSFT".to_string()]);
    }
}
