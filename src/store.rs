//! Price & indicator store: append-only bar history plus derived
//! indicator samples, keyed by (symbol, timestamp[, name]).
//!
//! Both tables use `INSERT OR IGNORE` against their natural keys, so
//! re-running an ingest over the same window is a no-op and history can
//! never be rewritten.

use rusqlite::{params, Connection};
use rust_decimal::Decimal;

use crate::error::BotResult;
use crate::indicators::IndicatorKind;
use crate::money;

/// One OHLCV observation over a five-minute interval. Immutable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    pub ts: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
}

pub struct PriceStore {
    conn: Connection,
}

impl PriceStore {
    pub fn new(path: &str) -> BotResult<Self> {
        let store = Self { conn: Connection::open(path)? };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> BotResult<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS bars (
                symbol TEXT NOT NULL,
                ts INTEGER NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume INTEGER NOT NULL,
                PRIMARY KEY (symbol, ts)
            );
            CREATE TABLE IF NOT EXISTS indicators (
                symbol TEXT NOT NULL,
                ts INTEGER NOT NULL,
                name TEXT NOT NULL,
                value REAL NOT NULL,
                PRIMARY KEY (symbol, ts, name)
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Append bars, skipping any (symbol, ts) already present.
    /// Returns the number actually inserted.
    pub fn append_bars(&mut self, symbol: &str, bars: &[Bar]) -> BotResult<usize> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        for bar in bars {
            inserted += tx.execute(
                "INSERT OR IGNORE INTO bars (symbol, ts, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    symbol,
                    bar.ts,
                    bar.open.to_string(),
                    bar.high.to_string(),
                    bar.low.to_string(),
                    bar.close.to_string(),
                    bar.volume
                ],
            )?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Append one indicator sample, idempotently.
    pub fn append_indicator(
        &mut self,
        symbol: &str,
        ts: i64,
        kind: IndicatorKind,
        value: f64,
    ) -> BotResult<bool> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO indicators (symbol, ts, name, value)
             VALUES (?1, ?2, ?3, ?4)",
            params![symbol, ts, kind.as_str(), value],
        )?;
        Ok(n > 0)
    }

    /// The most recent `limit` bars, in ascending timestamp order.
    pub fn recent_bars(&self, symbol: &str, limit: usize) -> BotResult<Vec<Bar>> {
        let mut stmt = self.conn.prepare(
            "SELECT ts, open, high, low, close, volume
             FROM (SELECT * FROM bars WHERE symbol = ?1 ORDER BY ts DESC LIMIT ?2)
             ORDER BY ts ASC",
        )?;
        let rows = stmt.query_map(params![symbol, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut bars = Vec::new();
        for row in rows {
            let (ts, o, h, l, c, v) = row?;
            bars.push(Bar {
                ts,
                open: money::parse(&o)?,
                high: money::parse(&h)?,
                low: money::parse(&l)?,
                close: money::parse(&c)?,
                volume: v,
            });
        }
        Ok(bars)
    }

    pub fn latest_bar(&self, symbol: &str) -> BotResult<Option<Bar>> {
        Ok(self.recent_bars(symbol, 1)?.pop())
    }

    /// Indicator value at an exact (symbol, ts), if ever computed.
    pub fn indicator_at(
        &self,
        symbol: &str,
        ts: i64,
        kind: IndicatorKind,
    ) -> BotResult<Option<f64>> {
        let mut stmt = self.conn.prepare(
            "SELECT value FROM indicators WHERE symbol = ?1 AND ts = ?2 AND name = ?3",
        )?;
        let mut rows = stmt.query(params![symbol, ts, kind.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub fn bar_count(&self, symbol: &str) -> BotResult<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM bars WHERE symbol = ?1",
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}
