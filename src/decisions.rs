//! Decision log: immutable audit trail of every selection event.
//!
//! One row per agent decision - including HOLDs, refusals, and fallback
//! ticks - so a run can be replayed and audited after the fact. Rows are
//! never updated or deleted.

use rusqlite::{params, Connection};

use crate::error::BotResult;
use crate::qlearn::Action;

/// One selection event, as recorded.
#[derive(Debug, Clone)]
pub struct DecisionEvent {
    pub id: i64,
    pub symbol: String,
    pub ts: i64,
    pub state: String,
    pub action: String,
    pub executed: bool,
    pub exploratory: bool,
    pub rationale: String,
    pub q_buy: f64,
    pub q_sell: f64,
    pub q_hold: f64,
}

pub struct DecisionLog {
    conn: Connection,
}

impl DecisionLog {
    pub fn new(path: &str) -> BotResult<Self> {
        let log = Self { conn: Connection::open(path)? };
        log.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                ts INTEGER NOT NULL,
                state TEXT NOT NULL,
                action TEXT NOT NULL,
                executed INTEGER NOT NULL,
                exploratory INTEGER NOT NULL,
                rationale TEXT NOT NULL,
                q_buy REAL NOT NULL,
                q_sell REAL NOT NULL,
                q_hold REAL NOT NULL
            );",
        )?;
        Ok(log)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        symbol: &str,
        ts: i64,
        state: &str,
        action: Action,
        executed: bool,
        exploratory: bool,
        rationale: &str,
        values: [f64; 3],
    ) -> BotResult<i64> {
        self.conn.execute(
            "INSERT INTO decisions
                 (symbol, ts, state, action, executed, exploratory, rationale,
                  q_buy, q_sell, q_hold)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                symbol,
                ts,
                state,
                action.as_str(),
                executed as i64,
                exploratory as i64,
                rationale,
                values[0],
                values[1],
                values[2]
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent events first.
    pub fn recent(&self, limit: usize) -> BotResult<Vec<DecisionEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, symbol, ts, state, action, executed, exploratory, rationale,
                    q_buy, q_sell, q_hold
             FROM decisions ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(DecisionEvent {
                id: row.get(0)?,
                symbol: row.get(1)?,
                ts: row.get(2)?,
                state: row.get(3)?,
                action: row.get(4)?,
                executed: row.get::<_, i64>(5)? != 0,
                exploratory: row.get::<_, i64>(6)? != 0,
                rationale: row.get(7)?,
                q_buy: row.get(8)?,
                q_sell: row.get(9)?,
                q_hold: row.get(10)?,
            })
        })?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    pub fn count(&self) -> BotResult<i64> {
        let n = self.conn.query_row("SELECT COUNT(*) FROM decisions", [], |row| row.get(0))?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back() {
        let log = DecisionLog::new(":memory:").unwrap();
        log.append("AAPL", 100, "s", Action::Hold, true, false, "greedy", [0.1, 0.2, 0.3])
            .unwrap();
        log.append("AAPL", 200, "s", Action::Buy, false, true, "INSUFFICIENT_CASH", [0.0; 3])
            .unwrap();

        assert_eq!(log.count().unwrap(), 2);
        let events = log.recent(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "BUY");
        assert!(!events[0].executed);
        assert!(events[0].exploratory);
        assert_eq!(events[1].action, "HOLD");
        assert!((events[1].q_hold - 0.3).abs() < 1e-12);
    }
}
