//! Tabular Q-learning: action-value store, epsilon-greedy selection,
//! TD(0) updates, and per-symbol persistence.
//!
//! The table maps discrete state tuples to one value per action; missing
//! entries read as zero. Persistence is a whole-document JSON rewrite per
//! symbol (last writer wins); keys are the fixed tagged encoding from the
//! discretizer, parsed back with its restricted parser so a tampered
//! document can never smuggle anything executable - bad keys are skipped
//! with a warning.

use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use crate::config::Config;
use crate::discretize::StateKey;
use crate::error::BotResult;
use crate::logging::{json_warn, obj, v_str};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    pub const ALL: [Action; 3] = [Action::Buy, Action::Sell, Action::Hold];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
            Action::Hold => "HOLD",
        }
    }

    fn idx(&self) -> usize {
        match self {
            Action::Buy => 0,
            Action::Sell => 1,
            Action::Hold => 2,
        }
    }
}

/// Result of one selection: the action, whether it came from the
/// exploration branch, and the values the policy saw.
#[derive(Debug, Clone, Copy)]
pub struct Selection {
    pub action: Action,
    pub exploratory: bool,
    /// Q values in [BUY, SELL, HOLD] order.
    pub values: [f64; 3],
}

pub struct QTable {
    states: HashMap<StateKey, [f64; 3]>,
    pub alpha: f64,
    pub gamma: f64,
    pub epsilon: f64,
    pub epsilon_decay: f64,
    pub epsilon_min: f64,
    pub total_episodes: u64,
    pub total_rewards: f64,
    exploit: bool,
}

impl QTable {
    pub fn new(cfg: &Config) -> Self {
        Self {
            states: HashMap::new(),
            alpha: cfg.learning_rate,
            gamma: cfg.discount_factor,
            epsilon: cfg.exploration_rate,
            epsilon_decay: cfg.exploration_decay,
            epsilon_min: cfg.min_exploration,
            total_episodes: 0,
            total_rewards: 0.0,
            exploit: false,
        }
    }

    /// Exploit mode: argmax only, epsilon frozen. Updates still apply so
    /// deployment keeps learning from observed outcomes.
    pub fn set_exploit(&mut self, on: bool) {
        self.exploit = on;
    }

    pub fn values(&self, key: &StateKey) -> [f64; 3] {
        self.states.get(key).copied().unwrap_or([0.0; 3])
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Derived, never stored.
    pub fn avg_reward(&self) -> f64 {
        self.total_rewards / self.total_episodes.max(1) as f64
    }

    /// Greedy action with the deterministic tie-break HOLD > BUY > SELL.
    fn greedy(values: &[f64; 3]) -> Action {
        let mut best = Action::Hold;
        for cand in [Action::Buy, Action::Sell] {
            if values[cand.idx()] > values[best.idx()] {
                best = cand;
            }
        }
        best
    }

    pub fn select(&self, key: &StateKey, rng: &mut impl Rng) -> Selection {
        let values = self.values(key);
        if !self.exploit && rng.gen::<f64>() < self.epsilon {
            let action = Action::ALL[rng.gen_range(0..Action::ALL.len())];
            return Selection { action, exploratory: true, values };
        }
        Selection { action: Self::greedy(&values), exploratory: false, values }
    }

    /// TD(0): Q[s][a] += alpha * (r + gamma * max Q[s'] - Q[s][a]).
    /// `done` drops the bootstrap term for terminal transitions.
    pub fn update(&mut self, s: &StateKey, a: Action, reward: f64, next: &StateKey, done: bool) {
        let bootstrap = if done {
            0.0
        } else {
            let nv = self.values(next);
            self.gamma * nv.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
        };
        let entry = self.states.entry(*s).or_insert([0.0; 3]);
        let q = entry[a.idx()];
        entry[a.idx()] = q + self.alpha * (reward + bootstrap - q);

        self.total_rewards += reward;
        self.total_episodes += 1;
        if !self.exploit {
            self.epsilon = (self.epsilon * self.epsilon_decay).max(self.epsilon_min);
        }
    }
}

// =============================================================================
// Persistence
// =============================================================================

#[derive(Serialize, Deserialize)]
struct DocValues {
    buy: f64,
    sell: f64,
    hold: f64,
}

/// On-disk snapshot. States are keyed by the tagged string encoding;
/// avg_reward is deliberately absent (recomputed on read).
#[derive(Serialize, Deserialize)]
struct QDoc {
    alpha: f64,
    gamma: f64,
    epsilon: f64,
    total_episodes: u64,
    total_rewards: f64,
    states: BTreeMap<String, DocValues>,
}

pub struct QStore {
    conn: Connection,
}

impl QStore {
    pub fn new(path: &str) -> BotResult<Self> {
        let store = Self { conn: Connection::open(path)? };
        store.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS q_tables (
                symbol TEXT PRIMARY KEY,
                doc TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(store)
    }

    /// Load the symbol's table, or a fresh one from configured
    /// hyperparameters on first touch.
    pub fn load(&self, symbol: &str, cfg: &Config) -> BotResult<QTable> {
        let doc: Option<String> = self
            .conn
            .query_row(
                "SELECT doc FROM q_tables WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?;

        let Some(doc) = doc else {
            return Ok(QTable::new(cfg));
        };
        let doc: QDoc = serde_json::from_str(&doc)
            .map_err(|e| crate::error::BotError::Invariant(format!("corrupt q-table doc for {symbol}: {e}")))?;

        let mut table = QTable::new(cfg);
        table.alpha = doc.alpha;
        table.gamma = doc.gamma;
        table.epsilon = doc.epsilon;
        table.total_episodes = doc.total_episodes;
        table.total_rewards = doc.total_rewards;
        for (raw, v) in doc.states {
            match StateKey::from_str(&raw) {
                Ok(key) => {
                    table.states.insert(key, [v.buy, v.sell, v.hold]);
                }
                Err(err) => {
                    json_warn(
                        "qtable_skip_state",
                        obj(&[
                            ("symbol", v_str(symbol)),
                            ("state", v_str(&raw)),
                            ("error", v_str(&err)),
                        ]),
                    );
                }
            }
        }
        Ok(table)
    }

    /// Whole-document rewrite; last writer wins.
    pub fn save(&self, symbol: &str, table: &QTable, now: i64) -> BotResult<()> {
        let states: BTreeMap<String, DocValues> = table
            .states
            .iter()
            .map(|(k, v)| {
                (k.to_string(), DocValues { buy: v[0], sell: v[1], hold: v[2] })
            })
            .collect();
        let doc = QDoc {
            alpha: table.alpha,
            gamma: table.gamma,
            epsilon: table.epsilon,
            total_episodes: table.total_episodes,
            total_rewards: table.total_rewards,
            states,
        };
        let doc = serde_json::to_string(&doc)
            .map_err(|e| crate::error::BotError::Invariant(format!("q-table doc for {symbol} failed to serialize: {e}")))?;
        self.conn.execute(
            "INSERT INTO q_tables (symbol, doc, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(symbol) DO UPDATE SET doc = excluded.doc,
                 updated_at = excluded.updated_at",
            params![symbol, doc, now],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn cfg() -> Config {
        Config::for_tests(":memory:")
    }

    fn key() -> StateKey {
        StateKey::fallback()
    }

    #[test]
    fn missing_states_read_as_zero() {
        let table = QTable::new(&cfg());
        assert_eq!(table.values(&key()), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn tie_break_prefers_hold_then_buy() {
        assert_eq!(QTable::greedy(&[0.0, 0.0, 0.0]), Action::Hold);
        assert_eq!(QTable::greedy(&[1.0, 1.0, 1.0]), Action::Hold);
        assert_eq!(QTable::greedy(&[2.0, 2.0, 1.0]), Action::Buy);
        assert_eq!(QTable::greedy(&[1.0, 2.0, 1.0]), Action::Sell);
        assert_eq!(QTable::greedy(&[3.0, 2.0, 1.0]), Action::Buy);
    }

    #[test]
    fn td_update_moves_toward_target() {
        let mut table = QTable::new(&cfg());
        let s = key();
        table.update(&s, Action::Buy, 10.0, &s, true);
        // Q = 0 + 0.1 * (10 - 0) = 1.0
        assert!((table.values(&s)[0] - 1.0).abs() < 1e-12);
        assert_eq!(table.total_episodes, 1);
        assert!((table.total_rewards - 10.0).abs() < 1e-12);
    }

    #[test]
    fn terminal_update_has_no_bootstrap() {
        let mut table = QTable::new(&cfg());
        let s = key();
        // Seed a large next-state value; done=true must ignore it.
        table.update(&s, Action::Hold, 100.0, &s, true);
        let before = table.values(&s)[2];
        table.update(&s, Action::Sell, 0.0, &s, true);
        let q_sell = table.values(&s)[1];
        // Without bootstrap the sell value is alpha * (0 - 0) = 0.
        assert!(q_sell.abs() < 1e-12, "bootstrap leaked: {q_sell} (hold was {before})");
    }

    #[test]
    fn epsilon_decays_to_floor_and_is_monotone() {
        let mut table = QTable::new(&cfg());
        let s = key();
        let mut prev = table.epsilon;
        for _ in 0..10_000 {
            table.update(&s, Action::Hold, 0.0, &s, false);
            assert!(table.epsilon <= prev);
            assert!(table.epsilon >= table.epsilon_min);
            prev = table.epsilon;
        }
        assert_eq!(table.epsilon, 0.01);
    }

    #[test]
    fn exploit_freezes_epsilon_but_still_learns() {
        let mut table = QTable::new(&cfg());
        table.set_exploit(true);
        let s = key();
        table.update(&s, Action::Buy, 5.0, &s, true);
        assert_eq!(table.epsilon, 1.0);
        assert!(table.values(&s)[0] > 0.0);

        // With epsilon 1.0 a non-exploit table always explores; exploit
        // mode must take argmax instead.
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let sel = table.select(&s, &mut rng);
            assert!(!sel.exploratory);
            assert_eq!(sel.action, Action::Buy);
        }
    }

    #[test]
    fn avg_reward_is_derived() {
        let mut table = QTable::new(&cfg());
        assert_eq!(table.avg_reward(), 0.0);
        let s = key();
        table.update(&s, Action::Sell, 3.0, &s, true);
        table.update(&s, Action::Sell, 1.0, &s, true);
        assert!((table.avg_reward() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn persistence_roundtrip() {
        let store = QStore::new(":memory:").unwrap();
        let cfg = cfg();
        let mut table = QTable::new(&cfg);
        let s = key();
        table.update(&s, Action::Buy, 2.5, &s, false);
        store.save("AAPL", &table, 1_700_000_000).unwrap();

        let loaded = store.load("AAPL", &cfg).unwrap();
        assert_eq!(loaded.total_episodes, 1);
        assert_eq!(loaded.values(&s), table.values(&s));
        assert_eq!(loaded.epsilon, table.epsilon);
    }

    #[test]
    fn malicious_state_keys_are_skipped_not_evaluated() {
        let store = QStore::new(":memory:").unwrap();
        let doc = r#"{
            "alpha": 0.1, "gamma": 0.95, "epsilon": 0.5,
            "total_episodes": 3, "total_rewards": 1.5,
            "states": {
                "__import__('os').system('rm -rf /')": {"buy": 9.0, "sell": 9.0, "hold": 9.0},
                "RSI:NEUTRAL|SMA:AT|VWAP:AT|POS:FLAT|MOM:FLAT|CASH:HIGH|EXP:NONE":
                    {"buy": 1.0, "sell": 2.0, "hold": 3.0}
            }
        }"#;
        store
            .conn
            .execute(
                "INSERT INTO q_tables (symbol, doc, updated_at) VALUES ('AAPL', ?1, 0)",
                params![doc],
            )
            .unwrap();

        let table = store.load("AAPL", &cfg()).unwrap();
        assert_eq!(table.state_count(), 1);
        assert_eq!(table.values(&StateKey::fallback()), [1.0, 2.0, 3.0]);
        assert_eq!(table.total_episodes, 3);
    }
}
