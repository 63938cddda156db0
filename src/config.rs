use rust_decimal::Decimal;

use crate::error::{BotError, BotResult};

/// Runtime configuration, read once at startup.
///
/// Everything is environment-driven. `DATABASE_URL` is the single
/// read-write store the agent owns; the process refuses to start without
/// it. The dashboard's read-only URL is intentionally not read here.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub symbols: Vec<String>,
    pub starting_cash: Decimal,
    pub max_position_size: i64,
    /// Bars requested per symbol per ETL run. Must cover SMA_50.
    pub bar_window: usize,
    pub learning_rate: f64,
    pub discount_factor: f64,
    pub exploration_rate: f64,
    pub exploration_decay: f64,
    pub min_exploration: f64,
    pub hold_penalty: f64,
    pub buy_penalty: f64,
    /// Use the unscaled BUY penalty for compatibility with checkpoints
    /// trained before exposure scaling existed.
    pub flat_buy_penalty: bool,
    pub feed_key_id: Option<String>,
    pub feed_secret_key: Option<String>,
    pub feed_base: String,
}

impl Config {
    pub fn from_env() -> BotResult<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| BotError::Config("DATABASE_URL is required".to_string()))?;
        if database_url.trim().is_empty() {
            return Err(BotError::Config("DATABASE_URL is empty".to_string()));
        }

        let starting_cash: Decimal = std::env::var("STARTING_CASH")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| Decimal::from(100_000));
        if starting_cash <= Decimal::ZERO {
            return Err(BotError::Config("STARTING_CASH must be positive".to_string()));
        }

        Ok(Self {
            database_url,
            symbols: std::env::var("SYMBOLS")
                .unwrap_or_else(|_| "AAPL,MSFT,GOOG".to_string())
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
            starting_cash,
            max_position_size: std::env::var("MAX_POSITION_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or(25),
            bar_window: std::env::var("BAR_WINDOW").ok().and_then(|v| v.parse().ok()).unwrap_or(100),
            learning_rate: std::env::var("LEARNING_RATE").ok().and_then(|v| v.parse().ok()).unwrap_or(0.1),
            discount_factor: std::env::var("DISCOUNT_FACTOR").ok().and_then(|v| v.parse().ok()).unwrap_or(0.95),
            exploration_rate: std::env::var("EXPLORATION_RATE").ok().and_then(|v| v.parse().ok()).unwrap_or(1.0),
            exploration_decay: std::env::var("EXPLORATION_DECAY").ok().and_then(|v| v.parse().ok()).unwrap_or(0.995),
            min_exploration: std::env::var("MIN_EXPLORATION").ok().and_then(|v| v.parse().ok()).unwrap_or(0.01),
            hold_penalty: std::env::var("HOLD_PENALTY").ok().and_then(|v| v.parse().ok()).unwrap_or(-0.01),
            buy_penalty: std::env::var("BUY_PENALTY").ok().and_then(|v| v.parse().ok()).unwrap_or(-0.10),
            flat_buy_penalty: std::env::var("FLAT_BUY_PENALTY")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            feed_key_id: std::env::var("FEED_KEY_ID").ok(),
            feed_secret_key: std::env::var("FEED_SECRET_KEY").ok(),
            feed_base: std::env::var("FEED_BASE")
                .unwrap_or_else(|_| "https://data.alpaca.markets".to_string()),
        })
    }

    /// Hand-assembled config for tests; no env reads.
    pub fn for_tests(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            symbols: vec!["AAPL".to_string()],
            starting_cash: Decimal::from(100_000),
            max_position_size: 25,
            bar_window: 100,
            learning_rate: 0.1,
            discount_factor: 0.95,
            exploration_rate: 1.0,
            exploration_decay: 0.995,
            min_exploration: 0.01,
            hold_penalty: -0.01,
            buy_penalty: -0.10,
            flat_buy_penalty: false,
            feed_key_id: None,
            feed_secret_key: None,
            feed_base: "http://localhost:0".to_string(),
        }
    }
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_has_sane_hyperparameters() {
        let cfg = Config::for_tests(":memory:");
        assert!(cfg.learning_rate > 0.0 && cfg.learning_rate < 1.0);
        assert!(cfg.discount_factor > 0.0 && cfg.discount_factor < 1.0);
        assert!(cfg.min_exploration < cfg.exploration_rate);
        assert!(cfg.exploration_decay < 1.0);
    }
}
