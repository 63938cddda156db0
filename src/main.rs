//! CLI entry point.
//!
//! Sub-commands mirror the scheduler's triggers:
//!   etl [--force]      ingest bars and recompute indicators
//!   trade [--exploit]  run one trading tick across the universe
//!   settle             force-close all open lots at last known prices
//!   status             print the derived bankroll summary
//!
//! Exit codes: 0 success, 1 I/O failure, 2 configuration error.

use std::collections::HashMap;

use paperbot::config::{now_ts, Config};
use paperbot::decisions::DecisionLog;
use paperbot::engine::TradingEngine;
use paperbot::error::BotError;
use paperbot::etl::run_etl;
use paperbot::feed::{AlpacaFeed, MarketDataFeed};
use paperbot::ledger::TradeLedger;
use paperbot::logging::{json_log, obj, v_bool, v_int, v_num, v_str};
use paperbot::money;
use paperbot::qlearn::QStore;
use paperbot::settle::run_settlement;
use paperbot::store::PriceStore;
use rust_decimal::Decimal;

const USAGE: &str = "usage: paperbot <etl [--force] | trade [--exploit] | settle | status>";

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{USAGE}");
        return 2;
    };
    let flag = |name: &str| args.iter().any(|a| a == name);

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("paperbot: {err}");
            return 2;
        }
    };

    let result = match command {
        "etl" => cmd_etl(&cfg, flag("--force")).await,
        "trade" => cmd_trade(&cfg, flag("--exploit")),
        "settle" => cmd_settle(&cfg),
        "status" => cmd_status(&cfg).await,
        other => {
            eprintln!("paperbot: unknown command {other:?}\n{USAGE}");
            return 2;
        }
    };

    match result {
        Ok(()) => 0,
        Err(err @ BotError::Config(_)) => {
            eprintln!("paperbot: {err}");
            2
        }
        Err(err) => {
            eprintln!("paperbot: {err}");
            1
        }
    }
}

async fn cmd_etl(cfg: &Config, force: bool) -> Result<(), BotError> {
    let feed = AlpacaFeed::new(cfg)?;
    let mut store = PriceStore::new(&cfg.database_url)?;
    let report = run_etl(cfg, &feed, &mut store, force).await?;
    json_log(
        "etl_done",
        obj(&[
            ("bars_added", v_int(report.bars_added as i64)),
            ("indicators_added", v_int(report.indicators_added as i64)),
            ("symbols_failed", v_int(report.symbols_failed as i64)),
            ("skipped", v_bool(report.skipped)),
        ]),
    );
    Ok(())
}

fn cmd_trade(cfg: &Config, exploit: bool) -> Result<(), BotError> {
    let prices = PriceStore::new(&cfg.database_url)?;
    let mut ledger = TradeLedger::new(&cfg.database_url, cfg.starting_cash)?;
    let qstore = QStore::new(&cfg.database_url)?;
    let decisions = DecisionLog::new(&cfg.database_url)?;

    let mut engine = TradingEngine::new(cfg, &prices, &mut ledger, &qstore, &decisions, exploit);
    let report = engine.run_tick(&mut rand::thread_rng(), now_ts());
    json_log(
        "trade_done",
        obj(&[
            ("symbols", v_int(report.outcomes.len() as i64)),
            ("failures", v_int(report.failures as i64)),
            ("exploit", v_bool(exploit)),
        ]),
    );
    Ok(())
}

fn cmd_settle(cfg: &Config) -> Result<(), BotError> {
    let prices = PriceStore::new(&cfg.database_url)?;
    let mut ledger = TradeLedger::new(&cfg.database_url, cfg.starting_cash)?;
    let qstore = QStore::new(&cfg.database_url)?;
    let decisions = DecisionLog::new(&cfg.database_url)?;

    let report = run_settlement(cfg, &prices, &mut ledger, &qstore, &decisions, now_ts())?;
    json_log(
        "settle_done",
        obj(&[
            ("settled", v_int(report.settled.len() as i64)),
            ("skipped", v_int(report.skipped.len() as i64)),
        ]),
    );
    Ok(())
}

/// Read-only bankroll report. Marks come from live quotes when feed
/// credentials are configured, otherwise from the latest stored closes.
async fn cmd_status(cfg: &Config) -> Result<(), BotError> {
    let prices = PriceStore::new(&cfg.database_url)?;
    let ledger = TradeLedger::new(&cfg.database_url, cfg.starting_cash)?;
    let feed = AlpacaFeed::new(cfg).ok();

    let mut marks: HashMap<String, Decimal> = HashMap::new();
    for symbol in ledger.symbols_with_open_lots()? {
        let quote_mid = match &feed {
            Some(feed) => match feed.fetch_latest_quote(&symbol).await {
                Ok(q) => Some(money::round((q.bid + q.ask) / Decimal::from(2))),
                Err(_) => None,
            },
            None => None,
        };
        let mark = match quote_mid {
            Some(px) => Some(px),
            None => prices.latest_bar(&symbol)?.map(|b| b.close),
        };
        if let Some(px) = mark {
            marks.insert(symbol, px);
        }
    }

    let summary = ledger.bankroll(&marks)?;
    json_log(
        "bankroll",
        obj(&[
            ("cash", v_str(&summary.cash.to_string())),
            ("open_cost_basis", v_str(&summary.open_cost_basis.to_string())),
            ("open_market_value", v_str(&summary.open_market_value.to_string())),
            ("unrealized_pnl", v_str(&summary.unrealized_pnl.to_string())),
            ("realized_pnl", v_str(&summary.realized_pnl.to_string())),
            ("total_pnl", v_str(&summary.total_pnl.to_string())),
            ("net_worth", v_str(&summary.net_worth.to_string())),
            ("roi_pct", v_num(summary.roi_pct)),
            ("win_rate_pct", v_num(summary.win_rate_pct)),
            ("total_trades", v_int(summary.total_trades)),
        ]),
    );
    Ok(())
}
