//! ETL: pull bars from the feed into the price store and recompute
//! indicator history over the stored window.
//!
//! Both writes are idempotent against their natural keys, so overlapping
//! runs and re-runs are harmless. Outside regular NYSE hours the run is
//! skipped (the feed would only repeat the last session) unless forced.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::America::New_York;
use rust_decimal::prelude::ToPrimitive;

use crate::config::Config;
use crate::error::{BotError, BotResult};
use crate::feed::MarketDataFeed;
use crate::indicators::{self, IndicatorKind, RSI_PERIOD, SMA_PERIOD};
use crate::logging::{json_log, json_warn, obj, v_int, v_str};
use crate::retry::{retry_async, RetryConfig};
use crate::store::PriceStore;

#[derive(Debug, Default, PartialEq)]
pub struct EtlReport {
    pub bars_added: usize,
    pub indicators_added: usize,
    pub symbols_failed: usize,
    /// True when the run was skipped by the market-hours gate.
    pub skipped: bool,
}

/// Regular NYSE session: 09:30-16:00 America/New_York, Monday-Friday.
pub fn is_market_hours(now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&New_York);
    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let minutes = local.hour() * 60 + local.minute();
    (9 * 60 + 30..16 * 60).contains(&minutes)
}

pub async fn run_etl(
    cfg: &Config,
    feed: &dyn MarketDataFeed,
    store: &mut PriceStore,
    force: bool,
) -> BotResult<EtlReport> {
    if !force && !is_market_hours(Utc::now()) {
        json_log("etl_skipped", obj(&[("reason", v_str("outside market hours"))]));
        return Ok(EtlReport { skipped: true, ..Default::default() });
    }

    let retry_cfg = RetryConfig::default();
    let mut report = EtlReport::default();

    for symbol in &cfg.symbols {
        let bars = match retry_async(&retry_cfg, "fetch_bars", || {
            feed.fetch_bars(symbol, cfg.bar_window)
        })
        .await
        {
            Ok(bars) => bars,
            Err(err) => {
                // No new data this tick; the loop still runs off stored
                // history (or the fallback state).
                json_warn(
                    "etl_fetch_failed",
                    obj(&[("symbol", v_str(symbol)), ("error", v_str(&err.to_string()))]),
                );
                report.symbols_failed += 1;
                continue;
            }
        };

        let added = store.append_bars(symbol, &bars)?;
        report.bars_added += added;
        report.indicators_added += recompute_indicators(store, symbol, cfg.bar_window)?;
        json_log(
            "etl_symbol",
            obj(&[
                ("symbol", v_str(symbol)),
                ("fetched", v_int(bars.len() as i64)),
                ("new_bars", v_int(added as i64)),
            ]),
        );
    }

    // Partial failures are tolerated; a run where nothing came back is not.
    if !cfg.symbols.is_empty() && report.symbols_failed == cfg.symbols.len() {
        return Err(BotError::DataUnavailable(
            "no symbol produced bars this run".to_string(),
        ));
    }

    Ok(report)
}

/// Recompute RSI / SMA_50 / VWAP at every timestamp of the stored window.
/// Already-present samples are left untouched: recomputation can never
/// change history.
pub fn recompute_indicators(
    store: &mut PriceStore,
    symbol: &str,
    window: usize,
) -> BotResult<usize> {
    let bars = store.recent_bars(symbol, window)?;
    let closes: Vec<f64> = bars
        .iter()
        .map(|b| b.close.to_f64().unwrap_or(f64::NAN))
        .collect();

    let mut added = 0;
    for i in 0..bars.len() {
        let ts = bars[i].ts;
        if let Some(v) = indicators::rsi(&closes[..=i], RSI_PERIOD) {
            added += store.append_indicator(symbol, ts, IndicatorKind::Rsi, v)? as usize;
        }
        if let Some(v) = indicators::sma(&closes[..=i], SMA_PERIOD) {
            added += store.append_indicator(symbol, ts, IndicatorKind::Sma50, v)? as usize;
        }
        if let Some(v) = indicators::vwap(indicators::session_slice(&bars[..=i])) {
            added += store.append_indicator(symbol, ts, IndicatorKind::Vwap, v)? as usize;
        }
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FeedError;
    use crate::feed::Quote;
    use crate::money;
    use crate::store::Bar;
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn bar(ts: i64, close: f64) -> Bar {
        let px = money::from_f64(close).unwrap();
        Bar { ts, open: px, high: px, low: px, close: px, volume: 1000 }
    }

    /// Serves a fixed uptrend window; never rate-limits.
    struct StubFeed;

    #[async_trait]
    impl MarketDataFeed for StubFeed {
        async fn fetch_bars(&self, _symbol: &str, limit: usize) -> Result<Vec<Bar>, FeedError> {
            Ok((0..limit.min(60)).map(|i| bar((i as i64 + 1) * 300, 100.0 + i as f64)).collect())
        }

        async fn fetch_latest_quote(&self, symbol: &str) -> Result<Quote, FeedError> {
            Err(FeedError::Empty(symbol.to_string()))
        }
    }

    /// Every request fails.
    struct DeadFeed;

    #[async_trait]
    impl MarketDataFeed for DeadFeed {
        async fn fetch_bars(&self, symbol: &str, _limit: usize) -> Result<Vec<Bar>, FeedError> {
            Err(FeedError::Empty(symbol.to_string()))
        }

        async fn fetch_latest_quote(&self, symbol: &str) -> Result<Quote, FeedError> {
            Err(FeedError::Empty(symbol.to_string()))
        }
    }

    #[tokio::test]
    async fn forced_run_ingests_and_derives() {
        let cfg = Config::for_tests(":memory:");
        let mut store = PriceStore::new(":memory:").unwrap();

        let report = run_etl(&cfg, &StubFeed, &mut store, true).await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.bars_added, 60);
        assert!(report.indicators_added > 0);

        // A second run re-fetches the same window and writes nothing new.
        let again = run_etl(&cfg, &StubFeed, &mut store, true).await.unwrap();
        assert_eq!(again.bars_added, 0);
        assert_eq!(again.indicators_added, 0);
    }

    #[tokio::test]
    async fn total_feed_outage_is_an_error() {
        let cfg = Config::for_tests(":memory:");
        let mut store = PriceStore::new(":memory:").unwrap();
        let err = run_etl(&cfg, &DeadFeed, &mut store, true).await.unwrap_err();
        assert!(matches!(err, BotError::DataUnavailable(_)));
    }

    #[test]
    fn market_hours_gate() {
        // 2026-07-01 is a Wednesday. 14:30 UTC = 10:30 New York (EDT).
        let open = Utc.with_ymd_and_hms(2026, 7, 1, 14, 30, 0).unwrap();
        assert!(is_market_hours(open));
        // 13:29 UTC = 09:29 New York, one minute before the bell.
        let early = Utc.with_ymd_and_hms(2026, 7, 1, 13, 29, 0).unwrap();
        assert!(!is_market_hours(early));
        // 20:00 UTC = 16:00 New York, the close itself is out.
        let close = Utc.with_ymd_and_hms(2026, 7, 1, 20, 0, 0).unwrap();
        assert!(!is_market_hours(close));
        // Saturday.
        let weekend = Utc.with_ymd_and_hms(2026, 7, 4, 15, 0, 0).unwrap();
        assert!(!is_market_hours(weekend));
    }

    #[test]
    fn recompute_fills_window_once() {
        let mut store = PriceStore::new(":memory:").unwrap();
        let bars: Vec<Bar> = (0..60).map(|i| bar(i * 300, 100.0 + i as f64 * 0.1)).collect();
        store.append_bars("AAPL", &bars).unwrap();

        let first = recompute_indicators(&mut store, "AAPL", 100).unwrap();
        assert!(first > 0);
        // Second pass finds everything already present.
        let second = recompute_indicators(&mut store, "AAPL", 100).unwrap();
        assert_eq!(second, 0);

        // RSI defined from bar 14 on, SMA_50 from bar 49 on, VWAP always.
        let last_ts = 59 * 300;
        assert!(store.indicator_at("AAPL", last_ts, IndicatorKind::Rsi).unwrap().is_some());
        assert!(store.indicator_at("AAPL", last_ts, IndicatorKind::Sma50).unwrap().is_some());
        assert!(store.indicator_at("AAPL", last_ts, IndicatorKind::Vwap).unwrap().is_some());
        assert!(store.indicator_at("AAPL", 0, IndicatorKind::Sma50).unwrap().is_none());
    }
}
