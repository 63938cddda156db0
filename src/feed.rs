//! Market-data feed: a thin HTTP client behind a narrow trait.
//!
//! The agent core only ever sees `MarketDataFeed`; the concrete client
//! (Alpaca Market Data v2) stays at the edge. Bars are validated and
//! promoted to the internal money type here, so malformed wire data never
//! reaches the stores.

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::config::Config;
use crate::error::{BotError, BotResult, FeedError};
use crate::logging::{json_warn, log, obj, v_str, Level};
use crate::money;
use crate::store::Bar;

/// Latest top-of-book quote.
#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub ts: i64,
    pub bid: Decimal,
    pub ask: Decimal,
}

#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    /// Ordered five-minute OHLCV bars, most recent window of `limit`.
    async fn fetch_bars(&self, symbol: &str, limit: usize) -> Result<Vec<Bar>, FeedError>;

    async fn fetch_latest_quote(&self, symbol: &str) -> Result<Quote, FeedError>;
}

// =============================================================================
// Alpaca Market Data v2
// =============================================================================

pub struct AlpacaFeed {
    client: Client,
    base: String,
    key_id: String,
    secret_key: String,
}

impl AlpacaFeed {
    pub fn new(cfg: &Config) -> BotResult<Self> {
        let (Some(key_id), Some(secret_key)) = (&cfg.feed_key_id, &cfg.feed_secret_key) else {
            return Err(BotError::Config(
                "FEED_KEY_ID and FEED_SECRET_KEY are required for market data".to_string(),
            ));
        };
        Ok(Self {
            client: Client::new(),
            base: cfg.feed_base.clone(),
            key_id: key_id.clone(),
            secret_key: secret_key.clone(),
        })
    }

    fn authed(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .header("APCA-API-KEY-ID", &self.key_id)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
    }
}

#[derive(Deserialize)]
pub(crate) struct RawBar {
    pub t: String,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: i64,
}

#[derive(Deserialize)]
struct BarsResponse {
    #[serde(default)]
    bars: Vec<RawBar>,
}

#[derive(Deserialize)]
struct RawQuote {
    t: String,
    bp: f64,
    ap: f64,
}

#[derive(Deserialize)]
struct QuoteResponse {
    quote: RawQuote,
}

/// Validate and promote wire bars: timestamps must be non-decreasing,
/// prices positive and finite, volume non-negative.
pub(crate) fn convert_bars(symbol: &str, raw: Vec<RawBar>) -> Result<Vec<Bar>, FeedError> {
    if raw.is_empty() {
        return Err(FeedError::Empty(symbol.to_string()));
    }
    let mut bars = Vec::with_capacity(raw.len());
    let mut prev_ts = i64::MIN;
    for r in raw {
        let ts = parse_ts(&r.t)?;
        if ts < prev_ts {
            return Err(FeedError::Malformed(format!(
                "{symbol}: timestamps decrease at {ts} (prev {prev_ts})"
            )));
        }
        prev_ts = ts;
        for px in [r.o, r.h, r.l, r.c] {
            if !px.is_finite() || px <= 0.0 {
                return Err(FeedError::Malformed(format!("{symbol}: bad price {px} at {ts}")));
            }
        }
        if r.v < 0 {
            return Err(FeedError::Malformed(format!("{symbol}: negative volume at {ts}")));
        }
        bars.push(Bar {
            ts,
            open: promote(r.o, symbol)?,
            high: promote(r.h, symbol)?,
            low: promote(r.l, symbol)?,
            close: promote(r.c, symbol)?,
            volume: r.v,
        });
    }
    Ok(bars)
}

fn promote(px: f64, symbol: &str) -> Result<Decimal, FeedError> {
    money::from_f64(px).map_err(|e| FeedError::Malformed(format!("{symbol}: {e}")))
}

fn parse_ts(raw: &str) -> Result<i64, FeedError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp())
        .map_err(|e| FeedError::Malformed(format!("bad timestamp {raw:?}: {e}")))
}

#[async_trait]
impl MarketDataFeed for AlpacaFeed {
    async fn fetch_bars(&self, symbol: &str, limit: usize) -> Result<Vec<Bar>, FeedError> {
        let url = format!(
            "{}/v2/stocks/{}/bars?timeframe=5Min&limit={}",
            self.base, symbol, limit
        );
        let resp = self.authed(&url).send().await?;

        if let Some(remaining) = resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
        {
            log(
                Level::Debug,
                "feed_budget",
                obj(&[("symbol", v_str(symbol)), ("remaining", v_str(remaining))]),
            );
        }

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(FeedError::RateLimited);
        }
        if !status.is_success() {
            return Err(FeedError::Malformed(format!("{symbol}: HTTP {status}")));
        }
        let body: BarsResponse = resp.json().await?;
        convert_bars(symbol, body.bars)
    }

    async fn fetch_latest_quote(&self, symbol: &str) -> Result<Quote, FeedError> {
        let url = format!("{}/v2/stocks/{}/quotes/latest", self.base, symbol);
        let resp = self.authed(&url).send().await?;
        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(FeedError::RateLimited);
        }
        if !status.is_success() {
            return Err(FeedError::Malformed(format!("{symbol}: HTTP {status}")));
        }
        let body: QuoteResponse = resp.json().await?;
        let q = body.quote;
        if !q.bp.is_finite() || !q.ap.is_finite() || q.bp <= 0.0 || q.ap <= 0.0 {
            json_warn("quote_reject", obj(&[("symbol", v_str(symbol))]));
            return Err(FeedError::Malformed(format!("{symbol}: bad quote")));
        }
        Ok(Quote {
            ts: parse_ts(&q.t)?,
            bid: promote(q.bp, symbol)?,
            ask: promote(q.ap, symbol)?,
        })
    }
}
