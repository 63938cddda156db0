use thiserror::Error;

pub type BotResult<T> = Result<T, BotError>;

/// Error taxonomy for the agent core.
///
/// Refused trades (insufficient cash, insufficient position, no settlement
/// price) are NOT errors -- they travel as `ExecOutcome::Refused` values so
/// the decision log can record them. Only failures that abort the current
/// tick or the whole process appear here.
#[derive(Debug, Error)]
pub enum BotError {
    /// Missing or malformed required configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Market data could not be obtained or is too thin for indicators.
    /// Recovered locally: the tick runs with the fallback state.
    #[error("market data unavailable: {0}")]
    DataUnavailable(String),

    #[error(transparent)]
    Feed(#[from] FeedError),

    /// I/O or integrity failure at a store. Aborts the current symbol's
    /// tick atomically; the next tick retries from fresh state.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Lossy or failed float/decimal promotion at a numeric boundary.
    #[error("numeric conversion failed: {0}")]
    Numeric(String),

    /// A runtime check caught an impossible state (e.g. a SELL left a
    /// negative position). Never silently corrected.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

/// Failures of the external market-data feed.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("feed rate limit exhausted after retries")]
    RateLimited,

    #[error("feed returned malformed data: {0}")]
    Malformed(String),

    #[error("feed returned no bars for {0}")]
    Empty(String),
}
