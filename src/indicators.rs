//! Technical indicators - pure functions over ordered bar windows.
//!
//! Unlike a streaming engine these are deliberately stateless: the ETL
//! recomputes each value from the stored window, so recomputation over the
//! same bars is byte-identical. A `None` means the window is too short (or
//! has zero volume, for VWAP) and the value is undefined rather than zero.

use rust_decimal::prelude::ToPrimitive;

use crate::store::Bar;

pub const RSI_PERIOD: usize = 14;
pub const SMA_PERIOD: usize = 50;

/// Indicator names as persisted in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorKind {
    Rsi,
    Sma50,
    Vwap,
}

impl IndicatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorKind::Rsi => "RSI",
            IndicatorKind::Sma50 => "SMA_50",
            IndicatorKind::Vwap => "VWAP",
        }
    }

    pub const ALL: [IndicatorKind; 3] =
        [IndicatorKind::Rsi, IndicatorKind::Sma50, IndicatorKind::Vwap];
}

/// Wilder RSI over the last `period + 1` closes.
///
/// Returns `None` with fewer than `period + 1` closes. All-gain windows
/// (zero average loss) saturate at 100.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let window = &closes[closes.len() - (period + 1)..];

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for pair in window.windows(2) {
        let change = pair[1] - pair[0];
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss += -change;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

/// Arithmetic mean of the last `period` closes; `None` when short.
pub fn sma(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Session VWAP: sum(typical * volume) / sum(volume) over the given bars.
///
/// The caller is responsible for slicing `bars` to the session window
/// (bars of the current trading day). `None` when total volume is zero.
pub fn vwap(bars: &[Bar]) -> Option<f64> {
    let mut px_vol = 0.0;
    let mut vol = 0.0;
    for bar in bars {
        let h = bar.high.to_f64()?;
        let l = bar.low.to_f64()?;
        let c = bar.close.to_f64()?;
        let typical = (h + l + c) / 3.0;
        px_vol += typical * bar.volume as f64;
        vol += bar.volume as f64;
    }
    if vol <= 0.0 {
        return None;
    }
    Some(px_vol / vol)
}

/// Bars belonging to the same UTC session (calendar day) as the last bar.
pub fn session_slice(bars: &[Bar]) -> &[Bar] {
    let Some(last) = bars.last() else {
        return bars;
    };
    let session_day = last.ts.div_euclid(86_400);
    let start = bars
        .iter()
        .position(|b| b.ts.div_euclid(86_400) == session_day)
        .unwrap_or(0);
    &bars[start..]
}
