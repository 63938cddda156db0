//! State discretizer: maps a market/portfolio snapshot onto a small
//! discrete state tuple for the tabular policy.
//!
//! Each dimension is a tiny enum; the Cartesian product
//! (3 x 3 x 3 x 2 x 3 x 3 x 4 = 1,944 states) is the whole state space.
//! The string encoding is a fixed-width tagged record used as the
//! persistence key; `from_str` is the only parser and rejects anything
//! that is not one of the known tags, which keeps deserialization safe.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

/// Relative band half-width for "at the level" comparisons (0.1%).
const LEVEL_BAND: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RsiZone {
    Oversold,
    Neutral,
    Overbought,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LevelSide {
    Below,
    At,
    Above,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PositionState {
    Flat,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MomentumSign {
    Down,
    Flat,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CashBucket {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExposureBucket {
    None,
    Light,
    Heavy,
    Overextended,
}

/// The full discrete state tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    pub rsi: RsiZone,
    pub sma: LevelSide,
    pub vwap: LevelSide,
    pub position: PositionState,
    pub momentum: MomentumSign,
    pub cash: CashBucket,
    pub exposure: ExposureBucket,
}

impl StateKey {
    /// Deterministic state used when any input dimension is undefined.
    /// Observations landing here are never learned from.
    pub fn fallback() -> Self {
        Self {
            rsi: RsiZone::Neutral,
            sma: LevelSide::At,
            vwap: LevelSide::At,
            position: PositionState::Flat,
            momentum: MomentumSign::Flat,
            cash: CashBucket::High,
            exposure: ExposureBucket::None,
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rsi = match self.rsi {
            RsiZone::Oversold => "OVERSOLD",
            RsiZone::Neutral => "NEUTRAL",
            RsiZone::Overbought => "OVERBOUGHT",
        };
        let sma = level_str(self.sma);
        let vwap = level_str(self.vwap);
        let pos = match self.position {
            PositionState::Flat => "FLAT",
            PositionState::Long => "LONG",
        };
        let mom = match self.momentum {
            MomentumSign::Down => "DOWN",
            MomentumSign::Flat => "FLAT",
            MomentumSign::Up => "UP",
        };
        let cash = match self.cash {
            CashBucket::Low => "LOW",
            CashBucket::Medium => "MEDIUM",
            CashBucket::High => "HIGH",
        };
        let exp = match self.exposure {
            ExposureBucket::None => "NONE",
            ExposureBucket::Light => "LIGHT",
            ExposureBucket::Heavy => "HEAVY",
            ExposureBucket::Overextended => "OVEREXTENDED",
        };
        write!(
            f,
            "RSI:{rsi}|SMA:{sma}|VWAP:{vwap}|POS:{pos}|MOM:{mom}|CASH:{cash}|EXP:{exp}"
        )
    }
}

fn level_str(side: LevelSide) -> &'static str {
    match side {
        LevelSide::Below => "BELOW",
        LevelSide::At => "AT",
        LevelSide::Above => "ABOVE",
    }
}

fn parse_level(v: &str) -> Result<LevelSide, String> {
    match v {
        "BELOW" => Ok(LevelSide::Below),
        "AT" => Ok(LevelSide::At),
        "ABOVE" => Ok(LevelSide::Above),
        other => Err(format!("unknown level side {other:?}")),
    }
}

impl FromStr for StateKey {
    type Err = String;

    /// Restricted literal parser for persisted keys: exactly seven
    /// TAG:VALUE segments in canonical order, known tags only. Anything
    /// else (including strings that look like code) is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('|').collect();
        if parts.len() != 7 {
            return Err(format!("expected 7 segments, got {}", parts.len()));
        }
        let seg = |i: usize, tag: &str| -> Result<&str, String> {
            parts[i]
                .strip_prefix(tag)
                .and_then(|rest| rest.strip_prefix(':'))
                .ok_or_else(|| format!("segment {i} is not {tag}:<value>"))
        };

        let rsi = match seg(0, "RSI")? {
            "OVERSOLD" => RsiZone::Oversold,
            "NEUTRAL" => RsiZone::Neutral,
            "OVERBOUGHT" => RsiZone::Overbought,
            other => return Err(format!("unknown RSI zone {other:?}")),
        };
        let sma = parse_level(seg(1, "SMA")?)?;
        let vwap = parse_level(seg(2, "VWAP")?)?;
        let position = match seg(3, "POS")? {
            "FLAT" => PositionState::Flat,
            "LONG" => PositionState::Long,
            other => return Err(format!("unknown position {other:?}")),
        };
        let momentum = match seg(4, "MOM")? {
            "DOWN" => MomentumSign::Down,
            "FLAT" => MomentumSign::Flat,
            "UP" => MomentumSign::Up,
            other => return Err(format!("unknown momentum {other:?}")),
        };
        let cash = match seg(5, "CASH")? {
            "LOW" => CashBucket::Low,
            "MEDIUM" => CashBucket::Medium,
            "HIGH" => CashBucket::High,
            other => return Err(format!("unknown cash bucket {other:?}")),
        };
        let exposure = match seg(6, "EXP")? {
            "NONE" => ExposureBucket::None,
            "LIGHT" => ExposureBucket::Light,
            "HEAVY" => ExposureBucket::Heavy,
            "OVEREXTENDED" => ExposureBucket::Overextended,
            other => return Err(format!("unknown exposure bucket {other:?}")),
        };

        Ok(StateKey { rsi, sma, vwap, position, momentum, cash, exposure })
    }
}

/// Everything the discretizer needs to see, read at the top of a tick.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub close: Decimal,
    pub prev_close: Option<Decimal>,
    pub rsi: Option<f64>,
    pub sma_50: Option<f64>,
    pub vwap: Option<f64>,
    pub position_qty: i64,
    pub cash: Decimal,
    pub open_cost_basis: Decimal,
    pub starting_cash: Decimal,
}

/// A discretized observation. `learnable` is false when any dimension was
/// undefined and the fallback tuple was substituted; the engine must not
/// run a Q update across such an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub key: StateKey,
    pub learnable: bool,
}

pub fn discretize(snap: &Snapshot) -> Observation {
    let close = snap.close.to_f64().unwrap_or(f64::NAN);
    let (Some(rsi_v), Some(sma_v), Some(vwap_v), Some(prev)) =
        (snap.rsi, snap.sma_50, snap.vwap, snap.prev_close)
    else {
        return Observation { key: StateKey::fallback(), learnable: false };
    };
    if !close.is_finite() {
        return Observation { key: StateKey::fallback(), learnable: false };
    }

    let rsi = if rsi_v < 30.0 {
        RsiZone::Oversold
    } else if rsi_v > 70.0 {
        RsiZone::Overbought
    } else {
        RsiZone::Neutral
    };

    let position = if snap.position_qty > 0 {
        PositionState::Long
    } else {
        PositionState::Flat
    };

    let momentum = if snap.close > prev {
        MomentumSign::Up
    } else if snap.close < prev {
        MomentumSign::Down
    } else {
        MomentumSign::Flat
    };

    let cash_ratio = ratio(snap.cash, snap.starting_cash);
    let cash = if cash_ratio < 0.30 {
        CashBucket::Low
    } else if cash_ratio < 0.70 {
        CashBucket::Medium
    } else {
        CashBucket::High
    };

    let exposure_ratio = ratio(snap.open_cost_basis, snap.starting_cash);
    let exposure = if exposure_ratio < 0.05 {
        ExposureBucket::None
    } else if exposure_ratio < 0.50 {
        ExposureBucket::Light
    } else if exposure_ratio <= 1.00 {
        ExposureBucket::Heavy
    } else {
        ExposureBucket::Overextended
    };

    let key = StateKey {
        rsi,
        sma: level_side(close, sma_v),
        vwap: level_side(close, vwap_v),
        position,
        momentum,
        cash,
        exposure,
    };
    Observation { key, learnable: true }
}

/// Exposure ratio as used by the reward shaping.
pub fn exposure_ratio(open_cost_basis: Decimal, starting_cash: Decimal) -> f64 {
    ratio(open_cost_basis, starting_cash)
}

fn ratio(num: Decimal, den: Decimal) -> f64 {
    if den == Decimal::ZERO {
        return 0.0;
    }
    (num / den).to_f64().unwrap_or(0.0)
}

fn level_side(close: f64, level: f64) -> LevelSide {
    if close < level * (1.0 - LEVEL_BAND) {
        LevelSide::Below
    } else if close > level * (1.0 + LEVEL_BAND) {
        LevelSide::Above
    } else {
        LevelSide::At
    }
}
