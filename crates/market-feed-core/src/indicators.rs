//! Rolling indicators over an ordered candle window.
//!
//! Every function returns one entry per input value. Entries are `None`
//! until the window has filled.

use rust_decimal::Decimal;

use crate::candle::Candle;

/// Arithmetic mean of the trailing `period` values.
pub fn sma(values: &[Decimal], period: usize) -> Vec<Option<Decimal>> {
    if period == 0 {
        return vec![None; values.len()];
    }

    let divisor = Decimal::from(period);
    let mut out = Vec::with_capacity(values.len());
    let mut sum = Decimal::ZERO;

    for (i, value) in values.iter().enumerate() {
        sum += *value;
        if i >= period {
            sum -= values[i - period];
        }
        out.push((i + 1 >= period).then(|| sum / divisor));
    }

    out
}

/// Exponential moving average with smoothing factor `2 / (period + 1)`,
/// seeded by the first value. Defined from the first point onwards.
pub fn ema(values: &[Decimal], period: usize) -> Vec<Option<Decimal>> {
    if period == 0 {
        return vec![None; values.len()];
    }

    let alpha = Decimal::TWO / Decimal::from(period + 1);
    let mut out = Vec::with_capacity(values.len());
    let mut prev: Option<Decimal> = None;

    for value in values {
        let next = match prev {
            Some(p) => alpha * *value + (Decimal::ONE - alpha) * p,
            None => *value,
        };
        prev = Some(next);
        out.push(prev);
    }

    out
}

/// Mean of all values, or `None` for an empty slice.
pub fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let sum: Decimal = values.iter().sum();
    Some(sum / Decimal::from(values.len()))
}

/// Percent change from `base` to `value`, or `None` when `base` is zero.
pub fn pct_change(value: Decimal, base: Decimal) -> Option<Decimal> {
    if base.is_zero() {
        return None;
    }
    Some((value - base) / base * Decimal::ONE_HUNDRED)
}

pub fn closes(candles: &[Candle]) -> Vec<Decimal> {
    candles.iter().map(|c| c.close).collect()
}

pub fn volumes(candles: &[Candle]) -> Vec<Decimal> {
    candles.iter().map(|c| c.volume).collect()
}

/// High minus low for each candle.
pub fn ranges(candles: &[Candle]) -> Vec<Decimal> {
    candles.iter().map(Candle::range).collect()
}

/// Indicator columns shown next to the price chart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndicatorFrame {
    pub sma20: Vec<Option<Decimal>>,
    pub ema20: Vec<Option<Decimal>>,
    pub volume_sma20: Vec<Option<Decimal>>,
    pub range: Vec<Decimal>,
    pub range_sma10: Vec<Option<Decimal>>,
}

/// Indicator values at a single candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicatorRow {
    pub sma20: Option<Decimal>,
    pub ema20: Option<Decimal>,
    pub volume_sma20: Option<Decimal>,
    pub range: Decimal,
    pub range_sma10: Option<Decimal>,
}

impl IndicatorFrame {
    pub fn compute(candles: &[Candle]) -> Self {
        let closes = closes(candles);
        let range = ranges(candles);

        Self {
            sma20: sma(&closes, 20),
            ema20: ema(&closes, 20),
            volume_sma20: sma(&volumes(candles), 20),
            range_sma10: sma(&range, 10),
            range,
        }
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn row(&self, i: usize) -> Option<IndicatorRow> {
        Some(IndicatorRow {
            sma20: *self.sma20.get(i)?,
            ema20: *self.ema20.get(i)?,
            volume_sma20: *self.volume_sma20.get(i)?,
            range: *self.range.get(i)?,
            range_sma10: *self.range_sma10.get(i)?,
        })
    }

    pub fn latest(&self) -> Option<IndicatorRow> {
        self.len().checked_sub(1).and_then(|i| self.row(i))
    }
}
