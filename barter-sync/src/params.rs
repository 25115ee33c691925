use derive_more::Display;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::time::Duration;

/// Upper bound on points requested per history load.
pub const MAX_POINTS: u32 = 500;

/// Sampling interval of a history series.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Display, Deserialize, Serialize)]
pub enum Interval {
    #[display("5m")]
    #[serde(rename = "5m")]
    M5,
    #[display("15m")]
    #[serde(rename = "15m")]
    M15,
    #[default]
    #[display("1h")]
    #[serde(rename = "1h")]
    H1,
    #[display("4h")]
    #[serde(rename = "4h")]
    H4,
    #[display("1d")]
    #[serde(rename = "1d")]
    D1,
}

impl Interval {
    pub const ALL: [Interval; 5] = [
        Interval::M5,
        Interval::M15,
        Interval::H1,
        Interval::H4,
        Interval::D1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::H1 => "1h",
            Interval::H4 => "4h",
            Interval::D1 => "1d",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Interval::M5 => Duration::from_secs(5 * 60),
            Interval::M15 => Duration::from_secs(15 * 60),
            Interval::H1 => Duration::from_secs(60 * 60),
            Interval::H4 => Duration::from_secs(4 * 60 * 60),
            Interval::D1 => Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Next interval, wrapping to the shortest.
    pub fn next(&self) -> Self {
        let index = Self::ALL.iter().position(|i| i == self).unwrap_or(0);
        Self::ALL[(index + 1) % Self::ALL.len()]
    }
}

/// Lookback window of a history series.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Display, Deserialize, Serialize)]
pub enum Range {
    #[display("1d")]
    D1,
    #[default]
    #[display("7d")]
    D7,
    #[display("30d")]
    D30,
    #[display("90d")]
    D90,
}

impl Range {
    pub const ALL: [Range; 4] = [Range::D1, Range::D7, Range::D30, Range::D90];

    pub fn duration(&self) -> Duration {
        let days = match self {
            Range::D1 => 1,
            Range::D7 => 7,
            Range::D30 => 30,
            Range::D90 => 90,
        };
        Duration::from_secs(days * 24 * 60 * 60)
    }

    /// Longer window, saturating at the longest.
    pub fn widen(&self) -> Self {
        let index = Self::ALL.iter().position(|r| r == self).unwrap_or(0);
        Self::ALL[(index + 1).min(Self::ALL.len() - 1)]
    }

    /// Shorter window, saturating at the shortest.
    pub fn narrow(&self) -> Self {
        let index = Self::ALL.iter().position(|r| r == self).unwrap_or(0);
        Self::ALL[index.saturating_sub(1)]
    }
}

/// Unit the series is displayed in.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Display, Deserialize, Serialize)]
pub enum Unit {
    #[default]
    #[display("contracts")]
    Contracts,
    #[display("notional")]
    Notional,
}

impl Unit {
    pub fn toggle(&self) -> Self {
        match self {
            Unit::Contracts => Unit::Notional,
            Unit::Notional => Unit::Contracts,
        }
    }
}

/// User-adjustable parameters of a dashboard module. Any change is a trigger into the
/// [`InputDebouncer`](crate::debounce::InputDebouncer).
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct Params {
    pub symbol: SmolStr,
    pub exchange: SmolStr,
    pub interval: Interval,
    pub range: Range,
    pub unit: Unit,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            symbol: SmolStr::new_static("BTCUSDT"),
            exchange: SmolStr::new_static("binance"),
            interval: Interval::default(),
            range: Range::default(),
            unit: Unit::default(),
        }
    }
}

impl Params {
    pub fn new(symbol: impl Into<SmolStr>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Self::default()
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<SmolStr>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_interval(mut self, interval: Interval) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_range(mut self, range: Range) -> Self {
        self.range = range;
        self
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    /// Number of points covering `range` at `interval`, clamped to `1..=MAX_POINTS`.
    pub fn limit(&self) -> u32 {
        let points = self.range.duration().as_secs() / self.interval.duration().as_secs();
        points.clamp(1, MAX_POINTS as u64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_limit() {
        struct TestCase {
            input: Params,
            expected: u32,
        }

        let cases = vec![
            // TC0: 1 day of 1h points
            TestCase {
                input: Params::default().with_range(Range::D1),
                expected: 24,
            },
            // TC1: 7 days of 4h points
            TestCase {
                input: Params::default()
                    .with_interval(Interval::H4)
                    .with_range(Range::D7),
                expected: 42,
            },
            // TC2: clamped to MAX_POINTS
            TestCase {
                input: Params::default()
                    .with_interval(Interval::M5)
                    .with_range(Range::D30),
                expected: MAX_POINTS,
            },
            // TC3: daily points over one day is still one point
            TestCase {
                input: Params::default()
                    .with_interval(Interval::D1)
                    .with_range(Range::D1),
                expected: 1,
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            assert_eq!(test.input.limit(), test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_interval_cycles_and_range_saturates() {
        assert_eq!(Interval::D1.next(), Interval::M5);
        assert_eq!(Interval::M15.next(), Interval::H1);

        assert_eq!(Range::D90.widen(), Range::D90);
        assert_eq!(Range::D1.narrow(), Range::D1);
        assert_eq!(Range::D7.widen().narrow(), Range::D7);
    }

    #[test]
    fn test_interval_serde_matches_display() {
        for interval in Interval::ALL {
            let json = serde_json::to_string(&interval).unwrap();
            assert_eq!(json, format!("\"{}\"", interval.as_str()));
            assert_eq!(interval.to_string(), interval.as_str());
        }
    }
}
