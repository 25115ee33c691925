use crate::chart::{ChartOptions, TerminalChartEngine};
use barter_sync::{DashboardModule, DataRequest, Params, SyncError, Unit};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const OPEN_INTEREST_HIST_ENDPOINT: &str = "/futures/data/openInterestHist";
pub const PREMIUM_INDEX_ENDPOINT: &str = "/fapi/v1/premiumIndex";

/// Binance USD-M futures open interest history entry.
///
/// See docs: <https://developers.binance.com/docs/derivatives/usds-margined-futures/market-data/rest-api/Open-Interest-Statistics>
#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BinanceOpenInterestHist {
    pub symbol: String,
    #[serde(deserialize_with = "de_str_f64")]
    pub sum_open_interest: f64,
    #[serde(deserialize_with = "de_str_f64")]
    pub sum_open_interest_value: f64,
    #[serde(deserialize_with = "de_epoch_ms")]
    pub timestamp: DateTime<Utc>,
}

/// Binance USD-M futures mark price & funding snapshot.
///
/// See docs: <https://developers.binance.com/docs/derivatives/usds-margined-futures/market-data/rest-api/Mark-Price>
#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BinancePremiumIndex {
    pub symbol: String,
    #[serde(deserialize_with = "de_str_f64")]
    pub mark_price: f64,
    #[serde(deserialize_with = "de_str_f64")]
    pub index_price: f64,
    #[serde(deserialize_with = "de_str_f64")]
    pub last_funding_rate: f64,
    #[serde(deserialize_with = "de_epoch_ms")]
    pub next_funding_time: DateTime<Utc>,
}

fn de_str_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

fn de_epoch_ms<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let ms: i64 = Deserialize::deserialize(deserializer)?;
    DateTime::from_timestamp_millis(ms).ok_or_else(|| serde::de::Error::custom("invalid timestamp"))
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct OiPoint {
    pub time: DateTime<Utc>,
    pub contracts: f64,
    pub notional: f64,
}

impl OiPoint {
    pub fn value(&self, unit: Unit) -> f64 {
        match unit {
            Unit::Contracts => self.contracts,
            Unit::Notional => self.notional,
        }
    }
}

impl From<BinanceOpenInterestHist> for OiPoint {
    fn from(hist: BinanceOpenInterestHist) -> Self {
        Self {
            time: hist.timestamp,
            contracts: hist.sum_open_interest,
            notional: hist.sum_open_interest_value,
        }
    }
}

/// Headline figures of an open interest series in the selected unit.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct OiSummary {
    pub unit: Unit,
    pub latest: f64,
    pub change: f64,
    pub change_pct: f64,
    pub high: f64,
    pub low: f64,
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct FundingSnapshot {
    pub mark_price: f64,
    pub index_price: f64,
    pub funding_rate: f64,
    pub next_funding_time: DateTime<Utc>,
}

impl FundingSnapshot {
    /// Mark premium over index, in percent.
    pub fn premium_pct(&self) -> f64 {
        if self.index_price == 0.0 {
            0.0
        } else {
            (self.mark_price - self.index_price) / self.index_price * 100.0
        }
    }
}

impl From<BinancePremiumIndex> for FundingSnapshot {
    fn from(index: BinancePremiumIndex) -> Self {
        Self {
            mark_price: index.mark_price,
            index_price: index.index_price,
            funding_rate: index.last_funding_rate,
            next_funding_time: index.next_funding_time,
        }
    }
}

/// Open interest history (primary) plus mark price & funding (secondary) for one perpetual.
#[derive(Debug, Clone, Default)]
pub struct OpenInterestModule;

impl DashboardModule for OpenInterestModule {
    type Series = Vec<OiPoint>;
    type Summary = OiSummary;
    type Analytics = FundingSnapshot;
    type Engine = TerminalChartEngine;

    fn primary(&self, params: &Params) -> DataRequest {
        DataRequest::new(OPEN_INTEREST_HIST_ENDPOINT)
            .with_param("symbol", &params.symbol)
            .with_param("period", params.interval.as_str())
            .with_param("limit", params.limit())
    }

    fn parse_primary(&self, _: &Params, payload: &Value) -> Result<Self::Series, SyncError> {
        let mut series = serde_json::from_value::<Vec<BinanceOpenInterestHist>>(payload.clone())?
            .into_iter()
            .map(OiPoint::from)
            .collect::<Vec<_>>();
        series.sort_by_key(|point| point.time);
        Ok(series)
    }

    fn summarize(&self, params: &Params, series: &Self::Series) -> Self::Summary {
        summarize(series, params.unit)
    }

    fn chart(
        &self,
        params: &Params,
        series: &Self::Series,
        summary: &Self::Summary,
    ) -> (Vec<(f64, f64)>, ChartOptions) {
        let points = series
            .iter()
            .map(|point| (point.time.timestamp() as f64, point.value(params.unit)))
            .collect::<Vec<_>>();

        let options = ChartOptions {
            title: format!(" {} OPEN INTEREST ({}) ", params.symbol, params.unit),
            y_bounds: padded_bounds(summary.low, summary.high),
            x_bounds: match (points.first(), points.last()) {
                (Some(first), Some(last)) => [first.0, last.0.max(first.0 + 1.0)],
                _ => [0.0, 1.0],
            },
            animate: true,
        };
        (points, options)
    }

    fn secondary(&self, params: &Params) -> Option<DataRequest> {
        Some(DataRequest::new(PREMIUM_INDEX_ENDPOINT).with_param("symbol", &params.symbol))
    }

    fn parse_secondary(&self, _: &Params, payload: &Value) -> Result<Self::Analytics, SyncError> {
        Ok(serde_json::from_value::<BinancePremiumIndex>(payload.clone())?.into())
    }
}

pub fn summarize(series: &[OiPoint], unit: Unit) -> OiSummary {
    let (high, low) = series
        .iter()
        .map(|point| point.value(unit))
        .fold((f64::MIN, f64::MAX), |(high, low), value| {
            (high.max(value), low.min(value))
        });

    let first = series.first().map(|point| point.value(unit)).unwrap_or_default();
    let latest = series.last().map(|point| point.value(unit)).unwrap_or_default();
    let change = latest - first;
    let change_pct = if first == 0.0 { 0.0 } else { change / first * 100.0 };

    OiSummary {
        unit,
        latest,
        change,
        change_pct,
        high: if series.is_empty() { 0.0 } else { high },
        low: if series.is_empty() { 0.0 } else { low },
        as_of: series.last().map(|point| point.time),
    }
}

fn padded_bounds(low: f64, high: f64) -> [f64; 2] {
    let span = (high - low).abs();
    let pad = if span == 0.0 { high.abs().max(1.0) * 0.01 } else { span * 0.05 };
    [low - pad, high + pad]
}

#[cfg(test)]
mod tests {
    use super::*;
    use barter_sync::{Interval, Range};
    use serde_json::json;

    fn point(ts: i64, contracts: f64, notional: f64) -> OiPoint {
        OiPoint {
            time: DateTime::from_timestamp(ts, 0).unwrap(),
            contracts,
            notional,
        }
    }

    #[test]
    fn test_parse_open_interest_hist() {
        let payload = json!([
            {
                "symbol": "BTCUSDT",
                "sumOpenInterest": "81250.118",
                "sumOpenInterestValue": "5483012000.52",
                "CMCCirculatingSupply": "19800000",
                "timestamp": 1735693200000i64
            },
            {
                "symbol": "BTCUSDT",
                "sumOpenInterest": "81000.000",
                "sumOpenInterestValue": "5470000000.00",
                "timestamp": 1735689600000i64
            }
        ]);

        let series = OpenInterestModule
            .parse_primary(&Params::default(), &payload)
            .unwrap();

        assert_eq!(series.len(), 2);
        assert!(series[0].time < series[1].time);
        assert_eq!(series[1].contracts, 81250.118);
        assert_eq!(series[1].notional, 5483012000.52);
    }

    #[test]
    fn test_parse_open_interest_hist_rejects_bad_number() {
        let payload = json!([{
            "symbol": "BTCUSDT",
            "sumOpenInterest": "n/a",
            "sumOpenInterestValue": "1",
            "timestamp": 1735689600000i64
        }]);

        assert!(matches!(
            OpenInterestModule.parse_primary(&Params::default(), &payload),
            Err(SyncError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_premium_index() {
        let payload = json!({
            "symbol": "BTCUSDT",
            "markPrice": "100100.00",
            "indexPrice": "100000.00",
            "estimatedSettlePrice": "100050.00",
            "lastFundingRate": "0.00010000",
            "interestRate": "0.00010000",
            "nextFundingTime": 1735718400000i64,
            "time": 1735693212000i64
        });

        let funding = OpenInterestModule
            .parse_secondary(&Params::default(), &payload)
            .unwrap();

        assert_eq!(funding.funding_rate, 0.0001);
        assert!((funding.premium_pct() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_summarize() {
        struct TestCase {
            input: (Vec<OiPoint>, Unit),
            expected: OiSummary,
        }

        let cases = vec![
            // TC0: contracts rising
            TestCase {
                input: (
                    vec![point(0, 100.0, 1_000.0), point(60, 120.0, 900.0), point(120, 110.0, 1_500.0)],
                    Unit::Contracts,
                ),
                expected: OiSummary {
                    unit: Unit::Contracts,
                    latest: 110.0,
                    change: 10.0,
                    change_pct: 10.0,
                    high: 120.0,
                    low: 100.0,
                    as_of: DateTime::from_timestamp(120, 0),
                },
            },
            // TC1: same series in notional
            TestCase {
                input: (
                    vec![point(0, 100.0, 1_000.0), point(60, 120.0, 900.0), point(120, 110.0, 1_500.0)],
                    Unit::Notional,
                ),
                expected: OiSummary {
                    unit: Unit::Notional,
                    latest: 1_500.0,
                    change: 500.0,
                    change_pct: 50.0,
                    high: 1_500.0,
                    low: 900.0,
                    as_of: DateTime::from_timestamp(120, 0),
                },
            },
            // TC2: empty series
            TestCase {
                input: (vec![], Unit::Contracts),
                expected: OiSummary {
                    unit: Unit::Contracts,
                    latest: 0.0,
                    change: 0.0,
                    change_pct: 0.0,
                    high: 0.0,
                    low: 0.0,
                    as_of: None,
                },
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let (series, unit) = test.input;
            assert_eq!(summarize(&series, unit), test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_primary_request() {
        let params = Params::new("ETHUSDT")
            .with_interval(Interval::H4)
            .with_range(Range::D7);

        let request = OpenInterestModule.primary(&params);

        assert_eq!(
            request.cache_key(),
            "/futures/data/openInterestHist?limit=42&period=4h&symbol=ETHUSDT"
        );
    }
}
