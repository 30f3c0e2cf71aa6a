use anyhow::Result;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[async_trait::async_trait]
pub trait Actor: Send + Sync + 'static {
    async fn run(self) -> Result<()>;
}

// ----------- Reference data -----------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Equity,
    Etf,
    Crypto,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Asset {
    pub ticker: String,
    pub sector: String,
    pub class: AssetClass,
}

/// The six simulated portfolios. The set is fixed; parameters per scenario
/// come from configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Benchmark,
    Momentum,
    Aggressive,
    Defensive,
    Contrarian,
    SpyOnly,
}

impl Scenario {
    pub const ALL: [Scenario; 6] = [
        Scenario::Benchmark,
        Scenario::Momentum,
        Scenario::Aggressive,
        Scenario::Defensive,
        Scenario::Contrarian,
        Scenario::SpyOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::Benchmark => "benchmark",
            Scenario::Momentum => "momentum",
            Scenario::Aggressive => "aggressive",
            Scenario::Defensive => "defensive",
            Scenario::Contrarian => "contrarian",
            Scenario::SpyOnly => "spy_only",
        }
    }

}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scenario {
    type Err = crate::core::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scenario::ALL
            .iter()
            .copied()
            .find(|sc| sc.as_str() == s)
            .ok_or_else(|| crate::core::error::CoreError::ScenarioNotFound(s.to_string()))
    }
}

// ----------- Trackable units -----------------

/// Which piece of versioned logic a measurement belongs to. The confidence
/// threshold has its own lineage in the feedback module and is not a prompt
/// unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitRole {
    Sentiment,
    Selection,
}

impl UnitRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitRole::Sentiment => "sentiment",
            UnitRole::Selection => "selection",
        }
    }

    pub fn parse(s: &str) -> Option<UnitRole> {
        match s {
            "sentiment" => Some(UnitRole::Sentiment),
            "selection" => Some(UnitRole::Selection),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitId {
    pub sector: String,
    pub role: UnitRole,
}

impl UnitId {
    pub fn sentiment(sector: &str) -> Self {
        Self {
            sector: sector.to_string(),
            role: UnitRole::Sentiment,
        }
    }

    pub fn selection(sector: &str) -> Self {
        Self {
            sector: sector.to_string(),
            role: UnitRole::Selection,
        }
    }

    /// Inverse of Display, for rows coming back from storage.
    pub fn parse(s: &str) -> Option<UnitId> {
        let (sector, role) = s.split_once('/')?;
        Some(UnitId {
            sector: sector.to_string(),
            role: UnitRole::parse(role)?,
        })
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sector, self.role.as_str())
    }
}

// ----------- Domain messages -----------------

/// One normalized scoring event for a sector. Append-only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SentimentReading {
    pub sector: String,
    pub raw: f64,
    pub score: f64,
    pub prompt_version: u32,
    pub ts_ms: i64,
}

/// Signed value delta against a scenario position. Positive buys, negative
/// sells. Immutable once recorded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Trade {
    pub scenario: Scenario,
    pub ticker: String,
    pub sector: String,
    pub delta_value: Decimal,
    pub reading_ts_ms: i64,
    pub ts_ms: i64,
}

/// All trades one engine cycle produced for a scenario. Applied atomically
/// by the ledger.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TradeBatch {
    pub scenario: Scenario,
    pub trades: Vec<Trade>,
    pub ts_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Position {
    pub scenario: Scenario,
    pub ticker: String,
    pub sector: String,
    pub value: Decimal,
    pub cost_basis: Decimal,
    pub last_trade_ts: i64,
}

/// Snapshot of one scenario book after a batch or a mark, consumed by
/// mirrors and reporting.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerUpdate {
    pub scenario: Scenario,
    pub cash: Decimal,
    pub total_value: Decimal,
    pub start_capital: Decimal,
    pub positions: Vec<Position>,
    pub ts_ms: i64,
}

/// A prediction awaiting its delayed evaluation. Closed exactly once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub unit: UnitId,
    pub version: u32,
    /// Signed sentiment score behind the prediction.
    pub predicted: f64,
    /// Ticker weights the realized direction is measured against.
    pub basket: HashMap<String, f64>,
    pub ts_ms: i64,
    pub due_ts_ms: i64,
    pub evaluated: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub decision_id: String,
    pub unit: UnitId,
    pub version: u32,
    pub predicted: f64,
    pub realized_pct: f64,
    pub correct: bool,
    pub ts_ms: i64,
}

/// New value of the adaptive dead-zone threshold, fanned out to consumers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThresholdUpdate {
    pub version: u32,
    pub value: f64,
    pub ts_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub unit: UnitId,
    pub version: u32,
    pub correct: u32,
    pub total: u32,
    pub ts_ms: i64,
}

impl PerformanceSnapshot {
    pub fn accuracy(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.correct as f64 / self.total as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_round_trip() {
        for sc in Scenario::ALL {
            assert_eq!(sc.as_str().parse::<Scenario>().ok(), Some(sc));
        }
        let err = "margin".parse::<Scenario>().unwrap_err();
        assert!(matches!(
            err,
            crate::core::error::CoreError::ScenarioNotFound(_)
        ));
    }

    #[test]
    fn unit_id_round_trip() {
        let unit = UnitId::sentiment("XLK");
        assert_eq!(unit.to_string(), "XLK/sentiment");
        assert_eq!(UnitId::parse("XLK/sentiment"), Some(unit));
        assert_eq!(UnitId::parse("XLK"), None);
        assert_eq!(UnitId::parse("XLK/refinement"), None);
    }
}
