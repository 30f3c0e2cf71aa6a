use crate::core::types::{Asset, AssetClass, Scenario};
use anyhow::{Context, Result};
use config::{Config, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppCfg {
    pub http: HttpCfg,
    pub database: DatabaseCfg,
    #[serde(default)]
    pub metrics: MetricsCfg,
    pub collaborators: CollabCfg,
    #[serde(default)]
    pub scoring: ScoringCfg,
    #[serde(default)]
    pub allocation: AllocationCfg,
    #[serde(default)]
    pub ledger: LedgerCfg,
    #[serde(default)]
    pub feedback: FeedbackCfg,
    #[serde(default)]
    pub evolution: EvolutionCfg,
    #[serde(default)]
    pub report: ReportCfg,
    pub sectors: Vec<SectorCfg>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpCfg {
    #[serde(rename = "userAgent", default = "default_ua")]
    pub user_agent: String,
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(rename = "poolIdleTimeout", with = "humantime_serde", default = "default_pool_idle")]
    pub pool_idle_timeout: Duration,
    #[serde(rename = "poolMaxIdlePerHost", default = "default_pool")]
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            user_agent: default_ua(),
            timeout: default_timeout(),
            pool_idle_timeout: default_pool_idle(),
            pool_max_idle_per_host: default_pool(),
        }
    }
}
fn default_ua() -> String {
    "sentifolio/0.1".into()
}
fn default_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_pool_idle() -> Duration {
    Duration::from_secs(90)
}
fn default_pool() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseCfg {
    pub url: String,
    #[serde(rename = "maxConnections", default = "default_max_conns")]
    pub max_connections: u32,
}

impl Default for DatabaseCfg {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/sentifolio".to_string(),
            max_connections: default_max_conns(),
        }
    }
}
fn default_max_conns() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsCfg {
    /// Prometheus exporter listen address, e.g. "0.0.0.0:9633". Disabled
    /// when absent.
    pub listen: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollabCfg {
    #[serde(rename = "sentimentUrl")]
    pub sentiment_url: String,
    #[serde(rename = "selectorUrl")]
    pub selector_url: String,
    #[serde(rename = "priceUrl")]
    pub price_url: String,
    #[serde(rename = "reviserUrl")]
    pub reviser_url: String,
    #[serde(rename = "knowledgeUrl")]
    pub knowledge_url: String,
    #[serde(rename = "rateLimitRpm", default = "default_rpm")]
    pub rate_limit_rpm: u32,
}

impl Default for CollabCfg {
    fn default() -> Self {
        Self {
            sentiment_url: "http://localhost:8091/sentiment".to_string(),
            selector_url: "http://localhost:8091/select".to_string(),
            price_url: "http://localhost:8092/prices".to_string(),
            reviser_url: "http://localhost:8091/revise".to_string(),
            knowledge_url: "http://localhost:8093/knowledge".to_string(),
            rate_limit_rpm: default_rpm(),
        }
    }
}
fn default_rpm() -> u32 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScoringCfg {
    /// How often the sentiment source is polled per sector.
    #[serde(with = "humantime_serde", default = "default_scoring_interval")]
    pub interval: Duration,
    /// Band beyond [-1, 1] still treated as float noise and clamped.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

impl Default for ScoringCfg {
    fn default() -> Self {
        Self {
            interval: default_scoring_interval(),
            tolerance: default_tolerance(),
        }
    }
}
fn default_scoring_interval() -> Duration {
    Duration::from_secs(3600)
}
fn default_tolerance() -> f64 {
    0.05
}

/// Curve parameters for one scenario. The curve shape itself is keyed by the
/// scenario name; these knobs tune it.
#[derive(Debug, Deserialize, Clone)]
pub struct ScenarioCfg {
    /// Static floor of the dead zone for this scenario.
    #[serde(rename = "minMagnitude", default)]
    pub min_magnitude: f64,
    /// Hard ceiling on a single sector's share of capital.
    #[serde(rename = "perSectorCap", default = "default_sector_cap")]
    pub per_sector_cap: f64,
    /// Slope of the sentiment-to-weight mapping.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// High-confidence cutoff for the step curve.
    #[serde(rename = "stepThreshold", default = "default_step_threshold")]
    pub step_threshold: f64,
    /// Asset the benchmark-only scenario holds.
    #[serde(rename = "benchmarkTicker", default = "default_benchmark_ticker")]
    pub benchmark_ticker: String,
}

impl Default for ScenarioCfg {
    fn default() -> Self {
        Self {
            min_magnitude: 0.1,
            per_sector_cap: default_sector_cap(),
            multiplier: default_multiplier(),
            step_threshold: default_step_threshold(),
            benchmark_ticker: default_benchmark_ticker(),
        }
    }
}
fn default_sector_cap() -> f64 {
    0.20
}
fn default_multiplier() -> f64 {
    1.0
}
fn default_step_threshold() -> f64 {
    0.5
}
fn default_benchmark_ticker() -> String {
    "SPY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AllocationCfg {
    #[serde(rename = "startCapital", default = "default_start_capital")]
    pub start_capital: f64,
    /// Deltas below this value are rebalancing noise and skipped.
    #[serde(rename = "minTradeValue", default = "default_min_trade")]
    pub min_trade_value: f64,
    /// Floor for a sector weight on the linear curves.
    #[serde(rename = "weightFloor", default = "default_weight_floor")]
    pub weight_floor: f64,
    /// Selector weight sums above 1.0 + tolerance fall back to equal weight.
    #[serde(rename = "selectionTolerance", default = "default_selection_tolerance")]
    pub selection_tolerance: f64,
    #[serde(default = "benchmark_defaults")]
    pub benchmark: ScenarioCfg,
    #[serde(default = "momentum_defaults")]
    pub momentum: ScenarioCfg,
    #[serde(default = "aggressive_defaults")]
    pub aggressive: ScenarioCfg,
    #[serde(default = "defensive_defaults")]
    pub defensive: ScenarioCfg,
    #[serde(default = "contrarian_defaults")]
    pub contrarian: ScenarioCfg,
    #[serde(rename = "spyOnly", default)]
    pub spy_only: ScenarioCfg,
}

impl Default for AllocationCfg {
    fn default() -> Self {
        Self {
            start_capital: default_start_capital(),
            min_trade_value: default_min_trade(),
            weight_floor: default_weight_floor(),
            selection_tolerance: default_selection_tolerance(),
            benchmark: benchmark_defaults(),
            momentum: momentum_defaults(),
            aggressive: aggressive_defaults(),
            defensive: defensive_defaults(),
            contrarian: contrarian_defaults(),
            spy_only: ScenarioCfg::default(),
        }
    }
}

impl AllocationCfg {
    pub fn scenario(&self, scenario: Scenario) -> &ScenarioCfg {
        match scenario {
            Scenario::Benchmark => &self.benchmark,
            Scenario::Momentum => &self.momentum,
            Scenario::Aggressive => &self.aggressive,
            Scenario::Defensive => &self.defensive,
            Scenario::Contrarian => &self.contrarian,
            Scenario::SpyOnly => &self.spy_only,
        }
    }
}

fn default_start_capital() -> f64 {
    50_000.0
}
fn default_min_trade() -> f64 {
    100.0
}
fn default_weight_floor() -> f64 {
    0.02
}
fn default_selection_tolerance() -> f64 {
    0.05
}

fn benchmark_defaults() -> ScenarioCfg {
    ScenarioCfg {
        min_magnitude: 0.10,
        per_sector_cap: 0.15,
        multiplier: 0.5,
        ..ScenarioCfg::default()
    }
}
fn momentum_defaults() -> ScenarioCfg {
    ScenarioCfg {
        min_magnitude: 0.15,
        per_sector_cap: 0.20,
        multiplier: 1.0,
        ..ScenarioCfg::default()
    }
}
fn aggressive_defaults() -> ScenarioCfg {
    ScenarioCfg {
        min_magnitude: 0.20,
        per_sector_cap: 0.30,
        multiplier: 2.0,
        step_threshold: 0.5,
        ..ScenarioCfg::default()
    }
}
fn defensive_defaults() -> ScenarioCfg {
    ScenarioCfg {
        min_magnitude: 0.40,
        per_sector_cap: 0.15,
        multiplier: 0.5,
        ..ScenarioCfg::default()
    }
}
fn contrarian_defaults() -> ScenarioCfg {
    ScenarioCfg {
        min_magnitude: 0.15,
        per_sector_cap: 0.20,
        multiplier: 1.0,
        ..ScenarioCfg::default()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerCfg {
    /// How often positions are revalued against the price source.
    #[serde(rename = "markInterval", with = "humantime_serde", default = "default_mark_interval")]
    pub mark_interval: Duration,
}

impl Default for LedgerCfg {
    fn default() -> Self {
        Self {
            mark_interval: default_mark_interval(),
        }
    }
}
fn default_mark_interval() -> Duration {
    Duration::from_secs(3600)
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedbackCfg {
    /// Delay between a decision and its evaluation.
    #[serde(rename = "evaluationHorizon", with = "humantime_serde", default = "default_horizon")]
    pub evaluation_horizon: Duration,
    #[serde(rename = "scanInterval", with = "humantime_serde", default = "default_scan_interval")]
    pub scan_interval: Duration,
    /// Number of recent evaluated decisions the win rate is computed over.
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(rename = "initialThreshold", default = "default_initial_threshold")]
    pub initial_threshold: f64,
    #[serde(rename = "lowerAbove", default = "default_lower_above")]
    pub lower_above: f64,
    #[serde(rename = "raiseBelow", default = "default_raise_below")]
    pub raise_below: f64,
    #[serde(rename = "learningStep", default = "default_learning_step")]
    pub learning_step: f64,
    #[serde(rename = "thresholdFloor", default = "default_threshold_floor")]
    pub threshold_floor: f64,
    #[serde(rename = "thresholdCeiling", default = "default_threshold_ceiling")]
    pub threshold_ceiling: f64,
}

impl Default for FeedbackCfg {
    fn default() -> Self {
        Self {
            evaluation_horizon: default_horizon(),
            scan_interval: default_scan_interval(),
            window: default_window(),
            initial_threshold: default_initial_threshold(),
            lower_above: default_lower_above(),
            raise_below: default_raise_below(),
            learning_step: default_learning_step(),
            threshold_floor: default_threshold_floor(),
            threshold_ceiling: default_threshold_ceiling(),
        }
    }
}
fn default_horizon() -> Duration {
    Duration::from_secs(3 * 24 * 3600)
}
fn default_scan_interval() -> Duration {
    Duration::from_secs(1800)
}
fn default_window() -> usize {
    20
}
fn default_initial_threshold() -> f64 {
    0.10
}
fn default_lower_above() -> f64 {
    0.60
}
fn default_raise_below() -> f64 {
    0.40
}
fn default_learning_step() -> f64 {
    0.05
}
fn default_threshold_floor() -> f64 {
    0.05
}
fn default_threshold_ceiling() -> f64 {
    0.50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EvolutionCfg {
    /// A version is only judged after this many evaluated predictions.
    #[serde(rename = "minPredictions", default = "default_min_predictions")]
    pub min_predictions: u32,
    #[serde(rename = "accuracyFloor", default = "default_accuracy_floor")]
    pub accuracy_floor: f64,
    /// How many recent misses are summarized into the reviser seed.
    #[serde(rename = "missMemory", default = "default_miss_memory")]
    pub miss_memory: usize,
    #[serde(rename = "knowledgeCadence", with = "humantime_serde", default = "default_knowledge_cadence")]
    pub knowledge_cadence: Duration,
}

impl Default for EvolutionCfg {
    fn default() -> Self {
        Self {
            min_predictions: default_min_predictions(),
            accuracy_floor: default_accuracy_floor(),
            miss_memory: default_miss_memory(),
            knowledge_cadence: default_knowledge_cadence(),
        }
    }
}
fn default_min_predictions() -> u32 {
    10
}
fn default_accuracy_floor() -> f64 {
    0.5
}
fn default_miss_memory() -> usize {
    10
}
fn default_knowledge_cadence() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportCfg {
    #[serde(with = "humantime_serde", default = "default_report_interval")]
    pub interval: Duration,
}

impl Default for ReportCfg {
    fn default() -> Self {
        Self {
            interval: default_report_interval(),
        }
    }
}
fn default_report_interval() -> Duration {
    Duration::from_secs(6 * 3600)
}

#[derive(Debug, Deserialize, Clone)]
pub struct SectorCfg {
    pub id: String,
    pub name: String,
    pub assets: Vec<AssetCfg>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssetCfg {
    pub ticker: String,
    #[serde(default = "default_asset_class")]
    pub class: AssetClass,
}

fn default_asset_class() -> AssetClass {
    AssetClass::Equity
}

impl SectorCfg {
    pub fn universe(&self) -> Vec<Asset> {
        self.assets
            .iter()
            .map(|a| Asset {
                ticker: a.ticker.clone(),
                sector: self.id.clone(),
                class: a.class,
            })
            .collect()
    }
}

impl AppCfg {
    pub fn load(path: &str) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::with_name(path))
            .add_source(config::Environment::default().separator("__"))
            .build()
            .context("building config")?;

        let app: AppCfg = cfg.try_deserialize().context("deserializing config")?;
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.database.url.is_empty(), "database.url missing");
        anyhow::ensure!(!self.sectors.is_empty(), "sectors must not be empty");
        for sector in &self.sectors {
            anyhow::ensure!(
                !sector.assets.is_empty(),
                "sector {} has no assets",
                sector.id
            );
        }
        anyhow::ensure!(
            self.scoring.tolerance >= 0.0,
            "scoring.tolerance must not be negative"
        );
        anyhow::ensure!(
            self.feedback.threshold_floor <= self.feedback.threshold_ceiling,
            "feedback.thresholdFloor above thresholdCeiling"
        );
        anyhow::ensure!(
            self.feedback.raise_below < self.feedback.lower_above,
            "feedback.raiseBelow must be below lowerAbove"
        );
        anyhow::ensure!(
            self.evolution.accuracy_floor > 0.0 && self.evolution.accuracy_floor < 1.0,
            "evolution.accuracyFloor must be in (0, 1)"
        );
        anyhow::ensure!(
            self.allocation.start_capital > 0.0,
            "allocation.startCapital must be positive"
        );
        for scenario in Scenario::ALL {
            anyhow::ensure!(
                self.allocation.scenario(scenario).per_sector_cap >= self.allocation.weight_floor,
                "allocation.{}.perSectorCap below weightFloor",
                scenario
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_defaults_differ_by_curve() {
        let cfg = AllocationCfg::default();
        assert_eq!(cfg.scenario(Scenario::Defensive).min_magnitude, 0.40);
        assert_eq!(cfg.scenario(Scenario::Defensive).per_sector_cap, 0.15);
        assert_eq!(cfg.scenario(Scenario::Aggressive).step_threshold, 0.5);
        assert_eq!(cfg.scenario(Scenario::SpyOnly).benchmark_ticker, "SPY");
    }

    #[test]
    fn validate_rejects_empty_sector() {
        let cfg = AppCfg {
            sectors: vec![SectorCfg {
                id: "XLK".to_string(),
                name: "Technology".to_string(),
                assets: vec![],
            }],
            ..AppCfg::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults_with_sectors() {
        let cfg = AppCfg {
            database: DatabaseCfg::default(),
            sectors: vec![SectorCfg {
                id: "XLE".to_string(),
                name: "Energy".to_string(),
                assets: vec![AssetCfg {
                    ticker: "XOM".to_string(),
                    class: AssetClass::Equity,
                }],
            }],
            ..AppCfg::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
