use crate::core::types::{Scenario, UnitId};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Raw sector score as produced by the external scoring service, before
/// normalization. The service reports which prompt version it used.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoredSentiment {
    pub raw: f64,
    #[serde(rename = "promptVersion")]
    pub prompt_version: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetPick {
    pub ticker: String,
    pub weight: f64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Selection {
    pub picks: Vec<AssetPick>,
    #[serde(default)]
    pub rationale: String,
    #[serde(rename = "riskLevel", default)]
    pub risk_level: String,
    #[serde(rename = "promptVersion", default)]
    pub prompt_version: u32,
}

/// Opaque insight payload from the harvester. Never parsed for control
/// flow; forwarded verbatim into reviser seeds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub payload: String,
}

#[async_trait]
pub trait SentimentSource: Send + Sync + 'static {
    async fn score_sentiment(&self, sector: &str) -> Result<ScoredSentiment>;
}

#[async_trait]
pub trait AssetSelector: Send + Sync + 'static {
    async fn select_assets(
        &self,
        sector: &str,
        sentiment: f64,
        scenario: Scenario,
        budget: Decimal,
    ) -> Result<Selection>;
}

#[async_trait]
pub trait PriceSource: Send + Sync + 'static {
    #[allow(dead_code)]
    async fn get_price(&self, ticker: &str, as_of_ms: i64) -> Result<Decimal>;

    /// Percentage change of the ticker between the two instants, e.g. 0.031
    /// for +3.1%.
    async fn get_return(&self, ticker: &str, from_ms: i64, to_ms: i64) -> Result<f64>;
}

#[async_trait]
pub trait PromptReviser: Send + Sync + 'static {
    /// Produce a replacement payload for an underperforming version. The
    /// payload content stays opaque to the caller.
    async fn revise(
        &self,
        unit: &UnitId,
        failing_version: u32,
        failing_payload: &str,
        miss_summary: &[String],
        knowledge: &[KnowledgeItem],
    ) -> Result<String>;
}

#[async_trait]
pub trait KnowledgeFeed: Send + Sync + 'static {
    async fn latest(&self) -> Result<Vec<KnowledgeItem>>;
}
