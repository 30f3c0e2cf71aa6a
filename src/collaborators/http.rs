use crate::collaborators::client::{
    AssetSelector, KnowledgeFeed, KnowledgeItem, PriceSource, PromptReviser, ScoredSentiment,
    Selection, SentimentSource,
};
use crate::config::config::CollabCfg;
use crate::core::types::{Scenario, UnitId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::info;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// JSON-over-HTTP implementations of the external collaborators, sharing one
/// connection pool. The AI-facing endpoints (scoring, revision) go through a
/// rate limiter; price and knowledge lookups do not.
#[derive(Clone)]
pub struct HttpCollaborators {
    client: Client,
    cfg: CollabCfg,
    limiter: Arc<DirectLimiter>,
}

impl HttpCollaborators {
    pub fn new(cfg: CollabCfg, client: Client) -> Self {
        let rpm = NonZeroU32::new(cfg.rate_limit_rpm).unwrap_or(NonZeroU32::new(1).unwrap());
        let limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));
        Self {
            client,
            cfg,
            limiter,
        }
    }
}

// Some backends wrap JSON replies in markdown fences; strip before parsing.
fn strip_fences(raw: &str) -> &str {
    raw.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[derive(Serialize)]
struct SentimentRequest<'a> {
    sector: &'a str,
}

#[async_trait]
impl SentimentSource for HttpCollaborators {
    async fn score_sentiment(&self, sector: &str) -> Result<ScoredSentiment> {
        self.limiter.until_ready().await;

        let body = self
            .client
            .post(&self.cfg.sentiment_url)
            .json(&SentimentRequest { sector })
            .send()
            .await
            .context("sentiment request failed")?
            .error_for_status()
            .context("sentiment request rejected")?
            .text()
            .await?;

        let scored: ScoredSentiment = serde_json::from_str(strip_fences(&body))
            .with_context(|| format!("malformed sentiment payload: {}", body))?;
        Ok(scored)
    }
}

#[derive(Serialize)]
struct SelectRequest<'a> {
    sector: &'a str,
    sentiment: f64,
    scenario: &'a str,
    budget: Decimal,
}

#[async_trait]
impl AssetSelector for HttpCollaborators {
    async fn select_assets(
        &self,
        sector: &str,
        sentiment: f64,
        scenario: Scenario,
        budget: Decimal,
    ) -> Result<Selection> {
        self.limiter.until_ready().await;

        let body = self
            .client
            .post(&self.cfg.selector_url)
            .json(&SelectRequest {
                sector,
                sentiment,
                scenario: scenario.as_str(),
                budget,
            })
            .send()
            .await
            .context("selector request failed")?
            .error_for_status()
            .context("selector request rejected")?
            .text()
            .await?;

        let selection: Selection = serde_json::from_str(strip_fences(&body))
            .with_context(|| format!("malformed selection payload: {}", body))?;
        Ok(selection)
    }
}

#[derive(Deserialize)]
struct PriceResponse {
    price: Decimal,
}

#[derive(Deserialize)]
struct ReturnResponse {
    #[serde(rename = "pctChange")]
    pct_change: f64,
}

#[async_trait]
impl PriceSource for HttpCollaborators {
    async fn get_price(&self, ticker: &str, as_of_ms: i64) -> Result<Decimal> {
        let resp: PriceResponse = self
            .client
            .get(format!("{}/{}", self.cfg.price_url, ticker))
            .query(&[("asOf", as_of_ms)])
            .send()
            .await
            .context("price request failed")?
            .error_for_status()?
            .json()
            .await
            .context("malformed price payload")?;
        Ok(resp.price)
    }

    async fn get_return(&self, ticker: &str, from_ms: i64, to_ms: i64) -> Result<f64> {
        let resp: ReturnResponse = self
            .client
            .get(format!("{}/{}/return", self.cfg.price_url, ticker))
            .query(&[("from", from_ms), ("to", to_ms)])
            .send()
            .await
            .context("return request failed")?
            .error_for_status()?
            .json()
            .await
            .context("malformed return payload")?;
        Ok(resp.pct_change)
    }
}

#[derive(Serialize)]
struct ReviseRequest<'a> {
    unit: String,
    #[serde(rename = "failingVersion")]
    failing_version: u32,
    #[serde(rename = "failingPayload")]
    failing_payload: &'a str,
    misses: &'a [String],
    knowledge: Vec<&'a str>,
}

#[derive(Deserialize)]
struct ReviseResponse {
    payload: String,
}

#[async_trait]
impl PromptReviser for HttpCollaborators {
    async fn revise(
        &self,
        unit: &UnitId,
        failing_version: u32,
        failing_payload: &str,
        miss_summary: &[String],
        knowledge: &[KnowledgeItem],
    ) -> Result<String> {
        self.limiter.until_ready().await;

        info!("Requesting revision for {} v{}", unit, failing_version);

        let body = self
            .client
            .post(&self.cfg.reviser_url)
            .json(&ReviseRequest {
                unit: unit.to_string(),
                failing_version,
                failing_payload,
                misses: miss_summary,
                knowledge: knowledge.iter().map(|k| k.payload.as_str()).collect(),
            })
            .send()
            .await
            .context("reviser request failed")?
            .error_for_status()
            .context("reviser request rejected")?
            .text()
            .await?;

        let resp: ReviseResponse = serde_json::from_str(strip_fences(&body))
            .with_context(|| format!("malformed revision payload: {}", body))?;
        Ok(resp.payload)
    }
}

#[derive(Deserialize)]
struct KnowledgeResponse {
    items: Vec<KnowledgeItem>,
}

#[async_trait]
impl KnowledgeFeed for HttpCollaborators {
    async fn latest(&self) -> Result<Vec<KnowledgeItem>> {
        let resp: KnowledgeResponse = self
            .client
            .get(&self.cfg.knowledge_url)
            .send()
            .await
            .context("knowledge request failed")?
            .error_for_status()?
            .json()
            .await
            .context("malformed knowledge payload")?;
        Ok(resp.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markdown_fences() {
        let fenced = "```json\n{\"raw\": 0.4, \"promptVersion\": 2}\n```";
        let parsed: ScoredSentiment = serde_json::from_str(strip_fences(fenced)).unwrap();
        assert_eq!(parsed.prompt_version, 2);
        assert!((parsed.raw - 0.4).abs() < 1e-9);
    }

    #[test]
    fn plain_json_unchanged() {
        let plain = "{\"raw\": -0.2, \"promptVersion\": 1}";
        assert_eq!(strip_fences(plain), plain);
    }
}
