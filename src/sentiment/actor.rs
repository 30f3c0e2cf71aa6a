use crate::bus::types::Bus;
use crate::collaborators::client::SentimentSource;
use crate::config::config::ScoringCfg;
use crate::core::types::Actor;
use crate::persistence::database::Database;
use crate::sentiment::normalizer::ScoreNormalizer;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Drives the scoring cycle: polls the external sentiment source per sector,
/// normalizes, and publishes readings in timestamp order.
pub struct SentimentActor {
    pub bus: Bus,
    pub shutdown: CancellationToken,
    pub source: Arc<dyn SentimentSource>,
    pub normalizer: ScoreNormalizer,
    pub cfg: ScoringCfg,
    pub sectors: Vec<String>,
    pub db: Database,
    // Last accepted timestamp per sector; older readings are dropped so a
    // retried or reordered score can never overwrite a fresher one.
    last_ts: HashMap<String, i64>,
}

impl SentimentActor {
    pub fn new(
        bus: Bus,
        shutdown: CancellationToken,
        source: Arc<dyn SentimentSource>,
        cfg: ScoringCfg,
        sectors: Vec<String>,
        db: Database,
    ) -> Self {
        let normalizer = ScoreNormalizer::new(&cfg);
        Self {
            bus,
            shutdown,
            source,
            normalizer,
            cfg,
            sectors,
            db,
            last_ts: HashMap::new(),
        }
    }

    async fn score_cycle(&mut self) {
        for sector in self.sectors.clone() {
            let scored = match self.source.score_sentiment(&sector).await {
                Ok(s) => s,
                Err(e) => {
                    // Collaborator failures are recoverable; skip the sector
                    // this cycle and keep the schedule.
                    warn!("Sentiment source failed for {}: {:#}", sector, e);
                    metrics::counter!("sentiment_source_failures_total").increment(1);
                    continue;
                }
            };

            let ts_ms = Utc::now().timestamp_millis();
            let reading = match self.normalizer.normalize(
                &sector,
                scored.raw,
                scored.prompt_version,
                ts_ms,
            ) {
                Ok(r) => r,
                Err(e) => {
                    error!("Rejected sentiment for {}: {}", sector, e);
                    metrics::counter!("sentiment_rejected_total").increment(1);
                    continue;
                }
            };

            let last = self.last_ts.get(&sector).copied().unwrap_or(i64::MIN);
            if reading.ts_ms <= last {
                warn!(
                    "Stale reading for {} ({} <= {}), dropped",
                    sector, reading.ts_ms, last
                );
                continue;
            }
            self.last_ts.insert(sector.clone(), reading.ts_ms);

            if let Err(e) = self.db.save_reading(&reading).await {
                error!("Failed to save reading: {}", e);
            }

            info!(
                "Sector {} scored {:.3} (prompt v{})",
                sector, reading.score, reading.prompt_version
            );

            if let Err(e) = self.bus.sentiment_readings.publish(reading).await {
                error!("Failed to publish reading: {}", e);
            }
        }
    }
}

#[async_trait::async_trait]
impl Actor for SentimentActor {
    async fn run(mut self) -> Result<()> {
        info!(
            "SentimentActor started ({} sectors, every {:?})",
            self.sectors.len(),
            self.cfg.interval
        );

        let mut tick = tokio::time::interval(self.cfg.interval);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("SentimentActor: shutdown requested");
                    break;
                }
                _ = tick.tick() => {
                    self.score_cycle().await;
                }
            }
        }

        info!("SentimentActor stopped cleanly");
        Ok(())
    }
}
