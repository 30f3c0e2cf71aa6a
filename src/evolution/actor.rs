use crate::bus::types::Bus;
use crate::collaborators::client::{KnowledgeFeed, KnowledgeItem, PromptReviser};
use crate::config::config::EvolutionCfg;
use crate::core::types::{Actor, DecisionOutcome, PerformanceSnapshot, UnitId};
use crate::evolution::manager::EvolutionManager;
use crate::persistence::database::Database;
use anyhow::Result;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exclusive owner of prompt lineage and performance records. Watches the
/// decision/outcome streams and supersedes versions that fall below the
/// accuracy floor.
pub struct EvolutionActor {
    pub bus: Bus,
    pub shutdown: CancellationToken,
    pub cfg: EvolutionCfg,
    pub reviser: Arc<dyn PromptReviser>,
    pub knowledge: Arc<dyn KnowledgeFeed>,
    pub db: Database,
    manager: EvolutionManager,
    misses: HashMap<UnitId, VecDeque<String>>,
    last_harvest_ms: i64,
    harvested: Vec<KnowledgeItem>,
}

impl EvolutionActor {
    pub fn new(
        bus: Bus,
        shutdown: CancellationToken,
        cfg: EvolutionCfg,
        reviser: Arc<dyn PromptReviser>,
        knowledge: Arc<dyn KnowledgeFeed>,
        db: Database,
    ) -> Self {
        let manager = EvolutionManager::new(cfg.clone());
        Self {
            bus,
            shutdown,
            cfg,
            reviser,
            knowledge,
            db,
            manager,
            misses: HashMap::new(),
            last_harvest_ms: 0,
            harvested: Vec::new(),
        }
    }

    async fn hydrate(&mut self) {
        match self.db.load_prompt_versions().await {
            Ok(versions) => {
                info!("Hydrated {} prompt versions", versions.len());
                self.manager.store.hydrate(versions);
            }
            Err(e) => error!("Failed to load prompt versions: {}", e),
        }
        match self.db.load_performance_records().await {
            Ok(records) => {
                info!("Hydrated {} performance records", records.len());
                self.manager.tracker.hydrate(records);
            }
            Err(e) => error!("Failed to load performance records: {}", e),
        }
    }

    fn remember_miss(&mut self, outcome: &DecisionOutcome) {
        let summary = format!(
            "{} v{} predicted {:+.2}, realized {:+.2}%",
            outcome.unit,
            outcome.version,
            outcome.predicted,
            outcome.realized_pct * 100.0
        );
        let memory = self.misses.entry(outcome.unit.clone()).or_default();
        memory.push_back(summary);
        while memory.len() > self.cfg.miss_memory {
            memory.pop_front();
        }
    }

    /// Opaque harvested insights, refreshed at most once per cadence.
    async fn knowledge_seed(&mut self, now_ms: i64) -> Vec<KnowledgeItem> {
        let cadence_ms = self.cfg.knowledge_cadence.as_millis() as i64;
        if now_ms - self.last_harvest_ms >= cadence_ms {
            match self.knowledge.latest().await {
                Ok(items) => {
                    info!("Harvested {} knowledge items", items.len());
                    self.harvested = items;
                    self.last_harvest_ms = now_ms;
                }
                Err(e) => {
                    warn!("Knowledge feed unavailable: {:#}", e);
                }
            }
        }
        self.harvested.clone()
    }

    async fn handle_outcome(&mut self, outcome: &DecisionOutcome) {
        let record = match self.manager.observe_outcome(&outcome.decision_id, outcome.correct) {
            Some(r) => r,
            None => return,
        };

        if !outcome.correct {
            self.remember_miss(outcome);
        }

        if let Err(e) = self.db.upsert_performance(&record).await {
            error!("Failed to persist performance record: {}", e);
        }

        let now = Utc::now().timestamp_millis();
        let snapshot = PerformanceSnapshot {
            unit: record.unit.clone(),
            version: record.version,
            correct: record.correct,
            total: record.total,
            ts_ms: now,
        };
        if let Err(e) = self.bus.performance.publish(snapshot).await {
            error!("Failed to publish performance snapshot: {}", e);
        }

        self.maybe_evolve(&outcome.unit).await;
    }

    async fn maybe_evolve(&mut self, unit: &UnitId) {
        let ticket = match self.manager.begin(unit) {
            Some(t) => t,
            None => return,
        };

        info!(
            "Evolving {} v{} ({}/{} correct)",
            ticket.unit, ticket.version, ticket.correct, ticket.total
        );
        metrics::counter!("evolutions_started_total").increment(1);

        let now = Utc::now().timestamp_millis();
        let knowledge = self.knowledge_seed(now).await;
        let misses: Vec<String> = self
            .misses
            .get(unit)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();

        match self
            .reviser
            .revise(unit, ticket.version, &ticket.payload, &misses, &knowledge)
            .await
        {
            Ok(payload) => {
                let old_version = ticket.version;
                let created = self.manager.complete(ticket, payload, now);
                info!(
                    "Superseded {} v{} with v{}: {}",
                    created.unit, old_version, created.version, created.reason
                );
                metrics::counter!("evolutions_completed_total").increment(1);

                if let Err(e) = self.db.save_prompt_version(&created).await {
                    error!("Failed to persist prompt version: {}", e);
                }
                // The frozen old head and the fresh zero record both need a
                // final write.
                for version in [old_version, created.version] {
                    if let Some(record) = self.manager.tracker.record(unit, version).cloned() {
                        if let Err(e) = self.db.upsert_performance(&record).await {
                            error!("Failed to persist performance record: {}", e);
                        }
                    }
                }
            }
            Err(e) => {
                // Recoverable: release the claim, the next qualifying
                // outcome retries.
                warn!("Reviser failed for {}: {:#}", unit, e);
                metrics::counter!("evolutions_failed_total").increment(1);
                self.manager.abort(ticket);
            }
        }
    }
}

#[async_trait::async_trait]
impl Actor for EvolutionActor {
    async fn run(mut self) -> Result<()> {
        info!("EvolutionActor started");

        self.hydrate().await;

        let mut decisions_rx = self.bus.decisions.subscribe();
        let mut outcomes_rx = self.bus.outcomes.subscribe();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("EvolutionActor: shutdown requested");
                    break;
                }

                res = decisions_rx.recv() => {
                    match res {
                        Ok(decision) => {
                            let now = Utc::now().timestamp_millis();
                            self.manager.observe_prediction(&decision, now);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(lagged = n, "EvolutionActor lagged on decisions");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            error!("decisions stream closed; exiting EvolutionActor");
                            break;
                        }
                    }
                }

                res = outcomes_rx.recv() => {
                    match res {
                        Ok(outcome) => {
                            self.handle_outcome(&outcome).await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(lagged = n, "EvolutionActor lagged on outcomes");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            error!("outcomes stream closed; exiting EvolutionActor");
                            break;
                        }
                    }
                }
            }
        }

        info!("EvolutionActor stopped cleanly");
        Ok(())
    }
}
