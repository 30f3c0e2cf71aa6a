use crate::allocation::engine::{AllocationEngine, BookView};
use crate::bus::types::Bus;
use crate::collaborators::client::{AssetSelector, Selection};
use crate::core::types::{Actor, Decision, Scenario, SentimentReading, TradeBatch, UnitId};
use crate::persistence::database::Database;
use anyhow::Result;
use chrono::Utc;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs the engine on every accepted reading: refreshes the sector score
/// map, recomputes all six scenario targets, publishes trade batches, and
/// records decisions for the delayed feedback loop.
pub struct AllocationActor {
    pub bus: Bus,
    pub shutdown: CancellationToken,
    pub engine: AllocationEngine,
    pub selector: Arc<dyn AssetSelector>,
    pub db: Database,
    pub evaluation_horizon: Duration,
    scores: HashMap<String, f64>,
    score_ts: HashMap<String, i64>,
    // Mirrors of the ledger books, rebuilt from ledger updates. The ledger
    // stays the single writer; this actor only prices against the mirror.
    books: HashMap<Scenario, BookView>,
    // Last usable selection per (scenario, sector), reused for sectors not
    // touched by the current reading.
    selections: HashMap<(Scenario, String), Selection>,
    confidence_threshold: f64,
}

impl AllocationActor {
    pub fn new(
        bus: Bus,
        shutdown: CancellationToken,
        engine: AllocationEngine,
        selector: Arc<dyn AssetSelector>,
        db: Database,
        evaluation_horizon: Duration,
        initial_threshold: f64,
    ) -> Self {
        Self {
            bus,
            shutdown,
            engine,
            selector,
            db,
            evaluation_horizon,
            scores: HashMap::new(),
            score_ts: HashMap::new(),
            books: HashMap::new(),
            selections: HashMap::new(),
            confidence_threshold: initial_threshold,
        }
    }

    fn book(&self, scenario: Scenario) -> BookView {
        self.books.get(&scenario).cloned().unwrap_or_else(|| {
            let start = Decimal::from_f64(self.engine.cfg().start_capital)
                .unwrap_or(Decimal::ZERO);
            BookView::fresh(start)
        })
    }

    async fn refresh_selection(&mut self, scenario: Scenario, reading: &SentimentReading) {
        let budget = self.book(scenario).total_value();
        match self
            .selector
            .select_assets(&reading.sector, reading.score, scenario, budget)
            .await
        {
            Ok(sel) => {
                if self.engine.selection_usable(&reading.sector, &sel) {
                    self.selections
                        .insert((scenario, reading.sector.clone()), sel);
                } else {
                    warn!(
                        "Unusable selection for {}/{}, keeping equal-weight fallback",
                        scenario, reading.sector
                    );
                }
            }
            Err(e) => {
                // Mandatory fallback: allocation proceeds on equal weights.
                warn!(
                    "Asset selector failed for {}/{}: {:#}",
                    scenario, reading.sector, e
                );
                metrics::counter!("selector_failures_total").increment(1);
            }
        }
    }

    async fn handle_reading(&mut self, reading: &SentimentReading) {
        let last = self
            .score_ts
            .get(&reading.sector)
            .copied()
            .unwrap_or(i64::MIN);
        if reading.ts_ms <= last {
            warn!("Out-of-order reading for {} dropped", reading.sector);
            return;
        }
        self.score_ts.insert(reading.sector.clone(), reading.ts_ms);
        self.scores.insert(reading.sector.clone(), reading.score);

        let now = Utc::now().timestamp_millis();
        let mut any_trades = false;
        let mut used_selection: Option<Selection> = None;

        for scenario in Scenario::ALL {
            if scenario != Scenario::SpyOnly {
                self.refresh_selection(scenario, reading).await;
            }

            let book = self.book(scenario);
            let scenario_selections: HashMap<String, Selection> = self
                .selections
                .iter()
                .filter(|((sc, _), _)| *sc == scenario)
                .map(|((_, sector), sel)| (sector.clone(), sel.clone()))
                .collect();

            let targets = match self.engine.compute_targets(
                scenario,
                &self.scores,
                &book,
                &scenario_selections,
                self.confidence_threshold,
            ) {
                Ok(t) => t,
                Err(e) => {
                    // Misconfiguration, not a transient condition.
                    error!("Engine failed for {}: {}", scenario, e);
                    metrics::counter!("engine_failures_total").increment(1);
                    continue;
                }
            };

            let trades = self
                .engine
                .trades(scenario, &targets, &book, reading.ts_ms, now);
            if trades.is_empty() {
                continue;
            }

            any_trades = true;
            if used_selection.is_none() {
                used_selection = scenario_selections.get(&reading.sector).cloned();
            }

            info!(
                "{}: {} trades on {} (score {:.3})",
                scenario,
                trades.len(),
                reading.sector,
                reading.score
            );
            let batch = TradeBatch {
                scenario,
                trades,
                ts_ms: now,
            };
            if let Err(e) = self.bus.trade_batches.publish(batch).await {
                error!("Failed to publish trade batch: {}", e);
            }
        }

        if !any_trades {
            return;
        }

        // Every cycle that traded leaves a prediction behind for the
        // feedback loop: one for the scoring logic, and one for the
        // selection logic when a real selection drove the distribution.
        let sentiment_basket: HashMap<String, f64> = match self
            .engine
            .sub_weights(&reading.sector, None)
        {
            Ok(subs) => subs.into_iter().collect(),
            Err(e) => {
                error!("No evaluation basket for {}: {}", reading.sector, e);
                return;
            }
        };
        self.record_decision(
            UnitId::sentiment(&reading.sector),
            reading.prompt_version,
            reading,
            sentiment_basket,
            now,
        )
        .await;

        if let Some(sel) = used_selection {
            if let Ok(subs) = self.engine.sub_weights(&reading.sector, Some(&sel)) {
                self.record_decision(
                    UnitId::selection(&reading.sector),
                    sel.prompt_version,
                    reading,
                    subs.into_iter().collect(),
                    now,
                )
                .await;
            }
        }
    }

    async fn record_decision(
        &self,
        unit: UnitId,
        version: u32,
        reading: &SentimentReading,
        basket: HashMap<String, f64>,
        now: i64,
    ) {
        let decision = Decision {
            id: format!(
                "{}-{}-{}",
                unit.sector,
                unit.role.as_str(),
                Utc::now().timestamp_micros()
            ),
            unit,
            version,
            predicted: reading.score,
            basket,
            ts_ms: now,
            due_ts_ms: now + self.evaluation_horizon.as_millis() as i64,
            evaluated: false,
        };

        if let Err(e) = self.db.save_decision(&decision).await {
            error!("Failed to save decision: {}", e);
        }
        metrics::counter!("decisions_recorded_total", "role" => decision.unit.role.as_str())
            .increment(1);
        if let Err(e) = self.bus.decisions.publish(decision).await {
            error!("Failed to publish decision: {}", e);
        }
    }
}

#[async_trait::async_trait]
impl Actor for AllocationActor {
    async fn run(mut self) -> Result<()> {
        info!("AllocationActor started");

        let mut readings_rx = self.bus.sentiment_readings.subscribe();
        let mut ledger_rx = self.bus.ledger_updates.subscribe();
        let mut threshold_rx = self.bus.threshold_updates.subscribe();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("AllocationActor: shutdown requested");
                    break;
                }

                res = readings_rx.recv() => {
                    match res {
                        Ok(reading) => {
                            self.handle_reading(&reading).await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(lagged = n, "AllocationActor lagged on sentiment_readings");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            error!("sentiment_readings stream closed; exiting AllocationActor");
                            break;
                        }
                    }
                }

                res = ledger_rx.recv() => {
                    match res {
                        Ok(update) => {
                            self.books.insert(update.scenario, BookView::from_update(&update));
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(lagged = n, "AllocationActor lagged on ledger_updates");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            error!("ledger_updates stream closed; exiting AllocationActor");
                            break;
                        }
                    }
                }

                res = threshold_rx.recv() => {
                    match res {
                        Ok(update) => {
                            info!(
                                "Confidence threshold now {:.3} (v{})",
                                update.value, update.version
                            );
                            self.confidence_threshold = update.value;
                        }
                        Err(e) => {
                            warn!("Threshold stream error: {}", e);
                        }
                    }
                }
            }
        }

        info!("AllocationActor stopped cleanly");
        Ok(())
    }
}
