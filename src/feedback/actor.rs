use crate::bus::types::Bus;
use crate::collaborators::client::PriceSource;
use crate::config::config::FeedbackCfg;
use crate::core::types::{Actor, Decision, DecisionOutcome, ThresholdUpdate};
use crate::feedback::threshold::{ThresholdChange, ThresholdController};
use crate::persistence::database::Database;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// The scan-and-close half of the feedback loop, kept free of IO apart from
/// the price source so the exactly-once behavior is testable on its own.
pub struct FeedbackCore {
    pub prices: Arc<dyn PriceSource>,
    pub controller: ThresholdController,
    open: HashMap<String, Decision>,
}

impl FeedbackCore {
    pub fn new(prices: Arc<dyn PriceSource>, controller: ThresholdController) -> Self {
        Self {
            prices,
            controller,
            open: HashMap::new(),
        }
    }

    pub fn track(&mut self, decision: Decision) {
        if decision.evaluated {
            return;
        }
        self.open.insert(decision.id.clone(), decision);
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Close every decision past its due time. A decision leaves the open
    /// set exactly once; re-running the scan over the same window finds
    /// nothing left to close. Price-source failures defer the decision to
    /// the next scan instead of closing it without an outcome.
    pub async fn evaluate_due(
        &mut self,
        now_ms: i64,
    ) -> (Vec<DecisionOutcome>, Vec<ThresholdChange>) {
        let due: Vec<String> = self
            .open
            .values()
            .filter(|d| now_ms >= d.due_ts_ms)
            .map(|d| d.id.clone())
            .collect();

        let mut outcomes = Vec::new();
        let mut changes = Vec::new();

        for id in due {
            let decision = self.open[&id].clone();
            let realized = match self.realized_return(&decision).await {
                Some(r) => r,
                None => {
                    warn!("Deferring evaluation of {} (price data missing)", id);
                    metrics::counter!("evaluations_deferred_total").increment(1);
                    continue;
                }
            };

            // Direction-only scoring: the magnitudes never enter into it.
            let correct = (decision.predicted > 0.0 && realized > 0.0)
                || (decision.predicted < 0.0 && realized < 0.0);

            self.open.remove(&id);

            outcomes.push(DecisionOutcome {
                decision_id: decision.id.clone(),
                unit: decision.unit.clone(),
                version: decision.version,
                predicted: decision.predicted,
                realized_pct: realized,
                correct,
                ts_ms: now_ms,
            });

            if let Some(change) = self.controller.observe(correct, now_ms) {
                changes.push(change);
            }
        }

        (outcomes, changes)
    }

    /// Weight-averaged return of the decision's basket over its horizon.
    /// None when any leg is missing; a partial basket would skew the sign.
    async fn realized_return(&self, decision: &Decision) -> Option<f64> {
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for (ticker, weight) in &decision.basket {
            match self
                .prices
                .get_return(ticker, decision.ts_ms, decision.due_ts_ms)
                .await
            {
                Ok(pct) => {
                    weighted += pct * weight;
                    total_weight += weight;
                }
                Err(e) => {
                    warn!("No return for {}: {:#}", ticker, e);
                    return None;
                }
            }
        }
        if total_weight > 0.0 {
            Some(weighted / total_weight)
        } else {
            None
        }
    }
}

/// Periodically closes matured decisions against realized prices and feeds
/// the win rate back into the confidence threshold.
pub struct FeedbackActor {
    pub bus: Bus,
    pub shutdown: CancellationToken,
    pub cfg: FeedbackCfg,
    pub db: Database,
    core: FeedbackCore,
}

impl FeedbackActor {
    pub fn new(
        bus: Bus,
        shutdown: CancellationToken,
        cfg: FeedbackCfg,
        prices: Arc<dyn PriceSource>,
        db: Database,
        controller: ThresholdController,
    ) -> Self {
        let core = FeedbackCore::new(prices, controller);
        Self {
            bus,
            shutdown,
            cfg,
            db,
            core,
        }
    }

    async fn hydrate(&mut self) {
        match self.db.load_open_decisions().await {
            Ok(decisions) => {
                for decision in decisions {
                    self.core.track(decision);
                }
                info!("Hydrated {} open decisions", self.core.open_count());
            }
            Err(e) => error!("Failed to load open decisions: {}", e),
        }
    }

    async fn scan(&mut self) {
        let now = Utc::now().timestamp_millis();
        let (outcomes, changes) = self.core.evaluate_due(now).await;

        for outcome in outcomes {
            if let Err(e) = self.db.mark_decision_evaluated(&outcome.decision_id).await {
                error!("Failed to mark decision evaluated: {}", e);
            }
            if let Err(e) = self.db.save_outcome(&outcome).await {
                error!("Failed to save outcome: {}", e);
            }
            metrics::counter!("evaluations_total", "result" => if outcome.correct { "correct" } else { "wrong" })
                .increment(1);
            info!(
                "Evaluated {}: predicted {:+.2}, realized {:+.2}% ({})",
                outcome.decision_id,
                outcome.predicted,
                outcome.realized_pct * 100.0,
                if outcome.correct { "correct" } else { "wrong" }
            );
            if let Err(e) = self.bus.outcomes.publish(outcome).await {
                error!("Failed to publish outcome: {}", e);
            }
        }

        for change in changes {
            info!(
                "Confidence threshold {:.3} -> {:.3} (win rate {:.0}% over {} decisions, v{} -> v{})",
                change.previous,
                change.value,
                change.win_rate * 100.0,
                change.evaluations,
                change.created_from,
                change.version
            );
            metrics::gauge!("confidence_threshold").set(change.value);
            if let Err(e) = self.db.save_threshold_change(&change).await {
                error!("Failed to save threshold change: {}", e);
            }
            let update = ThresholdUpdate {
                version: change.version,
                value: change.value,
                ts_ms: change.ts_ms,
            };
            if let Err(e) = self.bus.threshold_updates.publish(update).await {
                error!("Failed to publish threshold update: {}", e);
            }
        }
    }
}

#[async_trait::async_trait]
impl Actor for FeedbackActor {
    async fn run(mut self) -> Result<()> {
        info!(
            "FeedbackActor started (scan every {:?}, threshold {:.3} v{})",
            self.cfg.scan_interval,
            self.core.controller.value(),
            self.core.controller.version()
        );

        self.hydrate().await;

        let mut decisions_rx = self.bus.decisions.subscribe();
        let mut tick = tokio::time::interval(self.cfg.scan_interval);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("FeedbackActor: shutdown requested");
                    break;
                }

                res = decisions_rx.recv() => {
                    match res {
                        Ok(decision) => {
                            self.core.track((*decision).clone());
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(lagged = n, "FeedbackActor lagged on decisions");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            error!("decisions stream closed; exiting FeedbackActor");
                            break;
                        }
                    }
                }

                _ = tick.tick() => {
                    self.scan().await;
                }
            }
        }

        info!("FeedbackActor stopped cleanly");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::UnitId;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedReturns {
        pct: f64,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PriceSource for FixedReturns {
        async fn get_price(&self, _ticker: &str, _as_of_ms: i64) -> Result<Decimal> {
            Ok(Decimal::ONE)
        }

        async fn get_return(&self, _ticker: &str, _from_ms: i64, _to_ms: i64) -> Result<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.pct)
        }
    }

    struct FailingReturns;

    #[async_trait]
    impl PriceSource for FailingReturns {
        async fn get_price(&self, _ticker: &str, _as_of_ms: i64) -> Result<Decimal> {
            anyhow::bail!("offline")
        }

        async fn get_return(&self, _ticker: &str, _from_ms: i64, _to_ms: i64) -> Result<f64> {
            anyhow::bail!("offline")
        }
    }

    fn decision(id: &str, predicted: f64, due_ts_ms: i64) -> Decision {
        Decision {
            id: id.to_string(),
            unit: UnitId::sentiment("XLK"),
            version: 1,
            predicted,
            basket: Map::from([("NVDA".to_string(), 0.5), ("MSFT".to_string(), 0.5)]),
            ts_ms: 0,
            due_ts_ms,
            evaluated: false,
        }
    }

    fn core(prices: Arc<dyn PriceSource>) -> FeedbackCore {
        FeedbackCore::new(prices, ThresholdController::new(FeedbackCfg::default()))
    }

    #[tokio::test]
    async fn matured_decisions_are_scored_by_direction() {
        let mut core = core(Arc::new(FixedReturns {
            pct: 0.02,
            calls: AtomicUsize::new(0),
        }));
        core.track(decision("up", 0.4, 100));
        core.track(decision("down", -0.4, 100));
        core.track(decision("later", 0.4, 9_999));

        let (outcomes, _) = core.evaluate_due(100).await;
        assert_eq!(outcomes.len(), 2);

        let up = outcomes.iter().find(|o| o.decision_id == "up").unwrap();
        assert!(up.correct);
        assert!((up.realized_pct - 0.02).abs() < 1e-9);

        let down = outcomes.iter().find(|o| o.decision_id == "down").unwrap();
        assert!(!down.correct);

        // The immature decision is still waiting.
        assert_eq!(core.open_count(), 1);
    }

    #[tokio::test]
    async fn evaluation_is_idempotent() {
        let mut core = core(Arc::new(FixedReturns {
            pct: 0.01,
            calls: AtomicUsize::new(0),
        }));
        core.track(decision("d1", 0.3, 50));

        let (first, _) = core.evaluate_due(60).await;
        assert_eq!(first.len(), 1);

        // Same window again: nothing left to close, nothing double-counted.
        let (second, _) = core.evaluate_due(60).await;
        assert!(second.is_empty());
        assert_eq!(core.open_count(), 0);
    }

    #[tokio::test]
    async fn price_failures_defer_instead_of_closing() {
        let mut core = core(Arc::new(FailingReturns));
        core.track(decision("d1", 0.3, 50));

        let (outcomes, _) = core.evaluate_due(60).await;
        assert!(outcomes.is_empty());
        // Still open; the next scan retries.
        assert_eq!(core.open_count(), 1);
    }

    #[tokio::test]
    async fn win_streak_adjusts_the_threshold() {
        let mut core = core(Arc::new(FixedReturns {
            pct: 0.02,
            calls: AtomicUsize::new(0),
        }));
        // 20 correct predictions of a rising market
        for i in 0..20 {
            core.track(decision(&format!("d{i}"), 0.5, 10));
        }

        let before = core.controller.value();
        let (outcomes, changes) = core.evaluate_due(20).await;
        assert_eq!(outcomes.len(), 20);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].value < before);
        assert_eq!(changes[0].previous, before);
    }
}
