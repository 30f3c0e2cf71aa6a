use crate::bus::types::Bus;
use crate::config::config::ReportCfg;
use crate::core::types::{Actor, LedgerUpdate, PerformanceSnapshot, Scenario, UnitId};
use anyhow::Result;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const WIN_WINDOW: usize = 50;

/// Write-only summary emitter: scenario returns, recent win rate, and
/// per-unit accuracy on a schedule. Nothing here feeds back into the core.
pub struct ReportActor {
    pub bus: Bus,
    pub shutdown: CancellationToken,
    pub cfg: ReportCfg,
    ledgers: HashMap<Scenario, LedgerUpdate>,
    performance: HashMap<UnitId, PerformanceSnapshot>,
    recent: VecDeque<bool>,
    threshold: f64,
}

impl ReportActor {
    pub fn new(bus: Bus, shutdown: CancellationToken, cfg: ReportCfg, initial_threshold: f64) -> Self {
        Self {
            bus,
            shutdown,
            cfg,
            ledgers: HashMap::new(),
            performance: HashMap::new(),
            recent: VecDeque::new(),
            threshold: initial_threshold,
        }
    }

    fn emit(&self) {
        info!("---- portfolio report ----");
        for scenario in Scenario::ALL {
            let Some(update) = self.ledgers.get(&scenario) else {
                continue;
            };
            let ret = if update.start_capital > Decimal::ZERO {
                ((update.total_value - update.start_capital) / update.start_capital)
                    .to_f64()
                    .unwrap_or(0.0)
            } else {
                0.0
            };
            info!(
                "{:12} total {} cash {} return {:+.2}%",
                scenario.to_string(),
                update.total_value,
                update.cash,
                ret * 100.0
            );
            metrics::gauge!("scenario_return_pct", "scenario" => scenario.as_str())
                .set(ret * 100.0);
        }

        if !self.recent.is_empty() {
            let wins = self.recent.iter().filter(|c| **c).count();
            let win_rate = wins as f64 / self.recent.len() as f64;
            info!(
                "win rate {:.0}% over last {} evaluations, threshold {:.3}",
                win_rate * 100.0,
                self.recent.len(),
                self.threshold
            );
            metrics::gauge!("recent_win_rate").set(win_rate);
        }

        for (unit, snap) in &self.performance {
            if let Some(accuracy) = snap.accuracy() {
                info!(
                    "{} v{}: {:.0}% ({}/{})",
                    unit,
                    snap.version,
                    accuracy * 100.0,
                    snap.correct,
                    snap.total
                );
            }
        }
        info!("--------------------------");
    }
}

#[async_trait::async_trait]
impl Actor for ReportActor {
    async fn run(mut self) -> Result<()> {
        info!("ReportActor started (every {:?})", self.cfg.interval);

        let mut ledger_rx = self.bus.ledger_updates.subscribe();
        let mut outcomes_rx = self.bus.outcomes.subscribe();
        let mut performance_rx = self.bus.performance.subscribe();
        let mut threshold_rx = self.bus.threshold_updates.subscribe();
        let mut tick = tokio::time::interval(self.cfg.interval);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("ReportActor: shutdown requested");
                    break;
                }

                res = ledger_rx.recv() => {
                    match res {
                        Ok(update) => {
                            self.ledgers.insert(update.scenario, (*update).clone());
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(lagged = n, "ReportActor lagged on ledger_updates");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            error!("ledger_updates stream closed; exiting ReportActor");
                            break;
                        }
                    }
                }

                res = outcomes_rx.recv() => {
                    if let Ok(outcome) = res {
                        self.recent.push_back(outcome.correct);
                        while self.recent.len() > WIN_WINDOW {
                            self.recent.pop_front();
                        }
                    }
                }

                res = performance_rx.recv() => {
                    if let Ok(snap) = res {
                        self.performance.insert(snap.unit.clone(), (*snap).clone());
                    }
                }

                res = threshold_rx.recv() => {
                    if let Ok(update) = res {
                        self.threshold = update.value;
                    }
                }

                _ = tick.tick() => {
                    self.emit();
                }
            }
        }

        info!("ReportActor stopped cleanly");
        Ok(())
    }
}
