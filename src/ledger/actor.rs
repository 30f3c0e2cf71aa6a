use crate::bus::types::Bus;
use crate::collaborators::client::PriceSource;
use crate::config::config::LedgerCfg;
use crate::core::types::{Actor, Scenario};
use crate::ledger::book::ScenarioBook;
use crate::persistence::database::Database;
use anyhow::Result;
use chrono::Utc;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exclusive owner of the six scenario books. Trades only enter a book
/// through this actor, which keeps the single-writer rule trivially true.
pub struct LedgerActor {
    pub bus: Bus,
    pub shutdown: CancellationToken,
    pub cfg: LedgerCfg,
    pub prices: Arc<dyn PriceSource>,
    pub db: Database,
    pub start_capital: Decimal,
    books: HashMap<Scenario, ScenarioBook>,
}

impl LedgerActor {
    pub fn new(
        bus: Bus,
        shutdown: CancellationToken,
        cfg: LedgerCfg,
        prices: Arc<dyn PriceSource>,
        db: Database,
        start_capital: Decimal,
    ) -> Self {
        Self {
            bus,
            shutdown,
            cfg,
            prices,
            db,
            start_capital,
            books: HashMap::new(),
        }
    }

    async fn hydrate(&mut self) {
        for scenario in Scenario::ALL {
            let book = match self.db.load_ledger_state(scenario).await {
                Ok(Some((cash, last_mark_ts))) => {
                    let positions = self
                        .db
                        .load_positions(scenario)
                        .await
                        .unwrap_or_else(|e| {
                            error!("Failed to load positions for {}: {}", scenario, e);
                            Vec::new()
                        });
                    info!(
                        "Hydrated {} with {} positions, cash {}",
                        scenario,
                        positions.len(),
                        cash
                    );
                    ScenarioBook::hydrate(scenario, self.start_capital, cash, positions, last_mark_ts)
                }
                Ok(None) => ScenarioBook::new(scenario, self.start_capital),
                Err(e) => {
                    error!("Failed to load ledger state for {}: {}", scenario, e);
                    ScenarioBook::new(scenario, self.start_capital)
                }
            };
            self.books.insert(scenario, book);
        }

        // Seed the mirrors so allocation starts from real books.
        let now = Utc::now().timestamp_millis();
        for book in self.books.values() {
            if let Err(e) = self.bus.ledger_updates.publish(book.snapshot(now)).await {
                error!("Failed to publish initial snapshot: {}", e);
            }
        }
    }

    async fn persist_book(&self, scenario: Scenario) {
        let book = &self.books[&scenario];
        if let Err(e) = self.db.save_ledger_state(book).await {
            error!("Failed to persist ledger state for {}: {}", scenario, e);
        }
    }

    async fn handle_batch(&mut self, batch: &crate::core::types::TradeBatch) {
        let book = match self.books.get_mut(&batch.scenario) {
            Some(b) => b,
            None => {
                error!("No book for scenario {}", batch.scenario);
                return;
            }
        };

        match book.apply(&batch.trades) {
            Ok(()) => {
                metrics::counter!("ledger_batches_total", "status" => "applied").increment(1);
                if let Err(e) = self.db.save_trades(&batch.trades).await {
                    error!("Failed to save trades: {}", e);
                }
                self.persist_book(batch.scenario).await;
                let snapshot = self.books[&batch.scenario].snapshot(batch.ts_ms);
                info!(
                    "Applied {} trades to {} (cash {}, total {})",
                    batch.trades.len(),
                    batch.scenario,
                    snapshot.cash,
                    snapshot.total_value
                );
                if let Err(e) = self.bus.ledger_updates.publish(snapshot).await {
                    error!("Failed to publish ledger update: {}", e);
                }
            }
            Err(e) => {
                // An overdrawing batch means the engine mis-sized trades.
                // Surface loudly, apply nothing.
                metrics::counter!("ledger_batches_total", "status" => "rejected").increment(1);
                error!("Rejected batch for {}: {}", batch.scenario, e);
            }
        }
    }

    async fn mark_books(&mut self) {
        let now = Utc::now().timestamp_millis();

        for scenario in Scenario::ALL {
            let (tickers, from) = {
                let book = &self.books[&scenario];
                if book.positions.is_empty() {
                    continue;
                }
                let from = if book.last_mark_ts > 0 {
                    book.last_mark_ts
                } else {
                    book.positions
                        .values()
                        .map(|p| p.last_trade_ts)
                        .min()
                        .unwrap_or(now)
                };
                (book.positions.keys().cloned().collect::<Vec<_>>(), from)
            };

            let mut returns = HashMap::new();
            for ticker in tickers {
                match self.prices.get_return(&ticker, from, now).await {
                    Ok(pct) => {
                        returns.insert(ticker, pct);
                    }
                    Err(e) => {
                        // Leave the stale value; the next mark catches up.
                        warn!("No return for {} on {}: {:#}", ticker, scenario, e);
                    }
                }
            }
            if returns.is_empty() {
                continue;
            }

            let book = self.books.get_mut(&scenario).unwrap();
            book.mark_to_market(&returns, now);
            let snapshot = book.snapshot(now);
            metrics::gauge!("ledger_total_value", "scenario" => scenario.as_str())
                .set(snapshot.total_value.to_f64().unwrap_or(0.0));

            self.persist_book(scenario).await;
            if let Err(e) = self.bus.ledger_updates.publish(snapshot).await {
                error!("Failed to publish mark snapshot: {}", e);
            }
        }
    }
}

#[async_trait::async_trait]
impl Actor for LedgerActor {
    async fn run(mut self) -> Result<()> {
        info!("LedgerActor started");

        self.hydrate().await;

        let mut batches_rx = self.bus.trade_batches.subscribe();
        let mut mark_tick = tokio::time::interval(self.cfg.mark_interval);
        // The first interval tick fires immediately; skip it, the books were
        // just hydrated.
        mark_tick.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("LedgerActor: shutdown requested");
                    break;
                }

                res = batches_rx.recv() => {
                    match res {
                        Ok(batch) => {
                            self.handle_batch(&batch).await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(lagged = n, "LedgerActor lagged on trade_batches");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            error!("trade_batches stream closed; exiting LedgerActor");
                            break;
                        }
                    }
                }

                _ = mark_tick.tick() => {
                    self.mark_books().await;
                }
            }
        }

        info!("LedgerActor stopped cleanly");
        Ok(())
    }
}
