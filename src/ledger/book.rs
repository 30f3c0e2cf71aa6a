use crate::core::error::CoreError;
use crate::core::types::{LedgerUpdate, Position, Scenario, Trade};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// One scenario's cash and positions. Trades land here as all-or-nothing
/// batches; a batch that would overdraw cash or oversell a position leaves
/// the book untouched.
#[derive(Debug)]
pub struct ScenarioBook {
    pub scenario: Scenario,
    pub start_capital: Decimal,
    pub cash: Decimal,
    pub positions: HashMap<String, Position>,
    pub last_mark_ts: i64,
}

impl ScenarioBook {
    pub fn new(scenario: Scenario, start_capital: Decimal) -> Self {
        Self {
            scenario,
            start_capital,
            cash: start_capital,
            positions: HashMap::new(),
            last_mark_ts: 0,
        }
    }

    pub fn hydrate(
        scenario: Scenario,
        start_capital: Decimal,
        cash: Decimal,
        positions: Vec<Position>,
        last_mark_ts: i64,
    ) -> Self {
        Self {
            scenario,
            start_capital,
            cash,
            positions: positions.into_iter().map(|p| (p.ticker.clone(), p)).collect(),
            last_mark_ts,
        }
    }

    pub fn total_value(&self) -> Decimal {
        self.cash + self.positions.values().map(|p| p.value).sum::<Decimal>()
    }

    /// Apply a trade batch atomically. Validation runs over the whole batch
    /// before any mutation; a rejected batch leaves cash and positions
    /// exactly as they were.
    pub fn apply(&mut self, trades: &[Trade]) -> Result<(), CoreError> {
        // Validation pass
        let mut cash = self.cash;
        let mut values: HashMap<&str, Decimal> = self
            .positions
            .iter()
            .map(|(t, p)| (t.as_str(), p.value))
            .collect();

        for trade in trades {
            cash -= trade.delta_value;
            let value = values.entry(trade.ticker.as_str()).or_insert(Decimal::ZERO);
            *value += trade.delta_value;
            if *value < Decimal::ZERO {
                return Err(CoreError::InsufficientCapital {
                    scenario: self.scenario,
                    shortfall: -*value,
                });
            }
        }
        if cash < Decimal::ZERO {
            return Err(CoreError::InsufficientCapital {
                scenario: self.scenario,
                shortfall: -cash,
            });
        }

        // Commit pass
        for trade in trades {
            self.cash -= trade.delta_value;
            let position = self
                .positions
                .entry(trade.ticker.clone())
                .or_insert(Position {
                    scenario: self.scenario,
                    ticker: trade.ticker.clone(),
                    sector: trade.sector.clone(),
                    value: Decimal::ZERO,
                    cost_basis: Decimal::ZERO,
                    last_trade_ts: trade.ts_ms,
                });

            if trade.delta_value >= Decimal::ZERO {
                position.cost_basis += trade.delta_value;
            } else if position.value > Decimal::ZERO {
                // Sells release cost basis in proportion to the value sold.
                let kept = (position.value + trade.delta_value) / position.value;
                position.cost_basis *= kept;
            }
            position.value += trade.delta_value;
            position.last_trade_ts = trade.ts_ms;
        }
        self.positions.retain(|_, p| !p.value.is_zero());

        Ok(())
    }

    /// Revalue positions with externally observed returns since the last
    /// mark. Mark-to-market is the only way value enters or leaves a book
    /// outside of trades.
    pub fn mark_to_market(&mut self, returns: &HashMap<String, f64>, ts_ms: i64) {
        for (ticker, pct) in returns {
            if let Some(position) = self.positions.get_mut(ticker) {
                let factor = Decimal::from_f64(1.0 + pct).unwrap_or(Decimal::ONE);
                position.value *= factor.max(Decimal::ZERO);
            }
        }
        self.last_mark_ts = ts_ms;
    }

    pub fn snapshot(&self, ts_ms: i64) -> LedgerUpdate {
        LedgerUpdate {
            scenario: self.scenario,
            cash: self.cash,
            total_value: self.total_value(),
            start_capital: self.start_capital,
            positions: self.positions.values().cloned().collect(),
            ts_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(v: f64) -> Decimal {
        Decimal::from_f64(v).unwrap()
    }

    fn trade(ticker: &str, delta: f64) -> Trade {
        Trade {
            scenario: Scenario::Momentum,
            ticker: ticker.to_string(),
            sector: "XLK".to_string(),
            delta_value: dec(delta),
            reading_ts_ms: 1,
            ts_ms: 2,
        }
    }

    #[test]
    fn batch_applies_and_conserves_value() {
        let mut book = ScenarioBook::new(Scenario::Momentum, dec(50_000.0));
        book.apply(&[trade("NVDA", 10_000.0), trade("MSFT", 5_000.0)])
            .unwrap();

        assert_eq!(book.cash, dec(35_000.0));
        assert_eq!(book.positions["NVDA"].value, dec(10_000.0));
        assert_eq!(book.total_value(), dec(50_000.0));
    }

    #[test]
    fn overdrawing_batch_leaves_book_unchanged() {
        let mut book = ScenarioBook::new(Scenario::Momentum, dec(1_000.0));
        book.apply(&[trade("NVDA", 400.0)]).unwrap();

        let cash_before = book.cash;
        let values_before: Vec<_> = {
            let mut v: Vec<_> = book
                .positions
                .values()
                .map(|p| (p.ticker.clone(), p.value, p.cost_basis))
                .collect();
            v.sort();
            v
        };

        // Second leg alone fits, but the batch as a whole overdraws.
        let err = book
            .apply(&[trade("MSFT", 500.0), trade("AAPL", 300.0)])
            .unwrap_err();
        assert!(matches!(err, CoreError::InsufficientCapital { .. }));

        assert_eq!(book.cash, cash_before);
        let values_after: Vec<_> = {
            let mut v: Vec<_> = book
                .positions
                .values()
                .map(|p| (p.ticker.clone(), p.value, p.cost_basis))
                .collect();
            v.sort();
            v
        };
        assert_eq!(values_after, values_before);
    }

    #[test]
    fn overselling_is_rejected() {
        let mut book = ScenarioBook::new(Scenario::Momentum, dec(1_000.0));
        book.apply(&[trade("NVDA", 400.0)]).unwrap();

        let err = book.apply(&[trade("NVDA", -500.0)]).unwrap_err();
        assert!(matches!(err, CoreError::InsufficientCapital { .. }));
        assert_eq!(book.positions["NVDA"].value, dec(400.0));
        assert_eq!(book.cash, dec(600.0));
    }

    #[test]
    fn sells_release_cost_basis_proportionally() {
        let mut book = ScenarioBook::new(Scenario::Momentum, dec(10_000.0));
        book.apply(&[trade("NVDA", 4_000.0)]).unwrap();
        book.apply(&[trade("NVDA", -1_000.0)]).unwrap();

        let pos = &book.positions["NVDA"];
        assert_eq!(pos.value, dec(3_000.0));
        assert_eq!(pos.cost_basis, dec(3_000.0));
        assert_eq!(book.cash, dec(7_000.0));
    }

    #[test]
    fn flat_positions_are_dropped() {
        let mut book = ScenarioBook::new(Scenario::Momentum, dec(10_000.0));
        book.apply(&[trade("NVDA", 4_000.0)]).unwrap();
        book.apply(&[trade("NVDA", -4_000.0)]).unwrap();
        assert!(book.positions.is_empty());
        assert_eq!(book.cash, dec(10_000.0));
    }

    #[test]
    fn mark_to_market_moves_value_not_cash() {
        let mut book = ScenarioBook::new(Scenario::Momentum, dec(10_000.0));
        book.apply(&[trade("NVDA", 4_000.0)]).unwrap();

        let returns: HashMap<String, f64> = [("NVDA".to_string(), 0.10)].into();
        book.mark_to_market(&returns, 99);

        assert_eq!(book.positions["NVDA"].value, dec(4_400.0));
        assert_eq!(book.cash, dec(6_000.0));
        assert_eq!(book.total_value(), dec(10_400.0));
        assert_eq!(book.last_mark_ts, 99);
    }
}
