use crate::collaborators::client::Selection;
use crate::config::config::{AllocationCfg, ScenarioCfg};
use crate::core::error::CoreError;
use crate::core::types::{Asset, LedgerUpdate, Scenario, Trade};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Read-only view of a scenario book, enough to price targets against.
#[derive(Clone, Debug)]
pub struct BookView {
    pub cash: Decimal,
    pub value_by_ticker: HashMap<String, Decimal>,
}

impl BookView {
    pub fn fresh(start_capital: Decimal) -> Self {
        Self {
            cash: start_capital,
            value_by_ticker: HashMap::new(),
        }
    }

    pub fn from_update(update: &LedgerUpdate) -> Self {
        Self {
            cash: update.cash,
            value_by_ticker: update
                .positions
                .iter()
                .map(|p| (p.ticker.clone(), p.value))
                .collect(),
        }
    }

    pub fn total_value(&self) -> Decimal {
        self.cash + self.value_by_ticker.values().copied().sum::<Decimal>()
    }
}

/// Pure mapping from sector scores and scenario parameters to target weights
/// and trade deltas. No IO; collaborator results come in as arguments.
#[derive(Debug)]
pub struct AllocationEngine {
    cfg: AllocationCfg,
    universe: HashMap<String, Vec<Asset>>,
}

impl AllocationEngine {
    pub fn new(
        cfg: AllocationCfg,
        universe: HashMap<String, Vec<Asset>>,
    ) -> Result<Self, CoreError> {
        for (sector, assets) in &universe {
            if assets.is_empty() {
                return Err(CoreError::SectorUniverseEmpty(sector.clone()));
            }
        }
        Ok(Self { cfg, universe })
    }

    pub fn cfg(&self) -> &AllocationCfg {
        &self.cfg
    }

    /// Per-ticker sub-weights within one sector. A usable selector result is
    /// renormalized to sum 1; anything else (missing, empty, zero or
    /// overflowing sum, negative weights, unknown tickers only) falls back
    /// to equal-weighting the sector universe. The fallback is mandatory:
    /// allocation never stalls on a missing selection.
    pub fn sub_weights(
        &self,
        sector: &str,
        selection: Option<&Selection>,
    ) -> Result<Vec<(String, f64)>, CoreError> {
        let assets = self
            .universe
            .get(sector)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| CoreError::SectorUniverseEmpty(sector.to_string()))?;

        if let Some(weights) = selection.and_then(|sel| self.usable_picks(sector, sel)) {
            return Ok(weights);
        }

        let w = 1.0 / assets.len() as f64;
        Ok(assets.iter().map(|a| (a.ticker.clone(), w)).collect())
    }

    pub fn selection_usable(&self, sector: &str, selection: &Selection) -> bool {
        self.usable_picks(sector, selection).is_some()
    }

    fn usable_picks(&self, sector: &str, selection: &Selection) -> Option<Vec<(String, f64)>> {
        let assets = self.universe.get(sector)?;
        let known: Vec<_> = selection
            .picks
            .iter()
            .filter(|p| assets.iter().any(|a| a.ticker == p.ticker))
            .collect();
        let sum: f64 = known.iter().map(|p| p.weight).sum();
        let usable = !known.is_empty()
            && known.iter().all(|p| p.weight >= 0.0)
            && sum > 0.0
            && sum <= 1.0 + self.cfg.selection_tolerance;
        if usable {
            Some(
                known
                    .iter()
                    .map(|p| (p.ticker.clone(), p.weight / sum))
                    .collect(),
            )
        } else {
            None
        }
    }

    /// Target fraction of capital for one sector on this scenario's curve.
    fn sector_weight(&self, scenario: Scenario, cfg: &ScenarioCfg, score: f64) -> f64 {
        let equal_share = 1.0 / self.universe.len() as f64;
        let floor = self.cfg.weight_floor;
        let cap = cfg.per_sector_cap;

        match scenario {
            // Linear in the score; benchmark just runs a flatter slope.
            Scenario::Benchmark | Scenario::Momentum => {
                (equal_share * (1.0 + cfg.multiplier * score)).clamp(floor, cap)
            }
            // Sign inversion: bad news is a buy signal.
            Scenario::Contrarian => {
                (equal_share * (1.0 - cfg.multiplier * score)).clamp(floor, cap)
            }
            // Linear with a tight ceiling.
            Scenario::Defensive => {
                (equal_share * (1.0 + cfg.multiplier * score)).clamp(floor, cap)
            }
            // Step: full multiplier on conviction, flat otherwise, out on
            // strong negatives.
            Scenario::Aggressive => {
                if score >= cfg.step_threshold {
                    (equal_share * cfg.multiplier).min(cap)
                } else if score <= -cfg.step_threshold {
                    0.0
                } else {
                    equal_share.min(cap)
                }
            }
            Scenario::SpyOnly => 0.0,
        }
    }

    /// Full target weight vector (ticker -> fraction of capital) for a
    /// scenario. Sectors inside the dead zone keep their current weight.
    /// The aggregate is clipped to 100% of capital by scaling all targets
    /// down proportionally; no sector is dropped.
    pub fn compute_targets(
        &self,
        scenario: Scenario,
        scores: &HashMap<String, f64>,
        book: &BookView,
        selections: &HashMap<String, Selection>,
        confidence_threshold: f64,
    ) -> Result<HashMap<String, f64>, CoreError> {
        let cfg = self.cfg.scenario(scenario);
        let mut targets: HashMap<String, f64> = HashMap::new();

        // The benchmark-only book resolves before any dead-zone check: it
        // ignores sentiment entirely and always holds its one asset.
        if scenario == Scenario::SpyOnly {
            for ticker in book.value_by_ticker.keys() {
                targets.insert(ticker.clone(), 0.0);
            }
            targets.insert(cfg.benchmark_ticker.clone(), 1.0);
            return Ok(targets);
        }

        let total = book.total_value().to_f64().unwrap_or(0.0);
        let dead_zone = cfg.min_magnitude.max(confidence_threshold);

        for (sector, assets) in &self.universe {
            let score = scores.get(sector).copied().unwrap_or(0.0);

            if score.abs() < dead_zone {
                // Dead zone: this sector stays where it is.
                if total > 0.0 {
                    for asset in assets {
                        if let Some(value) = book.value_by_ticker.get(&asset.ticker) {
                            targets.insert(
                                asset.ticker.clone(),
                                value.to_f64().unwrap_or(0.0) / total,
                            );
                        }
                    }
                }
                continue;
            }

            let weight = self.sector_weight(scenario, cfg, score);
            let subs = self.sub_weights(sector, selections.get(sector))?;
            for (ticker, sub) in subs {
                targets.insert(ticker, weight * sub);
            }
            // Held tickers the selection dropped are sold off.
            for asset in assets {
                if book.value_by_ticker.contains_key(&asset.ticker) {
                    targets.entry(asset.ticker.clone()).or_insert(0.0);
                }
            }
        }

        let sum: f64 = targets.values().sum();
        if sum > 1.0 {
            for value in targets.values_mut() {
                *value /= sum;
            }
        }

        Ok(targets)
    }

    /// Signed value deltas that move the book toward the targets. Deltas
    /// below the minimum trade size are skipped as rebalancing noise, and
    /// buys are sized within the cash freed by sells so a batch can never
    /// overdraw the book.
    pub fn trades(
        &self,
        scenario: Scenario,
        targets: &HashMap<String, f64>,
        book: &BookView,
        reading_ts_ms: i64,
        ts_ms: i64,
    ) -> Vec<Trade> {
        let total = book.total_value();
        let min_trade = Decimal::from_f64(self.cfg.min_trade_value).unwrap_or(Decimal::ZERO);

        let mut deltas: Vec<(String, Decimal)> = Vec::new();
        for (ticker, frac) in targets {
            let frac = frac.max(0.0);
            let target_value =
                total * Decimal::from_f64(frac).unwrap_or(Decimal::ZERO);
            let current = book
                .value_by_ticker
                .get(ticker)
                .copied()
                .unwrap_or(Decimal::ZERO);
            let delta = target_value - current;
            if delta.abs() < min_trade {
                continue;
            }
            deltas.push((ticker.clone(), delta));
        }

        let sell_total: Decimal = deltas
            .iter()
            .filter(|(_, d)| d.is_sign_negative())
            .map(|(_, d)| -*d)
            .sum();
        let buy_total: Decimal = deltas
            .iter()
            .filter(|(_, d)| d.is_sign_positive())
            .map(|(_, d)| *d)
            .sum();
        let available = book.cash + sell_total;

        if buy_total > available && buy_total > Decimal::ZERO {
            let scale = available.max(Decimal::ZERO) / buy_total;
            for (_, delta) in deltas.iter_mut() {
                if delta.is_sign_positive() {
                    *delta *= scale;
                }
            }
        }

        deltas
            .into_iter()
            .filter(|(_, d)| !d.is_zero())
            .map(|(ticker, delta_value)| Trade {
                scenario,
                sector: self.sector_of(&ticker),
                ticker,
                delta_value,
                reading_ts_ms,
                ts_ms,
            })
            .collect()
    }

    fn sector_of(&self, ticker: &str) -> String {
        for (sector, assets) in &self.universe {
            if assets.iter().any(|a| a.ticker == ticker) {
                return sector.clone();
            }
        }
        // The benchmark asset sits outside the sector universe.
        ticker.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::client::AssetPick;
    use crate::core::types::AssetClass;

    fn asset(ticker: &str, sector: &str) -> Asset {
        Asset {
            ticker: ticker.to_string(),
            sector: sector.to_string(),
            class: AssetClass::Equity,
        }
    }

    fn engine() -> AllocationEngine {
        let mut universe = HashMap::new();
        universe.insert(
            "XLK".to_string(),
            vec![asset("NVDA", "XLK"), asset("MSFT", "XLK"), asset("AAPL", "XLK")],
        );
        universe.insert(
            "XLE".to_string(),
            vec![asset("XOM", "XLE"), asset("CVX", "XLE")],
        );
        universe.insert("XLV".to_string(), vec![asset("JNJ", "XLV")]);
        universe.insert("XLF".to_string(), vec![asset("JPM", "XLF")]);
        AllocationEngine::new(AllocationCfg::default(), universe).unwrap()
    }

    fn selection(picks: Vec<(&str, f64)>) -> Selection {
        Selection {
            picks: picks
                .into_iter()
                .map(|(t, w)| AssetPick {
                    ticker: t.to_string(),
                    weight: w,
                    reason: String::new(),
                })
                .collect(),
            rationale: String::new(),
            risk_level: String::new(),
            prompt_version: 1,
        }
    }

    fn dec(v: f64) -> Decimal {
        Decimal::from_f64(v).unwrap()
    }

    #[test]
    fn empty_universe_is_rejected() {
        let mut universe = HashMap::new();
        universe.insert("XLK".to_string(), Vec::new());
        let err = AllocationEngine::new(AllocationCfg::default(), universe).unwrap_err();
        assert!(matches!(err, CoreError::SectorUniverseEmpty(_)));
    }

    #[test]
    fn dead_zone_produces_no_trades() {
        let eng = engine();
        let book = BookView::fresh(dec(50_000.0));
        // Every score below the momentum dead zone (0.15)
        let scores: HashMap<String, f64> = [
            ("XLK".to_string(), 0.05),
            ("XLE".to_string(), -0.1),
            ("XLV".to_string(), 0.0),
        ]
        .into();

        let targets = eng
            .compute_targets(Scenario::Momentum, &scores, &book, &HashMap::new(), 0.0)
            .unwrap();
        let trades = eng.trades(Scenario::Momentum, &targets, &book, 1, 2);
        assert!(trades.is_empty());
    }

    #[test]
    fn confidence_threshold_widens_the_dead_zone() {
        let eng = engine();
        let book = BookView::fresh(dec(50_000.0));
        let scores: HashMap<String, f64> = [("XLK".to_string(), 0.3)].into();

        let active = eng
            .compute_targets(Scenario::Momentum, &scores, &book, &HashMap::new(), 0.1)
            .unwrap();
        assert!(!eng.trades(Scenario::Momentum, &active, &book, 1, 2).is_empty());

        let muted = eng
            .compute_targets(Scenario::Momentum, &scores, &book, &HashMap::new(), 0.35)
            .unwrap();
        assert!(eng.trades(Scenario::Momentum, &muted, &book, 1, 2).is_empty());
    }

    #[test]
    fn contrarian_inverts_negative_sentiment() {
        let eng = engine();
        let book = BookView::fresh(dec(50_000.0));
        let scores: HashMap<String, f64> = [("XLK".to_string(), -0.6)].into();
        let mut selections = HashMap::new();
        selections.insert("XLK".to_string(), selection(vec![("NVDA", 1.0)]));

        let targets = eng
            .compute_targets(Scenario::Contrarian, &scores, &book, &selections, 0.0)
            .unwrap();
        let nvda = targets.get("NVDA").copied().unwrap();
        assert!(nvda > 0.0, "negative sentiment should buy: {nvda}");

        let trades = eng.trades(Scenario::Contrarian, &targets, &book, 1, 2);
        let nvda_trade = trades.iter().find(|t| t.ticker == "NVDA").unwrap();
        assert!(nvda_trade.delta_value > Decimal::ZERO);
    }

    #[test]
    fn spy_only_ignores_sentiment() {
        let eng = engine();
        let book = BookView::fresh(dec(50_000.0));
        let scores: HashMap<String, f64> = [("XLK".to_string(), 0.9)].into();

        let targets = eng
            .compute_targets(Scenario::SpyOnly, &scores, &book, &HashMap::new(), 0.0)
            .unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets.get("SPY").copied(), Some(1.0));

        let trades = eng.trades(Scenario::SpyOnly, &targets, &book, 1, 2);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].ticker, "SPY");
        assert_eq!(trades[0].delta_value, dec(50_000.0));
    }

    #[test]
    fn aggregate_targets_never_exceed_capital() {
        let eng = engine();
        let book = BookView::fresh(dec(50_000.0));
        // Strong conviction everywhere pushes raw sector weights past 100%
        let scores: HashMap<String, f64> = [
            ("XLK".to_string(), 0.95),
            ("XLE".to_string(), 0.9),
            ("XLV".to_string(), 0.85),
            ("XLF".to_string(), 0.9),
        ]
        .into();

        for scenario in [Scenario::Momentum, Scenario::Aggressive, Scenario::Benchmark] {
            let targets = eng
                .compute_targets(scenario, &scores, &book, &HashMap::new(), 0.0)
                .unwrap();
            let sum: f64 = targets.values().sum();
            assert!(sum <= 1.0 + 1e-9, "{scenario}: {sum}");
        }

        // Four aggressive sectors at the 30% cap would want 120% of capital;
        // proportional scaling brings them back to exactly 100%.
        let targets = eng
            .compute_targets(Scenario::Aggressive, &scores, &book, &HashMap::new(), 0.0)
            .unwrap();
        let sum: f64 = targets.values().sum();
        assert!((sum - 1.0).abs() < 1e-9, "aggressive sum {sum}");
    }

    #[test]
    fn missing_selection_falls_back_to_equal_weight() {
        let eng = engine();
        let subs = eng.sub_weights("XLK", None).unwrap();
        assert_eq!(subs.len(), 3);
        for (_, w) in &subs {
            assert!((w - 1.0 / 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn selection_weights_are_renormalized() {
        let eng = engine();
        let sel = selection(vec![("NVDA", 0.3), ("MSFT", 0.2)]);
        let subs = eng.sub_weights("XLK", Some(&sel)).unwrap();
        let total: f64 = subs.iter().map(|(_, w)| w).sum();
        assert!((total - 1.0).abs() < 1e-9);
        let nvda = subs.iter().find(|(t, _)| t == "NVDA").unwrap().1;
        assert!((nvda - 0.6).abs() < 1e-9);
    }

    #[test]
    fn degenerate_selections_fall_back() {
        let eng = engine();
        // Zero sum
        let sel = selection(vec![("NVDA", 0.0), ("MSFT", 0.0)]);
        assert_eq!(eng.sub_weights("XLK", Some(&sel)).unwrap().len(), 3);
        // Sum far above 1.0
        let sel = selection(vec![("NVDA", 0.9), ("MSFT", 0.9)]);
        assert_eq!(eng.sub_weights("XLK", Some(&sel)).unwrap().len(), 3);
        // Negative weight
        let sel = selection(vec![("NVDA", 1.2), ("MSFT", -0.2)]);
        assert_eq!(eng.sub_weights("XLK", Some(&sel)).unwrap().len(), 3);
        // Only unknown tickers
        let sel = selection(vec![("TSLA", 1.0)]);
        assert_eq!(eng.sub_weights("XLK", Some(&sel)).unwrap().len(), 3);
    }

    #[test]
    fn small_deltas_are_skipped() {
        let eng = engine();
        let mut book = BookView::fresh(dec(50.0));
        book.value_by_ticker.insert("NVDA".to_string(), dec(49_950.0));
        // Target close to current: delta under the 100 minimum
        let targets: HashMap<String, f64> = [("NVDA".to_string(), 0.999)].into();
        let trades = eng.trades(Scenario::Momentum, &targets, &book, 1, 2);
        assert!(trades.is_empty());
    }

    #[test]
    fn buys_are_limited_to_available_cash() {
        let eng = engine();
        let mut book = BookView::fresh(Decimal::ZERO);
        book.value_by_ticker.insert("XOM".to_string(), dec(530.0));
        book.value_by_ticker.insert("CVX".to_string(), dec(530.0));

        // Two sells just under the minimum trade size get dropped; the buy
        // they were meant to fund must shrink instead of overdrawing cash.
        let targets: HashMap<String, f64> = [
            ("XOM".to_string(), 478.0 / 1060.0),
            ("CVX".to_string(), 478.0 / 1060.0),
            ("NVDA".to_string(), 104.0 / 1060.0),
        ]
        .into();

        let trades = eng.trades(Scenario::Momentum, &targets, &book, 1, 2);
        let net: Decimal = trades.iter().map(|t| t.delta_value).sum();
        assert!(book.cash - net >= Decimal::ZERO, "net {net} overdraws");
    }
}
