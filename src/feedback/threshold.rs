use crate::config::config::FeedbackCfg;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One versioned adjustment of the confidence threshold, with the evidence
/// that caused it. Mirrors the lineage discipline of prompt versions:
/// append-only, every non-root entry points at its predecessor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThresholdChange {
    pub version: u32,
    pub created_from: u32,
    pub previous: f64,
    pub value: f64,
    pub win_rate: f64,
    pub evaluations: usize,
    pub ts_ms: i64,
}

/// Adapts the dead-zone threshold from the recent win rate: a version of
/// the logic that is winning gets to act on weaker signals, a losing one
/// has to wait for stronger ones.
pub struct ThresholdController {
    cfg: FeedbackCfg,
    value: f64,
    version: u32,
    window: VecDeque<bool>,
}

impl ThresholdController {
    pub fn new(cfg: FeedbackCfg) -> Self {
        let value = cfg.initial_threshold;
        Self {
            cfg,
            value,
            version: 1,
            window: VecDeque::new(),
        }
    }

    /// Resume from the persisted head instead of the configured start.
    pub fn resume(cfg: FeedbackCfg, value: f64, version: u32) -> Self {
        Self {
            cfg,
            value,
            version,
            window: VecDeque::new(),
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Feed one evaluated decision in. A change is only proposed on a full
    /// window; the window resets afterwards so each adjustment rests on
    /// fresh evidence.
    pub fn observe(&mut self, correct: bool, ts_ms: i64) -> Option<ThresholdChange> {
        self.window.push_back(correct);
        while self.window.len() > self.cfg.window {
            self.window.pop_front();
        }
        if self.window.len() < self.cfg.window {
            return None;
        }

        let wins = self.window.iter().filter(|c| **c).count();
        let win_rate = wins as f64 / self.window.len() as f64;

        let next = if win_rate > self.cfg.lower_above {
            (self.value - self.cfg.learning_step).max(self.cfg.threshold_floor)
        } else if win_rate < self.cfg.raise_below {
            (self.value + self.cfg.learning_step).min(self.cfg.threshold_ceiling)
        } else {
            self.value
        };

        if (next - self.value).abs() < f64::EPSILON {
            return None;
        }

        let change = ThresholdChange {
            version: self.version + 1,
            created_from: self.version,
            previous: self.value,
            value: next,
            win_rate,
            evaluations: self.window.len(),
            ts_ms,
        };
        self.value = next;
        self.version += 1;
        self.window.clear();
        Some(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(controller: &mut ThresholdController, wins: usize, total: usize) -> Vec<ThresholdChange> {
        let mut changes = Vec::new();
        for i in 0..total {
            if let Some(c) = controller.observe(i < wins, i as i64) {
                changes.push(c);
            }
        }
        changes
    }

    #[test]
    fn winning_window_lowers_the_threshold() {
        let mut controller = ThresholdController::new(FeedbackCfg::default());
        // 13/20 = 65% win rate
        let changes = feed(&mut controller, 13, 20);

        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.previous, 0.10);
        assert!((change.value - 0.05).abs() < 1e-9);
        assert!((change.win_rate - 0.65).abs() < 1e-9);
        assert_eq!(change.created_from, 1);
        assert_eq!(change.version, 2);
        assert_eq!(controller.value(), change.value);
    }

    #[test]
    fn losing_window_raises_the_threshold() {
        let mut controller = ThresholdController::new(FeedbackCfg::default());
        // 6/20 = 30% win rate
        let changes = feed(&mut controller, 6, 20);

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].previous, 0.10);
        assert!((changes[0].value - 0.15).abs() < 1e-9);
    }

    #[test]
    fn middling_window_changes_nothing() {
        let mut controller = ThresholdController::new(FeedbackCfg::default());
        let changes = feed(&mut controller, 10, 20);
        assert!(changes.is_empty());
        assert_eq!(controller.value(), 0.10);
        assert_eq!(controller.version(), 1);
    }

    #[test]
    fn no_change_before_the_window_fills() {
        let mut controller = ThresholdController::new(FeedbackCfg::default());
        let changes = feed(&mut controller, 12, 19);
        assert!(changes.is_empty());
    }

    #[test]
    fn threshold_is_bounded() {
        let cfg = FeedbackCfg::default();
        let mut controller = ThresholdController::resume(cfg.clone(), cfg.threshold_floor, 7);
        // Already at the floor: a winning window cannot push lower.
        let changes = feed(&mut controller, 20, 20);
        assert!(changes.is_empty());
        assert_eq!(controller.value(), cfg.threshold_floor);

        let mut controller = ThresholdController::resume(cfg.clone(), cfg.threshold_ceiling, 7);
        let changes = feed(&mut controller, 0, 20);
        assert!(changes.is_empty());
        assert_eq!(controller.value(), cfg.threshold_ceiling);
    }

    #[test]
    fn each_change_rests_on_a_fresh_window() {
        let mut controller = ThresholdController::new(FeedbackCfg::default());
        // Two losing windows back to back: 0.10 -> 0.15 -> 0.20
        let changes = feed(&mut controller, 0, 40);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].created_from, changes[0].version);
        assert!((controller.value() - 0.20).abs() < 1e-9);
    }
}
