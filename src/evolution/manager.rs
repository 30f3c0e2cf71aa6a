use crate::config::config::EvolutionCfg;
use crate::core::types::{Decision, UnitId};
use crate::evolution::performance::{PerformanceRecord, PerformanceTracker};
use crate::evolution::versions::{PromptStore, PromptVersion};
use std::collections::HashSet;

/// Everything needed to run one revision call for a unit. Holding a ticket
/// marks the unit's evolution as in flight.
#[derive(Clone, Debug)]
pub struct EvolutionTicket {
    pub unit: UnitId,
    pub version: u32,
    pub payload: String,
    pub correct: u32,
    pub total: u32,
}

/// Decides when a version has earned a replacement and guards the version
/// chain against concurrent evolutions: one in flight per unit, duplicate
/// triggers are no-ops.
pub struct EvolutionManager {
    pub tracker: PerformanceTracker,
    pub store: PromptStore,
    cfg: EvolutionCfg,
    pending: HashSet<UnitId>,
}

impl EvolutionManager {
    pub fn new(cfg: EvolutionCfg) -> Self {
        Self {
            tracker: PerformanceTracker::new(),
            store: PromptStore::new(),
            cfg,
            pending: HashSet::new(),
        }
    }

    pub fn observe_prediction(&mut self, decision: &Decision, now_ms: i64) {
        if !self.store.contains(&decision.unit) {
            self.store.seed(&decision.unit, decision.version, now_ms);
        }
        self.tracker.record_prediction(decision);
    }

    pub fn observe_outcome(&mut self, decision_id: &str, correct: bool) -> Option<PerformanceRecord> {
        self.tracker.record_outcome(decision_id, correct).cloned()
    }

    pub fn should_evolve(&self, unit: &UnitId) -> bool {
        if self.pending.contains(unit) {
            return false;
        }
        let current = match self.store.current(unit) {
            Some(v) => v,
            None => return false,
        };
        let record = match self.tracker.record(unit, current.version) {
            Some(r) => r,
            None => return false,
        };
        record.total >= self.cfg.min_predictions
            && record.accuracy().is_some_and(|a| a < self.cfg.accuracy_floor)
    }

    /// Claim the unit for one evolution. Returns None when the unit does
    /// not qualify or an evolution is already in flight.
    pub fn begin(&mut self, unit: &UnitId) -> Option<EvolutionTicket> {
        if !self.should_evolve(unit) {
            return None;
        }
        let current = self.store.current(unit)?;
        let record = self.tracker.record(unit, current.version)?;
        let ticket = EvolutionTicket {
            unit: unit.clone(),
            version: current.version,
            payload: current.payload.clone(),
            correct: record.correct,
            total: record.total,
        };
        self.pending.insert(unit.clone());
        Some(ticket)
    }

    /// Land the revised payload: freeze the failing record, append the
    /// successor, start it at zero.
    pub fn complete(
        &mut self,
        ticket: EvolutionTicket,
        payload: String,
        now_ms: i64,
    ) -> PromptVersion {
        self.tracker.freeze(&ticket.unit, ticket.version);
        let reason = format!(
            "accuracy {:.2} over {} predictions",
            ticket.correct as f64 / ticket.total.max(1) as f64,
            ticket.total
        );
        let created = self
            .store
            .supersede(
                &ticket.unit,
                payload,
                reason,
                ticket.correct,
                ticket.total,
                now_ms,
            )
            .clone();
        self.tracker.start_version(&ticket.unit, created.version);
        self.pending.remove(&ticket.unit);
        created
    }

    /// Release the claim after a failed reviser call; the trigger fires
    /// again on the next qualifying outcome.
    pub fn abort(&mut self, ticket: EvolutionTicket) {
        self.pending.remove(&ticket.unit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn decision(id: &str, unit: &UnitId, version: u32) -> Decision {
        Decision {
            id: id.to_string(),
            unit: unit.clone(),
            version,
            predicted: 0.3,
            basket: HashMap::new(),
            ts_ms: 0,
            due_ts_ms: 0,
            evaluated: false,
        }
    }

    fn run_outcomes(manager: &mut EvolutionManager, unit: &UnitId, correct: u32, total: u32) {
        for i in 0..total {
            let d = decision(&format!("{unit}-{i}"), unit, 1);
            manager.observe_prediction(&d, 0);
            manager.observe_outcome(&d.id, i < correct);
        }
    }

    #[test]
    fn ten_predictions_at_forty_percent_trigger_once() {
        let mut manager = EvolutionManager::new(EvolutionCfg::default());
        let unit = UnitId::sentiment("XLK");
        run_outcomes(&mut manager, &unit, 4, 10);

        assert!(manager.should_evolve(&unit));
        let ticket = manager.begin(&unit).expect("should claim");
        // Duplicate trigger while in flight is a no-op.
        assert!(manager.begin(&unit).is_none());

        let created = manager.complete(ticket, "better prompt".into(), 99);
        assert_eq!(created.version, 2);
        assert_eq!(created.created_from, Some(1));
        assert!(created.reason.contains("0.40"));

        // Old record frozen, new one starts clean, no re-trigger.
        assert!(manager.tracker.record(&unit, 1).unwrap().frozen);
        assert_eq!(manager.tracker.record(&unit, 2).unwrap().total, 0);
        assert!(!manager.should_evolve(&unit));
    }

    #[test]
    fn decent_accuracy_does_not_trigger() {
        let mut manager = EvolutionManager::new(EvolutionCfg::default());
        let unit = UnitId::sentiment("XLE");
        run_outcomes(&mut manager, &unit, 7, 12);

        assert!(!manager.should_evolve(&unit));
        assert!(manager.begin(&unit).is_none());
    }

    #[test]
    fn too_few_predictions_do_not_trigger() {
        let mut manager = EvolutionManager::new(EvolutionCfg::default());
        let unit = UnitId::sentiment("XLV");
        run_outcomes(&mut manager, &unit, 1, 9);
        assert!(!manager.should_evolve(&unit));
    }

    #[test]
    fn abort_releases_the_claim() {
        let mut manager = EvolutionManager::new(EvolutionCfg::default());
        let unit = UnitId::sentiment("XLF");
        run_outcomes(&mut manager, &unit, 0, 10);

        let ticket = manager.begin(&unit).unwrap();
        manager.abort(ticket);
        assert!(manager.begin(&unit).is_some());
    }
}
