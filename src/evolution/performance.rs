use crate::core::types::{Decision, UnitId};
use std::collections::HashMap;

/// Running outcome counters for one (unit, version). Frozen when the
/// version is superseded; a frozen record never moves again.
#[derive(Clone, Debug, PartialEq)]
pub struct PerformanceRecord {
    pub unit: UnitId,
    pub version: u32,
    pub correct: u32,
    pub total: u32,
    pub frozen: bool,
}

impl PerformanceRecord {
    pub fn accuracy(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.correct as f64 / self.total as f64)
        }
    }
}

/// Direction-only accuracy bookkeeping. Predictions register the (unit,
/// version) a decision was made under; outcomes advance the counters of
/// exactly that version, whatever the unit's current version is by then.
#[derive(Default)]
pub struct PerformanceTracker {
    records: HashMap<(UnitId, u32), PerformanceRecord>,
    open: HashMap<String, (UnitId, u32)>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hydrate(&mut self, records: Vec<PerformanceRecord>) {
        for record in records {
            self.records
                .insert((record.unit.clone(), record.version), record);
        }
    }

    pub fn record_prediction(&mut self, decision: &Decision) {
        self.open.insert(
            decision.id.clone(),
            (decision.unit.clone(), decision.version),
        );
        self.records
            .entry((decision.unit.clone(), decision.version))
            .or_insert_with(|| PerformanceRecord {
                unit: decision.unit.clone(),
                version: decision.version,
                correct: 0,
                total: 0,
                frozen: false,
            });
    }

    /// Returns the updated record, or None when the decision was never
    /// registered or its record is already frozen.
    pub fn record_outcome(&mut self, decision_id: &str, correct: bool) -> Option<&PerformanceRecord> {
        let key = self.open.remove(decision_id)?;
        let record = self.records.get_mut(&key)?;
        if record.frozen {
            return None;
        }
        record.total += 1;
        if correct {
            record.correct += 1;
        }
        Some(record)
    }

    pub fn record(&self, unit: &UnitId, version: u32) -> Option<&PerformanceRecord> {
        self.records.get(&(unit.clone(), version))
    }

    pub fn freeze(&mut self, unit: &UnitId, version: u32) {
        if let Some(record) = self.records.get_mut(&(unit.clone(), version)) {
            record.frozen = true;
        }
    }

    /// Fresh zeroed record for a newly created version.
    pub fn start_version(&mut self, unit: &UnitId, version: u32) -> &PerformanceRecord {
        self.records
            .entry((unit.clone(), version))
            .or_insert_with(|| PerformanceRecord {
                unit: unit.clone(),
                version,
                correct: 0,
                total: 0,
                frozen: false,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn decision(id: &str, unit: UnitId, version: u32) -> Decision {
        Decision {
            id: id.to_string(),
            unit,
            version,
            predicted: 0.4,
            basket: Map::new(),
            ts_ms: 0,
            due_ts_ms: 0,
            evaluated: false,
        }
    }

    #[test]
    fn accuracy_tracks_incrementally() {
        let mut tracker = PerformanceTracker::new();
        let unit = UnitId::sentiment("XLK");

        for i in 0..4 {
            let d = decision(&format!("d{i}"), unit.clone(), 1);
            tracker.record_prediction(&d);
            tracker.record_outcome(&d.id, i % 2 == 0);
        }

        let record = tracker.record(&unit, 1).unwrap();
        assert_eq!(record.total, 4);
        assert_eq!(record.correct, 2);
        assert_eq!(record.accuracy(), Some(0.5));
    }

    #[test]
    fn unknown_outcome_is_ignored() {
        let mut tracker = PerformanceTracker::new();
        assert!(tracker.record_outcome("nope", true).is_none());
    }

    #[test]
    fn frozen_record_stops_counting() {
        let mut tracker = PerformanceTracker::new();
        let unit = UnitId::sentiment("XLE");

        let d = decision("d1", unit.clone(), 1);
        tracker.record_prediction(&d);
        tracker.freeze(&unit, 1);
        assert!(tracker.record_outcome("d1", true).is_none());

        let record = tracker.record(&unit, 1).unwrap();
        assert_eq!(record.total, 0);
    }

    #[test]
    fn outcomes_land_on_the_version_used() {
        let mut tracker = PerformanceTracker::new();
        let unit = UnitId::sentiment("XLV");

        let old = decision("old", unit.clone(), 1);
        tracker.record_prediction(&old);
        tracker.start_version(&unit, 2);
        // The outcome for the old decision arrives after version 2 exists.
        tracker.record_outcome("old", true);

        assert_eq!(tracker.record(&unit, 1).unwrap().total, 1);
        assert_eq!(tracker.record(&unit, 2).unwrap().total, 0);
    }
}
