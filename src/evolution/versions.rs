use crate::core::types::UnitId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One immutable entry in a unit's lineage. The payload is opaque; only
/// identity, ancestry, and the performance counters at creation time matter
/// here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromptVersion {
    pub unit: UnitId,
    pub version: u32,
    pub payload: String,
    pub created_from: Option<u32>,
    pub reason: String,
    pub correct_at_creation: u32,
    pub total_at_creation: u32,
    pub created_ts_ms: i64,
}

/// Per-unit version chains. Versions are monotonic per unit, every chain
/// starts at a root with no parent, and entries are never edited, only
/// superseded.
#[derive(Default)]
pub struct PromptStore {
    chains: HashMap<UnitId, Vec<PromptVersion>>,
}

impl PromptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hydrate(&mut self, mut versions: Vec<PromptVersion>) {
        versions.sort_by_key(|v| v.version);
        for version in versions {
            self.chains.entry(version.unit.clone()).or_default().push(version);
        }
    }

    pub fn current(&self, unit: &UnitId) -> Option<&PromptVersion> {
        self.chains.get(unit).and_then(|c| c.last())
    }

    #[allow(dead_code)]
    pub fn lineage(&self, unit: &UnitId) -> &[PromptVersion] {
        self.chains.get(unit).map(|c| c.as_slice()).unwrap_or(&[])
    }

    pub fn contains(&self, unit: &UnitId) -> bool {
        self.chains.contains_key(unit)
    }

    /// Root version for a unit seen for the first time.
    pub fn seed(&mut self, unit: &UnitId, version: u32, ts_ms: i64) -> &PromptVersion {
        let chain = self.chains.entry(unit.clone()).or_default();
        if chain.is_empty() {
            chain.push(PromptVersion {
                unit: unit.clone(),
                version,
                payload: String::new(),
                created_from: None,
                reason: "bootstrap".to_string(),
                correct_at_creation: 0,
                total_at_creation: 0,
                created_ts_ms: ts_ms,
            });
        }
        chain.last().unwrap()
    }

    /// Append a successor to the current version. The old entry stays in
    /// the chain untouched.
    pub fn supersede(
        &mut self,
        unit: &UnitId,
        payload: String,
        reason: String,
        correct: u32,
        total: u32,
        ts_ms: i64,
    ) -> &PromptVersion {
        let chain = self.chains.entry(unit.clone()).or_default();
        let (next, parent) = match chain.last() {
            Some(last) => (last.version + 1, Some(last.version)),
            None => (0, None),
        };
        chain.push(PromptVersion {
            unit: unit.clone(),
            version: next,
            payload,
            created_from: parent,
            reason,
            correct_at_creation: correct,
            total_at_creation: total,
            created_ts_ms: ts_ms,
        });
        chain.last().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lineage_is_a_single_parent_chain() {
        let mut store = PromptStore::new();
        let unit = UnitId::sentiment("XLK");

        store.seed(&unit, 1, 10);
        store.supersede(&unit, "p2".into(), "accuracy 0.40".into(), 4, 10, 20);
        store.supersede(&unit, "p3".into(), "accuracy 0.45".into(), 5, 11, 30);

        let lineage = store.lineage(&unit);
        assert_eq!(lineage.len(), 3);

        // Exactly one root, and every non-root points at its predecessor.
        assert_eq!(lineage[0].created_from, None);
        for pair in lineage.windows(2) {
            assert_eq!(pair[1].created_from, Some(pair[0].version));
            assert!(pair[1].version > pair[0].version);
        }
        assert_eq!(store.current(&unit).unwrap().version, 3);
    }

    #[test]
    fn seeding_twice_keeps_the_root() {
        let mut store = PromptStore::new();
        let unit = UnitId::selection("XLE");
        store.seed(&unit, 0, 1);
        store.seed(&unit, 0, 2);
        assert_eq!(store.lineage(&unit).len(), 1);
        assert_eq!(store.current(&unit).unwrap().created_ts_ms, 1);
    }

    #[test]
    fn hydrate_restores_order() {
        let unit = UnitId::sentiment("XLV");
        let make = |version: u32, created_from: Option<u32>| PromptVersion {
            unit: unit.clone(),
            version,
            payload: String::new(),
            created_from,
            reason: String::new(),
            correct_at_creation: 0,
            total_at_creation: 0,
            created_ts_ms: version as i64,
        };

        let mut store = PromptStore::new();
        store.hydrate(vec![make(2, Some(1)), make(1, None)]);
        assert_eq!(store.current(&unit).unwrap().version, 2);
        assert_eq!(store.lineage(&unit)[0].version, 1);
    }
}
