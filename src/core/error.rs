use crate::core::types::Scenario;
use rust_decimal::Decimal;

/// Structured error kinds the decision core exposes to its callers.
///
/// Validation errors reject the input and leave state untouched. Invariant
/// violations are fatal for the current invocation and must be surfaced, not
/// retried. Collaborator failures never appear here; those degrade to
/// fallback behavior at the call site.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Raw sentiment beyond the accepted band around [-1, 1]; points at an
    /// upstream scoring defect rather than float noise.
    #[error("sentiment {value} for {sector} outside accepted range")]
    OutOfRangeInput { sector: String, value: f64 },

    #[error("unknown scenario: {0}")]
    ScenarioNotFound(String),

    /// A sector with no tradable assets is a misconfiguration, not a
    /// runtime condition.
    #[error("sector {0} has no tradable assets")]
    SectorUniverseEmpty(String),

    /// A trade batch that would overdraw cash or oversell a position. The
    /// engine sizes trades within available capital, so hitting this means
    /// an engine defect.
    #[error("batch for {scenario} would overdraw by {shortfall}")]
    InsufficientCapital {
        scenario: Scenario,
        shortfall: Decimal,
    },
}
