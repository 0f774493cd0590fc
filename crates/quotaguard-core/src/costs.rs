//! Static quota cost table.
//!
//! This is the single source of truth for what an operation costs. Callers
//! declare a cost alongside every call; the declaration is checked here and
//! only ever corrected upward.

use serde::Serialize;

/// Cost charged for operations missing from the table.
pub const DEFAULT_UNIT_COST: u32 = 1;

/// Known operations and their unit cost.
const COST_TABLE: &[(&str, u32)] = &[
    ("activities.list", 1),
    ("channels.list", 1),
    ("commentThreads.list", 1),
    ("playlistItems.list", 1),
    ("search.list", 100),
    ("subscriptions.list", 1),
    ("videos.list", 1),
];

/// Look up an operation's cost, if it is in the table.
pub fn table_cost(operation: &str) -> Option<u32> {
    COST_TABLE
        .iter()
        .find(|(name, _)| *name == operation)
        .map(|(_, cost)| *cost)
}

/// Expected cost for an operation, falling back to [`DEFAULT_UNIT_COST`].
pub fn estimate_cost(operation: &str) -> u32 {
    table_cost(operation).unwrap_or(DEFAULT_UNIT_COST)
}

/// All table entries, in name order.
pub fn entries() -> impl Iterator<Item = (&'static str, u32)> {
    COST_TABLE.iter().copied()
}

/// Outcome of checking a declared cost against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CostCheck {
    pub declared: u32,
    pub expected: u32,

    /// Units that will actually be charged: `max(declared, expected)`
    pub charged: u32,
}

impl CostCheck {
    /// Whether the caller's declaration disagreed with the table.
    pub fn is_mismatch(&self) -> bool {
        self.declared != self.expected
    }
}

/// Validate a caller-declared cost.
pub fn validate_cost(operation: &str, declared: u32) -> CostCheck {
    let expected = estimate_cost(operation);
    CostCheck {
        declared,
        expected,
        charged: declared.max(expected),
    }
}
