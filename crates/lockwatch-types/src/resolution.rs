use facet::Facet;

use crate::ThreadId;

// ── Strategy ladder ──────────────────────────────────────────────

/// A resolution heuristic. The ladder order is fixed by [`Strategy::LADDER`].
#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
#[facet(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    /// Interrupt one member, preferring threads in an interruptible wait.
    SmartInterruption,
    /// Interrupt the member with the lowest scheduling priority.
    PriorityBased,
    /// Interrupt the member that has been blocked the longest.
    TimeoutRecovery,
    /// Interrupt every member. Last resort.
    ForceInterruption,
}

impl Strategy {
    pub const LADDER: [Strategy; 4] = [
        Strategy::SmartInterruption,
        Strategy::PriorityBased,
        Strategy::TimeoutRecovery,
        Strategy::ForceInterruption,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::SmartInterruption => "SMART_INTERRUPTION",
            Strategy::PriorityBased => "PRIORITY_BASED",
            Strategy::TimeoutRecovery => "TIMEOUT_RECOVERY",
            Strategy::ForceInterruption => "FORCE_INTERRUPTION",
        }
    }
}

impl core::fmt::Display for Strategy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Attempts ─────────────────────────────────────────────────────

#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
#[facet(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Success,
    Failed,
    /// Interrupts were issued but no lock release is confirmed.
    Partial,
    /// The target cannot be interrupted; the engine only observes.
    Monitoring,
}

impl AttemptOutcome {
    /// Whether this outcome ends the ladder as a resolution.
    pub fn counts_as_success(self) -> bool {
        matches!(self, AttemptOutcome::Success | AttemptOutcome::Partial)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Success => "SUCCESS",
            AttemptOutcome::Failed => "FAILED",
            AttemptOutcome::Partial => "PARTIAL",
            AttemptOutcome::Monitoring => "MONITORING",
        }
    }
}

impl core::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded execution of a strategy against a cycle. Immutable once recorded.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct ResolutionAttempt {
    pub id: String,
    pub event_id: String,
    pub timestamp_ms: i64,
    pub method: Strategy,
    pub affected_threads: Vec<ThreadId>,
    pub outcome: AttemptOutcome,
    pub detail: String,
    pub duration_ms: u64,
}
