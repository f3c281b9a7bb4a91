use facet::Facet;

use crate::{ThreadId, ThreadSet};

/// Resolution method recorded when a cycle disappears without any strategy
/// having succeeded.
pub const SELF_RESOLVED_METHOD: &str = "external/self-resolved";

/// Lifecycle state of a deadlock event.
#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
#[facet(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventState {
    Detected,
    Resolving,
    Resolved,
    Failed,
}

impl EventState {
    pub fn is_terminal(self) -> bool {
        matches!(self, EventState::Resolved)
    }

    /// Whether a resolution attempt may start from this state.
    pub fn can_start_resolution(self) -> bool {
        matches!(self, EventState::Detected | EventState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventState::Detected => "DETECTED",
            EventState::Resolving => "RESOLVING",
            EventState::Resolved => "RESOLVED",
            EventState::Failed => "FAILED",
        }
    }
}

impl core::fmt::Display for EventState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of an event's audit trail.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct EventStep {
    pub at_ms: i64,
    pub message: String,
}

/// Lifecycle record for one detected cycle.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct DeadlockEvent {
    pub id: String,
    pub detected_at_ms: i64,
    pub thread_set: Vec<ThreadId>,
    pub steps: Vec<EventStep>,
    pub state: EventState,
    pub resolved_at_ms: Option<i64>,
    pub resolution_method: Option<String>,
    pub total_resolution_time_ms: Option<u64>,
}

impl DeadlockEvent {
    pub fn new(id: String, thread_set: &ThreadSet, detected_at_ms: i64) -> Self {
        Self {
            id,
            detected_at_ms,
            thread_set: thread_set.iter().copied().collect(),
            steps: Vec::new(),
            state: EventState::Detected,
            resolved_at_ms: None,
            resolution_method: None,
            total_resolution_time_ms: None,
        }
    }

    pub fn add_step(&mut self, at_ms: i64, message: impl Into<String>) {
        self.steps.push(EventStep {
            at_ms,
            message: message.into(),
        });
    }

    /// Moves the event into its terminal state. No-op if already resolved.
    pub fn mark_resolved(&mut self, at_ms: i64, method: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = EventState::Resolved;
        self.resolved_at_ms = Some(at_ms);
        self.resolution_method = Some(method.into());
        self.total_resolution_time_ms = Some(at_ms.saturating_sub(self.detected_at_ms).max(0) as u64);
    }

    pub fn cycle_size(&self) -> usize {
        self.thread_set.len()
    }
}
