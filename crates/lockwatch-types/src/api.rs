use facet::Facet;

use crate::{AttemptOutcome, EventState, ResolutionAttempt, Strategy, ThreadId, ThreadState};

// ── Snapshot payload ─────────────────────────────────────────────

/// Response for `get_snapshot`, and the body of `Notification::Snapshot`.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct SnapshotPayload {
    /// Wall-clock milliseconds (Unix epoch) when the snapshot was taken.
    pub timestamp_ms: i64,
    pub detected: bool,
    pub threads: Vec<ThreadView>,
    pub locks: Vec<LockView>,
    pub edges: Vec<EdgeView>,
    /// Each cycle starts at its minimum thread id.
    pub cycles: Vec<Vec<ThreadId>>,
}

impl SnapshotPayload {
    /// The "all clear" payload used when no snapshot is available.
    pub fn empty(timestamp_ms: i64) -> Self {
        Self {
            timestamp_ms,
            detected: false,
            threads: Vec::new(),
            locks: Vec::new(),
            edges: Vec::new(),
            cycles: Vec::new(),
        }
    }
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct ThreadView {
    pub id: ThreadId,
    pub name: String,
    pub state: ThreadState,
    pub deadlocked: bool,
    pub blocked_duration_ms: Option<u64>,
    pub stack_summary: Vec<String>,
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct LockView {
    pub id: String,
    pub label: String,
}

#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
#[facet(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    /// lock → thread
    Holds,
    /// thread → lock
    Awaits,
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct EdgeView {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
}

// ── Statistics ───────────────────────────────────────────────────

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct MethodCount {
    pub method: Strategy,
    pub count: u64,
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct Statistics {
    /// Resolved events / total events × 100. Zero when no events exist.
    pub success_rate: f64,
    pub avg_resolution_time_ms: f64,
    /// Successful (or partial) attempts per strategy, in ladder order.
    pub method_counts: Vec<MethodCount>,
    pub active_cycles: u32,
    pub total_events: u64,
    pub resolved_events: u64,
    pub total_attempts: u64,
    pub auto_resolution_enabled: bool,
}

// ── Control responses ────────────────────────────────────────────

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct AutoResolutionAck {
    pub auto_resolution_enabled: bool,
    pub message: String,
    pub timestamp_ms: i64,
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct ManualResolutionResponse {
    pub success: bool,
    pub message: String,
    pub affected_thread_count: u32,
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct InterruptResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct TargetInfo {
    pub monitoring: bool,
    pub target: Option<String>,
    pub can_interrupt: bool,
}

// ── Notifications ────────────────────────────────────────────────

/// Progress of one resolution attempt, or the final outcome of a ladder run.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct ResolutionUpdate {
    pub event_id: String,
    pub event_state: EventState,
    pub attempt: Option<ResolutionAttempt>,
    pub outcome: Option<AttemptOutcome>,
    pub message: String,
    pub timestamp_ms: i64,
}

/// Message pushed to subscribers.
#[derive(Facet, Clone, Debug, PartialEq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum Notification {
    Snapshot { payload: SnapshotPayload },
    ResolutionUpdate { payload: ResolutionUpdate },
    ConfigChange { payload: AutoResolutionAck },
    TargetChange { payload: TargetInfo },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Snapshot { .. } => "SNAPSHOT",
            Notification::ResolutionUpdate { .. } => "RESOLUTION_UPDATE",
            Notification::ConfigChange { .. } => "CONFIG_CHANGE",
            Notification::TargetChange { .. } => "TARGET_CHANGE",
        }
    }
}
