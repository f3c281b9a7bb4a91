//! Shared data types for lockwatch.
//!
//! Everything that crosses a crate boundary lives here: the thread snapshots
//! produced by introspection providers, the deadlock event and resolution
//! records kept by the engine, and the payloads handed to subscribers.

use std::collections::BTreeSet;

use facet::Facet;

mod api;
mod events;
mod resolution;

pub use api::*;
pub use events::*;
pub use resolution::*;

// ── Identifiers ──────────────────────────────────────────────────

/// Opaque thread handle. Ordered so that "newest" means highest id.
#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[facet(transparent)]
pub struct ThreadId(pub u64);

impl ThreadId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque lock identifier, stable for the lifetime of one snapshot.
///
/// The wrapped string doubles as the display label (e.g. `orders.table@0x3`).
#[derive(Facet, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[facet(transparent)]
pub struct LockId(pub String);

impl LockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn label(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for LockId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identity key of a deadlock event: the threads taking part in a cycle.
pub type ThreadSet = BTreeSet<ThreadId>;

// ── Thread snapshot ──────────────────────────────────────────────

/// Upper bound on the number of frames kept in [`ThreadSnapshot::stack_summary`].
pub const MAX_STACK_FRAMES: usize = 10;

/// Scheduling state of a thread at snapshot time.
#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
#[facet(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadState {
    New,
    Runnable,
    /// Waiting to enter a critical section. Interrupts are usually ignored here.
    Blocked,
    /// Parked in an interruptible wait with no deadline.
    Waiting,
    /// Parked in an interruptible wait with a deadline.
    TimedWaiting,
    Terminated,
}

impl ThreadState {
    /// Whether an interrupt is guaranteed to wake a thread in this state.
    pub fn is_waitable(self) -> bool {
        matches!(self, ThreadState::Waiting | ThreadState::TimedWaiting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThreadState::New => "NEW",
            ThreadState::Runnable => "RUNNABLE",
            ThreadState::Blocked => "BLOCKED",
            ThreadState::Waiting => "WAITING",
            ThreadState::TimedWaiting => "TIMED_WAITING",
            ThreadState::Terminated => "TERMINATED",
        }
    }
}

impl core::fmt::Display for ThreadState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one thread and the locks it holds or awaits.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct ThreadSnapshot {
    pub id: ThreadId,
    pub name: String,
    pub state: ThreadState,
    /// How long the thread has been blocked/waiting, when the provider knows.
    pub blocked_duration_ms: Option<u64>,
    pub held_locks: BTreeSet<LockId>,
    pub awaited_lock: Option<LockId>,
    /// Scheduling priority; lower means less important.
    pub priority: Option<i32>,
    /// Innermost frames first, at most [`MAX_STACK_FRAMES`].
    pub stack_summary: Vec<String>,
}

impl ThreadSnapshot {
    pub fn new(id: ThreadId, name: impl Into<String>, state: ThreadState) -> Self {
        Self {
            id,
            name: name.into(),
            state,
            blocked_duration_ms: None,
            held_locks: BTreeSet::new(),
            awaited_lock: None,
            priority: None,
            stack_summary: Vec::new(),
        }
    }

    pub fn holding(mut self, lock: impl Into<String>) -> Self {
        self.held_locks.insert(LockId::new(lock));
        self
    }

    pub fn awaiting(mut self, lock: impl Into<String>) -> Self {
        self.awaited_lock = Some(LockId::new(lock));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_blocked_duration_ms(mut self, ms: u64) -> Self {
        self.blocked_duration_ms = Some(ms);
        self
    }

    pub fn with_stack(mut self, frames: impl IntoIterator<Item = String>) -> Self {
        self.stack_summary = frames.into_iter().take(MAX_STACK_FRAMES).collect();
        self
    }
}
