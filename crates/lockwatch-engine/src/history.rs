use std::collections::{BTreeMap, VecDeque};

use lockwatch_types::{AttemptOutcome, MethodCount, ResolutionAttempt, Strategy, ThreadId};
use parking_lot::Mutex;

/// Everything about an attempt except its id.
#[derive(Debug, Clone)]
pub struct AttemptDraft {
    pub event_id: String,
    pub timestamp_ms: i64,
    pub method: Strategy,
    pub affected_threads: Vec<ThreadId>,
    pub outcome: AttemptOutcome,
    pub detail: String,
    pub duration_ms: u64,
}

#[derive(Default)]
struct HistoryInner {
    next_id: u64,
    attempts: VecDeque<ResolutionAttempt>,
    total_attempts: u64,
    successes_by_method: BTreeMap<Strategy, u64>,
}

/// Bounded FIFO log of resolution attempts.
///
/// Lifetime counters survive eviction; only the attempt records are bounded.
pub struct History {
    inner: Mutex<HistoryInner>,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HistoryInner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Assign an id, append, and evict the oldest record past capacity.
    pub fn record(&self, draft: AttemptDraft) -> ResolutionAttempt {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let attempt = ResolutionAttempt {
            id: format!("RES-{}", inner.next_id),
            event_id: draft.event_id,
            timestamp_ms: draft.timestamp_ms,
            method: draft.method,
            affected_threads: draft.affected_threads,
            outcome: draft.outcome,
            detail: draft.detail,
            duration_ms: draft.duration_ms,
        };

        inner.total_attempts += 1;
        if attempt.outcome.counts_as_success() {
            *inner.successes_by_method.entry(attempt.method).or_default() += 1;
        }
        inner.attempts.push_back(attempt.clone());
        while inner.attempts.len() > self.capacity {
            inner.attempts.pop_front();
        }
        attempt
    }

    /// Up to `limit` attempts, most recent first.
    pub fn recent(&self, limit: usize) -> Vec<ResolutionAttempt> {
        self.inner
            .lock()
            .attempts
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_attempts(&self) -> u64 {
        self.inner.lock().total_attempts
    }

    /// Successful or partial attempts per strategy, in ladder order.
    pub fn method_counts(&self) -> Vec<MethodCount> {
        let inner = self.inner.lock();
        Strategy::LADDER
            .iter()
            .map(|&method| MethodCount {
                method,
                count: inner.successes_by_method.get(&method).copied().unwrap_or(0),
            })
            .collect()
    }
}
