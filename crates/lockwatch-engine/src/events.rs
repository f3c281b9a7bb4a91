//! Deadlock event store.
//!
//! Owns every [`DeadlockEvent`]: at most one live event per thread set, plus a
//! bounded archive of finished ones. All transitions happen inside a single
//! critical section, so readers never see a half-applied update.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use lockwatch_types::{
    DeadlockEvent, EventState, SELF_RESOLVED_METHOD, Strategy, ThreadSet,
};
use parking_lot::Mutex;

struct LiveEvent {
    seq: u64,
    event: DeadlockEvent,
    /// An automatic resolution has been scheduled since the last transition
    /// into DETECTED or FAILED.
    armed: bool,
    failed_at_ms: Option<i64>,
}

#[derive(Default)]
struct StoreInner {
    next_seq: u64,
    live: BTreeMap<ThreadSet, LiveEvent>,
    archive: VecDeque<(u64, DeadlockEvent)>,
    in_flight: HashSet<ThreadSet>,
    total_events: u64,
    resolved_events: u64,
    resolution_time_total_ms: u64,
}

impl StoreInner {
    fn live_mut(&mut self, set: &ThreadSet, event_id: &str) -> Option<&mut LiveEvent> {
        self.live.get_mut(set).filter(|l| l.event.id == event_id)
    }

    fn resolve(&mut self, set: &ThreadSet, now_ms: i64, method: &str, step: String) -> Option<DeadlockEvent> {
        let mut live = self.live.remove(set)?;
        live.event.add_step(now_ms, step);
        live.event.mark_resolved(now_ms, method);
        self.resolved_events += 1;
        self.resolution_time_total_ms += live.event.total_resolution_time_ms.unwrap_or(0);
        let event = live.event.clone();
        self.archive.push_back((live.seq, live.event));
        Some(event)
    }
}

/// Result of diffing one poll's cycles against the live events.
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub created: Vec<DeadlockEvent>,
    /// Events whose cycle vanished without a successful strategy.
    pub cleared: Vec<DeadlockEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventCounters {
    pub total_events: u64,
    pub resolved_events: u64,
    pub resolution_time_total_ms: u64,
    pub live_events: usize,
}

pub struct EventStore {
    inner: Arc<Mutex<StoreInner>>,
    archive_capacity: usize,
}

impl EventStore {
    pub fn new(archive_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner::default())),
            archive_capacity: archive_capacity.max(1),
        }
    }

    /// Apply one poll's cycle sets: open events for new sets and resolve the
    /// ones whose set is gone.
    ///
    /// A RESOLVING event whose set is gone stays live: the running ladder
    /// closes it with its own outcome.
    pub fn reconcile(&self, current: &BTreeSet<ThreadSet>, now_ms: i64) -> Reconciliation {
        let mut out = Reconciliation::default();
        let mut inner = self.inner.lock();

        let gone: Vec<ThreadSet> = inner
            .live
            .iter()
            .filter(|(set, live)| {
                !current.contains(*set) && live.event.state != EventState::Resolving
            })
            .map(|(set, _)| set.clone())
            .collect();
        for set in gone {
            if let Some(event) = inner.resolve(
                &set,
                now_ms,
                SELF_RESOLVED_METHOD,
                "Cycle no longer present; resolved externally".to_string(),
            ) {
                out.cleared.push(event);
            }
        }

        for set in current {
            if inner.live.contains_key(set) {
                continue;
            }
            inner.next_seq += 1;
            inner.total_events += 1;
            let seq = inner.next_seq;
            let mut event = DeadlockEvent::new(format!("DL-{seq}"), set, now_ms);
            event.add_step(
                now_ms,
                format!("Deadlock detected among threads [{}]", format_set(set)),
            );
            out.created.push(event.clone());
            inner.live.insert(
                set.clone(),
                LiveEvent {
                    seq,
                    event,
                    armed: false,
                    failed_at_ms: None,
                },
            );
        }

        self.trim_archive(&mut inner);
        out
    }

    /// Reserve every live event that is due for an automatic resolution.
    ///
    /// DETECTED events qualify once. FAILED events qualify again only when
    /// `retry_failed_after` is set and has elapsed since the failure. Events
    /// whose thread set is already reserved are left for a later poll.
    pub fn claim_auto_candidates(
        &self,
        now_ms: i64,
        retry_failed_after: Option<Duration>,
    ) -> Vec<(DeadlockEvent, ResolutionGuard)> {
        let mut inner = self.inner.lock();
        let mut due = Vec::new();
        for (set, live) in &inner.live {
            if live.armed || inner.in_flight.contains(set) {
                continue;
            }
            let eligible = match live.event.state {
                EventState::Detected => true,
                EventState::Failed => match (retry_failed_after, live.failed_at_ms) {
                    (Some(after), Some(failed_at)) => {
                        now_ms.saturating_sub(failed_at) >= after.as_millis() as i64
                    }
                    _ => false,
                },
                EventState::Resolving | EventState::Resolved => false,
            };
            if eligible {
                due.push(set.clone());
            }
        }

        let mut claimed = Vec::with_capacity(due.len());
        for set in due {
            inner.in_flight.insert(set.clone());
            if let Some(live) = inner.live.get_mut(&set) {
                live.armed = true;
                claimed.push((
                    live.event.clone(),
                    ResolutionGuard {
                        inner: Arc::clone(&self.inner),
                        set,
                    },
                ));
            }
        }
        claimed
    }

    /// Reserve a thread set for one resolution run. `None` while another run
    /// holds it.
    pub fn try_reserve(&self, set: &ThreadSet) -> Option<ResolutionGuard> {
        let mut inner = self.inner.lock();
        if !inner.in_flight.insert(set.clone()) {
            return None;
        }
        Some(ResolutionGuard {
            inner: Arc::clone(&self.inner),
            set: set.clone(),
        })
    }

    pub fn is_reserved(&self, set: &ThreadSet) -> bool {
        self.inner.lock().in_flight.contains(set)
    }

    /// Move a DETECTED or FAILED event to RESOLVING.
    pub fn begin_resolution(
        &self,
        set: &ThreadSet,
        event_id: &str,
        now_ms: i64,
        step: impl Into<String>,
    ) -> Option<DeadlockEvent> {
        let mut inner = self.inner.lock();
        let live = inner.live_mut(set, event_id)?;
        if !live.event.state.can_start_resolution() {
            return None;
        }
        live.event.state = EventState::Resolving;
        live.event.add_step(now_ms, step);
        Some(live.event.clone())
    }

    /// Make a DETECTED or FAILED event eligible for automatic resolution
    /// again. Used when a scheduled run gave up before starting.
    pub fn disarm(&self, set: &ThreadSet, event_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(live) = inner.live_mut(set, event_id) {
            if live.event.state.can_start_resolution() {
                live.armed = false;
            }
        }
    }

    /// Append an audit step to a live event. Ignored if the event is gone.
    pub fn record_step(&self, set: &ThreadSet, event_id: &str, now_ms: i64, step: impl Into<String>) {
        let mut inner = self.inner.lock();
        if let Some(live) = inner.live_mut(set, event_id) {
            live.event.add_step(now_ms, step);
        }
    }

    /// RESOLVING → RESOLVED after a strategy succeeded. The event is archived.
    ///
    /// Returns `None` when the event already left RESOLVING, e.g. because the
    /// target was lost while the run was in flight.
    pub fn finish_resolved(
        &self,
        set: &ThreadSet,
        event_id: &str,
        method: Strategy,
        now_ms: i64,
    ) -> Option<DeadlockEvent> {
        let mut inner = self.inner.lock();
        if inner.live_mut(set, event_id)?.event.state != EventState::Resolving {
            return None;
        }
        let event = inner.resolve(set, now_ms, method.as_str(), format!("Resolved by {method}"));
        self.trim_archive(&mut inner);
        event
    }

    /// RESOLVING → FAILED. The event stays live.
    pub fn finish_failed(
        &self,
        set: &ThreadSet,
        event_id: &str,
        now_ms: i64,
        detail: impl Into<String>,
    ) -> Option<DeadlockEvent> {
        let mut inner = self.inner.lock();
        let live = inner.live_mut(set, event_id)?;
        if live.event.state != EventState::Resolving {
            return None;
        }
        live.event.state = EventState::Failed;
        live.event.add_step(now_ms, detail);
        live.armed = false;
        live.failed_at_ms = Some(now_ms);
        Some(live.event.clone())
    }

    /// Fail every live event and clear the live set. Used when the target is lost.
    pub fn fail_all(&self, now_ms: i64, detail: &str) -> Vec<DeadlockEvent> {
        let mut inner = self.inner.lock();
        let live = std::mem::take(&mut inner.live);
        let mut failed = Vec::with_capacity(live.len());
        for (_, mut entry) in live {
            entry.event.state = EventState::Failed;
            entry.event.add_step(now_ms, detail);
            failed.push(entry.event.clone());
            inner.archive.push_back((entry.seq, entry.event));
        }
        self.trim_archive(&mut inner);
        failed
    }

    /// Live events, oldest first.
    pub fn live_events(&self) -> Vec<DeadlockEvent> {
        let inner = self.inner.lock();
        let mut live: Vec<(u64, DeadlockEvent)> = inner
            .live
            .values()
            .map(|l| (l.seq, l.event.clone()))
            .collect();
        live.sort_by_key(|(seq, _)| *seq);
        live.into_iter().map(|(_, e)| e).collect()
    }

    /// Live and archived events, newest first.
    pub fn events(&self) -> Vec<DeadlockEvent> {
        let inner = self.inner.lock();
        let mut all: Vec<(u64, DeadlockEvent)> = inner
            .live
            .values()
            .map(|l| (l.seq, l.event.clone()))
            .chain(inner.archive.iter().cloned())
            .collect();
        all.sort_by(|a, b| b.0.cmp(&a.0));
        all.into_iter().map(|(_, e)| e).collect()
    }

    pub fn counters(&self) -> EventCounters {
        let inner = self.inner.lock();
        EventCounters {
            total_events: inner.total_events,
            resolved_events: inner.resolved_events,
            resolution_time_total_ms: inner.resolution_time_total_ms,
            live_events: inner.live.len(),
        }
    }

    fn trim_archive(&self, inner: &mut StoreInner) {
        while inner.archive.len() > self.archive_capacity {
            inner.archive.pop_front();
        }
    }
}

/// Exclusive claim on resolving one thread set. Released on drop.
pub struct ResolutionGuard {
    inner: Arc<Mutex<StoreInner>>,
    set: ThreadSet,
}

impl ResolutionGuard {
    pub fn thread_set(&self) -> &ThreadSet {
        &self.set
    }
}

impl Drop for ResolutionGuard {
    fn drop(&mut self) {
        self.inner.lock().in_flight.remove(&self.set);
    }
}

impl core::fmt::Debug for ResolutionGuard {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResolutionGuard").field("set", &self.set).finish()
    }
}

pub(crate) fn format_set(set: &ThreadSet) -> String {
    set.iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use lockwatch_types::ThreadId;

    use super::*;

    fn set(ids: &[u64]) -> ThreadSet {
        ids.iter().map(|&i| ThreadId(i)).collect()
    }

    fn cycles(sets: &[&[u64]]) -> BTreeSet<ThreadSet> {
        sets.iter().map(|ids| set(ids)).collect()
    }

    #[test]
    fn new_cycle_opens_one_event() {
        let store = EventStore::new(10);
        let first = store.reconcile(&cycles(&[&[1, 2]]), 1_000);
        assert_eq!(first.created.len(), 1);
        assert_eq!(first.created[0].id, "DL-1");
        assert_eq!(first.created[0].state, EventState::Detected);
        assert_eq!(first.created[0].steps.len(), 1);

        let again = store.reconcile(&cycles(&[&[1, 2]]), 3_000);
        assert!(again.created.is_empty());
        assert!(again.cleared.is_empty());
        assert_eq!(store.counters().total_events, 1);
    }

    #[test]
    fn vanished_cycle_resolves_externally() {
        let store = EventStore::new(10);
        store.reconcile(&cycles(&[&[10, 20]]), 1_000);
        let out = store.reconcile(&BTreeSet::new(), 4_000);

        assert_eq!(out.cleared.len(), 1);
        let event = &out.cleared[0];
        assert_eq!(event.state, EventState::Resolved);
        assert_eq!(event.resolution_method.as_deref(), Some(SELF_RESOLVED_METHOD));
        assert_eq!(event.total_resolution_time_ms, Some(3_000));
        assert!(store.live_events().is_empty());

        let counters = store.counters();
        assert_eq!(counters.resolved_events, 1);
        assert_eq!(counters.resolution_time_total_ms, 3_000);
    }

    #[test]
    fn redetection_after_resolution_opens_a_new_event() {
        let store = EventStore::new(10);
        let first = store.reconcile(&cycles(&[&[1, 2]]), 0);
        let set12 = set(&[1, 2]);
        let id = first.created[0].id.clone();

        store.begin_resolution(&set12, &id, 10, "start").unwrap();
        store
            .finish_resolved(&set12, &id, Strategy::SmartInterruption, 20)
            .unwrap();

        let second = store.reconcile(&cycles(&[&[1, 2]]), 30);
        assert_eq!(second.created.len(), 1);
        assert_ne!(second.created[0].id, id);

        let all = store.events();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second.created[0].id);
        assert_eq!(all[1].resolution_method.as_deref(), Some("SMART_INTERRUPTION"));
    }

    #[test]
    fn guard_blocks_second_reservation_until_dropped() {
        let store = EventStore::new(10);
        let s = set(&[1, 2]);
        let guard = store.try_reserve(&s).unwrap();
        assert!(store.try_reserve(&s).is_none());
        assert!(store.is_reserved(&s));
        drop(guard);
        assert!(store.try_reserve(&s).is_some());
    }

    #[test]
    fn detected_events_are_claimed_once() {
        let store = EventStore::new(10);
        store.reconcile(&cycles(&[&[1, 2], &[3, 4]]), 0);

        let claimed = store.claim_auto_candidates(0, None);
        assert_eq!(claimed.len(), 2);
        drop(claimed);
        assert!(store.claim_auto_candidates(100, None).is_empty());
    }

    #[test]
    fn failed_events_retry_only_with_policy() {
        let store = EventStore::new(10);
        let created = store.reconcile(&cycles(&[&[1, 2]]), 0).created;
        let s = set(&[1, 2]);
        let id = created[0].id.clone();

        let claimed = store.claim_auto_candidates(0, None);
        assert_eq!(claimed.len(), 1);
        store.begin_resolution(&s, &id, 10, "start").unwrap();
        store.finish_failed(&s, &id, 20, "strategy ladder exhausted").unwrap();
        drop(claimed);

        assert!(store.claim_auto_candidates(60_000, None).is_empty());

        let retry = Some(Duration::from_millis(1_000));
        assert!(store.claim_auto_candidates(500, retry).is_empty());
        assert_eq!(store.claim_auto_candidates(1_020, retry).len(), 1);
    }

    #[test]
    fn vanished_cycle_under_resolution_keeps_the_winning_strategy() {
        let store = EventStore::new(10);
        let created = store.reconcile(&cycles(&[&[5, 6]]), 0).created;
        let s = set(&[5, 6]);
        let id = created[0].id.clone();

        store.begin_resolution(&s, &id, 1, "start").unwrap();
        let out = store.reconcile(&BTreeSet::new(), 2);
        assert!(out.cleared.is_empty());
        assert_eq!(store.live_events()[0].state, EventState::Resolving);

        let event = store
            .finish_resolved(&s, &id, Strategy::SmartInterruption, 3)
            .unwrap();
        assert_eq!(event.resolution_method.as_deref(), Some("SMART_INTERRUPTION"));
        assert!(store.live_events().is_empty());
    }

    #[test]
    fn late_finish_after_target_loss_is_ignored() {
        let store = EventStore::new(10);
        let created = store.reconcile(&cycles(&[&[5, 6]]), 0).created;
        let s = set(&[5, 6]);
        let id = created[0].id.clone();

        store.begin_resolution(&s, &id, 1, "start").unwrap();
        store.fail_all(2, "target unreachable");

        assert!(store.finish_resolved(&s, &id, Strategy::ForceInterruption, 3).is_none());
        assert!(store.finish_failed(&s, &id, 3, "late").is_none());
        assert_eq!(store.counters().resolved_events, 0);
    }

    #[test]
    fn disarmed_event_is_claimed_again() {
        let store = EventStore::new(10);
        let created = store.reconcile(&cycles(&[&[1, 2]]), 0).created;
        let s = set(&[1, 2]);

        let claimed = store.claim_auto_candidates(0, None);
        assert_eq!(claimed.len(), 1);
        store.disarm(&s, &created[0].id);
        assert!(store.claim_auto_candidates(1, None).is_empty(), "still reserved");

        drop(claimed);
        assert_eq!(store.claim_auto_candidates(2, None).len(), 1);
    }

    #[test]
    fn resolving_cannot_restart() {
        let store = EventStore::new(10);
        let created = store.reconcile(&cycles(&[&[1, 2]]), 0).created;
        let s = set(&[1, 2]);
        let id = created[0].id.clone();
        assert!(store.begin_resolution(&s, &id, 1, "start").is_some());
        assert!(store.begin_resolution(&s, &id, 2, "again").is_none());
    }

    #[test]
    fn fail_all_clears_live_set() {
        let store = EventStore::new(10);
        store.reconcile(&cycles(&[&[1, 2], &[3, 4]]), 0);
        let failed = store.fail_all(5, "target unreachable");
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|e| e.state == EventState::Failed));
        assert!(failed
            .iter()
            .all(|e| e.steps.last().unwrap().message == "target unreachable"));
        assert!(store.live_events().is_empty());
        assert_eq!(store.events().len(), 2);
    }

    #[test]
    fn archive_is_bounded() {
        let store = EventStore::new(3);
        for i in 0..5u64 {
            store.reconcile(&cycles(&[&[i * 2, i * 2 + 1]]), i as i64);
        }
        store.reconcile(&BTreeSet::new(), 10);
        let events = store.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].id, "DL-5");
        assert_eq!(store.counters().total_events, 5);
    }
}
