//! The monitor: periodic driver and the operator-facing API.
//!
//! One tick polls the attached target, rebuilds the wait-for graph, diffs the
//! detected cycles against the event store, and schedules automatic
//! resolution for new cycles. Resolution runs on its own tasks; the tick never
//! waits for them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use lockwatch_types::{
    AutoResolutionAck, DeadlockEvent, InterruptResponse, ManualResolutionResponse, Notification,
    ResolutionAttempt, ResolutionUpdate, SnapshotPayload, Statistics, TargetInfo, ThreadId,
    ThreadSet, ThreadSnapshot,
};
use lockwatch_waitgraph::detect::{self, Cycle};
use lockwatch_waitgraph::{BuildError, WaitForGraph};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventStore, format_set};
use crate::history::History;
use crate::strategy::{LadderOutcome, LadderRun, StrategyEngine};
use crate::time::now_ms;
use crate::{Capabilities, ControlError, IntrospectionProvider, MonitorConfig, NotificationSink};

pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Clone)]
struct Target {
    generation: u64,
    provider: Arc<dyn IntrospectionProvider>,
    label: String,
    capabilities: Capabilities,
    /// Cancelled when the target is detached or lost.
    token: CancellationToken,
}

struct ViewState {
    snapshot: SnapshotPayload,
    /// `(detected, thread count)` of the last published snapshot.
    last_published: Option<(bool, usize)>,
}

struct Shared {
    config: MonitorConfig,
    events: EventStore,
    history: History,
    strategy: StrategyEngine,
    sink: Arc<dyn NotificationSink>,
    auto_resolution: AtomicBool,
    generations: AtomicU64,
    target: Mutex<Option<Target>>,
    view: Mutex<ViewState>,
}

/// Deadlock monitor. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<Shared>,
}

impl Monitor {
    pub fn new(config: MonitorConfig, sink: Arc<dyn NotificationSink>) -> Self {
        let inner = Shared {
            events: EventStore::new(config.event_archive_capacity),
            history: History::new(config.history_capacity),
            strategy: StrategyEngine::new(config.settle_window),
            auto_resolution: AtomicBool::new(config.auto_resolution),
            generations: AtomicU64::new(0),
            target: Mutex::new(None),
            view: Mutex::new(ViewState {
                snapshot: SnapshotPayload::empty(now_ms()),
                last_published: None,
            }),
            sink,
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    // ── Target selection ────────────────────────────────────────

    /// Start monitoring `provider`, replacing any current target.
    pub fn attach(&self, provider: Arc<dyn IntrospectionProvider>) -> TargetInfo {
        let target = Target {
            generation: self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1,
            label: provider.describe(),
            capabilities: provider.capabilities(),
            provider,
            token: CancellationToken::new(),
        };
        info!(
            target = %target.label,
            can_interrupt = target.capabilities.can_interrupt,
            "attached monitoring target"
        );

        let previous = self.inner.target.lock().replace(target);
        if let Some(previous) = previous {
            previous.token.cancel();
            self.fail_live("monitoring target changed");
        }
        self.inner.view.lock().last_published = None;

        let info = self.current_target();
        self.publish(Notification::TargetChange {
            payload: info.clone(),
        });
        info
    }

    /// Stop monitoring. Live events are failed and the snapshot is cleared.
    pub fn detach(&self) -> TargetInfo {
        let previous = self.inner.target.lock().take();
        if let Some(previous) = previous {
            info!(target = %previous.label, "detached monitoring target");
            previous.token.cancel();
            self.fail_live("monitoring stopped");
            self.store_snapshot(SnapshotPayload::empty(now_ms()), true);
        }

        let info = self.current_target();
        self.publish(Notification::TargetChange {
            payload: info.clone(),
        });
        info
    }

    pub fn current_target(&self) -> TargetInfo {
        match self.inner.target.lock().as_ref() {
            Some(target) => TargetInfo {
                monitoring: true,
                target: Some(target.label.clone()),
                can_interrupt: target.capabilities.can_interrupt,
            },
            None => TargetInfo {
                monitoring: false,
                target: None,
                can_interrupt: false,
            },
        }
    }

    fn current(&self) -> Option<Target> {
        self.inner.target.lock().clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner
            .target
            .lock()
            .as_ref()
            .is_some_and(|t| t.generation == generation)
    }

    /// Drop a target that stopped answering. No reconnect is attempted.
    fn lose_target(&self, generation: u64, reason: &str) {
        let lost = {
            let mut slot = self.inner.target.lock();
            if slot.as_ref().is_some_and(|t| t.generation == generation) {
                slot.take()
            } else {
                None
            }
        };
        let Some(lost) = lost else {
            return;
        };

        warn!(target = %lost.label, %reason, "monitoring target unreachable, detaching");
        lost.token.cancel();
        self.fail_live("target unreachable");
        self.store_snapshot(SnapshotPayload::empty(now_ms()), true);
        self.publish(Notification::TargetChange {
            payload: self.current_target(),
        });
    }

    fn fail_live(&self, detail: &str) {
        for event in self.inner.events.fail_all(now_ms(), detail) {
            self.publish_event(&event, detail);
        }
    }

    // ── Scheduling ──────────────────────────────────────────────

    /// Run the poll loop until `shutdown` fires.
    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move { monitor.run(shutdown).await })
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let period = self.inner.config.poll_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = period.as_millis() as u64, "monitor started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick(),
            }
        }

        self.detach();
        info!("monitor stopped");
    }

    /// One poll. A no-op without a target. Must be called inside a tokio runtime.
    pub fn tick(&self) {
        let Some(target) = self.current() else {
            return;
        };
        if !self.refresh(&target) {
            return;
        }
        if self.auto_resolution_enabled() {
            self.schedule_auto(&target);
        }
    }

    /// Snapshot, detect, and reconcile. `false` if the target was lost.
    fn refresh(&self, target: &Target) -> bool {
        let now = now_ms();
        let threads = match target.provider.snapshot() {
            Ok(threads) => threads,
            Err(err) => {
                self.lose_target(target.generation, &err.to_string());
                return false;
            }
        };
        if !self.is_current(target.generation) {
            return false;
        }

        match analyze(&threads, now) {
            Ok(analysis) => {
                let diff = self.inner.events.reconcile(&analysis.sets, now);
                for event in &diff.created {
                    warn!(
                        event = %event.id,
                        threads = %format_set(&guard_set(event)),
                        "deadlock detected"
                    );
                    self.publish_event(event, "Deadlock detected");
                }
                for event in &diff.cleared {
                    info!(event = %event.id, "deadlock cleared without intervention");
                    self.publish_event(event, "Cycle no longer present; resolved externally");
                }
                self.store_snapshot(analysis.payload, false);
            }
            Err(err) => {
                warn!(%err, "could not analyze snapshot, reporting no deadlock");
                self.store_snapshot(SnapshotPayload::empty(now), false);
            }
        }
        true
    }

    fn schedule_auto(&self, target: &Target) {
        let claimed = self
            .inner
            .events
            .claim_auto_candidates(now_ms(), self.inner.config.retry_failed_after);

        for (event, guard) in claimed {
            let monitor = self.clone();
            let target = target.clone();
            let cancel = target.token.child_token();
            let delay = self.inner.config.observation_delay;
            debug!(event = %event.id, delay_ms = delay.as_millis() as u64, "scheduling resolution");

            tokio::spawn(async move {
                let _guard = guard;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                let set = guard_set(&event);
                if !monitor.auto_resolution_enabled() {
                    debug!(event = %event.id, "auto-resolution turned off during observation delay");
                    monitor.inner.events.disarm(&set, &event.id);
                    return;
                }
                monitor.resolve(&target, &event.id, &set, &cancel).await;
            });
        }
    }

    /// Run the ladder against one live event. Caller holds the set's guard.
    ///
    /// Returns `true` when a strategy resolved the cycle. A run that gives up
    /// before the event reaches RESOLVING leaves it eligible for the next poll.
    async fn resolve(
        &self,
        target: &Target,
        event_id: &str,
        set: &ThreadSet,
        cancel: &CancellationToken,
    ) -> bool {
        let threads = match target.provider.snapshot() {
            Ok(threads) => threads,
            Err(err) => {
                self.lose_target(target.generation, &err.to_string());
                return false;
            }
        };
        let still_deadlocked = analyze(&threads, now_ms())
            .map(|a| a.sets.contains(set))
            .unwrap_or(false);
        if !still_deadlocked {
            debug!(event = event_id, "cycle not confirmed before resolution started");
            self.inner.events.disarm(set, event_id);
            return false;
        }

        let members: Vec<ThreadSnapshot> = threads
            .into_iter()
            .filter(|t| set.contains(&t.id))
            .collect();
        let Some(event) = self.inner.events.begin_resolution(
            set,
            event_id,
            now_ms(),
            format!("Resolution started on {} threads", members.len()),
        ) else {
            self.inner.events.disarm(set, event_id);
            return false;
        };
        self.publish_event(&event, "Resolution started");

        // The deadline cancels the ladder instead of dropping it, so the rung
        // in progress still records its attempt.
        let run_cancel = cancel.child_token();
        let deadline_timer = {
            let token = run_cancel.clone();
            let deadline = self.inner.config.resolution_deadline;
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                token.cancel();
            })
        };
        let run = LadderRun {
            event_id,
            members: &members,
            provider: target.provider.as_ref(),
            history: &self.inner.history,
            sink: self.inner.sink.as_ref(),
            cancel: &run_cancel,
        };
        let outcome = self.inner.strategy.run(&run).await;
        deadline_timer.abort();
        let overran = run_cancel.is_cancelled() && !cancel.is_cancelled();

        match outcome {
            LadderOutcome::Resolved(strategy) => {
                let Some(event) = self
                    .inner
                    .events
                    .finish_resolved(set, event_id, strategy, now_ms())
                else {
                    return false;
                };
                info!(event = event_id, %strategy, "deadlock resolved");
                self.publish_event(&event, format!("Resolved by {strategy}"));
                true
            }
            LadderOutcome::Exhausted => {
                warn!(event = event_id, "all strategies failed");
                self.finish_failed(set, event_id, "strategy ladder exhausted");
                false
            }
            LadderOutcome::Unsupported => {
                self.finish_failed(
                    set,
                    event_id,
                    "thread control unsupported by target; remaining strategies skipped",
                );
                false
            }
            LadderOutcome::Deferred { waitable } => {
                info!(event = event_id, waitable, "remote target, deferring to target recovery");
                self.finish_failed(set, event_id, "deferred to target recovery");
                false
            }
            LadderOutcome::Unreachable(reason) => {
                self.lose_target(target.generation, &reason);
                false
            }
            LadderOutcome::Cancelled if overran => {
                warn!(event = event_id, "resolution deadline exceeded");
                self.finish_failed(set, event_id, "resolution deadline exceeded");
                false
            }
            LadderOutcome::Cancelled => {
                self.finish_failed(set, event_id, "resolution cancelled");
                false
            }
        }
    }

    fn finish_failed(&self, set: &ThreadSet, event_id: &str, detail: &str) {
        if let Some(event) = self.inner.events.finish_failed(set, event_id, now_ms(), detail) {
            self.publish_event(&event, detail);
        }
    }

    // ── Operator API ────────────────────────────────────────────

    pub fn get_snapshot(&self) -> SnapshotPayload {
        self.inner.view.lock().snapshot.clone()
    }

    /// Most recent attempts first.
    pub fn get_history(&self, limit: usize) -> Vec<ResolutionAttempt> {
        self.inner.history.recent(limit)
    }

    pub fn get_statistics(&self) -> Statistics {
        let counters = self.inner.events.counters();
        let success_rate = if counters.total_events == 0 {
            0.0
        } else {
            counters.resolved_events as f64 / counters.total_events as f64 * 100.0
        };
        let avg_resolution_time_ms = if counters.resolved_events == 0 {
            0.0
        } else {
            counters.resolution_time_total_ms as f64 / counters.resolved_events as f64
        };

        Statistics {
            success_rate,
            avg_resolution_time_ms,
            method_counts: self.inner.history.method_counts(),
            active_cycles: counters.live_events.min(u32::MAX as usize) as u32,
            total_events: counters.total_events,
            resolved_events: counters.resolved_events,
            total_attempts: self.inner.history.total_attempts(),
            auto_resolution_enabled: self.auto_resolution_enabled(),
        }
    }

    /// Live and archived deadlock events, newest first.
    pub fn events(&self) -> Vec<DeadlockEvent> {
        self.inner.events.events()
    }

    pub fn auto_resolution_enabled(&self) -> bool {
        self.inner.auto_resolution.load(Ordering::SeqCst)
    }

    pub fn set_auto_resolution(&self, enabled: bool) -> AutoResolutionAck {
        self.inner.auto_resolution.store(enabled, Ordering::SeqCst);
        self.announce_auto_resolution(enabled)
    }

    pub fn toggle_auto_resolution(&self) -> AutoResolutionAck {
        let previous = self.inner.auto_resolution.fetch_xor(true, Ordering::SeqCst);
        self.announce_auto_resolution(!previous)
    }

    fn announce_auto_resolution(&self, enabled: bool) -> AutoResolutionAck {
        info!(enabled, "auto-resolution changed");
        let ack = AutoResolutionAck {
            auto_resolution_enabled: enabled,
            message: if enabled {
                "Auto-resolution enabled".to_string()
            } else {
                "Auto-resolution disabled".to_string()
            },
            timestamp_ms: now_ms(),
        };
        self.publish(Notification::ConfigChange {
            payload: ack.clone(),
        });
        ack
    }

    /// Run the full ladder now against every live cycle not already being
    /// resolved, skipping the observation delay.
    pub async fn trigger_manual_resolution(&self) -> ManualResolutionResponse {
        let Some(target) = self.current() else {
            return manual_response(false, "No monitoring target attached", 0);
        };
        if !self.refresh(&target) {
            return manual_response(false, "Monitoring target unreachable", 0);
        }

        let live = self.inner.events.live_events();
        if live.is_empty() {
            return manual_response(false, "No active deadlock detected", 0);
        }
        info!(cycles = live.len(), "manual resolution requested");

        let mut resolved = 0usize;
        let mut affected = 0usize;
        let mut busy = 0usize;
        for event in &live {
            let set = guard_set(event);
            if !event.state.can_start_resolution() {
                busy += 1;
                continue;
            }
            let Some(_guard) = self.inner.events.try_reserve(&set) else {
                busy += 1;
                continue;
            };
            let cancel = target.token.child_token();
            if self.resolve(&target, &event.id, &set, &cancel).await {
                resolved += 1;
                affected += event.cycle_size();
            }
        }

        if resolved > 0 {
            manual_response(
                true,
                &format!("Resolved {resolved} of {} deadlocks", live.len()),
                affected,
            )
        } else if busy == live.len() {
            manual_response(false, "Resolution already in progress", 0)
        } else {
            manual_response(false, "No strategy resolved the deadlock", 0)
        }
    }

    /// Interrupt one thread directly, bypassing the ladder.
    pub fn interrupt_thread(&self, thread: ThreadId) -> InterruptResponse {
        let Some(target) = self.current() else {
            return InterruptResponse {
                success: false,
                message: "No monitoring target attached".to_string(),
            };
        };
        match target.provider.interrupt(thread) {
            Ok(()) => {
                info!(%thread, "thread interrupted on request");
                InterruptResponse {
                    success: true,
                    message: format!("Interrupted thread {thread}"),
                }
            }
            Err(err) => {
                warn!(%thread, %err, "requested interrupt failed");
                if let ControlError::Unreachable(reason) = &err {
                    self.lose_target(target.generation, reason);
                }
                InterruptResponse {
                    success: false,
                    message: format!("Could not interrupt thread {thread}: {err}"),
                }
            }
        }
    }

    // ── Publishing ──────────────────────────────────────────────

    fn publish(&self, notification: Notification) {
        self.inner.sink.publish(notification);
    }

    fn publish_event(&self, event: &DeadlockEvent, message: impl Into<String>) {
        self.publish(Notification::ResolutionUpdate {
            payload: ResolutionUpdate {
                event_id: event.id.clone(),
                event_state: event.state,
                attempt: None,
                outcome: None,
                message: message.into(),
                timestamp_ms: now_ms(),
            },
        });
    }

    /// Keep `payload` as the current snapshot; publish it if detection status
    /// or thread count changed since the last publication.
    fn store_snapshot(&self, payload: SnapshotPayload, force: bool) {
        let key = (payload.detected, payload.threads.len());
        let publish = {
            let mut view = self.inner.view.lock();
            let changed = force || view.last_published != Some(key);
            if changed {
                view.last_published = Some(key);
            }
            view.snapshot = payload.clone();
            changed
        };
        if publish {
            self.publish(Notification::Snapshot { payload });
        }
    }
}

fn guard_set(event: &DeadlockEvent) -> ThreadSet {
    event.thread_set.iter().copied().collect()
}

fn manual_response(success: bool, message: &str, affected: usize) -> ManualResolutionResponse {
    ManualResolutionResponse {
        success,
        message: message.to_string(),
        affected_thread_count: affected.min(u32::MAX as usize) as u32,
    }
}

// ── Analysis ────────────────────────────────────────────────────

struct Analysis {
    payload: SnapshotPayload,
    sets: BTreeSet<ThreadSet>,
}

fn analyze(threads: &[ThreadSnapshot], now: i64) -> Result<Analysis, BuildError> {
    let graph = WaitForGraph::build(threads)?;
    let cycles = detect::find_cycles(&graph);
    let deadlocked = detect::deadlocked_threads(&cycles);

    let payload = SnapshotPayload {
        timestamp_ms: now,
        detected: !cycles.is_empty(),
        threads: graph.thread_views(&deadlocked),
        locks: graph.lock_views(),
        edges: graph.edge_views(),
        cycles: cycles.iter().map(|c| c.threads().to_vec()).collect(),
    };
    let sets = cycles.iter().map(Cycle::thread_set).collect();
    Ok(Analysis { payload, sets })
}

// ── Tests ───────────────────────────────────────────────────────
