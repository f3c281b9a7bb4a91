//! The resolution ladder.
//!
//! Each rung picks a victim (or all members) from the cycle and asks the
//! provider to interrupt it. The first rung that gets an interrupt through
//! ends the run. Every rung that actually runs is recorded in [`History`] and
//! announced to the sink, whatever its outcome.

use std::cmp::Reverse;
use std::time::{Duration, Instant};

use lockwatch_types::{
    AttemptOutcome, EventState, Notification, ResolutionAttempt, ResolutionUpdate, Strategy,
    ThreadId, ThreadSnapshot, ThreadState,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::history::{AttemptDraft, History};
use crate::time::{duration_ms, now_ms};
use crate::{ControlError, IntrospectionProvider, NotificationSink};

/// Inputs of one ladder run.
pub struct LadderRun<'a> {
    pub event_id: &'a str,
    /// Snapshots of the cycle's threads, taken just before the run.
    pub members: &'a [ThreadSnapshot],
    pub provider: &'a dyn IntrospectionProvider,
    pub history: &'a History,
    pub sink: &'a dyn NotificationSink,
    pub cancel: &'a CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LadderOutcome {
    Resolved(Strategy),
    /// Every rung ran and none got through.
    Exhausted,
    /// The target cannot interrupt threads; remaining rungs were skipped.
    Unsupported,
    /// Remote target: the cycle was classified, nothing was interrupted.
    Deferred { waitable: usize },
    Unreachable(String),
    Cancelled,
}

enum Rung {
    Succeeded,
    Failed,
    Stop,
    Abort(String),
    Cancelled,
}

pub struct StrategyEngine {
    settle_window: Duration,
}

impl StrategyEngine {
    pub fn new(settle_window: Duration) -> Self {
        Self { settle_window }
    }

    pub async fn run(&self, run: &LadderRun<'_>) -> LadderOutcome {
        if !run.provider.capabilities().can_interrupt {
            return self.classify_only(run);
        }

        for strategy in Strategy::LADDER {
            if run.cancel.is_cancelled() {
                return LadderOutcome::Cancelled;
            }

            let rung = if strategy == Strategy::ForceInterruption {
                self.interrupt_all(run).await
            } else {
                let Some(victim) = select_victim(strategy, run.members) else {
                    debug!(event = run.event_id, %strategy, "no candidate, skipping");
                    continue;
                };
                self.interrupt_one(run, strategy, victim).await
            };

            match rung {
                Rung::Succeeded => return LadderOutcome::Resolved(strategy),
                Rung::Failed => continue,
                Rung::Stop => return LadderOutcome::Unsupported,
                Rung::Abort(reason) => return LadderOutcome::Unreachable(reason),
                Rung::Cancelled => return LadderOutcome::Cancelled,
            }
        }

        LadderOutcome::Exhausted
    }

    fn classify_only(&self, run: &LadderRun<'_>) -> LadderOutcome {
        let waitable = run.members.iter().filter(|t| t.state.is_waitable()).count();
        let detail = if waitable > 0 {
            format!(
                "{waitable} of {} threads in an interruptible wait; target cannot be interrupted remotely, deferring to target recovery",
                run.members.len()
            )
        } else {
            format!(
                "all {} threads blocked on lock entry; target cannot be interrupted remotely, deferring to target recovery",
                run.members.len()
            )
        };
        self.record(
            run,
            Strategy::SmartInterruption,
            run.members.iter().map(|t| t.id).collect(),
            AttemptOutcome::Monitoring,
            detail,
            now_ms(),
            Instant::now(),
        );
        LadderOutcome::Deferred { waitable }
    }

    async fn interrupt_one(&self, run: &LadderRun<'_>, strategy: Strategy, victim: &ThreadSnapshot) -> Rung {
        let started_at_ms = now_ms();
        let started = Instant::now();

        match run.provider.interrupt(victim.id) {
            Ok(()) => {
                if !self.settle(run.cancel).await {
                    self.record(
                        run,
                        strategy,
                        vec![victim.id],
                        AttemptOutcome::Failed,
                        format!("cancelled while thread {} settled", victim.id),
                        started_at_ms,
                        started,
                    );
                    return Rung::Cancelled;
                }
                info!(event = run.event_id, %strategy, thread = %victim.id, "interrupted thread");
                self.record(
                    run,
                    strategy,
                    vec![victim.id],
                    AttemptOutcome::Success,
                    format!(
                        "Interrupted thread {} ({}, {})",
                        victim.id, victim.name, victim.state
                    ),
                    started_at_ms,
                    started,
                );
                Rung::Succeeded
            }
            Err(err) => {
                warn!(event = run.event_id, %strategy, thread = %victim.id, %err, "interrupt failed");
                self.record(
                    run,
                    strategy,
                    vec![victim.id],
                    AttemptOutcome::Failed,
                    format!("Could not interrupt thread {}: {err}", victim.id),
                    started_at_ms,
                    started,
                );
                rung_for_error(err)
            }
        }
    }

    async fn interrupt_all(&self, run: &LadderRun<'_>) -> Rung {
        let strategy = Strategy::ForceInterruption;
        let started_at_ms = now_ms();
        let started = Instant::now();
        let members: Vec<ThreadId> = run.members.iter().map(|t| t.id).collect();

        let mut issued: Vec<ThreadId> = Vec::new();
        let mut refusals: Vec<String> = Vec::new();
        let mut unsupported = false;
        for &thread in &members {
            match run.provider.interrupt(thread) {
                Ok(()) => issued.push(thread),
                Err(ControlError::Unreachable(reason)) => {
                    self.record(
                        run,
                        strategy,
                        members.clone(),
                        AttemptOutcome::Failed,
                        format!("target unreachable: {reason}"),
                        started_at_ms,
                        started,
                    );
                    return Rung::Abort(reason);
                }
                Err(err) => {
                    unsupported |= err == ControlError::Unsupported;
                    refusals.push(format!("{thread}: {err}"));
                }
            }
        }

        if issued.is_empty() {
            self.record(
                run,
                strategy,
                members,
                AttemptOutcome::Failed,
                format!("No interrupt could be issued ({})", refusals.join("; ")),
                started_at_ms,
                started,
            );
            return if unsupported { Rung::Stop } else { Rung::Failed };
        }

        let settled = self.settle(run.cancel).await;
        let (outcome, detail) = if settled {
            (
                AttemptOutcome::Partial,
                format!(
                    "Interrupted {} of {} threads; lock release not confirmed",
                    issued.len(),
                    members.len()
                ),
            )
        } else {
            (
                AttemptOutcome::Failed,
                format!(
                    "Interrupted {} of {} threads; cancelled before they settled",
                    issued.len(),
                    members.len()
                ),
            )
        };
        self.record(run, strategy, issued, outcome, detail, started_at_ms, started);
        if settled { Rung::Succeeded } else { Rung::Cancelled }
    }

    /// Wait out the settle window. `false` if cancelled first.
    async fn settle(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.settle_window) => true,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        run: &LadderRun<'_>,
        method: Strategy,
        affected_threads: Vec<ThreadId>,
        outcome: AttemptOutcome,
        detail: String,
        started_at_ms: i64,
        started: Instant,
    ) -> ResolutionAttempt {
        let attempt = run.history.record(AttemptDraft {
            event_id: run.event_id.to_string(),
            timestamp_ms: started_at_ms,
            method,
            affected_threads,
            outcome,
            detail,
            duration_ms: duration_ms(started.elapsed()),
        });
        run.sink.publish(Notification::ResolutionUpdate {
            payload: ResolutionUpdate {
                event_id: run.event_id.to_string(),
                event_state: EventState::Resolving,
                attempt: Some(attempt.clone()),
                outcome: Some(outcome),
                message: attempt.detail.clone(),
                timestamp_ms: now_ms(),
            },
        });
        attempt
    }
}

fn rung_for_error(err: ControlError) -> Rung {
    match err {
        ControlError::PermissionDenied | ControlError::NoSuchThread(_) => Rung::Failed,
        ControlError::Unsupported => Rung::Stop,
        ControlError::Unreachable(reason) => Rung::Abort(reason),
    }
}

/// Victim of a single-thread rung. `None` means the rung does not apply.
pub fn select_victim(strategy: Strategy, members: &[ThreadSnapshot]) -> Option<&ThreadSnapshot> {
    match strategy {
        // Waitable threads are the only ones an interrupt is sure to wake.
        Strategy::SmartInterruption => members.iter().max_by_key(|t| (t.state.is_waitable(), t.id)),
        Strategy::PriorityBased => members
            .iter()
            .filter_map(|t| t.priority.map(|p| (p, t)))
            .min_by_key(|(p, t)| (*p, Reverse(t.id)))
            .map(|(_, t)| t),
        Strategy::TimeoutRecovery => members
            .iter()
            .filter_map(|t| t.blocked_duration_ms.map(|d| (d, t)))
            .max_by_key(|(d, t)| (*d, t.id))
            .map(|(_, t)| t)
            .or_else(|| {
                members
                    .iter()
                    .filter(|t| t.state == ThreadState::Blocked)
                    .max_by_key(|t| t.id)
            }),
        Strategy::ForceInterruption => None,
    }
}

// ── Tests ───────────────────────────────────────────────────────
