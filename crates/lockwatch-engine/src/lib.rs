//! Deadlock detection and resolution engine.
//!
//! A [`Monitor`] polls an [`IntrospectionProvider`] on a fixed interval,
//! detects wait-for cycles, tracks each one as a [`DeadlockEvent`], and runs
//! the resolution ladder on them, reporting everything to a
//! [`NotificationSink`].
//!
//! [`DeadlockEvent`]: lockwatch_types::DeadlockEvent

mod config;
mod events;
mod history;
mod monitor;
mod notify;
mod provider;
mod strategy;
mod time;

#[cfg(test)]
mod testing;

pub use config::*;
pub use events::{EventCounters, EventStore, Reconciliation, ResolutionGuard};
pub use history::{AttemptDraft, History};
pub use monitor::{DEFAULT_HISTORY_LIMIT, Monitor};
pub use notify::{BroadcastPublisher, NotificationSink};
pub use provider::{Capabilities, ControlError, IntrospectionProvider, ProviderError};
pub use strategy::{LadderOutcome, LadderRun, StrategyEngine, select_victim};
pub use time::now_ms;
