mod healthy;
mod monitor_entry_deadlock;
mod three_thread_ring;
mod two_thread_deadlock;

use std::sync::Arc;

use lockwatch_locks::{TrackedMutex, TrackedThread, spawn_tracked};

use crate::CommandKind;

pub fn start(command: &CommandKind) -> Result<(), String> {
    match command {
        CommandKind::TwoThreadDeadlock => two_thread_deadlock::start(),
        CommandKind::ThreeThreadRing => three_thread_ring::start(),
        CommandKind::MonitorEntryDeadlock => monitor_entry_deadlock::start(),
        CommandKind::Healthy => healthy::start(),
    }
}

pub(crate) fn spawn_worker<T>(
    name: &str,
    f: impl FnOnce() -> T + Send + 'static,
) -> Result<TrackedThread<T>, String>
where
    T: Send + 'static,
{
    let thread =
        spawn_tracked(name, f).map_err(|e| format!("failed to spawn worker {name}: {e}"))?;
    println!("spawned {name} as thread {}", thread.id());
    Ok(thread)
}

pub(crate) fn shared_lock(name: &str) -> Arc<TrackedMutex<()>> {
    Arc::new(TrackedMutex::new(name, ()))
}
