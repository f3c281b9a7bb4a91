//! In-process lock tracking for lockwatch.
//!
//! Threads that take a [`TrackedMutex`] are registered in a process-wide
//! registry recording which locks each one holds and which one it waits for.
//! [`LocalProvider`] turns that registry into thread snapshots for a
//! [`Monitor`](lockwatch_engine::Monitor).
//!
//! Interrupts are cooperative. A thread parked in
//! [`TrackedMutex::lock_interruptibly`] notices the interrupt and gives up;
//! a thread in a plain [`TrackedMutex::lock`] keeps waiting, like a thread
//! blocked on monitor entry.

use std::io;
use std::thread::JoinHandle;

use lockwatch_engine::{Capabilities, ControlError, IntrospectionProvider, ProviderError};
use lockwatch_types::{ThreadId, ThreadSnapshot};

mod mutex;
mod registry;

pub use mutex::{Interrupted, TrackedMutex, TrackedMutexGuard};
pub use registry::{
    current_thread_id, interrupt, is_interrupted, set_current_priority, snapshot, take_interrupt,
};

// ── Tracked threads ──────────────────────────────────────

/// A spawned thread together with its tracking id.
pub struct TrackedThread<T> {
    id: ThreadId,
    handle: JoinHandle<T>,
}

impl<T> TrackedThread<T> {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> std::thread::Result<T> {
        self.handle.join()
    }
}

/// Spawn a named thread that is registered before `f` runs.
pub fn spawn_tracked<F, T>(name: impl Into<String>, f: F) -> io::Result<TrackedThread<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let name = name.into();
    let id = registry::allocate_thread_id();
    let thread_name = name.clone();
    let handle = std::thread::Builder::new().name(name).spawn(move || {
        registry::adopt(id, thread_name);
        f()
    })?;
    Ok(TrackedThread { id, handle })
}

// ── Provider ─────────────────────────────────────────────

/// Introspection of the current process.
pub struct LocalProvider {
    label: String,
    capabilities: Capabilities,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self {
            label: format!("local process (pid {})", std::process::id()),
            capabilities: Capabilities::LOCAL,
        }
    }

    /// Snapshots only; every interrupt is refused as unsupported. Behaves like
    /// a remote attachment without thread control.
    pub fn observe_only() -> Self {
        Self {
            label: format!("local process (pid {}, observe only)", std::process::id()),
            capabilities: Capabilities::REMOTE_READ_ONLY,
        }
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl IntrospectionProvider for LocalProvider {
    fn snapshot(&self) -> Result<Vec<ThreadSnapshot>, ProviderError> {
        Ok(registry::snapshot())
    }

    fn interrupt(&self, thread: ThreadId) -> Result<(), ControlError> {
        if !self.capabilities.can_interrupt {
            return Err(ControlError::Unsupported);
        }
        registry::interrupt(thread)
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

// ── Tests ────────────────────────────────────────────────
