use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lockwatch_types::{LockId, ThreadState};

use crate::registry::{self, WaitScope};

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

/// How often an interruptible waiter re-checks its interrupt flag.
const INTERRUPT_POLL: Duration = Duration::from_millis(10);

/// The waiter gave up because its thread was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl core::fmt::Display for Interrupted {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("interrupted while waiting for lock")
    }
}

impl std::error::Error for Interrupted {}

// ── TrackedMutex ─────────────────────────────────────────

/// A `parking_lot::Mutex` whose holders and waiters show up in
/// [`snapshot`](crate::snapshot).
pub struct TrackedMutex<T> {
    inner: parking_lot::Mutex<T>,
    id: LockId,
}

impl<T> TrackedMutex<T> {
    pub fn new(name: &str, value: T) -> Self {
        let n = NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: parking_lot::Mutex::new(value),
            id: LockId::new(format!("{name}@{n}")),
        }
    }

    pub fn id(&self) -> &LockId {
        &self.id
    }

    /// Acquire, blocking until the lock is free. Interrupts are ignored.
    pub fn lock(&self) -> TrackedMutexGuard<'_, T> {
        if let Some(guard) = self.inner.try_lock() {
            return self.held(guard);
        }
        let wait = WaitScope::enter(&self.id, ThreadState::Blocked);
        let guard = self.inner.lock();
        drop(wait);
        self.held(guard)
    }

    /// Acquire, giving up if the calling thread is interrupted first.
    ///
    /// A pending interrupt fails the call immediately. The flag is cleared
    /// when it is reported.
    pub fn lock_interruptibly(&self) -> Result<TrackedMutexGuard<'_, T>, Interrupted> {
        if registry::take_interrupt() {
            return Err(Interrupted);
        }
        if let Some(guard) = self.inner.try_lock() {
            return Ok(self.held(guard));
        }

        let _wait = WaitScope::enter(&self.id, ThreadState::Waiting);
        loop {
            if let Some(guard) = self.inner.try_lock_for(INTERRUPT_POLL) {
                return Ok(self.held(guard));
            }
            if registry::take_interrupt() {
                return Err(Interrupted);
            }
        }
    }

    pub fn try_lock(&self) -> Option<TrackedMutexGuard<'_, T>> {
        self.inner.try_lock().map(|guard| self.held(guard))
    }

    fn held<'a>(&'a self, guard: parking_lot::MutexGuard<'a, T>) -> TrackedMutexGuard<'a, T> {
        registry::note_acquired(&self.id);
        TrackedMutexGuard {
            guard,
            id: &self.id,
        }
    }
}

pub struct TrackedMutexGuard<'a, T> {
    guard: parking_lot::MutexGuard<'a, T>,
    id: &'a LockId,
}

impl<T> Drop for TrackedMutexGuard<'_, T> {
    fn drop(&mut self) {
        registry::note_released(self.id);
    }
}

impl<T> Deref for TrackedMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for TrackedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
