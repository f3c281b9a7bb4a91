//! Fakes shared by the engine's tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use lockwatch_types::{Notification, ThreadId, ThreadSnapshot, ThreadState};
use parking_lot::Mutex;

use crate::{Capabilities, ControlError, IntrospectionProvider, NotificationSink, ProviderError};

pub(crate) struct FakeProvider {
    threads: Mutex<Vec<ThreadSnapshot>>,
    interrupted: Mutex<Vec<ThreadId>>,
    refusals: Mutex<HashMap<ThreadId, ControlError>>,
    caps: Capabilities,
    unreachable: AtomicBool,
    /// The next snapshot lists a thread twice.
    garble_once: AtomicBool,
    /// An interrupted thread stops waiting, which breaks its cycle.
    release_on_interrupt: AtomicBool,
}

impl FakeProvider {
    pub(crate) fn new(threads: Vec<ThreadSnapshot>) -> Self {
        Self {
            threads: Mutex::new(threads),
            interrupted: Mutex::new(Vec::new()),
            refusals: Mutex::new(HashMap::new()),
            caps: Capabilities::LOCAL,
            unreachable: AtomicBool::new(false),
            garble_once: AtomicBool::new(false),
            release_on_interrupt: AtomicBool::new(false),
        }
    }

    pub(crate) fn remote(threads: Vec<ThreadSnapshot>) -> Self {
        Self {
            caps: Capabilities::REMOTE_READ_ONLY,
            ..Self::new(threads)
        }
    }

    pub(crate) fn releasing(self) -> Self {
        self.release_on_interrupt.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn refuse(&self, thread: u64, err: ControlError) {
        self.refusals.lock().insert(ThreadId(thread), err);
    }

    pub(crate) fn set_threads(&self, threads: Vec<ThreadSnapshot>) {
        *self.threads.lock() = threads;
    }

    pub(crate) fn garble_next_snapshot(&self) {
        self.garble_once.store(true, Ordering::SeqCst);
    }

    pub(crate) fn go_away(&self) {
        self.unreachable.store(true, Ordering::SeqCst);
    }

    pub(crate) fn interrupted(&self) -> Vec<ThreadId> {
        self.interrupted.lock().clone()
    }
}

impl IntrospectionProvider for FakeProvider {
    fn snapshot(&self) -> Result<Vec<ThreadSnapshot>, ProviderError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ProviderError::Unreachable("fake target exited".into()));
        }
        let mut threads = self.threads.lock().clone();
        if self.garble_once.swap(false, Ordering::SeqCst) {
            if let Some(first) = threads.first().cloned() {
                threads.push(first);
            }
        }
        Ok(threads)
    }

    fn interrupt(&self, thread: ThreadId) -> Result<(), ControlError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ControlError::Unreachable("fake target exited".into()));
        }
        if let Some(err) = self.refusals.lock().get(&thread) {
            return Err(err.clone());
        }
        let mut threads = self.threads.lock();
        let Some(snapshot) = threads.iter_mut().find(|t| t.id == thread) else {
            return Err(ControlError::NoSuchThread(thread));
        };
        self.interrupted.lock().push(thread);
        if self.release_on_interrupt.load(Ordering::SeqCst) {
            snapshot.awaited_lock = None;
            snapshot.state = ThreadState::Runnable;
        }
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub(crate) fn all(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }

    pub(crate) fn count(&self, kind: &str) -> usize {
        self.seen.lock().iter().filter(|n| n.kind() == kind).count()
    }
}

impl NotificationSink for RecordingSink {
    fn publish(&self, notification: Notification) {
        self.seen.lock().push(notification);
    }
}

pub(crate) fn blocked(id: u64) -> ThreadSnapshot {
    ThreadSnapshot::new(ThreadId(id), format!("worker-{id}"), ThreadState::Blocked)
}

pub(crate) fn waiting(id: u64) -> ThreadSnapshot {
    ThreadSnapshot::new(ThreadId(id), format!("worker-{id}"), ThreadState::Waiting)
}

/// Threads `a` and `b` each hold one lock and await the other's.
pub(crate) fn mutual_wait(a: u64, b: u64) -> Vec<ThreadSnapshot> {
    vec![
        blocked(a).holding(format!("lock-{a}")).awaiting(format!("lock-{b}")),
        blocked(b).holding(format!("lock-{b}")).awaiting(format!("lock-{a}")),
    ]
}
