// ── Thread registry ──────────────────────────────────────

use std::backtrace::Backtrace;
use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use lockwatch_engine::ControlError;
use lockwatch_types::{LockId, MAX_STACK_FRAMES, ThreadId, ThreadSnapshot, ThreadState};
use parking_lot::Mutex;
use tracing::debug;

static THREADS: LazyLock<Mutex<BTreeMap<ThreadId, ThreadRecord>>> =
    LazyLock::new(|| Mutex::new(BTreeMap::new()));

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

struct ThreadRecord {
    name: String,
    priority: Option<i32>,
    state: ThreadState,
    held: BTreeSet<LockId>,
    awaited: Option<LockId>,
    waiting_since: Option<Instant>,
    wait_stack: Vec<String>,
    interrupt: Arc<AtomicBool>,
}

/// Registration of the current thread. Removed from the registry when the
/// thread exits.
struct ThreadSlot {
    id: ThreadId,
    interrupt: Arc<AtomicBool>,
}

impl ThreadSlot {
    fn register(id: ThreadId, name: String) -> Self {
        let interrupt = Arc::new(AtomicBool::new(false));
        THREADS.lock().insert(
            id,
            ThreadRecord {
                name,
                priority: None,
                state: ThreadState::Runnable,
                held: BTreeSet::new(),
                awaited: None,
                waiting_since: None,
                wait_stack: Vec::new(),
                interrupt: Arc::clone(&interrupt),
            },
        );
        Self { id, interrupt }
    }
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        THREADS.lock().remove(&self.id);
    }
}

thread_local! {
    static CURRENT: OnceCell<ThreadSlot> = const { OnceCell::new() };
}

pub(crate) fn allocate_thread_id() -> ThreadId {
    ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
}

/// Register the current thread under a pre-allocated id. No-op if the thread
/// is already registered.
pub(crate) fn adopt(id: ThreadId, name: String) {
    CURRENT.with(|slot| {
        slot.get_or_init(|| ThreadSlot::register(id, name));
    });
}

fn with_slot<R>(f: impl FnOnce(&ThreadSlot) -> R) -> R {
    CURRENT.with(|slot| {
        let slot = slot.get_or_init(|| {
            let id = allocate_thread_id();
            let name = std::thread::current()
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("thread-{id}"));
            ThreadSlot::register(id, name)
        });
        f(slot)
    })
}

/// Id of the calling thread, registering it on first use.
pub fn current_thread_id() -> ThreadId {
    with_slot(|slot| slot.id)
}

/// Set the scheduling priority reported for the calling thread. Lower means
/// less important.
pub fn set_current_priority(priority: i32) {
    let id = current_thread_id();
    if let Some(record) = THREADS.lock().get_mut(&id) {
        record.priority = Some(priority);
    }
}

/// Clear and return the calling thread's interrupt flag.
pub fn take_interrupt() -> bool {
    with_slot(|slot| slot.interrupt.swap(false, Ordering::SeqCst))
}

/// Whether the calling thread has a pending interrupt. Does not clear it.
pub fn is_interrupted() -> bool {
    with_slot(|slot| slot.interrupt.load(Ordering::SeqCst))
}

/// Raise the interrupt flag of a tracked thread.
pub fn interrupt(thread: ThreadId) -> Result<(), ControlError> {
    let threads = THREADS.lock();
    let Some(record) = threads.get(&thread) else {
        return Err(ControlError::NoSuchThread(thread));
    };
    record.interrupt.store(true, Ordering::SeqCst);
    debug!(%thread, name = %record.name, state = %record.state, "interrupt raised");
    Ok(())
}

// ── Lock bookkeeping ─────────────────────────────────────

pub(crate) fn note_acquired(lock: &LockId) {
    let id = current_thread_id();
    if let Some(record) = THREADS.lock().get_mut(&id) {
        record.held.insert(lock.clone());
    }
}

pub(crate) fn note_released(lock: &LockId) {
    let id = current_thread_id();
    if let Some(record) = THREADS.lock().get_mut(&id) {
        record.held.remove(lock);
    }
}

/// Marks the calling thread as waiting on a lock until dropped.
pub(crate) struct WaitScope {
    id: ThreadId,
}

impl WaitScope {
    pub(crate) fn enter(lock: &LockId, state: ThreadState) -> Self {
        let id = current_thread_id();
        let stack = capture_stack();
        if let Some(record) = THREADS.lock().get_mut(&id) {
            record.state = state;
            record.awaited = Some(lock.clone());
            record.waiting_since = Some(Instant::now());
            record.wait_stack = stack;
        }
        Self { id }
    }
}

impl Drop for WaitScope {
    fn drop(&mut self) {
        if let Some(record) = THREADS.lock().get_mut(&self.id) {
            record.state = ThreadState::Runnable;
            record.awaited = None;
            record.waiting_since = None;
            record.wait_stack.clear();
        }
    }
}

fn capture_stack() -> Vec<String> {
    let rendered = Backtrace::force_capture().to_string();
    rendered
        .lines()
        .filter_map(|line| {
            let (index, frame) = line.trim_start().split_once(": ")?;
            index.parse::<usize>().ok()?;
            Some(frame.trim().to_string())
        })
        .filter(|frame| {
            !frame.starts_with("std::backtrace")
                && !frame.starts_with("lockwatch_locks::registry")
                && !frame.starts_with("lockwatch_locks::mutex")
        })
        .take(MAX_STACK_FRAMES)
        .collect()
}

// ── Snapshot ─────────────────────────────────────────────

/// Every tracked thread, ordered by id.
pub fn snapshot() -> Vec<ThreadSnapshot> {
    let threads = THREADS.lock();
    threads
        .iter()
        .map(|(&id, record)| {
            let mut snapshot = ThreadSnapshot::new(id, record.name.clone(), record.state)
                .with_stack(record.wait_stack.iter().cloned());
            snapshot.held_locks = record.held.clone();
            snapshot.awaited_lock = record.awaited.clone();
            snapshot.priority = record.priority;
            snapshot.blocked_duration_ms = record
                .waiting_since
                .map(|since| since.elapsed().as_millis().min(u64::MAX as u128) as u64);
            snapshot
        })
        .collect()
}
