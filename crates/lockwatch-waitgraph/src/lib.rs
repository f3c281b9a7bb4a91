//! Wait-for graph model for lockwatch.
//!
//! Converts a raw list of [`ThreadSnapshot`]s into a directed multigraph of
//! `HOLDS(lock → thread)` and `AWAITS(thread → lock)` edges. The graph is
//! immutable once built and is rebuilt from scratch on every poll; it is the
//! single input of cycle detection and of the snapshot payload shown to
//! operators.

use std::collections::{HashMap, HashSet};

use facet::Facet;
use lockwatch_types::{
    EdgeView, LockId, LockView, MAX_STACK_FRAMES, ThreadId, ThreadSnapshot, ThreadState,
    ThreadView,
};

pub mod detect;

// ── Node identity ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Facet)]
#[repr(u8)]
pub enum NodeId {
    Thread { id: ThreadId },
    Lock { id: LockId },
}

impl NodeId {
    /// String form used in edge payloads: thread ids as decimal, locks by label.
    pub fn key(&self) -> String {
        match self {
            NodeId::Thread { id } => id.to_string(),
            NodeId::Lock { id } => id.to_string(),
        }
    }
}

// ── Node kinds ──────────────────────────────────────────────────

#[derive(Debug, Clone, Facet)]
#[repr(u8)]
pub enum NodeKind {
    Thread {
        name: String,
        state: ThreadState,
        blocked_duration_ms: Option<u64>,
        stack_summary: Vec<String>,
    },
    Lock {
        label: String,
    },
}

#[derive(Debug, Clone, Facet)]
pub struct GraphNode {
    pub id: NodeId,
    pub kind: NodeKind,
}

// ── Edges ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Facet)]
#[repr(u8)]
pub enum EdgeKind {
    /// The lock is currently held by the thread.
    Holds,
    /// The thread is waiting to acquire the lock.
    Awaits,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct WaitEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub kind: EdgeKind,
}

// ── Errors ──────────────────────────────────────────────────────

/// A snapshot the builder refuses to turn into a graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// The same thread id appears more than once in one snapshot.
    DuplicateThread(ThreadId),
}

impl core::fmt::Display for BuildError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BuildError::DuplicateThread(id) => {
                write!(f, "malformed snapshot: thread {id} listed more than once")
            }
        }
    }
}

impl std::error::Error for BuildError {}

// ── The graph itself ────────────────────────────────────────────

/// Wait-for graph built from one snapshot.
///
/// Nodes keep the order in which the snapshot introduced them, so building
/// twice from the same snapshot yields an identical graph.
#[derive(Debug, Clone, Default)]
pub struct WaitForGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<NodeId, usize>,
    edges: Vec<WaitEdge>,
    holders: HashMap<LockId, Vec<ThreadId>>,
    awaits: HashMap<ThreadId, LockId>,
}

impl WaitForGraph {
    /// Build a graph from a snapshot in O(threads + locks).
    pub fn build(threads: &[ThreadSnapshot]) -> Result<Self, BuildError> {
        let mut graph = WaitForGraph::default();
        let mut seen: HashSet<ThreadId> = HashSet::with_capacity(threads.len());

        for thread in threads {
            if !seen.insert(thread.id) {
                return Err(BuildError::DuplicateThread(thread.id));
            }
            graph.ingest_thread(thread);
        }

        Ok(graph)
    }

    fn ingest_thread(&mut self, thread: &ThreadSnapshot) {
        let thread_node = NodeId::Thread { id: thread.id };
        self.insert_node(
            thread_node.clone(),
            NodeKind::Thread {
                name: thread.name.clone(),
                state: thread.state,
                blocked_duration_ms: thread.blocked_duration_ms,
                stack_summary: thread
                    .stack_summary
                    .iter()
                    .take(MAX_STACK_FRAMES)
                    .cloned()
                    .collect(),
            },
        );

        if let Some(lock) = &thread.awaited_lock {
            let lock_node = self.ensure_lock(lock);
            self.awaits.insert(thread.id, lock.clone());
            self.edges.push(WaitEdge {
                from: thread_node.clone(),
                to: lock_node,
                kind: EdgeKind::Awaits,
            });
        }

        for lock in &thread.held_locks {
            let lock_node = self.ensure_lock(lock);
            self.holders.entry(lock.clone()).or_default().push(thread.id);
            self.edges.push(WaitEdge {
                from: lock_node,
                to: thread_node.clone(),
                kind: EdgeKind::Holds,
            });
        }
    }

    fn insert_node(&mut self, id: NodeId, kind: NodeKind) {
        if self.index.contains_key(&id) {
            return;
        }
        self.index.insert(id.clone(), self.nodes.len());
        self.nodes.push(GraphNode { id, kind });
    }

    fn ensure_lock(&mut self, lock: &LockId) -> NodeId {
        let node = NodeId::Lock { id: lock.clone() };
        self.insert_node(
            node.clone(),
            NodeKind::Lock {
                label: lock.label().to_string(),
            },
        );
        node
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[WaitEdge] {
        &self.edges
    }

    pub fn thread_ids(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.nodes.iter().filter_map(|n| match &n.id {
            NodeId::Thread { id } => Some(*id),
            NodeId::Lock { .. } => None,
        })
    }

    pub fn thread_count(&self) -> usize {
        self.thread_ids().count()
    }

    pub fn lock_count(&self) -> usize {
        self.nodes.len() - self.thread_count()
    }

    pub fn awaited_lock(&self, thread: ThreadId) -> Option<&LockId> {
        self.awaits.get(&thread)
    }

    pub fn holders_of(&self, lock: &LockId) -> &[ThreadId] {
        self.holders.get(lock).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Threads holding the lock `thread` awaits, excluding `thread` itself.
    ///
    /// A thread awaiting a lock it already holds is a reentrancy problem in
    /// the target, not a deadlock, so that self-edge is dropped here.
    pub fn successors(&self, thread: ThreadId) -> impl Iterator<Item = ThreadId> + '_ {
        self.awaited_lock(thread)
            .map(|lock| self.holders_of(lock))
            .unwrap_or(&[])
            .iter()
            .copied()
            .filter(move |&holder| holder != thread)
    }

    /// Whether any thread in the snapshot is waiting on a lock.
    pub fn has_waiters(&self) -> bool {
        !self.awaits.is_empty()
    }

    // ── Payload projections ─────────────────────────────────────

    pub fn thread_views(&self, deadlocked: &HashSet<ThreadId>) -> Vec<ThreadView> {
        self.nodes
            .iter()
            .filter_map(|node| match (&node.id, &node.kind) {
                (
                    NodeId::Thread { id },
                    NodeKind::Thread {
                        name,
                        state,
                        blocked_duration_ms,
                        stack_summary,
                    },
                ) => Some(ThreadView {
                    id: *id,
                    name: name.clone(),
                    state: *state,
                    deadlocked: deadlocked.contains(id),
                    blocked_duration_ms: *blocked_duration_ms,
                    stack_summary: stack_summary.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn lock_views(&self) -> Vec<LockView> {
        self.nodes
            .iter()
            .filter_map(|node| match (&node.id, &node.kind) {
                (NodeId::Lock { id }, NodeKind::Lock { label }) => Some(LockView {
                    id: id.to_string(),
                    label: label.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn edge_views(&self) -> Vec<EdgeView> {
        self.edges
            .iter()
            .map(|edge| EdgeView {
                from: edge.from.key(),
                to: edge.to.key(),
                kind: match edge.kind {
                    EdgeKind::Holds => lockwatch_types::EdgeKind::Holds,
                    EdgeKind::Awaits => lockwatch_types::EdgeKind::Awaits,
                },
            })
            .collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(id: u64, state: ThreadState) -> ThreadSnapshot {
        ThreadSnapshot::new(ThreadId(id), format!("worker-{id}"), state)
    }

    #[test]
    fn idle_threads_are_isolated_nodes() {
        let graph = WaitForGraph::build(&[
            thread(1, ThreadState::Runnable),
            thread(2, ThreadState::TimedWaiting),
        ])
        .unwrap();

        assert_eq!(graph.thread_count(), 2);
        assert_eq!(graph.lock_count(), 0);
        assert!(graph.edges().is_empty());
        assert!(!graph.has_waiters());
    }

    #[test]
    fn contention_produces_awaits_and_holds_edges() {
        let graph = WaitForGraph::build(&[
            thread(1, ThreadState::Runnable).holding("orders"),
            thread(2, ThreadState::Blocked).awaiting("orders"),
        ])
        .unwrap();

        assert_eq!(graph.thread_count(), 2);
        assert_eq!(graph.lock_count(), 1);
        assert_eq!(graph.edges().len(), 2);

        let orders = LockId::new("orders");
        let awaits = graph
            .edges()
            .iter()
            .find(|e| e.kind == EdgeKind::Awaits)
            .unwrap();
        assert_eq!(awaits.from, NodeId::Thread { id: ThreadId(2) });
        assert_eq!(awaits.to, NodeId::Lock { id: orders.clone() });

        let holds = graph
            .edges()
            .iter()
            .find(|e| e.kind == EdgeKind::Holds)
            .unwrap();
        assert_eq!(holds.from, NodeId::Lock { id: orders.clone() });
        assert_eq!(holds.to, NodeId::Thread { id: ThreadId(1) });

        assert_eq!(graph.holders_of(&orders), &[ThreadId(1)]);
        assert_eq!(graph.successors(ThreadId(2)).collect::<Vec<_>>(), vec![ThreadId(1)]);
        assert_eq!(graph.successors(ThreadId(1)).count(), 0);
    }

    #[test]
    fn lock_awaited_but_unowned_still_gets_a_node() {
        let graph = WaitForGraph::build(&[thread(7, ThreadState::Waiting).awaiting("cond")]).unwrap();
        assert_eq!(graph.lock_count(), 1);
        assert!(graph.holders_of(&LockId::new("cond")).is_empty());
        assert_eq!(graph.successors(ThreadId(7)).count(), 0);
    }

    #[test]
    fn reentrant_wait_is_not_a_successor() {
        let graph = WaitForGraph::build(&[thread(3, ThreadState::Blocked)
            .holding("m")
            .awaiting("m")])
        .unwrap();
        assert_eq!(graph.edges().len(), 2);
        assert_eq!(graph.successors(ThreadId(3)).count(), 0);
    }

    #[test]
    fn duplicate_thread_is_malformed() {
        let err = WaitForGraph::build(&[
            thread(1, ThreadState::Runnable),
            thread(1, ThreadState::Blocked),
        ])
        .unwrap_err();
        assert_eq!(err, BuildError::DuplicateThread(ThreadId(1)));
    }

    #[test]
    fn views_mark_deadlocked_threads() {
        let graph = WaitForGraph::build(&[
            thread(1, ThreadState::Blocked).holding("a").awaiting("b"),
            thread(2, ThreadState::Runnable),
        ])
        .unwrap();
        let deadlocked: HashSet<ThreadId> = [ThreadId(1)].into_iter().collect();
        let views = graph.thread_views(&deadlocked);
        assert_eq!(views.len(), 2);
        assert!(views.iter().find(|v| v.id == ThreadId(1)).unwrap().deadlocked);
        assert!(!views.iter().find(|v| v.id == ThreadId(2)).unwrap().deadlocked);

        let locks = graph.lock_views();
        assert_eq!(locks.len(), 2);
        let edges = graph.edge_views();
        assert!(edges.iter().any(|e| e.from == "1" && e.to == "b"));
        assert!(edges.iter().any(|e| e.from == "a" && e.to == "1"));
    }

    #[test]
    fn oversized_stacks_are_cut_when_ingested() {
        let mut snapshot = thread(4, ThreadState::Blocked);
        snapshot.stack_summary = (0..40).map(|i| format!("frame_{i}")).collect();
        let graph = WaitForGraph::build(&[snapshot]).unwrap();

        let views = graph.thread_views(&HashSet::new());
        assert_eq!(views[0].stack_summary.len(), MAX_STACK_FRAMES);
        assert_eq!(views[0].stack_summary[0], "frame_0");
    }
}
