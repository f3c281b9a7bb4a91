//! Deadlock cycle detection.
//!
//! Projects the [`WaitForGraph`] onto threads (`t → u` when `t` awaits a lock
//! that `u` holds), splits the projection into strongly connected components
//! with Tarjan's algorithm, and then enumerates every elementary cycle inside
//! each multi-thread component.
//!
//! Each cycle is reported starting at its smallest thread id, so rotations of
//! the same cycle collapse into one entry. Two cycles over the same thread set
//! but different orderings are both reported; callers keying by thread set
//! deduplicate them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use lockwatch_types::{ThreadId, ThreadSet};

use crate::WaitForGraph;

/// Stop enumerating once this many cycles have been found in one graph.
///
/// Elementary cycle counts grow exponentially in dense components. Real
/// deadlocks are small, so the cap only trips on pathological snapshots.
pub const MAX_CYCLES: usize = 4096;

// ── Cycle ───────────────────────────────────────────────────────

/// An elementary cycle in the thread projection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cycle {
    threads: Vec<ThreadId>,
}

impl Cycle {
    /// Threads in wait order, starting at the smallest id. Each thread awaits a
    /// lock held by the next; the last awaits a lock held by the first.
    pub fn threads(&self) -> &[ThreadId] {
        &self.threads
    }

    pub fn thread_set(&self) -> ThreadSet {
        self.threads.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.threads.contains(&thread)
    }
}

impl core::fmt::Display for Cycle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (i, t) in self.threads.iter().enumerate() {
            if i > 0 {
                f.write_str(" → ")?;
            }
            write!(f, "{t}")?;
        }
        if let Some(first) = self.threads.first() {
            write!(f, " → {first}")?;
        }
        Ok(())
    }
}

// ── Public API ──────────────────────────────────────────────────

/// Find every elementary thread cycle in `graph`.
///
/// The result is sorted and deterministic: the same graph always yields the
/// same list. Self-waits are never reported.
pub fn find_cycles(graph: &WaitForGraph) -> Vec<Cycle> {
    let adj = thread_adjacency(graph);
    let sccs = tarjan_scc(&adj);

    let mut found: BTreeSet<Vec<ThreadId>> = BTreeSet::new();
    for scc in sccs.iter().filter(|scc| scc.len() >= 2) {
        enumerate_circuits(scc, &adj, &mut found);
        if found.len() >= MAX_CYCLES {
            break;
        }
    }

    found.into_iter().map(|threads| Cycle { threads }).collect()
}

/// Union of every cycle's thread set.
pub fn deadlocked_threads(cycles: &[Cycle]) -> HashSet<ThreadId> {
    cycles
        .iter()
        .flat_map(|c| c.threads.iter().copied())
        .collect()
}

// ── Thread projection ───────────────────────────────────────────

fn thread_adjacency(graph: &WaitForGraph) -> BTreeMap<ThreadId, Vec<ThreadId>> {
    let mut adj: BTreeMap<ThreadId, Vec<ThreadId>> = BTreeMap::new();

    for thread in graph.thread_ids() {
        let mut next: Vec<ThreadId> = graph.successors(thread).collect();
        if next.is_empty() {
            continue;
        }
        next.sort_unstable();
        next.dedup();
        for &holder in &next {
            adj.entry(holder).or_default();
        }
        adj.entry(thread).or_default().extend(next);
    }

    adj
}

// ── Tarjan's SCC ────────────────────────────────────────────────

struct TarjanState {
    index_counter: usize,
    stack: Vec<ThreadId>,
    on_stack: HashSet<ThreadId>,
    index: HashMap<ThreadId, usize>,
    lowlink: HashMap<ThreadId, usize>,
    sccs: Vec<Vec<ThreadId>>,
}

fn tarjan_scc(adj: &BTreeMap<ThreadId, Vec<ThreadId>>) -> Vec<Vec<ThreadId>> {
    let mut state = TarjanState {
        index_counter: 0,
        stack: Vec::new(),
        on_stack: HashSet::new(),
        index: HashMap::new(),
        lowlink: HashMap::new(),
        sccs: Vec::new(),
    };

    for &thread in adj.keys() {
        if !state.index.contains_key(&thread) {
            strongconnect(thread, adj, &mut state);
        }
    }

    state.sccs
}

fn strongconnect(v: ThreadId, adj: &BTreeMap<ThreadId, Vec<ThreadId>>, state: &mut TarjanState) {
    let v_index = state.index_counter;
    state.index.insert(v, v_index);
    state.index_counter += 1;
    state.stack.push(v);
    state.on_stack.insert(v);

    let mut v_low = v_index;
    for &w in adj.get(&v).map(Vec::as_slice).unwrap_or(&[]) {
        if !state.index.contains_key(&w) {
            strongconnect(w, adj, state);
            if let Some(&w_low) = state.lowlink.get(&w) {
                v_low = v_low.min(w_low);
            }
        } else if state.on_stack.contains(&w) {
            if let Some(&w_idx) = state.index.get(&w) {
                v_low = v_low.min(w_idx);
            }
        }
    }
    state.lowlink.insert(v, v_low);

    if v_low == v_index {
        let mut scc = Vec::new();
        while let Some(w) = state.stack.pop() {
            state.on_stack.remove(&w);
            scc.push(w);
            if w == v {
                break;
            }
        }
        scc.sort_unstable();
        state.sccs.push(scc);
    }
}

// ── Elementary cycle enumeration ────────────────────────────────

/// Enumerate the elementary cycles of one SCC.
///
/// For each member `root` in ascending order, searches for simple paths back
/// to `root` through members greater than `root`. Every cycle is therefore
/// found exactly once, from its smallest member.
fn enumerate_circuits(
    scc: &[ThreadId],
    adj: &BTreeMap<ThreadId, Vec<ThreadId>>,
    found: &mut BTreeSet<Vec<ThreadId>>,
) {
    let members: HashSet<ThreadId> = scc.iter().copied().collect();

    for &root in scc {
        let mut search = CircuitSearch {
            root,
            adj,
            members: &members,
            path: vec![root],
            on_path: HashSet::from([root]),
            found,
        };
        search.extend(root);
        if found.len() >= MAX_CYCLES {
            return;
        }
    }
}

struct CircuitSearch<'a> {
    root: ThreadId,
    adj: &'a BTreeMap<ThreadId, Vec<ThreadId>>,
    members: &'a HashSet<ThreadId>,
    path: Vec<ThreadId>,
    on_path: HashSet<ThreadId>,
    found: &'a mut BTreeSet<Vec<ThreadId>>,
}

impl CircuitSearch<'_> {
    fn extend(&mut self, current: ThreadId) {
        let adj = self.adj;
        for &next in adj.get(&current).map(Vec::as_slice).unwrap_or(&[]) {
            if self.found.len() >= MAX_CYCLES {
                return;
            }
            if next == self.root {
                if self.path.len() >= 2 {
                    self.found.insert(self.path.clone());
                }
                continue;
            }
            if next < self.root || !self.members.contains(&next) || self.on_path.contains(&next) {
                continue;
            }
            self.path.push(next);
            self.on_path.insert(next);
            self.extend(next);
            self.on_path.remove(&next);
            self.path.pop();
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use lockwatch_types::{ThreadSnapshot, ThreadState};

    use super::*;

    fn blocked(id: u64) -> ThreadSnapshot {
        ThreadSnapshot::new(ThreadId(id), format!("t{id}"), ThreadState::Blocked)
    }

    fn cycles_of(threads: &[ThreadSnapshot]) -> Vec<Vec<u64>> {
        let graph = WaitForGraph::build(threads).unwrap();
        find_cycles(&graph)
            .iter()
            .map(|c| c.threads().iter().map(|t| t.get()).collect())
            .collect()
    }

    #[test]
    fn acyclic_graph_has_no_cycles() {
        let cycles = cycles_of(&[
            blocked(1).awaiting("a"),
            blocked(2).holding("a").awaiting("b"),
            ThreadSnapshot::new(ThreadId(3), "t3", ThreadState::Runnable).holding("b"),
        ]);
        assert!(cycles.is_empty());
    }

    #[test]
    fn two_thread_deadlock() {
        let cycles = cycles_of(&[
            blocked(1).holding("a").awaiting("b"),
            blocked(2).holding("b").awaiting("a"),
        ]);
        assert_eq!(cycles, vec![vec![1, 2]]);
    }

    #[test]
    fn three_thread_ring_is_one_cycle() {
        let cycles = cycles_of(&[
            blocked(30).holding("c").awaiting("a"),
            blocked(10).holding("a").awaiting("b"),
            blocked(20).holding("b").awaiting("c"),
        ]);
        assert_eq!(cycles, vec![vec![10, 20, 30]]);
    }

    #[test]
    fn cycle_is_normalized_to_smallest_thread() {
        // 5 waits on 3, 3 waits on 9, 9 waits on 5.
        let cycles = cycles_of(&[
            blocked(5).holding("five").awaiting("three"),
            blocked(3).holding("three").awaiting("nine"),
            blocked(9).holding("nine").awaiting("five"),
        ]);
        assert_eq!(cycles, vec![vec![3, 9, 5]]);
    }

    #[test]
    fn detection_is_idempotent() {
        let snapshot = [
            blocked(1).holding("a").awaiting("b"),
            blocked(2).holding("b").awaiting("a"),
            blocked(3).holding("c").awaiting("d"),
            blocked(4).holding("d").awaiting("c"),
        ];
        let first = cycles_of(&snapshot);
        let second = cycles_of(&snapshot);
        assert_eq!(first, second);
        assert_eq!(first, vec![vec![1, 2], vec![3, 4]]);
    }

    #[test]
    fn self_wait_is_not_a_deadlock() {
        let cycles = cycles_of(&[blocked(1).holding("m").awaiting("m")]);
        assert!(cycles.is_empty());
    }

    #[test]
    fn waiter_outside_cycle_is_not_reported() {
        let graph = WaitForGraph::build(&[
            blocked(1).holding("a").awaiting("b"),
            blocked(2).holding("b").awaiting("a"),
            blocked(3).awaiting("a"),
        ])
        .unwrap();
        let cycles = find_cycles(&graph);
        assert_eq!(cycles.len(), 1);
        assert!(!cycles[0].contains(ThreadId(3)));

        let dead = deadlocked_threads(&cycles);
        assert!(dead.contains(&ThreadId(1)));
        assert!(dead.contains(&ThreadId(2)));
        assert!(!dead.contains(&ThreadId(3)));
    }

    #[test]
    fn shared_holders_produce_every_elementary_cycle() {
        // Lock "shared" is held by both 2 and 3 (a read lock); 1 awaits it.
        // 2 and 3 each await a lock held by 1.
        let cycles = cycles_of(&[
            blocked(1).holding("x").holding("y").awaiting("shared"),
            blocked(2).holding("shared").awaiting("x"),
            blocked(3).holding("shared").awaiting("y"),
        ]);
        assert_eq!(cycles, vec![vec![1, 2], vec![1, 3]]);
    }

    #[test]
    fn cycle_display_closes_the_loop() {
        let graph = WaitForGraph::build(&[
            blocked(1).holding("a").awaiting("b"),
            blocked(2).holding("b").awaiting("a"),
        ])
        .unwrap();
        let cycles = find_cycles(&graph);
        assert_eq!(cycles[0].to_string(), "1 → 2 → 1");
        assert_eq!(
            cycles[0].thread_set(),
            [ThreadId(1), ThreadId(2)].into_iter().collect()
        );
    }
}
