// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Dependency graph between nodes.

use hashbrown::HashSet;

use crate::id::NodeId;

/// Bidirectional "A read B" edges.
///
/// Forward lists keep the order in which a derivation first read each
/// dependency; revalidation walks them in that order.
#[derive(Debug, Default, Clone)]
pub(crate) struct DepGraph {
    /// forward[a] -> nodes that `a` read during its last computation.
    forward: Vec<Vec<NodeId>>,
    /// reverse[b] -> nodes whose last computation read `b`.
    reverse: Vec<Vec<NodeId>>,
}

/// Reusable traversal state.
#[derive(Debug, Default)]
pub(crate) struct TraversalScratch {
    stack: Vec<NodeId>,
    visited: HashSet<NodeId>,
}

impl TraversalScratch {
    fn reset(&mut self) {
        self.stack.clear();
        self.visited.clear();
    }
}

#[inline]
fn grow(vec: &mut Vec<Vec<NodeId>>, idx: usize) {
    if idx >= vec.len() {
        vec.resize_with(idx + 1, Vec::new);
    }
}

#[inline]
fn slice(vec: &[Vec<NodeId>], idx: usize) -> &[NodeId] {
    vec.get(idx).map_or(&[][..], Vec::as_slice)
}

fn remove_edge(list: &mut Vec<NodeId>, key: NodeId) {
    if let Some(pos) = list.iter().position(|&k| k == key) {
        list.swap_remove(pos);
    }
}

impl DepGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Nodes `key` read during its last computation, in read order.
    pub(crate) fn dependencies(&self, key: NodeId) -> &[NodeId] {
        slice(&self.forward, key.index())
    }

    /// Nodes that read `key`.
    pub(crate) fn dependents(&self, key: NodeId) -> &[NodeId] {
        slice(&self.reverse, key.index())
    }

    pub(crate) fn has_dependents(&self, key: NodeId) -> bool {
        !self.dependents(key).is_empty()
    }

    /// Replaces all dependencies of `from` with `reads`.
    ///
    /// Duplicates are dropped; first-read order is kept. Returns `true` if the
    /// dependency set changed. Cycles are recorded as-is: they are reported at
    /// read time, not here.
    pub(crate) fn replace_dependencies(
        &mut self,
        from: NodeId,
        reads: impl IntoIterator<Item = NodeId>,
    ) -> bool {
        let mut seen = HashSet::new();
        let new_set: Vec<NodeId> = reads.into_iter().filter(|k| seen.insert(*k)).collect();

        let from_idx = from.index();
        grow(&mut self.forward, from_idx);
        let old = core::mem::take(&mut self.forward[from_idx]);

        let unchanged = old.len() == new_set.len() && old.iter().all(|dep| seen.contains(dep));

        for dep in old.iter().filter(|dep| !seen.contains(*dep)) {
            if let Some(list) = self.reverse.get_mut(dep.index()) {
                remove_edge(list, from);
            }
        }
        for &dep in &new_set {
            if !old.contains(&dep) {
                grow(&mut self.reverse, dep.index());
                self.reverse[dep.index()].push(from);
            }
        }

        self.forward[from_idx] = new_set;
        !unchanged
    }

    /// Removes every dependency of `key`, returning the former dependencies.
    pub(crate) fn clear_dependencies(&mut self, key: NodeId) -> Vec<NodeId> {
        let Some(list) = self.forward.get_mut(key.index()) else {
            return Vec::new();
        };
        let deps = core::mem::take(list);
        for dep in &deps {
            if let Some(rev) = self.reverse.get_mut(dep.index()) {
                remove_edge(rev, key);
            }
        }
        deps
    }

    /// Removes every edge pointing at `key`, returning its former dependents.
    ///
    /// The dependents' remaining dependencies keep their read order.
    pub(crate) fn detach_dependents(&mut self, key: NodeId) -> Vec<NodeId> {
        let Some(list) = self.reverse.get_mut(key.index()) else {
            return Vec::new();
        };
        let dependents = core::mem::take(list);
        for dependent in &dependents {
            if let Some(forward) = self.forward.get_mut(dependent.index()) {
                forward.retain(|dep| *dep != key);
            }
        }
        dependents
    }

    /// Calls `f` for each transitive dependent of every key in `roots`.
    ///
    /// Each dependent is visited once even if reachable from several roots.
    /// Roots themselves are only visited if another root depends on them.
    pub(crate) fn for_each_transitive_dependent(
        &self,
        roots: &[NodeId],
        scratch: &mut TraversalScratch,
        mut f: impl FnMut(NodeId),
    ) {
        scratch.reset();
        for &root in roots {
            scratch.stack.extend_from_slice(self.dependents(root));
        }
        while let Some(next) = scratch.stack.pop() {
            if scratch.visited.insert(next) {
                f(next);
                scratch.stack.extend_from_slice(self.dependents(next));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(i: u32) -> NodeId {
        NodeId::new(i)
    }

    #[test]
    fn replace_dependencies_keeps_read_order_and_dedups() {
        let mut graph = DepGraph::new();
        assert!(graph.replace_dependencies(n(10), [n(3), n(1), n(3), n(2)]));
        assert_eq!(graph.dependencies(n(10)), &[n(3), n(1), n(2)]);
        assert_eq!(graph.dependents(n(1)), &[n(10)]);
    }

    #[test]
    fn replace_dependencies_updates_reverse_edges() {
        let mut graph = DepGraph::new();
        graph.replace_dependencies(n(10), [n(1), n(2)]);
        graph.replace_dependencies(n(10), [n(2), n(3)]);

        assert!(graph.dependents(n(1)).is_empty());
        assert_eq!(graph.dependents(n(2)), &[n(10)]);
        assert_eq!(graph.dependents(n(3)), &[n(10)]);
    }

    #[test]
    fn replace_dependencies_reports_no_change_for_reordering() {
        let mut graph = DepGraph::new();
        graph.replace_dependencies(n(10), [n(1), n(2)]);
        assert!(!graph.replace_dependencies(n(10), [n(2), n(1), n(2)]));
        assert_eq!(graph.dependencies(n(10)), &[n(2), n(1)]);
        assert_eq!(graph.dependents(n(1)), &[n(10)]);
    }

    #[test]
    fn clear_dependencies_detaches_both_directions() {
        let mut graph = DepGraph::new();
        graph.replace_dependencies(n(5), [n(1), n(2)]);
        let old = graph.clear_dependencies(n(5));
        assert_eq!(old, vec![n(1), n(2)]);
        assert!(graph.dependencies(n(5)).is_empty());
        assert!(!graph.has_dependents(n(1)));
        assert!(!graph.has_dependents(n(2)));
    }

    #[test]
    fn detach_dependents_keeps_remaining_read_order() {
        let mut graph = DepGraph::new();
        graph.replace_dependencies(n(10), [n(1), n(2), n(3)]);
        graph.replace_dependencies(n(11), [n(2)]);

        let mut dependents = graph.detach_dependents(n(2));
        dependents.sort();
        assert_eq!(dependents, vec![n(10), n(11)]);
        assert_eq!(graph.dependencies(n(10)), &[n(1), n(3)]);
        assert!(graph.dependencies(n(11)).is_empty());
        assert!(!graph.has_dependents(n(2)));
    }

    #[test]
    fn transitive_dependents_visits_each_once() {
        // 1 <- 2 <- 3, 1 <- 4 <- 3
        let mut graph = DepGraph::new();
        graph.replace_dependencies(n(2), [n(1)]);
        graph.replace_dependencies(n(4), [n(1)]);
        graph.replace_dependencies(n(3), [n(2), n(4)]);

        let mut seen = Vec::new();
        let mut scratch = TraversalScratch::default();
        graph.for_each_transitive_dependent(&[n(1)], &mut scratch, |k| seen.push(k));
        seen.sort();
        assert_eq!(seen, vec![n(2), n(3), n(4)]);
    }

    #[test]
    fn traversal_terminates_on_recorded_cycles() {
        let mut graph = DepGraph::new();
        graph.replace_dependencies(n(1), [n(2)]);
        graph.replace_dependencies(n(2), [n(1)]);

        let mut count = 0;
        let mut scratch = TraversalScratch::default();
        graph.for_each_transitive_dependent(&[n(1)], &mut scratch, |_| count += 1);
        assert_eq!(count, 2);
    }
}
