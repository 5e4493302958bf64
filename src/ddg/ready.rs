/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Readiness, timing and priority queries.

use super::{DataDependenceGraph, DepType, EdgeId, EdgeReason, MoveId};
use crate::nodeset::NodeSet;
use crate::Cycle;
use alloc::vec;
use alloc::vec::Vec;
use smallvec::{smallvec, SmallVec};

impl DataDependenceGraph {
    /// Minimum distance in cycles from the tail of `e` to its head.
    /// Anti dependences may be zero or negative.
    pub fn edge_latency(&self, e: EdgeId) -> i32 {
        let entry = &self.edges[e];
        let edge = &entry.edge;
        if edge.reason == EdgeReason::Operation {
            // Operands may share the trigger's cycle; results wait for
            // the operation to finish.
            let tail_op = self.nodes[entry.tail].dst_op;
            return match self.nodes[entry.head].src_op {
                Some(op) if tail_op == Some(op) => self.ops[op].latency as i32,
                _ => 0,
            };
        }
        match edge.dep {
            DepType::Raw if edge.guard_use => edge
                .reg()
                .map_or(1, |r| self.guard_latency(r).max(1) as i32),
            DepType::War if edge.guard_use => {
                1 - edge.reg().map_or(1, |r| self.guard_latency(r).max(1) as i32)
            }
            DepType::War => 0,
            DepType::Raw | DepType::Waw | DepType::Unknown => 1,
        }
    }

    fn counts_for_timing(&self, e: EdgeId, ignore_antideps: bool) -> bool {
        let edge = &self.edges[e].edge;
        !edge.is_back_edge() && !(ignore_antideps && edge.is_register_anti())
    }

    /// Earliest cycle allowed by the already scheduled predecessors.
    pub fn earliest_cycle(&self, n: MoveId) -> Cycle {
        self.earliest_cycle_impl(n, false)
    }

    /// Like [`earliest_cycle`](Self::earliest_cycle) but disregarding
    /// register anti and output dependences, which renaming can remove.
    pub fn earliest_cycle_ignoring_antideps(&self, n: MoveId) -> Cycle {
        self.earliest_cycle_impl(n, true)
    }

    fn earliest_cycle_impl(&self, n: MoveId, ignore_antideps: bool) -> Cycle {
        let mut earliest: Cycle = 0;
        for e in self.in_edges(n) {
            if !self.counts_for_timing(e, ignore_antideps) {
                continue;
            }
            let tail = &self.nodes[self.edges[e].tail];
            if let Some(p) = tail.placement {
                earliest = earliest.max(p.cycle + self.edge_latency(e));
            }
        }
        earliest
    }

    /// Latest cycle allowed by the already scheduled successors, or
    /// `None` if none of them constrains the node.
    pub fn latest_cycle(&self, n: MoveId) -> Option<Cycle> {
        self.latest_cycle_impl(n, false)
    }

    pub fn latest_cycle_ignoring_antideps(&self, n: MoveId) -> Option<Cycle> {
        self.latest_cycle_impl(n, true)
    }

    fn latest_cycle_impl(&self, n: MoveId, ignore_antideps: bool) -> Option<Cycle> {
        let mut latest: Option<Cycle> = None;
        for e in self.out_edges(n) {
            if !self.counts_for_timing(e, ignore_antideps) {
                continue;
            }
            let head = &self.nodes[self.edges[e].head];
            if let Some(p) = head.placement {
                let bound = p.cycle - self.edge_latency(e);
                latest = Some(latest.map_or(bound, |l| l.min(bound)));
            }
        }
        latest
    }

    /// Are all predecessors of `n` scheduled? Loop-carried edges and
    /// moves of the same operation do not count. A control-flow move is
    /// only ready once it is the last unscheduled move.
    pub fn predecessors_ready(&self, n: MoveId) -> bool {
        self.other_predecessors_scheduled(n, &[])
    }

    /// Are all successors of `n` scheduled? A control-flow move is always
    /// ready in this direction.
    pub fn successors_ready(&self, n: MoveId) -> bool {
        self.other_successors_scheduled(n, &[])
    }

    /// [`predecessors_ready`](Self::predecessors_ready), also ignoring
    /// predecessors that are members of `group`.
    pub fn other_predecessors_scheduled(&self, n: MoveId, group: &[MoveId]) -> bool {
        if self.nodes[n].control_flow {
            return self.node_ids().all(|m| {
                m == n
                    || self.nodes[m].is_scheduled()
                    || group.contains(&m)
                    || self.same_operation(m, n)
            });
        }
        self.in_edges(n).all(|e| {
            let entry = &self.edges[e];
            entry.edge.is_back_edge()
                || self.nodes[entry.tail].is_scheduled()
                || group.contains(&entry.tail)
                || self.same_operation(entry.tail, n)
        })
    }

    pub fn other_successors_scheduled(&self, n: MoveId, group: &[MoveId]) -> bool {
        if self.nodes[n].control_flow {
            return true;
        }
        self.out_edges(n).all(|e| {
            let entry = &self.edges[e];
            entry.edge.is_back_edge()
                || self.nodes[entry.head].is_scheduled()
                || group.contains(&entry.head)
                || self.same_operation(entry.head, n)
        })
    }

    /// Longest latency-weighted path from `n` to any sink.
    pub fn max_sink_distance(&self, n: MoveId) -> u32 {
        {
            let cache = self.distances.borrow();
            if let Some(d) = &cache.to_sink {
                if let Some(&v) = d.get(n.index()) {
                    return v;
                }
            }
        }
        let d = self.compute_distances(true);
        let v = d[n.index()];
        self.distances.borrow_mut().to_sink = Some(d);
        v
    }

    /// Longest latency-weighted path from any source to `n`.
    pub fn max_source_distance(&self, n: MoveId) -> u32 {
        {
            let cache = self.distances.borrow();
            if let Some(d) = &cache.to_source {
                if let Some(&v) = d.get(n.index()) {
                    return v;
                }
            }
        }
        let d = self.compute_distances(false);
        let v = d[n.index()];
        self.distances.borrow_mut().to_source = Some(d);
        v
    }

    fn compute_distances(&self, to_sink: bool) -> Vec<u32> {
        let mut dist = vec![0u32; self.nodes.len()];
        for n in self.postorder(to_sink) {
            let mut best = 0;
            let edges: SmallVec<[EdgeId; 8]> = if to_sink {
                self.out_edges(n).collect()
            } else {
                self.in_edges(n).collect()
            };
            for e in edges {
                if self.edges[e].edge.is_back_edge() {
                    continue;
                }
                let other = if to_sink {
                    self.edges[e].head
                } else {
                    self.edges[e].tail
                };
                let w = self.edge_latency(e).max(1) as u32;
                best = best.max(dist[other.index()] + w);
            }
            dist[n.index()] = best;
        }
        dist
    }

    /// Postorder of all live nodes following out-edges (or in-edges when
    /// `forward` is false), skipping loop-carried edges.
    pub(crate) fn postorder(&self, forward: bool) -> Vec<MoveId> {
        struct State {
            node: MoveId,
            next: usize,
        }

        let mut visited = NodeSet::with_capacity(self.nodes.len());
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: SmallVec<[State; 64]> = smallvec![];
        for root in self.node_ids() {
            if !visited.insert(root) {
                continue;
            }
            stack.push(State {
                node: root,
                next: 0,
            });
            while let Some(state) = stack.last_mut() {
                let list = if forward {
                    &self.nodes[state.node].outs
                } else {
                    &self.nodes[state.node].ins
                };
                if let Some(&e) = list.get(state.next) {
                    state.next += 1;
                    let entry = &self.edges[e];
                    if entry.edge.is_back_edge() {
                        continue;
                    }
                    let succ = if forward { entry.head } else { entry.tail };
                    if visited.insert(succ) {
                        stack.push(State {
                            node: succ,
                            next: 0,
                        });
                    }
                } else {
                    out.push(state.node);
                    stack.pop();
                }
            }
        }
        out
    }
}
