/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Ready-list maintenance.
//!
//! The selector hands the driver groups of moves whose dependences on
//! the already scheduled part of the graph are satisfied. A group is
//! either a lone move or every move of one operation, closed over
//! forced-bypass relations so that a value living in a forced-bypass
//! register file is produced and consumed in a single decision.

use crate::ddg::{DataDependenceGraph, MoveId};
use crate::nodeset::NodeSet;
use crate::{Direction, OrphanPolicy};
use alloc::collections::BinaryHeap;
use alloc::vec::Vec;
use core::cmp::{Ordering, Reverse};
use smallvec::SmallVec;

/// Moves that are scheduled as one decision.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MoveNodeGroup {
    nodes: SmallVec<[MoveId; 4]>,
}

impl MoveNodeGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(n: MoveId) -> Self {
        let mut g = Self::new();
        g.push(n);
        g
    }

    pub fn push(&mut self, n: MoveId) {
        if !self.nodes.contains(&n) {
            self.nodes.push(n);
        }
    }

    pub fn nodes(&self) -> &[MoveId] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, n: MoveId) -> bool {
        self.nodes.contains(&n)
    }

    pub fn is_scheduled(&self, ddg: &DataDependenceGraph) -> bool {
        self.nodes.iter().all(|&n| ddg.is_scheduled(n))
    }

    /// Do the moves realize an operation (as opposed to a lone copy)?
    pub fn is_operation(&self, ddg: &DataDependenceGraph) -> bool {
        self.nodes.iter().any(|&n| ddg.node(n).in_operation())
    }
}

impl core::fmt::Display for MoveNodeGroup {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{{")?;
        for (i, n) in self.nodes.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", n)?;
        }
        write!(f, "}}")
    }
}

#[derive(PartialEq, Eq)]
struct Candidate {
    priority: u32,
    first: Reverse<MoveId>,
    group: MoveNodeGroup,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, self.first).cmp(&(other.priority, other.first))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct MoveNodeSelector {
    direction: Direction,
    orphan_policy: OrphanPolicy,
    ready: BinaryHeap<Candidate>,
    /// Nodes whose group has been put on the ready list.
    queued: NodeSet,
    /// Top-down, the control-flow move is only checked once everything
    /// else is scheduled, which no neighbour notification signals.
    control_flow: SmallVec<[MoveId; 1]>,
}

impl MoveNodeSelector {
    pub fn new(ddg: &DataDependenceGraph, direction: Direction, orphan_policy: OrphanPolicy) -> Self {
        let mut sel = MoveNodeSelector {
            direction,
            orphan_policy,
            ready: BinaryHeap::new(),
            queued: NodeSet::new(),
            control_flow: ddg.node_ids().filter(|&n| ddg.node(n).control_flow).collect(),
        };
        let roots = match direction {
            Direction::TopDown => ddg.source_nodes(),
            Direction::BottomUp => ddg.sink_nodes(),
        };
        for n in roots {
            sel.might_be_ready(ddg, n);
        }
        trace!("selector: {} initial groups", sel.ready.len());
        sel
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Is `n` ready, given that the members of `group` are scheduled
    /// together with it?
    pub fn is_ready(&self, ddg: &DataDependenceGraph, n: MoveId, group: &[MoveId]) -> bool {
        match self.direction {
            Direction::TopDown => ddg.other_predecessors_scheduled(n, group),
            Direction::BottomUp => ddg.other_successors_scheduled(n, group),
        }
    }

    fn priority(&self, ddg: &DataDependenceGraph, group: &MoveNodeGroup) -> u32 {
        group
            .nodes()
            .iter()
            .map(|&n| match self.direction {
                Direction::TopDown => ddg.max_sink_distance(n),
                Direction::BottomUp => ddg.max_source_distance(n),
            })
            .max()
            .unwrap_or(0)
    }

    /// Close `n` over same-operation and forced-bypass relations.
    fn collect_group(&self, ddg: &DataDependenceGraph, n: MoveId) -> MoveNodeGroup {
        let mut group = MoveNodeGroup::new();
        let mut seen = NodeSet::new();
        let mut work: Vec<MoveId> = alloc::vec![n];
        seen.insert(n);
        let mut visit = |m: MoveId, work: &mut Vec<MoveId>| {
            if seen.insert(m) {
                work.push(m);
            }
        };
        while let Some(m) = work.pop() {
            group.push(m);
            let node = ddg.node(m);
            for op in node.ops() {
                for other in ddg.op_nodes(op) {
                    visit(other, &mut work);
                }
            }
            if let Some(reg) = node.src.reg() {
                if ddg.is_forced_bypass(reg) {
                    match ddg.only_register_raw_source(m) {
                        Some(src) => visit(src, &mut work),
                        None => log::warn!("cannot find source for forced bypass of {} into {}", reg, m),
                    }
                }
            }
            if let Some(reg) = node.dst.reg() {
                if ddg.is_forced_bypass(reg) {
                    for e in ddg.out_edges(m) {
                        let edge = ddg.edge(e);
                        if edge.is_register_raw() && !edge.is_back_edge() {
                            visit(ddg.head_node(e), &mut work);
                        }
                    }
                }
            }
        }
        group.nodes.sort_unstable();
        group
    }

    /// Put the group of `n` on the ready list if every unscheduled member
    /// of it is ready. Returns whether something was added.
    pub fn might_be_ready(&mut self, ddg: &DataDependenceGraph, n: MoveId) -> bool {
        if !ddg.node(n).is_live() || ddg.is_scheduled(n) || self.queued.contains(n) {
            return false;
        }
        let mut group = self.collect_group(ddg, n);
        group
            .nodes
            .retain(|m| ddg.node(*m).is_live() && !ddg.is_scheduled(*m));
        if group.is_empty() || group.nodes().iter().any(|&m| self.queued.contains(m)) {
            return false;
        }
        if !group.nodes().iter().all(|&m| self.is_ready(ddg, m, group.nodes())) {
            return false;
        }
        for &m in group.nodes() {
            self.queued.insert(m);
        }
        let priority = self.priority(ddg, &group);
        trace!("selector: ready {} priority {}", group, priority);
        self.ready.push(Candidate {
            priority,
            first: Reverse(group.nodes()[0]),
            group,
        });
        true
    }

    /// Re-examine the neighbours that `n` may have unblocked.
    pub fn notify_scheduled(&mut self, ddg: &DataDependenceGraph, n: MoveId) {
        let neighbours = match self.direction {
            Direction::TopDown => ddg.successors(n),
            Direction::BottomUp => ddg.predecessors(n),
        };
        for m in neighbours {
            self.might_be_ready(ddg, m);
        }
        if self.direction == Direction::TopDown {
            for i in 0..self.control_flow.len() {
                let cf = self.control_flow[i];
                self.might_be_ready(ddg, cf);
            }
        }
    }

    /// The most critical ready group, or an empty group when no
    /// schedulable work remains.
    pub fn candidates(&mut self, ddg: &DataDependenceGraph) -> MoveNodeGroup {
        if let Some(group) = self.pop_ready(ddg) {
            return group;
        }
        // One sweep; nothing changes until something is scheduled.
        self.sweep(ddg);
        self.pop_ready(ddg).unwrap_or_else(MoveNodeGroup::new)
    }

    fn pop_ready(&mut self, ddg: &DataDependenceGraph) -> Option<MoveNodeGroup> {
        while let Some(c) = self.ready.pop() {
            let mut group = c.group;
            group
                .nodes
                .retain(|m| ddg.node(*m).is_live() && !ddg.is_scheduled(*m));
            if !group.is_empty() {
                trace!("selector: candidate {}", group);
                return Some(group);
            }
        }
        None
    }

    /// Recover ready nodes that no notification reached.
    fn sweep(&mut self, ddg: &DataDependenceGraph) -> usize {
        let mut recovered = 0;
        let pending: Vec<MoveId> = ddg
            .node_ids()
            .filter(|&n| !ddg.is_scheduled(n) && !self.queued.contains(n))
            .collect();
        for n in pending {
            if self.might_be_ready(ddg, n) {
                match self.orphan_policy {
                    OrphanPolicy::Warn => log::warn!("orphan node {} recovered into the ready list", n),
                    OrphanPolicy::Abort => panic!("orphan node {} was never put on the ready list", n),
                }
                recovered += 1;
            }
        }
        recovered
    }

    /// Forget that the group of `n` was handed out, so that it can be
    /// offered again after its moves were unscheduled.
    pub fn requeue(&mut self, ddg: &DataDependenceGraph, n: MoveId) {
        let group = self.collect_group(ddg, n);
        for &m in group.nodes() {
            self.queued.remove(m);
        }
        self.might_be_ready(ddg, n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineBuilder;
    use crate::{BusId, DdgBuilder, MachineDesc, Placement, Reg, RfId, Terminal};

    fn machine() -> MachineDesc {
        let mut b = MachineBuilder::new("selector-test");
        b.register_file("r", 16, 2, 2);
        b.function_unit("alu", &[("add", 1, 2, 1)]);
        b.control_unit("gcu", &[("jump", 1, 1, 0)]);
        b.fully_connected_buses(2, 8);
        b.finish()
    }

    fn r(i: u16) -> Terminal {
        Terminal::Register(Reg::new(RfId::new(0), i))
    }

    fn build(m: &MachineDesc) -> DataDependenceGraph {
        let mut b = DdgBuilder::new(m);
        let op = b.operation("add");
        b.operand(op, 0, r(1));
        b.trigger(op, 1, r(2));
        b.result(op, 2, r(3));
        b.transport(r(3), r(4));
        b.transport(Terminal::Immediate(9), r(5));
        b.transport(r(5), r(1));
        let jump = b.operation("jump");
        b.trigger(jump, 0, Terminal::Immediate(0));
        b.build().unwrap()
    }

    fn drain(ddg: &mut DataDependenceGraph, direction: Direction) -> Vec<MoveNodeGroup> {
        let mut sel = MoveNodeSelector::new(ddg, direction, OrphanPolicy::Abort);
        let mut seen = Vec::new();
        let mut cycle = match direction {
            Direction::TopDown => 0,
            Direction::BottomUp => 100,
        };
        loop {
            let group = sel.candidates(ddg);
            if group.is_empty() {
                break;
            }
            for &n in group.nodes() {
                assert!(!ddg.is_scheduled(n), "{} handed out twice", n);
                assert!(sel.is_ready(ddg, n, group.nodes()), "{} not ready", n);
            }
            for &n in group.nodes() {
                ddg.set_placement(
                    n,
                    Some(Placement {
                        cycle,
                        bus: BusId::new(0),
                    }),
                );
                cycle += match direction {
                    Direction::TopDown => 1,
                    Direction::BottomUp => -1,
                };
            }
            for &n in group.nodes() {
                sel.notify_scheduled(ddg, n);
            }
            seen.push(group);
        }
        seen
    }

    #[test]
    fn top_down_hands_out_everything_once() {
        let m = machine();
        let mut ddg = build(&m);
        let groups = drain(&mut ddg, Direction::TopDown);
        assert!(ddg.node_ids().all(|n| ddg.is_scheduled(n)));
        // The operation is one group.
        assert!(groups.iter().any(|g| g.len() == 3));
        // The jump comes last.
        let last = groups.last().unwrap();
        assert!(ddg.node(last.nodes()[0]).control_flow);
    }

    #[test]
    fn bottom_up_hands_out_everything_once() {
        let m = machine();
        let mut ddg = build(&m);
        let groups = drain(&mut ddg, Direction::BottomUp);
        assert!(ddg.node_ids().all(|n| ddg.is_scheduled(n)));
        assert_eq!(groups.iter().map(|g| g.len()).sum::<usize>(), ddg.node_count());
    }

    #[test]
    fn critical_path_first() {
        let m = machine();
        let ddg = build(&m);
        let mut sel = MoveNodeSelector::new(&ddg, Direction::TopDown, OrphanPolicy::Warn);
        let first = sel.candidates(&ddg);
        // The operation heads the longest chain: operand, trigger,
        // result and the copy reading it.
        assert_eq!(first.nodes(), &[MoveId::new(0), MoveId::new(1), MoveId::new(2)]);
    }

    #[test]
    fn orphans_are_recovered() {
        let m = machine();
        let mut b = DdgBuilder::new(&m);
        let a = b.transport(Terminal::Immediate(1), r(1));
        let c = b.transport(r(1), r(2));
        let mut ddg = b.build().unwrap();
        let mut sel = MoveNodeSelector::new(&ddg, Direction::TopDown, OrphanPolicy::Warn);
        assert_eq!(sel.candidates(&ddg).nodes(), &[a]);
        // Scheduled without telling the selector.
        ddg.set_placement(
            a,
            Some(Placement {
                cycle: 0,
                bus: BusId::new(0),
            }),
        );
        assert_eq!(sel.candidates(&ddg).nodes(), &[c]);
        assert!(sel.candidates(&ddg).is_empty());
    }

    #[test]
    #[should_panic(expected = "orphan")]
    fn orphans_abort_when_strict() {
        let m = machine();
        let mut b = DdgBuilder::new(&m);
        let a = b.transport(Terminal::Immediate(1), r(1));
        b.transport(r(1), r(2));
        let mut ddg = b.build().unwrap();
        let mut sel = MoveNodeSelector::new(&ddg, Direction::TopDown, OrphanPolicy::Abort);
        sel.candidates(&ddg);
        ddg.set_placement(
            a,
            Some(Placement {
                cycle: 0,
                bus: BusId::new(0),
            }),
        );
        sel.candidates(&ddg);
    }

    #[test]
    fn forced_bypass_joins_producer_and_consumer() {
        let mut mb = MachineBuilder::new("selector-forced");
        mb.register_file("r", 16, 2, 2);
        let bp = mb.register_file("bp", 2, 1, 1);
        mb.forced_bypass_register_file(bp);
        mb.function_unit("alu", &[("add", 1, 2, 1)]);
        mb.fully_connected_buses(2, 8);
        let m = mb.finish();
        let fb = |i: u16| Terminal::Register(Reg::new(bp, i));

        let mut b = DdgBuilder::new(&m);
        let add = b.operation("add");
        let first = b.operand(add, 0, r(1));
        b.trigger(add, 1, r(2));
        b.result(add, 2, fb(0));
        let next = b.operation("add");
        b.operand(next, 0, fb(0));
        b.trigger(next, 1, r(3));
        b.result(next, 2, r(4));
        // Reads a forced-bypass register nobody writes.
        let orphan_op = b.operation("add");
        let orphan = b.operand(orphan_op, 0, fb(1));
        b.trigger(orphan_op, 1, r(5));
        b.result(orphan_op, 2, r(6));
        let ddg = b.build().unwrap();

        let sel = MoveNodeSelector::new(&ddg, Direction::TopDown, OrphanPolicy::Abort);
        let group = sel.collect_group(&ddg, first);
        let both: Vec<MoveId> = (0..6).map(MoveId::new).collect();
        assert_eq!(group.nodes(), &both[..]);
        // Without a producer the group is just the operation.
        let group = sel.collect_group(&ddg, orphan);
        let alone: Vec<MoveId> = (6..9).map(MoveId::new).collect();
        assert_eq!(group.nodes(), &alone[..]);

        let mut sel = MoveNodeSelector::new(&ddg, Direction::TopDown, OrphanPolicy::Abort);
        let mut sizes = [sel.candidates(&ddg).len(), sel.candidates(&ddg).len()];
        sizes.sort_unstable();
        assert_eq!(sizes, [3, 6]);
        assert!(sel.candidates(&ddg).is_empty());
    }
}
