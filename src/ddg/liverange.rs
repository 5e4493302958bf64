/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Live ranges and the edge maintenance that follows a renaming.

use super::{DataDependenceGraph, DepEdge, DepType, EdgeData, EdgeId, EdgeReason, GraphUndo, MoveId};
use crate::{Cycle, Reg, Terminal};
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use smallvec::SmallVec;

/// The writes, reads and guard reads sharing one register definition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LiveRange {
    pub writes: BTreeSet<MoveId>,
    pub reads: BTreeSet<MoveId>,
    pub guards: BTreeSet<MoveId>,
}

impl LiveRange {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.reads.is_empty() && self.guards.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = MoveId> + '_ {
        self.writes
            .iter()
            .chain(self.reads.iter())
            .chain(self.guards.iter())
            .copied()
    }

    pub fn contains(&self, n: MoveId) -> bool {
        self.writes.contains(&n) || self.reads.contains(&n) || self.guards.contains(&n)
    }
}

/// When a register is accessed within the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterSpan {
    Unused,
    /// Some access is not scheduled yet, so the span is not known.
    Unscheduled,
    Span { first: Cycle, last: Cycle },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Access {
    Read,
    Write,
    Guard,
}

impl DataDependenceGraph {
    /// Collect the live range `n` belongs to: through its destination
    /// register (`dest`), its guard (`guard`) or its source register.
    /// Returns an empty range when the range crosses a loop iteration or
    /// a pseudo dependence, since such ranges cannot be renamed safely.
    pub fn find_live_range(&self, n: MoveId, dest: bool, guard: bool) -> LiveRange {
        let node = &self.nodes[n];
        let reg = if dest {
            node.dst.reg()
        } else if guard {
            node.guard.map(|g| g.reg)
        } else {
            node.src.reg()
        };
        let Some(reg) = reg else {
            return LiveRange::default();
        };

        let mut lr = LiveRange::default();
        let mut write_queue: Vec<MoveId> = Vec::new();
        let mut read_queue: Vec<MoveId> = Vec::new();
        if dest {
            lr.writes.insert(n);
            write_queue.push(n);
        } else if guard {
            lr.guards.insert(n);
            read_queue.push(n);
        } else {
            lr.reads.insert(n);
            read_queue.push(n);
        }

        while !write_queue.is_empty() || !read_queue.is_empty() {
            while let Some(w) = write_queue.pop() {
                for e in self.out_edges(w) {
                    let entry = &self.edges[e];
                    if !entry.edge.is_register(DepType::Raw, reg) {
                        continue;
                    }
                    if entry.edge.is_back_edge() || entry.edge.is_pseudo() {
                        return LiveRange::default();
                    }
                    let head = entry.head;
                    let fresh = if entry.edge.guard_use {
                        lr.guards.insert(head)
                    } else {
                        lr.reads.insert(head)
                    };
                    if fresh {
                        read_queue.push(head);
                    }
                }
            }
            while let Some(r) = read_queue.pop() {
                for e in self.in_edges(r) {
                    let entry = &self.edges[e];
                    if !entry.edge.is_register(DepType::Raw, reg) {
                        continue;
                    }
                    if entry.edge.is_back_edge() || entry.edge.is_pseudo() {
                        return LiveRange::default();
                    }
                    if lr.writes.insert(entry.tail) {
                        write_queue.push(entry.tail);
                    }
                }
            }
        }
        lr
    }

    /// Fix up the anti dependences leaving `n` after its source register
    /// was renamed. Edges to writes of the old register disappear; edges
    /// to writes of the new one are retagged.
    pub fn source_renamed(&mut self, n: MoveId) -> GraphUndo {
        let Some(new_reg) = self.nodes[n].src.reg() else {
            return GraphUndo::default();
        };
        self.reads_renamed(n, new_reg, false)
    }

    pub fn guard_renamed(&mut self, n: MoveId) -> GraphUndo {
        let Some(guard) = self.nodes[n].guard else {
            panic!("guard_renamed on unconditional move {}", n);
        };
        self.reads_renamed(n, guard.reg, true)
    }

    fn reads_renamed(&mut self, n: MoveId, new_reg: Reg, guard_use: bool) -> GraphUndo {
        let mut undo = GraphUndo::default();
        let outs: SmallVec<[EdgeId; 8]> = self.out_edges(n).collect();
        for e in outs {
            let entry = &self.edges[e];
            let edge = entry.edge;
            if edge.reason != EdgeReason::Register
                || edge.dep != DepType::War
                || edge.tail_pseudo
                || edge.guard_use != guard_use
            {
                continue;
            }
            let writes_other = match self.nodes[entry.head].dst {
                Terminal::Register(r) => r != new_reg,
                _ => false,
            };
            if edge.head_pseudo || writes_other {
                self.remove_edge(e);
                undo.removed.push(e);
            } else {
                self.retag(e, new_reg, &mut undo);
            }
        }
        undo
    }

    fn retag(&mut self, e: EdgeId, reg: Reg, undo: &mut GraphUndo) {
        let data = &mut self.edges[e].edge.data;
        if *data != EdgeData::Register(reg) {
            undo.changed.push((e, *data));
            *data = EdgeData::Register(reg);
        }
    }

    /// Fix up the edges of `n` after its destination register was
    /// renamed to one not otherwise live across it. Its readers are
    /// assumed to be renamed as well.
    pub fn dest_renamed(&mut self, n: MoveId) -> GraphUndo {
        let Some(new_reg) = self.nodes[n].dst.reg() else {
            return GraphUndo::default();
        };
        let mut undo = GraphUndo::default();
        undo.added = self.copy_deps_over(n);

        let ins: SmallVec<[EdgeId; 8]> = self.in_edges(n).collect();
        for e in ins {
            let entry = &self.edges[e];
            let edge = entry.edge;
            if edge.reason != EdgeReason::Register || edge.head_pseudo {
                continue;
            }
            let tail = &self.nodes[entry.tail];
            let remove = match edge.dep {
                DepType::Waw => {
                    edge.tail_pseudo || tail.dst.reg().map_or(false, |r| r != new_reg)
                }
                DepType::War if edge.tail_pseudo => continue,
                DepType::War if edge.guard_use => match tail.guard {
                    None => true,
                    Some(g) => g.reg != new_reg,
                },
                DepType::War => tail.src.reg().map_or(false, |r| r != new_reg),
                _ => continue,
            };
            if remove {
                self.remove_edge(e);
                undo.removed.push(e);
            } else {
                self.retag(e, new_reg, &mut undo);
            }
        }

        let outs: SmallVec<[EdgeId; 8]> = self.out_edges(n).collect();
        for e in outs {
            let entry = &self.edges[e];
            let edge = entry.edge;
            if edge.reason != EdgeReason::Register || edge.tail_pseudo {
                continue;
            }
            match edge.dep {
                DepType::Raw => self.retag(e, new_reg, &mut undo),
                DepType::Waw => {
                    let writes_other = self.nodes[entry.head]
                        .dst
                        .reg()
                        .map_or(false, |r| r != new_reg);
                    if edge.head_pseudo || writes_other {
                        self.remove_edge(e);
                        undo.removed.push(e);
                    } else {
                        self.retag(e, new_reg, &mut undo);
                    }
                }
                _ => {}
            }
        }
        undo
    }

    /// Before `n` stops writing its old register, give its neighbours the
    /// ordering `n` used to impose: WAW+WAW becomes WAW and WAR+WAW
    /// becomes WAR between `n`'s predecessor and successor.
    fn copy_deps_over(&mut self, n: MoveId) -> Vec<EdgeId> {
        let mut created = Vec::new();
        let ins: SmallVec<[EdgeId; 8]> = self.in_edges(n).collect();
        let outs: SmallVec<[EdgeId; 8]> = self.out_edges(n).collect();
        for &o in &outs {
            let out = self.edges[o].clone();
            if !matches!(out.edge.reason, EdgeReason::Register | EdgeReason::ReturnAddress)
                || out.edge.dep != DepType::Waw
            {
                continue;
            }
            for &i in &ins {
                let inc = self.edges[i].clone();
                if !matches!(inc.edge.reason, EdgeReason::Register | EdgeReason::ReturnAddress)
                    || inc.edge.data != out.edge.data
                {
                    continue;
                }
                let copy = match inc.edge.dep {
                    DepType::Waw => !self.exclusing_guards(inc.tail, out.head),
                    DepType::War => !self.exclusing_guards(inc.tail, out.head) || inc.edge.guard_use,
                    _ => false,
                };
                if !copy || inc.tail == out.head {
                    continue;
                }
                let mut edge = DepEdge::new(inc.edge.reason, inc.edge.dep, inc.edge.data);
                edge.guard_use = inc.edge.guard_use;
                edge.tail_pseudo = inc.edge.tail_pseudo;
                edge.head_pseudo = out.edge.head_pseudo;
                edge.loop_depth = inc.edge.loop_depth + out.edge.loop_depth;
                if let Some(e) = self.connect_or_skip(inc.tail, out.head, edge) {
                    created.push(e);
                }
            }
        }
        created
    }

    fn register_accesses(&self, reg: Reg) -> impl Iterator<Item = (MoveId, Access)> + '_ {
        self.node_ids().flat_map(move |n| {
            let node = &self.nodes[n];
            let mut acc: SmallVec<[(MoveId, Access); 3]> = SmallVec::new();
            if node.src.reg() == Some(reg) {
                acc.push((n, Access::Read));
            }
            if node.dst.reg() == Some(reg) {
                acc.push((n, Access::Write));
            }
            if node.guard.map(|g| g.reg) == Some(reg) {
                acc.push((n, Access::Guard));
            }
            acc.into_iter()
        })
    }

    /// First and last cycle at which any move touches `reg`.
    pub fn register_span(&self, reg: Reg) -> RegisterSpan {
        let mut span: Option<(Cycle, Cycle)> = None;
        for (n, _) in self.register_accesses(reg) {
            let Some(p) = self.nodes[n].placement else {
                return RegisterSpan::Unscheduled;
            };
            span = Some(match span {
                None => (p.cycle, p.cycle),
                Some((f, l)) => (f.min(p.cycle), l.max(p.cycle)),
            });
        }
        match span {
            None => RegisterSpan::Unused,
            Some((first, last)) => RegisterSpan::Span { first, last },
        }
    }

    fn scheduled_accesses(&self, reg: Reg, kind: Access) -> impl Iterator<Item = (MoveId, Cycle)> + '_ {
        self.register_accesses(reg)
            .filter(move |&(_, a)| a == kind)
            .filter_map(move |(n, _)| self.nodes[n].placement.map(|p| (n, p.cycle)))
    }

    /// The scheduled unconditional write of `reg` in the latest cycle.
    pub fn last_scheduled_register_kill(&self, reg: Reg) -> Option<MoveId> {
        self.scheduled_accesses(reg, Access::Write)
            .filter(|&(n, _)| self.nodes[n].is_unconditional())
            .max_by_key(|&(n, c)| (c, n))
            .map(|(n, _)| n)
    }

    pub fn first_scheduled_register_kill(&self, reg: Reg) -> Option<MoveId> {
        self.scheduled_accesses(reg, Access::Write)
            .filter(|&(n, _)| self.nodes[n].is_unconditional())
            .min_by_key(|&(n, c)| (c, n))
            .map(|(n, _)| n)
    }

    fn last_kill_cycle(&self, reg: Reg) -> Option<Cycle> {
        self.last_scheduled_register_kill(reg)
            .map(|n| self.nodes[n].cycle())
    }

    /// Scheduled reads of `reg` after its last unconditional write.
    pub fn last_scheduled_register_reads(&self, reg: Reg) -> SmallVec<[MoveId; 4]> {
        let kill = self.last_kill_cycle(reg);
        self.scheduled_accesses(reg, Access::Read)
            .filter(|&(_, c)| kill.map_or(true, |k| c > k))
            .map(|(n, _)| n)
            .collect()
    }

    pub fn last_scheduled_register_guard_reads(&self, reg: Reg) -> SmallVec<[MoveId; 4]> {
        let kill = self.last_kill_cycle(reg);
        self.scheduled_accesses(reg, Access::Guard)
            .filter(|&(_, c)| kill.map_or(true, |k| c > k))
            .map(|(n, _)| n)
            .collect()
    }

    /// The last unconditional write of `reg` plus any conditional writes
    /// after it.
    pub fn last_scheduled_register_writes(&self, reg: Reg) -> SmallVec<[MoveId; 4]> {
        let kill = self.last_kill_cycle(reg);
        self.scheduled_accesses(reg, Access::Write)
            .filter(|&(_, c)| kill.map_or(true, |k| c >= k))
            .map(|(n, _)| n)
            .collect()
    }

    /// The first unconditional write of `reg` plus any conditional writes
    /// before it.
    pub fn first_scheduled_register_writes(&self, reg: Reg) -> SmallVec<[MoveId; 4]> {
        let kill = self
            .first_scheduled_register_kill(reg)
            .map(|n| self.nodes[n].cycle());
        self.scheduled_accesses(reg, Access::Write)
            .filter(|&(_, c)| kill.map_or(true, |k| c <= k))
            .map(|(n, _)| n)
            .collect()
    }

    /// Registers referenced anywhere in the graph.
    pub fn used_registers(&self) -> BTreeSet<Reg> {
        let mut regs = BTreeSet::new();
        for n in self.node_ids() {
            let node = &self.nodes[n];
            regs.extend(node.src.reg());
            regs.extend(node.dst.reg());
            regs.extend(node.guard.map(|g| g.reg));
        }
        regs
    }
}
