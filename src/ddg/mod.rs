/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Data dependence graph over the moves of a block.
//!
//! Nodes, edges and operations live in arenas and refer to each other
//! only by id. Edges are never freed: removing an edge only unlinks it
//! from its endpoints, so that undo records can revive exactly the same
//! edge later. The same holds for nodes taken out by dead-result
//! elimination.

mod builder;
mod data_structures;
mod liverange;
mod merge;
mod ready;
mod subgraph;

#[cfg(test)]
mod tests;

pub use builder::{BlockMove, DdgBuilder};
pub use data_structures::{
    BoundaryEdge, DepEdge, DepType, EdgeData, EdgeEntry, EdgeId, EdgeReason, Edges, GraphUndo,
    MemoryAccess, MergeUndo, MoveId, MoveNode, MoveNodes, MoveRewrite, OpId, Operations,
    ProgramOperation, RemovedNode,
};
pub use liverange::{LiveRange, RegisterSpan};

use crate::machine::Machine;
use crate::nodeset::NodeSet;
use crate::{FuId, FxHashSet, Placement, Reg, RfId};
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;
use smallvec::{smallvec, SmallVec};

#[derive(Clone, Debug, Default)]
struct DistanceCache {
    to_sink: Option<Vec<u32>>,
    to_source: Option<Vec<u32>>,
}

#[derive(Clone, Debug)]
pub struct DataDependenceGraph {
    pub(crate) nodes: MoveNodes,
    pub(crate) edges: Edges,
    pub(crate) ops: Operations,
    /// Register files whose values must be bypassed away.
    pub(crate) forced_bypass_rfs: SmallVec<[RfId; 2]>,
    /// Total guard latency per register file.
    pub(crate) guard_latency: SmallVec<[u32; 4]>,
    /// Registers read after the graph's region. `None` when unknown,
    /// in which case every register is assumed live.
    pub(crate) live_out: Option<FxHashSet<Reg>>,
    /// Registers holding a value on entry to the region.
    pub(crate) live_in: FxHashSet<Reg>,
    pub(crate) boundary: Vec<BoundaryEdge>,
    /// For subgraphs: the parent id of every local node.
    pub(crate) parent_ids: Vec<MoveId>,
    distances: RefCell<DistanceCache>,
}

impl DataDependenceGraph {
    pub fn new<M: Machine + ?Sized>(machine: &M) -> Self {
        let forced_bypass_rfs = machine
            .register_files()
            .iter()
            .enumerate()
            .filter(|(_, rf)| rf.forced_bypass)
            .map(|(i, _)| RfId::new(i))
            .collect();
        let guard_latency = (0..machine.register_files().len())
            .map(|i| machine.guard_latency(RfId::new(i)))
            .collect();
        DataDependenceGraph {
            nodes: MoveNodes::default(),
            edges: Edges::default(),
            ops: Operations::default(),
            forced_bypass_rfs,
            guard_latency,
            live_out: None,
            live_in: FxHashSet::default(),
            boundary: Vec::new(),
            parent_ids: Vec::new(),
            distances: RefCell::new(DistanceCache::default()),
        }
    }

    #[inline(always)]
    pub fn node(&self, n: MoveId) -> &MoveNode {
        &self.nodes[n]
    }

    #[inline(always)]
    pub fn node_mut(&mut self, n: MoveId) -> &mut MoveNode {
        &mut self.nodes[n]
    }

    #[inline(always)]
    pub fn op(&self, op: OpId) -> &ProgramOperation {
        &self.ops[op]
    }

    #[inline(always)]
    pub fn op_mut(&mut self, op: OpId) -> &mut ProgramOperation {
        &mut self.ops[op]
    }

    #[inline(always)]
    pub fn edge(&self, e: EdgeId) -> &DepEdge {
        &self.edges[e].edge
    }

    #[inline(always)]
    pub fn edge_entry(&self, e: EdgeId) -> &EdgeEntry {
        &self.edges[e]
    }

    #[inline(always)]
    pub fn tail_node(&self, e: EdgeId) -> MoveId {
        self.edges[e].tail
    }

    #[inline(always)]
    pub fn head_node(&self, e: EdgeId) -> MoveId {
        self.edges[e].head
    }

    /// Live nodes, in creation order.
    pub fn node_ids(&self) -> impl Iterator<Item = MoveId> + '_ {
        self.nodes.ids().filter(move |&n| self.nodes[n].live)
    }

    pub fn node_count(&self) -> usize {
        self.node_ids().count()
    }

    pub fn op_ids(&self) -> impl Iterator<Item = OpId> + '_ {
        self.ops.ids()
    }

    /// Live edges, in creation order.
    pub fn edge_ids(&self) -> impl Iterator<Item = EdgeId> + '_ {
        self.edges.ids().filter(move |&e| self.edges[e].live)
    }

    pub fn edge_count(&self) -> usize {
        self.edge_ids().count()
    }

    /// Cross-block edges recorded when this graph was extracted.
    pub fn boundary_edges(&self) -> &[BoundaryEdge] {
        &self.boundary
    }

    /// Id of `n` in the graph this one was extracted from.
    pub fn parent_id(&self, n: MoveId) -> MoveId {
        self.parent_ids.get(n.index()).copied().unwrap_or(n)
    }

    pub fn set_live_out(&mut self, regs: FxHashSet<Reg>) {
        self.live_out = Some(regs);
    }

    pub fn set_live_in(&mut self, regs: FxHashSet<Reg>) {
        self.live_in = regs;
    }

    pub fn is_live_in(&self, reg: Reg) -> bool {
        self.live_in.contains(&reg)
    }

    /// Forced-bypass registers never hold a value past the region.
    pub fn is_live_out(&self, reg: Reg) -> bool {
        !self.is_forced_bypass(reg) && self.live_out.as_ref().map_or(true, |set| set.contains(&reg))
    }

    pub fn is_forced_bypass(&self, reg: Reg) -> bool {
        self.forced_bypass_rfs.contains(&reg.rf)
    }

    pub fn guard_latency(&self, reg: Reg) -> u32 {
        self.guard_latency.get(reg.rf.index()).copied().unwrap_or(1)
    }

    pub fn add_node(&mut self, node: MoveNode) -> MoveId {
        self.invalidate_distances();
        self.nodes.push(node)
    }

    pub fn add_operation(
        &mut self,
        opcode: &str,
        allowed_fus: SmallVec<[FuId; 2]>,
        latency: u32,
    ) -> OpId {
        self.ops.push(ProgramOperation {
            opcode: String::from(opcode),
            inputs: SmallVec::new(),
            outputs: SmallVec::new(),
            allowed_fus,
            latency,
            fu: None,
            memory: None,
        })
    }

    pub fn add_input(&mut self, op: OpId, n: MoveId) {
        debug_assert!(self.nodes[n].dst_op.is_none());
        self.nodes[n].dst_op = Some(op);
        self.ops[op].inputs.push(n);
    }

    pub fn add_output(&mut self, op: OpId, n: MoveId) {
        self.nodes[n].src_op = Some(op);
        self.ops[op].outputs.push(n);
    }

    /// The input that starts `op`, if present.
    pub fn trigger(&self, op: OpId) -> Option<MoveId> {
        self.ops[op]
            .inputs
            .iter()
            .copied()
            .find(|&n| self.nodes[n].is_trigger())
    }

    /// Every node belonging to `op`, inputs first.
    pub fn op_nodes(&self, op: OpId) -> impl Iterator<Item = MoveId> + '_ {
        let op = &self.ops[op];
        op.inputs.iter().chain(op.outputs.iter()).copied()
    }

    /// Do `a` and `b` belong to a common operation?
    pub fn same_operation(&self, a: MoveId, b: MoveId) -> bool {
        let a = &self.nodes[a];
        let b = &self.nodes[b];
        a.ops().any(|op| b.ops().any(|other| other == op))
    }

    /// Record where a move was placed. Only resource managers call this.
    pub fn set_placement(&mut self, n: MoveId, placement: Option<Placement>) {
        self.nodes[n].placement = placement;
    }

    pub fn is_scheduled(&self, n: MoveId) -> bool {
        self.nodes[n].is_scheduled()
    }

    pub fn connect_nodes(&mut self, tail: MoveId, head: MoveId, edge: DepEdge) -> EdgeId {
        debug_assert!(self.nodes[tail].live && self.nodes[head].live);
        let e = self.edges.push(EdgeEntry {
            tail,
            head,
            edge,
            live: true,
        });
        self.nodes[tail].outs.push(e);
        self.nodes[head].ins.push(e);
        self.invalidate_distances();
        trace!("ddg: connect {} -> {} ({}) as e{}", tail, head, edge, e.0);
        e
    }

    /// Connect unless an identical live edge already links the pair.
    pub fn connect_or_skip(&mut self, tail: MoveId, head: MoveId, edge: DepEdge) -> Option<EdgeId> {
        if self.has_equal_edge(tail, head, &edge) {
            None
        } else {
            Some(self.connect_nodes(tail, head, edge))
        }
    }

    pub fn has_equal_edge(&self, tail: MoveId, head: MoveId, edge: &DepEdge) -> bool {
        self.nodes[tail]
            .outs
            .iter()
            .any(|&e| self.edges[e].head == head && self.edges[e].edge == *edge)
    }

    pub fn remove_edge(&mut self, e: EdgeId) {
        let entry = &mut self.edges[e];
        assert!(entry.live, "removing dead edge e{}", e.0);
        entry.live = false;
        let (tail, head) = (entry.tail, entry.head);
        self.nodes[tail].outs.retain(|x| *x != e);
        self.nodes[head].ins.retain(|x| *x != e);
        self.invalidate_distances();
        trace!("ddg: remove e{} {} -> {}", e.0, tail, head);
    }

    /// Bring back an edge removed earlier, with identical flags.
    pub fn restore_edge(&mut self, e: EdgeId) {
        let entry = &mut self.edges[e];
        assert!(!entry.live, "restoring live edge e{}", e.0);
        entry.live = true;
        let (tail, head) = (entry.tail, entry.head);
        self.nodes[tail].outs.push(e);
        self.nodes[head].ins.push(e);
        self.invalidate_distances();
    }

    pub fn in_edges(&self, n: MoveId) -> impl Iterator<Item = EdgeId> + '_ {
        self.nodes[n].ins.iter().copied()
    }

    pub fn out_edges(&self, n: MoveId) -> impl Iterator<Item = EdgeId> + '_ {
        self.nodes[n].outs.iter().copied()
    }

    pub fn in_degree(&self, n: MoveId) -> usize {
        self.nodes[n].ins.len()
    }

    pub fn out_degree(&self, n: MoveId) -> usize {
        self.nodes[n].outs.len()
    }

    /// All live edges from `a` to `b`. There may be several, with
    /// different reasons or registers; callers filter.
    pub fn connecting_edges(&self, a: MoveId, b: MoveId) -> SmallVec<[EdgeId; 2]> {
        self.nodes[a]
            .outs
            .iter()
            .copied()
            .filter(|&e| self.edges[e].head == b)
            .collect()
    }

    pub fn predecessors(&self, n: MoveId) -> SmallVec<[MoveId; 8]> {
        let mut preds: SmallVec<[MoveId; 8]> =
            self.in_edges(n).map(|e| self.edges[e].tail).collect();
        preds.sort_unstable();
        preds.dedup();
        preds
    }

    pub fn successors(&self, n: MoveId) -> SmallVec<[MoveId; 8]> {
        let mut succs: SmallVec<[MoveId; 8]> =
            self.out_edges(n).map(|e| self.edges[e].head).collect();
        succs.sort_unstable();
        succs.dedup();
        succs
    }

    /// Is `to` reachable from `from` along edges that stay inside one
    /// iteration?
    pub fn has_path(&self, from: MoveId, to: MoveId) -> bool {
        if from == to {
            return true;
        }
        let mut visited = NodeSet::with_capacity(self.nodes.len());
        let mut stack: SmallVec<[MoveId; 16]> = smallvec![from];
        visited.insert(from);
        while let Some(n) = stack.pop() {
            for e in self.out_edges(n) {
                let entry = &self.edges[e];
                if entry.edge.is_back_edge() {
                    continue;
                }
                if entry.head == to {
                    return true;
                }
                if visited.insert(entry.head) {
                    stack.push(entry.head);
                }
            }
        }
        false
    }

    /// Nodes without outgoing intra-iteration edges.
    pub fn sink_nodes(&self) -> Vec<MoveId> {
        self.node_ids()
            .filter(|&n| self.out_edges(n).all(|e| self.edge(e).is_back_edge()))
            .collect()
    }

    /// Nodes without incoming intra-iteration edges.
    pub fn source_nodes(&self) -> Vec<MoveId> {
        self.node_ids()
            .filter(|&n| self.in_edges(n).all(|e| self.edge(e).is_back_edge()))
            .collect()
    }

    pub fn exclusing_guards(&self, a: MoveId, b: MoveId) -> bool {
        self.nodes[a].guard_excludes(&self.nodes[b])
    }

    /// The single move whose register value `n` reads, when the value
    /// has exactly one reaching definition.
    pub fn only_register_raw_source(&self, n: MoveId) -> Option<MoveId> {
        let mut found = None;
        for e in self.in_edges(n) {
            let entry = &self.edges[e];
            if entry.edge.is_register_raw() && !entry.edge.guard_use {
                if found.is_some() {
                    return None;
                }
                found = Some(entry.tail);
            }
        }
        found
    }

    /// The moves reading the register `n` writes, or `None` when some of
    /// them read it as a guard or in a later iteration.
    pub fn only_register_raw_destinations(&self, n: MoveId) -> Option<SmallVec<[MoveId; 4]>> {
        let mut dests = SmallVec::new();
        for e in self.out_edges(n) {
            let entry = &self.edges[e];
            if entry.edge.is_register_raw() {
                if entry.edge.guard_use || entry.edge.is_back_edge() {
                    return None;
                }
                dests.push(entry.head);
            }
        }
        Some(dests)
    }

    pub(crate) fn invalidate_distances(&self) {
        let mut cache = self.distances.borrow_mut();
        cache.to_sink = None;
        cache.to_source = None;
    }

    /// Multi-line dump for trace logs.
    pub fn dump(&self) {
        if !trace_enabled!() {
            return;
        }
        trace!("ddg: {} nodes, {} edges", self.node_count(), self.edge_count());
        for n in self.node_ids() {
            trace!("  {}: {}", n, self.nodes[n]);
            for e in self.out_edges(n) {
                trace!("    -> {} {}", self.edges[e].head, self.edges[e].edge);
            }
        }
    }

    /// Snapshot of the live edge set, for comparing graph states.
    pub fn edge_snapshot(&self) -> Vec<(MoveId, MoveId, DepEdge)> {
        let mut v: Vec<_> = self
            .edge_ids()
            .map(|e| {
                let entry = &self.edges[e];
                (entry.tail, entry.head, entry.edge)
            })
            .collect();
        v.sort_by_key(|(t, h, edge)| (*t, *h, alloc::format!("{}", edge)));
        v
    }

    pub(crate) fn empty_like(&self) -> Self {
        DataDependenceGraph {
            nodes: MoveNodes::default(),
            edges: Edges::default(),
            ops: Operations::default(),
            forced_bypass_rfs: self.forced_bypass_rfs.clone(),
            guard_latency: self.guard_latency.clone(),
            live_out: self.live_out.clone(),
            live_in: self.live_in.clone(),
            boundary: vec![],
            parent_ids: vec![],
            distances: RefCell::new(DistanceCache::default()),
        }
    }
}
