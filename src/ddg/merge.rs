/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Graph surgery for operand bypassing and dead-result elimination.

use super::{
    DataDependenceGraph, DepType, EdgeId, EdgeReason, GraphUndo, MergeUndo, MoveId, MoveRewrite,
    RemovedNode,
};
use crate::Reg;
use alloc::vec::Vec;
use smallvec::SmallVec;

impl DataDependenceGraph {
    /// The non-guard RAW edges through which `dest` reads the register
    /// written by `source`.
    fn bypassed_raw_edges(&self, source: MoveId, dest: MoveId, reg: Reg) -> SmallVec<[EdgeId; 2]> {
        self.connecting_edges(source, dest)
            .into_iter()
            .filter(|&e| {
                let edge = &self.edges[e].edge;
                edge.is_register(DepType::Raw, reg) && !edge.guard_use
            })
            .collect()
    }

    /// Whether `dest` reads the value of `source` from a previous loop
    /// iteration.
    pub fn is_loop_bypass(&self, source: MoveId, dest: MoveId) -> bool {
        self.connecting_edges(source, dest).into_iter().any(|e| {
            let edge = &self.edges[e].edge;
            edge.is_register_raw() && edge.is_back_edge()
        })
    }

    /// Check every precondition of [`merge_and_keep`](Self::merge_and_keep)
    /// without touching the graph.
    pub fn can_merge(&self, source: MoveId, dest: MoveId, force: bool) -> bool {
        if source == dest || !self.nodes[source].live || !self.nodes[dest].live {
            return false;
        }
        let Some(reg) = self.nodes[source].dst.reg() else {
            trace!("merge {} -> {}: source does not write a register", source, dest);
            return false;
        };

        let raw = self.bypassed_raw_edges(source, dest, reg);
        if raw.len() > 1 || (raw.is_empty() && !force) {
            trace!(
                "merge {} -> {}: {} RAW edges on {}",
                source,
                dest,
                raw.len(),
                reg
            );
            return false;
        }

        // Never bypass across two loop iterations at once.
        if raw.iter().any(|&e| self.edges[e].edge.is_back_edge()) {
            let crosses_again = self.in_edges(source).any(|e| {
                let edge = &self.edges[e].edge;
                edge.is_back_edge() && !edge.is_pseudo()
            });
            if crosses_again {
                trace!("merge {} -> {}: double loop bypass", source, dest);
                return false;
            }
        }

        // A copy may only be bypassed when its input has a single
        // reaching definition.
        if self.nodes[source].src.is_register() {
            let producers = self
                .in_edges(source)
                .filter(|&e| {
                    let edge = &self.edges[e].edge;
                    edge.is_register_raw() && !edge.guard_use
                })
                .count();
            if producers > 1 {
                trace!("merge {} -> {}: {} producers", source, dest, producers);
                return false;
            }
        }

        // The antidependences moved onto dest must not close a cycle.
        if let Some(read) = self.nodes[source].src.reg() {
            for e in self.out_edges(source) {
                let entry = &self.edges[e];
                if !entry.edge.is_register(DepType::War, read) || entry.edge.tail_pseudo {
                    continue;
                }
                let target = entry.head;
                if target != dest
                    && !self.exclusing_guards(dest, target)
                    && self.has_path(target, dest)
                {
                    trace!("merge {} -> {}: WAR to {} would deadlock", source, dest, target);
                    return false;
                }
            }
        }
        true
    }

    /// Rewire the edges of a bypass: `dest` stops reading the register
    /// written by `source` and inherits `source`'s dependences instead.
    /// Terminals are left alone; see
    /// [`update_move_on_bypass`](Self::update_move_on_bypass).
    pub fn merge_edges(&mut self, source: MoveId, dest: MoveId, force: bool) -> Option<GraphUndo> {
        if !self.can_merge(source, dest, force) {
            return None;
        }
        let reg = self.nodes[source].dst.reg()?;
        let read = self.nodes[source].src.reg();
        let mut undo = GraphUndo::default();

        for e in self.bypassed_raw_edges(source, dest, reg) {
            self.remove_edge(e);
            undo.removed.push(e);
        }

        let ins: SmallVec<[EdgeId; 8]> = self.in_edges(source).collect();
        for e in ins {
            let entry = self.edges[e].clone();
            let edge = entry.edge;
            if edge.guard_use || entry.tail == dest {
                continue;
            }
            if edge.reason == EdgeReason::Register
                && matches!(edge.dep, DepType::War | DepType::Waw)
                && edge.reg() == Some(reg)
            {
                continue;
            }
            if let Some(added) = self.connect_or_skip(entry.tail, dest, edge) {
                undo.added.push(added);
            }
        }

        // dest now reads what source read, so it inherits the hazards of
        // that read.
        if let Some(read) = read {
            let outs: SmallVec<[EdgeId; 8]> = self.out_edges(source).collect();
            for e in outs {
                let entry = self.edges[e].clone();
                if !entry.edge.is_register(DepType::War, read) || entry.edge.tail_pseudo {
                    continue;
                }
                let target = entry.head;
                if target == dest || self.exclusing_guards(dest, target) {
                    continue;
                }
                if let Some(added) = self.connect_or_skip(dest, target, entry.edge) {
                    undo.added.push(added);
                }
            }
        }

        // dest no longer reads `reg`.
        if read != Some(reg) {
            let outs: SmallVec<[EdgeId; 8]> = self.out_edges(dest).collect();
            for e in outs {
                let edge = &self.edges[e].edge;
                if edge.is_register(DepType::War, reg) && !edge.guard_use {
                    self.remove_edge(e);
                    undo.removed.push(e);
                }
            }
        }

        trace!(
            "merged {} into {}: -{} +{} edges",
            source,
            dest,
            undo.removed.len(),
            undo.added.len()
        );
        Some(undo)
    }

    /// Make `dest` read directly what `source` reads, linking it to the
    /// producing operation when `source` is a result move.
    pub fn update_move_on_bypass(&mut self, source: MoveId, dest: MoveId) -> MoveRewrite {
        let src = self.nodes[source].src;
        let src_op = self.nodes[source].src_op;
        let allowed = self.nodes[source].allowed_src_fus.clone();
        let node = &mut self.nodes[dest];
        let rewrite = MoveRewrite {
            node: dest,
            old_src: node.src,
            old_src_op: node.src_op,
            old_allowed_src_fus: node.allowed_src_fus.clone(),
            linked_op: src_op,
        };
        node.src = src;
        node.src_op = src_op;
        node.allowed_src_fus = allowed;
        if let Some(op) = src_op {
            let op = &mut self.ops[op];
            if op.allowed_fus.len() == 1 && node.allowed_src_fus.is_empty() {
                node.allowed_src_fus = op.allowed_fus.clone();
            }
            op.outputs.push(dest);
        }
        self.invalidate_distances();
        rewrite
    }

    pub fn undo_move_rewrite(&mut self, rewrite: MoveRewrite) {
        if let Some(op) = rewrite.linked_op {
            let outputs = &mut self.ops[op].outputs;
            let pos = outputs
                .iter()
                .rposition(|&n| n == rewrite.node)
                .unwrap_or_else(|| panic!("{} not linked to {}", rewrite.node, op));
            outputs.remove(pos);
        }
        let node = &mut self.nodes[rewrite.node];
        node.src = rewrite.old_src;
        node.src_op = rewrite.old_src_op;
        node.allowed_src_fus = rewrite.old_allowed_src_fus;
        self.invalidate_distances();
    }

    /// Bypass `source` into `dest`: `dest` reads `source`'s source
    /// directly and takes over its dependences. Fails without changing
    /// anything when the preconditions do not hold.
    pub fn merge_and_keep(&mut self, source: MoveId, dest: MoveId, force: bool) -> Option<MergeUndo> {
        let edges = self.merge_edges(source, dest, force)?;
        let rewrite = self.update_move_on_bypass(source, dest);
        Some(MergeUndo {
            source,
            dest,
            edges,
            rewrite,
        })
    }

    /// Exact inverse of [`merge_and_keep`](Self::merge_and_keep).
    pub fn un_merge(&mut self, undo: MergeUndo) {
        trace!("unmerge {} from {}", undo.source, undo.dest);
        self.undo_move_rewrite(undo.rewrite);
        self.undo(undo.edges);
    }

    /// Replay an edge-level undo record.
    pub fn undo(&mut self, undo: GraphUndo) {
        for &e in undo.added.iter().rev() {
            self.remove_edge(e);
        }
        for &(e, data) in undo.changed.iter().rev() {
            self.edges[e].edge.data = data;
        }
        for &e in undo.removed.iter().rev() {
            self.restore_edge(e);
        }
    }

    /// Is the value written by `n` still needed? Writes into function
    /// units and the return address always are; a register value is dead
    /// when nothing reads it and it is overwritten unconditionally or
    /// not live out of the region.
    pub fn result_used(&self, n: MoveId) -> bool {
        let Some(reg) = self.nodes[n].dst.reg() else {
            return true;
        };
        let mut killed = false;
        for e in self.out_edges(n) {
            let entry = &self.edges[e];
            match entry.edge.reason {
                EdgeReason::Register => match entry.edge.dep {
                    DepType::Raw => return true,
                    DepType::Waw
                        if !entry.edge.is_back_edge()
                            && self.nodes[entry.head].is_unconditional() =>
                    {
                        killed = true;
                    }
                    _ => {}
                },
                EdgeReason::Operation => {}
                _ => return true,
            }
        }
        !killed && self.is_live_out(reg)
    }

    /// Take `n` out of the graph. The node must not be scheduled.
    pub fn remove_node(&mut self, n: MoveId) -> RemovedNode {
        assert!(
            !self.nodes[n].is_scheduled(),
            "removing scheduled move {}",
            n
        );
        let mut edges: Vec<EdgeId> = self.in_edges(n).collect();
        edges.extend(self.out_edges(n));
        for &e in &edges {
            self.remove_edge(e);
        }
        let op_slot = self.nodes[n].src_op.and_then(|op| {
            let outputs = &mut self.ops[op].outputs;
            let pos = outputs.iter().position(|&o| o == n)?;
            outputs.remove(pos);
            Some((op, pos))
        });
        self.nodes[n].live = false;
        self.invalidate_distances();
        trace!("removed {} with {} edges", n, edges.len());
        RemovedNode { node: n, edges, op_slot }
    }

    pub fn restore_node(&mut self, removed: RemovedNode) {
        let n = removed.node;
        assert!(!self.nodes[n].live, "restoring live move {}", n);
        self.nodes[n].live = true;
        if let Some((op, pos)) = removed.op_slot {
            self.ops[op].outputs.insert(pos, n);
        }
        for &e in removed.edges.iter().rev() {
            self.restore_edge(e);
        }
    }
}
