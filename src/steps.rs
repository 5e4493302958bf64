/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The individual reversible steps the scheduler composes.

use crate::ddg::{DepEdge, EdgeId, GraphUndo, MoveRewrite, RemovedNode};
use crate::renamer::RenameUndo;
use crate::reversible::{Children, Context, Reversible};
use crate::{Cycle, Direction, MoveId};
use alloc::boxed::Box;
use smallvec::SmallVec;

/// Place a move with the resource manager.
#[derive(Debug)]
pub struct AssignMove {
    node: MoveId,
    cycle: Cycle,
    done: bool,
}

impl AssignMove {
    pub fn new(node: MoveId, cycle: Cycle) -> Self {
        AssignMove {
            node,
            cycle,
            done: false,
        }
    }
}

impl Reversible for AssignMove {
    fn execute(&mut self, cx: &mut Context<'_, '_>) -> bool {
        if cx.ddg.is_scheduled(self.node) || !cx.rm.can_assign(cx.ddg, self.cycle, self.node) {
            return false;
        }
        cx.rm.assign(cx.ddg, self.cycle, self.node);
        self.done = true;
        true
    }

    fn undo_only_me(&mut self, cx: &mut Context<'_, '_>) {
        // The move may have been taken off its cycle since.
        if core::mem::take(&mut self.done) && cx.ddg.is_scheduled(self.node) {
            cx.rm.unassign(cx.ddg, self.node);
        }
    }
}

/// Take a move off its cycle; undo puts it back in the same cycle.
#[derive(Debug)]
pub struct UnassignMove {
    node: MoveId,
    cycle: Option<Cycle>,
}

impl UnassignMove {
    pub fn new(node: MoveId) -> Self {
        UnassignMove { node, cycle: None }
    }
}

impl Reversible for UnassignMove {
    fn execute(&mut self, cx: &mut Context<'_, '_>) -> bool {
        let Some(p) = cx.ddg.node(self.node).placement else {
            return false;
        };
        cx.rm.unassign(cx.ddg, self.node);
        self.cycle = Some(p.cycle);
        true
    }

    fn undo_only_me(&mut self, cx: &mut Context<'_, '_>) {
        if let Some(cycle) = self.cycle.take() {
            cx.rm.assign(cx.ddg, cycle, self.node);
        }
    }
}

/// Rewrite the terminals of a bypassed move.
#[derive(Debug)]
pub struct UpdateMoveOnBypass {
    source: MoveId,
    dest: MoveId,
    rewrite: Option<MoveRewrite>,
}

impl UpdateMoveOnBypass {
    pub fn new(source: MoveId, dest: MoveId) -> Self {
        UpdateMoveOnBypass {
            source,
            dest,
            rewrite: None,
        }
    }
}

impl Reversible for UpdateMoveOnBypass {
    fn execute(&mut self, cx: &mut Context<'_, '_>) -> bool {
        self.rewrite = Some(cx.ddg.update_move_on_bypass(self.source, self.dest));
        true
    }

    fn undo_only_me(&mut self, cx: &mut Context<'_, '_>) {
        if let Some(rewrite) = self.rewrite.take() {
            cx.ddg.undo_move_rewrite(rewrite);
        }
    }
}

/// Bypass `source` into `dest`: move the edges, then rewrite `dest` in a
/// post child.
#[derive(Debug)]
pub struct MergeAndKeepEdges {
    source: MoveId,
    dest: MoveId,
    force: bool,
    edges: Option<GraphUndo>,
    children: Children,
}

impl MergeAndKeepEdges {
    pub fn new(source: MoveId, dest: MoveId, force: bool) -> Self {
        MergeAndKeepEdges {
            source,
            dest,
            force,
            edges: None,
            children: Children::new(),
        }
    }

    pub fn source(&self) -> MoveId {
        self.source
    }

    pub fn dest(&self) -> MoveId {
        self.dest
    }
}

impl Reversible for MergeAndKeepEdges {
    fn execute(&mut self, cx: &mut Context<'_, '_>) -> bool {
        let Some(edges) = cx.ddg.merge_edges(self.source, self.dest, self.force) else {
            return false;
        };
        self.edges = Some(edges);
        let update = UpdateMoveOnBypass::new(self.source, self.dest);
        if !self.children.run_post(cx, Box::new(update)) {
            self.undo_only_me(cx);
            return false;
        }
        true
    }

    fn undo_only_me(&mut self, cx: &mut Context<'_, '_>) {
        if let Some(edges) = self.edges.take() {
            cx.ddg.undo(edges);
        }
    }

    fn children(&mut self) -> Option<&mut Children> {
        Some(&mut self.children)
    }
}

#[derive(Debug)]
pub struct RemoveEdge {
    edge: EdgeId,
    done: bool,
}

impl RemoveEdge {
    pub fn new(edge: EdgeId) -> Self {
        RemoveEdge { edge, done: false }
    }
}

impl Reversible for RemoveEdge {
    fn execute(&mut self, cx: &mut Context<'_, '_>) -> bool {
        if !cx.ddg.edge_entry(self.edge).live {
            return false;
        }
        let head = cx.ddg.edge_entry(self.edge).head;
        let tail = cx.ddg.edge_entry(self.edge).tail;
        cx.ddg.remove_edge(self.edge);
        self.done = true;
        cx.might_be_ready(head);
        cx.might_be_ready(tail);
        true
    }

    fn undo_only_me(&mut self, cx: &mut Context<'_, '_>) {
        if core::mem::take(&mut self.done) {
            cx.ddg.restore_edge(self.edge);
        }
    }
}

/// Add an edge unless an equal one exists. Refuses edges that would
/// close a cycle.
#[derive(Debug)]
pub struct ConnectNodes {
    tail: MoveId,
    head: MoveId,
    edge: DepEdge,
    created: Option<EdgeId>,
}

impl ConnectNodes {
    pub fn new(tail: MoveId, head: MoveId, edge: DepEdge) -> Self {
        ConnectNodes {
            tail,
            head,
            edge,
            created: None,
        }
    }

    pub fn created(&self) -> Option<EdgeId> {
        self.created
    }
}

impl Reversible for ConnectNodes {
    fn execute(&mut self, cx: &mut Context<'_, '_>) -> bool {
        if self.tail == self.head
            || (!self.edge.is_back_edge() && cx.ddg.has_path(self.head, self.tail))
        {
            return false;
        }
        self.created = cx.ddg.connect_or_skip(self.tail, self.head, self.edge);
        true
    }

    fn undo_only_me(&mut self, cx: &mut Context<'_, '_>) {
        if let Some(e) = self.created.take() {
            cx.ddg.remove_edge(e);
        }
    }
}

/// Move the live range around `node` to another register.
#[derive(Debug)]
pub struct RenameLiveRange {
    node: MoveId,
    dest: bool,
    cycle: Cycle,
    direction: Direction,
    undo: Option<RenameUndo>,
}

impl RenameLiveRange {
    /// Rename the range `node` writes (`dest`) or reads, so that `node`
    /// fits at `cycle` when scheduling in `direction`.
    pub fn new(node: MoveId, dest: bool, cycle: Cycle, direction: Direction) -> Self {
        RenameLiveRange {
            node,
            dest,
            cycle,
            direction,
            undo: None,
        }
    }

    pub fn renamed(&self) -> Option<&RenameUndo> {
        self.undo.as_ref()
    }
}

impl Reversible for RenameLiveRange {
    fn execute(&mut self, cx: &mut Context<'_, '_>) -> bool {
        let Some(renamer) = cx.renamer.as_deref_mut() else {
            return false;
        };
        let undo = if self.dest {
            renamer.rename_destination(cx.ddg, self.node, self.cycle, self.direction)
        } else {
            renamer.rename_source(cx.ddg, self.node, self.cycle, self.direction)
        };
        let Some(undo) = undo else {
            return false;
        };
        let touched: SmallVec<[MoveId; 8]> = undo
            .renamed_nodes()
            .flat_map(|n| {
                let mut v = cx.ddg.successors(n);
                v.extend(cx.ddg.predecessors(n));
                v
            })
            .collect();
        for n in touched {
            cx.might_be_ready(n);
        }
        self.undo = Some(undo);
        true
    }

    fn undo_only_me(&mut self, cx: &mut Context<'_, '_>) {
        let Some(undo) = self.undo.take() else {
            return;
        };
        match cx.renamer.as_deref_mut() {
            Some(renamer) => renamer.undo_rename(cx.ddg, undo),
            None => panic!("undoing a rename without a renamer"),
        }
    }
}

/// Drop a move whose result nobody reads any more. A scheduled move is
/// unassigned first; undo puts it back into its old cycle.
#[derive(Debug)]
pub struct RemoveDeadResult {
    node: MoveId,
    cycle: Option<Cycle>,
    removed: Option<RemovedNode>,
}

impl RemoveDeadResult {
    pub fn new(node: MoveId) -> Self {
        RemoveDeadResult {
            node,
            cycle: None,
            removed: None,
        }
    }
}

impl Reversible for RemoveDeadResult {
    fn execute(&mut self, cx: &mut Context<'_, '_>) -> bool {
        let node = cx.ddg.node(self.node);
        if !node.is_live() || !node.is_result_move() || cx.ddg.result_used(self.node) {
            return false;
        }
        let mut neighbours = cx.ddg.predecessors(self.node);
        neighbours.extend(cx.ddg.successors(self.node));
        if let Some(p) = cx.ddg.node(self.node).placement {
            cx.rm.unassign(cx.ddg, self.node);
            self.cycle = Some(p.cycle);
        }
        self.removed = Some(cx.ddg.remove_node(self.node));
        trace!("dead result {} removed", self.node);
        for n in neighbours {
            cx.might_be_ready(n);
        }
        true
    }

    fn undo_only_me(&mut self, cx: &mut Context<'_, '_>) {
        if let Some(removed) = self.removed.take() {
            cx.ddg.restore_node(removed);
        }
        if let Some(cycle) = self.cycle.take() {
            cx.rm.assign(cx.ddg, cycle, self.node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddg::{DataDependenceGraph, DdgBuilder, DepType};
    use crate::machine::MachineBuilder;
    use crate::reversible::Attempt;
    use crate::resource::SimpleResourceManager;
    use crate::{MachineDesc, Reg, RfId, Terminal};

    fn machine() -> MachineDesc {
        let mut b = MachineBuilder::new("steps-test");
        b.register_file("r", 16, 2, 2);
        b.function_unit("alu", &[("add", 1, 2, 1)]);
        b.fully_connected_buses(2, 8);
        b.finish()
    }

    fn r(i: u16) -> Terminal {
        Terminal::Register(Reg::new(RfId::new(0), i))
    }

    /// `result -> r1; r1 -> add.0` with the add's other operand and
    /// trigger.
    fn chain(m: &MachineDesc) -> (DataDependenceGraph, MoveId, MoveId) {
        let mut b = DdgBuilder::new(m);
        let first = b.operation("add");
        b.operand(first, 0, r(2));
        b.trigger(first, 1, r(3));
        let res = b.result(first, 2, r(1));
        let second = b.operation("add");
        let use_ = b.operand(second, 0, r(1));
        b.trigger(second, 1, r(4));
        b.result(second, 2, r(5));
        b.nothing_live_out();
        (b.build().unwrap(), res, use_)
    }

    #[test]
    fn attempt_rollback_restores_graph_and_resources() {
        let m = machine();
        let (mut ddg, res, use_) = chain(&m);
        let mut rm = SimpleResourceManager::new(&m);
        let edges = ddg.edge_snapshot();
        let mut cx = Context::new(&mut ddg, &mut rm);

        let mut attempt = Attempt::new();
        assert!(attempt.run(&mut cx, AssignMove::new(res, 3)));
        assert!(attempt.run(&mut cx, MergeAndKeepEdges::new(res, use_, false)));
        assert_eq!(cx.ddg.node(use_).src, Terminal::FuOutput { operand: 2 });
        assert!(cx.ddg.connecting_edges(res, use_).is_empty());
        // Already placed.
        assert!(!attempt.run(&mut cx, AssignMove::new(res, 4)));
        assert_eq!(attempt.len(), 2);
        attempt.rollback(&mut cx);

        assert!(!cx.ddg.is_scheduled(res));
        assert_eq!(cx.ddg.node(use_).src, r(1));
        assert_eq!(cx.ddg.edge_snapshot(), edges);
        drop(cx);
        assert!(rm.usage().is_empty());
    }

    #[test]
    fn run_all_unwinds_on_first_failure() {
        let m = machine();
        let (mut ddg, res, use_) = chain(&m);
        let mut rm = SimpleResourceManager::new(&m);
        let edges = ddg.edge_snapshot();
        let mut cx = Context::new(&mut ddg, &mut rm);

        let raw = cx.ddg.connecting_edges(res, use_)[0];
        let steps: [Box<dyn Reversible>; 3] = [
            Box::new(RemoveEdge::new(raw)),
            Box::new(AssignMove::new(use_, 2)),
            // The edge is gone already.
            Box::new(RemoveEdge::new(raw)),
        ];
        let mut attempt = Attempt::new();
        assert!(!attempt.run_all(&mut cx, steps));
        assert!(attempt.is_empty());
        assert_eq!(cx.ddg.edge_snapshot(), edges);
        assert!(!cx.ddg.is_scheduled(use_));
    }

    #[test]
    fn connect_refuses_cycles() {
        let m = machine();
        let (mut ddg, res, use_) = chain(&m);
        let mut rm = SimpleResourceManager::new(&m);
        let mut cx = Context::new(&mut ddg, &mut rm);
        let mut attempt = Attempt::new();
        let war = DepEdge::register(DepType::War, Reg::new(RfId::new(0), 1));
        assert!(!attempt.run(&mut cx, ConnectNodes::new(use_, res, war)));
        let edges = cx.ddg.edge_count();
        assert!(attempt.run(&mut cx, ConnectNodes::new(res, use_, war)));
        assert_eq!(cx.ddg.edge_count(), edges + 1);
        // An equal edge is not duplicated.
        assert!(attempt.run(&mut cx, ConnectNodes::new(res, use_, war)));
        assert_eq!(cx.ddg.edge_count(), edges + 1);
        attempt.rollback(&mut cx);
        assert_eq!(cx.ddg.edge_count(), edges);
    }

    #[test]
    fn committed_steps_undo_later() {
        let m = machine();
        let (mut ddg, res, use_) = chain(&m);
        let mut rm = SimpleResourceManager::new(&m);
        let edges = ddg.edge_snapshot();
        let mut cx = Context::new(&mut ddg, &mut rm);

        let mut attempt = Attempt::new();
        assert!(attempt.run(&mut cx, MergeAndKeepEdges::new(res, use_, false)));
        let applied = attempt.commit();
        assert_eq!(applied.len(), 1);
        // The result is read by nobody now.
        let mut attempt = Attempt::new();
        assert!(attempt.run(&mut cx, RemoveDeadResult::new(res)));
        assert!(!cx.ddg.node(res).is_live());
        attempt.rollback(&mut cx);
        assert!(cx.ddg.node(res).is_live());
        applied.undo(&mut cx);
        assert_eq!(cx.ddg.edge_snapshot(), edges);
    }
}
