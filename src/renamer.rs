/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Register renaming for scheduling freedom.
//!
//! Anti and output dependences only exist because two live ranges share
//! a register. Moving one of them to another register removes the
//! dependence. The renamer keeps track of which registers are free in
//! the block, which are only used in part of it, and rewrites a live
//! range onto a chosen register together with the edges that this
//! requires. Every rename hands back a [`RenameUndo`].

use crate::ddg::{DataDependenceGraph, DepEdge, DepType, GraphUndo, LiveRange, MoveId, RegisterSpan};
use crate::machine::{Machine, MachineKey, Port};
use crate::{Cycle, Direction, FuId, FxHashMap, Reg, RfId, Terminal};
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use smallvec::SmallVec;

/// Per-machine register inventory, shared by every renamer created for
/// the same machine during one compilation.
#[derive(Clone, Debug, Default)]
pub struct RegisterFileCache {
    entries: FxHashMap<MachineKey, Vec<Reg>>,
}

impl RegisterFileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every register the renamer may hand out. The last register of a
    /// temporary register file is reserved.
    pub fn normal_registers(&mut self, machine: &dyn Machine) -> &[Reg] {
        self.entries.entry(machine.key()).or_insert_with(|| {
            let mut regs = Vec::new();
            for (i, rf) in machine.register_files().iter().enumerate() {
                if rf.forced_bypass {
                    continue;
                }
                let count = if rf.temp { rf.size.saturating_sub(1) } else { rf.size };
                regs.extend((0..count).map(|index| Reg::new(RfId::new(i), index)));
            }
            trace!("renamer: cached {} registers for machine {:?}", regs.len(), machine.key());
            regs
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where a register is defined and used inside the block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterUse {
    /// Writes before (and including) the first killing write.
    pub first_defines: BTreeSet<MoveId>,
    /// Reads before the first killing write.
    pub first_uses: BTreeSet<MoveId>,
    /// The last killing write plus later conditional writes.
    pub defines: BTreeSet<MoveId>,
    /// Reads after the last killing write.
    pub last_uses: BTreeSet<MoveId>,
    pub first_kill: Option<MoveId>,
    pub last_kill: Option<MoveId>,
}

/// Liveness bookkeeping of one block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LiveRangeData {
    /// Registers holding a value on entry that the block may read.
    pub live_in: BTreeSet<Reg>,
    pub regs: BTreeMap<Reg, RegisterUse>,
}

impl LiveRangeData {
    /// Walk the block in program order.
    pub fn from_graph(ddg: &DataDependenceGraph) -> Self {
        let mut lrd = LiveRangeData {
            live_in: ddg.used_registers().into_iter().filter(|&r| ddg.is_live_in(r)).collect(),
            regs: BTreeMap::new(),
        };
        for n in ddg.node_ids() {
            let node = ddg.node(n);
            let reads = node.src.reg().into_iter().chain(node.guard.map(|g| g.reg));
            for reg in reads {
                let u = lrd.regs.entry(reg).or_default();
                if u.first_kill.is_none() {
                    u.first_uses.insert(n);
                    if u.first_defines.is_empty() {
                        lrd.live_in.insert(reg);
                    }
                }
                u.last_uses.insert(n);
            }
            if let Some(reg) = node.dst.reg() {
                let u = lrd.regs.entry(reg).or_default();
                if u.first_kill.is_none() {
                    u.first_defines.insert(n);
                }
                if node.is_unconditional() {
                    if u.first_kill.is_none() {
                        u.first_kill = Some(n);
                    }
                    u.last_kill = Some(n);
                    u.defines.clear();
                    u.last_uses.clear();
                }
                u.defines.insert(n);
            }
        }
        lrd
    }

    pub fn is_live_in(&self, reg: Reg) -> bool {
        self.live_in.contains(&reg)
    }

    pub fn is_defined(&self, reg: Reg) -> bool {
        self.regs.get(&reg).map_or(false, |u| !u.defines.is_empty())
    }
}

/// How the new register relates to the lifetimes already on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenameMode {
    /// The register is not used in the block.
    Free,
    /// The register's existing lifetime ends before the renamed range.
    ReuseBefore,
    /// The register's existing lifetime starts after the renamed range.
    ReuseAfter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Write,
    Read,
    Guard,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Classes {
    free: bool,
    partially_used: bool,
    used: bool,
}

/// Everything a rename changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenameUndo {
    old_reg: Reg,
    new_reg: Reg,
    nodes: Vec<(MoveId, Role)>,
    /// In application order.
    graph: Vec<GraphUndo>,
    classes: Classes,
    old_use: Option<RegisterUse>,
}

impl RenameUndo {
    pub fn new_reg(&self) -> Reg {
        self.new_reg
    }

    pub fn old_reg(&self) -> Reg {
        self.old_reg
    }

    pub fn renamed_nodes(&self) -> impl Iterator<Item = MoveId> + '_ {
        self.nodes.iter().map(|&(n, _)| n)
    }
}

pub struct RegisterRenamer<'m> {
    machine: &'m dyn Machine,
    all: BTreeSet<Reg>,
    free: BTreeSet<Reg>,
    partially_used: BTreeSet<Reg>,
    used: BTreeSet<Reg>,
    lrd: LiveRangeData,
    allow_limm: bool,
}

impl<'m> RegisterRenamer<'m> {
    pub fn new(machine: &'m dyn Machine, cache: &mut RegisterFileCache, ddg: &DataDependenceGraph) -> Self {
        let all: BTreeSet<Reg> = cache.normal_registers(machine).iter().copied().collect();
        let lrd = LiveRangeData::from_graph(ddg);
        let mut free = BTreeSet::new();
        let mut partially_used = BTreeSet::new();
        for &reg in &all {
            let defined = lrd.is_defined(reg);
            let used_after = ddg.is_live_out(reg);
            let alive_over = used_after && !defined;
            let alive_at_end = used_after && defined;
            let alive_at_beginning = lrd.is_live_in(reg) || defined;
            if alive_over || alive_at_end {
                continue;
            }
            if alive_at_beginning {
                partially_used.insert(reg);
            } else {
                free.insert(reg);
            }
        }
        trace!(
            "renamer: {} free, {} partially used of {} registers",
            free.len(),
            partially_used.len(),
            all.len()
        );
        RegisterRenamer {
            machine,
            all,
            free,
            partially_used,
            used: BTreeSet::new(),
            lrd,
            allow_limm: false,
        }
    }

    /// Also consider register files reachable only through a long
    /// immediate.
    pub fn with_long_immediate_rfs(mut self, allow: bool) -> Self {
        self.allow_limm = allow;
        self
    }

    pub fn set_long_immediate_rfs(&mut self, allow: bool) {
        self.allow_limm = allow;
    }

    pub fn free_registers(&self) -> &BTreeSet<Reg> {
        &self.free
    }

    pub fn partially_used_registers(&self) -> &BTreeSet<Reg> {
        &self.partially_used
    }

    /// Registers a rename has moved a live range onto.
    pub fn used_registers(&self) -> &BTreeSet<Reg> {
        &self.used
    }

    pub fn live_range_data(&self) -> &LiveRangeData {
        &self.lrd
    }

    fn in_rf(&self, rf: RfId) -> impl Iterator<Item = Reg> + '_ {
        self.all.iter().copied().filter(move |r| r.rf == rf)
    }

    pub fn find_free_registers_in_rf(&self, rf: RfId) -> BTreeSet<Reg> {
        self.in_rf(rf).filter(|r| self.free.contains(r)).collect()
    }

    fn reusable_in_rf(&self, rf: RfId) -> impl Iterator<Item = Reg> + '_ {
        self.in_rf(rf)
            .filter(|r| self.partially_used.contains(r) || self.used.contains(r))
    }

    /// Registers of `rf` whose every access is scheduled before
    /// `earliest`.
    pub fn find_partially_used_registers_in_rf_before_cycle(
        &self,
        ddg: &DataDependenceGraph,
        rf: RfId,
        earliest: Cycle,
    ) -> BTreeSet<Reg> {
        if earliest < 1 {
            return BTreeSet::new();
        }
        self.reusable_in_rf(rf)
            .filter(|&r| match ddg.register_span(r) {
                RegisterSpan::Unused => true,
                RegisterSpan::Unscheduled => false,
                RegisterSpan::Span { last, .. } => last < earliest,
            })
            .collect()
    }

    /// Registers of `rf` whose every access is scheduled after `latest`
    /// and whose value is not needed on entry.
    pub fn find_partially_used_registers_in_rf_after_cycle(
        &self,
        ddg: &DataDependenceGraph,
        rf: RfId,
        latest: Cycle,
    ) -> BTreeSet<Reg> {
        self.reusable_in_rf(rf)
            .filter(|&r| !self.lrd.is_live_in(r))
            .filter(|&r| match ddg.register_span(r) {
                RegisterSpan::Unused => true,
                RegisterSpan::Unscheduled => false,
                RegisterSpan::Span { first, .. } => first > latest,
            })
            .collect()
    }

    fn unit_candidates(ddg: &DataDependenceGraph, op: Option<crate::OpId>) -> SmallVec<[FuId; 2]> {
        match op {
            Some(op) => match ddg.op(op).fu {
                Some(fu) => smallvec::smallvec![fu],
                None => ddg.op(op).allowed_fus.clone(),
            },
            None => SmallVec::new(),
        }
    }

    fn can_write(&self, ddg: &DataDependenceGraph, w: MoveId, rf: RfId, allow_limm: bool) -> bool {
        let node = ddg.node(w);
        let to = Port::RfWrite(rf);
        match node.src {
            Terminal::Register(r) => self.machine.connected(Port::RfRead(r.rf), to),
            Terminal::Immediate(v) => {
                self.machine.short_immediate_reaches(v, to)
                    || (allow_limm && self.machine.long_immediate_reaches(to))
            }
            Terminal::FuOutput { operand } => Self::unit_candidates(ddg, node.src_op)
                .into_iter()
                .any(|fu| self.machine.connected(Port::FuOut { fu, operand }, to)),
            Terminal::ReturnAddress => self.machine.connected(Port::RaRead, to),
            Terminal::FuInput { .. } => false,
        }
    }

    fn can_read(&self, ddg: &DataDependenceGraph, r: MoveId, rf: RfId) -> bool {
        let node = ddg.node(r);
        let from = Port::RfRead(rf);
        match node.dst {
            Terminal::Register(reg) => self.machine.connected(from, Port::RfWrite(reg.rf)),
            Terminal::FuInput { operand, .. } => Self::unit_candidates(ddg, node.dst_op)
                .into_iter()
                .any(|fu| self.machine.connected(from, Port::FuIn { fu, operand })),
            Terminal::ReturnAddress => self.machine.connected(from, Port::RaWrite),
            Terminal::Immediate(_) | Terminal::FuOutput { .. } => false,
        }
    }

    /// Register files every write of `range` can reach and every read
    /// can be fed from. Ranges with guard reads stay in their own file.
    /// With `allow_limm`, immediates may also arrive as long immediates.
    pub fn find_connected_rfs(
        &self,
        ddg: &DataDependenceGraph,
        range: &LiveRange,
        allow_limm: bool,
    ) -> SmallVec<[RfId; 4]> {
        let own = range
            .writes
            .iter()
            .next()
            .and_then(|&w| ddg.node(w).dst.reg())
            .map(|r| r.rf);
        let mut rfs: SmallVec<[RfId; 4]> = SmallVec::new();
        rfs.extend(own);
        if !range.guards.is_empty() {
            return rfs;
        }
        for (i, rf) in self.machine.register_files().iter().enumerate() {
            let id = RfId::new(i);
            if Some(id) == own || rf.forced_bypass {
                continue;
            }
            if range.writes.iter().all(|&w| self.can_write(ddg, w, id, allow_limm))
                && range.reads.iter().all(|&r| self.can_read(ddg, r, id))
            {
                rfs.push(id);
            }
        }
        rfs
    }

    /// Does the value written by `w` reach the end of the block?
    fn escapes(ddg: &DataDependenceGraph, w: MoveId, reg: Reg) -> bool {
        if !ddg.is_live_out(reg) {
            return false;
        }
        !ddg.out_edges(w).any(|e| {
            let edge = ddg.edge(e);
            edge.is_register(DepType::Waw, reg)
                && !edge.is_back_edge()
                && ddg.node(ddg.head_node(e)).is_unconditional()
        })
    }

    /// Would `tail -> head` with this latency already hold?
    fn already_ordered(ddg: &DataDependenceGraph, tail: MoveId, head: MoveId, latency: Cycle) -> bool {
        match (ddg.node(tail).placement, ddg.node(head).placement) {
            (Some(t), Some(h)) => h.cycle >= t.cycle + latency,
            _ => false,
        }
    }

    fn classes(&self, reg: Reg) -> Classes {
        Classes {
            free: self.free.contains(&reg),
            partially_used: self.partially_used.contains(&reg),
            used: self.used.contains(&reg),
        }
    }

    fn set_classes(&mut self, reg: Reg, c: Classes) {
        for (set, on) in [
            (&mut self.free, c.free),
            (&mut self.partially_used, c.partially_used),
            (&mut self.used, c.used),
        ] {
            if on {
                set.insert(reg);
            } else {
                set.remove(&reg);
            }
        }
    }

    /// Move `range` onto `new_reg`. The range must have exactly one,
    /// unconditional, write and at least one read. With a reuse mode the
    /// register's existing lifetime must be fully scheduled on the given
    /// side of the range; edges ordering the two lifetimes are added
    /// unless the schedule already orders them.
    pub fn rename_live_range(
        &mut self,
        ddg: &mut DataDependenceGraph,
        range: &LiveRange,
        new_reg: Reg,
        mode: RenameMode,
    ) -> Option<RenameUndo> {
        if range.writes.len() != 1 || range.reads.is_empty() {
            return None;
        }
        let w = *range.writes.iter().next()?;
        let old_reg = ddg.node(w).dst.reg()?;
        if old_reg == new_reg || !self.all.contains(&new_reg) || !ddg.node(w).is_unconditional() {
            return None;
        }
        if !range.guards.is_empty() && new_reg.rf != old_reg.rf {
            return None;
        }
        if Self::escapes(ddg, w, old_reg) {
            trace!("rename {}: value of {} is live out", w, old_reg);
            return None;
        }
        let available = match mode {
            RenameMode::Free => self.free.contains(&new_reg),
            RenameMode::ReuseBefore | RenameMode::ReuseAfter => {
                self.partially_used.contains(&new_reg) || self.used.contains(&new_reg)
            }
        };
        if !available {
            return None;
        }

        // Plan the edges that order the two lifetimes before mutating.
        let mut planned: SmallVec<[(MoveId, MoveId, DepEdge); 8]> = SmallVec::new();
        match mode {
            RenameMode::Free => {}
            RenameMode::ReuseBefore => {
                let span_last = match ddg.register_span(new_reg) {
                    RegisterSpan::Unused => None,
                    RegisterSpan::Unscheduled => return None,
                    RegisterSpan::Span { last, .. } => Some(last),
                };
                if let Some(last) = span_last {
                    let overlaps = range
                        .nodes()
                        .filter_map(|n| ddg.node(n).placement)
                        .any(|p| p.cycle <= last);
                    if overlaps {
                        return None;
                    }
                }
                for r in ddg.last_scheduled_register_reads(new_reg) {
                    planned.push((r, w, DepEdge::register(DepType::War, new_reg)));
                }
                for g in ddg.last_scheduled_register_guard_reads(new_reg) {
                    planned.push((g, w, DepEdge::register(DepType::War, new_reg).with_guard_use()));
                }
                for d in ddg.last_scheduled_register_writes(new_reg) {
                    planned.push((d, w, DepEdge::register(DepType::Waw, new_reg)));
                }
            }
            RenameMode::ReuseAfter => {
                if self.lrd.is_live_in(new_reg) {
                    return None;
                }
                let span_first = match ddg.register_span(new_reg) {
                    RegisterSpan::Unused => None,
                    RegisterSpan::Unscheduled => return None,
                    RegisterSpan::Span { first, .. } => Some(first),
                };
                if let Some(first) = span_first {
                    let overlaps = range
                        .nodes()
                        .filter_map(|n| ddg.node(n).placement)
                        .any(|p| p.cycle >= first);
                    if overlaps {
                        return None;
                    }
                }
                for d in ddg.first_scheduled_register_writes(new_reg) {
                    planned.push((w, d, DepEdge::register(DepType::Waw, new_reg)));
                    for &r in &range.reads {
                        planned.push((r, d, DepEdge::register(DepType::War, new_reg)));
                    }
                    for &g in &range.guards {
                        planned.push((g, d, DepEdge::register(DepType::War, new_reg).with_guard_use()));
                    }
                }
            }
        }
        let guard_war = 1 - ddg.guard_latency(new_reg).max(1) as Cycle;
        planned.retain(|(tail, head, edge)| {
            let latency = match (edge.dep, edge.guard_use) {
                (DepType::War, true) => guard_war,
                (DepType::War, false) => 0,
                _ => 1,
            };
            tail != head
                && !(range.contains(*tail) && range.contains(*head))
                && !Self::already_ordered(ddg, *tail, *head, latency)
        });
        if planned.iter().any(|(tail, head, _)| ddg.has_path(*head, *tail)) {
            trace!("rename {} onto {}: reuse would close a cycle", w, new_reg);
            return None;
        }

        let mut undo = RenameUndo {
            old_reg,
            new_reg,
            nodes: Vec::new(),
            graph: Vec::new(),
            classes: self.classes(new_reg),
            old_use: self.lrd.regs.get(&new_reg).cloned(),
        };

        let mut anti = GraphUndo::default();
        for (tail, head, edge) in planned {
            if let Some(e) = ddg.connect_or_skip(tail, head, edge) {
                anti.added.push(e);
            }
        }
        undo.graph.push(anti);

        for &n in &range.writes {
            ddg.node_mut(n).dst = Terminal::Register(new_reg);
            undo.nodes.push((n, Role::Write));
        }
        for &n in &range.reads {
            ddg.node_mut(n).src = Terminal::Register(new_reg);
            undo.nodes.push((n, Role::Read));
        }
        for &n in &range.guards {
            if let Some(g) = ddg.node_mut(n).guard.as_mut() {
                g.reg = new_reg;
            }
            undo.nodes.push((n, Role::Guard));
        }

        for &n in &range.writes {
            let g = ddg.dest_renamed(n);
            undo.graph.push(g);
        }
        for &n in &range.reads {
            let g = ddg.source_renamed(n);
            undo.graph.push(g);
        }
        for &n in &range.guards {
            let g = ddg.guard_renamed(n);
            undo.graph.push(g);
        }

        self.update_bookkeeping(range, new_reg, mode);
        self.free.remove(&new_reg);
        self.partially_used.remove(&new_reg);
        self.used.insert(new_reg);
        trace!(
            "renamed {} nodes from {} to {} ({:?})",
            undo.nodes.len(),
            old_reg,
            new_reg,
            mode
        );
        Some(undo)
    }

    fn update_bookkeeping(&mut self, range: &LiveRange, new_reg: Reg, mode: RenameMode) {
        let u = self.lrd.regs.entry(new_reg).or_default();
        let w = range.writes.iter().next().copied();
        if mode != RenameMode::ReuseBefore {
            u.first_kill = w;
            u.first_defines = range.writes.clone();
            u.first_uses = range.reads.iter().chain(range.guards.iter()).copied().collect();
        }
        if mode != RenameMode::ReuseAfter {
            u.last_kill = w;
            u.defines = range.writes.clone();
            u.last_uses = range.reads.iter().chain(range.guards.iter()).copied().collect();
        }
    }

    /// Exact inverse of [`rename_live_range`](Self::rename_live_range).
    pub fn undo_rename(&mut self, ddg: &mut DataDependenceGraph, undo: RenameUndo) {
        for g in undo.graph.into_iter().rev() {
            ddg.undo(g);
        }
        for &(n, role) in undo.nodes.iter().rev() {
            let node = ddg.node_mut(n);
            match role {
                Role::Write => node.dst = Terminal::Register(undo.old_reg),
                Role::Read => node.src = Terminal::Register(undo.old_reg),
                Role::Guard => {
                    if let Some(g) = node.guard.as_mut() {
                        g.reg = undo.old_reg;
                    }
                }
            }
        }
        self.set_classes(undo.new_reg, undo.classes);
        match undo.old_use {
            Some(u) => {
                self.lrd.regs.insert(undo.new_reg, u);
            }
            None => {
                self.lrd.regs.remove(&undo.new_reg);
            }
        }
        trace!("undid rename from {} to {}", undo.old_reg, undo.new_reg);
    }

    /// Rename the live range written by `n` so that it can be placed at
    /// `cycle`. Top-down the new register may be one whose lifetime ends
    /// before `cycle`; bottom-up one whose lifetime starts after it.
    /// Falls back to free registers and then to other register files.
    pub fn rename_destination(
        &mut self,
        ddg: &mut DataDependenceGraph,
        n: MoveId,
        cycle: Cycle,
        direction: Direction,
    ) -> Option<RenameUndo> {
        ddg.node(n).dst.reg()?;
        let range = ddg.find_live_range(n, true, false);
        self.rename_range(ddg, &range, cycle, direction)
    }

    /// Rename the live range `n` reads from.
    pub fn rename_source(
        &mut self,
        ddg: &mut DataDependenceGraph,
        n: MoveId,
        cycle: Cycle,
        direction: Direction,
    ) -> Option<RenameUndo> {
        ddg.node(n).src.reg()?;
        let range = ddg.find_live_range(n, false, false);
        self.rename_range(ddg, &range, cycle, direction)
    }

    fn rename_range(
        &mut self,
        ddg: &mut DataDependenceGraph,
        range: &LiveRange,
        cycle: Cycle,
        direction: Direction,
    ) -> Option<RenameUndo> {
        if range.writes.len() != 1 || range.reads.is_empty() {
            return None;
        }
        let w = *range.writes.iter().next()?;
        let own = ddg.node(w).dst.reg()?.rf;
        let rfs: SmallVec<[RfId; 4]> = if range.nodes().any(|m| ddg.is_scheduled(m)) {
            smallvec::smallvec![own]
        } else {
            self.find_connected_rfs(ddg, range, self.allow_limm)
        };

        for &rf in &rfs {
            let (reusable, mode) = match direction {
                Direction::TopDown => (
                    self.find_partially_used_registers_in_rf_before_cycle(ddg, rf, cycle),
                    RenameMode::ReuseBefore,
                ),
                Direction::BottomUp => (
                    self.find_partially_used_registers_in_rf_after_cycle(ddg, rf, cycle),
                    RenameMode::ReuseAfter,
                ),
            };
            for reg in reusable {
                if let Some(undo) = self.rename_live_range(ddg, range, reg, mode) {
                    return Some(undo);
                }
            }
        }
        for &rf in &rfs {
            for reg in self.find_free_registers_in_rf(rf) {
                if let Some(undo) = self.rename_live_range(ddg, range, reg, RenameMode::Free) {
                    return Some(undo);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddg::DdgBuilder;
    use crate::machine::MachineBuilder;
    use crate::{BusId, MachineDesc, Placement};

    fn machine() -> MachineDesc {
        let mut b = MachineBuilder::new("renamer-test");
        let r = b.register_file("r", 16, 2, 2);
        b.register_file("bool", 2, 1, 1);
        b.temp_register_file(r);
        b.function_unit("alu", &[("add", 1, 2, 1)]);
        b.fully_connected_buses(2, 8);
        b.finish()
    }

    fn reg(i: u16) -> Reg {
        Reg::new(RfId::new(0), i)
    }

    fn r(i: u16) -> Terminal {
        Terminal::Register(reg(i))
    }

    fn place(ddg: &mut DataDependenceGraph, n: MoveId, cycle: Cycle) {
        ddg.set_placement(
            n,
            Some(Placement {
                cycle,
                bus: BusId::new(0),
            }),
        );
    }

    #[test]
    fn cache_reserves_last_temp_register() {
        let m = machine();
        let mut cache = RegisterFileCache::new();
        let regs = cache.normal_registers(&m).to_vec();
        assert_eq!(regs.len(), 15 + 2);
        assert!(!regs.contains(&reg(15)));
        assert_eq!(cache.normal_registers(&m).len(), 17);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn initial_classification() {
        let m = machine();
        let mut b = DdgBuilder::new(&m);
        b.transport(Terminal::Immediate(1), r(1));
        b.transport(r(1), r(2));
        b.transport(r(3), r(4));
        b.live_in(reg(3)).live_out(reg(2)).live_out(reg(5));
        let ddg = b.build().unwrap();
        let mut cache = RegisterFileCache::new();
        let renamer = RegisterRenamer::new(&m, &mut cache, &ddg);

        let partial = renamer.partially_used_registers();
        assert!(partial.contains(&reg(1)));
        assert!(partial.contains(&reg(3)));
        assert!(partial.contains(&reg(4)));
        // Defined and read later, or live through the block.
        assert!(!partial.contains(&reg(2)) && !renamer.free_registers().contains(&reg(2)));
        assert!(!partial.contains(&reg(5)) && !renamer.free_registers().contains(&reg(5)));
        assert!(renamer.free_registers().contains(&reg(0)));
        assert!(!renamer.free_registers().contains(&reg(15)));
        assert!(renamer.used_registers().is_empty());
        assert!(renamer.live_range_data().is_live_in(reg(3)));
    }

    #[test]
    fn unknown_liveness_disables_renaming() {
        let m = machine();
        let mut b = DdgBuilder::new(&m);
        b.transport(Terminal::Immediate(1), r(1));
        b.transport(r(1), r(2));
        let ddg = b.build().unwrap();
        let renamer = RegisterRenamer::new(&m, &mut RegisterFileCache::new(), &ddg);
        assert!(renamer.free_registers().is_empty());
        assert!(renamer.partially_used_registers().is_empty());
    }

    #[test]
    fn rename_and_undo_restore_everything() {
        let m = machine();
        let mut b = DdgBuilder::new(&m);
        let def = b.transport(Terminal::Immediate(1), r(1));
        let read = b.transport(r(1), r(2));
        b.live_out(reg(2));
        let mut ddg = b.build().unwrap();
        let mut renamer = RegisterRenamer::new(&m, &mut RegisterFileCache::new(), &ddg);
        let edges = ddg.edge_snapshot();
        let free = renamer.free_registers().clone();
        let lrd = renamer.live_range_data().clone();

        let range = ddg.find_live_range(def, true, false);
        let undo = renamer
            .rename_live_range(&mut ddg, &range, reg(3), RenameMode::Free)
            .unwrap();
        assert_eq!(ddg.node(def).dst, r(3));
        assert_eq!(ddg.node(read).src, r(3));
        let e = ddg.connecting_edges(def, read)[0];
        assert!(ddg.edge(e).is_register(DepType::Raw, reg(3)));
        assert!(renamer.used_registers().contains(&reg(3)));
        assert!(!renamer.free_registers().contains(&reg(3)));
        assert_eq!(undo.renamed_nodes().count(), 2);

        renamer.undo_rename(&mut ddg, undo);
        assert_eq!(ddg.node(def).dst, r(1));
        assert_eq!(ddg.node(read).src, r(1));
        assert_eq!(ddg.edge_snapshot(), edges);
        assert_eq!(renamer.free_registers(), &free);
        assert_eq!(renamer.live_range_data(), &lrd);
        assert!(renamer.used_registers().is_empty());
    }

    #[test]
    fn unsafe_ranges_are_refused() {
        let m = machine();
        let mut b = DdgBuilder::new(&m);
        let def = b.transport(Terminal::Immediate(1), r(1));
        b.transport(r(1), r(2));
        let dead = b.transport(Terminal::Immediate(2), r(4));
        b.live_out(reg(1)).live_out(reg(2));
        let mut ddg = b.build().unwrap();
        let mut renamer = RegisterRenamer::new(&m, &mut RegisterFileCache::new(), &ddg);

        // The value of r1 is needed after the block.
        let range = ddg.find_live_range(def, true, false);
        assert!(renamer.rename_live_range(&mut ddg, &range, reg(3), RenameMode::Free).is_none());
        // No reads.
        let range = ddg.find_live_range(dead, true, false);
        assert!(renamer.rename_live_range(&mut ddg, &range, reg(3), RenameMode::Free).is_none());
    }

    #[test]
    fn reuse_of_finished_lifetime_adds_no_edges() {
        let m = machine();
        let mut b = DdgBuilder::new(&m);
        let other_w = b.transport(Terminal::Immediate(5), r(4));
        let other_r = b.transport(r(4), r(10));
        let w = b.transport(Terminal::Immediate(1), r(1));
        let rd = b.transport(r(1), r(11));
        b.live_out(reg(10)).live_out(reg(11));
        let mut ddg = b.build().unwrap();
        place(&mut ddg, other_w, 0);
        place(&mut ddg, other_r, 2);
        place(&mut ddg, w, 4);
        place(&mut ddg, rd, 9);
        let mut renamer = RegisterRenamer::new(&m, &mut RegisterFileCache::new(), &ddg);

        let reusable = renamer.find_partially_used_registers_in_rf_before_cycle(&ddg, RfId::new(0), 4);
        assert!(reusable.contains(&reg(4)));
        assert!(!reusable.contains(&reg(1)));
        assert!(renamer
            .find_partially_used_registers_in_rf_before_cycle(&ddg, RfId::new(0), 0)
            .is_empty());

        let edges = ddg.edge_count();
        let range = ddg.find_live_range(w, true, false);
        let undo = renamer
            .rename_live_range(&mut ddg, &range, reg(4), RenameMode::ReuseBefore)
            .unwrap();
        assert_eq!(ddg.edge_count(), edges);
        assert!(ddg.connecting_edges(other_r, w).is_empty());
        assert!(ddg.connecting_edges(other_w, w).is_empty());
        assert_eq!(ddg.node(rd).src, r(4));
        renamer.undo_rename(&mut ddg, undo);
        assert_eq!(ddg.node(w).dst, r(1));
    }

    #[test]
    fn reuse_that_would_close_a_cycle_is_refused() {
        let m = machine();
        let mut b = DdgBuilder::new(&m);
        let w = b.transport(Terminal::Immediate(1), r(1));
        b.transport(r(1), r(11));
        let other_w = b.transport(r(11), r(4));
        let other_r = b.transport(r(4), r(10));
        b.live_out(reg(10));
        let mut ddg = b.build().unwrap();
        place(&mut ddg, other_w, 2);
        place(&mut ddg, other_r, 3);
        let mut renamer = RegisterRenamer::new(&m, &mut RegisterFileCache::new(), &ddg);
        let edges = ddg.edge_snapshot();

        let range = ddg.find_live_range(w, true, false);
        assert!(renamer
            .rename_live_range(&mut ddg, &range, reg(4), RenameMode::ReuseBefore)
            .is_none());
        assert_eq!(ddg.edge_snapshot(), edges);
        assert!(renamer.used_registers().is_empty());
    }

    #[test]
    fn destination_rename_removes_anti_dependences() {
        let m = machine();
        let mut b = DdgBuilder::new(&m);
        let a = b.transport(Terminal::Immediate(1), r(1));
        let rd1 = b.transport(r(1), r(2));
        let c = b.transport(Terminal::Immediate(7), r(1));
        let rd2 = b.transport(r(1), r(3));
        b.live_out(reg(2)).live_out(reg(3));
        let mut ddg = b.build().unwrap();
        assert!(!ddg.connecting_edges(rd1, c).is_empty());
        assert!(!ddg.connecting_edges(a, c).is_empty());
        let edges = ddg.edge_snapshot();
        let mut renamer = RegisterRenamer::new(&m, &mut RegisterFileCache::new(), &ddg);

        let undo = renamer
            .rename_destination(&mut ddg, c, 0, Direction::TopDown)
            .unwrap();
        assert_eq!(undo.new_reg(), reg(0));
        assert_eq!(ddg.node(rd2).src, r(0));
        assert!(ddg.connecting_edges(rd1, c).is_empty());
        assert!(ddg.connecting_edges(a, c).is_empty());

        renamer.undo_rename(&mut ddg, undo);
        assert_eq!(ddg.edge_snapshot(), edges);
    }

    #[test]
    fn connected_register_files() {
        let m = machine();
        let mut b = DdgBuilder::new(&m);
        let w = b.transport(Terminal::Immediate(1), r(1));
        b.transport(r(1), r(2));
        b.live_out(reg(2));
        let ddg = b.build().unwrap();
        let renamer = RegisterRenamer::new(&m, &mut RegisterFileCache::new(), &ddg);
        let range = ddg.find_live_range(w, true, false);
        assert_eq!(
            renamer.find_connected_rfs(&ddg, &range, false).as_slice(),
            [RfId::new(0), RfId::new(1)]
        );
    }
}
