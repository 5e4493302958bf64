/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Resource management: placing moves on buses in cycles.
//!
//! The scheduler only relies on the [`ResourceManager`] contract.
//! [`SimpleResourceManager`] implements it for a [`Machine`] by tracking
//! per-cycle occupancy of buses, register-file ports, function-unit
//! inputs, triggers, result ports and long-immediate slots.
//!
//! A function-unit input holds its value from the operand write until
//! the trigger of the same operation reads it, so two operations bound to
//! one unit may not interleave their writes to the same input.

use crate::ddg::{DataDependenceGraph, MoveId, OpId};
use crate::machine::{immediate_bits, Machine, Port};
use crate::{BusId, Cycle, FuId, FxHashMap, Placement, RfId, Terminal};
use smallvec::{smallvec, SmallVec};

/// How far past the last used cycle `earliest_cycle` keeps looking.
const SEARCH_WINDOW: Cycle = 64;

pub trait ResourceManager {
    /// Smallest cycle not below `lower` at which `n` could be assigned.
    fn earliest_cycle(&self, ddg: &DataDependenceGraph, lower: Cycle, n: MoveId) -> Option<Cycle>;

    /// Largest cycle, not above `upper` and not negative, at which `n`
    /// could be assigned.
    fn latest_cycle(&self, ddg: &DataDependenceGraph, upper: Cycle, n: MoveId) -> Option<Cycle>;

    fn can_assign(&self, ddg: &DataDependenceGraph, cycle: Cycle, n: MoveId) -> bool;

    /// Place `n` in `cycle`. Panics if `n` is already scheduled or the
    /// cycle has no free resources for it.
    fn assign(&mut self, ddg: &mut DataDependenceGraph, cycle: Cycle, n: MoveId);

    /// Undo the placement of `n`. Panics if `n` is not scheduled.
    fn unassign(&mut self, ddg: &mut DataDependenceGraph, n: MoveId);

    /// Whether the immediate source of `n` fits inline on some bus that
    /// reaches its destination. Moves without an immediate trivially do.
    fn can_transport_immediate(&self, ddg: &DataDependenceGraph, n: MoveId) -> bool;

    fn smallest_cycle(&self) -> Option<Cycle>;
    fn largest_cycle(&self) -> Option<Cycle>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Assignment {
    cycle: Cycle,
    bus: BusId,
    src_fu: Option<FuId>,
    dst_fu: Option<FuId>,
    long_imm: bool,
}

/// Occupied capacity. Entries are removed when their count drops to
/// zero, so equal usage compares equal regardless of history.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    buses: FxHashMap<(Cycle, BusId), MoveId>,
    rf_reads: FxHashMap<(Cycle, RfId), u32>,
    rf_writes: FxHashMap<(Cycle, RfId), u32>,
    fu_inputs: FxHashMap<(Cycle, FuId, u8), MoveId>,
    triggers: FxHashMap<(Cycle, FuId), OpId>,
    result_reads: FxHashMap<(Cycle, FuId, u8), (OpId, u32)>,
    long_imms: FxHashMap<Cycle, u32>,
    bindings: FxHashMap<OpId, (FuId, u32)>,
    assignments: FxHashMap<MoveId, Assignment>,
}

impl ResourceUsage {
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn assigned_moves(&self) -> usize {
        self.assignments.len()
    }
}

fn inc<K: core::hash::Hash + Eq>(map: &mut FxHashMap<K, u32>, key: K) {
    *map.entry(key).or_insert(0) += 1;
}

fn dec<K: core::hash::Hash + Eq>(map: &mut FxHashMap<K, u32>, key: K) {
    if let Some(count) = map.get_mut(&key) {
        *count -= 1;
        if *count == 0 {
            map.remove(&key);
        }
    }
}

pub struct SimpleResourceManager<'m, M: Machine + ?Sized> {
    machine: &'m M,
    usage: ResourceUsage,
}

impl<'m, M: Machine + ?Sized> SimpleResourceManager<'m, M> {
    pub fn new(machine: &'m M) -> Self {
        SimpleResourceManager {
            machine,
            usage: ResourceUsage::default(),
        }
    }

    pub fn usage(&self) -> &ResourceUsage {
        &self.usage
    }

    /// The function unit `op` is bound to, if any of its moves is placed.
    pub fn bound_unit(&self, op: OpId) -> Option<FuId> {
        self.usage.bindings.get(&op).map(|&(fu, _)| fu)
    }

    fn fu_candidates(
        &self,
        ddg: &DataDependenceGraph,
        op: Option<OpId>,
        restrict: &[FuId],
    ) -> SmallVec<[Option<FuId>; 4]> {
        let Some(op) = op else {
            return smallvec![None];
        };
        if let Some(&(fu, _)) = self.usage.bindings.get(&op) {
            return smallvec![Some(fu)];
        }
        ddg.op(op)
            .allowed_fus
            .iter()
            .copied()
            .filter(|fu| restrict.is_empty() || restrict.contains(fu))
            .map(Some)
            .collect()
    }

    fn src_port(src: &Terminal, fu: Option<FuId>) -> Option<Port> {
        match *src {
            Terminal::Register(r) => Some(Port::RfRead(r.rf)),
            Terminal::FuOutput { operand } => fu.map(|fu| Port::FuOut { fu, operand }),
            Terminal::ReturnAddress => Some(Port::RaRead),
            Terminal::Immediate(_) => None,
            Terminal::FuInput { .. } => panic!("move reads a function unit input"),
        }
    }

    fn dst_port(dst: &Terminal, fu: Option<FuId>) -> Port {
        match *dst {
            Terminal::Register(r) => Port::RfWrite(r.rf),
            Terminal::FuInput { operand, .. } => match fu {
                Some(fu) => Port::FuIn { fu, operand },
                None => panic!("operand move without operation"),
            },
            Terminal::ReturnAddress => Port::RaWrite,
            Terminal::Immediate(_) | Terminal::FuOutput { .. } => {
                panic!("move writes a read-only terminal")
            }
        }
    }

    fn trigger_cycle(ddg: &DataDependenceGraph, op: OpId) -> Option<Cycle> {
        ddg.trigger(op)
            .and_then(|t| ddg.node(t).placement)
            .map(|p| p.cycle)
    }

    /// Would the results of `op` (read at `read`) be overwritten by
    /// another operation started later on the same unit?
    fn result_clobbered(&self, ddg: &DataDependenceGraph, fu: FuId, op: OpId, read: Cycle) -> bool {
        let Some(t) = Self::trigger_cycle(ddg, op) else {
            return false;
        };
        self.usage.bindings.iter().any(|(&other, &(ofu, _))| {
            other != op
                && ofu == fu
                && Self::trigger_cycle(ddg, other).map_or(false, |to| {
                    to > t && to + ddg.op(other).latency as Cycle <= read
                })
        })
    }

    /// Would starting `op` at `t` overwrite a pending result on `fu`, or
    /// have its own pending results overwritten?
    fn trigger_clobbers(&self, ddg: &DataDependenceGraph, fu: FuId, op: OpId, t: Cycle) -> bool {
        let last_read = |op: OpId| {
            ddg.op(op)
                .outputs
                .iter()
                .filter_map(|&n| ddg.node(n).placement)
                .map(|p| p.cycle)
                .max()
        };
        let own_read = last_read(op);
        let lat = ddg.op(op).latency as Cycle;
        self.usage.bindings.iter().any(|(&other, &(ofu, _))| {
            if other == op || ofu != fu {
                return false;
            }
            let olat = ddg.op(other).latency as Cycle;
            let Some(to) = Self::trigger_cycle(ddg, other) else {
                // Results of `other` are read before it is triggered
                // (bypassed bottom-up). Its trigger is at or before the
                // first read minus its latency.
                let first_read = ddg
                    .op(other)
                    .outputs
                    .iter()
                    .filter_map(|&n| ddg.node(n).placement)
                    .map(|p| p.cycle)
                    .min();
                return match (first_read, last_read(other)) {
                    (Some(first), Some(last)) => t >= first - olat && t + lat <= last,
                    _ => false,
                };
            };
            let clobbers_other = to < t && last_read(other).map_or(false, |r| t + lat <= r);
            let clobbered = t < to && own_read.map_or(false, |r| to + olat <= r);
            clobbers_other || clobbered
        })
    }

    /// The cycles the unit input must keep the value `op` writes there
    /// at `write`. Until the trigger is placed only the write itself is
    /// known; placing the trigger checks the rest of the window.
    fn operand_window(ddg: &DataDependenceGraph, op: OpId, write: Cycle) -> (Cycle, Cycle) {
        match Self::trigger_cycle(ddg, op) {
            Some(t) => (write, t.max(write)),
            None => (write, write),
        }
    }

    /// Does an operation other than `op` bound to `fu` need input `port`
    /// somewhere in `lo..=hi`?
    fn operand_port_busy(
        &self,
        ddg: &DataDependenceGraph,
        fu: FuId,
        op: OpId,
        port: u8,
        lo: Cycle,
        hi: Cycle,
    ) -> bool {
        self.usage.bindings.iter().any(|(&other, &(ofu, _))| {
            if other == op || ofu != fu {
                return false;
            }
            let trigger = Self::trigger_cycle(ddg, other);
            ddg.op(other).inputs.iter().any(|&m| {
                let node = ddg.node(m);
                let Terminal::FuInput { operand, .. } = node.dst else {
                    return false;
                };
                if operand != port {
                    return false;
                }
                let (wlo, whi) = match (node.placement, trigger) {
                    (Some(p), _) => Self::operand_window(ddg, other, p.cycle),
                    // The write is still to come, at the latest with the trigger.
                    (None, Some(t)) => (t, t),
                    (None, None) => return false,
                };
                wlo <= hi && lo <= whi
            })
        })
    }

    /// Would a trigger of `op` at `t` close an operand window of `op`
    /// over another operation's write to the same input?
    fn trigger_strands_operands(
        &self,
        ddg: &DataDependenceGraph,
        fu: FuId,
        op: OpId,
        port: u8,
        t: Cycle,
    ) -> bool {
        if self.operand_port_busy(ddg, fu, op, port, t, t) {
            return true;
        }
        ddg.op(op).inputs.iter().any(|&m| {
            let node = ddg.node(m);
            match (node.dst, node.placement) {
                (Terminal::FuInput { operand, trigger: false }, Some(p)) => {
                    self.operand_port_busy(ddg, fu, op, operand, p.cycle.min(t), t)
                }
                _ => false,
            }
        })
    }

    fn find(&self, ddg: &DataDependenceGraph, cycle: Cycle, n: MoveId) -> Option<Assignment> {
        if cycle < 0 {
            return None;
        }
        let node = ddg.node(n);
        let usage = &self.usage;
        for src_fu in self.fu_candidates(ddg, node.src_op, &node.allowed_src_fus) {
            for dst_fu in self.fu_candidates(ddg, node.dst_op, &[]) {
                let dst = Self::dst_port(&node.dst, dst_fu);

                if let Port::FuIn { fu, operand } = dst {
                    if usage.fu_inputs.contains_key(&(cycle, fu, operand)) {
                        continue;
                    }
                    let op = node.dst_op?;
                    if node.is_trigger() {
                        if usage.triggers.contains_key(&(cycle, fu))
                            || self.trigger_clobbers(ddg, fu, op, cycle)
                            || self.trigger_strands_operands(ddg, fu, op, operand, cycle)
                        {
                            continue;
                        }
                    } else {
                        let (lo, hi) = Self::operand_window(ddg, op, cycle);
                        if self.operand_port_busy(ddg, fu, op, operand, lo, hi) {
                            continue;
                        }
                    }
                }
                if let Port::RfWrite(rf) = dst {
                    let ports = self.machine.register_files()[rf.index()].write_ports;
                    if usage.rf_writes.get(&(cycle, rf)).copied().unwrap_or(0) >= u32::from(ports) {
                        continue;
                    }
                }

                let src = Self::src_port(&node.src, src_fu);
                match src {
                    Some(Port::RfRead(rf)) => {
                        let ports = self.machine.register_files()[rf.index()].read_ports;
                        if usage.rf_reads.get(&(cycle, rf)).copied().unwrap_or(0) >= u32::from(ports) {
                            continue;
                        }
                    }
                    Some(Port::FuOut { fu, operand }) => {
                        let op = node.src_op?;
                        if let Some(&(reader, _)) = usage.result_reads.get(&(cycle, fu, operand)) {
                            if reader != op {
                                continue;
                            }
                        }
                        if self.result_clobbered(ddg, fu, op, cycle) {
                            continue;
                        }
                    }
                    _ => {}
                }

                let free_bus = |needs: &dyn Fn(BusId) -> bool| {
                    (0..self.machine.buses().len())
                        .map(BusId::new)
                        .find(|&b| !usage.buses.contains_key(&(cycle, b)) && needs(b))
                };
                let machine = self.machine;
                let found = match (node.src, src) {
                    (Terminal::Immediate(v), _) => {
                        let bits = immediate_bits(v);
                        let short = free_bus(&|b| {
                            machine.bus_connects(b, dst) && machine.buses()[b.index()].short_imm_bits >= bits
                        });
                        match short {
                            Some(bus) => Some((bus, false)),
                            None => {
                                let used = usage.long_imms.get(&cycle).copied().unwrap_or(0);
                                if used < machine.long_immediate_slots() {
                                    free_bus(&|b| machine.bus_connects(b, dst)).map(|bus| (bus, true))
                                } else {
                                    None
                                }
                            }
                        }
                    }
                    (_, Some(src)) => free_bus(&|b| machine.bus_connects(b, src) && machine.bus_connects(b, dst))
                        .map(|bus| (bus, false)),
                    (_, None) => None,
                };
                if let Some((bus, long_imm)) = found {
                    return Some(Assignment {
                        cycle,
                        bus,
                        src_fu,
                        dst_fu,
                        long_imm,
                    });
                }
            }
        }
        None
    }

    fn bind(&mut self, ddg: &mut DataDependenceGraph, op: Option<OpId>, fu: Option<FuId>) {
        if let (Some(op), Some(fu)) = (op, fu) {
            let entry = self.usage.bindings.entry(op).or_insert((fu, 0));
            debug_assert_eq!(entry.0, fu);
            entry.1 += 1;
            ddg.op_mut(op).fu = Some(fu);
        }
    }

    fn unbind(&mut self, ddg: &mut DataDependenceGraph, op: Option<OpId>) {
        if let Some(op) = op {
            if let Some(entry) = self.usage.bindings.get_mut(&op) {
                entry.1 -= 1;
                if entry.1 == 0 {
                    self.usage.bindings.remove(&op);
                    ddg.op_mut(op).fu = None;
                }
            }
        }
    }
}

impl<'m, M: Machine + ?Sized> ResourceManager for SimpleResourceManager<'m, M> {
    fn earliest_cycle(&self, ddg: &DataDependenceGraph, lower: Cycle, n: MoveId) -> Option<Cycle> {
        let lower = lower.max(0);
        let horizon = lower.max(self.largest_cycle().unwrap_or(0)) + SEARCH_WINDOW;
        (lower..=horizon).find(|&c| self.find(ddg, c, n).is_some())
    }

    fn latest_cycle(&self, ddg: &DataDependenceGraph, upper: Cycle, n: MoveId) -> Option<Cycle> {
        (0..=upper).rev().find(|&c| self.find(ddg, c, n).is_some())
    }

    fn can_assign(&self, ddg: &DataDependenceGraph, cycle: Cycle, n: MoveId) -> bool {
        !ddg.is_scheduled(n) && self.find(ddg, cycle, n).is_some()
    }

    fn assign(&mut self, ddg: &mut DataDependenceGraph, cycle: Cycle, n: MoveId) {
        assert!(!ddg.is_scheduled(n), "assigning already scheduled move {}", n);
        let a = match self.find(ddg, cycle, n) {
            Some(a) => a,
            None => panic!("no free resources for {} in cycle {}", n, cycle),
        };
        let node = ddg.node(n).clone();
        let usage = &mut self.usage;
        usage.buses.insert((cycle, a.bus), n);
        match node.src {
            Terminal::Register(r) => inc(&mut usage.rf_reads, (cycle, r.rf)),
            Terminal::FuOutput { operand } => {
                if let (Some(fu), Some(op)) = (a.src_fu, node.src_op) {
                    usage.result_reads.entry((cycle, fu, operand)).or_insert((op, 0)).1 += 1;
                }
            }
            _ => {}
        }
        if a.long_imm {
            *usage.long_imms.entry(cycle).or_insert(0) += 1;
        }
        match node.dst {
            Terminal::Register(r) => inc(&mut usage.rf_writes, (cycle, r.rf)),
            Terminal::FuInput { operand, trigger } => {
                if let (Some(fu), Some(op)) = (a.dst_fu, node.dst_op) {
                    usage.fu_inputs.insert((cycle, fu, operand), n);
                    if trigger {
                        usage.triggers.insert((cycle, fu), op);
                    }
                }
            }
            _ => {}
        }
        usage.assignments.insert(n, a);
        self.bind(ddg, node.src_op, a.src_fu);
        self.bind(ddg, node.dst_op, a.dst_fu);
        ddg.set_placement(
            n,
            Some(Placement {
                cycle,
                bus: a.bus,
            }),
        );
        trace!("rm: assigned {} to cycle {} bus {}", n, cycle, a.bus.index());
    }

    fn unassign(&mut self, ddg: &mut DataDependenceGraph, n: MoveId) {
        assert!(ddg.is_scheduled(n), "unassigning unscheduled move {}", n);
        let a = match self.usage.assignments.remove(&n) {
            Some(a) => a,
            None => panic!("move {} was not placed by this resource manager", n),
        };
        let node = ddg.node(n).clone();
        let usage = &mut self.usage;
        let cycle = a.cycle;
        usage.buses.remove(&(cycle, a.bus));
        match node.src {
            Terminal::Register(r) => dec(&mut usage.rf_reads, (cycle, r.rf)),
            Terminal::FuOutput { operand } => {
                if let Some(fu) = a.src_fu {
                    let key = (cycle, fu, operand);
                    if let Some(entry) = usage.result_reads.get_mut(&key) {
                        entry.1 -= 1;
                        if entry.1 == 0 {
                            usage.result_reads.remove(&key);
                        }
                    }
                }
            }
            _ => {}
        }
        if a.long_imm {
            if let Some(count) = usage.long_imms.get_mut(&cycle) {
                *count -= 1;
                if *count == 0 {
                    usage.long_imms.remove(&cycle);
                }
            }
        }
        match node.dst {
            Terminal::Register(r) => dec(&mut usage.rf_writes, (cycle, r.rf)),
            Terminal::FuInput { operand, trigger } => {
                if let Some(fu) = a.dst_fu {
                    usage.fu_inputs.remove(&(cycle, fu, operand));
                    if trigger {
                        usage.triggers.remove(&(cycle, fu));
                    }
                }
            }
            _ => {}
        }
        if a.src_fu.is_some() {
            self.unbind(ddg, node.src_op);
        }
        if a.dst_fu.is_some() {
            self.unbind(ddg, node.dst_op);
        }
        ddg.set_placement(n, None);
        trace!("rm: unassigned {} from cycle {}", n, cycle);
    }

    fn can_transport_immediate(&self, ddg: &DataDependenceGraph, n: MoveId) -> bool {
        let node = ddg.node(n);
        let Terminal::Immediate(v) = node.src else {
            return true;
        };
        self.fu_candidates(ddg, node.dst_op, &[])
            .into_iter()
            .any(|fu| self.machine.short_immediate_reaches(v, Self::dst_port(&node.dst, fu)))
    }

    fn smallest_cycle(&self) -> Option<Cycle> {
        self.usage.assignments.values().map(|a| a.cycle).min()
    }

    fn largest_cycle(&self) -> Option<Cycle> {
        self.usage.assignments.values().map(|a| a.cycle).max()
    }
}
