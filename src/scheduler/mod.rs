/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The list-scheduling driver.
//!
//! The driver repeatedly asks the selector for the most critical ready
//! group and places it. Operations are placed as a whole: top-down the
//! operand writes go first, then the bypasser gets a chance to shorten
//! them, then the result reads; bottom-up the operands are bypassed before
//! anything is placed, then the result reads go first, then the operands
//! and finally the trigger. When a part cannot be placed the
//! operation is taken off the schedule and retried from a later (or,
//! bottom up, earlier) start cycle.

use crate::bypass::{BypassResult, CycleLookBackBypasser};
use crate::ddg::{DataDependenceGraph, MoveId};
use crate::machine::Machine;
use crate::renamer::RegisterRenamer;
use crate::resource::ResourceManager;
use crate::reversible::{Attempt, Context};
use crate::selector::MoveNodeSelector;
use crate::steps::RenameLiveRange;
use crate::{BusId, Cycle, Direction, Guard, SchedError, SchedulerOptions, Terminal};
use alloc::vec::Vec;
use smallvec::{smallvec, SmallVec};

#[cfg(test)]
mod tests;

/// How many start cycles past the current schedule end an operation is
/// retried from before giving up.
const RETRY_WINDOW: Cycle = 20;

/// Operand placement rounds per start cycle.
const OPERAND_ROUNDS: usize = 2;

/// Counters describing what the driver did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub groups: usize,
    pub operations: usize,
    pub operation_retries: usize,
    pub bypasses: usize,
    pub bypass_fallbacks: usize,
    pub renames: usize,
    pub dead_results_removed: usize,
}

/// A move in its final position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduledMove {
    pub node: MoveId,
    pub bus: BusId,
    pub src: Terminal,
    pub dst: Terminal,
    pub guard: Option<Guard>,
}

/// The moves issued together in one cycle, ordered by bus. An empty
/// instruction is a no-op.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Instruction {
    pub moves: SmallVec<[ScheduledMove; 4]>,
}

impl Instruction {
    pub fn is_nop(&self) -> bool {
        self.moves.is_empty()
    }
}

/// A scheduled block in program order. Cycle 0 is the first instruction.
#[derive(Clone, Debug, Default)]
pub struct Schedule {
    pub instructions: Vec<Instruction>,
    /// Cycle in the dependence graph that instruction 0 corresponds to.
    pub base_cycle: Cycle,
    pub stats: Stats,
}

impl Schedule {
    /// Collect the placed moves of `ddg`.
    pub fn from_graph(ddg: &DataDependenceGraph, stats: Stats) -> Self {
        let mut placed: Vec<(Cycle, BusId, MoveId)> = ddg
            .node_ids()
            .filter_map(|n| ddg.node(n).placement.map(|p| (p.cycle, p.bus, n)))
            .collect();
        placed.sort_unstable();
        let Some(&(base_cycle, _, _)) = placed.first() else {
            return Schedule {
                stats,
                ..Schedule::default()
            };
        };
        let last = placed.last().map_or(base_cycle, |&(c, _, _)| c);
        let mut instructions = Vec::with_capacity((last - base_cycle + 1) as usize);
        instructions.resize_with((last - base_cycle + 1) as usize, Instruction::default);
        for (cycle, bus, n) in placed {
            let node = ddg.node(n);
            instructions[(cycle - base_cycle) as usize].moves.push(ScheduledMove {
                node: n,
                bus,
                src: node.src,
                dst: node.dst,
                guard: node.guard,
            });
        }
        Schedule {
            instructions,
            base_cycle,
            stats,
        }
    }

    /// Number of instructions, no-ops included.
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn move_count(&self) -> usize {
        self.instructions.iter().map(|i| i.moves.len()).sum()
    }

    /// The instruction index `n` was placed in.
    pub fn cycle_of(&self, n: MoveId) -> Option<usize> {
        self.instructions
            .iter()
            .position(|i| i.moves.iter().any(|m| m.node == n))
    }
}

impl core::fmt::Display for Schedule {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        for (i, inst) in self.instructions.iter().enumerate() {
            write!(f, "{:4}:", i)?;
            if inst.is_nop() {
                write!(f, " nop")?;
            }
            for m in &inst.moves {
                write!(f, " [b{}] ", m.bus.index())?;
                if let Some(g) = &m.guard {
                    write!(f, "{}{} ", if g.inverted { "!" } else { "?" }, g.reg)?;
                }
                write!(f, "{} -> {}", m.src, m.dst)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Schedule every move of `ddg` with `rm`.
///
/// `renamer`, when given and enabled by the options, is used to remove
/// anti dependences that delay moves. On success the graph holds the
/// placement of every move and the returned [`Schedule`] lists them in
/// program order.
pub fn schedule_block<'m, M: Machine + ?Sized>(
    ddg: &mut DataDependenceGraph,
    machine: &M,
    rm: &mut dyn ResourceManager,
    renamer: Option<&mut RegisterRenamer<'m>>,
    options: &SchedulerOptions,
) -> Result<Schedule, SchedError> {
    let selector = MoveNodeSelector::new(ddg, options.direction, options.orphan_policy);
    let renamer = match renamer {
        Some(renamer) if options.rename_registers => {
            renamer.set_long_immediate_rfs(options.allow_limm_rfs);
            Some(renamer)
        }
        _ => None,
    };
    log::debug!(
        "scheduling {} moves {:?}, bypass distance {}",
        ddg.node_count(),
        options.direction,
        options.bypass_distance
    );

    let mut driver = Driver {
        region: Region {
            ddg,
            rm,
            renamer,
            selector,
        },
        bypasser: CycleLookBackBypasser::from_options(options),
        options: *options,
        stats: Stats::default(),
        end_cycle: 0,
    };
    driver.run()?;

    let Driver { region, stats, .. } = driver;
    #[cfg(feature = "checker")]
    if let Err(errors) = crate::checker::check_schedule(region.ddg, machine) {
        panic!("produced schedule is invalid: {:?}", errors);
    }
    #[cfg(not(feature = "checker"))]
    let _ = machine;

    let schedule = Schedule::from_graph(region.ddg, stats);
    log::debug!(
        "scheduled {} moves into {} instructions: {:?}",
        schedule.move_count(),
        schedule.len(),
        stats
    );
    Ok(schedule)
}

/// The state the steps operate on.
struct Region<'a, 'm> {
    ddg: &'a mut DataDependenceGraph,
    rm: &'a mut dyn ResourceManager,
    renamer: Option<&'a mut RegisterRenamer<'m>>,
    selector: MoveNodeSelector,
}

impl<'a, 'm> Region<'a, 'm> {
    fn cx(&mut self) -> Context<'_, 'm> {
        Context {
            ddg: &mut *self.ddg,
            rm: &mut *self.rm,
            renamer: self.renamer.as_deref_mut(),
            selector: Some(&mut self.selector),
        }
    }
}

struct Driver<'a, 'm> {
    region: Region<'a, 'm>,
    bypasser: CycleLookBackBypasser,
    options: SchedulerOptions,
    stats: Stats,
    /// Bottom-up, the cycle moves are placed down from.
    end_cycle: Cycle,
}

/// The moves of one operation (or a lone move) within a group.
type Unit = SmallVec<[MoveId; 4]>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum UnitKey {
    Op(crate::OpId),
    Lone(MoveId),
}

impl<'a, 'm> Driver<'a, 'm> {
    fn run(&mut self) -> Result<(), SchedError> {
        if self.options.direction == Direction::BottomUp {
            let ddg = &*self.region.ddg;
            let latencies: u32 = ddg.op_ids().map(|op| ddg.op(op).latency).sum();
            self.end_cycle = (ddg.node_count() as u32 + latencies) as Cycle + 10;
        }

        loop {
            let group = self.region.selector.candidates(self.region.ddg);
            if group.is_empty() {
                break;
            }
            self.stats.groups += 1;
            for unit in self.split_units(group.nodes()) {
                self.schedule_unit(&unit)?;
                for &n in &unit {
                    if self.region.ddg.node(n).is_live() && self.region.ddg.is_scheduled(n) {
                        self.region.selector.notify_scheduled(self.region.ddg, n);
                    }
                }
            }
        }

        let ddg = &*self.region.ddg;
        let unscheduled = ddg.node_ids().filter(|&n| !ddg.is_scheduled(n)).count();
        if unscheduled > 0 {
            log::warn!("ready list empty with {} unscheduled moves", unscheduled);
            if trace_enabled!() {
                ddg.dump();
            }
            return Err(SchedError::Deadlock { unscheduled });
        }

        let mut cx = self.region.cx();
        self.stats.dead_results_removed += self.bypasser.remove_dead_results(&mut cx);
        self.bypasser.clear();
        Ok(())
    }

    fn unit_key(&self, n: MoveId) -> UnitKey {
        let node = self.region.ddg.node(n);
        match node.dst_op.or(node.src_op) {
            Some(op) => UnitKey::Op(op),
            None => UnitKey::Lone(n),
        }
    }

    /// Split a group into operations and lone moves, ordered so that a
    /// unit comes after the units it depends on (before them bottom-up).
    fn split_units(&self, group: &[MoveId]) -> Vec<Unit> {
        let mut keys: SmallVec<[UnitKey; 4]> = SmallVec::new();
        let mut units: Vec<Unit> = Vec::new();
        for &n in group {
            let key = self.unit_key(n);
            match keys.iter().position(|&k| k == key) {
                Some(i) => units[i].push(n),
                None => {
                    keys.push(key);
                    units.push(smallvec![n]);
                }
            }
        }
        if units.len() == 1 {
            return units;
        }

        let ddg = &*self.region.ddg;
        let unit_of = |n: MoveId| units.iter().position(|u| u.contains(&n));
        let deps: Vec<SmallVec<[usize; 4]>> = units
            .iter()
            .enumerate()
            .map(|(i, unit)| {
                let mut deps: SmallVec<[usize; 4]> = SmallVec::new();
                for &n in unit {
                    for e in ddg.in_edges(n) {
                        if ddg.edge(e).is_back_edge() {
                            continue;
                        }
                        if let Some(j) = unit_of(ddg.tail_node(e)) {
                            if j != i && !deps.contains(&j) {
                                deps.push(j);
                            }
                        }
                    }
                }
                deps
            })
            .collect();

        let mut done = alloc::vec![false; units.len()];
        let mut order: Vec<usize> = Vec::with_capacity(units.len());
        while order.len() < units.len() {
            let next = (0..units.len())
                .find(|&i| !done[i] && deps[i].iter().all(|&j| done[j]))
                .or_else(|| (0..units.len()).find(|&i| !done[i]));
            let Some(i) = next else {
                break;
            };
            done[i] = true;
            order.push(i);
        }
        if self.options.direction == Direction::BottomUp {
            order.reverse();
        }
        let mut slots: Vec<Option<Unit>> = units.into_iter().map(Some).collect();
        order.into_iter().filter_map(|i| slots[i].take()).collect()
    }

    fn schedule_unit(&mut self, unit: &[MoveId]) -> Result<(), SchedError> {
        // Bypassing an earlier unit of the group may have placed or
        // removed some of these.
        let ddg = &*self.region.ddg;
        let unit: Unit = unit
            .iter()
            .copied()
            .filter(|&n| ddg.node(n).is_live() && !ddg.is_scheduled(n))
            .collect();
        if unit.is_empty() {
            return Ok(());
        }
        let unit = &unit[..];
        let is_operation = unit.iter().any(|&n| self.region.ddg.node(n).in_operation());
        match (is_operation, self.options.direction) {
            (true, Direction::TopDown) => self.schedule_operation_top_down(unit),
            (true, Direction::BottomUp) => self.schedule_operation_bottom_up(unit),
            (false, direction) => {
                for &n in unit {
                    self.try_rename(n, direction);
                    let placed = match direction {
                        Direction::TopDown => self.schedule_move_top_down(n, 0),
                        Direction::BottomUp => self.schedule_move_bottom_up(n, self.end_cycle),
                    };
                    if placed.is_none() {
                        return Err(SchedError::Unschedulable(n));
                    }
                }
                Ok(())
            }
        }
    }

    /// Rename the live range around `n` if only anti dependences keep it
    /// from an earlier (bottom-up: later) cycle.
    fn try_rename(&mut self, n: MoveId, direction: Direction) {
        if self.region.renamer.is_none() {
            return;
        }
        let ddg = &*self.region.ddg;
        let node = ddg.node(n);
        let (dest, cycle) = match direction {
            Direction::TopDown => {
                if !node.dst.is_register() {
                    return;
                }
                let free = ddg.earliest_cycle_ignoring_antideps(n);
                if free >= ddg.earliest_cycle(n) {
                    return;
                }
                (true, free)
            }
            Direction::BottomUp => {
                if !node.src.is_register() {
                    return;
                }
                let Some(bound) = ddg.latest_cycle(n) else {
                    return;
                };
                let free = ddg.latest_cycle_ignoring_antideps(n).unwrap_or(self.end_cycle);
                if free <= bound {
                    return;
                }
                (false, free)
            }
        };
        let mut cx = self.region.cx();
        let mut attempt = Attempt::new();
        if attempt.run(&mut cx, RenameLiveRange::new(n, dest, cycle, direction)) {
            trace!("renamed the live range of {} to free cycle {}", n, cycle);
            // Renames are kept even if the move does not end up earlier.
            let _ = attempt.commit();
            self.stats.renames += 1;
        }
    }

    fn guard_floor(&self, n: MoveId) -> Cycle {
        let ddg = &*self.region.ddg;
        ddg.node(n)
            .guard
            .map_or(0, |g| ddg.guard_latency(g.reg) as Cycle - 1)
    }

    /// Place `n` as early as possible, not before `lower`.
    fn schedule_move_top_down(&mut self, n: MoveId, lower: Cycle) -> Option<Cycle> {
        let ddg = &*self.region.ddg;
        let mut earliest = ddg.earliest_cycle(n).max(lower).max(self.guard_floor(n));
        if ddg.node(n).control_flow {
            earliest = earliest.max(self.region.rm.largest_cycle().unwrap_or(0));
        }
        let cycle = self.region.rm.earliest_cycle(ddg, earliest, n)?;
        self.region.rm.assign(self.region.ddg, cycle, n);
        Some(cycle)
    }

    /// Place `n` as late as possible, not after `upper`.
    fn schedule_move_bottom_up(&mut self, n: MoveId, upper: Cycle) -> Option<Cycle> {
        let ddg = &*self.region.ddg;
        let latest = ddg.latest_cycle(n).map_or(upper, |l| l.min(upper));
        let floor = self.guard_floor(n).max(ddg.earliest_cycle(n));
        if latest < floor {
            return None;
        }
        let cycle = self.region.rm.latest_cycle(ddg, latest, n)?;
        if cycle < floor {
            return None;
        }
        self.region.rm.assign(self.region.ddg, cycle, n);
        Some(cycle)
    }

    fn unschedule(&mut self, nodes: &[MoveId]) {
        for &n in nodes {
            if self.region.ddg.node(n).is_live() && self.region.ddg.is_scheduled(n) {
                self.region.rm.unassign(self.region.ddg, n);
            }
        }
    }

    /// Operand writes of the unit's operation and its result reads.
    fn split_operation(&self, unit: &[MoveId]) -> (Unit, Unit) {
        let ddg = &*self.region.ddg;
        unit.iter()
            .copied()
            .partition(|&n| ddg.node(n).dst_op.is_some())
    }

    fn schedule_operation_top_down(&mut self, unit: &[MoveId]) -> Result<(), SchedError> {
        let (operands, results) = self.split_operation(unit);
        self.stats.operations += 1;
        let mut bypass = self.bypasser.is_enabled();
        let mut start: Cycle = 0;
        let horizon = self.region.rm.largest_cycle().unwrap_or(0) + RETRY_WINDOW;

        while start <= horizon {
            let Some(first_operand) = self.schedule_operand_writes(&operands, start) else {
                start += 1;
                self.stats.operation_retries += 1;
                continue;
            };

            let mut bypassed = 0;
            if bypass {
                let mut cx = self.region.cx();
                match self.bypasser.bypass(&mut cx, &operands) {
                    BypassResult::None => {}
                    BypassResult::Bypassed(count) => bypassed = count,
                    BypassResult::NeedsFallback => {
                        self.bypasser.remove_bypass(&mut cx, &operands);
                        self.stats.bypass_fallbacks += 1;
                        bypass = false;
                        continue;
                    }
                }
            }
            if let Some(&n) = operands.iter().find(|&&n| self.reads_forced_bypass(n)) {
                log::warn!("operand {} could not be bypassed from a forced-bypass register", n);
                self.unschedule(&operands);
                return Err(SchedError::Unschedulable(n));
            }

            if self.schedule_result_reads_top_down(&results) {
                self.stats.bypasses += bypassed;
                if self.options.verbose_log {
                    log::debug!("operation {:?} placed from cycle {}", unit, first_operand);
                }
                return Ok(());
            }

            self.unschedule(&results);
            self.stats.operation_retries += 1;
            if bypassed > 0 {
                let mut cx = self.region.cx();
                self.bypasser.remove_bypass(&mut cx, &operands);
                bypass = false;
            } else {
                self.unschedule(&operands);
                start = (first_operand + 1).max(start + 1);
            }
        }
        Err(SchedError::Unschedulable(unit[0]))
    }

    fn reads_forced_bypass(&self, n: MoveId) -> bool {
        let ddg = &*self.region.ddg;
        ddg.node(n).src.reg().map_or(false, |r| ddg.is_forced_bypass(r))
    }

    /// Place the operand writes at or after `start`, the one with the
    /// latest data dependences first and the trigger last. Returns the
    /// earliest operand cycle, or `None` with nothing placed.
    fn schedule_operand_writes(&mut self, operands: &[MoveId], mut start: Cycle) -> Option<Cycle> {
        if operands.is_empty() {
            return Some(start);
        }
        let ddg = &*self.region.ddg;
        let mut order: Unit = operands
            .iter()
            .copied()
            .filter(|&n| !ddg.node(n).is_trigger())
            .collect();
        order.sort_by_key(|&n| core::cmp::Reverse(ddg.earliest_cycle(n)));
        order.extend(operands.iter().copied().filter(|&n| ddg.node(n).is_trigger()));

        for _ in 0..OPERAND_ROUNDS {
            let mut anchor = None;
            let mut first = None;
            let mut last = start;
            let mut failed = false;
            for &n in &order {
                let lower = if self.region.ddg.node(n).is_trigger() {
                    last
                } else {
                    anchor.unwrap_or(start)
                };
                match self.schedule_move_top_down(n, lower) {
                    Some(cycle) => {
                        anchor.get_or_insert(cycle);
                        first = Some(first.map_or(cycle, |f: Cycle| f.min(cycle)));
                        last = last.max(cycle);
                    }
                    None => {
                        failed = true;
                        break;
                    }
                }
            }
            if !failed {
                return first;
            }
            self.unschedule(operands);
            start = anchor.map_or(start, |a| a.max(start)) + 1;
        }
        None
    }

    fn schedule_result_reads_top_down(&mut self, results: &[MoveId]) -> bool {
        for &n in results {
            self.try_rename(n, Direction::TopDown);
            if self.schedule_move_top_down(n, 0).is_none() {
                return false;
            }
        }
        true
    }

    fn schedule_operation_bottom_up(&mut self, unit: &[MoveId]) -> Result<(), SchedError> {
        let (operands, results) = self.split_operation(unit);
        self.stats.operations += 1;

        let bypassed = {
            let mut cx = self.region.cx();
            self.bypasser.bypass_bottom_up(&mut cx, &operands)
        };
        self.check_forced_bypass(&operands, bypassed)?;
        if self.place_operation_bottom_up(unit, &operands, &results) {
            self.stats.bypasses += bypassed;
            return Ok(());
        }
        if bypassed > 0 {
            let mut cx = self.region.cx();
            self.bypasser.remove_bypass(&mut cx, &operands);
            self.stats.bypass_fallbacks += 1;
            self.check_forced_bypass(&operands, 0)?;
            if self.place_operation_bottom_up(unit, &operands, &results) {
                return Ok(());
            }
        }
        Err(SchedError::Unschedulable(unit[0]))
    }

    /// Fail if an operand still reads a forced-bypass register, taking
    /// back the `bypassed` operands first.
    fn check_forced_bypass(&mut self, operands: &[MoveId], bypassed: usize) -> Result<(), SchedError> {
        let Some(&n) = operands.iter().find(|&&n| self.reads_forced_bypass(n)) else {
            return Ok(());
        };
        log::warn!("operand {} could not be bypassed from a forced-bypass register", n);
        if bypassed > 0 {
            let mut cx = self.region.cx();
            self.bypasser.remove_bypass(&mut cx, operands);
        }
        Err(SchedError::Unschedulable(n))
    }

    fn place_operation_bottom_up(&mut self, unit: &[MoveId], operands: &[MoveId], results: &[MoveId]) -> bool {
        let mut start = self.end_cycle;
        while start >= 0 {
            if !self.schedule_result_reads_bottom_up(results, start) {
                self.unschedule(results);
                start -= 1;
                self.stats.operation_retries += 1;
                continue;
            }
            if self.schedule_operands_bottom_up(operands, start) {
                if self.options.verbose_log {
                    log::debug!("operation {:?} placed down from cycle {}", unit, start);
                }
                return true;
            }
            self.unschedule(results);
            start -= 1;
            self.stats.operation_retries += 1;
        }
        false
    }

    fn schedule_result_reads_bottom_up(&mut self, results: &[MoveId], start: Cycle) -> bool {
        for &n in results {
            self.try_rename(n, Direction::BottomUp);
            if self.schedule_move_bottom_up(n, start).is_none() {
                return false;
            }
        }
        true
    }

    /// Place the operands at or before the latest trigger cycle, then
    /// the trigger no earlier than the last of them. The trigger bound
    /// is lowered until both fit.
    fn schedule_operands_bottom_up(&mut self, operands: &[MoveId], start: Cycle) -> bool {
        let ddg = &*self.region.ddg;
        let trigger = operands.iter().copied().find(|&n| ddg.node(n).is_trigger());
        let others: Unit = operands
            .iter()
            .copied()
            .filter(|&n| Some(n) != trigger)
            .collect();
        let mut trigger_latest = match trigger {
            Some(t) => ddg.latest_cycle(t).map_or(start, |l| l.min(start)),
            None => start,
        };

        while trigger_latest >= 0 {
            let mut last_operand = None;
            let mut failed = false;
            for &n in &others {
                match self.schedule_move_bottom_up(n, trigger_latest) {
                    Some(cycle) => last_operand = Some(last_operand.map_or(cycle, |l: Cycle| l.max(cycle))),
                    None => {
                        failed = true;
                        break;
                    }
                }
            }
            if !failed {
                let Some(t) = trigger else {
                    return true;
                };
                match self.schedule_move_bottom_up(t, trigger_latest) {
                    Some(cycle) if last_operand.map_or(true, |l| cycle >= l) => return true,
                    Some(_) => self.unschedule(&[t]),
                    None => {}
                }
            }
            self.unschedule(operands);
            trigger_latest -= 1;
        }
        false
    }
}
