/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Software bypassing.
//!
//! After the operand writes of an operation are placed, each operand
//! whose value was produced by a recently scheduled result read (or by an
//! immediate load) is redirected to read the producer's source directly.
//! The register write in between may then become dead and is removed once
//! the region is scheduled.
//!
//! Bottom-up the consumer is placed before its producer, so operands are
//! redirected before they are placed and a producer left without readers
//! is removed right away. Writes to forced-bypass registers are removed
//! whether or not dead results are killed otherwise.

use crate::ddg::{DataDependenceGraph, MoveId};
use crate::reversible::{Applied, Attempt, Context};
use crate::steps::{AssignMove, MergeAndKeepEdges, RemoveDeadResult, UnassignMove};
use crate::{Cycle, SchedulerOptions};
use alloc::vec::Vec;
use smallvec::SmallVec;

/// Outcome of [`CycleLookBackBypasser::bypass`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BypassResult {
    /// Nothing was bypassed.
    None,
    /// This many operands now read their producer directly.
    Bypassed(usize),
    /// A bypassed operand could not be placed without moving it later.
    /// The group's bypasses must be removed with
    /// [`remove_bypass`](CycleLookBackBypasser::remove_bypass) and the
    /// operation scheduled without them.
    NeedsFallback,
}

enum NodeBypass {
    Skipped,
    Bypassed,
    Failed,
}

/// A committed bypass.
#[derive(Debug)]
struct Entry {
    dest: MoveId,
    source: MoveId,
    steps: Applied,
    /// `steps` also removed the then unused `source`.
    source_removed: bool,
}

#[derive(Debug, Default)]
pub struct CycleLookBackBypasser {
    look_back: u32,
    kill_dead_results: bool,
    log: Vec<Entry>,
    /// Producers whose result may have lost its last reader.
    dead_candidates: Vec<MoveId>,
}

impl CycleLookBackBypasser {
    pub fn new(look_back: u32, kill_dead_results: bool) -> Self {
        CycleLookBackBypasser {
            look_back,
            kill_dead_results,
            log: Vec::new(),
            dead_candidates: Vec::new(),
        }
    }

    pub fn from_options(options: &SchedulerOptions) -> Self {
        Self::new(options.bypass_distance, options.kill_dead_results)
    }

    pub fn is_enabled(&self) -> bool {
        self.look_back > 0
    }

    /// Number of bypasses currently applied.
    pub fn bypass_count(&self) -> usize {
        self.log.len()
    }

    /// Does some bypass redirect `dest`?
    pub fn is_bypassed(&self, dest: MoveId) -> bool {
        self.log.iter().any(|e| e.dest == dest)
    }

    /// Bypass the scheduled operand writes among `group`.
    pub fn bypass(&mut self, cx: &mut Context<'_, '_>, group: &[MoveId]) -> BypassResult {
        if !self.is_enabled() {
            return BypassResult::None;
        }
        if group.iter().any(|&n| cx.ddg.node(n).control_flow) {
            return BypassResult::None;
        }

        let mut trigger = None;
        let mut bypassed: SmallVec<[MoveId; 4]> = SmallVec::new();
        for &n in group {
            let node = cx.ddg.node(n);
            if !node.is_live() || !node.is_scheduled() || !node.is_operand_move() {
                continue;
            }
            if node.is_trigger() {
                trigger = Some(n);
            }
            match self.bypass_node(cx, n) {
                NodeBypass::Skipped => {}
                NodeBypass::Bypassed => bypassed.push(n),
                NodeBypass::Failed => return BypassResult::NeedsFallback,
            }
        }
        if bypassed.is_empty() {
            return BypassResult::None;
        }

        // Operands that kept their register source may move up now that
        // their bypassed siblings left. The trigger goes last.
        let mut rest: SmallVec<[MoveId; 4]> = group
            .iter()
            .copied()
            .filter(|&n| {
                let node = cx.ddg.node(n);
                node.is_live()
                    && node.is_scheduled()
                    && node.is_operand_move()
                    && !bypassed.contains(&n)
                    && Some(n) != trigger
            })
            .collect();
        rest.extend(trigger.filter(|t| !bypassed.contains(t)));
        for n in rest {
            Self::reschedule_earlier(cx, n);
        }

        if let Some(t) = trigger {
            self.fix_trigger(cx, t, group);
        }

        trace!("bypassed {} operand(s) of {:?}", bypassed.len(), group);
        BypassResult::Bypassed(bypassed.len())
    }

    fn bypass_node(&mut self, cx: &mut Context<'_, '_>, n: MoveId) -> NodeBypass {
        let node = cx.ddg.node(n);
        assert!(node.is_operand_move(), "bypassing {} which is no operand write", n);
        let Some(reg) = node.src.reg() else {
            return NodeBypass::Skipped;
        };
        let cycle = node.cycle();
        let guard = node.guard;

        let Some(source) = Self::only_source(cx.ddg, n) else {
            return NodeBypass::Skipped;
        };

        let src = cx.ddg.node(source);
        let Some(src_cycle) = src.placement.map(|p| p.cycle) else {
            return NodeBypass::Skipped;
        };
        if !cx.ddg.is_forced_bypass(reg) && src_cycle + (self.look_back as Cycle) < cycle {
            return NodeBypass::Skipped;
        }
        if let Some(g) = src.guard {
            if guard != Some(g) {
                return NodeBypass::Skipped;
            }
        }
        if !src.is_result_move() && !src.src.is_immediate() {
            return NodeBypass::Skipped;
        }
        if src.src.reg().map_or(false, |r| cx.ddg.is_forced_bypass(r)) {
            return NodeBypass::Skipped;
        }

        let mut attempt = Attempt::new();
        if !attempt.run(cx, UnassignMove::new(n)) {
            return NodeBypass::Skipped;
        }
        if !attempt.run(cx, MergeAndKeepEdges::new(source, n, false)) {
            attempt.rollback(cx);
            return NodeBypass::Skipped;
        }

        let mut earliest = cx.ddg.earliest_cycle(n);
        if let Some(g) = guard {
            earliest = earliest.max(cx.ddg.guard_latency(g.reg) as Cycle - 1);
        }
        let placed = match cx.rm.earliest_cycle(cx.ddg, earliest, n) {
            Some(c) if c <= cycle => attempt.run(cx, AssignMove::new(n, c)),
            _ => false,
        };
        if !placed {
            trace!("bypass {} -> {}: no cycle at or before {}", source, n, cycle);
            attempt.rollback(cx);
            return NodeBypass::Failed;
        }

        trace!(
            "bypass {} -> {}: {} moved from {} to {}",
            source,
            n,
            n,
            cycle,
            cx.ddg.node(n).cycle()
        );
        self.log.push(Entry {
            dest: n,
            source,
            steps: attempt.commit(),
            source_removed: false,
        });
        if !self.dead_candidates.contains(&source) {
            self.dead_candidates.push(source);
        }
        NodeBypass::Bypassed
    }

    /// Bypass the unscheduled operand writes among `group` before they
    /// are placed bottom-up. Returns how many were bypassed.
    pub fn bypass_bottom_up(&mut self, cx: &mut Context<'_, '_>, group: &[MoveId]) -> usize {
        if !self.is_enabled() || group.iter().any(|&n| cx.ddg.node(n).control_flow) {
            return 0;
        }
        let mut bypassed = 0;
        for &n in group {
            let node = cx.ddg.node(n);
            if !node.is_live() || node.is_scheduled() || !node.is_operand_move() {
                continue;
            }
            let Some(reg) = node.src.reg() else {
                continue;
            };
            let forced = cx.ddg.is_forced_bypass(reg);
            let guard = node.guard;
            let Some(source) = Self::only_source(cx.ddg, n) else {
                continue;
            };
            let src = cx.ddg.node(source);
            if !src.is_live() || src.is_scheduled() || cx.ddg.is_loop_bypass(source, n) {
                continue;
            }
            if !src.is_result_move() && !src.src.is_immediate() {
                continue;
            }
            if src.src.reg().map_or(false, |r| cx.ddg.is_forced_bypass(r)) {
                continue;
            }
            if src.guard.map_or(false, |g| guard != Some(g)) {
                continue;
            }

            let mut attempt = Attempt::new();
            if !attempt.run(cx, MergeAndKeepEdges::new(source, n, false)) {
                continue;
            }
            let source_removed = (self.kill_dead_results || forced)
                && cx.ddg.node(source).is_result_move()
                && !cx.ddg.result_used(source)
                && attempt.run(cx, RemoveDeadResult::new(source));
            trace!(
                "bypass {} -> {} before placement{}",
                source,
                n,
                if source_removed { ", source removed" } else { "" }
            );
            self.log.push(Entry {
                dest: n,
                source,
                steps: attempt.commit(),
                source_removed,
            });
            if !source_removed && !self.dead_candidates.contains(&source) {
                self.dead_candidates.push(source);
            }
            bypassed += 1;
        }
        bypassed
    }

    /// The single register write `n` reads, if there is exactly one.
    fn only_source(ddg: &DataDependenceGraph, n: MoveId) -> Option<MoveId> {
        let mut source = None;
        for e in ddg.in_edges(n) {
            let edge = ddg.edge(e);
            if edge.is_register_raw() && !edge.guard_use && !edge.head_pseudo {
                if source.is_some() {
                    return None;
                }
                source = Some(ddg.tail_node(e));
            }
        }
        source
    }

    /// Move `n` to its earliest cycle if that is earlier than the current
    /// one.
    fn reschedule_earlier(cx: &mut Context<'_, '_>, n: MoveId) {
        let original = cx.ddg.node(n).cycle();
        cx.rm.unassign(cx.ddg, n);
        let mut earliest = cx.ddg.earliest_cycle(n);
        if let Some(g) = cx.ddg.node(n).guard {
            earliest = earliest.max(cx.ddg.guard_latency(g.reg) as Cycle - 1);
        }
        let cycle = match cx.rm.earliest_cycle(cx.ddg, earliest, n) {
            Some(c) if c < original => c,
            _ => original,
        };
        cx.rm.assign(cx.ddg, cycle, n);
    }

    /// Keep the trigger at or after every other operand write.
    fn fix_trigger(&self, cx: &mut Context<'_, '_>, trigger: MoveId, group: &[MoveId]) {
        let last_operand = group
            .iter()
            .filter(|&&n| n != trigger)
            .filter(|&&n| {
                let node = cx.ddg.node(n);
                node.is_live() && node.is_operand_move() && node.dst_op == cx.ddg.node(trigger).dst_op
            })
            .filter_map(|&n| cx.ddg.node(n).placement.map(|p| p.cycle))
            .max();
        let cycle = cx.ddg.node(trigger).cycle();
        let Some(last_operand) = last_operand else {
            return;
        };
        if cycle >= last_operand {
            return;
        }
        cx.rm.unassign(cx.ddg, trigger);
        let lower = cx.ddg.earliest_cycle(trigger).max(last_operand);
        match cx.rm.earliest_cycle(cx.ddg, lower, trigger) {
            Some(c) => cx.rm.assign(cx.ddg, c, trigger),
            // The trigger fitted at its old cycle before.
            None => cx.rm.assign(cx.ddg, cycle, trigger),
        }
    }

    /// Take back every bypass into `group` and unschedule the group's
    /// moves.
    pub fn remove_bypass(&mut self, cx: &mut Context<'_, '_>, group: &[MoveId]) {
        for &n in group {
            if cx.ddg.node(n).is_live() && cx.ddg.is_scheduled(n) {
                cx.rm.unassign(cx.ddg, n);
            }
        }
        let mut i = self.log.len();
        while i > 0 {
            i -= 1;
            if group.contains(&self.log[i].dest) {
                let entry = self.log.remove(i);
                trace!("removing bypass {} -> {}", entry.source, entry.dest);
                entry.steps.undo(cx);
            }
        }
        // Undoing the bypass put the operands back in their old cycles.
        for &n in group {
            if cx.ddg.node(n).is_live() && cx.ddg.is_scheduled(n) {
                cx.rm.unassign(cx.ddg, n);
            }
        }
    }

    /// Remove every bypassed producer whose value nobody reads any more.
    /// Returns the number of removed moves, counting those already removed
    /// while bypassing bottom-up.
    pub fn remove_dead_results(&mut self, cx: &mut Context<'_, '_>) -> usize {
        let mut removed = self.log.iter().filter(|e| e.source_removed).count();
        for source in core::mem::take(&mut self.dead_candidates) {
            let node = cx.ddg.node(source);
            if !node.is_live() || !node.is_result_move() || cx.ddg.result_used(source) {
                continue;
            }
            let forced = node.dst.reg().map_or(false, |r| cx.ddg.is_forced_bypass(r));
            if !self.kill_dead_results && !forced {
                continue;
            }
            let mut attempt = Attempt::new();
            if attempt.run(cx, RemoveDeadResult::new(source)) {
                // Removals are final.
                let _ = attempt.commit();
                removed += 1;
            }
        }
        if removed > 0 {
            log::debug!("removed {} dead result move(s)", removed);
        }
        removed
    }

    /// Forget all bypasses; they stay applied.
    pub fn clear(&mut self) {
        self.log.clear();
        self.dead_candidates.clear();
    }
}
