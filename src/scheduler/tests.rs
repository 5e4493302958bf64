/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

use super::*;
use crate::checker::check_schedule;
use crate::ddg::DdgBuilder;
use crate::machine::MachineBuilder;
use crate::renamer::RegisterFileCache;
use crate::resource::SimpleResourceManager;
use crate::{MachineDesc, Reg, RfId};

fn machine(buses: usize) -> MachineDesc {
    let mut b = MachineBuilder::new("scheduler-test");
    b.register_file("r", 16, 2, 2);
    b.function_unit("alu", &[("add", 1, 2, 1)]);
    b.function_unit("mul", &[("mul", 3, 2, 1)]);
    b.control_unit("gcu", &[("jump", 1, 1, 0)]);
    b.fully_connected_buses(buses, 8);
    b.finish()
}

fn r(i: u16) -> Terminal {
    Terminal::Register(Reg::new(RfId::new(0), i))
}

fn options(direction: Direction) -> SchedulerOptions {
    SchedulerOptions {
        direction,
        ..SchedulerOptions::default()
    }
}

fn run(
    ddg: &mut DataDependenceGraph,
    m: &MachineDesc,
    options: &SchedulerOptions,
) -> Result<Schedule, SchedError> {
    let mut rm = SimpleResourceManager::new(m);
    schedule_block(ddg, m, &mut rm, None, options)
}

fn cycle(ddg: &DataDependenceGraph, n: MoveId) -> Cycle {
    ddg.node(n).cycle()
}

#[test]
fn bottom_up_places_operands_before_trigger_before_result() {
    let m = machine(2);
    let mut b = DdgBuilder::new(&m);
    let op = b.operation("add");
    let operand = b.operand(op, 0, r(1));
    let trigger = b.trigger(op, 1, r(2));
    let result = b.result(op, 2, r(3));
    let mut ddg = b.build().unwrap();

    let schedule = run(&mut ddg, &m, &options(Direction::BottomUp)).unwrap();
    assert!(cycle(&ddg, operand) <= cycle(&ddg, trigger));
    assert!(cycle(&ddg, trigger) + 1 <= cycle(&ddg, result));
    assert_eq!(schedule.cycle_of(operand), Some(0));
    assert_eq!(schedule.cycle_of(trigger), Some(0));
    assert_eq!(schedule.cycle_of(result), Some(1));
    assert_eq!(schedule.len(), 2);
    assert!(check_schedule(&ddg, &m).is_ok());
}

/// `r1 + r2 -> r3; r3 * r4 -> r5; r5 -> r6; jump`
fn chain(m: &MachineDesc, live_out: &[u16]) -> (DataDependenceGraph, MoveId, MoveId) {
    let mut b = DdgBuilder::new(m);
    let add = b.operation("add");
    b.operand(add, 0, r(1));
    b.trigger(add, 1, r(2));
    let sum = b.result(add, 2, r(3));
    let mul = b.operation("mul");
    let factor = b.operand(mul, 0, r(3));
    b.trigger(mul, 1, r(4));
    b.result(mul, 2, r(5));
    b.transport(r(5), r(6));
    let jump = b.operation("jump");
    b.trigger(jump, 0, Terminal::Immediate(16));
    for &reg in live_out {
        b.live_out(Reg::new(RfId::new(0), reg));
    }
    if live_out.is_empty() {
        b.nothing_live_out();
    }
    (b.build().unwrap(), sum, factor)
}

#[test]
fn checker_accepts_both_directions() {
    let m = machine(2);
    for direction in [Direction::TopDown, Direction::BottomUp] {
        let (mut ddg, _, _) = chain(&m, &[6]);
        let schedule = run(&mut ddg, &m, &options(direction)).unwrap();
        if let Err(errors) = check_schedule(&ddg, &m) {
            panic!("{:?}: {:?}\n{}", direction, errors, schedule);
        }
        assert_eq!(schedule.move_count(), ddg.node_count());
        // The jump ends the block.
        let last = schedule.instructions.last().unwrap();
        assert!(last.moves.iter().any(|mv| ddg.node(mv.node).control_flow));
    }
}

#[test]
fn bypass_removes_dead_result() {
    let m = machine(3);
    let (mut ddg, sum, factor) = chain(&m, &[6]);
    let schedule = run(&mut ddg, &m, &options(Direction::TopDown)).unwrap();

    assert_eq!(ddg.node(factor).src, Terminal::FuOutput { operand: 2 });
    assert!(!ddg.node(sum).is_live());
    assert_eq!(schedule.stats.bypasses, 1);
    assert_eq!(schedule.stats.dead_results_removed, 1);
    assert!(schedule.cycle_of(sum).is_none());
    assert!(check_schedule(&ddg, &m).is_ok());
}

#[test]
fn live_out_result_survives_bypass() {
    let m = machine(3);
    let (mut ddg, sum, factor) = chain(&m, &[3, 6]);
    let schedule = run(&mut ddg, &m, &options(Direction::TopDown)).unwrap();

    assert_eq!(ddg.node(factor).src, Terminal::FuOutput { operand: 2 });
    assert!(ddg.node(sum).is_live());
    assert_eq!(schedule.stats.dead_results_removed, 0);
    assert!(check_schedule(&ddg, &m).is_ok());
}

#[test]
fn no_bypass_when_disabled() {
    let m = machine(3);
    let (mut ddg, sum, factor) = chain(&m, &[6]);
    let opts = SchedulerOptions {
        bypass_distance: 0,
        ..options(Direction::TopDown)
    };
    let schedule = run(&mut ddg, &m, &opts).unwrap();
    assert_eq!(ddg.node(factor).src, r(3));
    assert!(ddg.node(sum).is_live());
    assert_eq!(schedule.stats.bypasses, 0);
    assert!(cycle(&ddg, sum) < cycle(&ddg, factor));
}

#[test]
fn renaming_removes_anti_dependence() {
    let m = machine(2);
    let mut b = DdgBuilder::new(&m);
    // r1 is read late by the add and then reloaded.
    let slow = b.operation("mul");
    b.operand(slow, 0, r(8));
    b.trigger(slow, 1, r(9));
    b.result(slow, 2, r(10));
    let add = b.operation("add");
    b.operand(add, 0, r(10));
    b.trigger(add, 1, r(1));
    b.result(add, 2, r(11));
    let reload = b.transport(Terminal::Immediate(5), r(1));
    b.transport(r(1), r(12));
    for reg in [11, 12] {
        b.live_out(Reg::new(RfId::new(0), reg));
    }
    let mut ddg = b.build().unwrap();
    let reference = {
        let mut plain = ddg.clone();
        let opts = SchedulerOptions {
            rename_registers: false,
            ..options(Direction::TopDown)
        };
        run(&mut plain, &m, &opts).unwrap();
        cycle(&plain, reload)
    };

    let mut cache = RegisterFileCache::new();
    let mut renamer = RegisterRenamer::new(&m, &mut cache, &ddg);
    let mut rm = SimpleResourceManager::new(&m);
    let schedule = schedule_block(
        &mut ddg,
        &m,
        &mut rm,
        Some(&mut renamer),
        &options(Direction::TopDown),
    )
    .unwrap();

    assert_eq!(schedule.stats.renames, 1);
    assert_ne!(ddg.node(reload).dst, r(1));
    assert!(cycle(&ddg, reload) < reference);
    assert!(check_schedule(&ddg, &m).is_ok());
}

#[test]
fn unconnected_move_is_unschedulable() {
    let mut b = MachineBuilder::new("broken");
    let rf = b.register_file("r", 4, 1, 1);
    // A bus that only reaches the write port.
    b.bus("b0", 8, alloc::vec![crate::machine::Port::RfWrite(rf)]);
    let m = b.finish();
    let mut builder = DdgBuilder::new(&m);
    let n = builder.transport(r(1), r(2));
    let mut ddg = builder.build().unwrap();
    assert_eq!(
        run(&mut ddg, &m, &options(Direction::TopDown)).unwrap_err(),
        SchedError::Unschedulable(n)
    );
    assert_eq!(
        run(&mut ddg, &m, &options(Direction::BottomUp)).unwrap_err(),
        SchedError::Unschedulable(n)
    );
}

#[test]
fn schedule_is_normalized_and_ordered_by_bus() {
    let m = machine(2);
    let mut b = DdgBuilder::new(&m);
    let x = b.transport(r(1), r(2));
    let y = b.transport(r(3), r(4));
    let mut ddg = b.build().unwrap();
    let schedule = run(&mut ddg, &m, &options(Direction::BottomUp)).unwrap();
    assert_eq!(schedule.len(), 1);
    let buses: Vec<usize> = schedule.instructions[0]
        .moves
        .iter()
        .map(|mv| mv.bus.index())
        .collect();
    assert_eq!(buses, [0, 1]);
    assert!(schedule.cycle_of(x) == Some(0) && schedule.cycle_of(y) == Some(0));
}

#[test]
fn operand_windows_on_one_unit_do_not_overlap() {
    let m = machine(3);
    for direction in [Direction::TopDown, Direction::BottomUp] {
        let mut b = DdgBuilder::new(&m);
        let mul = b.operation("mul");
        b.operand(mul, 0, r(1));
        b.trigger(mul, 1, r(2));
        b.result(mul, 2, r(3));
        // Its operand is ready long before its trigger.
        let late = b.operation("add");
        let late_in = b.operand(late, 0, r(4));
        let late_trigger = b.trigger(late, 1, r(3));
        b.result(late, 2, r(5));
        let early = b.operation("add");
        let early_in = b.operand(early, 0, r(6));
        let early_trigger = b.trigger(early, 1, r(7));
        b.result(early, 2, r(8));
        let mut ddg = b.build().unwrap();
        let opts = SchedulerOptions {
            bypass_distance: 0,
            ..options(direction)
        };
        let schedule = run(&mut ddg, &m, &opts).unwrap();

        let late_window = (cycle(&ddg, late_in), cycle(&ddg, late_trigger));
        let early_window = (cycle(&ddg, early_in), cycle(&ddg, early_trigger));
        assert!(
            late_window.1 < early_window.0 || early_window.1 < late_window.0,
            "{:?}: {:?} overlaps {:?}\n{}",
            direction,
            late_window,
            early_window,
            schedule
        );
        if let Err(errors) = check_schedule(&ddg, &m) {
            panic!("{:?}: {:?}\n{}", direction, errors, schedule);
        }
    }
}

fn forced_machine() -> MachineDesc {
    let mut b = MachineBuilder::new("forced-test");
    b.register_file("r", 16, 2, 2);
    let bp = b.register_file("bp", 2, 1, 1);
    b.forced_bypass_register_file(bp);
    b.function_unit("alu", &[("add", 1, 2, 1)]);
    b.function_unit("mul", &[("mul", 3, 2, 1)]);
    b.fully_connected_buses(3, 8);
    b.finish()
}

fn bp(i: u16) -> Terminal {
    Terminal::Register(Reg::new(RfId::new(1), i))
}

/// `r1 + r2 -> bp0; bp0 * r3 -> r4`
fn forced_chain(m: &MachineDesc) -> (DataDependenceGraph, MoveId, MoveId) {
    let mut b = DdgBuilder::new(m);
    let add = b.operation("add");
    b.operand(add, 0, r(1));
    b.trigger(add, 1, r(2));
    let produced = b.result(add, 2, bp(0));
    let mul = b.operation("mul");
    let consumer = b.operand(mul, 0, bp(0));
    b.trigger(mul, 1, r(3));
    b.result(mul, 2, r(4));
    b.live_out(Reg::new(RfId::new(0), 4));
    (b.build().unwrap(), produced, consumer)
}

#[test]
fn forced_bypass_register_file_is_never_used() {
    let m = forced_machine();
    for direction in [Direction::TopDown, Direction::BottomUp] {
        let (mut ddg, produced, consumer) = forced_chain(&m);
        // Forced-bypass writes go even when other dead results stay.
        let opts = SchedulerOptions {
            kill_dead_results: false,
            ..options(direction)
        };
        let schedule = run(&mut ddg, &m, &opts).unwrap();

        assert!(!ddg.node(produced).is_live(), "{:?}\n{}", direction, schedule);
        assert_eq!(ddg.node(consumer).src, Terminal::FuOutput { operand: 2 });
        assert_eq!(schedule.stats.bypasses, 1);
        assert_eq!(schedule.stats.dead_results_removed, 1);
        let touches_bp = |t: Terminal| t.reg().map_or(false, |reg| reg.rf == RfId::new(1));
        for inst in &schedule.instructions {
            for mv in &inst.moves {
                assert!(!touches_bp(mv.src) && !touches_bp(mv.dst), "{:?}\n{}", direction, schedule);
            }
        }
        if let Err(errors) = check_schedule(&ddg, &m) {
            panic!("{:?}: {:?}\n{}", direction, errors, schedule);
        }
    }
}

#[test]
fn forced_bypass_needs_bypassing() {
    let m = forced_machine();
    for direction in [Direction::TopDown, Direction::BottomUp] {
        let (mut ddg, _, consumer) = forced_chain(&m);
        let opts = SchedulerOptions {
            bypass_distance: 0,
            ..options(direction)
        };
        assert_eq!(
            run(&mut ddg, &m, &opts).unwrap_err(),
            SchedError::Unschedulable(consumer),
            "{:?}",
            direction
        );
    }
}

#[test]
fn forced_bypass_without_producer_is_unschedulable() {
    let m = forced_machine();
    for direction in [Direction::TopDown, Direction::BottomUp] {
        let mut b = DdgBuilder::new(&m);
        let mul = b.operation("mul");
        let orphan = b.operand(mul, 0, bp(1));
        b.trigger(mul, 1, r(3));
        b.result(mul, 2, r(4));
        let mut ddg = b.build().unwrap();
        assert_eq!(
            run(&mut ddg, &m, &options(direction)).unwrap_err(),
            SchedError::Unschedulable(orphan),
            "{:?}",
            direction
        );
    }
}

#[test]
fn bottom_up_bypasses_before_placement() {
    let m = machine(3);
    let (mut ddg, sum, factor) = chain(&m, &[6]);
    let schedule = run(&mut ddg, &m, &options(Direction::BottomUp)).unwrap();

    assert_eq!(ddg.node(factor).src, Terminal::FuOutput { operand: 2 });
    assert!(!ddg.node(sum).is_live());
    assert_eq!(schedule.stats.bypasses, 1);
    assert_eq!(schedule.stats.dead_results_removed, 1);
    if let Err(errors) = check_schedule(&ddg, &m) {
        panic!("{:?}\n{}", errors, schedule);
    }
}
