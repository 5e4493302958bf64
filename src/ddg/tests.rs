/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

use super::*;
use crate::machine::MachineBuilder;
use crate::{BlockId, BusId, Guard, MachineDesc, Reg, RfId, SchedError, Terminal};

fn machine() -> MachineDesc {
    let mut b = MachineBuilder::new("ddg-test");
    b.register_file("r", 16, 2, 2);
    b.register_file("bool", 2, 1, 1);
    b.function_unit("alu", &[("add", 1, 2, 1), ("mul", 3, 2, 1)]);
    b.control_unit("gcu", &[("jump", 1, 1, 0)]);
    b.fully_connected_buses(3, 8);
    b.finish()
}

fn reg(i: u16) -> Reg {
    Reg::new(RfId::new(0), i)
}

fn r(i: u16) -> Terminal {
    Terminal::Register(reg(i))
}

fn b0() -> Reg {
    Reg::new(RfId::new(1), 0)
}

fn place(ddg: &mut DataDependenceGraph, n: MoveId, cycle: i32) {
    ddg.set_placement(
        n,
        Some(crate::Placement {
            cycle,
            bus: BusId::new(0),
        }),
    );
}

fn only_edge(ddg: &DataDependenceGraph, a: MoveId, b: MoveId) -> DepEdge {
    let edges = ddg.connecting_edges(a, b);
    assert_eq!(edges.len(), 1, "{} -> {}: {:?}", a, b, edges);
    *ddg.edge(edges[0])
}

#[test]
fn register_dependences() {
    let m = machine();
    let mut b = DdgBuilder::new(&m);
    let a = b.transport(r(1), r(2));
    let c = b.transport(r(2), r(3));
    let d = b.transport(Terminal::Immediate(5), r(2));
    let ddg = b.build().unwrap();

    let raw = only_edge(&ddg, a, c);
    assert!(raw.is_register(DepType::Raw, reg(2)));
    let war = only_edge(&ddg, c, d);
    assert!(war.is_register(DepType::War, reg(2)));
    let waw = only_edge(&ddg, a, d);
    assert!(waw.is_register(DepType::Waw, reg(2)));

    assert_eq!(ddg.edge_latency(ddg.connecting_edges(a, c)[0]), 1);
    assert_eq!(ddg.edge_latency(ddg.connecting_edges(c, d)[0]), 0);
    assert_eq!(ddg.edge_latency(ddg.connecting_edges(a, d)[0]), 1);
    assert_eq!(ddg.source_nodes(), [a]);
    assert_eq!(ddg.sink_nodes(), [d]);
    assert!(ddg.has_path(a, d));
    assert!(!ddg.has_path(d, a));
    assert_eq!(ddg.only_register_raw_source(c), Some(a));
}

#[test]
fn operation_edges() {
    let m = machine();
    let mut b = DdgBuilder::new(&m);
    let op = b.operation("mul");
    let o = b.operand(op, 0, r(1));
    let t = b.trigger(op, 1, r(2));
    let res = b.result(op, 2, r(3));
    let ddg = b.build().unwrap();

    let e = ddg.connecting_edges(o, t)[0];
    assert_eq!(ddg.edge(e).reason, EdgeReason::Operation);
    assert_eq!(ddg.edge_latency(e), 0);
    let e = ddg.connecting_edges(t, res)[0];
    assert_eq!(ddg.edge_latency(e), 3);
    assert!(ddg.same_operation(o, res));
    assert_eq!(ddg.max_sink_distance(o), 4);
    assert_eq!(ddg.max_source_distance(res), 4);
    let opid = ddg.node(o).dst_op.unwrap();
    assert_eq!(ddg.trigger(opid), Some(t));
    assert_eq!(ddg.op(opid).latency, 3);
}

#[test]
fn guard_latency_edges() {
    let m = machine();
    let mut b = DdgBuilder::new(&m);
    let def = b.transport(Terminal::Immediate(1), Terminal::Register(b0()));
    let use_ = b.transport(Terminal::Immediate(2), r(1));
    b.guard(use_, Guard { reg: b0(), inverted: false });
    let kill = b.transport(Terminal::Immediate(0), Terminal::Register(b0()));
    let ddg = b.build().unwrap();

    let raw = ddg.connecting_edges(def, use_)[0];
    assert!(ddg.edge(raw).guard_use);
    // Global guard latency 1 plus nothing from the register file.
    assert_eq!(ddg.edge_latency(raw), 1);
    let war = ddg.connecting_edges(use_, kill)[0];
    assert!(ddg.edge(war).guard_use);
    assert_eq!(ddg.edge_latency(war), 0);
}

#[test]
fn invalid_programs_are_rejected() {
    let m = machine();
    let mut b = DdgBuilder::new(&m);
    let n = b.add_move(BlockMove {
        src: r(1),
        dst: Terminal::FuInput {
            operand: 0,
            trigger: true,
        },
        guard: None,
        dst_op: None,
        src_op: None,
        block: BlockId::new(0),
    });
    assert_eq!(
        b.build().err(),
        Some(SchedError::InvalidProgram("operand move without operation", n))
    );

    let mut b = DdgBuilder::new(&m);
    let op = b.operation("add");
    b.operand(op, 0, r(1));
    b.operand(op, 1, r(2));
    assert!(matches!(b.build(), Err(SchedError::InvalidProgram(_, _))));

    let mut b = DdgBuilder::new(&m);
    let op = b.operation("frobnicate");
    b.trigger(op, 0, r(1));
    assert!(matches!(b.build(), Err(SchedError::InvalidProgram(_, _))));
}

#[test]
fn control_flow_marked() {
    let m = machine();
    let mut b = DdgBuilder::new(&m);
    let copy = b.transport(r(1), r(2));
    let op = b.operation("jump");
    let jump = b.trigger(op, 0, Terminal::Immediate(0));
    let mut ddg = b.build().unwrap();

    assert!(ddg.node(jump).control_flow);
    assert!(!ddg.predecessors_ready(jump));
    assert!(ddg.successors_ready(jump));
    assert!(ddg.predecessors_ready(copy));
    place(&mut ddg, copy, 0);
    assert!(ddg.predecessors_ready(jump));
}

#[test]
fn readiness_and_timing() {
    let m = machine();
    let mut b = DdgBuilder::new(&m);
    let op = b.operation("add");
    let o = b.operand(op, 0, r(1));
    let t = b.trigger(op, 1, r(2));
    let res = b.result(op, 2, r(3));
    let copy = b.transport(r(3), r(4));
    let kill = b.transport(Terminal::Immediate(7), r(3));
    let mut ddg = b.build().unwrap();

    // Siblings of one operation do not hold each other back.
    assert!(ddg.predecessors_ready(o));
    assert!(ddg.predecessors_ready(t));
    assert!(ddg.predecessors_ready(res));
    assert!(!ddg.predecessors_ready(copy));
    assert!(ddg.successors_ready(kill));
    assert!(!ddg.successors_ready(copy));
    assert!(ddg.other_successors_scheduled(copy, &[kill]));

    place(&mut ddg, o, 0);
    place(&mut ddg, t, 1);
    assert_eq!(ddg.earliest_cycle(res), 2);
    place(&mut ddg, res, 2);
    assert!(ddg.predecessors_ready(copy));
    assert_eq!(ddg.earliest_cycle(copy), 3);
    place(&mut ddg, copy, 4);
    // WAW from res and WAR from copy.
    assert_eq!(ddg.earliest_cycle(kill), 4);
    assert_eq!(ddg.earliest_cycle_ignoring_antideps(kill), 0);

    ddg.set_placement(res, None);
    assert_eq!(ddg.latest_cycle(res), Some(3));
    assert_eq!(ddg.latest_cycle_ignoring_antideps(res), Some(3));
    assert_eq!(ddg.latest_cycle(kill), None);
}

#[test]
fn merge_unmerge_round_trip() {
    let m = machine();
    let mut b = DdgBuilder::new(&m);
    b.nothing_live_out();
    let op1 = b.operation("add");
    b.operand(op1, 0, r(1));
    let t1 = b.trigger(op1, 1, r(2));
    let res = b.result(op1, 2, r(5));
    let op2 = b.operation("add");
    let consumer = b.operand(op2, 0, r(5));
    let t2 = b.trigger(op2, 1, r(6));
    b.result(op2, 2, r(7));
    let kill = b.transport(Terminal::Immediate(1), r(5));
    let mut ddg = b.build().unwrap();

    let before = ddg.edge_snapshot();
    let old_src = ddg.node(consumer).src;
    let op1_id = ddg.node(res).src_op.unwrap();

    let undo = ddg.merge_and_keep(res, consumer, false).unwrap();
    assert_eq!(ddg.node(consumer).src, Terminal::FuOutput { operand: 2 });
    assert_eq!(ddg.node(consumer).src_op, Some(op1_id));
    assert!(ddg.op(op1_id).outputs.contains(&consumer));
    assert!(ddg.connecting_edges(res, consumer).is_empty());
    // The consumer inherits the trigger -> result ordering.
    let e = ddg.connecting_edges(t1, consumer)[0];
    assert_eq!(ddg.edge_latency(e), 1);
    // It no longer reads r5, so the antidependence on the kill is gone.
    assert!(ddg.connecting_edges(consumer, kill).is_empty());
    assert!(ddg.same_operation(consumer, t2));

    ddg.un_merge(undo);
    assert_eq!(ddg.edge_snapshot(), before);
    assert_eq!(ddg.node(consumer).src, old_src);
    assert_eq!(ddg.node(consumer).src_op, None);
    assert_eq!(ddg.op(op1_id).outputs.as_slice(), &[res]);
}

#[test]
fn copy_with_two_producers_fails_fast() {
    let m = machine();
    let mut b = DdgBuilder::new(&m);
    let p1 = b.transport(Terminal::Immediate(1), r(1));
    b.guard(p1, Guard { reg: b0(), inverted: false });
    let p2 = b.transport(Terminal::Immediate(2), r(1));
    b.guard(p2, Guard { reg: b0(), inverted: true });
    let copy = b.transport(r(1), r(2));
    let consumer = b.transport(r(2), r(3));
    let mut ddg = b.build().unwrap();

    assert_eq!(ddg.connecting_edges(p1, copy).len(), 1);
    assert_eq!(ddg.connecting_edges(p2, copy).len(), 1);
    let before = ddg.edge_snapshot();
    assert!(!ddg.can_merge(copy, consumer, false));
    assert!(ddg.merge_and_keep(copy, consumer, false).is_none());
    assert!(ddg.merge_and_keep(copy, consumer, true).is_none());
    assert_eq!(ddg.edge_snapshot(), before);
    assert_eq!(ddg.node(consumer).src, r(2));
}

#[test]
fn no_double_loop_bypass() {
    let m = machine();
    let mut b = DdgBuilder::new(&m);
    b.loop_body(true);
    let dest = b.transport(r(2), r(4));
    let source = b.transport(r(1), r(2));
    let def = b.transport(Terminal::Immediate(1), r(1));
    let mut ddg = b.build().unwrap();

    let carried = only_edge(&ddg, source, dest);
    assert!(carried.is_register_raw() && carried.is_back_edge());
    let feeding = only_edge(&ddg, def, source);
    assert!(feeding.is_register_raw() && feeding.is_back_edge());
    assert!(ddg.is_loop_bypass(source, dest));

    let before = ddg.edge_snapshot();
    assert!(!ddg.can_merge(source, dest, false));
    assert!(!ddg.can_merge(source, dest, true));
    assert!(ddg.merge_and_keep(source, dest, true).is_none());
    assert_eq!(ddg.edge_snapshot(), before);
    // Loop-carried edges never count for readiness.
    assert!(ddg.predecessors_ready(dest));
}

#[test]
fn subgraph_keeps_boundary() {
    let m = machine();
    let mut b = DdgBuilder::new(&m);
    let a = b.transport(Terminal::Immediate(1), r(1));
    b.block(BlockId::new(1));
    let c = b.transport(r(1), r(2));
    let d = b.transport(r(2), r(3));
    let ddg = b.build().unwrap();

    let sub = ddg.create_subgraph(BlockId::new(1));
    assert_eq!(sub.node_count(), 2);
    let local_c = MoveId::new(0);
    let local_d = MoveId::new(1);
    assert_eq!(sub.parent_id(local_c), c);
    assert_eq!(sub.parent_id(local_d), d);
    assert!(only_edge(&sub, local_c, local_d).is_register(DepType::Raw, reg(2)));

    let boundary = sub.boundary_edges();
    assert_eq!(boundary.len(), 1);
    assert_eq!(boundary[0].local, local_c);
    assert_eq!(boundary[0].remote, a);
    assert!(boundary[0].incoming);
    assert!(boundary[0].edge.is_register(DepType::Raw, reg(1)));

    // The parent is untouched.
    assert_eq!(ddg.node_count(), 3);
    assert_eq!(ddg.connecting_edges(a, c).len(), 1);
}

#[test]
fn live_ranges() {
    let m = machine();
    let mut b = DdgBuilder::new(&m);
    let def = b.transport(Terminal::Immediate(1), Terminal::Register(b0()));
    let read = b.transport(Terminal::Register(b0()), r(2));
    let guarded = b.transport(Terminal::Immediate(3), r(3));
    b.guard(guarded, Guard { reg: b0(), inverted: false });
    let other = b.transport(Terminal::Immediate(0), Terminal::Register(b0()));
    let ddg = b.build().unwrap();

    let lr = ddg.find_live_range(def, true, false);
    assert_eq!(lr.writes.iter().copied().collect::<Vec<_>>(), [def]);
    assert_eq!(lr.reads.iter().copied().collect::<Vec<_>>(), [read]);
    assert_eq!(lr.guards.iter().copied().collect::<Vec<_>>(), [guarded]);
    assert!(!lr.contains(other));
    assert_eq!(ddg.find_live_range(read, false, false), lr);
    assert_eq!(ddg.find_live_range(guarded, false, true), lr);
    assert!(ddg.find_live_range(other, true, false).reads.is_empty());

    assert_eq!(ddg.register_span(reg(9)), RegisterSpan::Unused);
    assert_eq!(ddg.register_span(b0()), RegisterSpan::Unscheduled);
}

#[test]
fn loop_carried_range_is_not_renamable() {
    let m = machine();
    let mut b = DdgBuilder::new(&m);
    b.loop_body(true);
    let read = b.transport(r(1), r(2));
    let def = b.transport(Terminal::Immediate(1), r(1));
    let ddg = b.build().unwrap();
    assert!(ddg.find_live_range(def, true, false).is_empty());
    assert!(ddg.find_live_range(read, false, false).is_empty());
}

#[test]
fn register_queries() {
    let m = machine();
    let mut b = DdgBuilder::new(&m);
    let w1 = b.transport(Terminal::Immediate(1), r(1));
    let rd = b.transport(r(1), r(2));
    let w2 = b.transport(Terminal::Immediate(2), r(1));
    let rd2 = b.transport(r(1), r(3));
    let mut ddg = b.build().unwrap();
    place(&mut ddg, w1, 0);
    place(&mut ddg, rd, 1);
    place(&mut ddg, w2, 2);
    place(&mut ddg, rd2, 3);

    assert_eq!(ddg.register_span(reg(1)), RegisterSpan::Span { first: 0, last: 3 });
    assert_eq!(ddg.last_scheduled_register_kill(reg(1)), Some(w2));
    assert_eq!(ddg.first_scheduled_register_kill(reg(1)), Some(w1));
    assert_eq!(ddg.last_scheduled_register_reads(reg(1)).as_slice(), &[rd2]);
    assert_eq!(ddg.last_scheduled_register_writes(reg(1)).as_slice(), &[w2]);
    assert_eq!(ddg.first_scheduled_register_writes(reg(1)).as_slice(), &[w1]);
    assert!(ddg.used_registers().contains(&reg(3)));
}

#[test]
fn dead_result_removal_round_trip() {
    let m = machine();
    let mut b = DdgBuilder::new(&m);
    b.nothing_live_out();
    let op1 = b.operation("add");
    b.operand(op1, 0, r(1));
    b.trigger(op1, 1, r(2));
    let res = b.result(op1, 2, r(5));
    let op2 = b.operation("add");
    let consumer = b.operand(op2, 0, r(5));
    b.trigger(op2, 1, r(6));
    let keep = b.result(op2, 2, r(7));
    let mut ddg = b.build().unwrap();

    assert!(ddg.result_used(res));
    // With nothing live out, the last result is dead.
    assert!(!ddg.result_used(keep));
    ddg.merge_and_keep(res, consumer, false).unwrap();
    assert!(!ddg.result_used(res));

    let before = ddg.edge_snapshot();
    let op1_id = ddg.node(res).src_op.unwrap();
    let outputs = ddg.op(op1_id).outputs.clone();
    let removed = ddg.remove_node(res);
    assert!(!ddg.node(res).is_live());
    assert!(!ddg.node_ids().any(|n| n == res));
    assert!(!ddg.op(op1_id).outputs.contains(&res));
    ddg.restore_node(removed);
    assert_eq!(ddg.edge_snapshot(), before);
    assert_eq!(ddg.op(op1_id).outputs, outputs);
}

#[test]
fn rename_edge_repair_undo() {
    let m = machine();
    let mut b = DdgBuilder::new(&m);
    let def = b.transport(Terminal::Immediate(1), r(1));
    let read = b.transport(r(1), r(2));
    let kill = b.transport(Terminal::Immediate(2), r(1));
    let mut ddg = b.build().unwrap();
    let before = ddg.edge_snapshot();

    ddg.node_mut(def).dst = r(7);
    ddg.node_mut(read).src = r(7);
    let u1 = ddg.dest_renamed(def);
    let u2 = ddg.source_renamed(read);
    assert!(ddg.connecting_edges(def, kill).is_empty());
    assert!(ddg.connecting_edges(read, kill).is_empty());
    assert!(only_edge(&ddg, def, read).is_register(DepType::Raw, reg(7)));

    ddg.undo(u2);
    ddg.undo(u1);
    ddg.node_mut(def).dst = r(1);
    ddg.node_mut(read).src = r(1);
    assert_eq!(ddg.edge_snapshot(), before);
}

#[test]
fn memory_dependences() {
    let mut mb = MachineBuilder::new("ddg-mem");
    mb.register_file("r", 16, 2, 2);
    mb.function_unit("lsu", &[("ld", 2, 1, 1), ("st", 1, 2, 0)]);
    mb.fully_connected_buses(2, 8);
    let m = mb.finish();
    let mut b = DdgBuilder::new(&m);
    let ld1 = b.memory_operation("ld", MemoryAccess::Load);
    let ld1_t = b.trigger(ld1, 0, r(1));
    b.result(ld1, 1, r(2));
    let st1 = b.memory_operation("st", MemoryAccess::Store);
    b.operand(st1, 0, r(3));
    let st1_t = b.trigger(st1, 1, r(4));
    let ld2 = b.memory_operation("ld", MemoryAccess::Load);
    let ld2_t = b.trigger(ld2, 0, r(5));
    b.result(ld2, 1, r(6));
    let st2 = b.memory_operation("st", MemoryAccess::Store);
    b.operand(st2, 0, r(7));
    let st2_t = b.trigger(st2, 1, r(8));
    let ddg = b.build().unwrap();

    let memory = |a: MoveId, c: MoveId, dep: DepType| {
        let edge = only_edge(&ddg, a, c);
        assert_eq!((edge.reason, edge.dep), (EdgeReason::Memory, dep), "{} -> {}", a, c);
        ddg.edge_latency(ddg.connecting_edges(a, c)[0])
    };
    assert_eq!(memory(ld1_t, st1_t, DepType::War), 0);
    assert_eq!(memory(st1_t, ld2_t, DepType::Raw), 1);
    assert_eq!(memory(st1_t, st2_t, DepType::Waw), 1);
    assert_eq!(memory(ld2_t, st2_t, DepType::War), 0);
    // Loads are not ordered among themselves, and the later store is
    // ordered after the first load through the first store.
    assert!(ddg.connecting_edges(ld1_t, ld2_t).is_empty());
    assert!(ddg.connecting_edges(ld1_t, st2_t).is_empty());
    assert!(ddg.has_path(ld1_t, st2_t));
}

#[test]
fn return_address_dependences() {
    let mut mb = MachineBuilder::new("ddg-ra");
    mb.register_file("r", 16, 2, 2);
    mb.control_unit("gcu", &[("call", 1, 1, 0)]);
    mb.fully_connected_buses(2, 8);
    let m = mb.finish();
    let mut b = DdgBuilder::new(&m);
    let save = b.transport(Terminal::ReturnAddress, r(1));
    let restore = b.transport(r(1), Terminal::ReturnAddress);
    let read = b.transport(Terminal::ReturnAddress, r(2));
    let call = b.operation("call");
    let call_t = b.trigger(call, 0, Terminal::Immediate(4));
    let ddg = b.build().unwrap();

    let ra_edges = |a: MoveId, c: MoveId| -> Vec<DepType> {
        ddg.connecting_edges(a, c)
            .into_iter()
            .map(|e| *ddg.edge(e))
            .filter(|edge| edge.reason == EdgeReason::ReturnAddress)
            .map(|edge| edge.dep)
            .collect()
    };
    assert_eq!(ra_edges(save, restore), [DepType::War]);
    assert_eq!(ra_edges(restore, read), [DepType::Raw]);
    assert!(ddg.node(call_t).call);
    // A call overwrites the return address.
    assert_eq!(ra_edges(read, call_t), [DepType::War]);
    assert_eq!(ra_edges(restore, call_t), [DepType::Waw]);
    assert!(ra_edges(save, call_t).is_empty());
}
