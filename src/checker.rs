/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Checker: verifies a finished schedule against the dependence graph
//! and the machine.
//!
//! The checker does not trust the resource manager. It looks only at the
//! placements recorded in the graph and re-derives every constraint:
//!
//!   - every live move is placed;
//!   - every live edge that is not loop carried is honoured with at
//!     least its latency;
//!   - no two moves share a bus in the same cycle;
//!   - each bus used actually connects the move's source and
//!     destination, and inline immediates fit the bus;
//!   - all moves of an operation go through the single function unit
//!     the operation is bound to, which must implement it;
//!   - a unit is triggered at most once per cycle, an operand stays in
//!     its input until the trigger, and a result is not replaced by a
//!     later operation on the unit before it is read.

use crate::ddg::{DataDependenceGraph, EdgeId, MoveId, OpId};
use crate::machine::{immediate_bits, Machine, Port};
use crate::{BusId, Cycle, FuId, FxHashMap, Terminal};
use alloc::vec::Vec;

/// A set of errors detected by the schedule checker.
#[derive(Clone, Debug)]
pub struct CheckerErrors {
    errors: Vec<CheckerError>,
}

impl CheckerErrors {
    pub fn errors(&self) -> &[CheckerError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A single error detected by the schedule checker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckerError {
    Unscheduled {
        node: MoveId,
    },
    LatencyViolated {
        edge: EdgeId,
        tail_cycle: Cycle,
        head_cycle: Cycle,
        latency: i32,
    },
    BusConflict {
        cycle: Cycle,
        bus: BusId,
        first: MoveId,
        second: MoveId,
    },
    NotConnected {
        node: MoveId,
        bus: BusId,
    },
    ImmediateTooWide {
        node: MoveId,
        bus: BusId,
    },
    UnboundOperation {
        op: OpId,
    },
    UnitCannotExecute {
        op: OpId,
        fu: FuId,
    },
    TriggerConflict {
        cycle: Cycle,
        fu: FuId,
        first: OpId,
        second: OpId,
    },
    /// `by` writes the same input of `fu` between the operand write of
    /// `op` and its trigger.
    OperandOverwritten {
        op: OpId,
        fu: FuId,
        operand: u8,
        by: MoveId,
    },
    /// The result of `by` reaches the output of the unit before `read`
    /// has taken the result of `op`.
    ResultOverwritten {
        op: OpId,
        by: OpId,
        read: MoveId,
    },
}

/// Check the placements in `ddg`.
pub fn check_schedule<M: Machine + ?Sized>(
    ddg: &DataDependenceGraph,
    machine: &M,
) -> Result<(), CheckerErrors> {
    let mut errors = Vec::new();

    let mut buses: FxHashMap<(Cycle, BusId), MoveId> = FxHashMap::default();
    for n in ddg.node_ids() {
        let Some(p) = ddg.node(n).placement else {
            errors.push(CheckerError::Unscheduled { node: n });
            continue;
        };
        if let Some(&first) = buses.get(&(p.cycle, p.bus)) {
            errors.push(CheckerError::BusConflict {
                cycle: p.cycle,
                bus: p.bus,
                first,
                second: n,
            });
        } else {
            buses.insert((p.cycle, p.bus), n);
        }
        check_connectivity(ddg, machine, n, p.bus, &mut errors);
    }

    for e in ddg.edge_ids() {
        let entry = ddg.edge_entry(e);
        if !entry.live || entry.edge.is_back_edge() {
            continue;
        }
        let (Some(tail), Some(head)) = (
            ddg.node(entry.tail).placement,
            ddg.node(entry.head).placement,
        ) else {
            continue;
        };
        let latency = ddg.edge_latency(e);
        if head.cycle < tail.cycle + latency {
            errors.push(CheckerError::LatencyViolated {
                edge: e,
                tail_cycle: tail.cycle,
                head_cycle: head.cycle,
                latency,
            });
        }
    }

    for op in ddg.op_ids() {
        let placed = ddg.op_nodes(op).any(|n| ddg.node(n).is_scheduled());
        if !placed {
            continue;
        }
        match ddg.op(op).fu {
            None => errors.push(CheckerError::UnboundOperation { op }),
            Some(fu) => {
                if machine.operation(fu, &ddg.op(op).opcode).is_none() {
                    errors.push(CheckerError::UnitCannotExecute { op, fu });
                }
            }
        }
    }

    check_units(ddg, &mut errors);

    trace!("checker: {} error(s)", errors.len());
    if errors.is_empty() {
        Ok(())
    } else {
        Err(CheckerErrors { errors })
    }
}

fn check_connectivity<M: Machine + ?Sized>(
    ddg: &DataDependenceGraph,
    machine: &M,
    n: MoveId,
    bus: BusId,
    errors: &mut Vec<CheckerError>,
) {
    let node = ddg.node(n);
    let unit = |op: Option<OpId>| op.and_then(|op| ddg.op(op).fu);
    let dst = match node.dst {
        Terminal::Register(r) => Some(Port::RfWrite(r.rf)),
        Terminal::FuInput { operand, .. } => unit(node.dst_op).map(|fu| Port::FuIn { fu, operand }),
        Terminal::ReturnAddress => Some(Port::RaWrite),
        Terminal::Immediate(_) | Terminal::FuOutput { .. } => None,
    };
    let src = match node.src {
        Terminal::Register(r) => Some(Port::RfRead(r.rf)),
        Terminal::FuOutput { operand } => unit(node.src_op).map(|fu| Port::FuOut { fu, operand }),
        Terminal::ReturnAddress => Some(Port::RaRead),
        Terminal::Immediate(_) | Terminal::FuInput { .. } => None,
    };
    // Unbound operations are reported per operation.
    let connected = dst.map_or(true, |d| machine.bus_connects(bus, d))
        && src.map_or(true, |s| machine.bus_connects(bus, s));
    if !connected {
        errors.push(CheckerError::NotConnected { node: n, bus });
    }
    if let Terminal::Immediate(v) = node.src {
        // A long immediate may ride on any bus; only an inline one must
        // fit the bus field, and which one was used is not recorded. A
        // machine without long-immediate slots has only inline ones.
        if machine.long_immediate_slots() == 0
            && machine.buses()[bus.index()].short_imm_bits < immediate_bits(v)
        {
            errors.push(CheckerError::ImmediateTooWide { node: n, bus });
        }
    }
}

fn check_units(ddg: &DataDependenceGraph, errors: &mut Vec<CheckerError>) {
    let mut started: Vec<(FuId, Cycle, OpId)> = ddg
        .op_ids()
        .filter_map(|op| {
            let fu = ddg.op(op).fu?;
            let t = ddg.node(ddg.trigger(op)?).placement?.cycle;
            Some((fu, t, op))
        })
        .collect();
    started.sort_unstable();

    for pair in started.windows(2) {
        let ((fu, cycle, first), (fu2, cycle2, second)) = (pair[0], pair[1]);
        if fu == fu2 && cycle == cycle2 {
            errors.push(CheckerError::TriggerConflict {
                cycle,
                fu,
                first,
                second,
            });
        }
    }

    let operand_writes = |op: OpId| {
        ddg.op(op).inputs.iter().filter_map(move |&n| {
            let node = ddg.node(n);
            match (node.dst, node.placement) {
                (Terminal::FuInput { operand, .. }, Some(p)) => Some((n, operand, p.cycle)),
                _ => None,
            }
        })
    };

    for &(fu, t, op) in &started {
        let others = started
            .iter()
            .filter(|&&(ofu, _, other)| ofu == fu && other != op);

        for (_, operand, write) in operand_writes(op) {
            for &(_, _, other) in others.clone() {
                for (by, _, at) in operand_writes(other).filter(|&(_, o, _)| o == operand) {
                    if at > write && at <= t {
                        errors.push(CheckerError::OperandOverwritten { op, fu, operand, by });
                    }
                }
            }
        }

        for &read in &ddg.op(op).outputs {
            let Some(p) = ddg.node(read).placement else {
                continue;
            };
            for &(_, ot, other) in others.clone() {
                if ot > t && ot + ddg.op(other).latency as Cycle <= p.cycle {
                    errors.push(CheckerError::ResultOverwritten { op, by: other, read });
                }
            }
        }
    }
}
