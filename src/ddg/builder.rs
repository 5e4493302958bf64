/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Construction of a dependence graph from an ordered list of moves.
//!
//! Dependences are derived by walking the moves in program order and
//! tracking, per register, the writes that may reach the current point
//! and the reads since the last killing write. For loop bodies a second
//! walk over the same moves continues from the state left by the first;
//! edges from first-walk state to second-walk moves become loop-carried.

use super::{DataDependenceGraph, DepEdge, DepType, EdgeData, EdgeReason, MemoryAccess, MoveId, MoveNode, OpId};
use crate::machine::Machine;
use crate::{BlockId, FxHashMap, FxHashSet, Guard, Reg, SchedError, Terminal};
use alloc::string::String;
use alloc::vec::Vec;
use smallvec::SmallVec;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// A move as handed over by the program loader.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct BlockMove {
    pub src: Terminal,
    pub dst: Terminal,
    pub guard: Option<Guard>,
    /// Index of the operation (in builder order) this move feeds.
    pub dst_op: Option<u32>,
    /// Index of the operation this move reads a result of.
    pub src_op: Option<u32>,
    pub block: BlockId,
}

#[derive(Clone, Debug)]
struct PendingOp {
    opcode: String,
    memory: Option<MemoryAccess>,
}

/// A tracked access: the move, and which walk recorded it.
type Access = (MoveId, u8);

#[derive(Default)]
struct RegState {
    /// The last killing write plus later conditional writes.
    defs: SmallVec<[Access; 2]>,
    /// Reads since the last killing write; `true` marks guard reads.
    reads: SmallVec<[(Access, bool); 4]>,
}

#[derive(Default)]
struct WalkState {
    regs: FxHashMap<Reg, RegState>,
    ra: RegState,
    stores: SmallVec<[Access; 2]>,
    loads: SmallVec<[Access; 4]>,
}

pub struct DdgBuilder<'m, M: Machine + ?Sized> {
    machine: &'m M,
    moves: Vec<BlockMove>,
    ops: Vec<PendingOp>,
    block: BlockId,
    live_in: FxHashSet<Reg>,
    live_out: Option<FxHashSet<Reg>>,
    loop_body: bool,
}

impl<'m, M: Machine + ?Sized> DdgBuilder<'m, M> {
    pub fn new(machine: &'m M) -> Self {
        DdgBuilder {
            machine,
            moves: Vec::new(),
            ops: Vec::new(),
            block: BlockId::new(0),
            live_in: FxHashSet::default(),
            live_out: None,
            loop_body: false,
        }
    }

    /// Subsequent moves belong to `block`.
    pub fn block(&mut self, block: BlockId) -> &mut Self {
        self.block = block;
        self
    }

    /// The moves form the body of a single-block loop.
    pub fn loop_body(&mut self, is_loop: bool) -> &mut Self {
        self.loop_body = is_loop;
        self
    }

    pub fn live_in(&mut self, reg: Reg) -> &mut Self {
        self.live_in.insert(reg);
        self
    }

    /// Declare `reg` live out. Once any register is declared, all others
    /// are considered dead at the end of the region.
    pub fn live_out(&mut self, reg: Reg) -> &mut Self {
        self.live_out.get_or_insert_with(FxHashSet::default).insert(reg);
        self
    }

    /// Declare that nothing is live out of the region.
    pub fn nothing_live_out(&mut self) -> &mut Self {
        self.live_out.get_or_insert_with(FxHashSet::default);
        self
    }

    pub fn operation(&mut self, opcode: &str) -> u32 {
        self.ops.push(PendingOp {
            opcode: opcode.into(),
            memory: None,
        });
        (self.ops.len() - 1) as u32
    }

    pub fn memory_operation(&mut self, opcode: &str, access: MemoryAccess) -> u32 {
        let op = self.operation(opcode);
        self.ops[op as usize].memory = Some(access);
        op
    }

    /// Append a move. The returned id is the move's id in the built graph.
    pub fn add_move(&mut self, mv: BlockMove) -> MoveId {
        self.moves.push(mv);
        MoveId::new(self.moves.len() - 1)
    }

    fn push(&mut self, src: Terminal, dst: Terminal, src_op: Option<u32>, dst_op: Option<u32>) -> MoveId {
        let block = self.block;
        self.add_move(BlockMove {
            src,
            dst,
            guard: None,
            dst_op,
            src_op,
            block,
        })
    }

    /// A plain transport, e.g. a register copy or an immediate load.
    pub fn transport(&mut self, src: Terminal, dst: Terminal) -> MoveId {
        self.push(src, dst, None, None)
    }

    /// Write input `operand` of `op`.
    pub fn operand(&mut self, op: u32, operand: u8, src: Terminal) -> MoveId {
        let dst = Terminal::FuInput {
            operand,
            trigger: false,
        };
        self.push(src, dst, None, Some(op))
    }

    /// Write the triggering input `operand` of `op`.
    pub fn trigger(&mut self, op: u32, operand: u8, src: Terminal) -> MoveId {
        let dst = Terminal::FuInput {
            operand,
            trigger: true,
        };
        self.push(src, dst, None, Some(op))
    }

    /// Read output `operand` of `op`.
    pub fn result(&mut self, op: u32, operand: u8, dst: Terminal) -> MoveId {
        self.push(Terminal::FuOutput { operand }, dst, Some(op), None)
    }

    pub fn guard(&mut self, mv: MoveId, guard: Guard) -> &mut Self {
        self.moves[mv.index()].guard = Some(guard);
        self
    }

    /// Snapshot the moves collected so far for `machine`.
    #[cfg(feature = "enable-serde")]
    pub fn to_serializable(&self, machine: crate::MachineDesc) -> crate::serialize::SerializableBlock {
        use crate::serialize::{OperationData, SerializableBlock};
        SerializableBlock {
            machine,
            operations: self
                .ops
                .iter()
                .map(|op| OperationData {
                    opcode: op.opcode.clone(),
                    memory: op.memory,
                })
                .collect(),
            moves: self.moves.clone(),
            live_in: self.live_in.iter().copied().collect(),
            live_out: self
                .live_out
                .as_ref()
                .map(|regs| regs.iter().copied().collect()),
            loop_body: self.loop_body,
        }
    }

    pub fn build(&self) -> Result<DataDependenceGraph, SchedError> {
        let mut ddg = DataDependenceGraph::new(self.machine);
        ddg.set_live_in(self.live_in.clone());
        if let Some(live_out) = &self.live_out {
            ddg.set_live_out(live_out.clone());
        }

        let mut op_ids: Vec<OpId> = Vec::with_capacity(self.ops.len());
        for pending in &self.ops {
            let units = self.machine.units_for(&pending.opcode);
            let latency = units
                .iter()
                .filter_map(|&fu| self.machine.operation(fu, &pending.opcode))
                .map(|desc| desc.latency)
                .max()
                .unwrap_or(1);
            let op = ddg.add_operation(&pending.opcode, units.into_iter().collect(), latency);
            ddg.op_mut(op).memory = pending.memory;
            op_ids.push(op);
        }

        let mut order: Vec<MoveId> = Vec::with_capacity(self.moves.len());
        for mv in &self.moves {
            let mut node = MoveNode::new(mv.src, mv.dst, mv.block);
            node.guard = mv.guard;
            let n = ddg.add_node(node);
            if let Some(op) = mv.dst_op {
                let op = *op_ids
                    .get(op as usize)
                    .ok_or(SchedError::InvalidProgram("unknown operation", n))?;
                if !matches!(mv.dst, Terminal::FuInput { .. }) {
                    return Err(SchedError::InvalidProgram(
                        "operand move does not write a function unit port",
                        n,
                    ));
                }
                ddg.add_input(op, n);
            } else if matches!(mv.dst, Terminal::FuInput { .. }) {
                return Err(SchedError::InvalidProgram("operand move without operation", n));
            }
            if let Some(op) = mv.src_op {
                let op = *op_ids
                    .get(op as usize)
                    .ok_or(SchedError::InvalidProgram("unknown operation", n))?;
                if !matches!(mv.src, Terminal::FuOutput { .. }) {
                    return Err(SchedError::InvalidProgram(
                        "result move does not read a function unit port",
                        n,
                    ));
                }
                ddg.add_output(op, n);
            } else if matches!(mv.src, Terminal::FuOutput { .. }) {
                return Err(SchedError::InvalidProgram("result move without operation", n));
            }
            order.push(n);
        }

        for &op in &op_ids {
            self.validate_operation(&mut ddg, op)?;
        }

        let mut state = WalkState::default();
        Self::walk(&mut ddg, &order, 0, &mut state);
        if self.loop_body {
            Self::walk(&mut ddg, &order, 1, &mut state);
        }

        for &op in &op_ids {
            let Some(trigger) = ddg.trigger(op) else {
                continue;
            };
            let inputs = ddg.op(op).inputs.clone();
            let outputs = ddg.op(op).outputs.clone();
            for n in inputs.into_iter().filter(|&n| n != trigger) {
                ddg.connect_nodes(n, trigger, DepEdge::operation());
            }
            for n in outputs {
                ddg.connect_nodes(trigger, n, DepEdge::operation());
            }
        }

        trace!(
            "built ddg: {} moves, {} operations, {} edges",
            ddg.node_count(),
            op_ids.len(),
            ddg.edge_count()
        );
        ddg.dump();
        Ok(ddg)
    }

    fn validate_operation(&self, ddg: &mut DataDependenceGraph, op: OpId) -> Result<(), SchedError> {
        let first = ddg
            .op_nodes(op)
            .next()
            .unwrap_or_else(MoveId::invalid);
        if ddg.op(op).allowed_fus.is_empty() {
            return Err(SchedError::InvalidProgram(
                "no function unit implements the operation",
                first,
            ));
        }
        let triggers = ddg
            .op(op)
            .inputs
            .iter()
            .filter(|&&n| ddg.node(n).is_trigger())
            .count();
        if !ddg.op(op).inputs.is_empty() && triggers != 1 {
            return Err(SchedError::InvalidProgram(
                "operation needs exactly one trigger",
                first,
            ));
        }
        let control = ddg
            .op(op)
            .allowed_fus
            .iter()
            .all(|fu| self.machine.function_units()[fu.index()].control);
        if control {
            let call = ddg.op(op).opcode == "call";
            if let Some(t) = ddg.trigger(op) {
                let node = ddg.node_mut(t);
                node.control_flow = true;
                node.call = call;
            }
        }
        Ok(())
    }

    fn walk(ddg: &mut DataDependenceGraph, order: &[MoveId], pass: u8, state: &mut WalkState) {
        for &n in order {
            let node = ddg.node(n).clone();

            let mut reads: SmallVec<[(Reg, bool); 2]> = SmallVec::new();
            if let Some(r) = node.src.reg() {
                reads.push((r, false));
            }
            if let Some(g) = node.guard {
                reads.push((g.reg, true));
            }
            for (reg, guard_use) in reads {
                let rs = state.regs.entry(reg).or_default();
                for &(def, def_pass) in &rs.defs {
                    if Self::skip(ddg, def, def_pass, n, pass) {
                        continue;
                    }
                    if !guard_use && ddg.exclusing_guards(def, n) {
                        continue;
                    }
                    let mut edge = DepEdge::register(DepType::Raw, reg).with_loop_depth(pass);
                    edge.guard_use = guard_use;
                    ddg.connect_or_skip(def, n, edge);
                }
                rs.reads.push(((n, pass), guard_use));
            }

            if let Some(reg) = node.dst.reg() {
                let rs = state.regs.entry(reg).or_default();
                Self::write(ddg, rs, n, pass, EdgeReason::Register, EdgeData::Register(reg));
            }

            if node.src == Terminal::ReturnAddress {
                for &(def, def_pass) in &state.ra.defs {
                    if !Self::skip(ddg, def, def_pass, n, pass) {
                        let edge = DepEdge::new(EdgeReason::ReturnAddress, DepType::Raw, EdgeData::None)
                            .with_loop_depth(pass);
                        ddg.connect_or_skip(def, n, edge);
                    }
                }
                state.ra.reads.push(((n, pass), false));
            }
            if node.dst == Terminal::ReturnAddress || node.call {
                Self::write(ddg, &mut state.ra, n, pass, EdgeReason::ReturnAddress, EdgeData::None);
            }

            if node.is_trigger() {
                if let Some(access) = node.dst_op.and_then(|op| ddg.op(op).memory) {
                    Self::memory(ddg, state, n, pass, access);
                }
            }
        }
    }

    /// In the second walk only edges from first-walk accesses are new.
    fn skip(ddg: &DataDependenceGraph, tail: MoveId, tail_pass: u8, head: MoveId, pass: u8) -> bool {
        (pass > 0 && tail_pass == pass) || tail == head || !ddg.node(tail).is_live()
    }

    fn write(
        ddg: &mut DataDependenceGraph,
        rs: &mut RegState,
        n: MoveId,
        pass: u8,
        reason: EdgeReason,
        data: EdgeData,
    ) {
        for &((reader, reader_pass), guard_use) in &rs.reads {
            if Self::skip(ddg, reader, reader_pass, n, pass) {
                continue;
            }
            if !guard_use && ddg.exclusing_guards(reader, n) {
                continue;
            }
            let mut edge = DepEdge::new(reason, DepType::War, data).with_loop_depth(pass);
            edge.guard_use = guard_use;
            ddg.connect_or_skip(reader, n, edge);
        }
        for &(def, def_pass) in &rs.defs {
            if Self::skip(ddg, def, def_pass, n, pass) || ddg.exclusing_guards(def, n) {
                continue;
            }
            let edge = DepEdge::new(reason, DepType::Waw, data).with_loop_depth(pass);
            ddg.connect_or_skip(def, n, edge);
        }
        if ddg.node(n).is_unconditional() {
            rs.defs.clear();
            rs.reads.clear();
        }
        rs.defs.push((n, pass));
    }

    fn memory(ddg: &mut DataDependenceGraph, state: &mut WalkState, n: MoveId, pass: u8, access: MemoryAccess) {
        match access {
            MemoryAccess::Load => {
                for &s in &state.stores {
                    Self::memory_edge(ddg, s, n, pass, DepType::Raw);
                }
                state.loads.push((n, pass));
            }
            MemoryAccess::Store => {
                for &l in &state.loads {
                    Self::memory_edge(ddg, l, n, pass, DepType::War);
                }
                for &s in &state.stores {
                    Self::memory_edge(ddg, s, n, pass, DepType::Waw);
                }
                state.loads.clear();
                state.stores.clear();
                state.stores.push((n, pass));
            }
        }
    }

    fn memory_edge(ddg: &mut DataDependenceGraph, (tail, tail_pass): Access, n: MoveId, pass: u8, dep: DepType) {
        if !Self::skip(ddg, tail, tail_pass, n, pass) {
            ddg.connect_or_skip(tail, n, DepEdge::memory(dep).with_loop_depth(pass));
        }
    }
}
