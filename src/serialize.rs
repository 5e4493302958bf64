/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

use core::fmt;

use alloc::{string::String, vec::Vec};
use serde::{Deserialize, Serialize};

use crate::ddg::{BlockMove, DataDependenceGraph, DdgBuilder, MemoryAccess};
use crate::{MachineDesc, Reg, SchedError, Terminal};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationData {
    pub opcode: String,
    pub memory: Option<MemoryAccess>,
}

/// A block of moves together with the machine it targets, in a form that
/// can be serialized and deserialized.
///
/// The serialized form of this structure is not stable: it is intended to be
/// deserialized with the exact same version of movesched as the one that it
/// was created with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerializableBlock {
    pub machine: MachineDesc,
    pub operations: Vec<OperationData>,
    pub moves: Vec<BlockMove>,
    pub live_in: Vec<Reg>,
    /// `None` when liveness at the end of the block is unknown.
    pub live_out: Option<Vec<Reg>>,
    pub loop_body: bool,
}

impl SerializableBlock {
    pub fn new(machine: MachineDesc) -> Self {
        SerializableBlock {
            machine,
            operations: Vec::new(),
            moves: Vec::new(),
            live_in: Vec::new(),
            live_out: None,
            loop_body: false,
        }
    }

    pub fn machine(&self) -> &MachineDesc {
        &self.machine
    }

    /// Build the dependence graph of the block.
    pub fn to_graph(&self) -> Result<DataDependenceGraph, SchedError> {
        let mut b = DdgBuilder::new(&self.machine);
        b.loop_body(self.loop_body);
        for op in &self.operations {
            match op.memory {
                Some(access) => b.memory_operation(&op.opcode, access),
                None => b.operation(&op.opcode),
            };
        }
        for &reg in &self.live_in {
            b.live_in(reg);
        }
        if let Some(live_out) = &self.live_out {
            b.nothing_live_out();
            for &reg in live_out {
                b.live_out(reg);
            }
        }
        for mv in &self.moves {
            b.add_move(mv.clone());
        }
        b.build()
    }
}

fn fmt_terminal(f: &mut fmt::Formatter<'_>, t: &Terminal, op: Option<u32>) -> fmt::Result {
    match (t, op) {
        (Terminal::Register(r), _) => write!(f, "rf{}.{}", r.rf.index(), r.index),
        (Terminal::Immediate(v), _) => write!(f, "#{v}"),
        (Terminal::FuInput { operand, trigger }, Some(op)) => {
            write!(f, "op{op}.{operand}{}", if *trigger { "t" } else { "" })
        }
        (Terminal::FuOutput { operand }, Some(op)) => write!(f, "op{op}.{operand}"),
        (Terminal::FuInput { operand, .. }, None) | (Terminal::FuOutput { operand }, None) => {
            write!(f, "?.{operand}")
        }
        (Terminal::ReturnAddress, _) => f.write_str("ra"),
    }
}

impl fmt::Display for SerializableBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "block on {} {{", self.machine.name)?;
        for (i, op) in self.operations.iter().enumerate() {
            writeln!(f, "  op{i}: {}", op.opcode)?;
        }
        for (i, mv) in self.moves.iter().enumerate() {
            write!(f, "  move{i}: ")?;
            if let Some(g) = mv.guard {
                let sign = if g.inverted { "!" } else { "?" };
                write!(f, "{sign}rf{}.{} ", g.reg.rf.index(), g.reg.index)?;
            }
            fmt_terminal(f, &mv.src, mv.src_op)?;
            f.write_str(" -> ")?;
            fmt_terminal(f, &mv.dst, mv.dst_op)?;
            writeln!(f)?;
        }
        f.write_str("}")
    }
}
