/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Data structures for the dependence graph.

use crate::{BlockId, Cycle, FuId, Guard, Placement, Reg, Terminal};
use alloc::string::String;
use alloc::vec::Vec;
use smallvec::SmallVec;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// Why two moves depend on each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum EdgeReason {
    Register,
    Memory,
    /// Structural ordering inside one operation: operands before the
    /// trigger, the trigger before the results.
    Operation,
    ReturnAddress,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum DepType {
    Raw,
    Waw,
    War,
    Unknown,
}

/// The storage location an edge is about. Disambiguates parallel edges
/// between the same pair of nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum EdgeData {
    None,
    Register(Reg),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct DepEdge {
    pub reason: EdgeReason,
    pub dep: DepType,
    pub data: EdgeData,
    /// The head reads the register as a guard rather than as a source.
    pub guard_use: bool,
    pub tail_pseudo: bool,
    pub head_pseudo: bool,
    /// Number of loop iterations the edge crosses; nonzero marks a
    /// loop-carried (back) edge.
    pub loop_depth: u8,
}

impl DepEdge {
    pub fn new(reason: EdgeReason, dep: DepType, data: EdgeData) -> Self {
        DepEdge {
            reason,
            dep,
            data,
            guard_use: false,
            tail_pseudo: false,
            head_pseudo: false,
            loop_depth: 0,
        }
    }

    pub fn register(dep: DepType, reg: Reg) -> Self {
        Self::new(EdgeReason::Register, dep, EdgeData::Register(reg))
    }

    pub fn operation() -> Self {
        Self::new(EdgeReason::Operation, DepType::Unknown, EdgeData::None)
    }

    pub fn memory(dep: DepType) -> Self {
        Self::new(EdgeReason::Memory, dep, EdgeData::None)
    }

    pub fn with_guard_use(mut self) -> Self {
        self.guard_use = true;
        self
    }

    pub fn with_loop_depth(mut self, depth: u8) -> Self {
        self.loop_depth = depth;
        self
    }

    pub fn with_tail_pseudo(mut self) -> Self {
        self.tail_pseudo = true;
        self
    }

    pub fn with_head_pseudo(mut self) -> Self {
        self.head_pseudo = true;
        self
    }

    #[inline(always)]
    pub fn is_back_edge(&self) -> bool {
        self.loop_depth > 0
    }

    #[inline(always)]
    pub fn is_pseudo(&self) -> bool {
        self.tail_pseudo || self.head_pseudo
    }

    #[inline(always)]
    pub fn reg(&self) -> Option<Reg> {
        match self.data {
            EdgeData::Register(r) => Some(r),
            EdgeData::None => None,
        }
    }

    /// A true data dependence through a register.
    #[inline(always)]
    pub fn is_register_raw(&self) -> bool {
        self.reason == EdgeReason::Register && self.dep == DepType::Raw
    }

    #[inline(always)]
    pub fn is_register_anti(&self) -> bool {
        self.reason == EdgeReason::Register && matches!(self.dep, DepType::War | DepType::Waw)
    }

    /// Whether this edge carries the given register in the given way.
    #[inline(always)]
    pub fn is_register(&self, dep: DepType, reg: Reg) -> bool {
        self.reason == EdgeReason::Register && self.dep == dep && self.reg() == Some(reg)
    }
}

impl core::fmt::Display for DepEdge {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let reason = match self.reason {
            EdgeReason::Register => "R",
            EdgeReason::Memory => "M",
            EdgeReason::Operation => "O",
            EdgeReason::ReturnAddress => "RA",
            EdgeReason::Unknown => "?",
        };
        let dep = match self.dep {
            DepType::Raw => "raw",
            DepType::Waw => "waw",
            DepType::War => "war",
            DepType::Unknown => "",
        };
        write!(f, "{}_{}", reason, dep)?;
        if self.guard_use {
            write!(f, "_g")?;
        }
        if let Some(r) = self.reg() {
            write!(f, ":{}", r)?;
        }
        if self.loop_depth > 0 {
            write!(f, "_L{}", self.loop_depth)?;
        }
        Ok(())
    }
}

/// An edge stored in the graph arena. Removed edges keep their slot so
/// an undo can revive them under the same id.
#[derive(Clone, Debug)]
pub struct EdgeEntry {
    pub tail: MoveId,
    pub head: MoveId,
    pub edge: DepEdge,
    pub(crate) live: bool,
}

/// One data transport.
#[derive(Clone, Debug)]
pub struct MoveNode {
    pub src: Terminal,
    pub dst: Terminal,
    pub guard: Option<Guard>,
    /// The operation whose result this move reads.
    pub src_op: Option<OpId>,
    /// The operation whose operand or trigger this move writes.
    pub dst_op: Option<OpId>,
    pub block: BlockId,
    /// The move triggers a jump or call that ends the block.
    pub control_flow: bool,
    pub call: bool,
    /// Function units that may produce the source value, recorded when a
    /// bypass redirects the move to read a result port directly. Empty
    /// means unrestricted.
    pub allowed_src_fus: SmallVec<[FuId; 2]>,
    pub placement: Option<Placement>,
    pub(crate) ins: SmallVec<[EdgeId; 4]>,
    pub(crate) outs: SmallVec<[EdgeId; 4]>,
    pub(crate) live: bool,
}

impl MoveNode {
    pub fn new(src: Terminal, dst: Terminal, block: BlockId) -> Self {
        MoveNode {
            src,
            dst,
            guard: None,
            src_op: None,
            dst_op: None,
            block,
            control_flow: false,
            call: false,
            allowed_src_fus: SmallVec::new(),
            placement: None,
            ins: SmallVec::new(),
            outs: SmallVec::new(),
            live: true,
        }
    }

    #[inline(always)]
    pub fn is_scheduled(&self) -> bool {
        self.placement.is_some()
    }

    /// Panics when the node is not scheduled.
    #[inline(always)]
    pub fn cycle(&self) -> Cycle {
        match self.placement {
            Some(p) => p.cycle,
            None => panic!("cycle() of an unscheduled move"),
        }
    }

    #[inline(always)]
    pub fn is_live(&self) -> bool {
        self.live
    }

    #[inline(always)]
    pub fn is_operand_move(&self) -> bool {
        self.dst_op.is_some()
    }

    #[inline(always)]
    pub fn is_result_move(&self) -> bool {
        self.src_op.is_some()
    }

    #[inline(always)]
    pub fn is_trigger(&self) -> bool {
        self.dst.is_trigger()
    }

    #[inline(always)]
    pub fn is_unconditional(&self) -> bool {
        self.guard.is_none()
    }

    /// Is the move a plain copy between registers?
    #[inline(always)]
    pub fn is_register_copy(&self) -> bool {
        self.src.is_register() && self.dst.is_register()
    }

    /// Is this move part of an operation, on either side?
    #[inline(always)]
    pub fn in_operation(&self) -> bool {
        self.src_op.is_some() || self.dst_op.is_some()
    }

    pub fn ops(&self) -> impl Iterator<Item = OpId> {
        self.src_op.into_iter().chain(self.dst_op)
    }

    pub fn guard_excludes(&self, other: &MoveNode) -> bool {
        match (&self.guard, &other.guard) {
            (Some(a), Some(b)) => a.excludes(b),
            _ => false,
        }
    }
}

impl core::fmt::Display for MoveNode {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        if let Some(g) = &self.guard {
            write!(f, "{}{} ", if g.inverted { "!" } else { "?" }, g.reg)?;
        }
        write!(f, "{} -> {}", self.src, self.dst)?;
        if let Some(p) = &self.placement {
            write!(f, " @{}:b{}", p.cycle, p.bus.index())?;
        }
        Ok(())
    }
}

/// One invocation of a machine operation.
#[derive(Clone, Debug)]
pub struct ProgramOperation {
    pub opcode: String,
    pub inputs: SmallVec<[MoveId; 4]>,
    pub outputs: SmallVec<[MoveId; 2]>,
    /// Function units allowed to execute the operation.
    pub allowed_fus: SmallVec<[FuId; 2]>,
    pub latency: u32,
    /// Unit chosen by the resource manager once the first move of the
    /// operation is assigned.
    pub fu: Option<FuId>,
    /// Touches memory; orders it against other memory operations.
    pub memory: Option<MemoryAccess>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum MemoryAccess {
    Load,
    Store,
}

define_index!(MoveId, MoveNodes, MoveNode);
define_index!(EdgeId, Edges, EdgeEntry);
define_index!(OpId, Operations, ProgramOperation);

impl core::fmt::Display for MoveId {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "mv{}", self.0)
    }
}

impl core::fmt::Display for OpId {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Edge-level undo information: replaying it restores the edge set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GraphUndo {
    pub(crate) removed: Vec<EdgeId>,
    pub(crate) added: Vec<EdgeId>,
    pub(crate) changed: Vec<(EdgeId, EdgeData)>,
}

impl GraphUndo {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty() && self.changed.is_empty()
    }

    pub fn added(&self) -> &[EdgeId] {
        &self.added
    }

    pub fn removed(&self) -> &[EdgeId] {
        &self.removed
    }

    pub(crate) fn append(&mut self, mut other: GraphUndo) {
        self.removed.append(&mut other.removed);
        self.added.append(&mut other.added);
        self.changed.append(&mut other.changed);
    }
}

/// Previous state of a move rewritten to read a bypassed value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MoveRewrite {
    pub(crate) node: MoveId,
    pub(crate) old_src: Terminal,
    pub(crate) old_src_op: Option<OpId>,
    pub(crate) old_allowed_src_fus: SmallVec<[FuId; 2]>,
    /// Operation the node was appended to as a new output.
    pub(crate) linked_op: Option<OpId>,
}

/// Everything `merge_and_keep` changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeUndo {
    pub(crate) source: MoveId,
    pub(crate) dest: MoveId,
    pub(crate) edges: GraphUndo,
    pub(crate) rewrite: MoveRewrite,
}

/// A node taken out of the graph together with its edges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemovedNode {
    pub(crate) node: MoveId,
    pub(crate) edges: Vec<EdgeId>,
    /// Operation output list the node was unlinked from, with position.
    pub(crate) op_slot: Option<(OpId, usize)>,
}

/// A cross-block edge of a subgraph, kept as an annotation because one
/// of its ends lives outside the subgraph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundaryEdge {
    /// Node inside the subgraph.
    pub local: MoveId,
    /// Node id in the parent graph.
    pub remote: MoveId,
    pub edge: DepEdge,
    /// The edge points into the subgraph.
    pub incoming: bool,
}
