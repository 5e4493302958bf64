/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Move scheduler for transport-triggered architectures.
//!
//! The instruction set of a transport-triggered processor consists of
//! explicit data transports ("moves") between function-unit ports,
//! register files and immediates. This crate assigns every move of a
//! basic block to a cycle and a bus while respecting the data, anti and
//! output dependences between moves, and opportunistically rewrites the
//! block (operand bypassing, register renaming) when that shortens the
//! schedule. Every rewrite is reversible: an attempt that does not pan
//! out is unwound in reverse order and leaves the dependence graph, the
//! resource manager and the renamer exactly as it found them.

#![allow(dead_code)]
#![no_std]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

use core::hash::BuildHasherDefault;
use rustc_hash::FxHasher;

type FxHashMap<K, V> = hashbrown::HashMap<K, V, BuildHasherDefault<FxHasher>>;
type FxHashSet<V> = hashbrown::HashSet<V, BuildHasherDefault<FxHasher>>;

macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(feature = "trace-log") {
            ::log::trace!($($tt)*);
        }
    };
}

macro_rules! trace_enabled {
    () => {
        cfg!(feature = "trace-log") && ::log::log_enabled!(::log::Level::Trace)
    };
}

#[macro_use]
mod index;
pub use index::{BlockId, BusId, FuId, RfId};

pub mod bypass;
pub mod checker;
pub mod ddg;
pub mod machine;
pub mod nodeset;
pub mod renamer;
pub mod resource;
pub mod reversible;
pub mod scheduler;
pub mod selector;
pub mod steps;

#[cfg(feature = "enable-serde")]
pub mod serialize;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

pub use ddg::{DataDependenceGraph, DdgBuilder, EdgeId, MoveId, OpId};
pub use machine::{Machine, MachineBuilder, MachineDesc};
pub use resource::{ResourceManager, SimpleResourceManager};
pub use scheduler::{schedule_block, Schedule};

/// A machine cycle. Signed so that latency arithmetic on anti
/// dependences (which may allow a negative distance) stays simple.
pub type Cycle = i32;

/// A general-purpose register: a register file plus an index into it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Reg {
    pub rf: RfId,
    pub index: u16,
}

impl Reg {
    #[inline(always)]
    pub const fn new(rf: RfId, index: u16) -> Self {
        Reg { rf, index }
    }
}

impl core::fmt::Debug for Reg {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}", self)
    }
}

impl core::fmt::Display for Reg {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "rf{}.{}", self.rf.index(), self.index)
    }
}

/// One end of a move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Terminal {
    /// A general-purpose register.
    Register(Reg),
    /// An immediate value. Whether it is encoded inline on the bus or
    /// through a long-immediate slot is decided by the resource manager.
    Immediate(i64),
    /// An operand input of the function unit that executes the move's
    /// destination operation. Writing the trigger starts the operation.
    FuInput { operand: u8, trigger: bool },
    /// A result output of the function unit that executes the move's
    /// source operation.
    FuOutput { operand: u8 },
    /// The return-address register of the control unit.
    ReturnAddress,
}

impl Terminal {
    #[inline(always)]
    pub fn reg(&self) -> Option<Reg> {
        match self {
            Terminal::Register(r) => Some(*r),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn is_register(&self) -> bool {
        matches!(self, Terminal::Register(_))
    }

    #[inline(always)]
    pub fn is_immediate(&self) -> bool {
        matches!(self, Terminal::Immediate(_))
    }

    #[inline(always)]
    pub fn is_fu_port(&self) -> bool {
        matches!(self, Terminal::FuInput { .. } | Terminal::FuOutput { .. })
    }

    #[inline(always)]
    pub fn is_trigger(&self) -> bool {
        matches!(self, Terminal::FuInput { trigger: true, .. })
    }
}

impl core::fmt::Display for Terminal {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Terminal::Register(r) => write!(f, "{}", r),
            Terminal::Immediate(v) => write!(f, "#{}", v),
            Terminal::FuInput {
                operand,
                trigger: true,
            } => write!(f, "fu.{}t", operand),
            Terminal::FuInput { operand, .. } => write!(f, "fu.{}o", operand),
            Terminal::FuOutput { operand } => write!(f, "fu.{}r", operand),
            Terminal::ReturnAddress => write!(f, "ra"),
        }
    }
}

/// A register guard predicating a move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Guard {
    pub reg: Reg,
    pub inverted: bool,
}

impl Guard {
    /// Two guards exclude each other when they test the same register
    /// with opposite polarity: at most one of the guarded moves executes.
    #[inline(always)]
    pub fn excludes(&self, other: &Guard) -> bool {
        self.reg == other.reg && self.inverted != other.inverted
    }
}

/// Where a scheduled move ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Placement {
    pub cycle: Cycle,
    pub bus: BusId,
}

/// Order in which the dependence graph is walked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Direction {
    /// Predecessors first; moves are placed as early as possible.
    #[default]
    TopDown,
    /// Successors first; moves are placed as late as possible.
    BottomUp,
}

/// What the candidate selector does when it finds a node that became
/// reachable only through a forced-bypass chain whose root was never
/// enqueued.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum OrphanPolicy {
    /// Log a warning and recover the node into the ready list.
    #[default]
    Warn,
    /// Treat the orphan as a scheduler bug and panic.
    Abort,
}

/// Options for scheduling.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerOptions {
    /// Walk direction of the driver.
    pub direction: Direction,
    /// How many cycles back an operand may look for the producing result
    /// when bypassing. Zero disables bypassing.
    pub bypass_distance: u32,
    /// Remove result writes that lost their last reader to a bypass.
    pub kill_dead_results: bool,
    /// Rename live ranges when anti dependences delay a move.
    pub rename_registers: bool,
    /// Let the renamer consider register files only reachable through
    /// a long immediate.
    pub allow_limm_rfs: bool,
    /// Orphan handling in the candidate selector.
    pub orphan_policy: OrphanPolicy,
    /// Add extra verbosity to debug logs.
    pub verbose_log: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            direction: Direction::TopDown,
            bypass_distance: 3,
            kill_dead_results: true,
            rename_registers: true,
            allow_limm_rfs: false,
            orphan_policy: OrphanPolicy::Warn,
            verbose_log: false,
        }
    }
}

/// An error that prevents a block from being scheduled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchedError {
    /// The input block is malformed: for example an operand move whose
    /// destination is not a function-unit port, or an operation with no
    /// function unit able to execute it.
    InvalidProgram(&'static str, MoveId),
    /// No cycle within the search horizon admits the given move. This
    /// happens when the interconnect cannot carry the move at all.
    Unschedulable(MoveId),
    /// The ready list ran dry while moves were still unscheduled.
    Deadlock { unscheduled: usize },
}

impl core::fmt::Display for SchedError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SchedError {}
