/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Target machine capabilities.
//!
//! The scheduler never loads machine descriptions itself. It only asks
//! the questions in the [`Machine`] trait: which register files,
//! function units and buses exist, which ports a bus connects, which
//! operations a function unit implements and how long they take.
//! [`MachineDesc`] is a plain-data implementation, built with
//! [`MachineBuilder`].

use crate::{BusId, FuId, Reg, RfId};
use alloc::string::String;
use alloc::vec::Vec;
use core::hash::{Hash, Hasher};
use rustc_hash::FxHasher;
use smallvec::SmallVec;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// A port that a bus socket can attach to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Port {
    RfRead(RfId),
    RfWrite(RfId),
    FuIn { fu: FuId, operand: u8 },
    FuOut { fu: FuId, operand: u8 },
    RaRead,
    RaWrite,
}

/// Identity of a machine, used to key caches that outlive one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct MachineKey(pub u64);

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct RegisterFile {
    pub name: String,
    pub size: u16,
    pub read_ports: u8,
    pub write_ports: u8,
    pub guard_latency: u32,
    /// The last register is reserved as a temporary for the code
    /// generator and must never be handed out by the renamer.
    pub temp: bool,
    /// Values in this file exist only before scheduling; every write
    /// must be bypassed to its readers.
    pub forced_bypass: bool,
}

impl RegisterFile {
    pub fn reg(&self, rf: RfId, index: u16) -> Reg {
        debug_assert!(index < self.size);
        Reg::new(rf, index)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct OperationDesc {
    pub name: String,
    pub latency: u32,
    pub inputs: u8,
    pub outputs: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct FunctionUnit {
    pub name: String,
    pub operations: Vec<OperationDesc>,
    /// The operand index whose write starts an operation.
    pub trigger: u8,
    /// Set on the control unit, which executes jumps and calls.
    pub control: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Bus {
    pub name: String,
    /// Width of the inline immediate field; 0 when the bus cannot carry
    /// short immediates.
    pub short_imm_bits: u8,
    pub sockets: Vec<Port>,
}

/// The capability surface the scheduler needs from a target.
pub trait Machine {
    fn key(&self) -> MachineKey;
    fn register_files(&self) -> &[RegisterFile];
    fn function_units(&self) -> &[FunctionUnit];
    fn buses(&self) -> &[Bus];

    /// How many long immediates an instruction can carry.
    fn long_immediate_slots(&self) -> u32;

    fn global_guard_latency(&self) -> u32;

    fn rf_guard_latency(&self, rf: RfId) -> u32 {
        self.register_files()[rf.index()].guard_latency
    }

    /// Total latency of a guard read: the value must be written this
    /// many cycles before the guarded move.
    fn guard_latency(&self, rf: RfId) -> u32 {
        self.global_guard_latency() + self.rf_guard_latency(rf)
    }

    fn bus_connects(&self, bus: BusId, port: Port) -> bool {
        self.buses()[bus.index()].sockets.contains(&port)
    }

    /// Is there any bus connecting the two ports?
    fn connected(&self, from: Port, to: Port) -> bool {
        (0..self.buses().len())
            .map(BusId::new)
            .any(|b| self.bus_connects(b, from) && self.bus_connects(b, to))
    }

    /// Can some bus deliver `value` inline into `to`?
    fn short_immediate_reaches(&self, value: i64, to: Port) -> bool {
        let bits = immediate_bits(value);
        self.buses()
            .iter()
            .any(|b| b.short_imm_bits >= bits && b.sockets.contains(&to))
    }

    /// Can a long immediate be delivered into `to`?
    fn long_immediate_reaches(&self, to: Port) -> bool {
        self.long_immediate_slots() > 0 && self.buses().iter().any(|b| b.sockets.contains(&to))
    }

    fn operation(&self, fu: FuId, opcode: &str) -> Option<&OperationDesc> {
        self.function_units()[fu.index()]
            .operations
            .iter()
            .find(|op| op.name == opcode)
    }

    /// All function units that implement `opcode`.
    fn units_for(&self, opcode: &str) -> SmallVec<[FuId; 4]> {
        (0..self.function_units().len())
            .map(FuId::new)
            .filter(|&fu| self.operation(fu, opcode).is_some())
            .collect()
    }
}

/// Number of bits needed to hold `value` as a sign-extended field.
pub fn immediate_bits(value: i64) -> u8 {
    let magnitude = value ^ (value >> 63);
    (64 - magnitude.leading_zeros() + 1) as u8
}

/// A machine described by plain data.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct MachineDesc {
    pub name: String,
    pub register_files: Vec<RegisterFile>,
    pub function_units: Vec<FunctionUnit>,
    pub buses: Vec<Bus>,
    pub long_immediate_slots: u32,
    pub global_guard_latency: u32,
}

impl Machine for MachineDesc {
    fn key(&self) -> MachineKey {
        let mut hasher = FxHasher::default();
        self.name.hash(&mut hasher);
        self.register_files.len().hash(&mut hasher);
        for rf in &self.register_files {
            rf.name.hash(&mut hasher);
            rf.size.hash(&mut hasher);
        }
        self.function_units.len().hash(&mut hasher);
        self.buses.len().hash(&mut hasher);
        MachineKey(hasher.finish())
    }

    fn register_files(&self) -> &[RegisterFile] {
        &self.register_files
    }

    fn function_units(&self) -> &[FunctionUnit] {
        &self.function_units
    }

    fn buses(&self) -> &[Bus] {
        &self.buses
    }

    fn long_immediate_slots(&self) -> u32 {
        self.long_immediate_slots
    }

    fn global_guard_latency(&self) -> u32 {
        self.global_guard_latency
    }
}

/// Incremental construction of a [`MachineDesc`].
pub struct MachineBuilder {
    desc: MachineDesc,
}

impl MachineBuilder {
    pub fn new(name: &str) -> Self {
        MachineBuilder {
            desc: MachineDesc {
                name: name.into(),
                register_files: Vec::new(),
                function_units: Vec::new(),
                buses: Vec::new(),
                long_immediate_slots: 1,
                global_guard_latency: 1,
            },
        }
    }

    pub fn register_file(&mut self, name: &str, size: u16, read_ports: u8, write_ports: u8) -> RfId {
        let id = RfId::new(self.desc.register_files.len());
        self.desc.register_files.push(RegisterFile {
            name: name.into(),
            size,
            read_ports,
            write_ports,
            guard_latency: 0,
            temp: false,
            forced_bypass: false,
        });
        id
    }

    pub fn temp_register_file(&mut self, rf: RfId) -> &mut Self {
        self.desc.register_files[rf.index()].temp = true;
        self
    }

    pub fn forced_bypass_register_file(&mut self, rf: RfId) -> &mut Self {
        self.desc.register_files[rf.index()].forced_bypass = true;
        self
    }

    /// Add a function unit. `ops` lists `(name, latency, inputs, outputs)`;
    /// the last input is the trigger.
    pub fn function_unit(&mut self, name: &str, ops: &[(&str, u32, u8, u8)]) -> FuId {
        let id = FuId::new(self.desc.function_units.len());
        let trigger = ops.iter().map(|op| op.2).max().unwrap_or(1).saturating_sub(1);
        self.desc.function_units.push(FunctionUnit {
            name: name.into(),
            operations: ops
                .iter()
                .map(|&(name, latency, inputs, outputs)| OperationDesc {
                    name: name.into(),
                    latency,
                    inputs,
                    outputs,
                })
                .collect(),
            trigger,
            control: false,
        });
        id
    }

    pub fn control_unit(&mut self, name: &str, ops: &[(&str, u32, u8, u8)]) -> FuId {
        let id = self.function_unit(name, ops);
        self.desc.function_units[id.index()].control = true;
        id
    }

    pub fn bus(&mut self, name: &str, short_imm_bits: u8, sockets: Vec<Port>) -> BusId {
        let id = BusId::new(self.desc.buses.len());
        self.desc.buses.push(Bus {
            name: name.into(),
            short_imm_bits,
            sockets,
        });
        id
    }

    /// Add `count` buses, each attached to every port of the machine.
    pub fn fully_connected_buses(&mut self, count: usize, short_imm_bits: u8) -> &mut Self {
        let ports = self.all_ports();
        for i in 0..count {
            let name = alloc::format!("b{}", i);
            self.bus(&name, short_imm_bits, ports.clone());
        }
        self
    }

    pub fn long_immediate_slots(&mut self, slots: u32) -> &mut Self {
        self.desc.long_immediate_slots = slots;
        self
    }

    pub fn global_guard_latency(&mut self, latency: u32) -> &mut Self {
        self.desc.global_guard_latency = latency;
        self
    }

    fn all_ports(&self) -> Vec<Port> {
        let mut ports = Vec::new();
        for i in 0..self.desc.register_files.len() {
            ports.push(Port::RfRead(RfId::new(i)));
            ports.push(Port::RfWrite(RfId::new(i)));
        }
        for (i, fu) in self.desc.function_units.iter().enumerate() {
            let inputs = fu.operations.iter().map(|op| op.inputs).max().unwrap_or(0);
            let outputs = fu.operations.iter().map(|op| op.outputs).max().unwrap_or(0);
            for operand in 0..inputs {
                ports.push(Port::FuIn {
                    fu: FuId::new(i),
                    operand,
                });
            }
            for operand in inputs..inputs + outputs {
                ports.push(Port::FuOut {
                    fu: FuId::new(i),
                    operand,
                });
            }
        }
        ports.push(Port::RaRead);
        ports.push(Port::RaWrite);
        ports
    }

    pub fn finish(self) -> MachineDesc {
        self.desc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn immediate_widths() {
        assert_eq!(immediate_bits(0), 1);
        assert_eq!(immediate_bits(-1), 1);
        assert_eq!(immediate_bits(1), 2);
        assert_eq!(immediate_bits(127), 8);
        assert_eq!(immediate_bits(-128), 8);
        assert_eq!(immediate_bits(128), 9);
    }

    #[test]
    fn connectivity_queries() {
        let mut b = MachineBuilder::new("tiny");
        let rf = b.register_file("r", 8, 1, 1);
        let alu = b.function_unit("alu", &[("add", 1, 2, 1)]);
        b.bus(
            "b0",
            6,
            vec![Port::RfRead(rf), Port::FuIn { fu: alu, operand: 0 }],
        );
        let m = b.finish();
        assert!(m.connected(Port::RfRead(rf), Port::FuIn { fu: alu, operand: 0 }));
        assert!(!m.connected(Port::RfRead(rf), Port::FuIn { fu: alu, operand: 1 }));
        assert!(m.short_immediate_reaches(31, Port::FuIn { fu: alu, operand: 0 }));
        assert!(!m.short_immediate_reaches(32, Port::FuIn { fu: alu, operand: 0 }));
        assert!(m.long_immediate_reaches(Port::FuIn { fu: alu, operand: 0 }));
        assert_eq!(m.units_for("add").as_slice(), &[alu]);
        assert_eq!(m.function_units[alu.index()].trigger, 1);
        assert_eq!(m.key(), m.clone().key());
    }
}
