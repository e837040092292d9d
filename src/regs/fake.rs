//! Array-backed register bank standing in for hardware in unit tests.
//!
//! Records every access so ordering properties of the world-switch protocol
//! can be asserted, not just final values.

use super::{HwAccess, SysReg};

/// A recorded hardware operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwOp {
    Read(SysReg),
    Write(SysReg, u64),
    Isb,
}

/// Fake register bank with an operation log.
pub struct FakeHw {
    regs: [u64; SysReg::COUNT],
    pub log: Vec<HwOp>,
}

impl FakeHw {
    pub fn new() -> Self {
        Self {
            regs: [0; SysReg::COUNT],
            log: Vec::new(),
        }
    }

    /// Inspect a register without logging.
    pub fn get(&self, reg: SysReg) -> u64 {
        self.regs[reg.index()]
    }

    /// Mutate a register without logging, as if some unrelated agent wrote it.
    pub fn set(&mut self, reg: SysReg, value: u64) {
        self.regs[reg.index()] = value;
    }

    /// Log position of the first write to `reg`.
    pub fn write_pos(&self, reg: SysReg) -> Option<usize> {
        self.log
            .iter()
            .position(|op| matches!(op, HwOp::Write(r, _) if *r == reg))
    }

    /// Log position of the first barrier at or after `from`.
    pub fn isb_pos_from(&self, from: usize) -> Option<usize> {
        self.log[from..]
            .iter()
            .position(|op| *op == HwOp::Isb)
            .map(|p| from + p)
    }
}

impl Default for FakeHw {
    fn default() -> Self {
        Self::new()
    }
}

impl HwAccess for FakeHw {
    fn read(&mut self, reg: SysReg) -> u64 {
        self.log.push(HwOp::Read(reg));
        self.regs[reg.index()]
    }

    fn write(&mut self, reg: SysReg, value: u64) {
        self.log.push(HwOp::Write(reg, value));
        // ID registers stay read-only in the fake as well
        if !matches!(reg, SysReg::IdAa64Pfr0El1 | SysReg::IdAa64Mmfr1El1) {
            self.regs[reg.index()] = value;
        }
    }

    fn isb(&mut self) {
        self.log.push(HwOp::Isb);
    }
}
