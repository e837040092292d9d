//! Guest register context store
//!
//! One VCPU's guest-visible register snapshot: the enumerated
//! system-register file plus the general-purpose/exception block, with the
//! save/load operations that move the file between memory and hardware.
//!
//! The file is in exactly one of two states: a passive [`SysRegFile`]
//! snapshot, or resident in hardware, witnessed by a [`ResidentContext`]
//! guard. [`SysRegFile::load`] and [`ResidentContext::save`] are the only
//! conversions, so a context can never be observed half-loaded and the
//! residency preconditions hold at compile time instead of by discipline.

use bitflags::bitflags;

use crate::affinity::AffinityTable;
use crate::config;
use crate::regs::{HwAccess, SysReg};
use crate::trap::{hstr, mdcr};

/// Slots of the saved system-register file.
///
/// One slot per architectural system register participating in
/// virtualization. Discriminants are dense; [`SysRegFile`] indexes by them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CtxReg {
    /// System control
    Sctlr = 0,
    /// Auxiliary control
    Actlr,
    /// Architectural feature access control
    Cpacr,
    /// Translation table base 0
    Ttbr0,
    /// Translation table base 1
    Ttbr1,
    /// Translation control
    Tcr,
    /// Exception syndrome
    Esr,
    /// Fault address
    Far,
    /// Physical address (translation result)
    Par,
    /// Memory attribute indirection
    Mair,
    /// Auxiliary memory attribute indirection
    Amair,
    /// Vector base
    Vbar,
    /// Context ID
    Contextidr,
    /// EL0 thread pointer
    TpidrEl0,
    /// EL0 read-only thread pointer
    TpidrroEl0,
    /// EL1 thread pointer
    TpidrEl1,
    /// EL0 stack pointer
    SpEl0,
    /// EL1 stack pointer
    SpEl1,
    /// EL1 exception link
    ElrEl1,
    /// EL1 saved program status
    SpsrEl1,
    /// Monitor debug system control
    Mdscr,
    /// Counter-timer kernel control
    Cntkctl,
    /// Virtualized multiprocessor affinity
    Vmpidr,
    /// Virtualized processor type
    Vpidr,
}

impl CtxReg {
    /// Number of slots in the file.
    pub const COUNT: usize = CtxReg::Vpidr as usize + 1;

    /// Every slot, in save/restore order.
    pub const ALL: [CtxReg; CtxReg::COUNT] = [
        CtxReg::Sctlr,
        CtxReg::Actlr,
        CtxReg::Cpacr,
        CtxReg::Ttbr0,
        CtxReg::Ttbr1,
        CtxReg::Tcr,
        CtxReg::Esr,
        CtxReg::Far,
        CtxReg::Par,
        CtxReg::Mair,
        CtxReg::Amair,
        CtxReg::Vbar,
        CtxReg::Contextidr,
        CtxReg::TpidrEl0,
        CtxReg::TpidrroEl0,
        CtxReg::TpidrEl1,
        CtxReg::SpEl0,
        CtxReg::SpEl1,
        CtxReg::ElrEl1,
        CtxReg::SpsrEl1,
        CtxReg::Mdscr,
        CtxReg::Cntkctl,
        CtxReg::Vmpidr,
        CtxReg::Vpidr,
    ];

    /// Hardware register backing this slot.
    pub const fn hw(self) -> SysReg {
        match self {
            CtxReg::Sctlr => SysReg::SctlrEl1,
            CtxReg::Actlr => SysReg::ActlrEl1,
            CtxReg::Cpacr => SysReg::CpacrEl1,
            CtxReg::Ttbr0 => SysReg::Ttbr0El1,
            CtxReg::Ttbr1 => SysReg::Ttbr1El1,
            CtxReg::Tcr => SysReg::TcrEl1,
            CtxReg::Esr => SysReg::EsrEl1,
            CtxReg::Far => SysReg::FarEl1,
            CtxReg::Par => SysReg::ParEl1,
            CtxReg::Mair => SysReg::MairEl1,
            CtxReg::Amair => SysReg::AmairEl1,
            CtxReg::Vbar => SysReg::VbarEl1,
            CtxReg::Contextidr => SysReg::ContextidrEl1,
            CtxReg::TpidrEl0 => SysReg::TpidrEl0,
            CtxReg::TpidrroEl0 => SysReg::TpidrroEl0,
            CtxReg::TpidrEl1 => SysReg::TpidrEl1,
            CtxReg::SpEl0 => SysReg::SpEl0,
            CtxReg::SpEl1 => SysReg::SpEl1,
            CtxReg::ElrEl1 => SysReg::ElrEl1,
            CtxReg::SpsrEl1 => SysReg::SpsrEl1,
            CtxReg::Mdscr => SysReg::MdscrEl1,
            CtxReg::Cntkctl => SysReg::CntkctlEl1,
            CtxReg::Vmpidr => SysReg::VmpidrEl2,
            CtxReg::Vpidr => SysReg::VpidrEl2,
        }
    }
}

bitflags! {
    /// Saved program status (PSTATE) bits used by the reset state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Pstate: u64 {
        /// EL1 with dedicated stack pointer
        const M_EL1H = 0b0101;
        /// FIQ mask
        const F = 1 << 6;
        /// IRQ mask
        const I = 1 << 7;
        /// SError mask
        const A = 1 << 8;
        /// Debug mask
        const D = 1 << 9;
    }
}

/// PSTATE a VCPU resets to: EL1h with debug, SError, IRQ and FIQ masked.
pub const RESET_PSTATE: u64 = Pstate::M_EL1H
    .union(Pstate::F)
    .union(Pstate::I)
    .union(Pstate::A)
    .union(Pstate::D)
    .bits();

/// Checked general-purpose register index.
///
/// Covers x0-x30; index 31 names the zero register, which reads as zero and
/// ignores writes. Trap decode can therefore use the raw instruction field
/// without special cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GprIdx(u8);

impl GprIdx {
    /// The zero register.
    pub const XZR: GprIdx = GprIdx(31);
    /// The link register (x30).
    pub const LR: GprIdx = GprIdx(30);

    pub const fn new(index: u8) -> Option<GprIdx> {
        if index <= 31 {
            Some(GprIdx(index))
        } else {
            None
        }
    }

    pub const fn raw(self) -> u8 {
        self.0
    }
}

/// General-purpose and exception register block.
///
/// Always memory-resident between traps; the exception entry stubs fill the
/// integer registers, and the world-switch engine owns `pc`/`pstate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ExceptionRegs {
    /// x0-x30
    pub gpr: [u64; 31],
    /// Stack pointer
    pub sp: u64,
    /// Program counter (exception-return address image)
    pub pc: u64,
    /// Processor state (saved program status image)
    pub pstate: u64,
}

impl ExceptionRegs {
    pub const fn zeroed() -> Self {
        Self {
            gpr: [0; 31],
            sp: 0,
            pc: 0,
            pstate: 0,
        }
    }

    /// Reset block: execution starts at `entry` in the reset PSTATE.
    pub const fn reset(entry: u64) -> Self {
        Self {
            gpr: [0; 31],
            sp: 0,
            pc: entry,
            pstate: RESET_PSTATE,
        }
    }

    /// Read a register; the zero register reads as zero.
    #[inline]
    pub fn get(&self, idx: GprIdx) -> u64 {
        if idx.0 == 31 {
            0
        } else {
            self.gpr[idx.0 as usize]
        }
    }

    /// Write a register; writes to the zero register are ignored.
    #[inline]
    pub fn set(&mut self, idx: GprIdx, value: u64) {
        if idx.0 < 31 {
            self.gpr[idx.0 as usize] = value;
        }
    }
}

/// Scratch mirror of the host register slots that guest execution disturbs.
///
/// Captured on guest entry, restored on exit, so the host resumes exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostContext {
    /// Pre-exception program status (SPSR_EL2) as the host left it.
    pub spsr: u64,
    /// Debug-control mirror (MDCR_EL2).
    pub mdcr: u64,
    /// Host per-core pointer (TPIDR_EL2).
    pub tpidr: u64,
}

impl HostContext {
    pub const fn zeroed() -> Self {
        Self {
            spsr: 0,
            mdcr: 0,
            tpidr: 0,
        }
    }
}

/// Passive snapshot of one VCPU's system-register file.
///
/// Safe to inspect and mutate freely; this is the authoritative guest state
/// whenever the VCPU is not loaded on a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysRegFile {
    slots: [u64; CtxReg::COUNT],
}

/// Witness that a system-register file is resident in hardware.
///
/// Exists only between [`SysRegFile::load`] and [`ResidentContext::save`];
/// while it lives, the passive snapshot is gone, so reading stale values out
/// of a loaded context is unrepresentable.
#[derive(Debug)]
pub struct ResidentContext {
    _resident: (),
}

impl SysRegFile {
    pub const fn zeroed() -> Self {
        Self {
            slots: [0; CtxReg::COUNT],
        }
    }

    /// Architectural reset values. Pure; never touches hardware.
    ///
    /// Translation control and both table bases stay zero: the guest sets up
    /// its own translation regime. The affinity slot comes from the boot
    /// table, the type slot is the fixed implementation identity.
    pub fn reset(vcpu_idx: usize, affinity: &AffinityTable) -> Self {
        let mut file = Self::zeroed();
        file.set(CtxReg::Vmpidr, affinity.mpidr(vcpu_idx));
        file.set(CtxReg::Vpidr, config::RESET_VPIDR);
        file
    }

    /// Read a slot. Total; every `CtxReg` has one.
    #[inline]
    pub fn get(&self, reg: CtxReg) -> u64 {
        self.slots[reg as usize]
    }

    /// Write a slot.
    #[inline]
    pub fn set(&mut self, reg: CtxReg, value: u64) {
        self.slots[reg as usize] = value;
    }

    /// Make this file resident: write every slot plus the exception-return
    /// pair into hardware, then reprogram the two residency-scoped control
    /// registers (guest debug/trace visibility, intercepted access classes).
    ///
    /// Consumes the snapshot; the returned guard is the only way back.
    /// Must only run while no other context is resident on this core, which
    /// the caller's slot type enforces.
    pub fn load<H: HwAccess>(self, hw: &mut H, regs: &ExceptionRegs) -> ResidentContext {
        for reg in CtxReg::ALL {
            hw.write(reg.hw(), self.get(reg));
        }
        hw.write(SysReg::ElrEl2, regs.pc);
        hw.write(SysReg::SpsrEl2, regs.pstate);

        hw.write(SysReg::MdcrEl2, mdcr::GUEST);
        hw.write(SysReg::HstrEl2, hstr::GUEST);

        ResidentContext { _resident: () }
    }
}

impl ResidentContext {
    /// Read the resident file back out of hardware, including the
    /// exception-return pair, and return the passive snapshot.
    pub fn save<H: HwAccess>(self, hw: &mut H, regs: &mut ExceptionRegs) -> SysRegFile {
        let mut file = SysRegFile::zeroed();
        for reg in CtxReg::ALL {
            file.set(reg, hw.read(reg.hw()));
        }
        regs.pc = hw.read(SysReg::ElrEl2);
        regs.pstate = hw.read(SysReg::SpsrEl2);
        file
    }
}
