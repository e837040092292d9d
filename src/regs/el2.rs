//! EL2 hardware register backend
//!
//! Maps each enumerated register to its `mrs`/`msr` pair. Must only be used
//! while executing at EL2; the register accesses themselves cannot fault
//! when that holds.

use aarch64_cpu::asm::barrier;
use aarch64_cpu::registers::{ID_AA64MMFR1_EL1, ID_AA64PFR0_EL1};
use tock_registers::interfaces::Readable;

use super::{HwAccess, SysReg};

macro_rules! mrs {
    ($name:literal) => {{
        let value: u64;
        unsafe {
            core::arch::asm!(
                concat!("mrs {value}, ", $name),
                value = out(reg) value,
                options(nomem, nostack),
            );
        }
        value
    }};
}

macro_rules! msr {
    ($name:literal, $value:expr) => {{
        unsafe {
            core::arch::asm!(
                concat!("msr ", $name, ", {value}"),
                value = in(reg) $value,
                options(nomem, nostack),
            );
        }
    }};
}

/// Register backend for the physical EL2.
pub struct El2;

impl HwAccess for El2 {
    fn read(&mut self, reg: SysReg) -> u64 {
        match reg {
            SysReg::SctlrEl1 => mrs!("sctlr_el1"),
            SysReg::ActlrEl1 => mrs!("actlr_el1"),
            SysReg::CpacrEl1 => mrs!("cpacr_el1"),
            SysReg::Ttbr0El1 => mrs!("ttbr0_el1"),
            SysReg::Ttbr1El1 => mrs!("ttbr1_el1"),
            SysReg::TcrEl1 => mrs!("tcr_el1"),
            SysReg::EsrEl1 => mrs!("esr_el1"),
            SysReg::FarEl1 => mrs!("far_el1"),
            SysReg::ParEl1 => mrs!("par_el1"),
            SysReg::MairEl1 => mrs!("mair_el1"),
            SysReg::AmairEl1 => mrs!("amair_el1"),
            SysReg::VbarEl1 => mrs!("vbar_el1"),
            SysReg::ContextidrEl1 => mrs!("contextidr_el1"),
            SysReg::TpidrEl0 => mrs!("tpidr_el0"),
            SysReg::TpidrroEl0 => mrs!("tpidrro_el0"),
            SysReg::TpidrEl1 => mrs!("tpidr_el1"),
            SysReg::SpEl0 => mrs!("sp_el0"),
            SysReg::SpEl1 => mrs!("sp_el1"),
            SysReg::ElrEl1 => mrs!("elr_el1"),
            SysReg::SpsrEl1 => mrs!("spsr_el1"),
            SysReg::MdscrEl1 => mrs!("mdscr_el1"),
            SysReg::CntkctlEl1 => mrs!("cntkctl_el1"),
            SysReg::VmpidrEl2 => mrs!("vmpidr_el2"),
            SysReg::VpidrEl2 => mrs!("vpidr_el2"),
            SysReg::TpidrEl2 => mrs!("tpidr_el2"),
            SysReg::ElrEl2 => mrs!("elr_el2"),
            SysReg::SpsrEl2 => mrs!("spsr_el2"),
            SysReg::HcrEl2 => mrs!("hcr_el2"),
            SysReg::CptrEl2 => mrs!("cptr_el2"),
            SysReg::MdcrEl2 => mrs!("mdcr_el2"),
            SysReg::HstrEl2 => mrs!("hstr_el2"),
            SysReg::VbarEl2 => mrs!("vbar_el2"),
            SysReg::VtcrEl2 => mrs!("vtcr_el2"),
            SysReg::VttbrEl2 => mrs!("vttbr_el2"),
            // ICH_HCR_EL2 by encoding; assemblers disagree on the name
            SysReg::IchHcrEl2 => mrs!("S3_4_C12_C11_0"),
            SysReg::IdAa64Pfr0El1 => ID_AA64PFR0_EL1.get(),
            SysReg::IdAa64Mmfr1El1 => ID_AA64MMFR1_EL1.get(),
        }
    }

    fn write(&mut self, reg: SysReg, value: u64) {
        match reg {
            SysReg::SctlrEl1 => msr!("sctlr_el1", value),
            SysReg::ActlrEl1 => msr!("actlr_el1", value),
            SysReg::CpacrEl1 => msr!("cpacr_el1", value),
            SysReg::Ttbr0El1 => msr!("ttbr0_el1", value),
            SysReg::Ttbr1El1 => msr!("ttbr1_el1", value),
            SysReg::TcrEl1 => msr!("tcr_el1", value),
            SysReg::EsrEl1 => msr!("esr_el1", value),
            SysReg::FarEl1 => msr!("far_el1", value),
            SysReg::ParEl1 => msr!("par_el1", value),
            SysReg::MairEl1 => msr!("mair_el1", value),
            SysReg::AmairEl1 => msr!("amair_el1", value),
            SysReg::VbarEl1 => msr!("vbar_el1", value),
            SysReg::ContextidrEl1 => msr!("contextidr_el1", value),
            SysReg::TpidrEl0 => msr!("tpidr_el0", value),
            SysReg::TpidrroEl0 => msr!("tpidrro_el0", value),
            SysReg::TpidrEl1 => msr!("tpidr_el1", value),
            SysReg::SpEl0 => msr!("sp_el0", value),
            SysReg::SpEl1 => msr!("sp_el1", value),
            SysReg::ElrEl1 => msr!("elr_el1", value),
            SysReg::SpsrEl1 => msr!("spsr_el1", value),
            SysReg::MdscrEl1 => msr!("mdscr_el1", value),
            SysReg::CntkctlEl1 => msr!("cntkctl_el1", value),
            SysReg::VmpidrEl2 => msr!("vmpidr_el2", value),
            SysReg::VpidrEl2 => msr!("vpidr_el2", value),
            SysReg::TpidrEl2 => msr!("tpidr_el2", value),
            SysReg::ElrEl2 => msr!("elr_el2", value),
            SysReg::SpsrEl2 => msr!("spsr_el2", value),
            SysReg::HcrEl2 => msr!("hcr_el2", value),
            SysReg::CptrEl2 => msr!("cptr_el2", value),
            SysReg::MdcrEl2 => msr!("mdcr_el2", value),
            SysReg::HstrEl2 => msr!("hstr_el2", value),
            SysReg::VbarEl2 => msr!("vbar_el2", value),
            SysReg::VtcrEl2 => msr!("vtcr_el2", value),
            SysReg::VttbrEl2 => msr!("vttbr_el2", value),
            SysReg::IchHcrEl2 => msr!("S3_4_C12_C11_0", value),
            // ID registers are read-only
            SysReg::IdAa64Pfr0El1 | SysReg::IdAa64Mmfr1El1 => {}
        }
    }

    fn isb(&mut self) {
        barrier::isb(barrier::SY);
    }
}
