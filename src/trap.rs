//! Hypervisor trap configuration
//!
//! The per-VCPU trap-configuration word with its one-shot modifier flags,
//! plus the fixed control values programmed around guest residency.

use bitflags::bitflags;

bitflags! {
    /// Hypervisor configuration (HCR_EL2) bits used by this core.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Hcr: u64 {
        /// Stage-2 translation enable
        const VM = 1 << 0;
        /// Set/way invalidation override
        const SWIO = 1 << 1;
        /// Physical FIQ routing to EL2
        const FMO = 1 << 3;
        /// Physical IRQ routing to EL2
        const IMO = 1 << 4;
        /// Physical SError routing to EL2
        const AMO = 1 << 5;
        /// Virtual FIQ pending
        const VF = 1 << 6;
        /// Virtual IRQ pending
        const VI = 1 << 7;
        /// Virtual SError pending; self-clears on delivery
        const VSE = 1 << 8;
        /// Trap WFI
        const TWI = 1 << 13;
        /// Trap WFE
        const TWE = 1 << 14;
        /// Trap SMC
        const TSC = 1 << 19;
        /// Trap auxiliary control registers
        const TACR = 1 << 21;
        /// Trap virtual memory controls
        const TVM = 1 << 26;
        /// Route general exceptions to EL2
        const TGE = 1 << 27;
        /// EL1 is AArch64
        const RW = 1 << 31;
        /// EL2 hosts the kernel (VHE)
        const E2H = 1 << 34;
    }
}

impl Hcr {
    /// Default guest configuration: stage-2 on, 64-bit EL1, the core's
    /// physical interrupt sources virtualized, SMC trapped.
    pub const GUEST_DEFAULT: Hcr = Hcr::VM
        .union(Hcr::RW)
        .union(Hcr::IMO)
        .union(Hcr::FMO)
        .union(Hcr::AMO)
        .union(Hcr::TSC);

    /// Fixed host configuration restored on every guest exit: the host
    /// kernel runs at EL2 with its native register set.
    pub const HOST: Hcr = Hcr::RW.union(Hcr::E2H).union(Hcr::TGE);
}

/// Architectural feature trap (CPTR_EL2) values.
pub mod cptr {
    /// Trap FP/SIMD accesses
    pub const TFP: u64 = 1 << 10;
    /// Trap trace register accesses
    pub const TTA: u64 = 1 << 20;

    /// While a guest runs: trace registers trapped, lazy FP/SIMD sharing
    /// with the host disabled.
    pub const GUEST: u64 = TTA | TFP;
    /// Host value: no traps.
    pub const HOST: u64 = 0;
}

/// Hypervisor debug control (MDCR_EL2) values.
pub mod mdcr {
    /// Trap PMCR accesses
    pub const TPMCR: u64 = 1 << 5;
    /// Trap performance monitor accesses
    pub const TPM: u64 = 1 << 6;
    /// Trap debug register accesses
    pub const TDA: u64 = 1 << 9;
    /// Trap OS lock/double-lock registers
    pub const TDOSA: u64 = 1 << 10;
    /// Trap debug ROM address registers
    pub const TDRA: u64 = 1 << 11;

    /// Programmed on context load: guest debug and trace visibility is
    /// restricted to its own state.
    pub const GUEST: u64 = TDRA | TDOSA | TDA | TPM | TPMCR;
}

/// CP15 trap control (HSTR_EL2) values.
pub mod hstr {
    /// Trap accesses to the implementation-defined c15 space
    pub const T15: u64 = 1 << 15;

    /// Programmed on context load.
    pub const GUEST: u64 = T15;
}

/// Virtual interrupt front-end control (ICH_HCR_EL2) bits.
pub mod ich_hcr {
    /// Virtual CPU interface enable
    pub const EN: u64 = 1 << 0;
    /// Underflow maintenance-interrupt latch; cleared across guest entry,
    /// set again on a normal exit for the controller's save routine
    pub const UIE: u64 = 1 << 1;
}

/// Cached trap-configuration word plus its one-shot modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapConfig {
    /// HCR_EL2 image programmed on guest entry.
    pub hcr: Hcr,
    /// A virtual SError is queued; after the next exit the hardware word is
    /// authoritative, because the pending bit self-clears on delivery.
    pub pending_vserror: bool,
}

impl TrapConfig {
    pub const fn new() -> Self {
        Self {
            hcr: Hcr::GUEST_DEFAULT,
            pending_vserror: false,
        }
    }

    /// Queue a virtual SError for injection on the next guest entry.
    pub fn inject_vserror(&mut self) {
        self.hcr.insert(Hcr::VSE);
        self.pending_vserror = true;
    }
}

impl Default for TrapConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_default_bits() {
        let hcr = Hcr::GUEST_DEFAULT;
        assert!(hcr.contains(Hcr::VM));
        assert!(hcr.contains(Hcr::RW));
        assert!(hcr.contains(Hcr::IMO | Hcr::FMO | Hcr::AMO));
        assert!(!hcr.contains(Hcr::TGE));
        assert!(!hcr.contains(Hcr::VSE));
    }

    #[test]
    fn test_host_value_keeps_host_at_el2() {
        assert!(Hcr::HOST.contains(Hcr::E2H));
        assert!(Hcr::HOST.contains(Hcr::TGE));
        assert!(!Hcr::HOST.contains(Hcr::VM));
    }

    #[test]
    fn test_guest_cptr_traps_trace_and_fp() {
        assert_eq!(cptr::GUEST, (1 << 20) | (1 << 10));
        assert_eq!(cptr::HOST, 0);
    }

    #[test]
    fn test_vserror_injection_sets_one_shot() {
        let mut trap = TrapConfig::new();
        assert!(!trap.pending_vserror);

        trap.inject_vserror();
        assert!(trap.hcr.contains(Hcr::VSE));
        assert!(trap.pending_vserror);
    }
}
