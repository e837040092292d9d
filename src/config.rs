//! Build-time configuration for the VCPU core
//!
//! Fixed platform parameters. Board bring-up populates the runtime tables
//! (see [`crate::affinity`]); everything here is a compile-time constant.

/// Maximum number of physical cores a board configuration may declare.
/// The per-pCPU affinity table is sized to this.
pub const MAX_PCPUS: usize = 8;

/// Fixed implementation identity exposed to guests through the virtualized
/// processor type register (Cortex-A53 r0p4).
pub const RESET_VPIDR: u64 = 0x410F_D034;

/// Physical load address of the preloaded guest device-tree blob, advertised
/// through the boot registers when the `preloaded-dtb` feature is active.
pub const DTB_LOAD_ADDR: u64 = 0x4800_0000;
