//! Ironvisor - VCPU core for an ARMv8-A VHE Type-1 Hypervisor
//!
//! This crate is the register-context and world-switch core of a type-1,
//! hardware-assisted hypervisor: it multiplexes one physical core across
//! several guest virtual machines by saving and restoring CPU and
//! system-register state, and by programming the hardware trap configuration
//! that decides which guest operations run directly and which trap to the
//! host.
//!
//! It is a linked-in library with no wire protocol or CLI surface. The
//! surrounding hypervisor's scheduler and exception entry code drive it, and
//! the virtual interrupt controller and virtual timer plug in through the
//! contracts in [`subsys`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// Boot-time configuration constants
pub mod config;

// Register identity and the hardware access seam
pub mod regs;

// Guest register context store
pub mod context;

// Hypervisor trap configuration
pub mod trap;

// Per-pCPU affinity table
pub mod affinity;

// VM-side state and the stage-2 translation view
pub mod vm;

// External per-VCPU subsystem contracts
pub mod subsys;

// Capability probe
pub mod probe;

// World-switch engine
pub mod world;

// VCPU lifecycle
pub mod vcpu;

// Re-export the core surface for convenience
pub use probe::{probe, Capabilities, CapabilityError, Feature};
pub use vcpu::{DeinitError, InitError, Vcpu, VcpuId, VcpuState};
pub use world::{HostConfig, RunState, WorldSwitch};

/// Ironvisor version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
