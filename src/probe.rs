//! Boot-time capability probe
//!
//! One-shot, process-wide check that the hardware virtualization mode this
//! core depends on is actually present. Runs once before any VM exists;
//! idempotent, and has no side effects on failure.

use log::info;

use crate::regs::{HwAccess, SysReg};

/// Capabilities the probe may find missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// EL2 or the virtualization host extensions
    Hypervisor,
    /// A supported interrupt-controller generation
    InterruptController,
}

/// Fatal probe failure; the hypervisor must not create any VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityError {
    Unsupported(Feature),
}

/// Interrupt-controller generations this build can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntcGeneration {
    V2,
    V3,
    Unknown,
}

/// Where the probe reads its feature state from.
pub trait FeatureSource {
    /// Processor feature register 0 image (EL2 field at bits 11:8).
    fn pfr0(&mut self) -> u64;
    /// Memory model feature register 1 image (VHE field at bits 11:8).
    fn mmfr1(&mut self) -> u64;
    /// Generation of the interrupt controller present on this platform.
    fn intc_generation(&mut self) -> IntcGeneration;
}

/// Feature source backed by a hardware register bank.
pub struct HwFeatureSource<H: HwAccess> {
    pub hw: H,
    pub intc: IntcGeneration,
}

impl<H: HwAccess> FeatureSource for HwFeatureSource<H> {
    fn pfr0(&mut self) -> u64 {
        self.hw.read(SysReg::IdAa64Pfr0El1)
    }

    fn mmfr1(&mut self) -> u64 {
        self.hw.read(SysReg::IdAa64Mmfr1El1)
    }

    fn intc_generation(&mut self) -> IntcGeneration {
        self.intc
    }
}

/// Proof that the platform supports the virtualization mode this core needs.
///
/// Only [`probe`] constructs one, and every VCPU initialization demands a
/// reference to it, so no VCPU can exist on an unsupported platform.
#[derive(Debug)]
pub struct Capabilities {
    intc: IntcGeneration,
    _sealed: (),
}

impl Capabilities {
    /// The interrupt-controller generation the platform carries.
    pub fn intc_generation(&self) -> IntcGeneration {
        self.intc
    }
}

const PFR0_EL2_SHIFT: u32 = 8;
const MMFR1_VH_SHIFT: u32 = 8;

/// Check the platform for EL2 with the virtualization host extensions and a
/// supported interrupt-controller generation, in that order.
pub fn probe(src: &mut impl FeatureSource) -> Result<Capabilities, CapabilityError> {
    let el2 = (src.pfr0() >> PFR0_EL2_SHIFT) & 0xF;
    let vh = (src.mmfr1() >> MMFR1_VH_SHIFT) & 0xF;
    if el2 == 0 || vh == 0 {
        return Err(CapabilityError::Unsupported(Feature::Hypervisor));
    }

    let intc = src.intc_generation();
    let supported = match intc {
        IntcGeneration::V2 => cfg!(feature = "gicv2"),
        IntcGeneration::V3 => cfg!(feature = "gicv3"),
        IntcGeneration::Unknown => false,
    };
    if !supported {
        return Err(CapabilityError::Unsupported(Feature::InterruptController));
    }

    info!(
        "virtualization host extensions present, interrupt controller {:?}",
        intc
    );
    Ok(Capabilities {
        intc,
        _sealed: (),
    })
}
