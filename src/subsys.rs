//! External per-VCPU subsystem contracts
//!
//! The virtual interrupt controller and the virtual timer are logically part
//! of a VCPU's identity but implemented elsewhere. This core consumes only
//! their init/deinit/save/load contracts; the returned instances are owned
//! by the VCPU and destroyed with it.

use alloc::boxed::Box;

use crate::vcpu::VcpuId;

/// Failures reported by the external subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsysError {
    /// Allocation failed
    OutOfMemory,
    /// The subsystem is not available on this platform
    Unavailable,
    /// The instance is still in use
    Busy,
    /// The underlying hardware refused the operation
    Hardware,
}

/// One VCPU's virtual-interrupt-controller instance.
pub trait VicInstance {
    /// Capture the controller state after a guest exit.
    fn save(&mut self);
    /// Restore the controller state before a guest entry.
    fn load(&mut self);
    /// Release the instance's resources.
    fn deinit(&mut self) -> Result<(), SubsysError>;
}

/// Allocator for per-VCPU interrupt-controller instances.
pub trait VicBackend {
    fn init(&self, vcpu: VcpuId) -> Result<Box<dyn VicInstance>, SubsysError>;
}

/// One VCPU's virtual-timer instance.
pub trait VtimerInstance {
    /// Capture the timer state after a guest exit.
    fn save(&mut self);
    /// Restore the timer state before a guest entry.
    fn load(&mut self);
    /// Release the instance's resources.
    fn deinit(&mut self) -> Result<(), SubsysError>;
}

/// Allocator for per-VCPU virtual-timer instances.
pub trait VtimerBackend {
    fn init(&self, vcpu: VcpuId) -> Result<Box<dyn VtimerInstance>, SubsysError>;
}
