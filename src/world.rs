//! World-switch engine
//!
//! Moves one physical core between host execution and a guest VCPU. The
//! step order below is load-bearing: the translation regime and trap
//! configuration must be in place before any guest instruction can execute,
//! and restored to host values before any host instruction other than this
//! code runs. The caller masks interrupts around both transitions.
//!
//! A full scheduling slice nests the context bundles inside the switch:
//! `enter_guest`, context load, guest execution, context save, `exit_guest`.
//! The engine thus captures the host mirrors before the load bundle
//! reprograms them, and restores them after the save bundle has drained.

use crate::regs::{HwAccess, SysReg};
use crate::trap::{cptr, ich_hcr, Hcr};
use crate::vcpu::{Vcpu, VcpuId};
use crate::vm::VmTranslation;

/// Fixed per-pCPU host parameters.
#[derive(Debug, Clone, Copy)]
pub struct HostConfig {
    /// Host exception vector table base.
    pub host_vectors: u64,
    /// Guest-entry exception vector table base.
    pub guest_vectors: u64,
}

/// Execution state of one physical core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    HostRunning,
    GuestRunning(VcpuId),
}

/// Per-pCPU world-switch engine.
///
/// Synchronous and non-reentrant; exactly one VCPU's context may be resident
/// on the core at a time, and the state machine tracks which.
pub struct WorldSwitch {
    pcpu: usize,
    host: HostConfig,
    state: RunState,
}

impl WorldSwitch {
    pub const fn new(pcpu: usize, host: HostConfig) -> Self {
        Self {
            pcpu,
            host,
            state: RunState::HostRunning,
        }
    }

    pub fn pcpu(&self) -> usize {
        self.pcpu
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// `HostRunning -> GuestRunning`: arm the core so the next privilege
    /// drop lands in the guest exactly where it last exited.
    pub fn enter_guest<H: HwAccess>(
        &mut self,
        hw: &mut H,
        vcpu: &mut Vcpu,
        vm: &impl VmTranslation,
    ) {
        debug_assert_eq!(
            self.state,
            RunState::HostRunning,
            "enter_guest while a guest is resident"
        );

        // Mirror the host state guest execution will disturb.
        vcpu.host_ctx.spsr = hw.read(SysReg::SpsrEl2);
        vcpu.host_ctx.mdcr = hw.read(SysReg::MdcrEl2);

        // Stage-2 translation regime; the barrier makes it visible before
        // any guest instruction can execute.
        hw.write(SysReg::VtcrEl2, vm.vtcr());
        hw.write(SysReg::VttbrEl2, vm.vttbr());
        hw.isb();

        // Trap configuration and the guest-entry vectors.
        hw.write(SysReg::HcrEl2, vcpu.trap.hcr.bits());
        hw.write(SysReg::CptrEl2, cptr::GUEST);
        hw.write(SysReg::VbarEl2, self.host.guest_vectors);

        // The per-core pointer crosses the switch unmodified.
        vcpu.host_ctx.tpidr = hw.read(SysReg::TpidrEl2);
        hw.write(SysReg::TpidrEl2, vcpu.guest_tpidr);

        // Exception-return target: the guest's resumption point.
        hw.write(SysReg::ElrEl2, vcpu.regs.pc);
        hw.write(SysReg::SpsrEl2, vcpu.regs.pstate);

        // The guest's interrupt state machine starts with the underflow
        // latch clear.
        let ich = hw.read(SysReg::IchHcrEl2);
        hw.write(SysReg::IchHcrEl2, ich & !ich_hcr::UIE);

        vcpu.note_entered(self.pcpu);
        self.state = RunState::GuestRunning(vcpu.id());
    }

    /// `GuestRunning -> HostRunning`: capture the guest's new resumption
    /// point and put the core back exactly as the host left it.
    pub fn exit_guest<H: HwAccess>(
        &mut self,
        hw: &mut H,
        vcpu: &mut Vcpu,
        vm: &mut impl VmTranslation,
    ) {
        debug_assert_eq!(
            self.state,
            RunState::GuestRunning(vcpu.id()),
            "exit_guest for a VCPU that is not resident"
        );

        // The guest's new resumption point; the host per-core pointer back.
        vcpu.guest_tpidr = hw.read(SysReg::TpidrEl2);
        vcpu.regs.pc = hw.read(SysReg::ElrEl2);
        vcpu.regs.pstate = hw.read(SysReg::SpsrEl2);
        hw.write(SysReg::TpidrEl2, vcpu.host_ctx.tpidr);

        // Underflow latch set again: tells the controller's save routine
        // the guest exited normally.
        let ich = hw.read(SysReg::IchHcrEl2);
        hw.write(SysReg::IchHcrEl2, ich | ich_hcr::UIE);

        // A queued virtual SError may have been delivered while the guest
        // ran; the hardware word is authoritative then.
        if vcpu.trap.pending_vserror {
            vcpu.trap.hcr = Hcr::from_bits_retain(hw.read(SysReg::HcrEl2));
            vcpu.trap.pending_vserror = false;
        }

        // Host trap configuration and vectors before any other host code.
        hw.write(SysReg::HcrEl2, Hcr::HOST.bits());
        hw.write(SysReg::CptrEl2, cptr::HOST);
        hw.write(SysReg::VbarEl2, self.host.host_vectors);

        // Defensive read-back of the stage-2 words.
        let vtcr = hw.read(SysReg::VtcrEl2);
        let vttbr = hw.read(SysReg::VttbrEl2);
        vm.store_translation(vtcr, vttbr);
        hw.isb();

        // Host mirrors captured on entry.
        hw.write(SysReg::SpsrEl2, vcpu.host_ctx.spsr);
        hw.write(SysReg::MdcrEl2, vcpu.host_ctx.mdcr);

        vcpu.note_exited();
        self.state = RunState::HostRunning;
    }
}
