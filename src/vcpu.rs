//! VCPU lifecycle management
//!
//! Creation, first-run preparation and teardown of a virtual core: wires the
//! register context store to the external virtual-interrupt-controller and
//! virtual-timer subsystems and keeps the per-VCPU state machine.

use alloc::boxed::Box;

use log::{debug, warn};

use crate::affinity::AffinityTable;
use crate::context::{ExceptionRegs, HostContext, ResidentContext, SysRegFile};
use crate::probe::Capabilities;
use crate::regs::HwAccess;
use crate::subsys::{SubsysError, VicBackend, VicInstance, VtimerBackend, VtimerInstance};
use crate::trap::TrapConfig;
use crate::vm::{VmId, VmRecord};

/// Identity of one virtual core: owning VM plus index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpuId {
    pub vm: VmId,
    pub idx: u16,
}

/// Lifecycle state of a VCPU.
///
/// `Running ⇄ Ready` transitions are driven by the world-switch engine under
/// orchestrator control; everything else by [`Vcpu::init`]/[`Vcpu::deinit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    Uninitialized,
    Ready,
    Running,
    TornDown,
}

/// Per-VCPU creation failure. Recoverable: the orchestrator refuses to start
/// the VM and nothing partially-initialized stays reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    InterruptController(SubsysError),
    Timer(SubsysError),
}

/// Per-VCPU teardown failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeinitError {
    /// The VCPU was already torn down.
    AlreadyTornDown,
    /// One or both subsystems failed to release. Teardown still completed
    /// best-effort: every remaining step ran.
    Subsystem {
        timer: Option<SubsysError>,
        intc: Option<SubsysError>,
    },
}

/// The system-register file is either a passive snapshot or resident in
/// hardware; the variant is the `loaded` flag.
enum ContextSlot {
    Saved(SysRegFile),
    Resident(ResidentContext),
}

/// One virtual core of a VM.
pub struct Vcpu {
    id: VcpuId,
    state: VcpuState,
    /// pCPU this VCPU last ran on.
    last_pcpu: Option<usize>,
    /// Advisory pause flag owned by the orchestrator.
    pub paused: bool,
    /// General-purpose and exception registers.
    pub regs: ExceptionRegs,
    sysregs: ContextSlot,
    /// Guest per-core pointer, carried across the switch by the engine.
    pub(crate) guest_tpidr: u64,
    /// Host mirror restored when this VCPU stops running.
    pub(crate) host_ctx: HostContext,
    /// Cached trap-configuration word and one-shot modifiers.
    pub trap: TrapConfig,
    vic: Option<Box<dyn VicInstance>>,
    timer: Option<Box<dyn VtimerInstance>>,
}

impl Vcpu {
    pub fn new(id: VcpuId) -> Self {
        Self {
            id,
            state: VcpuState::Uninitialized,
            last_pcpu: None,
            paused: false,
            regs: ExceptionRegs::zeroed(),
            sysregs: ContextSlot::Saved(SysRegFile::zeroed()),
            guest_tpidr: 0,
            host_ctx: HostContext::zeroed(),
            trap: TrapConfig::new(),
            vic: None,
            timer: None,
        }
    }

    pub fn id(&self) -> VcpuId {
        self.id
    }

    pub fn state(&self) -> VcpuState {
        self.state
    }

    pub fn last_pcpu(&self) -> Option<usize> {
        self.last_pcpu
    }

    /// Whether the system-register file currently lives in hardware.
    pub fn loaded(&self) -> bool {
        matches!(self.sysregs, ContextSlot::Resident(_))
    }

    /// Passive snapshot, if not resident. The trap-emulation layer mutates
    /// guest state through here while the VCPU is stopped.
    pub fn sysregs(&self) -> Option<&SysRegFile> {
        match &self.sysregs {
            ContextSlot::Saved(file) => Some(file),
            ContextSlot::Resident(_) => None,
        }
    }

    pub fn sysregs_mut(&mut self) -> Option<&mut SysRegFile> {
        match &mut self.sysregs {
            ContextSlot::Saved(file) => Some(file),
            ContextSlot::Resident(_) => None,
        }
    }

    /// Prepare this VCPU for its first run.
    ///
    /// `caps` is the proof the platform passed the capability probe; without
    /// one no VCPU can be created.
    pub fn init(
        &mut self,
        _caps: &Capabilities,
        vm: &mut VmRecord,
        affinity: &AffinityTable,
        vic: &dyn VicBackend,
        timer: &dyn VtimerBackend,
    ) -> Result<(), InitError> {
        debug_assert!(
            matches!(self.state, VcpuState::Uninitialized),
            "init on a live VCPU"
        );

        // Default trap word; both debug-control mirrors start clear.
        self.trap = TrapConfig::new();
        self.host_ctx = HostContext::zeroed();

        // The first VCPU of a VM derives the stage-2 words.
        if !vm.translation_ready() {
            vm.derive_translation();
        }

        self.reset_state(vm.entry_point(), affinity);

        // External subsystems. A timer failure must not leak the controller;
        // there is nothing to roll back before it.
        let mut vic_handle = vic.init(self.id).map_err(InitError::InterruptController)?;
        let timer_handle = match timer.init(self.id) {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(ve) = vic_handle.deinit() {
                    warn!(
                        "vcpu {}/{}: controller release failed during init rollback: {:?}",
                        self.id.vm, self.id.idx, ve
                    );
                }
                return Err(InitError::Timer(e));
            }
        };
        self.vic = Some(vic_handle);
        self.timer = Some(timer_handle);

        #[cfg(feature = "preloaded-dtb")]
        self.seed_dtb_registers();

        self.state = VcpuState::Ready;
        debug!("vcpu {}/{} ready", self.id.vm, self.id.idx);
        Ok(())
    }

    /// Architectural reset values. Pure; never touches hardware.
    pub fn reset_state(&mut self, entry: u64, affinity: &AffinityTable) {
        debug_assert!(!self.loaded(), "reset while context is resident");
        self.regs = ExceptionRegs::reset(entry);
        self.sysregs = ContextSlot::Saved(SysRegFile::reset(self.id.idx as usize, affinity));
        self.guest_tpidr = 0;
    }

    /// Guest boot convention: advertise the preloaded device-tree blob
    /// through the boot registers.
    #[cfg(feature = "preloaded-dtb")]
    fn seed_dtb_registers(&mut self) {
        let addr = crate::config::DTB_LOAD_ADDR;
        self.regs.gpr[0] = addr;
        self.regs.gpr[1] = addr;
        self.regs.gpr[20] = addr;
    }

    /// Tear this VCPU down, best-effort: timer, then interrupt controller,
    /// then the register context, attempting every step regardless of
    /// earlier failures.
    pub fn deinit(&mut self) -> Result<(), DeinitError> {
        if matches!(self.state, VcpuState::TornDown) {
            return Err(DeinitError::AlreadyTornDown);
        }
        debug_assert!(!self.loaded(), "deinit while context is resident");

        let timer_err = match self.timer.take() {
            Some(mut timer) => timer.deinit().err(),
            None => None,
        };
        let intc_err = match self.vic.take() {
            Some(mut vic) => vic.deinit().err(),
            None => None,
        };

        self.regs = ExceptionRegs::zeroed();
        self.sysregs = ContextSlot::Saved(SysRegFile::zeroed());
        self.guest_tpidr = 0;
        self.host_ctx = HostContext::zeroed();
        self.trap = TrapConfig::new();
        self.state = VcpuState::TornDown;

        if timer_err.is_some() || intc_err.is_some() {
            warn!(
                "vcpu {}/{} torn down with subsystem errors (timer {:?}, intc {:?})",
                self.id.vm, self.id.idx, timer_err, intc_err
            );
            return Err(DeinitError::Subsystem {
                timer: timer_err,
                intc: intc_err,
            });
        }
        debug!("vcpu {}/{} torn down", self.id.vm, self.id.idx);
        Ok(())
    }

    /// Context-load bundle: system registers, then the interrupt controller,
    /// then the timer.
    pub fn context_load<H: HwAccess>(&mut self, hw: &mut H) {
        self.load_sysregs(hw);
        if let Some(vic) = self.vic.as_mut() {
            vic.load();
        }
        if let Some(timer) = self.timer.as_mut() {
            timer.load();
        }
    }

    /// Context-save bundle: timer, then the interrupt controller, then the
    /// system registers.
    pub fn context_save<H: HwAccess>(&mut self, hw: &mut H) {
        if let Some(timer) = self.timer.as_mut() {
            timer.save();
        }
        if let Some(vic) = self.vic.as_mut() {
            vic.save();
        }
        self.save_sysregs(hw);
    }

    /// Make the system-register file resident. Must only run while no
    /// context is resident on this core.
    pub fn load_sysregs<H: HwAccess>(&mut self, hw: &mut H) {
        let slot = core::mem::replace(&mut self.sysregs, ContextSlot::Saved(SysRegFile::zeroed()));
        self.sysregs = match slot {
            ContextSlot::Saved(file) => ContextSlot::Resident(file.load(hw, &self.regs)),
            resident @ ContextSlot::Resident(_) => {
                debug_assert!(false, "context load while already resident");
                resident
            }
        };
    }

    /// Read the resident file back into the snapshot. Must only run while
    /// this VCPU's context is the one resident.
    pub fn save_sysregs<H: HwAccess>(&mut self, hw: &mut H) {
        let slot = core::mem::replace(&mut self.sysregs, ContextSlot::Saved(SysRegFile::zeroed()));
        self.sysregs = match slot {
            ContextSlot::Resident(guard) => ContextSlot::Saved(guard.save(hw, &mut self.regs)),
            saved @ ContextSlot::Saved(_) => {
                debug_assert!(false, "context save while not resident");
                saved
            }
        };
    }

    pub(crate) fn note_entered(&mut self, pcpu: usize) {
        debug_assert!(matches!(self.state, VcpuState::Ready), "entered a VCPU that was not ready");
        self.last_pcpu = Some(pcpu);
        self.state = VcpuState::Running;
    }

    pub(crate) fn note_exited(&mut self) {
        debug_assert!(matches!(self.state, VcpuState::Running));
        self.state = VcpuState::Ready;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{probe, HwFeatureSource, IntcGeneration};
    use crate::regs::fake::FakeHw;
    use crate::regs::SysReg;
    use crate::vm::VmConfig;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::vec::Vec;

    #[derive(Default)]
    struct SubsysLog {
        events: RefCell<Vec<&'static str>>,
    }

    impl SubsysLog {
        fn record(&self, event: &'static str) {
            self.events.borrow_mut().push(event);
        }
        fn events(&self) -> Vec<&'static str> {
            self.events.borrow().clone()
        }
    }

    struct MockVic {
        log: Rc<SubsysLog>,
        fail_deinit: bool,
    }

    impl VicInstance for MockVic {
        fn save(&mut self) {
            self.log.record("vic_save");
        }
        fn load(&mut self) {
            self.log.record("vic_load");
        }
        fn deinit(&mut self) -> Result<(), SubsysError> {
            self.log.record("vic_deinit");
            if self.fail_deinit {
                Err(SubsysError::Busy)
            } else {
                Ok(())
            }
        }
    }

    struct MockVicBackend {
        log: Rc<SubsysLog>,
        fail_init: bool,
        fail_deinit: bool,
    }

    impl VicBackend for MockVicBackend {
        fn init(&self, _vcpu: VcpuId) -> Result<Box<dyn VicInstance>, SubsysError> {
            if self.fail_init {
                return Err(SubsysError::OutOfMemory);
            }
            self.log.record("vic_init");
            Ok(Box::new(MockVic {
                log: self.log.clone(),
                fail_deinit: self.fail_deinit,
            }))
        }
    }

    struct MockTimer {
        log: Rc<SubsysLog>,
        fail_deinit: bool,
    }

    impl VtimerInstance for MockTimer {
        fn save(&mut self) {
            self.log.record("timer_save");
        }
        fn load(&mut self) {
            self.log.record("timer_load");
        }
        fn deinit(&mut self) -> Result<(), SubsysError> {
            self.log.record("timer_deinit");
            if self.fail_deinit {
                Err(SubsysError::Busy)
            } else {
                Ok(())
            }
        }
    }

    struct MockTimerBackend {
        log: Rc<SubsysLog>,
        fail_init: bool,
        fail_deinit: bool,
    }

    impl VtimerBackend for MockTimerBackend {
        fn init(&self, _vcpu: VcpuId) -> Result<Box<dyn VtimerInstance>, SubsysError> {
            if self.fail_init {
                return Err(SubsysError::Unavailable);
            }
            self.log.record("timer_init");
            Ok(Box::new(MockTimer {
                log: self.log.clone(),
                fail_deinit: self.fail_deinit,
            }))
        }
    }

    fn caps() -> Capabilities {
        let mut hw = FakeHw::new();
        hw.set(SysReg::IdAa64Pfr0El1, 0x1 << 8);
        hw.set(SysReg::IdAa64Mmfr1El1, 0x1 << 8);
        let mut src = HwFeatureSource {
            hw,
            intc: IntcGeneration::V3,
        };
        probe(&mut src).unwrap()
    }

    fn vm() -> VmRecord {
        VmRecord::new(
            1,
            VmConfig {
                entry_point: 0x4020_0000,
                stage2_table_base: 0x8000_0000,
                ipa_bits: 40,
                extended_pa: false,
            },
        )
    }

    fn backends(log: &Rc<SubsysLog>) -> (MockVicBackend, MockTimerBackend) {
        (
            MockVicBackend {
                log: log.clone(),
                fail_init: false,
                fail_deinit: false,
            },
            MockTimerBackend {
                log: log.clone(),
                fail_init: false,
                fail_deinit: false,
            },
        )
    }

    #[test]
    fn test_init_reaches_ready() {
        let log = Rc::new(SubsysLog::default());
        let (vic, timer) = backends(&log);
        let caps = caps();
        let mut vm = vm();
        let affinity = AffinityTable::identity(2);

        let mut vcpu = Vcpu::new(VcpuId { vm: 1, idx: 0 });
        vcpu.init(&caps, &mut vm, &affinity, &vic, &timer).unwrap();

        assert_eq!(vcpu.state(), VcpuState::Ready);
        assert!(!vcpu.loaded());
        assert!(vm.translation_ready());
        assert_eq!(vcpu.regs.pc, 0x4020_0000);
        assert_eq!(log.events(), ["vic_init", "timer_init"]);
    }

    #[test]
    fn test_timer_failure_releases_controller() {
        // Injected timer-allocation failure: the controller instance must be
        // released before init returns its error.
        let log = Rc::new(SubsysLog::default());
        let (vic, mut timer) = backends(&log);
        timer.fail_init = true;
        let caps = caps();
        let mut vm = vm();
        let affinity = AffinityTable::identity(2);

        let mut vcpu = Vcpu::new(VcpuId { vm: 1, idx: 0 });
        let err = vcpu
            .init(&caps, &mut vm, &affinity, &vic, &timer)
            .unwrap_err();

        assert_eq!(err, InitError::Timer(SubsysError::Unavailable));
        assert_eq!(log.events(), ["vic_init", "vic_deinit"]);
        assert_eq!(vcpu.state(), VcpuState::Uninitialized);
    }

    #[test]
    fn test_controller_failure_aborts_first() {
        let log = Rc::new(SubsysLog::default());
        let (mut vic, timer) = backends(&log);
        vic.fail_init = true;
        let caps = caps();
        let mut vm = vm();
        let affinity = AffinityTable::identity(2);

        let mut vcpu = Vcpu::new(VcpuId { vm: 1, idx: 0 });
        let err = vcpu
            .init(&caps, &mut vm, &affinity, &vic, &timer)
            .unwrap_err();

        assert_eq!(err, InitError::InterruptController(SubsysError::OutOfMemory));
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_deinit_is_best_effort() {
        // A timer teardown failure must not leak the controller or skip the
        // register zeroing.
        let log = Rc::new(SubsysLog::default());
        let (vic, mut timer) = backends(&log);
        timer.fail_deinit = true;
        let caps = caps();
        let mut vm = vm();
        let affinity = AffinityTable::identity(2);

        let mut vcpu = Vcpu::new(VcpuId { vm: 1, idx: 0 });
        vcpu.init(&caps, &mut vm, &affinity, &vic, &timer).unwrap();
        vcpu.regs.gpr[5] = 0x1234;

        let err = vcpu.deinit().unwrap_err();
        assert_eq!(
            err,
            DeinitError::Subsystem {
                timer: Some(SubsysError::Busy),
                intc: None,
            }
        );
        assert_eq!(
            log.events(),
            ["vic_init", "timer_init", "timer_deinit", "vic_deinit"]
        );
        assert_eq!(vcpu.state(), VcpuState::TornDown);
        assert_eq!(vcpu.regs.gpr[5], 0);
    }

    #[test]
    fn test_second_deinit_reports_torn_down() {
        let log = Rc::new(SubsysLog::default());
        let (vic, timer) = backends(&log);
        let caps = caps();
        let mut vm = vm();
        let affinity = AffinityTable::identity(2);

        let mut vcpu = Vcpu::new(VcpuId { vm: 1, idx: 0 });
        vcpu.init(&caps, &mut vm, &affinity, &vic, &timer).unwrap();

        assert!(vcpu.deinit().is_ok());
        assert_eq!(vcpu.deinit().unwrap_err(), DeinitError::AlreadyTornDown);
        // Subsystems were only torn down once
        assert_eq!(
            log.events(),
            ["vic_init", "timer_init", "timer_deinit", "vic_deinit"]
        );
    }

    #[test]
    fn test_translation_derived_for_first_vcpu_only() {
        let log = Rc::new(SubsysLog::default());
        let (vic, timer) = backends(&log);
        let caps = caps();
        let mut vm = vm();
        let affinity = AffinityTable::identity(2);

        let mut first = Vcpu::new(VcpuId { vm: 1, idx: 0 });
        first.init(&caps, &mut vm, &affinity, &vic, &timer).unwrap();
        let derived = (crate::vm::VmTranslation::vtcr(&vm), crate::vm::VmTranslation::vttbr(&vm));

        let mut second = Vcpu::new(VcpuId { vm: 1, idx: 1 });
        second.init(&caps, &mut vm, &affinity, &vic, &timer).unwrap();
        assert_eq!(
            (crate::vm::VmTranslation::vtcr(&vm), crate::vm::VmTranslation::vttbr(&vm)),
            derived
        );
    }

    #[test]
    fn test_context_bundle_order() {
        let log = Rc::new(SubsysLog::default());
        let (vic, timer) = backends(&log);
        let caps = caps();
        let mut vm = vm();
        let affinity = AffinityTable::identity(2);

        let mut vcpu = Vcpu::new(VcpuId { vm: 1, idx: 0 });
        vcpu.init(&caps, &mut vm, &affinity, &vic, &timer).unwrap();

        let mut hw = FakeHw::new();
        vcpu.context_load(&mut hw);
        assert!(vcpu.loaded());
        vcpu.context_save(&mut hw);
        assert!(!vcpu.loaded());

        assert_eq!(
            log.events(),
            [
                "vic_init",
                "timer_init",
                "vic_load",
                "timer_load",
                "timer_save",
                "vic_save"
            ]
        );
    }

    #[test]
    fn test_sysregs_inaccessible_while_resident() {
        let log = Rc::new(SubsysLog::default());
        let (vic, timer) = backends(&log);
        let caps = caps();
        let mut vm = vm();
        let affinity = AffinityTable::identity(2);

        let mut vcpu = Vcpu::new(VcpuId { vm: 1, idx: 0 });
        vcpu.init(&caps, &mut vm, &affinity, &vic, &timer).unwrap();
        assert!(vcpu.sysregs().is_some());

        let mut hw = FakeHw::new();
        vcpu.load_sysregs(&mut hw);
        assert!(vcpu.loaded());
        assert!(vcpu.sysregs().is_none());

        vcpu.save_sysregs(&mut hw);
        assert!(vcpu.sysregs().is_some());
    }

    #[cfg(feature = "preloaded-dtb")]
    #[test]
    fn test_dtb_boot_registers_seeded() {
        let log = Rc::new(SubsysLog::default());
        let (vic, timer) = backends(&log);
        let caps = caps();
        let mut vm = vm();
        let affinity = AffinityTable::identity(2);

        let mut vcpu = Vcpu::new(VcpuId { vm: 1, idx: 0 });
        vcpu.init(&caps, &mut vm, &affinity, &vic, &timer).unwrap();

        assert_eq!(vcpu.regs.gpr[0], crate::config::DTB_LOAD_ADDR);
        assert_eq!(vcpu.regs.gpr[1], crate::config::DTB_LOAD_ADDR);
        assert_eq!(vcpu.regs.gpr[20], crate::config::DTB_LOAD_ADDR);
    }
}
