//! VT-x hypervisor core with EPT split-view memory hooks.
//!
//! Virtualizes the running OS on every logical processor and uses extended
//! page tables to give individual 4 KiB pages two views: instruction fetches
//! see attacker-supplied bytes while reads and writes keep seeing the
//! original contents. The surrounding driver talks to [`Hypervisor`]; the
//! OS services it must supply are described by [`platform::Platform`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cpu;
pub mod entry;
pub mod ept;
pub mod hooks;
pub mod logging;
pub mod msr;
pub mod platform;
pub mod vcpu;
pub mod vm_exit_handlers;
pub mod vmcs;
pub mod vmx;

#[cfg(test)]
mod tests;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use ept::{Ept, MtrrSnapshot, TranslationHint};
use hooks::HookId;
use platform::{Platform, ProcessId};
use spin::Mutex;
use vcpu::VmxState;
use x86_64::{PhysAddr, VirtAddr};

/// CPUID leaf carrying the reserved request cookies.
pub const CPUID_COOKIE_LEAF: u32 = 0x4141_4141;
/// Sub-leaf requesting graceful teardown of the current CPU.
pub const CPUID_COOKIE_DISABLE: u32 = 0x4242_4242;
/// Sub-leaf arming SYSCALL interception on the current CPU.
pub const CPUID_COOKIE_ENABLE_SYSCALL_HOOKS: u32 = 0x4242_4243;

/// Hypervisor vendor leaf; EAX returns [`HYPERVISOR_SIGNATURE`].
pub const CPUID_HYPERVISOR_INTERFACE: u32 = 0x4000_0001;
pub const HYPERVISOR_SIGNATURE: u32 = u32::from_le_bytes(*b"pvhv");
/// "Hypervisor present" bit in CPUID leaf 1 ECX.
pub const CPUID_HV_PRESENT_BIT: u32 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    /// VMX, EPT 2 MiB pages or VPID missing, or VMX disabled by firmware.
    HardwareUnsupported,
    /// VMLAUNCH failed; carries the VM-instruction error.
    LaunchFailed(u32),
    /// A VMX housekeeping instruction (VMXON/VMCLEAR/VMPTRLD) failed.
    VmxInstructionFailed,
    /// Contiguous non-paged memory was not available.
    AllocationFailed,
    /// A virtual address did not resolve to backed physical memory.
    AddressTranslationFailed,
    /// Malformed request: cross-page patch, out-of-range address, unknown
    /// hook id.
    InvalidRequest,
    /// The target process died mid-operation.
    ProcessGone,
    /// The guest hit an EPT misconfiguration; its run was terminated.
    GuestMisconfiguration,
}

/// True when this CPU is executing under our hypervisor.
pub fn is_hypervisor_present() -> bool {
    let features = cpu::cpuid(1, 0);
    if features.ecx & CPUID_HV_PRESENT_BIT == 0 {
        return false;
    }
    cpu::cpuid(CPUID_HYPERVISOR_INTERFACE, 0).eax == HYPERVISOR_SIGNATURE
}

fn is_vmx_supported() -> bool {
    raw_cpuid::CpuId::new()
        .get_feature_info()
        .map(|features| features.has_vmx())
        .unwrap_or(false)
}

fn is_vmx_available() -> bool {
    const LOCK_BIT: u64 = 1 << 0;
    const VMX_OUTSIDE_SMX: u64 = 1 << 2;

    let feature_control = unsafe { cpu::rdmsr(cpu::IA32_FEATURE_CONTROL) };
    feature_control & LOCK_BIT != 0 && feature_control & VMX_OUTSIDE_SMX != 0
}

/// The root object. One instance per system, owned by the driver; all
/// per-CPU state hangs off the index array below.
pub struct Hypervisor {
    platform: &'static dyn Platform,
    ept: Box<Ept>,
    vm_states: Vec<NonNull<VmxState>>,
    resume_on_wake: bool,
}

// The per-CPU pointers are only dereferenced on their owning CPU; everything
// shared goes through the Sync EPT engine.
unsafe impl Send for Hypervisor {}
unsafe impl Sync for Hypervisor {}

impl Hypervisor {
    /// Checks hardware support and allocates all state. Does not virtualize
    /// anything yet; call [`Hypervisor::enable`].
    pub fn new(platform: &'static dyn Platform) -> Result<Self, HypervisorError> {
        if !is_vmx_supported() || !is_vmx_available() {
            return Err(HypervisorError::HardwareUnsupported);
        }

        let ept = Box::new(Ept::new(platform)?);

        let cpu_count = platform.cpu_count();
        let mut vm_states = Vec::with_capacity(cpu_count);
        for _ in 0..cpu_count {
            match unsafe { platform::allocate_object::<VmxState>(platform) } {
                Some(state) => {
                    unsafe { (*state.as_ptr()).ept = &*ept as *const Ept };
                    vm_states.push(state);
                }
                None => {
                    for state in vm_states {
                        unsafe { platform::free_object(platform, state) };
                    }
                    return Err(HypervisorError::AllocationFailed);
                }
            }
        }

        Ok(Self {
            platform,
            ept,
            vm_states,
            resume_on_wake: false,
        })
    }

    /// Virtualizes every logical processor. All-or-nothing: if any CPU fails
    /// the others are rolled back and the error is reported.
    pub fn enable(&mut self) -> Result<(), HypervisorError> {
        let system_directory_table_base = cpu::read_cr3();

        self.ept.initialize(&MtrrSnapshot::capture());
        self.ept.rearm_all()?;

        let failures = AtomicUsize::new(0);
        let first_error: Mutex<Option<HypervisorError>> = Mutex::new(None);

        self.platform.for_each_cpu(&mut || {
            if let Err(error) = self.enable_core(system_directory_table_base) {
                log::error!(
                    "failed to enable on core {}: {:?}",
                    self.platform.cpu_index(),
                    error
                );
                failures.fetch_add(1, Ordering::Relaxed);
                first_error.lock().get_or_insert(error);
            }
        });

        if failures.load(Ordering::Relaxed) != 0 {
            self.disable();
            let error = first_error.lock().take().unwrap_or(HypervisorError::LaunchFailed(0));
            return Err(error);
        }

        log::info!("hypervisor enabled on {} cores", self.vm_states.len());
        Ok(())
    }

    fn enable_core(&self, system_directory_table_base: u64) -> Result<(), HypervisorError> {
        let index = self.platform.cpu_index();
        let state = *self
            .vm_states
            .get(index)
            .ok_or(HypervisorError::InvalidRequest)?;

        if !is_vmx_supported() || !is_vmx_available() {
            return Err(HypervisorError::HardwareUnsupported);
        }

        vcpu::enable_core(self.platform, state, system_directory_table_base)?;

        if !is_hypervisor_present() {
            return Err(HypervisorError::LaunchFailed(0));
        }

        log::debug!("core {} virtualized", index);
        Ok(())
    }

    /// Returns every logical processor to normal operation.
    pub fn disable(&self) {
        self.platform.for_each_cpu(&mut || self.disable_core());
        log::info!("hypervisor disabled on all cores");
    }

    fn disable_core(&self) {
        cpu::cpuid(CPUID_COOKIE_LEAF, CPUID_COOKIE_DISABLE);

        if is_hypervisor_present() {
            // A CPU that cannot leave VMX operation must not keep running.
            self.platform.fatal("core failed to leave VMX operation");
        }
    }

    pub fn is_enabled(&self) -> bool {
        is_hypervisor_present()
    }

    /// Arms SYSCALL interception on every CPU.
    pub fn enable_syscall_hooking(&self) {
        self.platform.for_each_cpu(&mut || {
            cpu::cpuid(CPUID_COOKIE_LEAF, CPUID_COOKIE_ENABLE_SYSCALL_HOOKS);
        });
    }

    /// Installs a page hook: instruction fetches from the hooked page see
    /// `bytes` at `destination`'s page offset, data reads keep seeing the
    /// original contents. The patch must not cross the page boundary.
    pub fn install_ept_hook(
        &self,
        target_pid: ProcessId,
        destination: VirtAddr,
        bytes: &[u8],
        source_pid: ProcessId,
        hints: &[TranslationHint],
    ) -> Result<HookId, HypervisorError> {
        let aligned = ept::page_align(destination.as_u64());
        let hint = hints
            .iter()
            .find(|hint| hint.virtual_base_address.as_u64() == aligned);

        let id = self
            .ept
            .install_page_hook(destination, bytes, source_pid, target_pid, hint)?;
        self.invalidate_cores();
        Ok(id)
    }

    /// Makes `physical_page` execute-only and records any other access in
    /// the access ring.
    pub fn install_ept_code_watch_point(
        &self,
        physical_page: PhysAddr,
        source_pid: ProcessId,
        target_pid: ProcessId,
    ) -> Result<HookId, HypervisorError> {
        let id = self
            .ept
            .install_code_watch_point(physical_page, source_pid, target_pid)?;
        self.invalidate_cores();
        Ok(id)
    }

    /// Batch watchpoint installation with a single trailing invalidation.
    pub fn install_ept_code_watch_points(
        &self,
        physical_pages: &[PhysAddr],
        source_pid: ProcessId,
        target_pid: ProcessId,
    ) -> Result<Vec<HookId>, HypervisorError> {
        let mut ids = Vec::with_capacity(physical_pages.len());
        let mut first_error = None;

        for &page in physical_pages {
            match self
                .ept
                .install_code_watch_point(page, source_pid, target_pid)
            {
                Ok(id) => ids.push(id),
                Err(error) => {
                    log::error!("watch point on {:#x} failed: {:?}", page.as_u64(), error);
                    first_error.get_or_insert(error);
                }
            }
        }

        self.invalidate_cores();

        match first_error {
            Some(error) => Err(error),
            None => Ok(ids),
        }
    }

    /// Removes one hook or watchpoint. Removing an id twice reports
    /// `InvalidRequest`.
    pub fn remove(&self, id: HookId) -> Result<(), HypervisorError> {
        self.ept.remove(id)?;
        self.invalidate_cores();
        Ok(())
    }

    /// Removes everything.
    pub fn disable_all_hooks(&self) {
        self.ept.disable_all_hooks();
        self.invalidate_cores();
    }

    /// Drops every hook and watchpoint owned by or targeting `process`.
    /// Returns whether anything was removed.
    pub fn cleanup_process(&self, process: ProcessId) -> bool {
        if !self.ept.cleanup_process(process) {
            return false;
        }
        self.invalidate_cores();
        true
    }

    /// Snapshot of the watchpoint access ring.
    pub fn get_access_records(&self, out: &mut [u64]) -> usize {
        self.ept.registry().access_records.snapshot(out)
    }

    /// Snapshots the pages `destination` spans in the current address space
    /// so a hook can later be installed without probing it again.
    pub fn generate_translation_hints(
        &self,
        destination: VirtAddr,
        length: usize,
    ) -> Result<Vec<TranslationHint>, HypervisorError> {
        ept::generate_translation_hints(self.platform, destination, length)
    }

    /// Power-down notification. Remembers whether the hypervisor was active.
    pub fn on_sleep(&mut self) {
        self.resume_on_wake = self.is_enabled();
        if self.resume_on_wake {
            self.disable();
        }
    }

    /// Power-up notification; re-virtualizes and re-arms hooks if the
    /// hypervisor was active before sleep.
    pub fn on_wake(&mut self) -> Result<(), HypervisorError> {
        if !self.resume_on_wake {
            return Ok(());
        }
        self.resume_on_wake = false;
        self.enable()
    }

    /// Flushes EPT-derived translations on every CPU that is running under
    /// the hypervisor.
    fn invalidate_cores(&self) {
        self.platform.for_each_cpu(&mut || {
            if is_hypervisor_present() {
                // Traps into the dispatcher, which runs the INVEPT in root.
                unsafe { self.ept.invalidate() };
            }
        });
    }
}

impl Drop for Hypervisor {
    fn drop(&mut self) {
        self.disable_all_hooks();
        self.disable();

        for state in self.vm_states.drain(..) {
            unsafe { platform::free_object(self.platform, state) };
        }
    }
}
