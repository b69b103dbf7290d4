//! Per-CPU VMX state and the root-mode launch path.

use crate::cpu;
use crate::entry::{capture_context, CapturedContext};
use crate::ept::Ept;
use crate::platform::{Platform, PAGE_SIZE};
use crate::vmx::{self, VmxRegion};
use crate::HypervisorError;
use bit_field::BitField;
use core::ptr::NonNull;
use x86_64::structures::DescriptorTablePointer;
use x86_64::{PhysAddr, VirtAddr};

pub const HOST_STACK_SIZE: usize = 4 * PAGE_SIZE;

// Indices into the captured VMX capability MSR block (0x480 + index).
pub const MSR_VMX_BASIC: usize = 0;
pub const MSR_CR0_FIXED0: usize = 6;
pub const MSR_CR0_FIXED1: usize = 7;
pub const MSR_CR4_FIXED0: usize = 8;
pub const MSR_CR4_FIXED1: usize = 9;
pub const MSR_PROCBASED_CTLS2: usize = 11;
pub const MSR_EPT_VPID_CAP: usize = 12;
pub const MSR_TRUE_PINBASED_CTLS: usize = 13;
pub const MSR_TRUE_PROCBASED_CTLS: usize = 14;
pub const MSR_TRUE_EXIT_CTLS: usize = 15;
pub const MSR_TRUE_ENTRY_CTLS: usize = 16;

const SECONDARY_ENABLE_EPT: u64 = 1 << 1;
const SECONDARY_ENABLE_VPID: u64 = 1 << 5;

/// Host register state that is not part of the captured register frame but
/// must survive the transition into non-root operation.
#[repr(C)]
pub struct SpecialRegisters {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub msr_gs_base: u64,
    pub msr_debug_control: u64,
    pub kernel_dr7: u64,
    pub tr: u16,
    pub ldtr: u16,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub gdtr: DescriptorTablePointer,
    pub idtr: DescriptorTablePointer,
}

/// Everything needed to launch this CPU and, if VMLAUNCH fails or the guest
/// requests teardown, to put the kernel back exactly where it was.
#[repr(C)]
pub struct LaunchContext {
    pub special_registers: SpecialRegisters,
    pub context_frame: CapturedContext,
    pub system_directory_table_base: u64,
    pub vmxon_physical_address: u64,
    pub vmcs_physical_address: u64,
    pub msr_bitmap_physical_address: u64,
    pub msr_data: [u64; cpu::VMX_MSR_COUNT],
    pub ept_controls: u64,
    pub launched: bool,
}

/// Per-CPU VMX state. One instance per logical processor, allocated from
/// contiguous non-paged memory; owned exclusively by its CPU once launched.
#[repr(C, align(4096))]
pub struct VmxState {
    pub stack_buffer: [u8; HOST_STACK_SIZE],
    pub msr_bitmap: [u8; PAGE_SIZE],
    pub vmxon: VmxRegion,
    pub vmcs: VmxRegion,
    pub launch_context: LaunchContext,
    pub ept: *const Ept,
}

impl VmxState {
    /// Top-of-stack slot the entry stubs use to find this state again. The
    /// quadword at the returned address holds `self`.
    pub fn host_stack_top(&self) -> u64 {
        self.stack_buffer.as_ptr() as u64 + HOST_STACK_SIZE as u64 - 16
    }
}

fn capture_special_registers(registers: &mut SpecialRegisters) {
    unsafe {
        registers.cr0 = cpu::read_cr0();
        registers.cr3 = cpu::read_cr3();
        registers.cr4 = cpu::read_cr4();
        registers.msr_debug_control = cpu::rdmsr(cpu::IA32_DEBUGCTL);
        registers.msr_gs_base = cpu::rdmsr(cpu::IA32_GS_BASE);
    }
    registers.kernel_dr7 = cpu::read_dr7();
    registers.tr = cpu::read_tr();
    registers.ldtr = cpu::read_ldtr();
    registers.cs = cpu::read_cs();
    registers.ss = cpu::read_ss();
    registers.ds = cpu::read_ds();
    registers.es = cpu::read_es();
    registers.fs = cpu::read_fs();
    registers.gs = cpu::read_gs();
    registers.gdtr = cpu::sgdt();
    registers.idtr = cpu::sidt();
}

fn initialize_msrs(launch_context: &mut LaunchContext) {
    for (index, slot) in launch_context.msr_data.iter_mut().enumerate() {
        *slot = unsafe { cpu::rdmsr(cpu::IA32_VMX_BASIC + index as u32) };
    }
}

/// Switches this CPU into VMX root operation and makes its VMCS current.
unsafe fn enter_root_mode(
    platform: &dyn Platform,
    state: &mut VmxState,
) -> Result<(), HypervisorError> {
    let launch_context = &mut state.launch_context;

    let basic = launch_context.msr_data[MSR_VMX_BASIC];
    if basic.get_bits(32..45) as usize > PAGE_SIZE {
        return Err(HypervisorError::HardwareUnsupported);
    }
    // VMCS memory type must be write-back, bit 48 must be clear.
    if basic.get_bits(50..54) != 6 || basic.get_bit(48) {
        return Err(HypervisorError::HardwareUnsupported);
    }

    let ept_vpid_cap = launch_context.msr_data[MSR_EPT_VPID_CAP];
    let page_walk_4 = ept_vpid_cap.get_bit(6);
    let write_back = ept_vpid_cap.get_bit(14);
    let large_pde = ept_vpid_cap.get_bit(16);
    if !(page_walk_4 && write_back && large_pde) {
        return Err(HypervisorError::HardwareUnsupported);
    }
    launch_context.ept_controls = SECONDARY_ENABLE_EPT | SECONDARY_ENABLE_VPID;

    let revision_id = basic as u32;
    state.vmxon.revision_id = revision_id;
    state.vmcs.revision_id = revision_id;

    let virt_to_phys = |address: VirtAddr| {
        platform
            .virt_to_phys(address)
            .ok_or(HypervisorError::AddressTranslationFailed)
    };
    let launch_context = &mut state.launch_context;
    launch_context.vmxon_physical_address =
        virt_to_phys(VirtAddr::from_ptr(&state.vmxon))?.as_u64();
    launch_context.vmcs_physical_address =
        virt_to_phys(VirtAddr::from_ptr(&state.vmcs))?.as_u64();
    launch_context.msr_bitmap_physical_address =
        virt_to_phys(VirtAddr::from_ptr(state.msr_bitmap.as_ptr()))?.as_u64();

    // Force CR0/CR4 into their VMX-required fixed bit patterns. The adjusted
    // values also become the guest's initial control registers.
    let registers = &mut launch_context.special_registers;
    registers.cr0 &= launch_context.msr_data[MSR_CR0_FIXED1];
    registers.cr0 |= launch_context.msr_data[MSR_CR0_FIXED0];
    registers.cr4 &= launch_context.msr_data[MSR_CR4_FIXED1];
    registers.cr4 |= launch_context.msr_data[MSR_CR4_FIXED0];

    cpu::write_cr0(registers.cr0);
    cpu::write_cr4(registers.cr4);

    vmx::vmxon(PhysAddr::new(launch_context.vmxon_physical_address))?;

    if let Err(error) = vmx::vmclear(PhysAddr::new(launch_context.vmcs_physical_address))
        .and_then(|_| vmx::vmptrld(PhysAddr::new(launch_context.vmcs_physical_address)))
    {
        vmx::vmxoff();
        return Err(error);
    }

    Ok(())
}

/// Launches non-root operation on the calling CPU. Does not return on
/// success; the CPU resumes as the guest inside the captured context.
unsafe fn launch_on_core(
    platform: &dyn Platform,
    state: &mut VmxState,
) -> Result<core::convert::Infallible, HypervisorError> {
    initialize_msrs(&mut state.launch_context);
    enter_root_mode(platform, state)?;

    let ept = &*state.ept;
    crate::vmcs::setup_vmcs_for_cpu(state, ept);

    let error = vmx::launch();
    Err(HypervisorError::LaunchFailed(error))
}

/// Virtualizes the calling CPU: captures its full context, launches the
/// guest, and comes back out of the capture point in non-root operation.
pub fn enable_core(
    platform: &'static dyn Platform,
    state: NonNull<VmxState>,
    system_directory_table_base: u64,
) -> Result<(), HypervisorError> {
    let state = unsafe { &mut *state.as_ptr() };

    state.launch_context.launched = false;
    state.launch_context.system_directory_table_base = system_directory_table_base;

    capture_special_registers(&mut state.launch_context.special_registers);
    unsafe { capture_context(&mut state.launch_context.context_frame) };

    // Executed twice: first in root mode right after the capture, then again
    // as the guest once the launch stub restored the frame.
    if !state.launch_context.launched {
        unsafe { launch_on_core(platform, state)? };
    }

    Ok(())
}
