//! VM-exit dispatch.
//!
//! Every exit ends in exactly one of two outcomes: the guest is resumed, or
//! VMX operation is torn down and control returns to the kernel. Nothing
//! propagates out of this module as an error.

use crate::cpu;
use crate::entry::{devirtualize_restore, CapturedContext, GuestRegisters};
use crate::ept::Ept;
use crate::msr;
use crate::vcpu::VmxState;
use crate::vmcs;
use crate::vmx;
use crate::{
    CPUID_COOKIE_DISABLE, CPUID_COOKIE_ENABLE_SYSCALL_HOOKS, CPUID_COOKIE_LEAF,
    CPUID_HV_PRESENT_BIT, CPUID_HYPERVISOR_INTERFACE, HYPERVISOR_SIGNATURE,
};

pub const EXIT_REASON_EXCEPTION_OR_NMI: u16 = 0;
pub const EXIT_REASON_CPUID: u16 = 10;
pub const EXIT_REASON_INVD: u16 = 13;
pub const EXIT_REASON_VMCALL: u16 = 18;
pub const EXIT_REASON_VMXON: u16 = 27;
pub const EXIT_REASON_RDMSR: u16 = 31;
pub const EXIT_REASON_WRMSR: u16 = 32;
pub const EXIT_REASON_MONITOR_TRAP_FLAG: u16 = 37;
pub const EXIT_REASON_EPT_VIOLATION: u16 = 48;
pub const EXIT_REASON_EPT_MISCONFIGURATION: u16 = 49;
pub const EXIT_REASON_INVEPT: u16 = 50;
pub const EXIT_REASON_XSETBV: u16 = 55;

const RFLAGS_CARRY_FLAG: u64 = 1 << 0;
const RFLAGS_RESUME_FLAG: u64 = 1 << 16;

const INTERRUPT_INFO_VALID: u32 = 1 << 31;
const INTERRUPT_INFO_ERROR_CODE_VALID: u32 = 1 << 11;
const INTERRUPT_TYPE_NMI: u32 = 2;
const INTERRUPT_TYPE_HARDWARE_EXCEPTION: u32 = 3;
const VECTOR_NMI: u32 = 2;
const VECTOR_INVALID_OPCODE: u32 = 6;
const VECTOR_PAGE_FAULT: u32 = 14;

/// RCX value observed by the kernel when a CPU leaves VMX operation.
const DEVIRTUALIZE_MARKER: u64 = 0x4343_4343;

const SYSCALL_BYTES: [u8; 2] = [0x0F, 0x05];
const SYSRET_BYTES: [u8; 3] = [0x48, 0x0F, 0x07];

/// Mutable view of the interrupted guest, shared by all exit handlers.
pub struct GuestContext<'a> {
    pub regs: &'a mut GuestRegisters,
    pub guest_rip: u64,
    pub guest_rsp: u64,
    pub guest_rflags: u64,
    pub guest_physical_address: u64,
    pub exit_reason: u16,
    pub exit_qualification: u64,
    /// Advance RIP past the exiting instruction before resuming.
    pub increment_rip: bool,
    /// Leave VMX operation instead of resuming.
    pub exit_vm: bool,
    /// Perform a local INVEPT before the next VMRESUME.
    pub invalidate_ept: bool,
    /// Turn the monitor trap flag on or off before resuming.
    pub monitor_trap: Option<bool>,
}

/// What a CPUID exit asks of us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuidRequest {
    Passthrough,
    EnableSyscallHooks,
    Devirtualize,
}

/// Recognises the reserved CPUID cookies. They are honoured only from CPL 0.
pub fn classify_cpuid(leaf: u32, sub_leaf: u32, system: bool) -> CpuidRequest {
    if leaf != CPUID_COOKIE_LEAF || !system {
        return CpuidRequest::Passthrough;
    }
    match sub_leaf {
        CPUID_COOKIE_DISABLE => CpuidRequest::Devirtualize,
        CPUID_COOKIE_ENABLE_SYSCALL_HOOKS => CpuidRequest::EnableSyscallHooks,
        _ => CpuidRequest::Passthrough,
    }
}

fn is_system() -> bool {
    unsafe { vmx::vmread(vmcs::GUEST_CS_SELECTOR) & 0x3 == 0 }
}

fn handle_cpuid(context: &mut GuestContext) {
    let leaf = context.regs.rax as u32;
    let sub_leaf = context.regs.rcx as u32;

    match classify_cpuid(leaf, sub_leaf, is_system()) {
        CpuidRequest::EnableSyscallHooks => {
            unsafe { enable_syscall_hooks(true) };
            return;
        }
        CpuidRequest::Devirtualize => {
            context.exit_vm = true;
            return;
        }
        CpuidRequest::Passthrough => {}
    }

    let mut result = cpu::cpuid(leaf, sub_leaf);
    if leaf == 1 {
        result.ecx |= CPUID_HV_PRESENT_BIT;
    } else if leaf == CPUID_HYPERVISOR_INTERFACE {
        result.eax = HYPERVISOR_SIGNATURE;
    }

    context.regs.rax = u64::from(result.eax);
    context.regs.rbx = u64::from(result.ebx);
    context.regs.rcx = u64::from(result.ecx);
    context.regs.rdx = u64::from(result.edx);
}

fn handle_invd() {
    // INVD would drop dirty host cache lines; writeback instead.
    unsafe { cpu::wbinvd() };
}

fn handle_xsetbv(context: &mut GuestContext) {
    let register = context.regs.rcx as u32;
    let value = (context.regs.rdx << 32) | (context.regs.rax & 0xFFFF_FFFF);
    unsafe { cpu::xsetbv(register, value) };
}

/// VMX instructions are not emulated; the guest sees VMfailInvalid.
pub fn handle_vmx_instruction(context: &mut GuestContext) {
    context.guest_rflags |= RFLAGS_CARRY_FLAG;
}

/// A kernel-initiated INVEPT traps here; perform the invalidation on its
/// behalf. This is how cross-core invalidation requests reach each CPU while
/// the hypervisor is running.
fn handle_invept(context: &mut GuestContext, ept: &Ept) {
    if is_system() {
        unsafe { ept.invalidate() };
    } else {
        handle_vmx_instruction(context);
    }
}

unsafe fn inject_interruption(interruption_type: u32, vector: u32, error_code: Option<u32>) {
    let mut information = INTERRUPT_INFO_VALID | (interruption_type << 8) | vector;
    if error_code.is_some() {
        information |= INTERRUPT_INFO_ERROR_CODE_VALID;
    }

    vmx::vmwrite(vmcs::VMENTRY_INTERRUPTION_INFORMATION, u64::from(information));
    if let Some(code) = error_code {
        vmx::vmwrite(vmcs::VMENTRY_EXCEPTION_ERROR_CODE, u64::from(code));
    }
}

fn inject_invalid_opcode() {
    unsafe { inject_interruption(INTERRUPT_TYPE_HARDWARE_EXCEPTION, VECTOR_INVALID_OPCODE, None) };
}

fn inject_page_fault(address: u64) {
    unsafe {
        cpu::write_cr2(address);
        inject_interruption(INTERRUPT_TYPE_HARDWARE_EXCEPTION, VECTOR_PAGE_FAULT, Some(0));
    }
}

/// Restores the previous CR3 when dropped.
struct Cr3Guard {
    original: u64,
}

impl Cr3Guard {
    fn new() -> Self {
        Self {
            original: cpu::read_cr3(),
        }
    }

    fn switch_to(&mut self, cr3: u64) {
        unsafe { cpu::write_cr3(cr3) };
    }
}

impl Drop for Cr3Guard {
    fn drop(&mut self) {
        unsafe { cpu::write_cr3(self.original) };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallState {
    Syscall,
    Sysret,
    PageFault,
    None,
}

/// Matches the instruction bytes at a faulting RIP against the SYSCALL and
/// SYSRET encodings.
pub fn classify_syscall_bytes(bytes: &[u8; 3]) -> SyscallState {
    if bytes[..2] == SYSCALL_BYTES {
        SyscallState::Syscall
    } else if bytes[..3] == SYSRET_BYTES {
        SyscallState::Sysret
    } else {
        SyscallState::None
    }
}

/// Copies guest bytes from the current address space, page-fault aware:
/// a chunk whose translation fails is reported as `Err(faulting_address)`.
pub fn read_guest_bytes(
    platform: &dyn crate::platform::Platform,
    address: u64,
    destination: &mut [u8],
) -> Result<(), u64> {
    let mut offset = 0usize;

    while offset < destination.len() {
        let current = address + offset as u64;
        let page_end = crate::ept::page_align(current) + crate::platform::PAGE_SIZE as u64;
        let mut length = destination.len() - offset;
        if current + length as u64 > page_end {
            length = (page_end - current) as usize;
        }

        let physical = platform
            .virt_to_phys(x86_64::VirtAddr::new_truncate(current))
            .ok_or(current)?;
        if !platform.read_physical(&mut destination[offset..offset + length], physical) {
            return Err(current);
        }

        offset += length;
    }

    Ok(())
}

fn get_syscall_state(context: &GuestContext, ept: &Ept) -> SyscallState {
    let mut cr3_guard = Cr3Guard::new();

    // A PCID-tagged guest CR3 cannot be loaded directly; use the directory
    // base of the process that faulted.
    const PCID_MASK: u64 = 0x3;
    let guest_cr3 = unsafe { vmx::vmread(vmcs::GUEST_CR3) };
    if guest_cr3 & PCID_MASK != 0 {
        cr3_guard.switch_to(ept.platform().current_process_cr3());
    }

    let mut bytes = [0u8; 3];
    match read_guest_bytes(ept.platform(), context.guest_rip, &mut bytes) {
        Ok(()) => classify_syscall_bytes(&bytes),
        Err(faulting_address) => {
            inject_page_fault(faulting_address);
            SyscallState::PageFault
        }
    }
}

unsafe fn load_flat_segment(selector_field: u32, selector: u16, access_rights: u32) {
    let offset = selector_field - vmcs::GUEST_ES_SELECTOR;
    vmx::vmwrite(selector_field, u64::from(selector));
    vmx::vmwrite(vmcs::GUEST_ES_LIMIT + offset, 0xFFFFF);
    vmx::vmwrite(vmcs::GUEST_ES_ACCESS_RIGHTS + offset, u64::from(access_rights));
    vmx::vmwrite(vmcs::GUEST_ES_BASE + offset, 0);
}

/// Performs the architectural SYSCALL transition in software.
unsafe fn emulate_syscall(context: &mut GuestContext) {
    let instruction_length = vmx::vmread(vmcs::VMEXIT_INSTRUCTION_LENGTH);
    let star = cpu::rdmsr(cpu::IA32_STAR);
    let lstar = cpu::rdmsr(cpu::IA32_LSTAR);
    let fmask = cpu::rdmsr(cpu::IA32_FMASK);

    context.regs.rcx = context.guest_rip + instruction_length;
    context.guest_rip = lstar;

    context.regs.r11 = context.guest_rflags;
    context.guest_rflags &= !(fmask | RFLAGS_RESUME_FLAG);

    let kernel_cs = ((star >> 32) & !3) as u16;
    load_flat_segment(vmcs::GUEST_CS_SELECTOR, kernel_cs, 0xA09B);
    load_flat_segment(vmcs::GUEST_SS_SELECTOR, kernel_cs + 8, 0xC093);
}

/// Performs the architectural SYSRET transition in software.
unsafe fn emulate_sysret(context: &mut GuestContext) {
    let star = cpu::rdmsr(cpu::IA32_STAR);

    context.guest_rip = context.regs.rcx;
    context.guest_rflags = (context.regs.r11 & 0x3C_7FD7) | 2;

    let base = (star >> 48) as u16;
    load_flat_segment(vmcs::GUEST_CS_SELECTOR, (base + 16) | 3, 0xA0FB);
    load_flat_segment(vmcs::GUEST_SS_SELECTOR, (base + 8) | 3, 0xC0F3);
}

fn handle_invalid_opcode(context: &mut GuestContext, ept: &Ept) {
    match get_syscall_state(context, ept) {
        SyscallState::Syscall => unsafe { emulate_syscall(context) },
        SyscallState::Sysret => unsafe { emulate_sysret(context) },
        SyscallState::PageFault => {}
        SyscallState::None => inject_invalid_opcode(),
    }
}

fn handle_exception(context: &mut GuestContext, ept: &Ept) {
    let information = unsafe { vmx::vmread(vmcs::VMEXIT_INTERRUPTION_INFORMATION) } as u32;
    let vector = information & 0xFF;
    let interruption_type = (information >> 8) & 0x7;

    context.increment_rip = false;

    if interruption_type == INTERRUPT_TYPE_NMI && vector == VECTOR_NMI {
        // Host-handled; nothing to emulate.
        return;
    }

    if vector == VECTOR_INVALID_OPCODE {
        handle_invalid_opcode(context, ept);
        return;
    }

    // Reflect everything else back into the guest.
    unsafe {
        vmx::vmwrite(vmcs::VMENTRY_INTERRUPTION_INFORMATION, u64::from(information));
        if information & INTERRUPT_INFO_ERROR_CODE_VALID != 0 {
            vmx::vmwrite(
                vmcs::VMENTRY_EXCEPTION_ERROR_CODE,
                vmx::vmread(vmcs::VMEXIT_INTERRUPTION_ERROR_CODE),
            );
        }
    }
}

/// Arms or disarms SYSCALL interception on the current CPU: with EFER.SCE
/// clear every SYSCALL/SYSRET raises #UD, which the exception handler then
/// emulates.
pub unsafe fn enable_syscall_hooks(enable: bool) {
    let vmx_basic = cpu::rdmsr(cpu::IA32_VMX_BASIC);
    let true_controls = vmx_basic & (1 << 55) != 0;

    let mut exit_controls = vmx::vmread(vmcs::PRIMARY_VMEXIT_CONTROLS);
    let mut entry_controls = vmx::vmread(vmcs::VMENTRY_CONTROLS);
    let mut efer = cpu::rdmsr(cpu::IA32_EFER);

    if enable {
        efer &= !1;
        exit_controls |= vmcs::EXIT_SAVE_IA32_EFER;
        entry_controls |= vmcs::ENTRY_LOAD_IA32_EFER;
    } else {
        efer |= 1;
        exit_controls &= !vmcs::EXIT_SAVE_IA32_EFER;
        entry_controls &= !vmcs::ENTRY_LOAD_IA32_EFER;
    }

    let exit_capability = cpu::rdmsr(if true_controls {
        cpu::IA32_VMX_TRUE_EXIT_CTLS
    } else {
        cpu::IA32_VMX_EXIT_CTLS
    });
    let entry_capability = cpu::rdmsr(if true_controls {
        cpu::IA32_VMX_TRUE_ENTRY_CTLS
    } else {
        cpu::IA32_VMX_ENTRY_CTLS
    });

    vmx::vmwrite(
        vmcs::PRIMARY_VMEXIT_CONTROLS,
        vmcs::adjust_msr(exit_capability, exit_controls),
    );
    vmx::vmwrite(
        vmcs::VMENTRY_CONTROLS,
        vmcs::adjust_msr(entry_capability, entry_controls),
    );
    vmx::vmwrite(vmcs::GUEST_EFER, efer);

    vmcs::set_exception_bit(VECTOR_INVALID_OPCODE as u8, enable);
}

/// Classifies one exit and runs its handler.
pub fn dispatch_vm_exit(context: &mut GuestContext, ept: &Ept) {
    match context.exit_reason {
        EXIT_REASON_CPUID => handle_cpuid(context),
        EXIT_REASON_INVD => handle_invd(),
        EXIT_REASON_XSETBV => handle_xsetbv(context),
        EXIT_REASON_VMCALL..=EXIT_REASON_VMXON => handle_vmx_instruction(context),
        EXIT_REASON_INVEPT => handle_invept(context, ept),
        EXIT_REASON_EPT_VIOLATION => ept.handle_violation(context),
        EXIT_REASON_EPT_MISCONFIGURATION => ept.handle_misconfiguration(context),
        EXIT_REASON_MONITOR_TRAP_FLAG => ept.handle_monitor_trap(context),
        EXIT_REASON_EXCEPTION_OR_NMI => handle_exception(context, ept),
        EXIT_REASON_RDMSR => msr::handle_msr_access(context, false),
        EXIT_REASON_WRMSR => msr::handle_msr_access(context, true),
        _ => {}
    }
}

/// Leaves VMX operation on this CPU and resumes the interrupted kernel
/// context in root mode.
unsafe fn devirtualize(state: &mut VmxState, context: &mut GuestContext) -> ! {
    context.regs.rcx = DEVIRTUALIZE_MARKER;

    let registers = &state.launch_context.special_registers;
    cpu::lgdt(&registers.gdtr);
    cpu::lidt(&registers.idtr);
    cpu::write_cr3(vmx::vmread(vmcs::GUEST_CR3));

    let mut target = CapturedContext::zeroed();
    target.rax = context.regs.rax;
    target.rcx = context.regs.rcx;
    target.rdx = context.regs.rdx;
    target.rbx = context.regs.rbx;
    target.rbp = context.regs.rbp;
    target.rsi = context.regs.rsi;
    target.rdi = context.regs.rdi;
    target.r8 = context.regs.r8;
    target.r9 = context.regs.r9;
    target.r10 = context.regs.r10;
    target.r11 = context.regs.r11;
    target.r12 = context.regs.r12;
    target.r13 = context.regs.r13;
    target.r14 = context.regs.r14;
    target.r15 = context.regs.r15;
    target.rsp = context.guest_rsp;
    target.rip = context.guest_rip;
    target.rflags = context.guest_rflags;

    vmx::vmxoff();
    devirtualize_restore(&target)
}

/// Called from the exit stub with the guest register frame. Returning
/// resumes the guest; the teardown path diverges.
#[no_mangle]
unsafe extern "win64" fn vmexit_dispatcher(state: *mut VmxState, frame: *mut GuestRegisters) {
    let state = &mut *state;
    let frame = &mut *frame;
    let ept = &*state.ept;

    let mut context = GuestContext {
        regs: frame,
        guest_rip: vmx::vmread(vmcs::GUEST_RIP),
        guest_rsp: vmx::vmread(vmcs::GUEST_RSP),
        guest_rflags: vmx::vmread(vmcs::GUEST_RFLAGS),
        guest_physical_address: vmx::vmread(vmcs::GUEST_PHYSICAL_ADDRESS),
        exit_reason: vmx::vmread(vmcs::EXIT_REASON) as u16,
        exit_qualification: vmx::vmread(vmcs::EXIT_QUALIFICATION),
        increment_rip: true,
        exit_vm: false,
        invalidate_ept: false,
        monitor_trap: None,
    };

    dispatch_vm_exit(&mut context, ept);

    if context.increment_rip {
        context.guest_rip += vmx::vmread(vmcs::VMEXIT_INSTRUCTION_LENGTH);
    }
    vmx::vmwrite(vmcs::GUEST_RIP, context.guest_rip);
    vmx::vmwrite(vmcs::GUEST_RFLAGS, context.guest_rflags);

    if let Some(enable) = context.monitor_trap {
        let mut controls = vmx::vmread(vmcs::PROCESSOR_BASED_VM_EXECUTION_CONTROLS);
        if enable {
            controls |= vmcs::PROCBASED_MONITOR_TRAP_FLAG;
        } else {
            controls &= !vmcs::PROCBASED_MONITOR_TRAP_FLAG;
        }
        vmx::vmwrite(vmcs::PROCESSOR_BASED_VM_EXECUTION_CONTROLS, controls);
    }

    // Every table mutation becomes visible to this CPU before re-entry.
    if context.invalidate_ept {
        ept.invalidate();
    }

    if context.exit_vm {
        devirtualize(state, &mut context);
    }
}
