//! VMX instruction wrappers and region types.

use crate::platform::PAGE_SIZE;
use crate::HypervisorError;
use core::arch::asm;
use x86_64::registers::rflags::RFlags;
use x86_64::PhysAddr;

/// VMXON region / VMCS. The first dword carries the VMX revision identifier,
/// the rest is hardware-owned.
#[repr(C, align(4096))]
pub struct VmxRegion {
    pub revision_id: u32,
    abort_indicator: u32,
    data: [u8; PAGE_SIZE - 8],
}

const VMX_FAIL_MASK: u64 = RFlags::CARRY_FLAG.bits() | RFlags::ZERO_FLAG.bits();

fn status(flags: u64) -> Result<(), HypervisorError> {
    if flags & VMX_FAIL_MASK != 0 {
        Err(HypervisorError::VmxInstructionFailed)
    } else {
        Ok(())
    }
}

pub unsafe fn vmxon(region: PhysAddr) -> Result<(), HypervisorError> {
    let address = region.as_u64();
    let flags: u64;
    asm!(
        "vmxon [{}]",
        "pushfq",
        "pop {}",
        in(reg) &address,
        out(reg) flags,
    );
    status(flags)
}

pub unsafe fn vmxoff() {
    asm!("vmxoff", options(nostack));
}

pub unsafe fn vmclear(vmcs: PhysAddr) -> Result<(), HypervisorError> {
    let address = vmcs.as_u64();
    let flags: u64;
    asm!(
        "vmclear [{}]",
        "pushfq",
        "pop {}",
        in(reg) &address,
        out(reg) flags,
    );
    status(flags)
}

pub unsafe fn vmptrld(vmcs: PhysAddr) -> Result<(), HypervisorError> {
    let address = vmcs.as_u64();
    let flags: u64;
    asm!(
        "vmptrld [{}]",
        "pushfq",
        "pop {}",
        in(reg) &address,
        out(reg) flags,
    );
    status(flags)
}

pub unsafe fn vmread(field: u32) -> u64 {
    let value: u64;
    asm!(
        "vmread {}, {}",
        out(reg) value,
        in(reg) field as u64,
        options(nostack),
    );
    value
}

pub unsafe fn vmwrite(field: u32, value: u64) {
    asm!(
        "vmwrite {}, {}",
        in(reg) field as u64,
        in(reg) value,
        options(nostack),
    );
}

/// Executes VMLAUNCH. On success control never comes back here; the guest
/// resumes at the configured entry point. Returns the VM-instruction error
/// after tearing VMX back down on failure.
pub unsafe fn launch() -> u32 {
    asm!("vmlaunch", options(nostack));

    // Only reached when the launch failed.
    let error = vmread(crate::vmcs::VM_INSTRUCTION_ERROR) as u32;
    vmxoff();
    error
}

#[repr(u64)]
#[derive(Debug, Clone, Copy)]
pub enum InveptType {
    SingleContext = 1,
    AllContexts = 2,
}

/// Invalidates EPT-derived translations on the current logical processor.
/// Only valid in VMX root operation.
pub unsafe fn invept(invalidation: InveptType, ept_pointer: u64) {
    let descriptor: [u64; 2] = [ept_pointer, 0];
    asm!(
        "invept {}, [{}]",
        in(reg) invalidation as u64,
        in(reg) &descriptor,
        options(nostack),
    );
}
