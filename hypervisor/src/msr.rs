//! MSR bitmap configuration and RDMSR/WRMSR exit handling.
//!
//! The bitmap is left all-zero so MSR accesses normally run straight
//! through. The handlers below only matter for MSRs a collaborator chooses
//! to intercept; registers mirrored in guest VMCS fields are forwarded there
//! instead of the hardware register.

use crate::cpu;
use crate::platform::PAGE_SIZE;
use crate::vm_exit_handlers::GuestContext;
use crate::vmcs;
use crate::vmx;

/// All-zero bitmap: no MSR access causes an exit.
pub fn configure_msr_bitmap(bitmap: &mut [u8; PAGE_SIZE]) {
    bitmap.fill(0);
}

/// Guest VMCS field shadowing the MSR, if any.
fn shadow_field(msr: u32) -> Option<u32> {
    match msr {
        cpu::IA32_SYSENTER_CS => Some(vmcs::GUEST_SYSENTER_CS),
        cpu::IA32_SYSENTER_ESP => Some(vmcs::GUEST_SYSENTER_ESP),
        cpu::IA32_SYSENTER_EIP => Some(vmcs::GUEST_SYSENTER_EIP),
        cpu::IA32_DEBUGCTL => Some(vmcs::GUEST_DEBUGCTL),
        cpu::IA32_FS_BASE => Some(vmcs::GUEST_FS_BASE),
        cpu::IA32_GS_BASE => Some(vmcs::GUEST_GS_BASE),
        _ => None,
    }
}

pub fn handle_msr_access(context: &mut GuestContext, write: bool) {
    let msr = context.regs.rcx as u32;
    let field = shadow_field(msr);

    if write {
        let value = (context.regs.rdx << 32) | (context.regs.rax & 0xFFFF_FFFF);
        unsafe {
            match field {
                Some(field) => vmx::vmwrite(field, value),
                None => cpu::wrmsr(msr, value),
            }
        }
    } else {
        let value = unsafe {
            match field {
                Some(field) => vmx::vmread(field),
                None => cpu::rdmsr(msr),
            }
        };
        context.regs.rax = value & 0xFFFF_FFFF;
        context.regs.rdx = value >> 32;
    }
}
