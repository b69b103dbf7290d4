//! VMCS field encodings and per-CPU VMCS population.

use crate::ept::Ept;
use crate::vcpu::{VmxState, MSR_TRUE_ENTRY_CTLS, MSR_TRUE_EXIT_CTLS, MSR_TRUE_PINBASED_CTLS, MSR_TRUE_PROCBASED_CTLS, MSR_PROCBASED_CTLS2};
use crate::vmx;
use bit_field::BitField;
use x86_64::VirtAddr;

// 16-bit control fields.
pub const VIRTUAL_PROCESSOR_IDENTIFIER: u32 = 0x0000;

// 16-bit guest state fields.
pub const GUEST_ES_SELECTOR: u32 = 0x0800;
pub const GUEST_CS_SELECTOR: u32 = 0x0802;
pub const GUEST_SS_SELECTOR: u32 = 0x0804;
pub const GUEST_DS_SELECTOR: u32 = 0x0806;
pub const GUEST_FS_SELECTOR: u32 = 0x0808;
pub const GUEST_GS_SELECTOR: u32 = 0x080A;
pub const GUEST_LDTR_SELECTOR: u32 = 0x080C;
pub const GUEST_TR_SELECTOR: u32 = 0x080E;

// 16-bit host state fields.
pub const HOST_ES_SELECTOR: u32 = 0x0C00;
pub const HOST_CS_SELECTOR: u32 = 0x0C02;
pub const HOST_SS_SELECTOR: u32 = 0x0C04;
pub const HOST_DS_SELECTOR: u32 = 0x0C06;
pub const HOST_FS_SELECTOR: u32 = 0x0C08;
pub const HOST_GS_SELECTOR: u32 = 0x0C0A;
pub const HOST_TR_SELECTOR: u32 = 0x0C0C;

// 64-bit control fields.
pub const MSR_BITMAP_ADDRESS: u32 = 0x2004;
pub const EPT_POINTER: u32 = 0x201A;
pub const GUEST_PHYSICAL_ADDRESS: u32 = 0x2400;
pub const VMCS_LINK_POINTER: u32 = 0x2800;
pub const GUEST_DEBUGCTL: u32 = 0x2802;
pub const GUEST_EFER: u32 = 0x2806;

// 32-bit control fields.
pub const PIN_BASED_VM_EXECUTION_CONTROLS: u32 = 0x4000;
pub const PROCESSOR_BASED_VM_EXECUTION_CONTROLS: u32 = 0x4002;
pub const EXCEPTION_BITMAP: u32 = 0x4004;
pub const PRIMARY_VMEXIT_CONTROLS: u32 = 0x400C;
pub const VMENTRY_CONTROLS: u32 = 0x4012;
pub const VMENTRY_INTERRUPTION_INFORMATION: u32 = 0x4016;
pub const VMENTRY_EXCEPTION_ERROR_CODE: u32 = 0x4018;
pub const SECONDARY_PROCESSOR_BASED_VM_EXECUTION_CONTROLS: u32 = 0x401E;

// 32-bit read-only data fields.
pub const VM_INSTRUCTION_ERROR: u32 = 0x4400;
pub const EXIT_REASON: u32 = 0x4402;
pub const VMEXIT_INTERRUPTION_INFORMATION: u32 = 0x4404;
pub const VMEXIT_INTERRUPTION_ERROR_CODE: u32 = 0x4406;
pub const VMEXIT_INSTRUCTION_LENGTH: u32 = 0x440C;

// 32-bit guest state fields.
pub const GUEST_ES_LIMIT: u32 = 0x4800;
pub const GUEST_CS_LIMIT: u32 = 0x4802;
pub const GUEST_SS_LIMIT: u32 = 0x4804;
pub const GUEST_DS_LIMIT: u32 = 0x4806;
pub const GUEST_FS_LIMIT: u32 = 0x4808;
pub const GUEST_GS_LIMIT: u32 = 0x480A;
pub const GUEST_LDTR_LIMIT: u32 = 0x480C;
pub const GUEST_TR_LIMIT: u32 = 0x480E;
pub const GUEST_GDTR_LIMIT: u32 = 0x4810;
pub const GUEST_IDTR_LIMIT: u32 = 0x4812;
pub const GUEST_ES_ACCESS_RIGHTS: u32 = 0x4814;
pub const GUEST_CS_ACCESS_RIGHTS: u32 = 0x4816;
pub const GUEST_SS_ACCESS_RIGHTS: u32 = 0x4818;
pub const GUEST_DS_ACCESS_RIGHTS: u32 = 0x481A;
pub const GUEST_FS_ACCESS_RIGHTS: u32 = 0x481C;
pub const GUEST_GS_ACCESS_RIGHTS: u32 = 0x481E;
pub const GUEST_LDTR_ACCESS_RIGHTS: u32 = 0x4820;
pub const GUEST_TR_ACCESS_RIGHTS: u32 = 0x4822;
pub const GUEST_SYSENTER_CS: u32 = 0x482A;

// Natural-width control fields.
pub const CR0_READ_SHADOW: u32 = 0x6004;
pub const CR4_READ_SHADOW: u32 = 0x6006;

// Natural-width read-only data fields.
pub const EXIT_QUALIFICATION: u32 = 0x6400;

// Natural-width guest state fields.
pub const GUEST_CR0: u32 = 0x6800;
pub const GUEST_CR3: u32 = 0x6802;
pub const GUEST_CR4: u32 = 0x6804;
pub const GUEST_ES_BASE: u32 = 0x6806;
pub const GUEST_CS_BASE: u32 = 0x6808;
pub const GUEST_SS_BASE: u32 = 0x680A;
pub const GUEST_DS_BASE: u32 = 0x680C;
pub const GUEST_FS_BASE: u32 = 0x680E;
pub const GUEST_GS_BASE: u32 = 0x6810;
pub const GUEST_LDTR_BASE: u32 = 0x6812;
pub const GUEST_TR_BASE: u32 = 0x6814;
pub const GUEST_GDTR_BASE: u32 = 0x6816;
pub const GUEST_IDTR_BASE: u32 = 0x6818;
pub const GUEST_DR7: u32 = 0x681A;
pub const GUEST_RSP: u32 = 0x681C;
pub const GUEST_RIP: u32 = 0x681E;
pub const GUEST_RFLAGS: u32 = 0x6820;
pub const GUEST_SYSENTER_ESP: u32 = 0x6824;
pub const GUEST_SYSENTER_EIP: u32 = 0x6826;

// Natural-width host state fields.
pub const HOST_CR0: u32 = 0x6C00;
pub const HOST_CR3: u32 = 0x6C02;
pub const HOST_CR4: u32 = 0x6C04;
pub const HOST_FS_BASE: u32 = 0x6C06;
pub const HOST_GS_BASE: u32 = 0x6C08;
pub const HOST_TR_BASE: u32 = 0x6C0A;
pub const HOST_GDTR_BASE: u32 = 0x6C0C;
pub const HOST_IDTR_BASE: u32 = 0x6C0E;
pub const HOST_RSP: u32 = 0x6C14;
pub const HOST_RIP: u32 = 0x6C16;

// Control bits used during setup.
const PROCBASED_ACTIVATE_SECONDARY: u64 = 1 << 31;
const PROCBASED_USE_MSR_BITMAPS: u64 = 1 << 28;
pub const PROCBASED_MONITOR_TRAP_FLAG: u64 = 1 << 27;
const SECONDARY_ENABLE_RDTSCP: u64 = 1 << 3;
const SECONDARY_ENABLE_INVPCID: u64 = 1 << 12;
const SECONDARY_ENABLE_XSAVES: u64 = 1 << 20;
const EXIT_HOST_ADDRESS_SPACE_SIZE: u64 = 1 << 9;
pub const EXIT_SAVE_IA32_EFER: u64 = 1 << 20;
const ENTRY_IA32E_MODE_GUEST: u64 = 1 << 9;
pub const ENTRY_LOAD_IA32_EFER: u64 = 1 << 15;

const SELECTOR_RPL_MASK: u16 = 0x3;
const SELECTOR_TABLE_BIT: u16 = 0x4;

/// Folds a capability MSR into a desired control value: allowed-zero bits in
/// the low dword are forced on, allowed-one bits in the high dword mask the
/// rest off.
pub fn adjust_msr(capability: u64, desired: u64) -> u64 {
    let mut value = desired as u32;
    value &= (capability >> 32) as u32;
    value |= capability as u32;
    value as u64
}

/// Guest-usable view of one GDT entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GdtEntry {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access_rights: u32,
}

pub const ACCESS_RIGHTS_UNUSABLE: u32 = 1 << 16;

/// Reads a segment descriptor and converts it into the selector, base, limit
/// and VMX access rights the guest segment fields expect.
///
/// # Safety
/// `gdt_base` must point at a descriptor table at least `selector`-index
/// entries long.
pub unsafe fn convert_gdt_entry(gdt_base: VirtAddr, selector: u16) -> GdtEntry {
    // Null and LDT-relative selectors become unusable segments.
    if selector == 0 || selector & SELECTOR_TABLE_BIT != 0 {
        return GdtEntry {
            access_rights: ACCESS_RIGHTS_UNUSABLE,
            ..GdtEntry::default()
        };
    }

    let index = u64::from(selector & !(SELECTOR_RPL_MASK | SELECTOR_TABLE_BIT));
    let descriptor_address = gdt_base.as_u64() + index;
    let descriptor = core::ptr::read_unaligned(descriptor_address as *const u64);

    let mut base = descriptor.get_bits(16..32);
    base |= descriptor.get_bits(32..40) << 16;
    base |= descriptor.get_bits(56..64) << 24;

    // System descriptors (TSS, LDT) are 16 bytes and carry base bits 32..64
    // in the following quadword.
    let system_segment = !descriptor.get_bit(44);
    if system_segment {
        let upper = core::ptr::read_unaligned((descriptor_address + 8) as *const u64);
        base |= upper.get_bits(0..32) << 32;
    }

    let mut limit = (descriptor.get_bits(0..16) | (descriptor.get_bits(48..52) << 16)) as u32;
    if descriptor.get_bit(55) {
        limit = (limit << 12) | 0xFFF;
    }

    let mut access_rights = 0u32;
    access_rights.set_bits(0..4, descriptor.get_bits(40..44) as u32);
    access_rights.set_bit(4, descriptor.get_bit(44));
    access_rights.set_bits(5..7, descriptor.get_bits(45..47) as u32);
    access_rights.set_bit(7, descriptor.get_bit(47));
    access_rights.set_bit(12, descriptor.get_bit(52));
    access_rights.set_bit(13, descriptor.get_bit(53));
    access_rights.set_bit(14, descriptor.get_bit(54));
    access_rights.set_bit(15, descriptor.get_bit(55));
    access_rights.set_bit(16, !descriptor.get_bit(47));

    GdtEntry {
        selector,
        base,
        limit,
        access_rights,
    }
}

unsafe fn write_guest_segment(
    selector_field: u32,
    entry: &GdtEntry,
) {
    // The four fields of one segment register sit at fixed distances from the
    // selector encoding.
    let limit_field = GUEST_ES_LIMIT + (selector_field - GUEST_ES_SELECTOR);
    let access_field = GUEST_ES_ACCESS_RIGHTS + (selector_field - GUEST_ES_SELECTOR);
    let base_field = GUEST_ES_BASE + (selector_field - GUEST_ES_SELECTOR);

    vmx::vmwrite(selector_field, u64::from(entry.selector));
    vmx::vmwrite(limit_field, u64::from(entry.limit));
    vmx::vmwrite(access_field, u64::from(entry.access_rights));
    vmx::vmwrite(base_field, entry.base);
}

/// Populates every guest, host and control field of the current VMCS from the
/// captured launch context.
///
/// # Safety
/// A VMCS must be active and current on this CPU, and `state` must describe
/// this CPU.
pub unsafe fn setup_vmcs_for_cpu(state: &mut VmxState, ept: &Ept) {
    let launch_context = &state.launch_context;
    let registers = &launch_context.special_registers;

    vmx::vmwrite(VMCS_LINK_POINTER, !0u64);

    if launch_context.ept_controls != 0 {
        vmx::vmwrite(EPT_POINTER, ept.pointer());
        vmx::vmwrite(VIRTUAL_PROCESSOR_IDENTIFIER, 1);
    }

    vmx::vmwrite(MSR_BITMAP_ADDRESS, launch_context.msr_bitmap_physical_address);

    let secondary = launch_context.ept_controls
        | SECONDARY_ENABLE_RDTSCP
        | SECONDARY_ENABLE_INVPCID
        | SECONDARY_ENABLE_XSAVES;
    vmx::vmwrite(
        SECONDARY_PROCESSOR_BASED_VM_EXECUTION_CONTROLS,
        adjust_msr(launch_context.msr_data[MSR_PROCBASED_CTLS2], secondary),
    );

    vmx::vmwrite(
        PIN_BASED_VM_EXECUTION_CONTROLS,
        adjust_msr(launch_context.msr_data[MSR_TRUE_PINBASED_CTLS], 0),
    );

    vmx::vmwrite(
        PROCESSOR_BASED_VM_EXECUTION_CONTROLS,
        adjust_msr(
            launch_context.msr_data[MSR_TRUE_PROCBASED_CTLS],
            PROCBASED_ACTIVATE_SECONDARY | PROCBASED_USE_MSR_BITMAPS,
        ),
    );

    vmx::vmwrite(
        PRIMARY_VMEXIT_CONTROLS,
        adjust_msr(
            launch_context.msr_data[MSR_TRUE_EXIT_CTLS],
            EXIT_HOST_ADDRESS_SPACE_SIZE,
        ),
    );

    vmx::vmwrite(
        VMENTRY_CONTROLS,
        adjust_msr(
            launch_context.msr_data[MSR_TRUE_ENTRY_CTLS],
            ENTRY_IA32E_MODE_GUEST,
        ),
    );

    let gdt_base = registers.gdtr.base;
    let host_selector_mask = !SELECTOR_RPL_MASK;

    let entry = convert_gdt_entry(gdt_base, registers.cs);
    write_guest_segment(GUEST_CS_SELECTOR, &entry);
    vmx::vmwrite(HOST_CS_SELECTOR, u64::from(registers.cs & host_selector_mask));

    let entry = convert_gdt_entry(gdt_base, registers.ss);
    write_guest_segment(GUEST_SS_SELECTOR, &entry);
    vmx::vmwrite(HOST_SS_SELECTOR, u64::from(registers.ss & host_selector_mask));

    let entry = convert_gdt_entry(gdt_base, registers.ds);
    write_guest_segment(GUEST_DS_SELECTOR, &entry);
    vmx::vmwrite(HOST_DS_SELECTOR, u64::from(registers.ds & host_selector_mask));

    let entry = convert_gdt_entry(gdt_base, registers.es);
    write_guest_segment(GUEST_ES_SELECTOR, &entry);
    vmx::vmwrite(HOST_ES_SELECTOR, u64::from(registers.es & host_selector_mask));

    let entry = convert_gdt_entry(gdt_base, registers.fs);
    write_guest_segment(GUEST_FS_SELECTOR, &entry);
    vmx::vmwrite(HOST_FS_BASE, entry.base);
    vmx::vmwrite(HOST_FS_SELECTOR, u64::from(registers.fs & host_selector_mask));

    let mut entry = convert_gdt_entry(gdt_base, registers.gs);
    entry.base = registers.msr_gs_base;
    write_guest_segment(GUEST_GS_SELECTOR, &entry);
    vmx::vmwrite(HOST_GS_BASE, registers.msr_gs_base);
    vmx::vmwrite(HOST_GS_SELECTOR, u64::from(registers.gs & host_selector_mask));

    let entry = convert_gdt_entry(gdt_base, registers.tr);
    write_guest_segment(GUEST_TR_SELECTOR, &entry);
    vmx::vmwrite(HOST_TR_BASE, entry.base);
    vmx::vmwrite(HOST_TR_SELECTOR, u64::from(registers.tr & host_selector_mask));

    let entry = convert_gdt_entry(gdt_base, registers.ldtr);
    write_guest_segment(GUEST_LDTR_SELECTOR, &entry);

    vmx::vmwrite(GUEST_GDTR_BASE, registers.gdtr.base.as_u64());
    vmx::vmwrite(GUEST_GDTR_LIMIT, u64::from(registers.gdtr.limit));
    vmx::vmwrite(HOST_GDTR_BASE, registers.gdtr.base.as_u64());

    vmx::vmwrite(GUEST_IDTR_BASE, registers.idtr.base.as_u64());
    vmx::vmwrite(GUEST_IDTR_LIMIT, u64::from(registers.idtr.limit));
    vmx::vmwrite(HOST_IDTR_BASE, registers.idtr.base.as_u64());

    vmx::vmwrite(CR0_READ_SHADOW, registers.cr0);
    vmx::vmwrite(HOST_CR0, registers.cr0);
    vmx::vmwrite(GUEST_CR0, registers.cr0);

    vmx::vmwrite(HOST_CR3, launch_context.system_directory_table_base);
    vmx::vmwrite(GUEST_CR3, registers.cr3);

    vmx::vmwrite(HOST_CR4, registers.cr4);
    vmx::vmwrite(GUEST_CR4, registers.cr4);
    vmx::vmwrite(CR4_READ_SHADOW, registers.cr4);

    vmx::vmwrite(GUEST_DEBUGCTL, registers.msr_debug_control);
    vmx::vmwrite(GUEST_DR7, registers.kernel_dr7);

    // The guest "starts" inside the launch stub on this CPU's host stack and
    // immediately restores the captured frame.
    let stack_pointer = state.host_stack_top();
    *(stack_pointer as *mut u64) = state as *mut VmxState as u64;

    vmx::vmwrite(GUEST_RSP, stack_pointer);
    vmx::vmwrite(GUEST_RIP, crate::entry::vmlaunch_entry as usize as u64);
    vmx::vmwrite(GUEST_RFLAGS, state.launch_context.context_frame.rflags);

    vmx::vmwrite(HOST_RSP, stack_pointer);
    vmx::vmwrite(HOST_RIP, crate::entry::vmexit_entry as usize as u64);
}

/// Flips one vector in the exception bitmap of the current VMCS.
pub unsafe fn set_exception_bit(vector: u8, value: bool) {
    let mut bitmap = vmx::vmread(EXCEPTION_BITMAP);
    if value {
        bitmap |= 1 << vector;
    } else {
        bitmap &= !(1 << vector);
    }
    vmx::vmwrite(EXCEPTION_BITMAP, bitmap);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_forces_required_bits() {
        // allowed-zero = 0x16, allowed-one = 0xFFFF_FFFF.
        let capability = 0xFFFF_FFFF_0000_0016u64;
        assert_eq!(adjust_msr(capability, 0), 0x16);
        assert_eq!(adjust_msr(capability, 0x8000_0000), 0x8000_0016);
    }

    #[test]
    fn adjust_masks_unsupported_bits() {
        let capability = 0x0000_00FF_0000_0001u64;
        assert_eq!(adjust_msr(capability, 0xFFFF_FFFF), 0xFF);
    }

    #[test]
    fn null_selector_is_unusable() {
        let entry = unsafe { convert_gdt_entry(VirtAddr::new(0x1000), 0) };
        assert_eq!(entry.access_rights, ACCESS_RIGHTS_UNUSABLE);
        assert_eq!(entry.base, 0);
        assert_eq!(entry.limit, 0);
    }

    #[test]
    fn ldt_selector_is_unusable() {
        let entry = unsafe { convert_gdt_entry(VirtAddr::new(0x1000), 0x14) };
        assert_eq!(entry.access_rights, ACCESS_RIGHTS_UNUSABLE);
    }

    #[test]
    fn kernel_code_descriptor_converts() {
        // Long-mode code segment: type=0xB, S=1, DPL=0, P=1, L=1, G=1,
        // limit=0xFFFFF.
        let gdt: [u64; 2] = [0, 0x00AF_9B00_0000_FFFF];
        let entry =
            unsafe { convert_gdt_entry(VirtAddr::from_ptr(gdt.as_ptr()), 0x08) };

        assert_eq!(entry.selector, 0x08);
        assert_eq!(entry.base, 0);
        assert_eq!(entry.limit, 0xFFFF_FFFF);
        assert_eq!(entry.access_rights, 0xA09B);
    }

    #[test]
    fn data_descriptor_converts() {
        // Flat data segment: type=0x3, S=1, DPL=0, P=1, D/B=1, G=1.
        let gdt: [u64; 2] = [0, 0x00CF_9300_0000_FFFF];
        let entry =
            unsafe { convert_gdt_entry(VirtAddr::from_ptr(gdt.as_ptr()), 0x08) };

        assert_eq!(entry.limit, 0xFFFF_FFFF);
        assert_eq!(entry.access_rights, 0xC093);
    }

    #[test]
    fn system_descriptor_uses_upper_base() {
        // 64-bit TSS descriptor with base 0xFFFF_F800_0012_3000.
        let low: u64 = {
            let base: u64 = 0xFFFF_F800_0012_3000;
            let mut descriptor = 0x0000_8900_0000_0067u64;
            descriptor |= base.get_bits(0..24) << 16;
            descriptor |= base.get_bits(24..32) << 56;
            descriptor
        };
        let high: u64 = 0xFFFF_F800_0012_3000u64 >> 32;
        let gdt: [u64; 4] = [0, 0, low, high];

        let entry =
            unsafe { convert_gdt_entry(VirtAddr::from_ptr(gdt.as_ptr()), 0x10) };

        assert_eq!(entry.base, 0xFFFF_F800_0012_3000);
        assert_eq!(entry.limit, 0x67);
        // Busy/available 64-bit TSS, present, system.
        assert_eq!(entry.access_rights & 0xFF, 0x89);
        assert_eq!(entry.access_rights & ACCESS_RIGHTS_UNUSABLE, 0);
    }

    #[test]
    fn absent_descriptor_is_unusable() {
        let gdt: [u64; 2] = [0, 0x00AF_1B00_0000_FFFF]; // P = 0
        let entry =
            unsafe { convert_gdt_entry(VirtAddr::from_ptr(gdt.as_ptr()), 0x08) };
        assert_ne!(entry.access_rights & ACCESS_RIGHTS_UNUSABLE, 0);
    }
}
