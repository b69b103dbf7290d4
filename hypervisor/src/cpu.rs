//! Privileged instruction wrappers.
//!
//! Thin `asm!` shims around the handful of instructions the core needs that
//! neither the `x86_64` crate nor an intrinsic covers: descriptor-table and
//! segment stores, control-register raw access and XSETBV.

use core::arch::asm;
use x86_64::registers::model_specific::Msr;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

// MSRs not named by the x86_64 crate.
pub const IA32_FEATURE_CONTROL: u32 = 0x3A;
pub const IA32_MTRR_CAPABILITIES: u32 = 0xFE;
pub const IA32_MTRR_PHYSBASE0: u32 = 0x200;
pub const IA32_MTRR_PHYSMASK0: u32 = 0x201;
pub const IA32_DEBUGCTL: u32 = 0x1D9;
pub const IA32_SYSENTER_CS: u32 = 0x174;
pub const IA32_SYSENTER_ESP: u32 = 0x175;
pub const IA32_SYSENTER_EIP: u32 = 0x176;
pub const IA32_EFER: u32 = 0xC000_0080;
pub const IA32_STAR: u32 = 0xC000_0081;
pub const IA32_LSTAR: u32 = 0xC000_0082;
pub const IA32_FMASK: u32 = 0xC000_0084;
pub const IA32_FS_BASE: u32 = 0xC000_0100;
pub const IA32_GS_BASE: u32 = 0xC000_0101;
pub const IA32_VMX_BASIC: u32 = 0x480;
pub const IA32_VMX_EXIT_CTLS: u32 = 0x483;
pub const IA32_VMX_ENTRY_CTLS: u32 = 0x484;
pub const IA32_VMX_TRUE_EXIT_CTLS: u32 = 0x48F;
pub const IA32_VMX_TRUE_ENTRY_CTLS: u32 = 0x490;

/// Number of VMX capability MSRs captured at launch (0x480..=0x490).
pub const VMX_MSR_COUNT: usize = 17;

pub unsafe fn rdmsr(msr: u32) -> u64 {
    Msr::new(msr).read()
}

pub unsafe fn wrmsr(msr: u32, value: u64) {
    Msr::new(msr).write(value)
}

pub fn cpuid(leaf: u32, sub_leaf: u32) -> core::arch::x86_64::CpuidResult {
    unsafe { core::arch::x86_64::__cpuid_count(leaf, sub_leaf) }
}

pub fn read_cr0() -> u64 {
    x86_64::registers::control::Cr0::read_raw()
}

pub unsafe fn write_cr0(value: u64) {
    x86_64::registers::control::Cr0::write_raw(value)
}

pub fn read_cr3() -> u64 {
    let value: u64;
    unsafe { asm!("mov {}, cr3", out(reg) value, options(nomem, nostack)) };
    value
}

pub unsafe fn write_cr3(value: u64) {
    asm!("mov cr3, {}", in(reg) value, options(nostack));
}

pub unsafe fn write_cr2(value: u64) {
    asm!("mov cr2, {}", in(reg) value, options(nomem, nostack));
}

pub fn read_cr4() -> u64 {
    x86_64::registers::control::Cr4::read_raw()
}

pub unsafe fn write_cr4(value: u64) {
    x86_64::registers::control::Cr4::write_raw(value)
}

pub fn read_dr7() -> u64 {
    let value: u64;
    unsafe { asm!("mov {}, dr7", out(reg) value, options(nomem, nostack)) };
    value
}

pub fn sgdt() -> DescriptorTablePointer {
    let mut table = DescriptorTablePointer {
        limit: 0,
        base: VirtAddr::zero(),
    };
    unsafe { asm!("sgdt [{}]", in(reg) &mut table, options(nostack)) };
    table
}

pub fn sidt() -> DescriptorTablePointer {
    let mut table = DescriptorTablePointer {
        limit: 0,
        base: VirtAddr::zero(),
    };
    unsafe { asm!("sidt [{}]", in(reg) &mut table, options(nostack)) };
    table
}

pub unsafe fn lgdt(table: &DescriptorTablePointer) {
    asm!("lgdt [{}]", in(reg) table, options(nostack));
}

pub unsafe fn lidt(table: &DescriptorTablePointer) {
    asm!("lidt [{}]", in(reg) table, options(nostack));
}

pub fn read_tr() -> u16 {
    let selector: u16;
    unsafe { asm!("str {0:x}", out(reg) selector, options(nomem, nostack)) };
    selector
}

pub unsafe fn load_tr(selector: u16) {
    asm!("ltr {0:x}", in(reg) selector, options(nomem, nostack));
}

pub fn read_ldtr() -> u16 {
    let selector: u16;
    unsafe { asm!("sldt {0:x}", out(reg) selector, options(nomem, nostack)) };
    selector
}

pub fn read_cs() -> u16 {
    let selector: u16;
    unsafe { asm!("mov {0:x}, cs", out(reg) selector, options(nomem, nostack)) };
    selector
}

pub fn read_ss() -> u16 {
    let selector: u16;
    unsafe { asm!("mov {0:x}, ss", out(reg) selector, options(nomem, nostack)) };
    selector
}

pub fn read_ds() -> u16 {
    let selector: u16;
    unsafe { asm!("mov {0:x}, ds", out(reg) selector, options(nomem, nostack)) };
    selector
}

pub fn read_es() -> u16 {
    let selector: u16;
    unsafe { asm!("mov {0:x}, es", out(reg) selector, options(nomem, nostack)) };
    selector
}

pub fn read_fs() -> u16 {
    let selector: u16;
    unsafe { asm!("mov {0:x}, fs", out(reg) selector, options(nomem, nostack)) };
    selector
}

pub fn read_gs() -> u16 {
    let selector: u16;
    unsafe { asm!("mov {0:x}, gs", out(reg) selector, options(nomem, nostack)) };
    selector
}

pub unsafe fn wbinvd() {
    asm!("wbinvd", options(nostack));
}

pub unsafe fn invd() {
    asm!("invd", options(nostack));
}

pub unsafe fn xsetbv(register: u32, value: u64) {
    asm!(
        "xsetbv",
        in("ecx") register,
        in("eax") value as u32,
        in("edx") (value >> 32) as u32,
        options(nomem, nostack),
    );
}
