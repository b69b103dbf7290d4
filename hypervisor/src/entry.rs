//! Low-level entry and exit stubs.
//!
//! Context capture/restore and the VM-exit register save/restore cannot be
//! expressed in a high-level language; everything here is `global_asm!` with
//! a thin Rust landing on each side. The register frame layouts are pinned
//! with offset assertions so the assembly and the structs cannot drift.

use crate::vcpu::VmxState;
use core::arch::global_asm;
use core::mem::offset_of;

/// Guest general-purpose registers as saved by `vmexit_entry`. RSP is not
/// part of the frame; it lives in the VMCS.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// A resumable CPU context: general-purpose registers, stack, instruction
/// pointer, flags and the callee-saved SSE state.
#[repr(C, align(16))]
pub struct CapturedContext {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
    pub mxcsr: u32,
    _reserved1: u32,
    _reserved2: u64,
    pub xmm: [[u8; 16]; 10],
}

impl CapturedContext {
    pub fn zeroed() -> Self {
        // Plain-old-data; the all-zero pattern is valid.
        unsafe { core::mem::zeroed() }
    }
}

const _: () = {
    assert!(offset_of!(CapturedContext, rax) == 0x00);
    assert!(offset_of!(CapturedContext, rcx) == 0x08);
    assert!(offset_of!(CapturedContext, rdx) == 0x10);
    assert!(offset_of!(CapturedContext, rbx) == 0x18);
    assert!(offset_of!(CapturedContext, rbp) == 0x20);
    assert!(offset_of!(CapturedContext, rsi) == 0x28);
    assert!(offset_of!(CapturedContext, rdi) == 0x30);
    assert!(offset_of!(CapturedContext, r8) == 0x38);
    assert!(offset_of!(CapturedContext, r15) == 0x70);
    assert!(offset_of!(CapturedContext, rsp) == 0x78);
    assert!(offset_of!(CapturedContext, rip) == 0x80);
    assert!(offset_of!(CapturedContext, rflags) == 0x88);
    assert!(offset_of!(CapturedContext, mxcsr) == 0x90);
    assert!(offset_of!(CapturedContext, xmm) == 0xA0);
    assert!(core::mem::size_of::<CapturedContext>() == 0x140);
};

const _: () = {
    assert!(offset_of!(GuestRegisters, rax) == 0x00);
    assert!(offset_of!(GuestRegisters, r15) == 0x70);
    assert!(core::mem::size_of::<GuestRegisters>() == 0x78);
};

extern "win64" {
    /// Snapshots the calling CPU's context. "Returns" a second time, with
    /// identical register state, when the context is restored.
    pub fn capture_context(context: *mut CapturedContext);

    /// Resumes execution inside a captured context, including the
    /// callee-saved SSE state.
    pub fn restore_context(context: *const CapturedContext) -> !;

    /// Like [`restore_context`] but leaves the SSE state untouched; used
    /// when leaving VMX operation, where the live XMM registers already
    /// belong to the target context.
    pub fn devirtualize_restore(context: *const CapturedContext) -> !;

    /// First guest instruction after a successful VMLAUNCH.
    pub fn vmlaunch_entry();

    /// Host entry point on every VM exit.
    pub fn vmexit_entry();
}

// The quadword at [rsp] on entry to both stubs holds the VmxState pointer;
// see VmxState::host_stack_top.
global_asm!(
    r#"
.global vmlaunch_entry
vmlaunch_entry:
    mov     rcx, [rsp]
    sub     rsp, 48
    call    vmlaunch_landing

.global vmexit_entry
vmexit_entry:
    push    r15
    push    r14
    push    r13
    push    r12
    push    r11
    push    r10
    push    r9
    push    r8
    push    rdi
    push    rsi
    push    rbp
    push    rbx
    push    rdx
    push    rcx
    push    rax
    mov     rcx, [rsp + 120]
    mov     rdx, rsp
    sub     rsp, 40
    call    vmexit_dispatcher
    add     rsp, 40
    pop     rax
    pop     rcx
    pop     rdx
    pop     rbx
    pop     rbp
    pop     rsi
    pop     rdi
    pop     r8
    pop     r9
    pop     r10
    pop     r11
    pop     r12
    pop     r13
    pop     r14
    pop     r15
    vmresume
    sub     rsp, 32
    call    vmresume_failure
    int3

.global capture_context
capture_context:
    pushfq
    pop     qword ptr [rcx + 0x88]
    mov     [rcx + 0x00], rax
    mov     [rcx + 0x08], rcx
    mov     [rcx + 0x10], rdx
    mov     [rcx + 0x18], rbx
    mov     [rcx + 0x20], rbp
    mov     [rcx + 0x28], rsi
    mov     [rcx + 0x30], rdi
    mov     [rcx + 0x38], r8
    mov     [rcx + 0x40], r9
    mov     [rcx + 0x48], r10
    mov     [rcx + 0x50], r11
    mov     [rcx + 0x58], r12
    mov     [rcx + 0x60], r13
    mov     [rcx + 0x68], r14
    mov     [rcx + 0x70], r15
    lea     rax, [rsp + 8]
    mov     [rcx + 0x78], rax
    mov     rax, [rsp]
    mov     [rcx + 0x80], rax
    stmxcsr dword ptr [rcx + 0x90]
    movups  [rcx + 0xA0], xmm6
    movups  [rcx + 0xB0], xmm7
    movups  [rcx + 0xC0], xmm8
    movups  [rcx + 0xD0], xmm9
    movups  [rcx + 0xE0], xmm10
    movups  [rcx + 0xF0], xmm11
    movups  [rcx + 0x100], xmm12
    movups  [rcx + 0x110], xmm13
    movups  [rcx + 0x120], xmm14
    movups  [rcx + 0x130], xmm15
    ret

.global restore_context
restore_context:
    ldmxcsr dword ptr [rcx + 0x90]
    movups  xmm6,  [rcx + 0xA0]
    movups  xmm7,  [rcx + 0xB0]
    movups  xmm8,  [rcx + 0xC0]
    movups  xmm9,  [rcx + 0xD0]
    movups  xmm10, [rcx + 0xE0]
    movups  xmm11, [rcx + 0xF0]
    movups  xmm12, [rcx + 0x100]
    movups  xmm13, [rcx + 0x110]
    movups  xmm14, [rcx + 0x120]
    movups  xmm15, [rcx + 0x130]
.global devirtualize_restore
devirtualize_restore:
    mov     rsp, [rcx + 0x78]
    push    qword ptr [rcx + 0x80]
    push    qword ptr [rcx + 0x88]
    popfq
    mov     rax, [rcx + 0x00]
    mov     rdx, [rcx + 0x10]
    mov     rbx, [rcx + 0x18]
    mov     rbp, [rcx + 0x20]
    mov     rsi, [rcx + 0x28]
    mov     rdi, [rcx + 0x30]
    mov     r8,  [rcx + 0x38]
    mov     r9,  [rcx + 0x40]
    mov     r10, [rcx + 0x48]
    mov     r11, [rcx + 0x50]
    mov     r12, [rcx + 0x58]
    mov     r13, [rcx + 0x60]
    mov     r14, [rcx + 0x68]
    mov     r15, [rcx + 0x70]
    mov     rcx, [rcx + 0x08]
    ret
"#
);

/// Reached as the first guest code after VMLAUNCH; unwinds back into the
/// captured launch context so the kernel continues where it left off, now in
/// non-root operation.
#[no_mangle]
unsafe extern "win64" fn vmlaunch_landing(state: *mut VmxState) -> ! {
    let state = &mut *state;
    state.launch_context.launched = true;
    restore_context(&state.launch_context.context_frame)
}

/// VMRESUME fell through; there is no guest to go back to.
#[no_mangle]
unsafe extern "win64" fn vmresume_failure() -> ! {
    let error = crate::vmx::vmread(crate::vmcs::VM_INSTRUCTION_ERROR);
    log::error!("VMRESUME failed with error {}", error);
    loop {
        x86_64::instructions::hlt();
    }
}
