//! x86_64 context switch.
//!
//! Switches happen only at call boundaries, so saving the callee-saved set
//! of the System V AMD64 ABI is sufficient: rsp, the resume address, rbx,
//! rbp, r12-r15. Caller-saved registers are dead at every switch point.

use std::arch::naked_asm;

/// Callee-saved register frame of a suspended execution context.
///
/// Field order is load-bearing: the switch assembly addresses the struct by
/// byte offset.
#[repr(C)]
pub struct Context {
    pub sp: u64,  // 0x00
    pub ip: u64,  // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl Default for Context {
    fn default() -> Self {
        Self {
            sp: 0,
            ip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Prepare `ctx` so the first switch into it enters `entry` with `arg` as
/// its only argument, running on the stack whose upper end is `stack_top`.
///
/// # Safety
///
/// `stack_top` must be the top of a mapped, writable stack. `entry` must be
/// an `extern "C" fn(usize)` that never returns.
pub unsafe fn init_context(ctx: &mut Context, stack_top: *mut u8, entry: usize, arg: usize) {
    // The trampoline runs at 16-byte alignment; its `call` then gives the
    // entry function the standard post-call alignment.
    ctx.sp = (stack_top as u64) & !0xF;
    ctx.ip = entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry as u64;
    ctx.r13 = arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First instructions a fresh context executes: forward the stashed
/// argument and enter the entry function.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        // The entry function switches away for good instead of returning.
        "ud2",
    );
}

/// Save the current callee-saved state into `save` and resume `load`.
///
/// Control comes back (returning from this call) when some later switch
/// loads the `save` frame again.
///
/// # Safety
///
/// Both pointers must be valid; `load` must hold a frame produced by
/// `init_context` or by a previous save.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut Context, _load: *const Context) {
    naked_asm!(
        // Save into `save` (rdi).
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load from `load` (rsi) and jump to its resume address.
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved frame.
        "2:",
        "ret",
    );
}
