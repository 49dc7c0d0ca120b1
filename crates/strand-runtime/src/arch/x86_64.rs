//! x86_64 context switching implementation
//!
//! Inline naked assembly, stable since Rust 1.88.

use std::arch::naked_asm;
use strand_core::context::Context;

use crate::fiber::fiber_finished;

/// Prime a fresh fiber's context.
///
/// Sets up the register record so that the first switch into it enters
/// `fiber_entry_trampoline`, which moves `entry_arg` into `rdi` and
/// calls `entry_fn`.
///
/// # Safety
///
/// `ctx` must point to valid `Context` memory and `stack_top` must be
/// the high end of a live, writable stack mapping.
#[inline]
pub unsafe fn init_context(
    ctx: *mut Context,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    let sp = stack_top as usize;

    // 16-byte aligned per the System V AMD64 ABI; the trampoline's
    // `call` then leaves the entry function with the standard
    // entry alignment (rsp ≡ 8 mod 16).
    let aligned_sp = sp & !0xF;

    let ctx = &mut *ctx;
    ctx.rsp = aligned_sp as u64;
    ctx.rip = fiber_entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as u64;
    ctx.r13 = entry_arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// Trampoline that calls the entry function with its argument.
///
/// If the entry function ever returns (the fiber mainline performs its
/// own final switch and should not), control falls through to
/// `fiber_finished` which switches back to the thread root.
#[unsafe(naked)]
pub unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "call {finished}",
        "ud2",
        finished = sym fiber_finished,
    );
}

/// Save the current callee-saved state into `save` and restore `load`.
///
/// Execution continues at `load`'s saved instruction pointer; when the
/// saved context is later switched back in, this call appears to
/// return normally.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_save: *mut Context, _load: *const Context) {
    naked_asm!(
        // Save callee-saved registers to save (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from load (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to new RIP
        "jmp rax",
        // Return point for the saved context
        "1:",
        "ret",
    );
}
