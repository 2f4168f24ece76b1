//! x86_64 context switching
//!
//! Inline assembly, stable since Rust 1.88 (`naked_asm`).

use std::arch::naked_asm;

/// Callee-saved register set per the System V AMD64 ABI, plus the stack
/// pointer and resume address.
///
/// Field order is load-bearing: the assembly below addresses fields by
/// fixed byte offsets.
#[repr(C)]
#[derive(Debug)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl Context {
    pub const fn zeroed() -> Self {
        Context {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Prepare `ctx` so the first switch into it enters `entry_fn(entry_arg)`
/// on the given stack.
///
/// # Safety
///
/// `ctx` must point to valid `Context` memory and `stack_top` to the top
/// of a live stack mapping. `entry_fn` must never return.
#[inline]
pub unsafe fn init_context(
    ctx: *mut Context,
    stack_top: *mut u8,
    entry_fn: extern "C" fn(usize),
    entry_arg: usize,
) {
    // 16-byte alignment per the ABI, minus 8 to mimic a `call` push.
    let aligned_sp = (stack_top as usize & !0xF) - 8;

    let ctx = &mut *ctx;
    ctx.rsp = aligned_sp as u64;
    ctx.rip = fiber_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as usize as u64;
    ctx.r13 = entry_arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First instruction a fresh fiber executes: call the entry function with
/// its argument. The entry function terminates the fiber and switches
/// away itself, so falling through is impossible.
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!("mov rdi, r13", "call r12", "ud2",);
}

/// Save the callee-saved registers into `save` and load `load`.
///
/// Returns (to the saved resume point) when some other context switches
/// back into `save`.
///
/// # Safety
///
/// Both pointers must reference valid `Context` memory; `load` must hold
/// either a context prepared by `init_context` or one previously saved
/// by this function.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut Context, _load: *const Context) {
    naked_asm!(
        // Save into `save` (RDI).
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load from `load` (RSI).
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved context.
        "2:",
        "ret",
    );
}
