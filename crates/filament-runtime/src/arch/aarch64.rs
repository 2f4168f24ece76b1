//! aarch64 context switching
//!
//! Saves x19-x28, fp/lr, sp and the callee-saved low halves of v8-v15
//! per the AAPCS64 calling convention.

use std::arch::naked_asm;

/// Callee-saved register set for AAPCS64.
///
/// Field order is load-bearing: the assembly below addresses fields by
/// fixed byte offsets.
#[repr(C)]
#[derive(Debug)]
pub struct Context {
    pub sp: u64,      // 0x00
    pub pc: u64,      // 0x08
    pub x19: u64,     // 0x10
    pub x20: u64,     // 0x18
    pub x21: u64,     // 0x20
    pub x22: u64,     // 0x28
    pub x23: u64,     // 0x30
    pub x24: u64,     // 0x38
    pub x25: u64,     // 0x40
    pub x26: u64,     // 0x48
    pub x27: u64,     // 0x50
    pub x28: u64,     // 0x58
    pub x29: u64,     // 0x60 (frame pointer)
    pub x30: u64,     // 0x68 (link register)
    pub d: [u64; 8],  // 0x70..0xB0 (d8-d15)
}

impl Context {
    pub const fn zeroed() -> Self {
        Context {
            sp: 0,
            pc: 0,
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            x29: 0,
            x30: 0,
            d: [0; 8],
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
    let ctx = &mut *ctx;
    *ctx = Context::zeroed();
    ctx.sp = (stack_top as usize & !0xF) as u64;
    ctx.pc = fiber_trampoline as usize as u64;
    ctx.x19 = entry_fn as usize as u64;
    ctx.x20 = entry_arg as u64;
}

/// First instruction a fresh fiber executes: call the entry function with
/// its argument. The entry function terminates the fiber and switches
/// away itself, so falling through is impossible.
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!("mov x0, x20", "blr x19", "brk #0x1",);
}

/// Save the callee-saved registers into `save` and load `load`.
///
/// # Safety
///
/// Both pointers must reference valid `Context` memory; `load` must hold
/// either a context prepared by `init_context` or one previously saved
/// by this function.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut Context, _load: *const Context) {
    naked_asm!(
        // Save into `save` (x0).
        "mov x9, sp",
        "str x9, [x0, #0x00]",
        "adr x9, 2f",
        "str x9, [x0, #0x08]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "stp x29, x30, [x0, #0x60]",
        "stp d8, d9, [x0, #0x70]",
        "stp d10, d11, [x0, #0x80]",
        "stp d12, d13, [x0, #0x90]",
        "stp d14, d15, [x0, #0xa0]",
        // Load from `load` (x1).
        "ldr x9, [x1, #0x00]",
        "mov sp, x9",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldp x29, x30, [x1, #0x60]",
        "ldp d8, d9, [x1, #0x70]",
        "ldp d10, d11, [x1, #0x80]",
        "ldp d12, d13, [x1, #0x90]",
        "ldp d14, d15, [x1, #0xa0]",
        "ldr x9, [x1, #0x08]",
        "br x9",
        // Resume point for the saved context.
        "2:",
        "ret",
    );
}
