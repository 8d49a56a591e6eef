//! Low-level code to move control between user and kernel mode.
//!
//! The kernel maps the page holding this code at the same virtual address (`TRAMPOLINE`) in every
//! user page table and in the kernel page table, so the mapping stays valid across the `satp`
//! switch that happens mid-transition. `uservec`/`userret` only run asm: Rust has nowhere safe to
//! spill a register before the page table underneath it changes.
//!
//! Byte offsets below must track `proc::TrapFrame`'s field order exactly; there is no compiler
//! check tying the two together.

use core::arch::naked_asm;

use crate::memlayout::TRAPFRAME;

#[unsafe(no_mangle)]
#[unsafe(link_section = "trampsec")]
#[rustc_align(4)]
pub unsafe extern "C" fn trampoline_start() {
    unreachable!("trampoline_start is a page anchor, never called directly");
}

/// Entered with `stvec` pointing here and a user page table still installed. Saves every user
/// register into the trap frame, reloads the kernel `satp`/`sp`/`tp`, and jumps to `usertrap`.
///
/// # Safety
/// Only ever reached via a trap from user mode; never called as a normal function.
#[cfg(target_arch = "riscv64")]
#[unsafe(no_mangle)]
#[unsafe(naked)]
#[unsafe(link_section = "trampsec")]
pub unsafe extern "C" fn uservec() -> ! {
    naked_asm!(
        "csrw sscratch, a0",
        "li a0, {tf}",
        "sd ra, 40(a0)",
        "sd sp, 48(a0)",
        "sd gp, 56(a0)",
        "sd tp, 64(a0)",
        "sd t0, 72(a0)",
        "sd t1, 80(a0)",
        "sd t2, 88(a0)",
        "sd s0, 96(a0)",
        "sd s1, 104(a0)",
        "sd a1, 120(a0)",
        "sd a2, 128(a0)",
        "sd a3, 136(a0)",
        "sd a4, 144(a0)",
        "sd a5, 152(a0)",
        "sd a6, 160(a0)",
        "sd a7, 168(a0)",
        "sd s2, 176(a0)",
        "sd s3, 184(a0)",
        "sd s4, 192(a0)",
        "sd s5, 200(a0)",
        "sd s6, 208(a0)",
        "sd s7, 216(a0)",
        "sd s8, 224(a0)",
        "sd s9, 232(a0)",
        "sd s10, 240(a0)",
        "sd s11, 248(a0)",
        "sd t3, 256(a0)",
        "sd t4, 264(a0)",
        "sd t5, 272(a0)",
        "sd t6, 280(a0)",
        "csrr t0, sscratch",
        "sd t0, 112(a0)",
        "ld sp, 8(a0)",
        "ld tp, 24(a0)",
        "ld t0, 16(a0)",
        "ld t1, 0(a0)",
        "sfence.vma zero, zero",
        "csrw satp, t1",
        "sfence.vma zero, zero",
        "jr t0",
        tf = const TRAPFRAME,
    );
}

/// Entered from `usertrapret` with the user `satp` value in `a0`. Switches to the user page
/// table, restores every saved register from the trap frame, and `sret`s to user mode.
///
/// # Safety
/// Only called from `trap::usertrap_ret`, with the trap frame already populated.
#[cfg(target_arch = "riscv64")]
#[unsafe(no_mangle)]
#[unsafe(naked)]
#[unsafe(link_section = "trampsec")]
pub unsafe extern "C" fn userret(page_table: usize) -> ! {
    naked_asm!(
        "sfence.vma zero, zero",
        "csrw satp, a0",
        "sfence.vma zero, zero",
        "li a0, {tf}",
        "ld ra, 40(a0)",
        "ld sp, 48(a0)",
        "ld gp, 56(a0)",
        "ld tp, 64(a0)",
        "ld t0, 72(a0)",
        "ld t1, 80(a0)",
        "ld t2, 88(a0)",
        "ld s0, 96(a0)",
        "ld s1, 104(a0)",
        "ld a1, 120(a0)",
        "ld a2, 128(a0)",
        "ld a3, 136(a0)",
        "ld a4, 144(a0)",
        "ld a5, 152(a0)",
        "ld a6, 160(a0)",
        "ld a7, 168(a0)",
        "ld s2, 176(a0)",
        "ld s3, 184(a0)",
        "ld s4, 192(a0)",
        "ld s5, 200(a0)",
        "ld s6, 208(a0)",
        "ld s7, 216(a0)",
        "ld s8, 224(a0)",
        "ld s9, 232(a0)",
        "ld s10, 240(a0)",
        "ld s11, 248(a0)",
        "ld t3, 256(a0)",
        "ld t4, 264(a0)",
        "ld t5, 272(a0)",
        "ld t6, 280(a0)",
        "ld a0, 112(a0)",
        "sret",
        tf = const TRAPFRAME,
    );
}

/// Host fallback so tests elsewhere in the crate that merely take this function's address (to
/// compute a trampoline-relative offset) have something to link against. Never actually entered
/// on the host: nothing here drives a real user/kernel transition outside `target_arch = "riscv64"`.
#[cfg(not(target_arch = "riscv64"))]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uservec() -> ! {
    loop {}
}

#[cfg(not(target_arch = "riscv64"))]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn userret(_page_table: usize) -> ! {
    loop {}
}
