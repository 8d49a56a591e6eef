//! Trap vectors that run in machine mode (`timervec`) and supervisor mode (`kernelvec`).
//!
//! `timervec` only ever fires while the hart is still in machine mode during the boot handshake in
//! `start.rs`; once `mret` has dropped into supervisor mode, every trap the kernel itself takes
//! (device interrupts, bugs, nested ecalls) lands in `kernelvec` instead, which `stvec` is pointed
//! at by `trap::init_hart`.

use core::arch::naked_asm;

/// Machine-mode timer interrupt handler, installed via `mtvec` by `start::timer_init`.
/// `start.rs` points `mscratch` at a per-hart scratch array before this can ever run:
/// scratch[0,8,16] is a register save area, scratch[24] holds the CLINT `mtimecmp` address for
/// this hart, and scratch[32] holds the desired tick interval.
#[cfg(target_arch = "riscv64")]
#[unsafe(no_mangle)]
#[unsafe(naked)]
#[repr(align(16))]
pub unsafe extern "C" fn timervec() -> ! {
    naked_asm!(
        "csrrw a0, mscratch, a0",
        "sd a1, 0(a0)",
        "sd a2, 8(a0)",
        "sd a3, 16(a0)",
        "ld a1, 24(a0)",
        "ld a2, 32(a0)",
        "ld a3, 0(a1)",
        "add a3, a3, a2",
        "sd a3, 0(a1)",
        "li a1, 2",
        "csrw sip, a1",
        "ld a3, 16(a0)",
        "ld a2, 8(a0)",
        "ld a1, 0(a0)",
        "csrrw a0, mscratch, a0",
        "mret",
    );
}

/// Supervisor-mode trap vector for every trap the kernel takes while already running in the
/// kernel: device interrupts that arrive during a syscall, and any bug that faults inside kernel
/// code. Saves all 30 general-purpose registers other than `zero` and `sp` onto the current kernel
/// stack, calls [`crate::trap::kerneltrap`], restores them, and `sret`s back to wherever the trap
/// interrupted.
///
/// Unlike `uservec`, there's no trap frame to save into: the kernel stack the trap interrupted is
/// still live and still has room, so it doubles as the save area.
#[cfg(target_arch = "riscv64")]
#[unsafe(no_mangle)]
#[unsafe(naked)]
#[repr(align(4))]
pub unsafe extern "C" fn kernelvec() -> ! {
    naked_asm!(
        "addi sp, sp, -256",
        "sd ra, 0(sp)",
        "sd gp, 8(sp)",
        "sd tp, 16(sp)",
        "sd t0, 24(sp)",
        "sd t1, 32(sp)",
        "sd t2, 40(sp)",
        "sd s0, 48(sp)",
        "sd s1, 56(sp)",
        "sd a0, 64(sp)",
        "sd a1, 72(sp)",
        "sd a2, 80(sp)",
        "sd a3, 88(sp)",
        "sd a4, 96(sp)",
        "sd a5, 104(sp)",
        "sd a6, 112(sp)",
        "sd a7, 120(sp)",
        "sd s2, 128(sp)",
        "sd s3, 136(sp)",
        "sd s4, 144(sp)",
        "sd s5, 152(sp)",
        "sd s6, 160(sp)",
        "sd s7, 168(sp)",
        "sd s8, 176(sp)",
        "sd s9, 184(sp)",
        "sd s10, 192(sp)",
        "sd s11, 200(sp)",
        "sd t3, 208(sp)",
        "sd t4, 216(sp)",
        "sd t5, 224(sp)",
        "sd t6, 232(sp)",
        "call {kerneltrap}",
        "ld ra, 0(sp)",
        "ld gp, 8(sp)",
        "ld tp, 16(sp)",
        "ld t0, 24(sp)",
        "ld t1, 32(sp)",
        "ld t2, 40(sp)",
        "ld s0, 48(sp)",
        "ld s1, 56(sp)",
        "ld a0, 64(sp)",
        "ld a1, 72(sp)",
        "ld a2, 80(sp)",
        "ld a3, 88(sp)",
        "ld a4, 96(sp)",
        "ld a5, 104(sp)",
        "ld a6, 112(sp)",
        "ld a7, 120(sp)",
        "ld s2, 128(sp)",
        "ld s3, 136(sp)",
        "ld s4, 144(sp)",
        "ld s5, 152(sp)",
        "ld s6, 160(sp)",
        "ld s7, 168(sp)",
        "ld s8, 176(sp)",
        "ld s9, 184(sp)",
        "ld s10, 192(sp)",
        "ld s11, 200(sp)",
        "ld t3, 208(sp)",
        "ld t4, 216(sp)",
        "ld t5, 224(sp)",
        "ld t6, 232(sp)",
        "addi sp, sp, 256",
        "sret",
        kerneltrap = sym crate::trap::kerneltrap,
    );
}

/// Host fallbacks so code elsewhere that references these symbols by address links on a test
/// build. Neither is ever entered outside `target_arch = "riscv64"`.
#[cfg(not(target_arch = "riscv64"))]
pub unsafe extern "C" fn timervec() -> ! {
    loop {}
}

#[cfg(not(target_arch = "riscv64"))]
pub unsafe extern "C" fn kernelvec() -> ! {
    loop {}
}
