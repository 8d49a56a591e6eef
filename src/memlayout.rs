//! Physical and virtual address map.
//!
//! qemu -machine virt lays out physical memory like this (qemu's hw/riscv/virt.c):
//!
//! ```text
//! 00001000 -- boot ROM, provided by qemu
//! 02000000 -- CLINT
//! 0C000000 -- PLIC
//! 10000000 -- uart0
//! 80000000 -- boot ROM jumps here in machine mode; -kernel loads the kernel here
//! unused RAM after 80000000.
//! ```
//!
//! The kernel uses physical memory thus: `entry.rs`, then kernel text and data, then `end` marks
//! the start of the kernel's own page-allocation area, which runs up to `PHYSTOP`.

use crate::riscv::{MAXVA, PGSIZE};

pub const UART0: usize = 0x10000000;
pub const UART0_IRQ: usize = 10;

/// Core Local Interrupter (CLINT): fixed timer and software-interrupt registers.
pub const CLINT: usize = 0x2000000;
pub const fn clint_mtimecmp(hartid: usize) -> usize {
    CLINT + 0x4000 + 8 * hartid
}
pub const CLINT_MTIME: usize = CLINT + 0xBFF8;

pub const KERNBASE: usize = 0x80000000;
pub const PHYSTOP: usize = KERNBASE + 128 * 1024 * 1024;

/// The kernel expects there to be RAM for use by the kernel and user pages from physical address
/// 0x80000000 to PHYSTOP.
pub const TRAMPOLINE: usize = MAXVA - PGSIZE;

/// One page below the trampoline, mapped `R|W` but never `U`: the process's trap frame.
pub const TRAPFRAME: usize = TRAMPOLINE - PGSIZE;

/// Lowest user-space virtual address. The first user page (text) is mapped here.
pub const USER_BASE: usize = 0;

use crate::param::NKSTACK_PAGES;

/// Kernel virtual address of the kernel-stack for process slot `index`, one guard page below
/// `TRAMPOLINE` per slot so a stack overflow faults instead of corrupting a neighbour.
pub const fn kstack(index: usize) -> usize {
    TRAMPOLINE - (index + 1) * (NKSTACK_PAGES + 1) * PGSIZE
}
