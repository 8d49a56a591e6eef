#![cfg_attr(not(test), no_std)]
#![feature(fn_align)]
#![feature(allocator_api)]
#![feature(alloc_error_handler)]

extern crate alloc;

pub mod console;
#[cfg(target_arch = "riscv64")]
pub mod entry;
pub mod error;
#[cfg(target_arch = "riscv64")]
pub mod kalloc;
pub mod kernelvec;
pub mod memlayout;
pub mod mmap_pool;
pub mod pagetable;
pub mod param;
pub mod printf;
pub mod proc;
pub mod riscv;
pub mod spinlock;
#[cfg(target_arch = "riscv64")]
pub mod start;
pub mod swtch;
pub mod sync;
pub mod syscall;
pub mod sysproc;
pub mod trampoline;
#[cfg(target_arch = "riscv64")]
pub mod trap;
pub mod uart;
pub mod uvm;
