//! The very first instruction any hart executes. No Rust runtime exists yet: there is no stack,
//! so this has to build one before it can call into [`crate::start::start`].

use core::arch::asm;

use crate::riscv::PGSIZE;
use crate::start::start;

#[unsafe(link_section = ".entry")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _entry() -> ! {
    unsafe {
        asm!(
            "la sp, STACK0",      // base of start.rs's shared per-hart boot-stack array
            "li a0, {per_hart}",  // bytes reserved per hart in that array
            "csrr a1, mhartid",   // this hart's id
            "addi a1, a1, 1",     // one-indexed so hart 0 doesn't get a zero-size slice
            "mul a0, a0, a1",
            "add sp, sp, a0",     // sp now points past this hart's own slice of STACK0
            per_hart = const PGSIZE,
        );
    }

    start()
}
