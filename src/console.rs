//! Console output, layered over the raw UART. Input is out of scope: nothing in this kernel
//! reads from the console, so there is no receive buffer here, unlike a typical teaching kernel.

use crate::uart;

pub fn putc(c: u8) {
    uart::putc(c);
}

/// # Safety
/// Must be called only once during kernel initialization.
pub unsafe fn init() {
    unsafe { uart::init() };
}
