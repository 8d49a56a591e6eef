#![no_std]
#![no_main]

extern crate alloc;

use core::sync::atomic::{AtomicBool, Ordering};

use kernel::console;
use kernel::kalloc;
use kernel::mmap_pool;
use kernel::pagetable;
use kernel::printf;
use kernel::println;
use kernel::proc;
use kernel::proc::current_hart;
use kernel::trap;

static STARTED: AtomicBool = AtomicBool::new(false);

#[unsafe(export_name = "main")]
extern "C" fn main() -> ! {
    let hart = current_hart();

    if hart == 0 {
        console::init();

        println!();
        println!("wren kernel is booting");
        println!();

        kalloc::init();
        pagetable::init();
        unsafe { pagetable::init_hart() };
        mmap_pool::init();
        unsafe { trap::init_hart() };

        proc::user_init();

        println!("hart {} is starting", hart);

        STARTED.store(true, Ordering::SeqCst);
    } else {
        while !STARTED.load(Ordering::SeqCst) {
            core::hint::spin_loop();
        }

        println!("hart {} is starting", hart);

        unsafe { pagetable::init_hart() };
        unsafe { trap::init_hart() };
    }

    proc::scheduler();
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    printf::handle_panic(info)
}
