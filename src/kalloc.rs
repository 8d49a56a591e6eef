//! The kernel heap: a buddy allocator over every physical page from `end` (set by the linker
//! script) up to [`PHYSTOP`]. Every other allocation in this kernel, process structs, page
//! tables, trap frames, mmap descriptors, rides on top of this through `alloc::boxed::Box`.

use core::alloc::{GlobalAlloc, Layout};

use buddy_alloc::{BuddyAllocParam, buddy_alloc::BuddyAlloc};

use crate::memlayout::PHYSTOP;
use crate::println;
use crate::spinlock::SpinLock;

// First address after the kernel image, defined by the linker script.
unsafe extern "C" {
    static end: [u8; 0];
}

#[global_allocator]
static KMEM: Kmem = Kmem(SpinLock::new(None, "kmem"));

struct Kmem(SpinLock<Option<BuddyAlloc>>);
unsafe impl Sync for Kmem {}

unsafe impl GlobalAlloc for Kmem {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0.lock().as_mut().expect("kmem to be init").malloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.0.lock().as_mut().expect("kmem to be init").free(ptr)
    }
}

#[alloc_error_handler]
fn handle_alloc_error(layout: Layout) -> ! {
    panic!("alloc error: {layout:?}")
}

/// # Safety
/// Must be called exactly once, before any other code allocates.
pub unsafe fn init() {
    let mut guard = KMEM.0.lock();

    let size = unsafe { (PHYSTOP as *const u8).offset_from(end.as_ptr()) as usize };
    let alloc_param = BuddyAllocParam::new(end.as_ptr(), size, 0x1000);
    let alloc = unsafe { BuddyAlloc::new(alloc_param) };

    println!("kmem: base {:#x} top {:#x} size {:#x}", end.as_ptr() as usize, PHYSTOP, alloc.available_bytes());

    *guard = Some(alloc);
}
