//! The page-table walker: install, remove, and query Sv39 leaf mappings, plus the thin kernel
//! identity map the monitor itself runs under. Everything above this file (`uvm`) treats these
//! as the narrow "physical frame allocator" and "page-table walker" contracts; this module is
//! the concrete stand-in that backs them for this kernel, built directly on the global allocator
//! the same way frames are obtained everywhere else in the tree.
//!
//! Only [`init_hart`] touches a real CSR, so the rest of this module runs and is unit-tested on
//! the host under `cargo test`.

use alloc::boxed::Box;
use core::cmp::min;
use core::mem::MaybeUninit;
use core::ops::{Deref, DerefMut};

use crate::error::KernelError;
use crate::memlayout::{KERNBASE, PHYSTOP, TRAMPOLINE, UART0};
use crate::riscv::{MAXVA, PA, PGSIZE, PTE_R, PTE_U, PTE_V, PTE_W, PTE_X, VA, pa_to_pte, pte_to_pa};
use crate::sync::OnceLock;

/// A bare physical page, used only for its size and alignment when boxed.
#[repr(C, align(4096))]
struct Page([u8; PGSIZE]);

#[derive(Debug, Clone, Copy)]
struct Pte(usize);

impl Pte {
    fn is_valid(self) -> bool {
        self.0 & PTE_V != 0
    }

    fn is_user(self) -> bool {
        self.0 & PTE_U != 0
    }

    fn is_writable(self) -> bool {
        self.0 & PTE_W != 0
    }

    /// A valid PTE is a leaf iff it carries at least one of R/W/X; otherwise it points at the
    /// next level down.
    fn is_leaf(self) -> bool {
        self.0 & (PTE_R | PTE_W | PTE_X) != 0
    }

    fn as_pa(self) -> PA {
        PA(pte_to_pa(self.0))
    }
}

#[repr(C, align(4096))]
struct RawTable([Pte; 512]);

impl RawTable {
    fn try_alloc() -> Result<*mut Self, KernelError> {
        let zeroed: Box<MaybeUninit<RawTable>> = Box::try_new_zeroed().map_err(|_| KernelError::Alloc)?;
        Ok(Box::into_raw(unsafe { zeroed.assume_init() }))
    }
}

/// A three-level Sv39 page table. Owns its own frames (including child tables) until
/// [`PageTable::destroy`] releases them.
pub struct PageTable {
    root: *mut RawTable,
}

unsafe impl Send for PageTable {}
unsafe impl Sync for PageTable {}

impl PageTable {
    pub fn try_new() -> Result<Self, KernelError> {
        Ok(Self {
            root: RawTable::try_alloc()?,
        })
    }

    fn from_pa(pa: PA) -> Self {
        Self {
            root: pa.0 as *mut RawTable,
        }
    }

    pub fn as_pa(&self) -> PA {
        PA(self.root as usize)
    }

    /// Walks to the leaf PTE for `va`, allocating intermediate tables along the way when
    /// `alloc` is set. Returns the PTE slot itself so the caller can install or inspect it.
    fn walk(&mut self, va: VA, alloc: bool) -> Result<*mut Pte, KernelError> {
        assert!(va.0 < MAXVA, "walk: va out of range");

        let mut table = self.root;

        unsafe {
            for level in (1..=2).rev() {
                let pte = &mut (*table).0[va.px(level)];

                if pte.is_valid() {
                    table = pte.as_pa().0 as *mut RawTable;
                } else {
                    if !alloc {
                        return Err(KernelError::InvalidPage);
                    }
                    let child = RawTable::try_alloc()?;
                    pte.0 = pa_to_pte(child as usize) | PTE_V;
                    table = child;
                }
            }

            Ok(&mut (*table).0[va.px(0)] as *mut Pte)
        }
    }

    /// Looks up the physical address backing a mapped, user-accessible `va`.
    pub fn walk_addr(&mut self, va: VA) -> Result<PA, KernelError> {
        let pte = unsafe { *self.walk(va, false)? };
        if !pte.is_valid() || !pte.is_user() {
            return Err(KernelError::InvalidPage);
        }
        Ok(pte.as_pa())
    }

    /// Like [`PageTable::walk_addr`], but also returns the raw PTE flag bits. Used by
    /// page-table cloning, which must replicate a mapping's exact permissions.
    pub fn walk_addr_flags(&mut self, va: VA) -> Result<(PA, usize), KernelError> {
        let pte = unsafe { *self.walk(va, false)? };
        if !pte.is_valid() {
            return Err(KernelError::InvalidPage);
        }
        Ok((pte.as_pa(), pte.0 & 0x3FF))
    }

    /// Looks up the physical address backing a `va` that must be both user-accessible and
    /// writable. Used by `copyout`, which writes kernel data into user memory.
    pub fn walk_writable(&mut self, va: VA) -> Result<PA, KernelError> {
        let pte = unsafe { *self.walk(va, false)? };
        if !pte.is_valid() || !pte.is_user() || !pte.is_writable() {
            return Err(KernelError::InvalidPage);
        }
        Ok(pte.as_pa())
    }

    /// Installs PTEs covering `[va, va + size)`, all pointing at the same-offset physical range
    /// starting at `pa`. `va`, `pa`, and `size` must be page-aligned; `size` must be non-zero.
    /// Fails if any page in the range is already mapped.
    pub fn map_pages(&mut self, va: VA, pa: PA, size: usize, flags: usize) -> Result<(), KernelError> {
        assert_eq!(va.0 % PGSIZE, 0, "map_pages: va not aligned");
        assert_eq!(size % PGSIZE, 0, "map_pages: size not aligned");
        assert_ne!(size, 0, "map_pages: zero size");

        let last = va.0 + size - PGSIZE;
        let mut va_cur = va.0;
        let mut pa_cur = pa.0;

        loop {
            let pte = self.walk(VA(va_cur), true)?;
            unsafe {
                assert!(!(*pte).is_valid(), "map_pages: remap at {:#x}", va_cur);
                *pte = Pte(pa_to_pte(pa_cur) | flags | PTE_V);
            }

            if va_cur == last {
                return Ok(());
            }
            va_cur += PGSIZE;
            pa_cur += PGSIZE;
        }
    }

    /// Removes `npages` leaf mappings starting at `va`. Panics if any page in the range is
    /// unmapped or not a leaf: an unmap of something that was never mapped is a kernel bug, not
    /// a recoverable condition, in this educational kernel.
    pub fn unmap_pages(&mut self, va: VA, npages: usize, free_leaves: bool) {
        assert_eq!(va.0 % PGSIZE, 0, "unmap_pages: va not aligned");

        for i in 0..npages {
            let target = VA(va.0 + i * PGSIZE);
            let pte = self.walk(target, false).unwrap_or_else(|_| panic!("unmap_pages: not mapped"));
            unsafe {
                assert!((*pte).is_valid(), "unmap_pages: not mapped");
                assert!((*pte).is_leaf(), "unmap_pages: not a leaf");

                if free_leaves {
                    drop(Box::from_raw((*pte).as_pa().0 as *mut Page));
                }
                *pte = Pte(0);
            }
        }
    }

    /// Post-order teardown of every page-table frame reachable from this root. The caller must
    /// have already unmapped any leaf that should not be freed here (e.g. `TRAMPOLINE`, which is
    /// shared and owned elsewhere).
    pub fn destroy(self) {
        fn walk_level(table: *mut RawTable) {
            let entries = unsafe { &mut (*table).0 };
            for pte in entries.iter_mut() {
                if pte.is_valid() {
                    assert!(!pte.is_leaf(), "destroy: leaf mapping still installed");
                    walk_level(pte.as_pa().0 as *mut RawTable);
                    *pte = Pte(0);
                }
            }
            drop(unsafe { Box::from_raw(table) });
        }

        walk_level(self.root);
    }
}

/// The kernel's own identity-mapped address space: one instance, built once at boot.
pub struct Kvm(PageTable);

impl Kvm {
    fn new() -> Result<Self, KernelError> {
        Ok(Self(PageTable::try_new()?))
    }

    fn map(&mut self, va: VA, pa: PA, size: usize, flags: usize) {
        self.0.map_pages(va, pa, size, flags).expect("kvm map");
    }

    fn make(&mut self) {
        unsafe extern "C" {
            fn etext();
        }
        let etext = etext as usize;

        self.map(VA(UART0), PA(UART0), PGSIZE, PTE_R | PTE_W);
        self.map(VA(KERNBASE), PA(KERNBASE), etext - KERNBASE, PTE_R | PTE_X);
        self.map(VA(etext), PA(etext), PHYSTOP - etext, PTE_R | PTE_W);

        unsafe extern "C" {
            fn trampoline_start();
        }
        self.map(VA(TRAMPOLINE), PA(trampoline_start as usize), PGSIZE, PTE_R | PTE_X);

        crate::proc::PROC_TABLE.map_stacks(self);
    }

    pub fn map_stack(&mut self, va: VA, pa: PA) {
        self.map(va, pa, PGSIZE, PTE_R | PTE_W);
    }
}

static KVM: OnceLock<Kvm> = OnceLock::new();

pub fn init() {
    KVM.initialize(|| {
        let mut kvm = Kvm::new()?;
        kvm.make();
        Ok::<_, KernelError>(kvm)
    })
    .expect("kvm init");
}

/// Loads `satp` with the kernel page table and flushes the TLB.
///
/// # Safety
/// Must run once per hart, after [`init`] has built the kernel page table.
#[cfg(target_arch = "riscv64")]
pub unsafe fn init_hart() {
    use crate::riscv::registers::satp;
    unsafe {
        core::arch::asm!("sfence.vma zero, zero");
        satp::write(satp::make(KVM.get().expect("kvm").0.as_pa().0));
        core::arch::asm!("sfence.vma zero, zero");
    }
}

#[cfg(not(target_arch = "riscv64"))]
pub unsafe fn init_hart() {}

/// The `satp` value for the kernel's own page table, installed into a trap frame's
/// `user_to_kern_satp` field so `uservec` can switch back to it on the next trap.
#[cfg(target_arch = "riscv64")]
pub fn kernel_satp() -> usize {
    use crate::riscv::registers::satp;
    satp::make(KVM.get().expect("kvm").0.as_pa().0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_table() -> PageTable {
        PageTable::try_new().unwrap()
    }

    #[test]
    fn map_then_walk_addr_round_trips() {
        let mut pt = new_table();
        let frame = Box::into_raw(Box::new(Page([0u8; PGSIZE]))) as usize;
        pt.map_pages(VA(0x1000), PA(frame), PGSIZE, PTE_R | PTE_W | PTE_U)
            .unwrap();

        let pa = pt.walk_addr(VA(0x1000)).unwrap();
        assert_eq!(pa.0, frame);
    }

    #[test]
    fn walk_addr_fails_on_unmapped() {
        let mut pt = new_table();
        assert!(pt.walk_addr(VA(0x2000)).is_err());
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn map_pages_rejects_remap() {
        let mut pt = new_table();
        let frame = Box::into_raw(Box::new(Page([0u8; PGSIZE]))) as usize;
        pt.map_pages(VA(0x3000), PA(frame), PGSIZE, PTE_R).unwrap();
        pt.map_pages(VA(0x3000), PA(frame), PGSIZE, PTE_R).unwrap();
    }

    #[test]
    fn destroy_walks_multi_level_tree_without_leaking_panic() {
        let mut pt = new_table();
        // force an intermediate level by mapping a VA whose level-2 and level-1 indices differ
        // from a second one, so walk() allocates distinct child tables.
        let a = Box::into_raw(Box::new(Page([0u8; PGSIZE]))) as usize;
        let b = Box::into_raw(Box::new(Page([0u8; PGSIZE]))) as usize;
        pt.map_pages(VA(0x0), PA(a), PGSIZE, PTE_R).unwrap();
        pt.map_pages(VA(0x40000000), PA(b), PGSIZE, PTE_R).unwrap();

        pt.unmap_pages(VA(0x0), 1, true);
        pt.unmap_pages(VA(0x40000000), 1, true);
        pt.destroy();
    }
}
