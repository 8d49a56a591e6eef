//! The user virtual-memory manager: growable heap and stack, a sorted/non-overlapping mmap
//! region list, cross-address-space copy primitives, and page-table clone/destroy for a single
//! process's user address space.
//!
//! Per-process layout, low to high:
//!
//! ```text
//! USER_BASE ........... text page (1 page, R|W|X|U)
//! USER_BASE + PGSIZE .. heap, grows up to heap_top
//! ... free VA hole used by mmap placement ...
//! TRAPFRAME - ustack_npage*PGSIZE .. user stack (U), grows down
//! TRAPFRAME ........... trap frame page (R|W, no U)
//! TRAMPOLINE ........... shared trampoline (R|X, no U)
//! ```

use alloc::boxed::Box;
use core::cmp::min;

use crate::error::KernelError;
use crate::memlayout::{TRAMPOLINE, TRAPFRAME, USER_BASE};
use crate::mmap_pool::{self, List, Region};
use crate::pagetable::PageTable;
use crate::param::USTACK_MAX_PAGES;
use crate::riscv::{PA, PGSIZE, PTE_R, PTE_U, PTE_W, PTE_X, VA, pg_round_down, pg_round_up};

#[repr(C, align(4096))]
struct Page([u8; PGSIZE]);

fn alloc_frame() -> Result<PA, KernelError> {
    let page = Box::try_new_zeroed().map_err(|_| KernelError::Alloc)?;
    let page: Box<Page> = unsafe { page.assume_init() };
    Ok(PA(Box::into_raw(page) as usize))
}

/// Lowest legal stack-growth address: the stack may never reach below here, no matter how many
/// pages the fault-growth path requests.
pub fn stack_floor() -> VA {
    VA(TRAPFRAME - USTACK_MAX_PAGES * PGSIZE)
}

pub fn stack_bottom(ustack_npage: u32) -> VA {
    VA(TRAPFRAME - ustack_npage as usize * PGSIZE)
}

/// Maps the single text page at `USER_BASE` with `R|W|X|U` and copies `code` into it. `code` must
/// fit in one page. Used once, to install the first process's program image.
pub fn map_first_page(pt: &mut PageTable, code: &[u8]) -> Result<(), KernelError> {
    assert!(code.len() <= PGSIZE, "map_first_page: code larger than one page");

    let pa = alloc_frame()?;
    unsafe {
        core::ptr::copy_nonoverlapping(code.as_ptr(), pa.0 as *mut u8, code.len());
    }
    pt.map_pages(VA(USER_BASE), pa, PGSIZE, PTE_R | PTE_W | PTE_X | PTE_U)
}

/// Removes `npages` leaf mappings at `va`, freeing the underlying frames.
pub fn unmap(pt: &mut PageTable, va: VA, npages: usize, free: bool) {
    if npages == 0 {
        return;
    }
    pt.unmap_pages(va, npages, free);
}

/// Grows the heap by `len` bytes (not necessarily page-aligned), mapping fresh zeroed frames
/// starting at the next page-aligned address above `cur_top`. Rolls back every mapping it made
/// on failure, so the page table is left exactly as it was found.
pub fn heap_grow(pt: &mut PageTable, cur_top: VA, len: usize, ceiling: VA) -> Result<VA, KernelError> {
    let start = cur_top.page_round_up();
    let new_top = VA(cur_top.0 + len);

    if new_top.0 > ceiling.0 {
        return Err(KernelError::AddressCollision);
    }

    let mut va = start.0;
    while va < new_top.page_round_up().0 {
        match alloc_frame().and_then(|pa| pt.map_pages(VA(va), pa, PGSIZE, PTE_R | PTE_W | PTE_U)) {
            Ok(()) => va += PGSIZE,
            Err(e) => {
                let mapped = (va - start.0) / PGSIZE;
                unmap(pt, start, mapped, true);
                return Err(e);
            }
        }
    }

    Ok(new_top)
}

/// Shrinks the heap, unmapping and freeing every whole page that lies fully above `new_top`.
/// Never shrinks below `USER_BASE + PGSIZE`.
pub fn heap_ungrow(pt: &mut PageTable, cur_top: VA, new_top: VA) -> VA {
    assert!(new_top.0 >= USER_BASE + PGSIZE, "heap_ungrow: below floor");
    assert!(new_top.0 <= cur_top.0, "heap_ungrow: not a shrink");

    let old_top_page = pg_round_up(cur_top.0);
    let new_top_page = pg_round_up(new_top.0);

    if new_top_page < old_top_page {
        let npages = (old_top_page - new_top_page) / PGSIZE;
        unmap(pt, VA(new_top_page), npages, true);
    }

    new_top
}

/// Handles a page fault below the current stack: if `fault_addr` falls inside the legal
/// stack-growth window, maps the missing pages and returns the new page count; otherwise fails
/// so the trap path can terminate the process.
pub fn ustack_grow(pt: &mut PageTable, old_npage: u32, fault_addr: VA) -> Result<u32, KernelError> {
    let floor = stack_floor();
    let old_bottom = stack_bottom(old_npage);

    if fault_addr.0 < floor.0 || fault_addr.0 >= old_bottom.0 {
        return Err(KernelError::InvalidArgument);
    }

    let new_npage = ((TRAPFRAME - fault_addr.page_round_down().0) / PGSIZE) as u32;
    let mut va = stack_bottom(new_npage).0;
    let target = old_bottom.0;

    while va < target {
        match alloc_frame().and_then(|pa| pt.map_pages(VA(va), pa, PGSIZE, PTE_R | PTE_W | PTE_U)) {
            Ok(()) => va += PGSIZE,
            Err(e) => {
                let mapped = (va - stack_bottom(new_npage).0) / PGSIZE;
                unmap(pt, stack_bottom(new_npage), mapped, true);
                return Err(e);
            }
        }
    }

    Ok(new_npage)
}

/// Finds the lowest-address hole of at least `npages` pages in `[floor, ceiling)`, considering
/// both the free gap itself and the existing mmap regions.
fn find_hole(list: &List, floor: VA, ceiling: VA, npages: u32) -> Option<VA> {
    let want = npages as usize * PGSIZE;
    let mut cursor = floor.0;

    for (_, _, region) in list.iter() {
        if region.begin.0 >= cursor + want {
            return Some(VA(cursor));
        }
        cursor = cursor.max(region.end().0);
    }

    if ceiling.0 >= cursor + want { Some(VA(cursor)) } else { None }
}

/// Places a new anonymous region. `begin == VA(0)` asks the manager to choose a base in
/// `[floor, ceiling)`; otherwise the caller's `begin` must not overlap the heap, stack, or an
/// existing region. On success the region is inserted into `list`, coalescing with an abutting
/// same-permission neighbour.
pub fn mmap(
    pt: &mut PageTable,
    list: &mut List,
    floor: VA,
    ceiling: VA,
    begin: VA,
    npages: u32,
    perm: usize,
) -> Result<VA, KernelError> {
    if npages == 0 {
        return Err(KernelError::InvalidArgument);
    }

    let base = if begin.0 == 0 {
        find_hole(list, floor, ceiling, npages).ok_or(KernelError::AddressCollision)?
    } else {
        assert_eq!(begin.0 % PGSIZE, 0, "mmap: begin not aligned");
        let end = VA(begin.0 + npages as usize * PGSIZE);
        if begin.0 < floor.0 || end.0 > ceiling.0 {
            return Err(KernelError::AddressCollision);
        }
        for (_, _, region) in list.iter() {
            if begin.0 < region.end().0 && region.begin.0 < end.0 {
                return Err(KernelError::AddressCollision);
            }
        }
        begin
    };

    let mut va = base.0;
    let end = base.0 + npages as usize * PGSIZE;
    while va < end {
        match alloc_frame().and_then(|pa| pt.map_pages(VA(va), pa, PGSIZE, perm | PTE_U)) {
            Ok(()) => va += PGSIZE,
            Err(e) => {
                let mapped = (va - base.0) / PGSIZE;
                unmap(pt, base, mapped, true);
                return Err(e);
            }
        }
    }

    let handle = mmap_pool::alloc(base, npages, perm);
    list.insert_sorted_and_coalesce(handle);
    Ok(base)
}

/// Removes the mapping for `[begin, begin + npages*PGSIZE)`. The range must exactly match one
/// region's bounds; no partial-region unmap is supported. Panics if no such region exists,
/// matching the unmap-of-unmapped-memory fatal rule everywhere else in this kernel.
pub fn munmap(pt: &mut PageTable, list: &mut List, begin: VA, npages: u32) {
    let mut prev = None;
    let mut found = None;

    for (p, handle, region) in list.iter() {
        if region.begin == begin && region.npages == npages {
            found = Some(handle);
            prev = p;
            break;
        }
    }

    let handle = found.expect("munmap: no matching region");
    unmap(pt, begin, npages as usize, true);
    list.unlink(prev, handle);
    mmap_pool::free(handle);
}

/// Cross-space copy: kernel `src` into user `dst`. Requires every touched page in `dst` to be
/// mapped, user-accessible, and writable.
pub fn copy_out(pt: &mut PageTable, dst: VA, mut src: &[u8]) -> Result<(), KernelError> {
    let mut dst = dst.0;

    while !src.is_empty() {
        let page_base = pg_round_down(dst);
        let pa = pt.walk_writable(VA(page_base))?;

        let n = min(PGSIZE - (dst - page_base), src.len());
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), (pa.0 + (dst - page_base)) as *mut u8, n);
        }

        src = &src[n..];
        dst = page_base + PGSIZE;
    }

    Ok(())
}

/// Cross-space copy: user `src` into kernel `dst`.
pub fn copy_in(pt: &mut PageTable, dst: &mut [u8], src: VA) -> Result<(), KernelError> {
    let mut src = src.0;
    let mut dst = dst;

    while !dst.is_empty() {
        let page_base = pg_round_down(src);
        let pa = pt.walk_addr(VA(page_base))?;

        let n = min(PGSIZE - (src - page_base), dst.len());
        unsafe {
            core::ptr::copy_nonoverlapping((pa.0 + (src - page_base)) as *const u8, dst.as_mut_ptr(), n);
        }

        dst = &mut dst[n..];
        src = page_base + PGSIZE;
    }

    Ok(())
}

/// Copies a NUL-terminated string from user `src` into `dst`, stopping at the terminator or when
/// `dst` is exhausted. Fails if no terminator was found within `dst.len()` bytes.
pub fn copy_in_str(pt: &mut PageTable, dst: &mut [u8], src: VA) -> Result<usize, KernelError> {
    let mut src = src.0;
    let mut written = 0;

    while written < dst.len() {
        let page_base = pg_round_down(src);
        let pa = pt.walk_addr(VA(page_base))?;
        let offset = src - page_base;
        let avail = min(PGSIZE - offset, dst.len() - written);

        let page_bytes = unsafe { core::slice::from_raw_parts((pa.0 + offset) as *const u8, avail) };
        for &byte in page_bytes {
            if byte == 0 {
                return Ok(written);
            }
            dst[written] = byte;
            written += 1;
        }

        src = page_base + PGSIZE;
    }

    Err(KernelError::InvalidArgument)
}

/// Post-order frees every page-table frame. The caller must already have unmapped `TRAPFRAME`
/// (freeing the frame, since each process owns it) and `TRAMPOLINE` (not freeing it, since it is
/// shared) before calling this.
pub fn destroy(pt: PageTable) {
    pt.destroy();
}

fn copy_range(src: &mut PageTable, dst: &mut PageTable, begin: VA, end: VA) -> Result<(), KernelError> {
    let mut va = begin.0;
    while va < end.0 {
        let (pa, flags) = src.walk_addr_flags(VA(va))?;
        let new_pa = alloc_frame()?;
        unsafe {
            core::ptr::copy_nonoverlapping(pa.0 as *const u8, new_pa.0 as *mut u8, PGSIZE);
        }
        dst.map_pages(VA(va), new_pa, PGSIZE, flags)?;
        va += PGSIZE;
    }
    Ok(())
}

/// Deep-copies every mapped user data page (text, heap, stack, and each mmap region) from `src`
/// into `dst`, preserving permissions. Trampoline and trap frame are not copied; the caller maps
/// those separately. The mmap descriptor list itself is cloned by the process layer, which owns
/// the list and must give each cloned region its own pool descriptor.
pub fn copy_pgtbl(
    src: &mut PageTable,
    dst: &mut PageTable,
    heap_top: VA,
    ustack_npage: u32,
    mmap: &List,
) -> Result<(), KernelError> {
    copy_range(src, dst, VA(USER_BASE), VA(USER_BASE + PGSIZE))?;
    copy_range(src, dst, VA(USER_BASE + PGSIZE), heap_top.page_round_up())?;
    copy_range(src, dst, stack_bottom(ustack_npage), VA(TRAPFRAME))?;

    for (_, _, region) in mmap.iter() {
        copy_range(src, dst, region.begin, region.end())?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_pt() -> PageTable {
        PageTable::try_new().unwrap()
    }

    #[test]
    fn heap_grow_then_ungrow_round_trips() {
        let mut pt = new_pt();
        let ceiling = VA(0x40000000);

        let top = heap_grow(&mut pt, VA(USER_BASE + PGSIZE), 4 * PGSIZE, ceiling).unwrap();
        assert_eq!(top.0, USER_BASE + PGSIZE + 4 * PGSIZE);

        let shrunk = heap_ungrow(&mut pt, top, VA(USER_BASE + PGSIZE));
        assert_eq!(shrunk.0, USER_BASE + PGSIZE);

        for i in 0..4 {
            let va = VA(USER_BASE + PGSIZE + i * PGSIZE);
            assert!(pt.walk_addr(va).is_err());
        }
    }

    #[test]
    fn heap_grow_rejects_collision_with_ceiling() {
        let mut pt = new_pt();
        let ceiling = VA(USER_BASE + PGSIZE + PGSIZE);
        assert!(heap_grow(&mut pt, VA(USER_BASE + PGSIZE), 4 * PGSIZE, ceiling).is_err());
    }

    #[test]
    fn mmap_auto_placement_then_adjacent_coalesces() {
        let _guard = mmap_pool::TEST_LOCK.lock().unwrap();
        let mut pt = new_pt();
        let mut list = List::new();
        mmap_pool::init();

        let floor = VA(USER_BASE + PGSIZE);
        let ceiling = stack_floor();

        let a = mmap(&mut pt, &mut list, floor, ceiling, VA(0), 2, PTE_R | PTE_W).unwrap();
        let b = mmap(&mut pt, &mut list, floor, ceiling, VA(a.0 + 2 * PGSIZE), 1, PTE_R | PTE_W).unwrap();
        assert_eq!(b.0, a.0 + 2 * PGSIZE);

        let regions: alloc::vec::Vec<Region> = list.iter().map(|(_, _, r)| r).collect();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].begin, a);
        assert_eq!(regions[0].npages, 3);
    }

    #[test]
    fn munmap_removes_exact_region() {
        let _guard = mmap_pool::TEST_LOCK.lock().unwrap();
        let mut pt = new_pt();
        let mut list = List::new();
        mmap_pool::init();

        let floor = VA(USER_BASE + PGSIZE);
        let ceiling = stack_floor();
        let a = mmap(&mut pt, &mut list, floor, ceiling, VA(0), 2, PTE_R | PTE_W).unwrap();

        munmap(&mut pt, &mut list, a, 2);
        assert!(list.iter().next().is_none());
        assert!(pt.walk_addr(a).is_err());
    }

    #[test]
    fn copy_out_then_copy_in_round_trips() {
        let mut pt = new_pt();
        heap_grow(&mut pt, VA(USER_BASE), PGSIZE, VA(0x40000000)).unwrap();

        let msg = b"hello kernel";
        copy_out(&mut pt, VA(USER_BASE + 10), msg).unwrap();

        let mut buf = [0u8; 12];
        copy_in(&mut pt, &mut buf, VA(USER_BASE + 10)).unwrap();
        assert_eq!(&buf, msg);
    }

    #[test]
    fn copy_pgtbl_clones_distinct_frames_with_same_contents() {
        let mut src = new_pt();
        heap_grow(&mut src, VA(USER_BASE), PGSIZE, VA(0x40000000)).unwrap();
        copy_out(&mut src, VA(USER_BASE), b"parent-data").unwrap();

        let mut dst = new_pt();
        let list = List::new();
        copy_pgtbl(&mut src, &mut dst, VA(USER_BASE + PGSIZE), 0, &list).unwrap();

        let src_pa = src.walk_addr(VA(USER_BASE)).unwrap();
        let dst_pa = dst.walk_addr(VA(USER_BASE)).unwrap();
        assert_ne!(src_pa, dst_pa);

        let mut buf = [0u8; 11];
        copy_in(&mut dst, &mut buf, VA(USER_BASE)).unwrap();
        assert_eq!(&buf, b"parent-data");
    }
}
