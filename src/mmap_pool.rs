//! Fixed pool of [`Region`] descriptors for per-process mmap lists. Pooling bounds worst-case
//! memory to `NMMAP` descriptors total across every process and avoids nested allocator calls
//! while a process's own lock is held.

use crate::param::NMMAP;
use crate::riscv::VA;
use crate::spinlock::SpinLock;

/// One anonymous, page-aligned, uniform-permission mmap region. Lives either on a process's
/// address-sorted list or, when free, on the pool's freelist; `next` serves both roles.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub begin: VA,
    pub npages: u32,
    pub perm: usize,
    next: Option<usize>,
}

impl Region {
    const EMPTY: Region = Region {
        begin: VA(0),
        npages: 0,
        perm: 0,
        next: None,
    };

    pub fn end(&self) -> VA {
        VA(self.begin.0 + self.npages as usize * crate::riscv::PGSIZE)
    }
}

struct Pool {
    slots: [Region; NMMAP],
    free_head: Option<usize>,
}

static POOL: SpinLock<Pool> = SpinLock::new(
    Pool {
        slots: [Region::EMPTY; NMMAP],
        free_head: None,
    },
    "mmap_pool",
);

/// Links every slot into the freelist. Idempotent only if called once; calling twice would
/// double-link the list.
pub fn init() {
    let mut pool = POOL.lock();
    for i in 0..NMMAP {
        pool.slots[i].next = if i + 1 < NMMAP { Some(i + 1) } else { None };
    }
    pool.free_head = Some(0);
}

/// An index into the pool, doubling as an owned handle: holding one is the only way to reach the
/// `Region` it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(usize);

/// Pops a descriptor off the freelist. Panics if the pool is exhausted: under this kernel's
/// fixed process and region limits that means a kernel invariant already broke upstream, not a
/// recoverable user-facing condition.
pub fn alloc(begin: VA, npages: u32, perm: usize) -> Handle {
    let mut pool = POOL.lock();
    let index = pool.free_head.expect("mmap_region_alloc: pool exhausted");
    pool.free_head = pool.slots[index].next;
    pool.slots[index] = Region {
        begin,
        npages,
        perm,
        next: None,
    };
    Handle(index)
}

pub fn free(handle: Handle) {
    let mut pool = POOL.lock();
    pool.slots[handle.0].next = pool.free_head;
    pool.free_head = Some(handle.0);
}

pub fn get(handle: Handle) -> Region {
    POOL.lock().slots[handle.0]
}

pub fn set(handle: Handle, region: Region) {
    let mut pool = POOL.lock();
    let next = pool.slots[handle.0].next;
    pool.slots[handle.0] = Region { next, ..region };
}

/// Ordered, non-owning view of a process's mmap list head. The list itself lives as a chain of
/// `Handle`s the process descriptor stores (see `proc::ProcData::mmap`); this module only knows
/// how to allocate, free, and dereference individual descriptors.
pub struct List {
    pub head: Option<Handle>,
}

impl List {
    pub const fn new() -> Self {
        Self { head: None }
    }

    fn handle_next(handle: Handle) -> Option<Handle> {
        POOL.lock().slots[handle.0].next.map(Handle)
    }

    fn link(&mut self, prev: Option<Handle>, handle: Option<Handle>) {
        match prev {
            Some(p) => POOL.lock().slots[p.0].next = handle.map(|h| h.0),
            None => self.head = handle,
        }
    }

    /// Inserts `handle` keeping the list address-sorted, then coalesces with either neighbour
    /// that abuts it and shares its permissions.
    pub fn insert_sorted_and_coalesce(&mut self, handle: Handle) {
        let region = get(handle);

        let mut prev: Option<Handle> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            if get(c).begin.0 > region.begin.0 {
                break;
            }
            prev = Some(c);
            cur = Self::handle_next(c);
        }

        self.link(prev, Some(handle));
        {
            let mut pool = POOL.lock();
            pool.slots[handle.0].next = cur.map(|h| h.0);
        }

        if let Some(next) = cur
            && get(handle).end() == get(next).begin
            && get(handle).perm == get(next).perm
        {
            let merged = get(handle);
            let next_region = get(next);
            set(
                handle,
                Region {
                    npages: merged.npages + next_region.npages,
                    ..merged
                },
            );
            self.link(Some(handle), Self::handle_next(next));
            free(next);
        }

        if let Some(p) = prev
            && get(p).end() == get(handle).begin
            && get(p).perm == get(handle).perm
        {
            let prev_region = get(p);
            let cur_region = get(handle);
            set(
                p,
                Region {
                    npages: prev_region.npages + cur_region.npages,
                    ..prev_region
                },
            );
            self.link(Some(p), Self::handle_next(handle));
            free(handle);
        }
    }

    /// Removes `handle` from the list, leaving its neighbours linked directly.
    pub fn unlink(&mut self, prev: Option<Handle>, handle: Handle) {
        let next = Self::handle_next(handle);
        self.link(prev, next);
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            _list: self,
            prev: None,
            cur: self.head,
        }
    }
}

pub struct Iter<'a> {
    _list: &'a List,
    prev: Option<Handle>,
    cur: Option<Handle>,
}

impl Iterator for Iter<'_> {
    /// Yields `(previous handle, this handle, this region)` so callers can unlink in place.
    type Item = (Option<Handle>, Handle, Region);

    fn next(&mut self) -> Option<Self::Item> {
        let handle = self.cur?;
        let region = get(handle);
        let item = (self.prev, handle, region);
        self.prev = Some(handle);
        self.cur = List::handle_next(handle);
        Some(item)
    }
}

// The pool is a single global static, so tests that call `init()` must not interleave with each
// other on separate threads; `cargo test` otherwise runs every `#[test]` fn concurrently.
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_round_trip() {
        let _guard = TEST_LOCK.lock().unwrap();
        init();
        let a = alloc(VA(0x1000), 1, 0);
        let b = alloc(VA(0x2000), 1, 0);
        assert_ne!(a, b);
        free(a);
        free(b);
    }

    #[test]
    fn list_coalesces_adjacent_same_perm_regions() {
        let _guard = TEST_LOCK.lock().unwrap();
        init();
        let mut list = List::new();

        let a = alloc(VA(0x1000), 2, 7);
        list.insert_sorted_and_coalesce(a);
        let b = alloc(VA(0x3000), 1, 7);
        list.insert_sorted_and_coalesce(b);

        let regions: alloc::vec::Vec<Region> = list.iter().map(|(_, _, r)| r).collect();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].begin, VA(0x1000));
        assert_eq!(regions[0].npages, 3);
    }

    #[test]
    fn list_keeps_distinct_regions_with_different_perms_separate() {
        let _guard = TEST_LOCK.lock().unwrap();
        init();
        let mut list = List::new();

        let a = alloc(VA(0x1000), 1, 7);
        list.insert_sorted_and_coalesce(a);
        let b = alloc(VA(0x2000), 1, 5);
        list.insert_sorted_and_coalesce(b);

        let regions: alloc::vec::Vec<Region> = list.iter().map(|(_, _, r)| r).collect();
        assert_eq!(regions.len(), 2);
    }
}
