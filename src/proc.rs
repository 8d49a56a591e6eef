//! The process table: slot allocation, per-CPU scheduler loops, context switching, sleep/wakeup,
//! and fork/exit/wait. Every process-visible resource (page table, trap frame, mmap list, kernel
//! stack) is reachable only through a slot here; nothing outside this module allocates one.

use alloc::boxed::Box;
use alloc::string::String;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::KernelError;
use crate::memlayout::{TRAMPOLINE, TRAPFRAME, USER_BASE, kstack};
use crate::mmap_pool::{self, List};
use crate::pagetable::{Kvm, PageTable};
use crate::param::{NCPU, NKSTACK_PAGES, NPROC};
use crate::riscv::{self, PA, PGSIZE, PTE_R, PTE_W, PTE_X, VA, interrupts};
use crate::spinlock::{SpinLock, SpinLockGuard, pop_off, push_off};
use crate::swtch::{Context, swtch};
use crate::uvm;

/// Per-CPU scheduler state: this hart's own saved context, the slot it is currently running (if
/// any), and the interrupt-nesting bookkeeping [`crate::spinlock`] builds `push_off`/`pop_off` on.
pub struct Cpu {
    pub proc: Option<usize>,
    pub context: Context,
    pub num_off: usize,
    pub interrupts_enabled: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: None,
            context: Context::ZERO,
            num_off: 0,
            interrupts_enabled: false,
        }
    }
}

struct CpuTable([UnsafeCell<Cpu>; NCPU]);
unsafe impl Sync for CpuTable {}

impl CpuTable {
    const fn new() -> Self {
        let mut array: [MaybeUninit<UnsafeCell<Cpu>>; NCPU] = unsafe { MaybeUninit::uninit().assume_init() };
        let mut i = 0;
        while i < NCPU {
            array[i] = MaybeUninit::new(UnsafeCell::new(Cpu::new()));
            i += 1;
        }
        // SAFETY: every element was just initialized above; `MaybeUninit<T>` and `T` share layout.
        Self(unsafe { core::mem::transmute(array) })
    }
}

static CPUS: CpuTable = CpuTable::new();

/// # Safety
/// The caller must already have interrupts disabled (e.g. by holding any [`SpinLock`], or via a
/// manual [`push_off`]), so the hart id this resolves against cannot change underneath it.
pub unsafe fn current_cpu() -> &'static mut Cpu {
    unsafe {
        let id = riscv::hart::id();
        &mut *CPUS.0[id].get()
    }
}

/// This hart's id, for logging. Safe to call from anywhere: it's read-only and used only for
/// diagnostics, never to key mutable per-CPU state (use [`current_cpu`] for that, under a lock).
pub fn current_hart() -> usize {
    unsafe { riscv::hart::id() }
}

/// Returns the slot index this hart is currently running, if any.
pub fn current_proc_index() -> Option<usize> {
    push_off();
    let index = unsafe { current_cpu() }.proc;
    pop_off();
    index
}

/// Direct access to the calling hart's own running process, bypassing the slot lock. Sound only
/// because a Running slot is exclusively touched by the hart that scheduled it: no other hart's
/// table scan reads or writes it while that invariant holds, so a second lock is unnecessary
/// overhead for a process manipulating its own state (syscalls, fork, exit).
fn current_proc_data() -> &'static mut ProcData {
    let index = current_proc_index().expect("current_proc_data: no current process");
    unsafe { PROC_TABLE.slots[index].get_mut_unchecked() }
}

/// Per-process trap frame: user register state plus the kernel fields the trap-entry path needs
/// to re-enter the kernel. One page, owned by the process, mapped at `TRAPFRAME` in its own page
/// table and addressed directly here through the kernel's identity map.
#[repr(C, align(4096))]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub user_to_kern_satp: usize,
    pub user_to_kern_sp: usize,
    pub user_to_kern_trapvector: usize,
    /// This hart's id, reloaded into `tp` on every kernel entry: user code is free to clobber `tp`
    /// as an ordinary register, but `riscv::hart::id` depends on `tp` holding it while in the
    /// kernel.
    pub user_to_kern_hartid: usize,
    pub epc: usize,
    pub ra: usize,
    pub sp: usize,
    pub gp: usize,
    pub tp: usize,
    pub t0: usize,
    pub t1: usize,
    pub t2: usize,
    pub s0: usize,
    pub s1: usize,
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a6: usize,
    pub a7: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
    pub t3: usize,
    pub t4: usize,
    pub t5: usize,
    pub t6: usize,
}

impl TrapFrame {
    pub const ZERO: TrapFrame = TrapFrame {
        user_to_kern_satp: 0,
        user_to_kern_sp: 0,
        user_to_kern_trapvector: 0,
        user_to_kern_hartid: 0,
        epc: 0,
        ra: 0,
        sp: 0,
        gp: 0,
        tp: 0,
        t0: 0,
        t1: 0,
        t2: 0,
        s0: 0,
        s1: 0,
        a0: 0,
        a1: 0,
        a2: 0,
        a3: 0,
        a4: 0,
        a5: 0,
        a6: 0,
        a7: 0,
        s2: 0,
        s3: 0,
        s4: 0,
        s5: 0,
        s6: 0,
        s7: 0,
        s8: 0,
        s9: 0,
        s10: 0,
        s11: 0,
        t3: 0,
        t4: 0,
        t5: 0,
        t6: 0,
    };

    /// Reads syscall argument register `n`, 0-indexed into `a0..a5`. The syscall number itself
    /// travels in `a7`, read separately by the dispatcher.
    pub fn arg(&self, n: usize) -> usize {
        match n {
            0 => self.a0,
            1 => self.a1,
            2 => self.a2,
            3 => self.a3,
            4 => self.a4,
            5 => self.a5,
            _ => panic!("TrapFrame::arg: index {n} out of range"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Runnable,
    Running,
    Sleeping,
    Zombie,
}

/// Everything a slot owns, behind one lock. The per-slot lock is responsible for every field of
/// the process it protects; bundling them into a single `SpinLock<ProcData>` (rather than a lock
/// plus a separately-owned data struct) makes that contract the type system's job instead of a
/// convention to remember.
struct ProcData {
    state: ProcState,
    pid: usize,
    kstack: VA,
    pagetable: Option<PageTable>,
    tf_pa: Option<PA>,
    context: Context,
    heap_top: VA,
    ustack_npage: u32,
    mmap: List,
    sleep_chan: Option<usize>,
    exit_code: i32,
    name: String,
}

impl ProcData {
    const EMPTY: ProcData = ProcData {
        state: ProcState::Unused,
        pid: 0,
        kstack: VA(0),
        pagetable: None,
        tf_pa: None,
        context: Context::ZERO,
        heap_top: VA(0),
        ustack_npage: 0,
        mmap: List::new(),
        sleep_chan: None,
        exit_code: 0,
        name: String::new(),
    };
}

fn tf_ptr(data: &ProcData) -> *mut TrapFrame {
    data.tf_pa.expect("tf_ptr: slot has no trap frame").0 as *mut TrapFrame
}

#[repr(C, align(4096))]
struct Page([u8; PGSIZE]);

fn alloc_frame() -> Result<PA, KernelError> {
    let page = Box::try_new_zeroed().map_err(|_| KernelError::Alloc)?;
    let page: Box<Page> = unsafe { page.assume_init() };
    Ok(PA(Box::into_raw(page) as usize))
}

fn free_frame(pa: PA) {
    drop(unsafe { Box::from_raw(pa.0 as *mut Page) });
}

fn trampoline_pa() -> PA {
    unsafe extern "C" {
        fn trampoline_start();
    }
    PA(trampoline_start as usize)
}

const EMPTY_SLOT: SpinLock<ProcData> = SpinLock::new(ProcData::EMPTY, "proc");

/// The fixed slot index `init` always lands in: it is unconditionally the first call into
/// [`proc_alloc`] during boot, and `proc_alloc` scans from slot 0.
const INIT_SLOT: usize = 0;

pub struct ProcTable {
    slots: [SpinLock<ProcData>; NPROC],
    /// Serialises every parent-child topology change: reparenting on exit, zombie publication,
    /// reaping. Acquired before any per-slot lock, per this kernel's lock-ordering rule. Also
    /// doubles as the wait/exit rendezvous address (see `tree_channel`).
    tree: SpinLock<[Option<usize>; NPROC]>,
    next_pid: AtomicUsize,
}

impl ProcTable {
    const fn new() -> Self {
        Self {
            slots: [EMPTY_SLOT; NPROC],
            tree: SpinLock::new([None; NPROC], "tree"),
            next_pid: AtomicUsize::new(1),
        }
    }

    /// Pre-maps every slot's kernel stack into the kernel page table, each with an unmapped guard
    /// page below it so a kernel-stack overflow faults instead of corrupting a neighbour's stack.
    pub fn map_stacks(&self, kvm: &mut Kvm) {
        for index in 0..NPROC {
            for page in 0..NKSTACK_PAGES {
                let pa = alloc_frame().expect("map_stacks: out of memory");
                let va = VA(kstack(index) + page * PGSIZE);
                kvm.map_stack(va, pa);
            }
        }
    }
}

pub static PROC_TABLE: ProcTable = ProcTable::new();

fn tree_channel() -> usize {
    &PROC_TABLE.tree as *const _ as usize
}

fn alloc_pid() -> usize {
    PROC_TABLE.next_pid.fetch_add(1, Ordering::Relaxed)
}

/// `fork_ret`'s synthetic return address needs this initialised before any process exists.
extern "C" fn fork_ret() -> ! {
    let index = current_proc_index().expect("fork_ret: no current process");
    // SAFETY: swtch lands here with the scheduler having locked this slot just before switching
    // in; this fresh kernel stack never ran the code that pushed that guard, so there is no guard
    // value here to drop.
    unsafe { PROC_TABLE.slots[index].force_unlock() };

    #[cfg(target_arch = "riscv64")]
    unsafe {
        crate::trap::usertrap_ret(index)
    }
    #[cfg(not(target_arch = "riscv64"))]
    unreachable!("fork_ret: host builds never actually swtch into a process")
}

fn init_slot(index: usize, pid: usize, data: &mut ProcData) -> Result<(), KernelError> {
    let tf_pa = alloc_frame()?;

    let mut pt = match PageTable::try_new() {
        Ok(pt) => pt,
        Err(e) => {
            free_frame(tf_pa);
            return Err(e);
        }
    };

    if let Err(e) = pt.map_pages(VA(TRAMPOLINE), trampoline_pa(), PGSIZE, PTE_R | PTE_X) {
        free_frame(tf_pa);
        pt.destroy();
        return Err(e);
    }

    if let Err(e) = pt.map_pages(VA(TRAPFRAME), tf_pa, PGSIZE, PTE_R | PTE_W) {
        pt.unmap_pages(VA(TRAMPOLINE), 1, false);
        free_frame(tf_pa);
        pt.destroy();
        return Err(e);
    }

    data.pid = pid;
    data.kstack = VA(kstack(index));
    data.tf_pa = Some(tf_pa);
    data.pagetable = Some(pt);
    data.context = Context::ZERO;
    data.context.ra = fork_ret as usize;
    data.context.sp = kstack(index) + NKSTACK_PAGES * PGSIZE;
    data.heap_top = VA(USER_BASE + PGSIZE);
    data.ustack_npage = 0;
    data.mmap = List::new();
    data.sleep_chan = None;
    data.exit_code = 0;
    data.name = String::new();
    Ok(())
}

/// Scans for an Unused slot, fully initialises it, and returns it **with its lock still held** so
/// the caller (`user_init`, `fork`) can finish setup atomically before anyone else can observe the
/// new Runnable slot.
fn proc_alloc() -> Result<(usize, SpinLockGuard<'static, ProcData>), KernelError> {
    for index in 0..NPROC {
        let mut guard = PROC_TABLE.slots[index].lock();
        if guard.state != ProcState::Unused {
            continue;
        }

        let pid = alloc_pid();
        match init_slot(index, pid, &mut guard) {
            Ok(()) => {
                guard.state = ProcState::Runnable;
                return Ok((index, guard));
            }
            Err(e) => {
                *guard = ProcData::EMPTY;
                return Err(e);
            }
        }
    }

    Err(KernelError::OutOfProc)
}

/// Releases every resource a slot owns and returns it to Unused. The caller must already know
/// the slot is Zombie (or otherwise guaranteed unreachable from any scheduler) and hold its lock.
/// Every user mapping has to come off before `uvm::destroy`, which panics if it finds a leaf
/// still installed.
fn proc_free(data: &mut ProcData) {
    if let Some(mut pt) = data.pagetable.take() {
        uvm::heap_ungrow(&mut pt, data.heap_top, VA(USER_BASE + PGSIZE));
        uvm::unmap(&mut pt, uvm::stack_bottom(data.ustack_npage), data.ustack_npage as usize, true);
        // A slot fresh out of proc_alloc and never handed to user_init/fork has no text page yet.
        if pt.walk_addr(VA(USER_BASE)).is_ok() {
            pt.unmap_pages(VA(USER_BASE), 1, true);
        }

        let regions: alloc::vec::Vec<_> = data.mmap.iter().map(|(_, _, r)| r).collect();
        for region in regions {
            uvm::munmap(&mut pt, &mut data.mmap, region.begin, region.npages);
        }

        pt.unmap_pages(VA(TRAPFRAME), 1, true);
        pt.unmap_pages(VA(TRAMPOLINE), 1, false);
        uvm::destroy(pt);
    }
    *data = ProcData::EMPTY;
}

const INITCODE: [u8; 4] = [0x6f, 0x00, 0x00, 0x00]; // jal x0, 0: spins forever at USER_BASE

/// Builds PID 1, the ancestor every orphan is reparented to. Always lands in [`INIT_SLOT`].
pub fn user_init() {
    let (index, mut guard) = proc_alloc().expect("user_init: process table exhausted at boot");
    assert_eq!(index, INIT_SLOT, "user_init: init did not land in the reserved slot");

    let pt = guard.pagetable.as_mut().expect("user_init: no pagetable");
    uvm::map_first_page(pt, &INITCODE).expect("user_init: out of memory mapping initcode");
    guard.ustack_npage =
        uvm::ustack_grow(pt, 0, uvm::stack_bottom(1)).expect("user_init: out of memory mapping user stack");

    let tf = unsafe { &mut *tf_ptr(&guard) };
    *tf = TrapFrame::ZERO;
    tf.epc = USER_BASE;
    tf.sp = TRAPFRAME;

    guard.name = String::from("init");
}

/// Runs forever on this hart: scans the table for a Runnable slot, switches into it, and reclaims
/// control when that process switches back. Interrupts are re-enabled at the top of every outer
/// iteration, even if every slot turns out busy, so this hart can still take a timer tick.
pub fn scheduler() -> ! {
    loop {
        interrupts::enable();

        for index in 0..NPROC {
            let mut guard = PROC_TABLE.slots[index].lock();
            if guard.state != ProcState::Runnable {
                continue;
            }

            guard.state = ProcState::Running;
            let cpu = unsafe { current_cpu() };
            cpu.proc = Some(index);

            let proc_ctx: *const Context = &guard.context;
            let cpu_ctx: *mut Context = &mut cpu.context;
            unsafe { swtch(cpu_ctx, proc_ctx) };

            unsafe { current_cpu() }.proc = None;
            drop(guard);
        }
    }
}

/// Switches from the current process back into this hart's scheduler. Callers must already hold
/// exactly the current slot's lock, with interrupts disabled and no other lock nested underneath.
fn sched(guard: &mut SpinLockGuard<'static, ProcData>, index: usize) {
    assert!(PROC_TABLE.slots[index].is_held_by_current(), "sched: lock not held");
    let cpu = unsafe { current_cpu() };
    assert_eq!(cpu.num_off, 1, "sched: called with extra locks held");
    assert_ne!(guard.state, ProcState::Running, "sched: still marked Running");
    assert!(!interrupts::get(), "sched: interruptible");

    let proc_ctx: *mut Context = &mut guard.context;
    unsafe { swtch(proc_ctx, &cpu.context) };
}

pub fn r#yield() {
    let index = current_proc_index().expect("yield: no current process");
    let mut guard = PROC_TABLE.slots[index].lock();
    guard.state = ProcState::Runnable;
    sched(&mut guard, index);
}

/// Classic two-lock sleep. Acquires this process's own slot lock *before* releasing `lock`, so a
/// wakeup racing the sleep can never land in the gap between "decided to sleep" and "published the
/// sleep channel". Returns with `lock` re-acquired.
pub fn sleep<'a, T>(chan: usize, lock: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
    let index = current_proc_index().expect("sleep: no current process");
    let mut guard = PROC_TABLE.slots[index].lock();
    let ext = lock.unlock();

    guard.sleep_chan = Some(chan);
    guard.state = ProcState::Sleeping;
    sched(&mut guard, index);

    guard.sleep_chan = None;
    drop(guard);

    ext.lock()
}

/// Promotes every Sleeping slot waiting on `chan`, other than the caller's own, to Runnable. A
/// wakeup that happens before the matching sleep is simply missed; callers must re-check their
/// condition in a loop after waking (see `wait`), not assume a single wakeup call is sufficient.
pub fn wakeup(chan: usize) {
    let me = current_proc_index();
    for index in 0..NPROC {
        if Some(index) == me {
            continue;
        }
        let mut guard = PROC_TABLE.slots[index].lock();
        if guard.state == ProcState::Sleeping && guard.sleep_chan == Some(chan) {
            guard.state = ProcState::Runnable;
        }
    }
}

/// Clones the calling process into a new child slot. The child's `a0` is overwritten to 0 (its
/// fork return value) and its trap frame's kernel-stack pointer is overwritten to its own kernel
/// stack, never inherited from the parent: inheriting it would make the child trap onto the
/// parent's kernel stack.
pub fn fork() -> Result<usize, KernelError> {
    let parent_index = current_proc_index().expect("fork: no current process");
    let parent = current_proc_data();

    let (child_index, mut child) = proc_alloc()?;

    let parent_pt = parent.pagetable.as_mut().expect("fork: parent has no pagetable");
    let child_pt = child.pagetable.as_mut().expect("fork: child has no pagetable");
    if let Err(e) = uvm::copy_pgtbl(parent_pt, child_pt, parent.heap_top, parent.ustack_npage, &parent.mmap) {
        // Frame-allocator exhaustion here is recoverable, not fatal: give back whatever the
        // child slot already holds and report the failure to the caller instead of panicking
        // while still holding the child's lock, which would wedge every hart's scheduler loop
        // against a slot nobody will ever unlock.
        proc_free(&mut child);
        return Err(e);
    }

    for (_, _, region) in parent.mmap.iter() {
        let handle = mmap_pool::alloc(region.begin, region.npages, region.perm);
        child.mmap.insert_sorted_and_coalesce(handle);
    }

    child.heap_top = parent.heap_top;
    child.ustack_npage = parent.ustack_npage;
    child.name = parent.name.clone();

    let parent_tf = unsafe { *tf_ptr(parent) };
    let child_tf = unsafe { &mut *tf_ptr(&child) };
    *child_tf = parent_tf;
    child_tf.a0 = 0;
    child_tf.user_to_kern_sp = child.kstack.0 + NKSTACK_PAGES * PGSIZE;

    let child_pid = child.pid;

    // Release the child's slot lock before taking `tree`: every other call site takes `tree`
    // first and a per-slot lock second, and nesting them the other way here would be the one
    // place in the kernel that reverses the order.
    drop(child);
    PROC_TABLE.tree.lock()[child_index] = Some(parent_index);

    Ok(child_pid)
}

/// Reparents the calling process's children to `init`, publishes `code` as its own exit status,
/// and wakes whoever is sleeping on the tree channel (a parent in `wait`, or `init` if a child was
/// already a zombie when reparented). Returns the caller's own slot index.
///
/// Split out from `exit` so every state-visible effect of exiting — the part `wait` and the
/// orphan-reparenting scenario actually observe — is reachable without going through the final
/// `sched` call, which never returns on real hardware and has nothing meaningful to hand back to
/// on a host build (see `sched`'s host stub in `swtch.rs`).
fn exit_and_zombify(code: i32) -> usize {
    let index = current_proc_index().expect("exit: no current process");
    assert_ne!(index, INIT_SLOT, "exit: init tried to exit");

    let chan = tree_channel();
    let mut tree = PROC_TABLE.tree.lock();

    for i in 0..NPROC {
        if tree[i] != Some(index) {
            continue;
        }
        tree[i] = Some(INIT_SLOT);
        let child_is_zombie = PROC_TABLE.slots[i].lock().state == ProcState::Zombie;
        if child_is_zombie {
            wakeup(chan);
        }
    }

    {
        let mut guard = PROC_TABLE.slots[index].lock();
        guard.exit_code = code;
        guard.state = ProcState::Zombie;
    }

    wakeup(chan);

    // Release the tree-lock before switching: a switch made while holding it would deadlock the
    // parent's subsequent wait, which needs the same lock.
    drop(tree);

    index
}

/// Terminates the calling process. Never returns: the final `sched` hands control to the
/// scheduler, which will never switch back into a Zombie slot.
pub fn exit(code: i32) -> ! {
    let index = exit_and_zombify(code);
    let mut guard = PROC_TABLE.slots[index].lock();
    sched(&mut guard, index);
    unreachable!("exit: a Zombie slot was scheduled again");
}

/// Blocks until a child exits, reaps it, and returns its `(pid, exit_code)`. Returns `None` if
/// the caller has no children at all.
pub fn wait() -> Option<(usize, i32)> {
    let index = current_proc_index().expect("wait: no current process");
    let mut tree = PROC_TABLE.tree.lock();

    loop {
        let mut have_child = false;

        for i in 0..NPROC {
            if tree[i] != Some(index) {
                continue;
            }
            have_child = true;

            let mut child = PROC_TABLE.slots[i].lock();
            if child.state == ProcState::Zombie {
                let pid = child.pid;
                let exit_code = child.exit_code;
                proc_free(&mut child);
                drop(child);
                tree[i] = None;
                return Some((pid, exit_code));
            }
        }

        if !have_child {
            return None;
        }

        tree = sleep(tree_channel(), tree);
    }
}

pub fn getpid() -> usize {
    current_proc_data().pid
}

/// Ticks elapsed since boot, driven by [`record_tick`]. Lives here, not in `trap`, so
/// `sys_sleep` and tests can use it without pulling in the trap module's real-CSR-only code.
static TICKS: SpinLock<usize> = SpinLock::new(0, "ticks");

fn ticks_channel() -> usize {
    &TICKS as *const _ as usize
}

/// Called once per timer tick on hart 0. Bumps the counter and wakes every sleeper waiting on it.
pub fn record_tick() {
    let mut ticks = TICKS.lock();
    *ticks += 1;
    drop(ticks);
    wakeup(ticks_channel());
}

pub fn ticks() -> usize {
    *TICKS.lock()
}

/// Blocks the calling process for `n` timer ticks.
pub fn sleep_ticks(n: usize) {
    let mut guard = TICKS.lock();
    let start = *guard;
    while *guard - start < n {
        guard = sleep(ticks_channel(), guard);
    }
}

pub fn current_trapframe() -> &'static mut TrapFrame {
    unsafe { &mut *tf_ptr(current_proc_data()) }
}

/// `target == 0` reports the current break without changing anything.
pub fn grow(target: usize) -> Result<usize, KernelError> {
    let data = current_proc_data();
    if target == 0 {
        return Ok(data.heap_top.0);
    }

    let ceiling = uvm::stack_floor();
    let pt = data.pagetable.as_mut().expect("grow: no pagetable");
    let new_top = if target > data.heap_top.0 {
        uvm::heap_grow(pt, data.heap_top, target - data.heap_top.0, ceiling)?
    } else {
        uvm::heap_ungrow(pt, data.heap_top, VA(target))
    };

    data.heap_top = new_top;
    Ok(new_top.0)
}

pub fn mmap(begin: usize, npages: u32, perm: usize) -> Result<usize, KernelError> {
    let data = current_proc_data();
    let floor = data.heap_top;
    let ceiling = uvm::stack_bottom(data.ustack_npage);
    let pt = data.pagetable.as_mut().expect("mmap: no pagetable");
    let base = uvm::mmap(pt, &mut data.mmap, floor, ceiling, VA(begin), npages, perm)?;
    Ok(base.0)
}

pub fn munmap(begin: usize, npages: u32) {
    let data = current_proc_data();
    let pt = data.pagetable.as_mut().expect("munmap: no pagetable");
    uvm::munmap(pt, &mut data.mmap, VA(begin), npages);
}

/// Handles a page fault below the current stack by growing it, or fails so the trap path can
/// terminate the process.
pub fn grow_user_stack(fault_addr: usize) -> Result<(), KernelError> {
    let data = current_proc_data();
    let pt = data.pagetable.as_mut().expect("grow_user_stack: no pagetable");
    let new_npage = uvm::ustack_grow(pt, data.ustack_npage, VA(fault_addr))?;
    data.ustack_npage = new_npage;
    Ok(())
}

pub fn copyout(dst: usize, src: &[u8]) -> Result<(), KernelError> {
    let data = current_proc_data();
    let pt = data.pagetable.as_mut().expect("copyout: no pagetable");
    uvm::copy_out(pt, VA(dst), src)
}

pub fn copyin(dst: &mut [u8], src: usize) -> Result<(), KernelError> {
    let data = current_proc_data();
    let pt = data.pagetable.as_mut().expect("copyin: no pagetable");
    uvm::copy_in(pt, dst, VA(src))
}

pub fn copyinstr(dst: &mut [u8], src: usize) -> Result<usize, KernelError> {
    let data = current_proc_data();
    let pt = data.pagetable.as_mut().expect("copyinstr: no pagetable");
    uvm::copy_in_str(pt, dst, VA(src))
}

/// Top of the current process's kernel stack, reinstalled into the trap frame on every return to
/// user mode so the next trap has somewhere to save registers.
pub fn current_kstack_top() -> usize {
    current_proc_data().kstack.0 + NKSTACK_PAGES * PGSIZE
}

/// The `satp` value for the current process's own page table.
#[cfg(target_arch = "riscv64")]
pub fn current_satp() -> usize {
    let pt = current_proc_data().pagetable.as_ref().expect("current_satp: no pagetable");
    crate::riscv::registers::satp::make(pt.as_pa().0)
}

/// The name the process was given at `fork`/`user_init`, for diagnostics.
pub fn current_name() -> String {
    current_proc_data().name.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    // PROC_TABLE and CPUS are process-wide singletons; serialise every test that touches them.
    static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn set_current(index: Option<usize>) {
        push_off();
        unsafe { current_cpu() }.proc = index;
        pop_off();
    }

    fn free_all_slots() {
        for i in 0..NPROC {
            let mut guard = PROC_TABLE.slots[i].lock();
            if guard.state != ProcState::Unused {
                proc_free(&mut guard);
            }
        }
        *PROC_TABLE.tree.lock() = [None; NPROC];
        PROC_TABLE.next_pid.store(1, Ordering::Relaxed);
    }

    #[test]
    fn proc_alloc_then_free_recycles_the_slot() {
        let _guard = TEST_LOCK.lock().unwrap();
        free_all_slots();

        let (index, proc) = proc_alloc().unwrap();
        assert_eq!(proc.state, ProcState::Runnable);
        assert!(proc.pid > 0);
        assert_eq!(proc.heap_top, VA(USER_BASE + PGSIZE));
        assert_eq!(proc.ustack_npage, 0);
        drop(proc);

        let mut proc = PROC_TABLE.slots[index].lock();
        proc_free(&mut proc);
        assert_eq!(proc.state, ProcState::Unused);
        assert_eq!(proc.pid, 0);
        drop(proc);

        free_all_slots();
    }

    #[test]
    fn user_init_lands_in_the_reserved_slot_with_pid_one() {
        let _guard = TEST_LOCK.lock().unwrap();
        free_all_slots();

        user_init();
        let proc = PROC_TABLE.slots[INIT_SLOT].lock();
        assert_eq!(proc.pid, 1);
        assert_eq!(proc.state, ProcState::Runnable);
        assert_eq!(proc.name, "init");
        drop(proc);

        free_all_slots();
    }

    #[test]
    fn fork_clears_child_return_value_and_uses_childs_own_kernel_stack() {
        let _guard = TEST_LOCK.lock().unwrap();
        free_all_slots();

        let (parent_index, mut parent) = proc_alloc().unwrap();
        let parent_pid = parent.pid;
        let pt = parent.pagetable.as_mut().unwrap();
        uvm::map_first_page(pt, &INITCODE).unwrap();
        drop(parent);

        set_current(Some(parent_index));
        let child_pid = fork().unwrap();
        set_current(None);

        assert_ne!(child_pid, parent_pid);

        let tree = PROC_TABLE.tree.lock();
        let child_index = (0..NPROC).find(|&i| tree[i] == Some(parent_index)).unwrap();
        drop(tree);

        let child = PROC_TABLE.slots[child_index].lock();
        assert_eq!(child.pid, child_pid);
        let tf = unsafe { &*tf_ptr(&child) };
        assert_eq!(tf.a0, 0);
        assert_eq!(tf.user_to_kern_sp, child.kstack.0 + NKSTACK_PAGES * PGSIZE);
        drop(child);

        free_all_slots();
    }

    #[test]
    fn wait_returns_none_without_children() {
        let _guard = TEST_LOCK.lock().unwrap();
        free_all_slots();

        let (index, proc) = proc_alloc().unwrap();
        drop(proc);

        set_current(Some(index));
        assert!(wait().is_none());
        set_current(None);

        free_all_slots();
    }

    #[test]
    fn wait_reaps_zombie() {
        let _guard = TEST_LOCK.lock().unwrap();
        free_all_slots();

        let (parent_index, mut parent) = proc_alloc().unwrap();
        let pt = parent.pagetable.as_mut().unwrap();
        uvm::map_first_page(pt, &INITCODE).unwrap();
        drop(parent);

        set_current(Some(parent_index));
        let child_pid = fork().unwrap();

        let tree = PROC_TABLE.tree.lock();
        let child_index = (0..NPROC).find(|&i| tree[i] == Some(parent_index)).unwrap();
        drop(tree);

        set_current(Some(child_index));
        let reaped_index = exit_and_zombify(7);
        assert_eq!(reaped_index, child_index);

        set_current(Some(parent_index));
        let (pid, exit_code) = wait().expect("parent has a zombie child");
        set_current(None);

        assert_eq!(pid, child_pid);
        assert_eq!(exit_code, 7);
        assert_eq!(PROC_TABLE.slots[child_index].lock().state, ProcState::Unused);

        free_all_slots();
    }

    #[test]
    fn orphan_is_reparented_to_init_and_reaped_by_it() {
        let _guard = TEST_LOCK.lock().unwrap();
        free_all_slots();

        user_init();
        let init_index = INIT_SLOT;

        let (parent_index, mut parent) = proc_alloc().unwrap();
        let pt = parent.pagetable.as_mut().unwrap();
        uvm::map_first_page(pt, &INITCODE).unwrap();
        drop(parent);

        set_current(Some(parent_index));
        let child_pid = fork().unwrap();

        let tree = PROC_TABLE.tree.lock();
        let child_index = (0..NPROC).find(|&i| tree[i] == Some(parent_index)).unwrap();
        drop(tree);

        // Parent exits before its child does; the child must be reparented to init.
        exit_and_zombify(0);
        assert_eq!(PROC_TABLE.tree.lock()[child_index], Some(init_index));

        set_current(Some(child_index));
        exit_and_zombify(9);

        set_current(Some(init_index));
        let (pid, exit_code) = wait().expect("init inherited the orphan");
        set_current(None);

        assert_eq!(pid, child_pid);
        assert_eq!(exit_code, 9);

        free_all_slots();
    }
}
