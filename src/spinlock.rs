//! Mutual exclusion with deferred-interrupt discipline.
//!
//! `push_off`/`pop_off` implement a per-CPU interrupt-nesting counter: the first `push_off`
//! disables interrupts and remembers whether they were enabled beforehand; matching `pop_off`
//! calls decrement the counter and only re-enable interrupts once it reaches zero. Every
//! [`SpinLock::lock`] call is a `push_off`, and every guard drop is a `pop_off`, which makes any
//! locked section implicitly interrupt-safe and lets locks nest freely without the nested
//! acquire ever re-enabling interrupts early.

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::proc::{Cpu, current_cpu};
use crate::riscv::interrupts;

/// Disables interrupts and increments this hart's nesting counter.
pub fn push_off() {
    let old = interrupts::get();
    interrupts::disable();

    let cpu = unsafe { current_cpu() };
    if cpu.num_off == 0 {
        cpu.interrupts_enabled = old;
    }
    cpu.num_off += 1;
}

/// Decrements this hart's nesting counter, restoring interrupts once it reaches zero.
pub fn pop_off() {
    assert!(!interrupts::get(), "pop_off: interruptible");

    let cpu = unsafe { current_cpu() };
    assert!(cpu.num_off >= 1, "pop_off: not nested");

    cpu.num_off -= 1;
    if cpu.num_off == 0 && cpu.interrupts_enabled {
        interrupts::enable();
    }
}

/// A spinlock guarding a value of type `T`. Held at most momentarily; a thread that spins here
/// never sleeps, so the protected section must be short and must not itself call anything that
/// suspends (`sleep`, `wait`, allocation failure paths that log).
#[derive(Debug)]
pub struct SpinLock<T> {
    name: &'static str,
    /// Null when unlocked; otherwise the owning hart's `Cpu` pointer doubles as both the lock
    /// bit and the "who is holding this" witness `holding()` checks against.
    owner: AtomicPtr<Cpu>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        Self {
            name,
            owner: AtomicPtr::new(ptr::null_mut()),
            data: UnsafeCell::new(value),
        }
    }

    /// # Safety
    /// Must be called with interrupts disabled, so `current_cpu()` cannot change underneath it.
    unsafe fn holding(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == unsafe { current_cpu() as *mut Cpu }
    }

    /// Returns true iff the calling hart currently holds this lock.
    pub fn is_held_by_current(&self) -> bool {
        push_off();
        let held = unsafe { self.holding() };
        pop_off();
        held
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        push_off();

        assert!(!unsafe { self.holding() }, "acquire: already holding {}", self.name);

        loop {
            if self
                .owner
                .compare_exchange(
                    ptr::null_mut(),
                    unsafe { current_cpu() as *mut Cpu },
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return SpinLockGuard { lock: self };
            }
            hint::spin_loop();
        }
    }

    /// Releases the lock the caller currently holds without going through a guard. Only
    /// `fork_ret` needs this: the scheduler's own stack frame holds the guard across a `swtch`
    /// into a brand-new process whose stack never ran that frame's code, so there is no guard
    /// value on this stack to drop.
    ///
    /// # Safety
    /// The calling hart must actually hold the lock, and no [`SpinLockGuard`] for it may be
    /// dropped afterward (that would release it a second time).
    pub unsafe fn force_unlock(&self) {
        assert!(unsafe { self.holding() }, "force_unlock: {} not held", self.name);
        self.owner.store(ptr::null_mut(), Ordering::Release);
        pop_off();
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Bypasses locking entirely. Used only for best-effort diagnostic dumps that must not risk
    /// deadlocking against a hung lock holder.
    ///
    /// # Safety
    /// Caller must ensure no other hart is concurrently mutating the value.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// Releases the lock early, the same way dropping the guard would, but hands back a
    /// reference that can be re-locked later. This is how the two-lock `sleep` protocol drops
    /// the caller's condition lock before (and re-acquires it after) the process lock governs
    /// the actual sleep.
    pub fn unlock(self) -> &'a SpinLock<T> {
        self.lock
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        assert!(unsafe { self.lock.holding() }, "release: {} not held", self.lock.name);
        self.lock.owner.store(ptr::null_mut(), Ordering::Release);
        pop_off();
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}
