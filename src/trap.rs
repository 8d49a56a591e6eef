//! Trap entry and dispatch: ecalls from user mode, page faults, and the timer tick that drives
//! preemption. [`crate::trampoline::uservec`]/[`crate::trampoline::userret`] and
//! [`crate::kernelvec::kernelvec`] are the two entry points that land here; nothing else jumps
//! into this module.

use crate::memlayout::TRAMPOLINE;
use crate::proc;
use crate::riscv::interrupts;
use crate::riscv::registers::{satp, scause, sepc, sip, sstatus, stval, stvec};
use crate::trampoline::{trampoline_start, userret, uservec};

/// Handles an interrupt, exception, or system call from user space.
///
/// # Safety
/// Only ever reached via [`crate::trampoline::uservec`], with `satp` already switched back to the
/// kernel page table.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usertrap() -> ! {
    assert_eq!(unsafe { sstatus::read() } & sstatus::SPP, 0, "usertrap: not from user mode");

    // Subsequent traps while we're in the kernel go to kerneltrap, not back here.
    unsafe { stvec::write(kernelvec_address()) };

    let tf = proc::current_trapframe();
    tf.epc = unsafe { sepc::read() };

    let cause = scause::Scause::from(unsafe { scause::read() });
    let which_dev = match cause.cause() {
        scause::Trap::Exception(scause::Exception::EnvironmentCall) => {
            // sepc points at the ecall itself; resume after it.
            tf.epc += 4;
            // An interrupt mid-syscall would clobber sepc/scause/sstatus; safe to re-enable now
            // that this trap is done reading them.
            interrupts::enable();
            crate::syscall::syscall();
            None
        }
        scause::Trap::Exception(
            scause::Exception::InstructionPageFault
            | scause::Exception::LoadPageFault
            | scause::Exception::StorePageFault,
        ) => {
            let fault_addr = unsafe { stval::read() };
            if proc::grow_user_stack(fault_addr).is_err() {
                crate::println!(
                    "usertrap: unrecoverable fault at {:#x} in pid {}, killing process",
                    fault_addr,
                    proc::getpid()
                );
                proc::exit(-1);
            }
            None
        }
        scause::Trap::Interrupt(intr) => dev_intr(intr),
        scause::Trap::Exception(_) => {
            crate::println!(
                "usertrap: unhandled scause={:#x} pid={} epc={:#x}",
                cause.bits(),
                proc::getpid(),
                tf.epc,
            );
            proc::exit(-1);
        }
    };

    if which_dev == Some(InterruptType::Timer) {
        proc::r#yield();
    }

    unsafe { usertrap_ret(proc::current_proc_index().expect("usertrap: no current process")) }
}

/// Prepares the trap frame for the next trap and jumps into `userret` to resume user execution.
/// Never returns: control leaves the kernel entirely. `index` must be the slot currently running
/// on this hart, with nothing but that slot's state left to touch.
///
/// # Safety
/// Must only be called with `index`'s page table, trap frame, and kernel stack fully set up
/// (either by [`proc::fork`]/[`proc::user_init`] or by a prior trap into [`usertrap`]).
pub unsafe fn usertrap_ret(index: usize) -> ! {
    let _ = index;
    interrupts::disable();

    // Send the next trap to uservec, not kerneltrap: we're about to leave kernel mode.
    unsafe { stvec::write(TRAMPOLINE + trampoline_offset(uservec as usize)) };

    let user_satp = proc::current_satp();
    let kstack_top = proc::current_kstack_top();
    let hartid = proc::current_hart();

    let tf = proc::current_trapframe();
    tf.user_to_kern_satp = unsafe { satp::read() };
    tf.user_to_kern_sp = kstack_top;
    tf.user_to_kern_trapvector = usertrap as usize;
    tf.user_to_kern_hartid = hartid;

    let mut status = unsafe { sstatus::read() };
    status &= !sstatus::SPP; // return to user mode
    status |= sstatus::SPIE; // enable interrupts once back in user mode
    unsafe { sstatus::write(status) };

    unsafe { sepc::write(tf.epc) };

    let userret_va = TRAMPOLINE + trampoline_offset(userret as usize);
    let userret_fn: unsafe extern "C" fn(usize) -> ! = unsafe { core::mem::transmute(userret_va) };
    unsafe { userret_fn(user_satp) }
}

fn trampoline_offset(addr: usize) -> usize {
    addr - trampoline_start as usize
}

fn kernelvec_address() -> usize {
    crate::kernelvec::kernelvec as usize
}

/// Interrupts and exceptions taken while already in the kernel arrive here via `kernelvec`, on
/// whatever kernel stack was interrupted.
///
/// # Safety
/// Only ever reached via [`crate::kernelvec::kernelvec`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kerneltrap() {
    let epc = unsafe { sepc::read() };
    let status = unsafe { sstatus::read() };
    let cause = scause::Scause::from(unsafe { scause::read() });

    assert_eq!(status & sstatus::SPP, sstatus::SPP, "kerneltrap: not from supervisor mode");
    assert!(!interrupts::get(), "kerneltrap: interrupts were enabled");

    let which_dev = match cause.cause() {
        scause::Trap::Interrupt(intr) => dev_intr(intr),
        scause::Trap::Exception(e) => {
            crate::println!("kerneltrap: scause={:#x} epc={:#x}", cause.bits(), epc);
            panic!("kerneltrap: unexpected exception {:?}", e);
        }
    };

    if which_dev.is_none() {
        crate::println!("kerneltrap: scause={:#x} epc={:#x}", cause.bits(), epc);
        panic!("kerneltrap: unrecognised interrupt");
    }

    // A yield below may run other traps that clobber sepc/sstatus; restore ours before kernelvec's
    // sret reads them.
    if which_dev == Some(InterruptType::Timer) && proc::current_proc_index().is_some() {
        proc::r#yield();
    }

    unsafe { sepc::write(epc) };
    unsafe { sstatus::write(status) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptType {
    Timer,
    Other,
}

/// Services a device interrupt. The timer, forwarded down from machine mode as a supervisor
/// software interrupt by `timervec` (see `kernelvec.rs`), is the only device interrupt source in
/// scope; anything else is reported and ignored.
fn dev_intr(intr: scause::Interrupt) -> Option<InterruptType> {
    match intr {
        scause::Interrupt::SupervisorSoftware => {
            if proc::current_hart() == 0 {
                proc::record_tick();
            }
            // Acknowledge: clear the software-interrupt-pending bit timervec set.
            unsafe { sip::write(sip::read() & !sip::SSIP) };
            Some(InterruptType::Timer)
        }
        scause::Interrupt::SupervisorTimer | scause::Interrupt::SupervisorExternal => {
            crate::println!("dev_intr: unhandled interrupt {:?}", intr);
            Some(InterruptType::Other)
        }
        scause::Interrupt::Unknown => None,
    }
}

/// Installs the kernel trap vector for this hart. Must run once per hart, after boot has set up
/// this hart's kernel stack (the hart's own Running slot has not been entered yet).
///
/// # Safety
/// Must be called exactly once per hart, before interrupts are ever enabled on it.
pub unsafe fn init_hart() {
    unsafe { stvec::write(kernelvec_address()) };
}
