//! Syscall number table, argument-fetch helpers, and the dispatcher `usertrap` calls on every
//! ecall. Handlers live in [`crate::sysproc`]; this module only decodes the trap frame and
//! encodes the result back into it.

use core::fmt::{self, Display};

use crate::error::KernelError;
use crate::proc;
use crate::sysproc;

/// Errors a handler can report back to user code as a `-1` return. Distinct from
/// [`KernelError`], which also covers kernel-internal failures this layer never surfaces raw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
    /// A bad alignment, zero length, or out-of-range argument.
    InvalidArgument,
    /// The requested address range overlaps an existing mapping.
    AddressCollision,
    /// The frame allocator or process table was exhausted.
    OutOfMemory,
    /// `wait` was called with no children left to reap.
    NoChildren,
    /// A copy primitive touched an address outside the caller's mapped address space.
    BadAddress,
    /// The syscall number in `a7` has no handler.
    Unknown(usize),
}

impl From<KernelError> for SysError {
    fn from(e: KernelError) -> Self {
        match e {
            KernelError::InvalidPage => SysError::BadAddress,
            KernelError::InvalidArgument => SysError::InvalidArgument,
            KernelError::AddressCollision => SysError::AddressCollision,
            KernelError::Alloc | KernelError::OutOfProc => SysError::OutOfMemory,
            KernelError::Syscall(inner) => inner,
        }
    }
}

impl Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SysError::InvalidArgument => write!(f, "invalid argument"),
            SysError::AddressCollision => write!(f, "address range collides with an existing mapping"),
            SysError::OutOfMemory => write!(f, "out of memory"),
            SysError::NoChildren => write!(f, "no children to wait for"),
            SysError::BadAddress => write!(f, "address outside the caller's address space"),
            SysError::Unknown(n) => write!(f, "unknown syscall number {n}"),
        }
    }
}

/// Wire-stable numbers 1 through 6 are load-bearing for anything that talks to this kernel from
/// outside the tree; numbers above 6 are this kernel's own extensions and may be renumbered
/// freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Syscall {
    CopyIn = 1,
    CopyOut = 2,
    CopyInStr = 3,
    Brk = 4,
    Mmap = 5,
    Munmap = 6,
    Fork = 7,
    Exit = 8,
    Wait = 9,
    GetPid = 10,
    Sleep = 11,
    PrintStr = 12,
    PrintInt = 13,
}

impl TryFrom<usize> for Syscall {
    type Error = ();

    fn try_from(n: usize) -> Result<Self, ()> {
        Ok(match n {
            1 => Syscall::CopyIn,
            2 => Syscall::CopyOut,
            3 => Syscall::CopyInStr,
            4 => Syscall::Brk,
            5 => Syscall::Mmap,
            6 => Syscall::Munmap,
            7 => Syscall::Fork,
            8 => Syscall::Exit,
            9 => Syscall::Wait,
            10 => Syscall::GetPid,
            11 => Syscall::Sleep,
            12 => Syscall::PrintStr,
            13 => Syscall::PrintInt,
            _ => return Err(()),
        })
    }
}

/// Reads the n-th syscall argument register (0-indexed into `a0..a5`) as a 64-bit value.
pub fn arg_uint64(n: usize) -> usize {
    proc::current_trapframe().arg(n)
}

/// Reads the n-th syscall argument register, truncated to 32 bits.
pub fn arg_uint32(n: usize) -> u32 {
    arg_uint64(n) as u32
}

/// Copies a NUL-terminated string from the n-th argument's user address into `buf`. Returns the
/// string length, excluding the terminator.
pub fn arg_str(n: usize, buf: &mut [u8]) -> Result<usize, SysError> {
    let addr = arg_uint64(n);
    Ok(proc::copyinstr(buf, addr)?)
}

/// Reads the syscall number from `a7`, dispatches to its handler, and writes the handler's result
/// (or `-1` on error or an unrecognised number) into `a0`.
pub fn syscall() {
    let num = proc::current_trapframe().a7;

    let result = match Syscall::try_from(num) {
        Ok(Syscall::CopyIn) => sysproc::sys_copyin(),
        Ok(Syscall::CopyOut) => sysproc::sys_copyout(),
        Ok(Syscall::CopyInStr) => sysproc::sys_copyinstr(),
        Ok(Syscall::Brk) => sysproc::sys_brk(),
        Ok(Syscall::Mmap) => sysproc::sys_mmap(),
        Ok(Syscall::Munmap) => sysproc::sys_munmap(),
        Ok(Syscall::Fork) => sysproc::sys_fork(),
        Ok(Syscall::Exit) => sysproc::sys_exit(),
        Ok(Syscall::Wait) => sysproc::sys_wait(),
        Ok(Syscall::GetPid) => sysproc::sys_getpid(),
        Ok(Syscall::Sleep) => sysproc::sys_sleep(),
        Ok(Syscall::PrintStr) => sysproc::sys_print_str(),
        Ok(Syscall::PrintInt) => sysproc::sys_print_int(),
        Err(()) => Err(SysError::Unknown(num)),
    };

    let tf = proc::current_trapframe();
    tf.a0 = match result {
        Ok(v) => v as usize,
        Err(e) => {
            #[cfg(debug_assertions)]
            crate::println!("syscall {}: {}", num, e);
            (-1i64) as usize
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_match_the_wire_stable_table() {
        assert_eq!(Syscall::try_from(1).unwrap(), Syscall::CopyIn);
        assert_eq!(Syscall::try_from(2).unwrap(), Syscall::CopyOut);
        assert_eq!(Syscall::try_from(3).unwrap(), Syscall::CopyInStr);
        assert_eq!(Syscall::try_from(4).unwrap(), Syscall::Brk);
        assert_eq!(Syscall::try_from(5).unwrap(), Syscall::Mmap);
        assert_eq!(Syscall::try_from(6).unwrap(), Syscall::Munmap);
    }

    #[test]
    fn unknown_syscall_number_is_rejected() {
        assert!(Syscall::try_from(0).is_err());
        assert!(Syscall::try_from(999).is_err());
    }
}
