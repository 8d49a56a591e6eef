//! Syscall handlers: thin, niladic bindings from [`crate::syscall::Syscall`] variants onto the
//! process, memory, and console layers. Every handler reads its own arguments via
//! [`crate::syscall::arg_uint64`]/`arg_uint32`/`arg_str`; none take parameters directly.

use crate::param::STR_MAXLEN;
use crate::proc;
use crate::riscv::{PGSIZE, PTE_R, PTE_U, PTE_W};
use crate::syscall::{self, SysError};

/// Fixed shape the copy-primitive syscalls exercise: an incrementing byte sequence, short enough
/// to live on the kernel stack on either side of the copy.
const COPY_TEST_LEN: usize = 64;

pub fn sys_copyin() -> Result<i64, SysError> {
    let src = syscall::arg_uint64(0);
    let mut buf = [0u8; COPY_TEST_LEN];
    proc::copyin(&mut buf, src)?;
    Ok(0)
}

pub fn sys_copyout() -> Result<i64, SysError> {
    let dst = syscall::arg_uint64(0);
    let mut pattern = [0u8; COPY_TEST_LEN];
    for (i, b) in pattern.iter_mut().enumerate() {
        *b = i as u8;
    }
    proc::copyout(dst, &pattern)?;
    Ok(0)
}

pub fn sys_copyinstr() -> Result<i64, SysError> {
    let src = syscall::arg_uint64(0);
    let mut buf = [0u8; STR_MAXLEN + 1];
    let len = proc::copyinstr(&mut buf, src)?;
    Ok(len as i64)
}

/// `target == 0` reports the current break without changing anything.
pub fn sys_brk() -> Result<i64, SysError> {
    let target = syscall::arg_uint64(0);
    let top = proc::grow(target)?;
    Ok(top as i64)
}

pub fn sys_mmap() -> Result<i64, SysError> {
    let start = syscall::arg_uint64(0);
    let len = syscall::arg_uint64(1);

    if len == 0 || len % PGSIZE != 0 || start % PGSIZE != 0 {
        return Err(SysError::InvalidArgument);
    }

    let npages = (len / PGSIZE) as u32;
    let base = proc::mmap(start, npages, PTE_R | PTE_W | PTE_U)?;
    Ok(base as i64)
}

pub fn sys_munmap() -> Result<i64, SysError> {
    let start = syscall::arg_uint64(0);
    let len = syscall::arg_uint64(1);

    if len == 0 || len % PGSIZE != 0 || start % PGSIZE != 0 {
        return Err(SysError::InvalidArgument);
    }

    let npages = (len / PGSIZE) as u32;
    proc::munmap(start, npages);
    Ok(0)
}

pub fn sys_fork() -> Result<i64, SysError> {
    let pid = proc::fork()?;
    Ok(pid as i64)
}

pub fn sys_exit() -> Result<i64, SysError> {
    let code = syscall::arg_uint32(0) as i32;
    proc::exit(code);
}

/// Writes the reaped child's exit code to the user address in argument 0, unless that address is
/// null. Returns the child's PID, or fails if the caller has no children.
pub fn sys_wait() -> Result<i64, SysError> {
    let status_addr = syscall::arg_uint64(0);
    let (pid, exit_code) = proc::wait().ok_or(SysError::NoChildren)?;

    if status_addr != 0 {
        proc::copyout(status_addr, &exit_code.to_ne_bytes())?;
    }

    Ok(pid as i64)
}

pub fn sys_getpid() -> Result<i64, SysError> {
    Ok(proc::getpid() as i64)
}

pub fn sys_sleep() -> Result<i64, SysError> {
    let ticks = syscall::arg_uint64(0);
    proc::sleep_ticks(ticks);
    Ok(0)
}

pub fn sys_print_str() -> Result<i64, SysError> {
    let mut buf = [0u8; STR_MAXLEN + 1];
    let len = syscall::arg_str(0, &mut buf)?;
    let s = core::str::from_utf8(&buf[..len]).map_err(|_| SysError::InvalidArgument)?;
    crate::print!("{}", s);
    Ok(0)
}

pub fn sys_print_int() -> Result<i64, SysError> {
    let value = syscall::arg_uint64(0) as i64;
    crate::println!("{}", value);
    Ok(0)
}
