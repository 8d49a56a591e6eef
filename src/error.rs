//! Kernel-wide error type and the logging macros used in place of bare `return Err(...)` / `?`.

use core::fmt::{self, Display};

use crate::syscall::SysError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The global allocator returned `Err`.
    Alloc,
    /// A page-table walk hit an unmapped or non-leaf entry where a leaf was required.
    InvalidPage,
    /// A syscall argument or VM request failed a sanity check (bad alignment, zero length, ...).
    InvalidArgument,
    /// No unused process slot was available.
    OutOfProc,
    /// A requested mapping would overlap the heap, stack, or an existing mmap region.
    AddressCollision,
    Syscall(SysError),
}

impl From<SysError> for KernelError {
    fn from(value: SysError) -> Self {
        Self::Syscall(value)
    }
}

impl Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Alloc => write!(f, "allocation failure"),
            KernelError::InvalidPage => write!(f, "invalid or unmapped page"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::OutOfProc => write!(f, "process table exhausted"),
            KernelError::AddressCollision => write!(f, "address range collides with an existing mapping"),
            KernelError::Syscall(e) => write!(f, "syscall error: {e}"),
        }
    }
}

/// Returns `Err($e)`, logging the hart id and source location in debug builds. Use instead of
/// a bare `return Err(...)`.
#[macro_export]
macro_rules! err {
    ($e:expr) => {{
        #[cfg(debug_assertions)]
        $crate::println!(
            "! hart {} errored at {}:{}: {}",
            $crate::proc::current_hart(),
            file!(),
            line!(),
            $e
        );
        return Err($e.into());
    }};
}

/// Passes an existing `Result` through, logging the source location on `Err` in debug builds.
#[macro_export]
macro_rules! log {
    ($e:expr) => {
        match $e {
            Ok(v) => Ok(v),
            Err(e) => {
                #[cfg(debug_assertions)]
                $crate::println!("  at {}:{}", file!(), line!());
                Err(e)
            }
        }
    };
}

/// Like `?`, but logs the source location on `Err` in debug builds before propagating.
#[macro_export]
macro_rules! try_log {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => {
                #[cfg(debug_assertions)]
                $crate::println!("  at {}:{}", file!(), line!());
                return Err(e.into());
            }
        }
    };
}
