//! Compile-time bounds on the fixed-size pools the kernel never grows at runtime.

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Maximum number of simultaneous processes.
pub const NPROC: usize = 64;

/// Number of kernel-stack pages per process. Debug builds get guard room for deep recursion;
/// release builds stay tight since `kstack` is pre-computed per slot, not allocated lazily.
pub const NKSTACK_PAGES: usize = if cfg!(debug_assertions) { 4 } else { 1 };

/// Pages reserved for the user stack above `USER_BASE`; grows down from `TRAPFRAME`.
pub const USTACK_MAX_PAGES: usize = 32;

/// Number of descriptors in the mmap-region pool. One process rarely holds more than a handful
/// of live regions; this bounds total pool memory across all processes combined.
pub const NMMAP: usize = NPROC * 8;

/// Longest string a syscall may copy in from user space via `sys_copyinstr` / `fetch_string`.
pub const STR_MAXLEN: usize = 127;
