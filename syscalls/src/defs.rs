// syscall constants and types
// These are in a separate file so that both the kernel code and userspace libc can include/use them.

/// Handle returned by `mmap`, passed back to `munmap`.
pub type MapId = i32;

/// `mmap` result when the mapping could not be created.
pub const MAP_FAILED: MapId = -1;
/// `munmap` argument that removes every mapping of the calling process.
pub const MUNMAP_ALL: MapId = -1;

/// Exit status of a process killed for touching memory it does not own.
pub const EXIT_FAULT: i32 = -1;

pub const EIO: isize = 5;
pub const EBADF: isize = 9;
pub const ENOMEM: isize = 12;
pub const EFAULT: isize = 14;
pub const EEXIST: isize = 17;
pub const EINVAL: isize = 22;
pub const ENOSPC: isize = 28;
pub const ERANGE: isize = 34;
pub const EILSEQ: isize = 84;

pub const SYS_MMAP: usize = 0x5a;
pub const SYS_MUNMAP: usize = 0x5b;
