//! Exclusive advisory locking for the backing file.
//!
//! One instance owns the database file for its whole lifetime. The lock is
//! taken non-blocking at open, directly on the data file's descriptor, and
//! released by the operating system when the file handle closes.

use std::fs::File;
use std::io;

/// Whether a failed lock attempt means "held by someone else" rather than a
/// system failure.
pub fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// Acquires an exclusive, non-blocking advisory lock on `file`.
#[cfg(unix)]
pub fn try_lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    use libc::{flock, LOCK_EX, LOCK_NB};

    let fd = file.as_raw_fd();
    let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
pub fn try_lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;

    use winapi::um::fileapi::LockFileEx;
    use winapi::um::minwinbase::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, OVERLAPPED};

    let handle = file.as_raw_handle();
    let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
    let result = unsafe {
        LockFileEx(
            handle as *mut _,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            !0,
            !0,
            &mut overlapped,
        )
    };

    if result == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Fallback for other platforms: no advisory locking available, succeed.
#[cfg(not(any(unix, windows)))]
pub fn try_lock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}
