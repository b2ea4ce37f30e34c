//! Thin wait/post wrapper over a POSIX semaphore embedded in the segment.

use std::cell::UnsafeCell;
use std::io;

/// Capability over a process-shared `sem_t` living inside a mapped segment.
/// Copying the capability copies the pointer, not the semaphore.
#[derive(Clone, Copy)]
pub(crate) struct Semaphore {
    sem: *mut libc::sem_t,
}

impl Semaphore {
    #[inline]
    pub(crate) fn new(cell: &UnsafeCell<libc::sem_t>) -> Semaphore {
        Semaphore { sem: cell.get() }
    }

    /// Prepares the semaphore with zero tokens. Creator side only; the peer
    /// process addresses the same `sem_t` through its own mapping.
    pub(crate) fn init(&self) -> io::Result<()> {
        if unsafe { libc::sem_init(self.sem, 1, 0) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocks until a token is available and consumes it. Restarts on EINTR.
    pub(crate) fn wait(&self) -> io::Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Releases one token, waking the peer if it is parked.
    pub(crate) fn post(&self) -> io::Result<()> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
