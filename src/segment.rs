//! POSIX shared memory segments backing the pipe.
//!
//! The segment lives in the shm namespace (`/dev/shm` on Linux): the creator
//! calls `shm_open` with `O_CREAT | O_EXCL`, sizes it with `ftruncate` and
//! maps it; openers map the existing name. The descriptor is closed right
//! after mapping; the mapping keeps the segment alive. Nothing here unlinks
//! implicitly; names persist until [`unlink`] removes them.

use crate::error::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::FromRawFd;

/// A named, mapped shared memory segment. Unmapped on drop.
pub(crate) struct Segment {
    pub(crate) name: String,
    pub(crate) map: MmapMut,
}

impl Segment {
    /// Creates a fresh zero-filled segment of exactly `size` bytes. Fails if
    /// the name already exists.
    pub(crate) fn create(name: &str, size: usize) -> Result<Segment> {
        let c_name = validated_name(name)?;

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let file = unsafe { File::from_raw_fd(fd) };

        match Self::size_and_map(&file, size) {
            Ok(map) => Ok(Segment {
                name: name.to_owned(),
                map,
            }),
            Err(err) => {
                // do not leak a half-built name
                let _ = unlink(name);
                Err(err)
            }
        }
    }

    fn size_and_map(file: &File, size: usize) -> Result<MmapMut> {
        file.set_len(size as u64).map_err(Error::Io)?;
        let map = unsafe { MmapOptions::new().map_mut(file)? };
        Ok(map)
    }

    /// Maps an existing segment whole; its size comes from the name itself.
    pub(crate) fn open(name: &str) -> Result<Segment> {
        let c_name = validated_name(name)?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let file = unsafe { File::from_raw_fd(fd) };

        let map = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Segment {
            name: name.to_owned(),
            map,
        })
    }
}

/// Removes `name` from the shared memory namespace.
///
/// Existing mappings stay usable; the backing memory is reclaimed once every
/// process has unmapped it. Unlinking a name that does not exist is not an
/// error, so cleanup paths can call this unconditionally.
pub fn unlink(name: &str) -> Result<()> {
    let c_name = validated_name(name)?;
    if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::NotFound {
            return Err(err.into());
        }
    }
    Ok(())
}

/// Segment names follow shm_open(3) rules: a leading `/`, no further `/`,
/// at most 255 bytes, no interior NUL.
fn validated_name(name: &str) -> Result<CString> {
    if !name.starts_with('/') || name.len() < 2 {
        return Err(Error::InvalidName(name.to_owned()));
    }
    if name[1..].contains('/') {
        return Err(Error::InvalidName(name.to_owned()));
    }
    if name.len() > 255 {
        return Err(Error::InvalidName(name.to_owned()));
    }
    CString::new(name).map_err(|_| Error::InvalidName(name.to_owned()))
}
