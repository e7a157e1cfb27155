//! POSIX shared memory and named semaphores backing the debug output buffer.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::FromRawFd;
use std::time::Duration;

use memmap2::MmapMut;

use super::DBWIN_BUFFER_SIZE;
use crate::error::{CaptureError, Result};

const MODE: libc::mode_t = 0o600;

/// Map an object name to a POSIX name: one leading slash, no other slashes
fn posix_name(name: &str) -> Result<CString> {
    let mapped = format!("/{}", name.replace(['\\', '/'], "."));
    CString::new(mapped).map_err(|e| {
        CaptureError::os("object name", io::Error::new(io::ErrorKind::InvalidInput, e))
    })
}

fn classify(op: &'static str, name: &str, err: io::Error) -> CaptureError {
    match err.raw_os_error() {
        Some(libc::EEXIST) => CaptureError::DuplicateInstance {
            name: name.to_string(),
        },
        Some(libc::EACCES) | Some(libc::EPERM) => CaptureError::PermissionDenied {
            name: name.to_string(),
        },
        Some(libc::ENOENT) => CaptureError::NoListener {
            name: name.to_string(),
        },
        _ => CaptureError::os(op, err),
    }
}

/// Whether this process may create global-scope capture objects
pub(super) fn has_global_rights() -> bool {
    // SAFETY: geteuid has no preconditions
    unsafe { libc::geteuid() == 0 }
}

/// The shared-memory region holding one debug output record
///
/// The creating reader holds an exclusive `flock` on the object for as long
/// as it lives. Unlike a Windows section, a POSIX object outlives a reader
/// that was killed, so an unlocked existing object is stale and is replaced.
pub(super) struct SharedBuffer {
    name: CString,
    map: MmapMut,
    _file: File,
    owner: bool,
}

fn shm_create(cname: &CString) -> io::Result<File> {
    // SAFETY: cname is a valid NUL-terminated string
    let fd = unsafe {
        libc::shm_open(
            cname.as_ptr(),
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            MODE,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just returned by shm_open and is owned by nobody else
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Take the reader lock without blocking; false if another reader holds it
fn try_lock(file: &File) -> io::Result<bool> {
    use std::os::fd::AsRawFd;
    // SAFETY: file owns a valid descriptor for the duration of the call
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

fn duplicate(name: &str) -> CaptureError {
    CaptureError::DuplicateInstance {
        name: name.to_string(),
    }
}

impl SharedBuffer {
    /// Create the region; fails if a live reader already owns it
    pub(super) fn create(name: &str) -> Result<Self> {
        let cname = posix_name(name)?;
        let file = match shm_create(&cname) {
            Ok(file) => file,
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                Self::reclaim(name, &cname)?;
                shm_create(&cname).map_err(|e| classify("shm_open", name, e))?
            }
            Err(e) => return Err(classify("shm_open", name, e)),
        };

        let locked = try_lock(&file).map_err(|e| CaptureError::os("flock", e));
        let mapped = match locked {
            Ok(true) => file
                .set_len(DBWIN_BUFFER_SIZE as u64)
                .map_err(|e| CaptureError::os("ftruncate", e))
                // SAFETY: the region is only written through the rendezvous protocol
                .and_then(|()| unsafe { MmapMut::map_mut(&file) }.map_err(|e| CaptureError::os("mmap", e))),
            // Another reader reclaimed the name between create and lock
            Ok(false) => return Err(duplicate(name)),
            Err(e) => Err(e),
        };

        match mapped {
            Ok(map) => Ok(Self {
                name: cname,
                map,
                _file: file,
                owner: true,
            }),
            Err(e) => {
                // SAFETY: cname is valid; we created the object above
                unsafe { libc::shm_unlink(cname.as_ptr()) };
                Err(e)
            }
        }
    }

    /// Unlink an existing object whose reader is gone
    fn reclaim(name: &str, cname: &CString) -> Result<()> {
        // SAFETY: cname is a valid NUL-terminated string
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            // Removed by its owner in the meantime
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            return Err(classify("shm_open", name, err));
        }
        // SAFETY: fd was just returned by shm_open
        let stale = unsafe { File::from_raw_fd(fd) };
        if !try_lock(&stale).map_err(|e| CaptureError::os("flock", e))? {
            return Err(duplicate(name));
        }
        tracing::warn!(name, "replacing debug output buffer left by a reader that exited");
        // SAFETY: cname is a valid NUL-terminated string
        unsafe { libc::shm_unlink(cname.as_ptr()) };
        Ok(())
    }

    /// Open a region created by a reader
    pub(super) fn open(name: &str) -> Result<Self> {
        let cname = posix_name(name)?;
        // SAFETY: cname is a valid NUL-terminated string
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(classify("shm_open", name, io::Error::last_os_error()));
        }
        // SAFETY: fd was just returned by shm_open
        let file = unsafe { File::from_raw_fd(fd) };
        let len = file.metadata().map_err(|e| CaptureError::os("fstat", e))?.len();
        if len < DBWIN_BUFFER_SIZE as u64 {
            return Err(CaptureError::NoListener {
                name: name.to_string(),
            });
        }
        // SAFETY: see `create`
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| CaptureError::os("mmap", e))?;
        Ok(Self {
            name: cname,
            map,
            _file: file,
            owner: false,
        })
    }

    pub(super) fn bytes(&self) -> &[u8] {
        &self.map[..DBWIN_BUFFER_SIZE]
    }

    pub(super) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map[..DBWIN_BUFFER_SIZE]
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        if self.owner {
            // SAFETY: name is a valid NUL-terminated string
            unsafe { libc::shm_unlink(self.name.as_ptr()) };
        }
    }
}

/// A named auto-reset event, modelled as a binary POSIX semaphore
pub(super) struct NamedEvent {
    name: CString,
    sem: *mut libc::sem_t,
    owner: bool,
}

// SAFETY: POSIX semaphores may be used concurrently from any thread
unsafe impl Send for NamedEvent {}
unsafe impl Sync for NamedEvent {}

impl NamedEvent {
    /// Create the event in the reset state, replacing any stale one
    pub(super) fn create(name: &str) -> Result<Self> {
        let cname = posix_name(name)?;
        // SAFETY: cname is valid; unlinking a missing semaphore just fails
        unsafe { libc::sem_unlink(cname.as_ptr()) };
        // SAFETY: mode and initial value are passed as the variadic arguments sem_open expects
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                libc::c_uint::from(MODE),
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(classify("sem_open", name, io::Error::last_os_error()));
        }
        Ok(Self {
            name: cname,
            sem,
            owner: true,
        })
    }

    /// Open an event created by a reader
    pub(super) fn open(name: &str) -> Result<Self> {
        let cname = posix_name(name)?;
        // SAFETY: cname is valid; no O_CREAT so no variadic arguments
        let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(classify("sem_open", name, io::Error::last_os_error()));
        }
        Ok(Self {
            name: cname,
            sem,
            owner: false,
        })
    }

    /// Signal the event; signalling an already signalled event has no effect
    pub(super) fn set(&self) -> Result<()> {
        let mut value: libc::c_int = 0;
        // SAFETY: sem is a live semaphore handle for the lifetime of self
        if unsafe { libc::sem_getvalue(self.sem, &mut value) } == 0 && value > 0 {
            return Ok(());
        }
        // SAFETY: as above
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(CaptureError::os("sem_post", io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Wait until signalled or `timeout` elapses; returns true if signalled
    pub(super) fn wait(&self, timeout: Duration) -> Result<bool> {
        // SAFETY: timespec is plain data
        let mut now: libc::timespec = unsafe { std::mem::zeroed() };
        // SAFETY: now is a valid out pointer
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };

        let nanos = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
        // SAFETY: as above
        let mut deadline: libc::timespec = unsafe { std::mem::zeroed() };
        deadline.tv_sec = now.tv_sec + (timeout.as_secs() as i64 + nanos / 1_000_000_000) as libc::time_t;
        deadline.tv_nsec = (nanos % 1_000_000_000) as libc::c_long;

        loop {
            // SAFETY: sem is live and deadline is a valid timespec
            if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(CaptureError::os("sem_timedwait", err)),
            }
        }
    }
}

impl Drop for NamedEvent {
    fn drop(&mut self) {
        // SAFETY: sem was returned by sem_open and is closed exactly once
        unsafe { libc::sem_close(self.sem) };
        if self.owner {
            // SAFETY: name is a valid NUL-terminated string
            unsafe { libc::sem_unlink(self.name.as_ptr()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posix_name_has_single_leading_slash() {
        let name = posix_name("Global\\DBWIN_BUFFER").unwrap();
        assert_eq!(name.to_str().unwrap(), "/Global.DBWIN_BUFFER");
    }

    #[test]
    fn test_live_buffer_is_exclusive() {
        let name = format!("dbgscope_shm_live_{}", std::process::id());
        let first = SharedBuffer::create(&name).unwrap();
        assert!(matches!(
            SharedBuffer::create(&name),
            Err(CaptureError::DuplicateInstance { .. })
        ));
        drop(first);
        SharedBuffer::create(&name).unwrap();
    }

    #[test]
    fn test_buffer_left_by_killed_reader_is_replaced() {
        let name = format!("dbgscope_shm_stale_{}", std::process::id());
        let cname = posix_name(&name).unwrap();
        // What a killed reader leaves behind: the object exists, nobody locks it
        let leftover = shm_create(&cname).unwrap();
        leftover.set_len(DBWIN_BUFFER_SIZE as u64).unwrap();
        drop(leftover);

        let mut reader = SharedBuffer::create(&name).unwrap();
        reader.bytes_mut()[0] = 1;

        let writer = SharedBuffer::open(&name).unwrap();
        assert_eq!(writer.bytes()[0], 1);
    }

    #[test]
    fn test_event_set_is_idempotent() {
        let name = format!("dbgscope_evt_{}", std::process::id());
        let event = NamedEvent::create(&name).unwrap();
        event.set().unwrap();
        event.set().unwrap();
        assert!(event.wait(Duration::from_millis(10)).unwrap());
        assert!(!event.wait(Duration::from_millis(10)).unwrap());
    }
}
