//! # Named Semaphores
//!
//! Thin wrapper over POSIX `sem_open`/`sem_post`/`sem_wait`. The recovery
//! protocol uses two named semaphores as a cross-process handshake that
//! survives the destruction of the shared segment itself, which is exactly
//! the window during which no lock inside the segment can be trusted.

use std::ffi::CString;
use std::time::Duration;

use eyre::{ensure, Result, WrapErr};

/// A process-shared counting semaphore identified by name.
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: CString,
}

// SAFETY: sem_t operations are async-signal-safe and process-shared; the
// raw pointer is only handed to libc functions.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Opens the semaphore, creating it with `initial` if it does not exist.
    pub fn open(name: &str, initial: u32) -> Result<Self> {
        let cname = CString::new(name).wrap_err("semaphore name contains NUL")?;
        // SAFETY: cname is a valid NUL-terminated string; O_CREAT with mode
        // and value is the documented four-argument form.
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT,
                0o644 as libc::c_uint,
                initial,
            )
        };
        ensure!(
            sem != libc::SEM_FAILED,
            "sem_open('{}') failed: {}",
            name,
            std::io::Error::last_os_error()
        );
        Ok(Self { sem, name: cname })
    }

    /// Removes the name from the system and recreates the semaphore at
    /// `initial`. Used when a sole surviving process reinitializes state
    /// that dead peers may have left at an arbitrary count.
    pub fn recreate(name: &str, initial: u32) -> Result<Self> {
        let cname = CString::new(name).wrap_err("semaphore name contains NUL")?;
        // SAFETY: unlink on a name we own; ENOENT is the expected outcome
        // when no previous instance exists.
        unsafe { libc::sem_unlink(cname.as_ptr()) };
        Self::open(name, initial)
    }

    pub fn post(&self) -> Result<()> {
        // SAFETY: self.sem came from a successful sem_open.
        let rc = unsafe { libc::sem_post(self.sem) };
        ensure!(
            rc == 0,
            "sem_post('{}') failed: {}",
            self.name.to_string_lossy(),
            std::io::Error::last_os_error()
        );
        Ok(())
    }

    /// Decrements if the count is positive; returns whether it did.
    pub fn try_wait(&self) -> bool {
        // SAFETY: self.sem came from a successful sem_open.
        unsafe { libc::sem_trywait(self.sem) == 0 }
    }

    /// Blocks until the count is positive or `timeout` expires. Returns
    /// whether the decrement happened.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: clock_gettime writes into the timespec we own.
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
        let mut abs = libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t,
            tv_nsec: now.tv_nsec + timeout.subsec_nanos() as libc::c_long,
        };
        if abs.tv_nsec >= 1_000_000_000 {
            abs.tv_sec += 1;
            abs.tv_nsec -= 1_000_000_000;
        }

        loop {
            // SAFETY: valid semaphore and timespec.
            let rc = unsafe { libc::sem_timedwait(self.sem, &abs) };
            if rc == 0 {
                return Ok(true);
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(false),
                Some(libc::EINTR) => continue,
                other => eyre::bail!(
                    "sem_timedwait('{}') failed: {:?}",
                    self.name.to_string_lossy(),
                    other
                ),
            }
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: closes this process's handle; the name stays registered
        // for peers until explicitly unlinked.
        unsafe { libc::sem_close(self.sem) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/tilecache-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn post_then_try_wait_round_trips() {
        let name = unique_name("roundtrip");
        let sem = NamedSemaphore::recreate(&name, 0).unwrap();

        assert!(!sem.try_wait());
        sem.post().unwrap();
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }

    #[test]
    fn recreate_resets_a_stale_count() {
        let name = unique_name("stale");
        let sem = NamedSemaphore::recreate(&name, 0).unwrap();
        sem.post().unwrap();
        sem.post().unwrap();
        drop(sem);

        let sem = NamedSemaphore::recreate(&name, 0).unwrap();
        assert!(!sem.try_wait());
    }

    #[test]
    fn wait_timeout_expires_and_succeeds() {
        let name = unique_name("timeout");
        let sem = NamedSemaphore::recreate(&name, 0).unwrap();

        assert!(!sem.wait_timeout(Duration::from_millis(30)).unwrap());
        sem.post().unwrap();
        assert!(sem.wait_timeout(Duration::from_millis(30)).unwrap());
    }
}
