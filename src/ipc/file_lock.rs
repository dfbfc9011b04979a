//! # Global File Lock
//!
//! An advisory `flock` on the `<root>/Lock` sentinel file. Its role in the
//! cache is occupancy detection, not mutual exclusion over data:
//!
//! - At startup, a successful **exclusive** try-acquire proves this is the
//!   only live process using the cache, which licenses destroying and
//!   recreating the shared segment (stale locks from crashed peers and all).
//! - During normal operation every process holds the lock **shared**; the
//!   recovery protocol's exclusive acquisition therefore only succeeds once
//!   every surviving peer has also dropped to the recovery path.
//!
//! `flock` locks are released by the kernel when the holder dies, which is
//! the property the whole recovery design leans on.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeldAs {
    Unlocked,
    Shared,
    Exclusive,
}

/// Advisory lock on a sentinel file, held for the life of this struct.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    held: HeldAs,
}

impl FileLock {
    /// Opens (creating if needed) the sentinel file, unlocked.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open lock file '{}'", path.display()))?;
        Ok(Self {
            file,
            held: HeldAs::Unlocked,
        })
    }

    fn flock(&mut self, op: libc::c_int) -> Result<bool> {
        // SAFETY: flock on an owned, open descriptor.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        if op & libc::LOCK_NB != 0 && err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Ok(false);
        }
        Err(eyre::eyre!("flock failed: {}", err))
    }

    /// Non-blocking exclusive attempt. On success the caller is the sole
    /// process attached to the cache.
    pub fn try_lock_exclusive(&mut self) -> Result<bool> {
        let got = self.flock(libc::LOCK_EX | libc::LOCK_NB)?;
        if got {
            self.held = HeldAs::Exclusive;
        }
        Ok(got)
    }

    /// Blocking exclusive acquisition; used by recovery, where progress is
    /// guaranteed because every peer either died (kernel released its hold)
    /// or also timed out and released.
    pub fn lock_exclusive(&mut self) -> Result<()> {
        self.flock(libc::LOCK_EX)?;
        self.held = HeldAs::Exclusive;
        Ok(())
    }

    /// Blocking shared acquisition (also how an exclusive hold downgrades:
    /// flock conversions are atomic).
    pub fn lock_shared(&mut self) -> Result<()> {
        self.flock(libc::LOCK_SH)?;
        self.held = HeldAs::Shared;
        Ok(())
    }

    pub fn unlock(&mut self) -> Result<()> {
        ensure!(self.held != HeldAs::Unlocked, "unlock without a held lock");
        self.flock(libc::LOCK_UN)?;
        self.held = HeldAs::Unlocked;
        Ok(())
    }

    pub fn is_exclusive(&self) -> bool {
        self.held == HeldAs::Exclusive
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock; nothing explicit needed.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn exclusive_then_downgrade_to_shared() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Lock");

        let mut a = FileLock::open(&path).unwrap();
        assert!(a.try_lock_exclusive().unwrap());
        assert!(a.is_exclusive());

        a.lock_shared().unwrap();
        assert!(!a.is_exclusive());

        // A second handle can now share but not take exclusively.
        let mut b = FileLock::open(&path).unwrap();
        assert!(!b.try_lock_exclusive().unwrap());
        b.lock_shared().unwrap();
    }

    #[test]
    fn dropping_the_handle_releases_the_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Lock");

        {
            let mut a = FileLock::open(&path).unwrap();
            assert!(a.try_lock_exclusive().unwrap());
        }

        let mut b = FileLock::open(&path).unwrap();
        assert!(b.try_lock_exclusive().unwrap());
    }

    #[test]
    fn unlock_without_hold_is_an_error() {
        let dir = tempdir().unwrap();
        let mut a = FileLock::open(&dir.path().join("Lock")).unwrap();
        assert!(a.unlock().is_err());
    }
}
