//! # Exceptional Cache Signals
//!
//! Most fallible cache operations return `eyre::Result` with contextual
//! messages, following the storage layer's conventions. Two conditions are
//! different: they must unwind through many frames (lock guards, remap
//! loops, the locker state machine) and be recognized at the public API
//! boundary, where they trigger the shared-memory recovery procedure and a
//! full cache wipe.
//!
//! - [`AbandonedLock`]: a timed interprocess lock acquisition exceeded its
//!   timeout. The only plausible explanation is that a peer process died
//!   while holding the lock, leaving it locked forever.
//! - [`CorruptedCache`]: a shard was found mid-mutation (its state sentinel
//!   read `InProgress` on entry to an operation), meaning a peer died between
//!   flipping the sentinel and restoring it.
//!
//! Both are plain marker types implementing `std::error::Error` so they
//! travel inside `eyre::Report` and are recovered with `downcast_ref` at the
//! boundary, the Rust equivalent of the original exception-based design.

use std::fmt;

/// A timed interprocess lock exceeded its timeout, indicating the holder
/// process died. Handled at the public API boundary by the recovery
/// protocol followed by a cache wipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbandonedLock {
    /// Timeout that expired, in milliseconds.
    pub timeout_ms: u64,
}

impl fmt::Display for AbandonedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "interprocess lock abandoned: acquisition timed out after {} ms",
            self.timeout_ms
        )
    }
}

impl std::error::Error for AbandonedLock {}

/// A shard's state sentinel read `InProgress` on entry to a mutating
/// operation: a peer died mid-mutation and the shard contents cannot be
/// trusted. Same boundary treatment as [`AbandonedLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorruptedCache {
    /// Index of the shard found inconsistent.
    pub shard: usize,
}

impl fmt::Display for CorruptedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cache shard {:02x} found mid-mutation, contents untrusted",
            self.shard
        )
    }
}

impl std::error::Error for CorruptedCache {}

/// External cancellation observed between wait polls. Propagates to the
/// caller unchanged; it neither wipes nor recovers anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aborted;

impl fmt::Display for Aborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache wait aborted by caller")
    }
}

impl std::error::Error for Aborted {}

/// True if `err` carries either recovery-triggering signal.
pub(crate) fn is_recovery_signal(err: &eyre::Report) -> bool {
    err.downcast_ref::<AbandonedLock>().is_some() || err.downcast_ref::<CorruptedCache>().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abandoned_lock_survives_eyre_wrapping() {
        let report = eyre::Report::new(AbandonedLock { timeout_ms: 10_000 })
            .wrap_err("acquiring shard lock for bucket 0x3f");

        assert!(is_recovery_signal(&report));
        assert_eq!(
            report.downcast_ref::<AbandonedLock>().unwrap().timeout_ms,
            10_000
        );
    }

    #[test]
    fn corrupted_cache_survives_eyre_wrapping() {
        let report =
            eyre::Report::new(CorruptedCache { shard: 7 }).wrap_err("entering mutating operation");

        assert!(is_recovery_signal(&report));
    }

    #[test]
    fn ordinary_errors_are_not_recovery_signals() {
        let report = eyre::eyre!("disk full");
        assert!(!is_recovery_signal(&report));
    }
}
