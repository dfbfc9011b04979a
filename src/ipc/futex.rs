//! # Futex Wait/Wake Primitives
//!
//! The interprocess locks and the mapping-coordination words all live inside
//! shared memory segments, so blocking must go through a kernel queue keyed
//! by physical address: the Linux `futex` syscall. Crucially these are
//! *shared* futexes (no `FUTEX_PRIVATE_FLAG`), because waiters and wakers
//! are different processes mapping the same pages.
//!
//! Every wait takes a deadline. An expired deadline is how a dead peer is
//! detected: a lock word that never changes because its holder was killed
//! will time out here, and the caller escalates to the abandonment recovery
//! protocol.

use std::sync::atomic::AtomicU32;
use std::time::{Duration, Instant};

/// Outcome of a single [`wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by a [`wake`] call (or spuriously; callers must re-check).
    Woken,
    /// The word no longer held the expected value when the kernel compared.
    ValueChanged,
    /// The timeout expired before a wake arrived.
    TimedOut,
}

/// Blocks until `word` is woken, changes away from `expected`, or the
/// timeout expires. `None` means wait forever.
///
/// Spurious wakeups are possible; callers loop around a predicate.
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        let ts;
        let ts_ptr = match deadline {
            None => std::ptr::null::<libc::timespec>(),
            Some(d) => {
                let remaining = d.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return WaitOutcome::TimedOut;
                }
                ts = libc::timespec {
                    tv_sec: remaining.as_secs() as libc::time_t,
                    tv_nsec: remaining.subsec_nanos() as libc::c_long,
                };
                &ts
            }
        };

        // SAFETY: FUTEX_WAIT only reads the word and sleeps; the pointer is
        // valid for the duration of the call because `word` borrows the
        // mapping, and the timespec (when present) outlives the syscall.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT,
                expected,
                ts_ptr,
            )
        };

        if rc == 0 {
            return WaitOutcome::Woken;
        }

        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EAGAIN) => return WaitOutcome::ValueChanged,
            Some(libc::ETIMEDOUT) => return WaitOutcome::TimedOut,
            // Interrupted by a signal: recompute the remaining time and retry.
            Some(libc::EINTR) => continue,
            other => {
                debug_assert!(false, "unexpected futex error: {:?}", other);
                return WaitOutcome::Woken;
            }
        }
    }
}

/// Wakes up to `count` waiters blocked on `word`. Returns the number woken.
pub fn wake(word: &AtomicU32, count: i32) -> i32 {
    // SAFETY: FUTEX_WAKE does not dereference beyond the word itself.
    let rc = unsafe { libc::syscall(libc::SYS_futex, word.as_ptr(), libc::FUTEX_WAKE, count) };
    rc.max(0) as i32
}

/// Wakes every waiter blocked on `word`.
pub fn wake_all(word: &AtomicU32) {
    wake(word, i32::MAX);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    #[test]
    fn wait_returns_value_changed_when_word_differs() {
        let word = AtomicU32::new(5);
        let outcome = wait(&word, 4, Some(Duration::from_millis(50)));
        assert_eq!(outcome, WaitOutcome::ValueChanged);
    }

    #[test]
    fn wait_times_out_when_nobody_wakes() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        let outcome = wait(&word, 0, Some(Duration::from_millis(30)));
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn wake_unblocks_a_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = Arc::clone(&word);
            std::thread::spawn(move || wait(&word, 0, Some(Duration::from_secs(5))))
        };

        // Give the waiter a moment to enter the kernel queue.
        std::thread::sleep(Duration::from_millis(50));
        word.store(1, Ordering::Release);
        wake_all(&word);

        let outcome = waiter.join().unwrap();
        assert_ne!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn zero_timeout_reports_timed_out() {
        let word = AtomicU32::new(0);
        assert_eq!(
            wait(&word, 0, Some(Duration::ZERO)),
            WaitOutcome::TimedOut
        );
    }
}
