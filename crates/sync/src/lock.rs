use crate::error::{ErrorKind, Result};
use crate::guard::LockGuard;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Per-thread hold counters. Only one of the two is ever non-zero.
#[derive(Debug, Default, Clone, Copy)]
struct Hold {
    shared: usize,
    exclusive: usize,
}
impl Hold {
    fn is_empty(&self) -> bool {
        self.shared == 0 && self.exclusive == 0
    }
}

#[derive(Debug, Default)]
struct State {
    /// Shared holds across all threads, reentrant acquisitions included.
    shared: usize,
    /// Reentrancy count of the exclusive owner.
    exclusive: usize,
    owner: Option<ThreadId>,
    holds: HashMap<ThreadId, Hold>,
    /// Threads currently blocked waiting for an exclusive hold. While this is
    /// non-zero, threads without a hold may not start a new shared hold.
    waiting_writers: usize,
}
impl State {
    fn hold(&self, thread: ThreadId) -> Hold {
        self.holds.get(&thread).copied().unwrap_or_default()
    }

    fn can_share(&self) -> bool {
        self.owner.is_none() && self.waiting_writers == 0
    }

    fn can_own(&self) -> bool {
        self.owner.is_none() && self.shared == 0
    }

    fn grant_shared(&mut self, thread: ThreadId) {
        self.shared += 1;
        self.holds.entry(thread).or_default().shared += 1;
    }

    fn grant_exclusive(&mut self, thread: ThreadId) {
        self.owner = Some(thread);
        self.exclusive += 1;
        self.holds.entry(thread).or_default().exclusive += 1;
    }
}

/// Shared/exclusive lock with per-thread reentrancy.
///
/// State machine, per lock: `Unlocked`, `SharedBy{n}` or
/// `ExclusiveBy{owner, n}`. A thread moves between shared and exclusive only
/// by releasing every hold it has first.
///
/// Waiting exclusive acquirers block new readers (writer preference), so a
/// steady stream of readers cannot starve a writer. A thread that already
/// holds the lock shared can always re-enter it, otherwise a waiting writer
/// would deadlock against it.
pub struct ShLock {
    state: Mutex<State>,
    cv: Condvar,
}

impl Default for ShLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_or_recover();
        f.debug_struct("ShLock")
            .field("shared", &state.shared)
            .field("exclusive", &state.exclusive)
            .field("owner", &state.owner)
            .field("waiting_writers", &state.waiting_writers)
            .finish()
    }
}

impl ShLock {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()), cv: Condvar::new() }
    }

    /// Lock the internal state, recovering it if another thread panicked
    /// while holding the mutex. The counters are only ever changed in
    /// single, non-panicking steps so the recovered state is consistent.
    fn lock_or_recover(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }

    fn wait<'a>(&self, state: MutexGuard<'a, State>, deadline: Option<Instant>) -> (MutexGuard<'a, State>, bool) {
        match deadline {
            None => (self.cv.wait(state).unwrap_or_else(|poison| poison.into_inner()), false),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return (state, true);
                }
                let (state, result) =
                    self.cv.wait_timeout(state, remaining).unwrap_or_else(|poison| poison.into_inner());
                (state, result.timed_out())
            },
        }
    }

    /// Acquire the lock in shared (`shared = true`) or exclusive mode.
    ///
    /// Returns `Ok(true)` once the hold is granted. Returns `Ok(false)` when
    /// `blocking` is false and the lock is not immediately available, or when
    /// `timeout` elapses first; in both cases nothing about the lock changed.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::Upgrade`] if the thread holds the lock shared and asks
    ///   for it exclusively.
    /// - [`ErrorKind::Downgrade`] if the thread holds the lock exclusively and
    ///   asks for it shared.
    pub fn acquire(&self, shared: bool, blocking: bool, timeout: Option<Duration>) -> Result<bool> {
        let me = thread::current().id();
        // A timeout too large to represent is no timeout at all.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.lock_or_recover();
        let hold = state.hold(me);
        if shared {
            if hold.exclusive > 0 {
                exn::bail!(ErrorKind::Downgrade);
            }
            if hold.shared > 0 {
                state.grant_shared(me);
                return Ok(true);
            }
            while !state.can_share() {
                if !blocking {
                    return Ok(false);
                }
                let (next, timed_out) = self.wait(state, deadline);
                state = next;
                if timed_out && !state.can_share() {
                    return Ok(false);
                }
            }
            state.grant_shared(me);
            Ok(true)
        } else {
            if hold.shared > 0 {
                exn::bail!(ErrorKind::Upgrade);
            }
            if hold.exclusive > 0 {
                state.grant_exclusive(me);
                return Ok(true);
            }
            if state.can_own() {
                state.grant_exclusive(me);
                return Ok(true);
            }
            if !blocking {
                return Ok(false);
            }
            state.waiting_writers += 1;
            let granted = loop {
                let (next, timed_out) = self.wait(state, deadline);
                state = next;
                if state.can_own() {
                    break true;
                }
                if timed_out {
                    break false;
                }
            };
            state.waiting_writers -= 1;
            if granted {
                state.grant_exclusive(me);
            } else if state.waiting_writers == 0 {
                // Readers may have been held back only by this writer.
                self.cv.notify_all();
            }
            Ok(granted)
        }
    }

    /// Release one hold of whichever mode the calling thread holds.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::NotHeld`] if the calling thread holds nothing.
    pub fn release(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.lock_or_recover();
        let mut hold = state.hold(me);
        let wake = if hold.exclusive > 0 {
            hold.exclusive -= 1;
            state.exclusive -= 1;
            if state.exclusive == 0 {
                state.owner = None;
            }
            state.exclusive == 0
        } else if hold.shared > 0 {
            hold.shared -= 1;
            state.shared -= 1;
            state.shared == 0
        } else {
            exn::bail!(ErrorKind::NotHeld);
        };
        if hold.is_empty() {
            state.holds.remove(&me);
        } else {
            state.holds.insert(me, hold);
        }
        drop(state);
        if wake {
            self.cv.notify_all();
        }
        Ok(())
    }

    /// `true` if the calling thread holds the lock in either mode.
    pub fn owns_lock(&self) -> bool {
        !self.lock_or_recover().hold(thread::current().id()).is_empty()
    }

    /// Number of shared holds currently granted, across all threads.
    pub fn is_shared(&self) -> usize {
        self.lock_or_recover().shared
    }

    /// Reentrancy count of the current exclusive owner (zero if unowned).
    pub fn is_exclusive(&self) -> usize {
        self.lock_or_recover().exclusive
    }

    /// Block until a shared hold is granted, returning a guard that releases
    /// it on drop.
    pub fn read(&self) -> Result<LockGuard<'_>> {
        LockGuard::new(self, true)
    }

    /// Block until an exclusive hold is granted, returning a guard that
    /// releases it on drop.
    pub fn write(&self) -> Result<LockGuard<'_>> {
        LockGuard::new(self, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    fn assert_released(lock: &ShLock) {
        assert_eq!(lock.is_shared(), 0);
        assert_eq!(lock.is_exclusive(), 0);
        assert!(!lock.owns_lock());
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn test_reentrancy(#[case] shared: bool) {
        let lock = ShLock::new();
        for _ in 0..5 {
            assert!(lock.acquire(shared, true, None).unwrap());
            assert!(lock.owns_lock());
        }
        if shared {
            assert_eq!(lock.is_shared(), 5);
        } else {
            assert_eq!(lock.is_exclusive(), 5);
        }
        for _ in 0..5 {
            assert!(lock.owns_lock());
            lock.release().unwrap();
        }
        assert_released(&lock);
    }

    #[test]
    fn test_upgrade_is_forbidden() {
        let lock = ShLock::new();
        lock.acquire(true, true, None).unwrap();
        let err = lock.acquire(false, true, None).unwrap_err();
        assert_eq!(*err, ErrorKind::Upgrade);
        assert_eq!(lock.is_shared(), 1);
        assert_eq!(lock.is_exclusive(), 0);
        assert!(lock.owns_lock());
        lock.release().unwrap();
        assert_released(&lock);
    }

    #[test]
    fn test_downgrade_is_forbidden() {
        let lock = ShLock::new();
        lock.acquire(false, true, None).unwrap();
        let err = lock.acquire(true, false, None).unwrap_err();
        assert_eq!(*err, ErrorKind::Downgrade);
        assert_eq!(lock.is_shared(), 0);
        assert_eq!(lock.is_exclusive(), 1);
        lock.release().unwrap();
        assert_released(&lock);
    }

    #[test]
    fn test_release_without_acquire() {
        let lock = ShLock::new();
        let err = lock.release().unwrap_err();
        assert_eq!(*err, ErrorKind::NotHeld);
        assert_released(&lock);
    }

    #[test]
    fn test_release_from_other_thread_is_not_held() {
        let lock = Arc::new(ShLock::new());
        lock.acquire(true, true, None).unwrap();
        let other = Arc::clone(&lock);
        let result = thread::spawn(move || other.release().map_err(|e| *e)).join().unwrap();
        assert_eq!(result, Err(ErrorKind::NotHeld));
        assert_eq!(lock.is_shared(), 1);
        lock.release().unwrap();
    }

    #[test]
    fn test_owns_lock_is_per_thread() {
        let lock = Arc::new(ShLock::new());
        lock.acquire(true, true, None).unwrap();
        let other = Arc::clone(&lock);
        assert!(!thread::spawn(move || other.owns_lock()).join().unwrap());
        assert!(lock.owns_lock());
        lock.release().unwrap();
    }

    #[test]
    fn test_shared_holds_coexist() {
        let lock = Arc::new(ShLock::new());
        lock.acquire(true, true, None).unwrap();
        let other = Arc::clone(&lock);
        let acquired = thread::spawn(move || {
            let acquired = other.acquire(true, false, None).unwrap();
            other.release().unwrap();
            acquired
        })
        .join()
        .unwrap();
        assert!(acquired);
        lock.release().unwrap();
        assert_released(&lock);
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn test_non_blocking_exclusive_fails_fast(#[case] other_shared: bool) {
        let lock = Arc::new(ShLock::new());
        let (held_tx, held_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let holder = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.acquire(other_shared, true, None).unwrap();
                held_tx.send(()).unwrap();
                done_rx.recv().unwrap();
                lock.release().unwrap();
            })
        };
        held_rx.recv().unwrap();
        let started = Instant::now();
        assert!(!lock.acquire(false, false, None).unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!lock.owns_lock());
        done_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(lock.acquire(false, false, None).unwrap());
        assert!(lock.owns_lock());
        lock.release().unwrap();
        assert_released(&lock);
    }

    #[test]
    fn test_timeout_leaves_state_unchanged() {
        let lock = Arc::new(ShLock::new());
        let (held_tx, held_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let holder = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.acquire(false, true, None).unwrap();
                held_tx.send(()).unwrap();
                done_rx.recv().unwrap();
                lock.release().unwrap();
            })
        };
        held_rx.recv().unwrap();
        assert!(!lock.acquire(true, true, Some(Duration::from_millis(50))).unwrap());
        assert!(!lock.acquire(false, true, Some(Duration::from_millis(50))).unwrap());
        assert!(!lock.owns_lock());
        assert_eq!(lock.is_exclusive(), 1);
        done_tx.send(()).unwrap();
        holder.join().unwrap();
        assert_released(&lock);
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn test_huge_timeout_blocks_until_granted(#[case] shared: bool) {
        let lock = Arc::new(ShLock::new());
        assert!(lock.acquire(shared, true, Some(Duration::MAX)).unwrap());
        lock.release().unwrap();

        let (held_tx, held_rx) = mpsc::channel();
        let holder = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.acquire(false, true, None).unwrap();
                held_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                lock.release().unwrap();
            })
        };
        held_rx.recv().unwrap();
        assert!(lock.acquire(shared, true, Some(Duration::MAX)).unwrap());
        assert!(lock.owns_lock());
        lock.release().unwrap();
        holder.join().unwrap();
        assert_released(&lock);
    }

    #[test]
    fn test_exclusive_waits_for_shared_holder() {
        let lock = Arc::new(ShLock::new());
        let released = Arc::new(AtomicBool::new(false));
        let (held_tx, held_rx) = mpsc::channel();
        let reader = {
            let lock = Arc::clone(&lock);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                lock.acquire(true, true, None).unwrap();
                held_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(200));
                released.store(true, Ordering::SeqCst);
                lock.release().unwrap();
            })
        };
        held_rx.recv().unwrap();
        assert!(lock.acquire(false, true, None).unwrap());
        assert!(released.load(Ordering::SeqCst), "exclusive hold granted while a reader was active");
        lock.release().unwrap();
        reader.join().unwrap();
        assert_released(&lock);
    }

    #[test]
    fn test_waiting_writer_blocks_new_readers() {
        let lock = Arc::new(ShLock::new());
        lock.acquire(true, true, None).unwrap();
        let writer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.acquire(false, true, None).unwrap();
                lock.release().unwrap();
            })
        };
        while lock.lock_or_recover().waiting_writers == 0 {
            thread::yield_now();
        }
        let other = Arc::clone(&lock);
        assert!(!thread::spawn(move || other.acquire(true, false, None).unwrap()).join().unwrap());
        // Re-entering an existing shared hold must still succeed.
        assert!(lock.acquire(true, false, None).unwrap());
        lock.release().unwrap();
        lock.release().unwrap();
        writer.join().unwrap();
        assert_released(&lock);
    }

    /// Marsaglia xorshift; enough to shuffle lock modes without a dependency.
    struct XorShift(u64);
    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }
    }

    #[test]
    fn test_stress_nested_acquisitions() {
        let lock = Arc::new(ShLock::new());
        let threads = (0..10u64)
            .map(|n| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    let mut rng = XorShift(0x9E37_79B9_7F4A_7C15 ^ (n + 1));
                    for _ in 0..1000 {
                        let shared = rng.next() % 2 == 0;
                        let depth = 1 + (rng.next() % 4) as usize;
                        for _ in 0..depth {
                            assert!(lock.acquire(shared, true, None).unwrap());
                        }
                        if rng.next() % 8 == 0 {
                            let err = lock.acquire(!shared, true, None).unwrap_err();
                            let expected = if shared { ErrorKind::Upgrade } else { ErrorKind::Downgrade };
                            assert_eq!(*err, expected);
                        }
                        for _ in 0..depth {
                            lock.release().unwrap();
                        }
                        assert!(!lock.owns_lock());
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in threads {
            handle.join().unwrap();
        }
        assert_released(&lock);
    }
}
