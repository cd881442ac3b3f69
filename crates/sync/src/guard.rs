use crate::ShLock;
use crate::error::Result;
use std::marker::PhantomData;
use std::time::Duration;

/// Scoped hold on a [`ShLock`]: acquired on construction, released on drop.
///
/// Holds are tracked per thread, so the guard is deliberately `!Send`; it
/// must be dropped on the thread that created it.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a ShLock,
    shared: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'a> LockGuard<'a> {
    /// Block until the lock is held in the requested mode.
    pub fn new(lock: &'a ShLock, shared: bool) -> Result<Self> {
        lock.acquire(shared, true, None)?;
        Ok(Self { lock, shared, _not_send: PhantomData })
    }

    /// Like [`LockGuard::new`], but gives up after `timeout` and returns
    /// `None` with the lock untouched.
    pub fn try_new(lock: &'a ShLock, shared: bool, timeout: Duration) -> Result<Option<Self>> {
        Ok(lock
            .acquire(shared, true, Some(timeout))?
            .then(|| Self { lock, shared, _not_send: PhantomData }))
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release() {
            tracing::error!(error = ?err, shared = self.shared, "Lock guard dropped without a matching hold");
        }
    }
}
