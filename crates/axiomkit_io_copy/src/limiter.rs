//! Counting admission gate shared by every leaf copy of one `copy_tree` call.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::spec::CopyTreeError;

/// Cancellation flag of one task group, chained to the enclosing group.
///
/// A token reads as cancelled when it or any ancestor was cancelled, so a
/// failure cancels its own group and everything below it, while the parent
/// group only stops once the failure has been returned to it.
#[derive(Debug, Default)]
pub(crate) struct CancelToken<'a> {
    b_cancelled: AtomicBool,
    parent: Option<&'a CancelToken<'a>>,
}

impl<'a> CancelToken<'a> {
    pub(crate) fn root() -> Self {
        Self::default()
    }

    pub(crate) fn child(&'a self) -> CancelToken<'a> {
        CancelToken {
            b_cancelled: AtomicBool::new(false),
            parent: Some(self),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        let mut token = Some(self);
        while let Some(v) = token {
            if v.b_cancelled.load(Ordering::SeqCst) {
                return true;
            }
            token = v.parent;
        }
        false
    }
}

/// Bounds how many non-directory copies run at once.
///
/// Waiters block on behalf of a [`CancelToken`]. Cancelling a token through
/// [`AdmissionLimiter::cancel`] wakes every waiter; those whose token chain is
/// now cancelled give up with [`CopyTreeError::Cancelled`].
#[derive(Debug)]
pub(crate) struct AdmissionLimiter {
    n_capacity: usize,
    n_in_use: Mutex<usize>,
    cond_released: Condvar,
}

/// Slot held while one leaf copy runs. Released on drop.
#[derive(Debug)]
pub(crate) struct AdmissionPermit<'a> {
    limiter: &'a AdmissionLimiter,
}

impl AdmissionLimiter {
    pub(crate) fn new(n_capacity: usize) -> Self {
        Self {
            n_capacity: n_capacity.max(1),
            n_in_use: Mutex::new(0),
            cond_released: Condvar::new(),
        }
    }

    /// Block until a slot is free or `token` is cancelled.
    pub(crate) fn acquire(
        &self,
        token: &CancelToken<'_>,
    ) -> Result<AdmissionPermit<'_>, CopyTreeError> {
        let mut n_in_use = self.n_in_use.lock();
        loop {
            if token.is_cancelled() {
                return Err(CopyTreeError::Cancelled);
            }
            if *n_in_use < self.n_capacity {
                *n_in_use += 1;
                return Ok(AdmissionPermit { limiter: self });
            }
            self.cond_released.wait(&mut n_in_use);
        }
    }

    /// Cancel `token` (and so its descendants) and wake all waiters.
    pub(crate) fn cancel(&self, token: &CancelToken<'_>) {
        token.b_cancelled.store(true, Ordering::SeqCst);
        // Taking the lock orders the flag store before any waiter re-checks it.
        let _guard = self.n_in_use.lock();
        self.cond_released.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn in_use(&self) -> usize {
        *self.n_in_use.lock()
    }
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        let mut n_in_use = self.limiter.n_in_use.lock();
        *n_in_use -= 1;
        self.limiter.cond_released.notify_one();
    }
}
