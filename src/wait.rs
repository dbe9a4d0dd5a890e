use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Creates a single-shot signal pair.
///
/// The [`Promise`] side blocks an application thread; the
/// [`PromiseResolver`] side is triggered from the I/O thread. The first
/// resolution wins, later ones are dropped.
pub(crate) fn promise<T>() -> (Promise<T>, PromiseResolver<T>) {
    let inner = Arc::new(Inner {
        slot: Mutex::new(None),
        cond: Condvar::new(),
    });
    (
        Promise {
            inner: inner.clone(),
        },
        PromiseResolver { inner },
    )
}

struct Inner<T> {
    slot: Mutex<Option<Result<T>>>,
    cond: Condvar,
}

pub(crate) struct Promise<T> {
    inner: Arc<Inner<T>>,
}

pub(crate) struct PromiseResolver<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for PromiseResolver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Promise<T> {
    pub(crate) fn wait(self) -> Result<T> {
        let mut slot = self.inner.slot.lock();
        while slot.is_none() {
            self.inner.cond.wait(&mut slot);
        }
        slot.take().expect("resolved promise")
    }

    /// Waits with an optional deadline. `None` blocks until resolution.
    pub(crate) fn wait_timeout(self, timeout: Option<Duration>) -> Result<T> {
        let timeout = match timeout {
            Some(timeout) => timeout,
            None => return self.wait(),
        };
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.slot.lock();
        while slot.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::RpcTimeout);
            }
            self.inner.cond.wait_for(&mut slot, deadline - now);
        }
        slot.take().expect("resolved promise")
    }
}

impl<T> PromiseResolver<T> {
    pub(crate) fn resolve(&self, res: Result<T>) {
        let mut slot = self.inner.slot.lock();
        if slot.is_none() {
            *slot = Some(res);
            self.inner.cond.notify_one();
        }
    }
}

impl<T> std::fmt::Debug for PromiseResolver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromiseResolver").finish()
    }
}
