//! Snapshot-on-read listener lists.
//!
//! Owners push notifications by taking a [`ListenerList::snapshot`] while
//! holding their own lock and invoking it after releasing that lock, so a
//! listener may call back into its owner.

use std::sync::Arc;

use parking_lot::Mutex;

pub(crate) struct ListenerList<L: ?Sized> {
    inner: Mutex<Vec<Arc<L>>>,
}

impl<L: ?Sized> Default for ListenerList<L> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }
}

impl<L: ?Sized> ListenerList<L> {
    pub(crate) fn add(&self, listener: Arc<L>) {
        self.inner.lock().push(listener);
    }

    /// Remove `listener` by identity.  Returns `false` if it was not present.
    pub(crate) fn remove(&self, listener: &Arc<L>) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|l| !Arc::ptr_eq(l, listener));
        inner.len() != before
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        self.inner.lock().clone()
    }
}
