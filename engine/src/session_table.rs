use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use keel_types::SessionId;

/// Per-session state behind a short-lived lock.
///
/// Every accessor takes a closure so the guard cannot escape; the lock is
/// never held across an `.await`.
#[derive(Debug)]
pub(crate) struct SessionTable<T> {
    inner: Mutex<HashMap<SessionId, T>>,
}

impl<T> Default for SessionTable<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> SessionTable<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the session's state, if any.
    pub(crate) fn with<R>(&self, session_id: &SessionId, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        f(self.lock().get_mut(session_id))
    }

    pub(crate) fn remove(&self, session_id: &SessionId) -> Option<T> {
        self.lock().remove(session_id)
    }

    pub(crate) fn insert(&self, session_id: SessionId, state: T) -> Option<T> {
        self.lock().insert(session_id, state)
    }

    pub(crate) fn contains(&self, session_id: &SessionId) -> bool {
        self.lock().contains_key(session_id)
    }
}

impl<T: Default> SessionTable<T> {
    /// Run `f` against the session's state, creating it first if needed.
    pub(crate) fn entry<R>(&self, session_id: &SessionId, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        f(guard.entry(session_id.clone()).or_default())
    }
}

impl<T: Clone> SessionTable<T> {
    pub(crate) fn get(&self, session_id: &SessionId) -> Option<T> {
        self.lock().get(session_id).cloned()
    }
}
