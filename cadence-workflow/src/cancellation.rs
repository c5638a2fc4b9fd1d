//! Cooperative cancellation scopes.
//!
//! Scopes form a tree. Cancelling a scope is visible to every descendant
//! that is not detached. A detached scope stops propagation from above.
//! Cancellation is only observed at suspension points.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Clone)]
pub struct CancellationScope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    parent: Option<CancellationScope>,
    detached: bool,
    reason: Mutex<Option<String>>,
}

impl CancellationScope {
    pub(crate) fn root() -> Self {
        Self::with_parent(None, false)
    }

    fn with_parent(parent: Option<CancellationScope>, detached: bool) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                parent,
                detached,
                reason: Mutex::new(None),
            }),
        }
    }

    /// New scope cancelled whenever this one is.
    pub fn child(&self) -> Self {
        Self::with_parent(Some(self.clone()), false)
    }

    /// New scope that ignores cancellation of this one.
    pub fn detached_child(&self) -> Self {
        Self::with_parent(Some(self.clone()), true)
    }

    /// Requests cancellation. The first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut current = self.inner.reason.lock();
        if current.is_none() {
            *current = Some(reason.into());
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancellation_reason().is_some()
    }

    /// Reason of the nearest cancelled scope on the non-detached path to the root.
    pub fn cancellation_reason(&self) -> Option<String> {
        if let Some(reason) = self.inner.reason.lock().clone() {
            return Some(reason);
        }
        if self.inner.detached {
            return None;
        }
        self.inner
            .parent
            .as_ref()
            .and_then(CancellationScope::cancellation_reason)
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached
    }
}

impl fmt::Debug for CancellationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationScope")
            .field("detached", &self.inner.detached)
            .field("reason", &*self.inner.reason.lock())
            .finish()
    }
}
