use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::Error;

#[derive(Debug, Clone)]
enum Outcome<T> {
    Pending,
    Resolved(T),
    Rejected(Error),
    Cancelled(String),
}

struct Inner<T> {
    outcome: std::sync::Mutex<Outcome<T>>,
    notify: Notify,
}

/// A settle-once, observe-many future, modeled on
/// `original_source/deriv_api/easy_future.py` and `custom_future.py`.
///
/// Unlike a plain `tokio::sync::oneshot`, a `DeferredFuture` can be
/// `wait()`-ed on from more than one task (needed because `cascade`/`then`
/// chain off the same settlement), and exposes its current state
/// synchronously via `is_pending`/`is_resolved`/etc., mirroring the
/// original's `done()`/`cancelled()` introspection.
pub struct DeferredFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DeferredFuture<T> {
    fn clone(&self) -> Self {
        DeferredFuture { inner: self.inner.clone() }
    }
}

impl<T: Clone + Send + Sync + 'static> DeferredFuture<T> {
    pub fn new() -> Self {
        DeferredFuture {
            inner: Arc::new(Inner { outcome: std::sync::Mutex::new(Outcome::Pending), notify: Notify::new() }),
        }
    }

    /// A `DeferredFuture` already settled with `value`.
    pub fn resolved(value: T) -> Self {
        let fut = Self::new();
        let _ = fut.resolve(value);
        fut
    }

    /// Produces a new `DeferredFuture` shadowing `other`: it mirrors
    /// `other`'s eventual outcome, and cancelling the wrapper propagates
    /// back and cancels `other` too (spec §4.3/§5). Grounded on
    /// `original_source/deriv_api/easy_future.py`'s `EasyFuture.wrap`.
    pub fn wrap(other: DeferredFuture<T>) -> Self {
        let wrapper = Self::new();
        let _ = wrapper.adopt(other);
        wrapper
    }

    fn settle(&self, outcome: Outcome<T>) -> Result<(), Error> {
        let mut guard = self.inner.outcome.lock().unwrap();
        if !matches!(*guard, Outcome::Pending) {
            return Err(Error::Api("future already settled".into()));
        }
        *guard = outcome;
        drop(guard);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    pub fn resolve(&self, value: T) -> Result<(), Error> {
        self.settle(Outcome::Resolved(value))
    }

    pub fn reject(&self, err: Error) -> Result<(), Error> {
        self.settle(Outcome::Rejected(err))
    }

    pub fn cancel(&self, reason: impl Into<String>) -> Result<(), Error> {
        self.settle(Outcome::Cancelled(reason.into()))
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.inner.outcome.lock().unwrap(), Outcome::Pending)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(*self.inner.outcome.lock().unwrap(), Outcome::Resolved(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(*self.inner.outcome.lock().unwrap(), Outcome::Rejected(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.inner.outcome.lock().unwrap(), Outcome::Cancelled(_))
    }

    /// Waits for settlement and returns the outcome as a `Result`.
    /// Cancellation surfaces as `Error::Cancelled`.
    pub async fn wait(&self) -> Result<T, Error> {
        loop {
            {
                let guard = self.inner.outcome.lock().unwrap();
                match &*guard {
                    Outcome::Pending => {}
                    Outcome::Resolved(v) => return Ok(v.clone()),
                    Outcome::Rejected(e) => return Err(e.clone()),
                    Outcome::Cancelled(reason) => return Err(Error::Cancelled(reason.clone())),
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Copies `other`'s eventual outcome into `self` (spec §4.3). `self`
    /// must not already be settled — settling twice is the same invalid
    /// state `original_source/deriv_api/easy_future.py`'s `cascade` raises
    /// `InvalidStateError` for.
    pub fn cascade(&self, other: DeferredFuture<T>) -> Result<(), Error> {
        {
            let guard = self.inner.outcome.lock().unwrap();
            if !matches!(*guard, Outcome::Pending) {
                return Err(Error::Api("invalid state".into()));
            }
        }
        let target = self.clone();
        tokio::spawn(async move {
            match other.wait().await {
                Ok(v) => {
                    let _ = target.resolve(v);
                }
                Err(Error::Cancelled(reason)) => {
                    let _ = target.cancel(reason);
                }
                Err(e) => {
                    let _ = target.reject(e);
                }
            }
        });
        Ok(())
    }

    /// Like [`Self::cascade`], but also watches `self` for a *direct*
    /// cancellation (one not itself caused by `other` settling) and
    /// forwards it back onto `other` — the reverse-propagation half of
    /// [`Self::wrap`] and [`Self::then2`]. `self` must still be pending.
    fn adopt(&self, other: DeferredFuture<T>) -> Result<(), Error> {
        self.cascade(other.clone())?;
        let watcher = self.clone();
        tokio::spawn(async move {
            if let Err(Error::Cancelled(reason)) = watcher.wait().await {
                if other.is_pending() {
                    let _ = other.cancel(reason);
                }
            }
        });
        Ok(())
    }

    /// `then(onOk, onErr)` (spec §4.3): monadic bind. Exactly one of
    /// `on_ok`/`on_err` runs — `on_ok` on a resolved value, `on_err` on a
    /// rejection — and must itself return a `DeferredFuture<U>`; the
    /// result mirrors whatever that future settles with, and cancelling
    /// the result propagates back upstream into it (via
    /// [`Self::adopt`]). A cancelled `self` short-circuits both callbacks
    /// and cancels the result with the fixed reason `"Upstream future
    /// cancelled"`, regardless of why `self` itself was cancelled.
    /// Grounded on `original_source/deriv_api/easy_future.py:76-109`.
    pub fn then2<U, OnOk, OnErr>(&self, on_ok: OnOk, on_err: OnErr) -> DeferredFuture<U>
    where
        U: Clone + Send + Sync + 'static,
        OnOk: FnOnce(T) -> DeferredFuture<U> + Send + 'static,
        OnErr: FnOnce(Error) -> DeferredFuture<U> + Send + 'static,
    {
        let result = DeferredFuture::new();
        let source = self.clone();
        let out = result.clone();
        tokio::spawn(async move {
            match source.wait().await {
                Err(Error::Cancelled(_)) => {
                    let _ = out.cancel("Upstream future cancelled");
                }
                Ok(v) => {
                    let _ = out.adopt(on_ok(v));
                }
                Err(e) => {
                    let _ = out.adopt(on_err(e));
                }
            }
        });
        result
    }

    /// `then(onOk)` with no `onErr`: a rejection of `self` passes through
    /// to the result unchanged (spec §4.3's `then(onOk, None)`).
    pub fn then<U, OnOk>(&self, on_ok: OnOk) -> DeferredFuture<U>
    where
        U: Clone + Send + Sync + 'static,
        OnOk: FnOnce(T) -> DeferredFuture<U> + Send + 'static,
    {
        self.then2(on_ok, |e| {
            let passthrough = DeferredFuture::new();
            let _ = passthrough.reject(e);
            passthrough
        })
    }

    /// `catch(onErr)` (spec §4.3): `then(None, onErr)` — recovers a
    /// rejection through `on_err`; a resolved `self` passes through
    /// unchanged.
    pub fn catch<OnErr>(&self, on_err: OnErr) -> DeferredFuture<T>
    where
        OnErr: FnOnce(Error) -> DeferredFuture<T> + Send + 'static,
    {
        self.then2(DeferredFuture::resolved, on_err)
    }
}

impl<T: Clone + Send + Sync + 'static> Default for DeferredFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_once() {
        let fut = DeferredFuture::new();
        assert!(fut.is_pending());
        fut.resolve(1).unwrap();
        assert!(fut.resolve(2).is_err());
        assert_eq!(fut.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn multiple_waiters_observe_same_outcome() {
        let fut: DeferredFuture<i32> = DeferredFuture::new();
        let a = fut.clone();
        let b = fut.clone();
        let ta = tokio::spawn(async move { a.wait().await });
        let tb = tokio::spawn(async move { b.wait().await });
        fut.resolve(7).unwrap();
        assert_eq!(ta.await.unwrap().unwrap(), 7);
        assert_eq!(tb.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn cancellation_surfaces_as_cancelled_error() {
        let fut: DeferredFuture<i32> = DeferredFuture::new();
        fut.cancel("shutting down").unwrap();
        assert!(fut.is_cancelled());
        match fut.wait().await {
            Err(Error::Cancelled(reason)) => assert_eq!(reason, "shutting down"),
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cascade_copies_others_outcome_into_self() {
        let source: DeferredFuture<i32> = DeferredFuture::new();
        let target: DeferredFuture<i32> = DeferredFuture::new();
        target.cascade(source.clone()).unwrap();
        source.resolve(9).unwrap();
        assert_eq!(target.wait().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn cascade_errs_if_self_already_settled() {
        let source: DeferredFuture<i32> = DeferredFuture::new();
        let target = DeferredFuture::resolved(1);
        assert!(target.cascade(source).is_err());
    }

    #[tokio::test]
    async fn wrap_mirrors_the_wrapped_futures_outcome() {
        let other: DeferredFuture<i32> = DeferredFuture::new();
        let wrapper = DeferredFuture::wrap(other.clone());
        other.resolve(3).unwrap();
        assert_eq!(wrapper.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn wrap_propagates_a_direct_cancellation_upstream() {
        let other: DeferredFuture<i32> = DeferredFuture::new();
        let wrapper = DeferredFuture::wrap(other.clone());
        wrapper.cancel("caller gave up").unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(other.is_cancelled());
    }

    #[tokio::test]
    async fn then_binds_to_the_future_returned_by_on_ok() {
        let source: DeferredFuture<i32> = DeferredFuture::new();
        let mapped = source.then(|v| DeferredFuture::resolved(v * 2));
        source.resolve(5).unwrap();
        assert_eq!(mapped.wait().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn then_cancellation_uses_the_fixed_upstream_reason() {
        let source: DeferredFuture<i32> = DeferredFuture::new();
        let mapped = source.then(DeferredFuture::resolved);
        source.cancel("some local reason").unwrap();
        match mapped.wait().await {
            Err(Error::Cancelled(reason)) => assert_eq!(reason, "Upstream future cancelled"),
            other => panic!("expected Cancelled(\"Upstream future cancelled\"), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn catch_recovers_rejection() {
        let source: DeferredFuture<i32> = DeferredFuture::new();
        let recovered = source.catch(|_| DeferredFuture::resolved(-1));
        source.reject(Error::Api("boom".into())).unwrap();
        assert_eq!(recovered.wait().await.unwrap(), -1);
    }

    #[tokio::test]
    async fn catch_passes_through_a_resolved_value_unchanged() {
        let source: DeferredFuture<i32> = DeferredFuture::new();
        let recovered = source.catch(|_| DeferredFuture::resolved(-1));
        source.resolve(42).unwrap();
        assert_eq!(recovered.wait().await.unwrap(), 42);
    }
}
