use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::mpsc;

use crate::deferred::DeferredFuture;
use crate::error::Error;

/// One item flowing through a [`MulticastChannel`].
#[derive(Debug, Clone)]
pub enum Emission<T> {
    Next(T),
    Error(Error),
    Complete,
}

struct Inner<T> {
    subscribers: HashMap<u64, mpsc::UnboundedSender<Emission<T>>>,
    next_id: u64,
    stopped: bool,
    disposed: bool,
    /// Count of subscribers that represent a genuine external consumer, as
    /// opposed to library-internal watchers (`first()`, the subscription
    /// response watcher in `connection::manager`). Only this count drives
    /// `on_finally` — an internal watcher observing the first emission must
    /// not itself look like "the last consumer just left".
    real_subscribers: usize,
    on_finally: Option<Box<dyn FnMut() + Send>>,
}

impl<T> Default for Inner<T> {
    fn default() -> Self {
        Inner { subscribers: HashMap::new(), next_id: 0, stopped: false, disposed: false, real_subscribers: 0, on_finally: None }
    }
}

/// A hot, multi-consumer channel that fans out values to every subscriber.
///
/// Plays the role of both the "orig" upstream channel and the "shared"
/// ref-counted fan-out spec §4.4/§4.6 describe as two separate rx
/// operators: because this implementation already multicasts to every
/// subscriber and runs `on_finally` exactly when the subscriber count
/// returns to zero, there is no need for a distinct `share()` wrapper —
/// [`crate::connection::subscription::SubscriptionState`] simply stores the
/// same handle in both its `sources` and `orig_sources` maps, preserving
/// the invariant that a fingerprint is in one iff it is in the other.
#[derive(Clone)]
pub struct MulticastChannel<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Default for MulticastChannel<T> {
    fn default() -> Self {
        MulticastChannel { inner: Arc::new(Mutex::new(Inner::default())) }
    }
}

impl<T: Clone + Send + 'static> MulticastChannel<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Like [`Self::new`], but runs `on_finally` once when the subscriber
    /// count transitions from >=1 back to 0 (the "finalise-on-zero" hook
    /// from spec §9, used by the subscription manager's `forget_old_source`).
    pub fn with_on_finally(on_finally: impl FnMut() + Send + 'static) -> Self {
        let mut inner = Inner::default();
        inner.on_finally = Some(Box::new(on_finally));
        MulticastChannel { inner: Arc::new(Mutex::new(inner)) }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().unwrap().stopped
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().unwrap().disposed
    }

    fn broadcast(&self, emission: Emission<T>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            return;
        }
        let terminal = matches!(emission, Emission::Error(_) | Emission::Complete);
        inner.subscribers.retain(|_, tx| tx.send(emission.clone()).is_ok());
        if terminal {
            inner.stopped = true;
        }
    }

    pub fn next(&self, value: T) {
        self.broadcast(Emission::Next(value));
    }

    pub fn error(&self, err: Error) {
        self.broadcast(Emission::Error(err));
    }

    pub fn complete(&self) {
        self.broadcast(Emission::Complete);
    }

    /// Marks the channel disposed. Idempotent. Disposal does not itself
    /// notify subscribers — callers `complete()`/`error()` first.
    pub fn dispose(&self) {
        self.inner.lock().unwrap().disposed = true;
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.subscribers.insert(id, tx);
            inner.real_subscribers += 1;
            id
        };
        Subscription { id, rx, channel: self.clone(), internal: false }
    }

    /// Like [`Self::subscribe`], but does not count toward `on_finally`'s
    /// "last consumer left" refcount. For library-internal observers that
    /// watch a channel without being an application-level consumer of it.
    pub(crate) fn watch(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.subscribers.insert(id, tx);
            id
        };
        Subscription { id, rx, channel: self.clone(), internal: true }
    }

    /// A future that resolves with the first `Next` emission, rejects on
    /// `Error`, and rejects with a cancellation-shaped error on `Complete`
    /// without ever having emitted a value. Used by `send()` (spec §4.5)
    /// and by the subscription response watcher (spec §4.6).
    pub fn first(&self) -> DeferredFuture<T> {
        let deferred = DeferredFuture::new();
        let mut sub = self.watch();
        let out = deferred.clone();
        tokio::spawn(async move {
            match sub.next_emission().await {
                Some(Emission::Next(v)) => {
                    let _ = out.resolve(v);
                }
                Some(Emission::Error(e)) => {
                    let _ = out.reject(e);
                }
                Some(Emission::Complete) | None => {
                    let _ = out.cancel("source completed without a value");
                }
            }
        });
        deferred
    }
}

/// A live registration on a [`MulticastChannel`]. Implements [`Stream`];
/// dropping it unsubscribes and, if it was the last subscriber, fires the
/// channel's `on_finally` hook.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<Emission<T>>,
    channel: MulticastChannel<T>,
    internal: bool,
}

impl<T> Subscription<T> {
    pub async fn next_emission(&mut self) -> Option<Emission<T>> {
        self.rx.recv().await
    }
}

impl<T> Stream for Subscription<T> {
    type Item = Emission<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_recv(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let mut inner = self.channel.inner.lock().unwrap();
        inner.subscribers.remove(&self.id);
        if self.internal {
            return;
        }
        inner.real_subscribers = inner.real_subscribers.saturating_sub(1);
        if inner.real_subscribers == 0 {
            if let Some(cb) = inner.on_finally.as_mut() {
                cb();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fans_out_to_every_subscriber() {
        let ch: MulticastChannel<i32> = MulticastChannel::new();
        let mut a = ch.subscribe();
        let mut b = ch.subscribe();
        ch.next(1);
        ch.next(2);
        assert!(matches!(a.next_emission().await, Some(Emission::Next(1))));
        assert!(matches!(a.next_emission().await, Some(Emission::Next(2))));
        assert!(matches!(b.next_emission().await, Some(Emission::Next(1))));
        assert!(matches!(b.next_emission().await, Some(Emission::Next(2))));
    }

    #[tokio::test]
    async fn on_finally_fires_on_zero_transition() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let ch: MulticastChannel<i32> = MulticastChannel::with_on_finally(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        let a = ch.subscribe();
        let b = ch.subscribe();
        drop(a);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn complete_stops_further_emissions() {
        let ch: MulticastChannel<i32> = MulticastChannel::new();
        let mut sub = ch.subscribe();
        ch.complete();
        ch.next(1);
        assert!(matches!(sub.next_emission().await, Some(Emission::Complete)));
        assert!(ch.is_stopped());
    }

    #[tokio::test]
    async fn first_resolves_with_first_value() {
        let ch: MulticastChannel<i32> = MulticastChannel::new();
        let fut = ch.first();
        ch.next(42);
        assert_eq!(fut.wait().await.unwrap(), 42);
    }
}
