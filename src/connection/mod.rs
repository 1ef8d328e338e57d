mod backend;
mod manager;
mod subscription;
mod types;

pub use backend::WsTransport;
pub use subscription::{msg_type, STREAM_TYPES};
pub use types::{ConnectionDetails, Event, Frame, Transport};

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cache::{Cache, Sendable};
use crate::deferred::DeferredFuture;
use crate::error::{AddedTaskError, Error, SanityError};
use crate::middleware::Middleware;
use crate::multicast::{MulticastChannel, Subscription};
use crate::storage::Storage;

use manager::Manager;
use types::{Forgetter, Instruction};

/// The bare wire-level sender the manager task exposes: register a pending
/// channel, write the request, await the first reply. [`Cache`] wraps this
/// (not the full [`ConnectionCore`]) as its upstream, so there is no
/// `Arc<ConnectionCore>` cycle between core and cache — see DESIGN.md.
struct RawCore {
    instructions: mpsc::UnboundedSender<Instruction>,
}

#[async_trait]
impl Sendable for RawCore {
    async fn send(&self, request: Value) -> Result<Value, Error> {
        let (tx, rx) = oneshot::channel();
        self.instructions
            .send(Instruction::SendAndGetSource { request, respond_to: tx })
            .map_err(|_| Error::ConnectionClosed)?;
        let channel = rx.await.map_err(|_| Error::ConnectionClosed)??;
        channel.first().wait().await
    }
}

/// Public handle onto the connection: owns the middleware registry and the
/// cache, and talks to the single manager task that owns the rest of the
/// mutable state (spec.md §4.5, C7). Cheap to clone — every clone shares
/// the same manager task via its `mpsc::UnboundedSender<Instruction>`.
#[derive(Clone)]
pub struct ConnectionCore {
    instructions: mpsc::UnboundedSender<Instruction>,
    middleware: Middleware,
    cache: Arc<dyn Sendable>,
    storage: Arc<dyn Storage>,
    persistent_storage: Option<Arc<dyn Storage>>,
    event_bus: MulticastChannel<Event>,
    sanity_errors: MulticastChannel<SanityError>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ConnectionCore {
    /// Builds and owns its own transport, with only the volatile in-memory
    /// cache layer (spec.md §4.2's simple, single-level arrangement). An
    /// internally constructed transport may be closed by `disconnect()`; see
    /// spec.md §4.5.
    pub async fn connect(details: ConnectionDetails, storage: Arc<dyn Storage>, middleware: Middleware) -> Result<Self, Error> {
        let transport = WsTransport::connect(details).await?;
        Ok(Self::spawn(Box::new(transport), true, None, storage, middleware))
    }

    /// Uses a caller-supplied transport, with only the volatile cache layer.
    /// Per spec.md §4.5, `disconnect()` MUST NOT close a transport the core
    /// did not create.
    pub fn with_transport(transport: Box<dyn Transport>, storage: Arc<dyn Storage>, middleware: Middleware) -> Self {
        Self::spawn(transport, false, None, storage, middleware)
    }

    /// The two-level cache arrangement spec.md §4.2 describes: an optional
    /// persistent storage-cache wraps the raw connection, and the volatile
    /// cache wraps *that* — so a successful round trip writes through both
    /// layers (each `Cache::send` records into its own storage on the way
    /// back up), and a hit in either layer short-circuits the wire.
    pub fn with_transport_and_persistent_storage(
        transport: Box<dyn Transport>,
        persistent_storage: Arc<dyn Storage>,
        volatile_storage: Arc<dyn Storage>,
        middleware: Middleware,
    ) -> Self {
        Self::spawn(transport, false, Some(persistent_storage), volatile_storage, middleware)
    }

    fn spawn(
        transport: Box<dyn Transport>,
        transport_owned: bool,
        persistent_storage: Option<Arc<dyn Storage>>,
        volatile_storage: Arc<dyn Storage>,
        middleware: Middleware,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = DeferredFuture::new();
        let event_bus = MulticastChannel::new();
        let sanity_errors = MulticastChannel::new();

        let manager =
            Manager::new(transport, transport_owned, connected, event_bus.clone(), sanity_errors.clone(), tx.clone(), rx);
        tokio::spawn(manager.run());

        let raw: Arc<dyn Sendable> = Arc::new(RawCore { instructions: tx.clone() });
        let upstream: Arc<dyn Sendable> = match &persistent_storage {
            Some(storage) => Arc::new(Cache::new(raw, storage.clone())),
            None => raw,
        };
        let cache: Arc<dyn Sendable> = Arc::new(Cache::new(upstream, volatile_storage.clone()));

        ConnectionCore {
            instructions: tx,
            middleware,
            cache,
            storage: volatile_storage,
            persistent_storage,
            event_bus,
            sanity_errors,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn event_bus(&self) -> Subscription<Event> {
        self.event_bus.subscribe()
    }

    pub fn sanity_errors(&self) -> Subscription<SanityError> {
        self.sanity_errors.subscribe()
    }

    /// Spawns `fut` under task supervision (spec.md §4.5's `addTask`): any
    /// error it returns is routed to `sanity_errors` wrapped in
    /// [`AddedTaskError`], and the handle is kept so `clear()` can abort it.
    fn add_task<F>(&self, name: &str, fut: F)
    where
        F: std::future::Future<Output = Result<(), Error>> + Send + 'static,
    {
        let sanity_errors = self.sanity_errors.clone();
        let name = name.to_owned();
        let handle = tokio::spawn(async move {
            if let Err(err) = fut.await {
                sanity_errors.next(SanityError::Task(AddedTaskError { name, inner: Box::new(err) }));
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    /// Builds the `Forgetter` passed to the manager when creating a new
    /// subscription source: fires `forget(sub_id)` under task supervision
    /// once the last consumer unsubscribes (spec.md §4.6 `forgetOldSource`).
    fn forgetter(&self) -> Forgetter {
        let core = self.clone();
        Arc::new(move |sub_id: String| {
            let supervisor = core.clone();
            let worker = core.clone();
            supervisor.add_task("forget_old_source", async move { worker.forget(sub_id).await.map(|_| ()) });
        })
    }

    /// `send(request) → response` (spec.md §4.5): runs `sendWillBeCalled`,
    /// short-circuiting the wire entirely on a non-null override; otherwise
    /// emits `send`, goes through the cache (which dedups/records via the
    /// raw one-shot path), then runs `sendIsCalled` (override wins).
    #[tracing::instrument(skip(self, request))]
    pub async fn send(&self, request: Value) -> Result<Value, Error> {
        let override_before = self.middleware.run_send_will_be_called(&request);
        if !override_before.is_null() {
            return Ok(override_before);
        }

        self.event_bus.next(Event::Send(request.clone()));
        let response = self.cache.send(request.clone()).await?;

        let override_after = self.middleware.run_send_is_called(&request, &response);
        if !override_after.is_null() {
            return Ok(override_after);
        }
        Ok(response)
    }

    /// `sendAndGetSource(request) → MulticastChannel` (spec.md §4.5): the
    /// raw wire-level call, bypassing cache and middleware. Exposed for
    /// callers (like [`Self::subscribe`]'s caller-visible surface) that
    /// need the channel itself rather than its first value.
    pub async fn send_and_get_source(&self, request: Value) -> Result<MulticastChannel<Value>, Error> {
        let (tx, rx) = oneshot::channel();
        self.instructions
            .send(Instruction::SendAndGetSource { request, respond_to: tx })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// `subscribe(request) → MulticastChannel` (spec.md §4.6, C8).
    pub async fn subscribe(&self, request: Value) -> Result<MulticastChannel<Value>, Error> {
        let (tx, rx) = oneshot::channel();
        self.instructions
            .send(Instruction::Subscribe { request, forgetter: self.forgetter(), respond_to: tx })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// `forget(subId)` (spec.md §4.6): completes local bookkeeping
    /// synchronously, then issues `{forget: subId}` through the full
    /// `send` pipeline.
    pub async fn forget(&self, sub_id: String) -> Result<Value, Error> {
        let (tx, rx) = oneshot::channel();
        self.instructions
            .send(Instruction::ForgetLocal { sub_id: sub_id.clone(), respond_to: tx })
            .map_err(|_| Error::ConnectionClosed)?;
        let _ = rx.await;
        self.send(serde_json::json!({ "forget": sub_id })).await
    }

    /// `forgetAll(*types)` (spec.md §4.6): local sources for each listed
    /// type are completed synchronously before the server round-trip, so a
    /// re-subscribe to the same fingerprint in the same tick gets a fresh
    /// physical subscription (spec.md §5 ordering guarantee).
    pub async fn forget_all(&self, types: Vec<String>) -> Result<Value, Error> {
        let (tx, rx) = oneshot::channel();
        self.instructions
            .send(Instruction::ForgetAllLocal { types: types.clone(), respond_to: tx })
            .map_err(|_| Error::ConnectionClosed)?;
        let _ = rx.await;
        self.send(serde_json::json!({ "forget_all": types })).await
    }

    /// `expectResponse(*types)` (spec.md §4.5): arms a `DeferredFuture` per
    /// unseen type, seeding newly-armed ones from cache/storage by
    /// `msg_type` if already available.
    pub async fn expect_response(&self, types: Vec<String>) -> Result<Vec<DeferredFuture<Value>>, Error> {
        let (tx, rx) = oneshot::channel();
        self.instructions
            .send(Instruction::ExpectResponse { types, respond_to: tx })
            .map_err(|_| Error::ConnectionClosed)?;
        let armed = rx.await.map_err(|_| Error::ConnectionClosed)?;

        let mut futures = Vec::with_capacity(armed.len());
        for (msg_type, future, is_new) in armed {
            if is_new {
                if let Some(cached) = self.cache_lookup_by_msg_type(&msg_type) {
                    let _ = future.resolve(cached);
                }
            }
            futures.push(future);
        }
        Ok(futures)
    }

    /// Checks the volatile layer first, then the persistent layer if
    /// configured (`original_source/deriv_api.py`'s `expect_response`).
    fn cache_lookup_by_msg_type(&self, msg_type: &str) -> Option<Value> {
        self.storage.get_by_msg_type(msg_type).or_else(|| {
            self.persistent_storage.as_ref().and_then(|storage| storage.get_by_msg_type(msg_type))
        })
    }

    /// `deleteFromExpectResponse(request)` (spec.md §3): removes a settled
    /// expectation for `request`'s primary subscribable type, if any.
    pub fn delete_from_expect_response(&self, request: &Value) {
        if let Some(msg_type) = subscription::msg_type(request) {
            let _ = self.instructions.send(Instruction::DeleteFromExpectResponse { msg_type: msg_type.to_owned() });
        }
    }

    /// `disconnect()` (spec.md §4.5): a no-op unless `connected` is
    /// currently resolved.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.instructions.send(Instruction::Disconnect { respond_to: tx }).map_err(|_| Error::ConnectionClosed)?;
        let _ = rx.await;
        Ok(())
    }

    /// `clear()` (spec.md §4.5, supplemented from `original_source`):
    /// disconnects, then aborts every task spawned via [`Self::add_task`].
    pub async fn clear(&self) -> Result<(), Error> {
        self.disconnect().await?;
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        Ok(())
    }
}
