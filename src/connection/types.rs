use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use url::Url;

use crate::deferred::DeferredFuture;
use crate::error::Error;
use crate::fingerprint::Fingerprint;
use crate::multicast::MulticastChannel;

/// How to reach the server: either a raw endpoint string or the parts spec.md
/// §6 describes (`wss://<host>/websockets/v3?app_id=<app_id>&l=<lang>&brand=<brand>`).
/// Grounded on `ethers-providers`' `ConnectionDetails`/`IntoClientRequest`.
#[derive(Debug, Clone)]
pub struct ConnectionDetails {
    pub url: String,
}

impl ConnectionDetails {
    /// Validates `url` is a well-formed `ws://`/`wss://` URL. Anything else
    /// (missing scheme, `http://`, ...) is a [`Error::Construction`].
    pub fn from_endpoint(url: impl AsRef<str>) -> Result<Self, Error> {
        let raw = url.as_ref();
        let parsed = Url::parse(raw).map_err(|e| Error::Construction(format!("invalid endpoint {raw:?}: {e}")))?;
        match parsed.scheme() {
            "ws" | "wss" => Ok(ConnectionDetails { url: raw.to_owned() }),
            other => Err(Error::Construction(format!("unsupported scheme {other:?}, expected ws/wss"))),
        }
    }

    /// Builds the connect URL from parts, defaulting to `wss://` (spec.md
    /// §6: "the endpoint string may optionally carry a `ws://` or `wss://`
    /// scheme; anything else defaults to `wss://`").
    pub fn from_parts(endpoint: &str, app_id: &str, lang: &str, brand: &str) -> Result<Self, Error> {
        if app_id.is_empty() {
            return Err(Error::Construction("app_id must not be empty".into()));
        }
        let with_scheme =
            if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") { endpoint.to_owned() } else { format!("wss://{endpoint}") };
        let mut url = Url::parse(&with_scheme)
            .map_err(|e| Error::Construction(format!("invalid endpoint {endpoint:?}: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::Construction(format!("unsupported scheme {:?}, expected ws/wss", url.scheme())));
        }
        url.set_path("/websockets/v3");
        url.query_pairs_mut().append_pair("app_id", app_id).append_pair("l", lang).append_pair("brand", brand);
        Ok(ConnectionDetails { url: url.to_string() })
    }
}

/// A decoded websocket frame, or a signal the peer closed the connection.
#[derive(Debug, Clone)]
pub enum Frame {
    Text(String),
    Closed,
}

/// The transport `ConnectionCore` drives: `send_text`/`recv`/`close`, the
/// out-of-scope collaborator spec.md §1 assumes. Implemented for a real
/// websocket in [`super::backend::WsTransport`]; tests supply a fake.
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), Error>;
    async fn recv(&mut self) -> Result<Frame, Error>;
    async fn close(&mut self) -> Result<(), Error>;
}

/// Events published on the core's event bus (spec.md §6).
#[derive(Debug, Clone)]
pub enum Event {
    Connect,
    Send(Value),
    Message(Value),
    Close,
}

/// Spawns a background task that calls `core.forget(sub_id)` when the last
/// consumer of a shared subscription source unsubscribes ("forgetOldSource",
/// spec.md §4.6). Supplied by [`crate::connection::ConnectionCore`] at
/// subscribe time so the manager task never needs a back-reference to the
/// core (see DESIGN.md on cyclic references).
pub type Forgetter = Arc<dyn Fn(String) + Send + Sync>;

/// Messages the public `ConnectionCore` handle sends to the single manager
/// task that owns all mutable connection/subscription state (spec.md §5).
pub enum Instruction {
    /// The raw one-shot send: register a pending channel under a fresh
    /// `req_id`, write the request, and hand back the channel. Used both
    /// directly (by `RawCore`, the `Cache`'s upstream) and internally by
    /// `Subscribe` to create the "orig" source.
    SendAndGetSource { request: Value, respond_to: oneshot::Sender<Result<MulticastChannel<Value>, Error>> },
    Subscribe {
        request: Value,
        forgetter: Forgetter,
        respond_to: oneshot::Sender<Result<MulticastChannel<Value>, Error>>,
    },
    /// Local bookkeeping half of `forget`: `completeSubsByIds`.
    ForgetLocal { sub_id: String, respond_to: oneshot::Sender<()> },
    /// Local bookkeeping half of `forget_all`: `completeSubsByKey` per type.
    ForgetAllLocal { types: Vec<String>, respond_to: oneshot::Sender<()> },
    ExpectResponse {
        types: Vec<String>,
        respond_to: oneshot::Sender<Vec<(String, DeferredFuture<Value>, bool)>>,
    },
    DeleteFromExpectResponse { msg_type: String },
    /// Follow-up from a subscription's response watcher (step 4e): records
    /// the buy alias and the subscription id, or tears the source down on
    /// failure.
    SubscriptionSettled { fp: Fingerprint, had_buy_key: bool, result: Result<Value, Error> },
    /// Follow-up from a shared source's `on_finally` hook: the last
    /// consumer unsubscribed.
    ConsumerCountZero { fp: Fingerprint },
    Disconnect { respond_to: oneshot::Sender<()> },
}
