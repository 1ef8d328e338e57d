use std::sync::Arc;

use serde_json::Value;

/// Errors produced by [`crate::ConnectionCore`] and its collaborators.
///
/// `Clone` because [`crate::DeferredFuture`] settles with a `Result<T, Error>`
/// and must be able to hand the same outcome to more than one waiter
/// (`cascade`, `then`). The two upstream error types that are not `Clone`
/// are wrapped in `Arc`, mirroring how `ethers-providers` keeps its client
/// handles cheap to clone.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Configuration invalid at startup: missing `app_id`, malformed
    /// endpoint, a cache constructed without an upstream.
    #[error("construction error: {0}")]
    Construction(String),

    /// Protocol-level client-side anomaly: unsubscribable request, response
    /// with an unknown `req_id`, and similar.
    #[error("api error: {0}")]
    Api(String),

    /// The server returned `error` for a non-parent subscription response.
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// The connection is not (or no longer) open.
    #[error("websocket closed")]
    ConnectionClosed,

    /// A future/channel was cancelled, carrying the reason.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Underlying websocket transport error.
    #[error(transparent)]
    Transport(#[from] Arc<tokio_tungstenite::tungstenite::Error>),

    /// (De)serialization error.
    #[error(transparent)]
    Json(#[from] Arc<serde_json::Error>),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(Arc::new(err))
    }
}

/// Carries the server's `error` object for a non-parent subscription
/// response, per spec §7.
#[derive(Debug, Clone, thiserror::Error)]
#[error("response error {code}: {message}")]
pub struct ResponseError {
    pub code: String,
    pub message: String,
    pub echo_req: Value,
    pub msg_type: String,
    pub req_id: Option<u64>,
}

impl ResponseError {
    /// Build a [`ResponseError`] from a decoded response object. Returns
    /// `None` if `response.error` is absent.
    pub fn from_response(response: &Value) -> Option<Self> {
        let error = response.get("error")?;
        Some(ResponseError {
            code: error.get("code").and_then(Value::as_str).unwrap_or_default().to_owned(),
            message: error.get("message").and_then(Value::as_str).unwrap_or_default().to_owned(),
            echo_req: response.get("echo_req").cloned().unwrap_or(Value::Null),
            msg_type: response.get("msg_type").and_then(Value::as_str).unwrap_or_default().to_owned(),
            req_id: response.get("req_id").and_then(Value::as_u64),
        })
    }
}

/// Wraps any exception escaping a supervised background task. Always
/// routed to `sanity_errors`, never surfaced to a caller directly — so it
/// is not a variant of [`Error`].
#[derive(Debug, Clone)]
pub struct AddedTaskError {
    pub name: String,
    pub inner: Box<Error>,
}

impl std::fmt::Display for AddedTaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.inner)
    }
}

impl std::error::Error for AddedTaskError {}

/// Everything that can show up on the `sanity_errors` side channel (spec
/// §6): ordinary client errors (an extra/unmatched response, a read
/// exception) and task-supervision failures, which are deliberately not
/// part of [`Error`] itself.
#[derive(Debug, Clone)]
pub enum SanityError {
    Direct(Error),
    Task(AddedTaskError),
}

impl std::fmt::Display for SanityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SanityError::Direct(e) => write!(f, "{e}"),
            SanityError::Task(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SanityError {}

impl From<Error> for SanityError {
    fn from(err: Error) -> Self {
        SanityError::Direct(err)
    }
}
