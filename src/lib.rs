//! Multiplexes one WebSocket connection to a financial trading API into
//! many concurrent request/response interactions and long-lived
//! subscription streams.
//!
//! Requests and responses are represented as [`serde_json::Value`] — there
//! is no per-method wire schema here; typed call generators and argument
//! validation are external collaborators built on top of [`ConnectionCore`].

pub mod cache;
pub mod connection;
pub mod deferred;
pub mod error;
pub mod fingerprint;
pub mod middleware;
pub mod multicast;
pub mod storage;

pub use cache::{Cache, Sendable};
pub use connection::{ConnectionCore, ConnectionDetails, Event, Frame, Transport};
pub use deferred::DeferredFuture;
pub use error::{AddedTaskError, Error, ResponseError, SanityError};
pub use fingerprint::Fingerprint;
pub use middleware::{Hook, Middleware};
pub use multicast::{Emission, MulticastChannel, Subscription};
pub use storage::{InMemoryStorage, Storage};
