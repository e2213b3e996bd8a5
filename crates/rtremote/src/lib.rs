//! rtremote: remote-object RPC transport
//!
//! Framed JSON documents over non-blocking sockets, multiplexed on a single
//! selector thread. Callers fire a request with [`Stream::send_with_wait`]
//! and block on the returned [`AsyncHandle`], which pumps the shared
//! [`Environment`] from the calling thread until the correlated reply
//! arrives or the deadline passes.
//!
//! All blocking is cooperative: no thread is spawned per outstanding call.

#![warn(missing_docs)]

pub mod codec;
pub mod config;
pub mod document;
pub mod endpoint;
pub mod environment;
pub mod error;
pub mod handle;
pub mod listener;
pub mod registry;
pub mod selector;
pub mod socket;
pub mod stream;

pub use config::RemoteConfig;
pub use document::{CorrelationKey, Document};
pub use endpoint::Endpoint;
pub use environment::{Environment, RequestHandler};
pub use error::{RemoteError, Result};
pub use handle::AsyncHandle;
pub use listener::StreamListener;
pub use registry::{CorrelationRegistry, ResponseHandler};
pub use selector::StreamSelector;
pub use stream::{MessageHandler, StateChangedHandler, Stream, StreamState};
