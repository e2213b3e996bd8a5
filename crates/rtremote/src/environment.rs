//! Environment: the composition root of the transport
//!
//! Owns the configuration, the correlation registry, the key counter, the
//! stream selector and the inbound work queue. Streams created from an
//! environment push every inbound document onto the queue; whichever thread
//! calls [`Environment::process_single_work_item`] pulls one item off and
//! routes it: replies to their registered handler, requests to the request
//! handler. That call is the only place the protocol advances.
//!
//! Streams accepted by a [`StreamListener`](crate::StreamListener) are owned
//! by the environment until they close; the selector only holds weak
//! references, so without an owner a server-side connection would drop as
//! soon as the accepting code let go of it.

use crate::config::RemoteConfig;
use crate::document::{CorrelationKey, Document};
use crate::endpoint::Endpoint;
use crate::error::{RemoteError, Result};
use crate::registry::{CorrelationRegistry, ResponseHandler};
use crate::selector::StreamSelector;
use crate::stream::{MessageHandler, Stream};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Server-side handler for inbound requests (documents that are not replies
/// to one of our own requests).
pub trait RequestHandler: Send + Sync {
    /// Handle a request received on `stream`.
    fn on_request(&self, stream: &Arc<Stream>, doc: &Document) -> Result<()>;
}

impl<F> RequestHandler for F
where
    F: Fn(&Arc<Stream>, &Document) -> Result<()> + Send + Sync,
{
    fn on_request(&self, stream: &Arc<Stream>, doc: &Document) -> Result<()> {
        self(stream, doc)
    }
}

/// An inbound document waiting to be routed.
struct WorkItem {
    stream: Arc<Stream>,
    doc: Document,
}

/// Default stream message handler: queue the document on the environment.
pub(crate) struct EnqueueOnEnvironment {
    env: Weak<Environment>,
}

impl EnqueueOnEnvironment {
    pub(crate) fn new(env: &Arc<Environment>) -> Self {
        Self {
            env: Arc::downgrade(env),
        }
    }
}

impl MessageHandler for EnqueueOnEnvironment {
    fn on_message(&self, stream: &Arc<Stream>, doc: &Document) -> Result<()> {
        let env = self.env.upgrade().ok_or(RemoteError::ShutdownInProgress)?;
        env.enqueue(stream, doc.clone())
    }
}

/// Shared transport context for one session.
pub struct Environment {
    config: RemoteConfig,
    registry: CorrelationRegistry,
    next_key: AtomicU64,
    selector: StreamSelector,
    work_tx: Sender<WorkItem>,
    work_rx: Receiver<WorkItem>,
    request_handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    /// Accepted streams by address, released on close
    adopted: Mutex<FxHashMap<usize, Arc<Stream>>>,
    shutdown: AtomicBool,
}

impl Environment {
    /// Validate `config`, start the selector thread and return the
    /// environment.
    pub fn new(config: RemoteConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let selector = StreamSelector::new(config.selector_poll_timeout())?;
        selector.start()?;
        let (work_tx, work_rx) = channel::unbounded();
        Ok(Arc::new(Self {
            config,
            registry: CorrelationRegistry::new(),
            next_key: AtomicU64::new(1),
            selector,
            work_tx,
            work_rx,
            request_handler: RwLock::new(None),
            adopted: Mutex::new(FxHashMap::default()),
            shutdown: AtomicBool::new(false),
        }))
    }

    /// Configuration in effect.
    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// The selector polling this environment's streams.
    pub fn selector(&self) -> &StreamSelector {
        &self.selector
    }

    /// The correlation registry.
    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    /// Mint a key no other request of this environment has used.
    pub fn next_correlation_key(&self) -> CorrelationKey {
        CorrelationKey::new(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    /// Connect a new stream to `endpoint` and register it with the selector.
    pub fn connect(self: &Arc<Self>, endpoint: &Endpoint) -> Result<Arc<Stream>> {
        if self.is_shutdown() {
            return Err(RemoteError::ShutdownInProgress);
        }
        let stream = Stream::new(self, endpoint.clone());
        stream.connect()?;
        self.selector.register_stream(&stream)?;
        Ok(stream)
    }

    // ========================================================================
    // Stream ownership
    // ========================================================================

    /// Keep `stream` alive until it closes.
    pub(crate) fn adopt(&self, stream: &Arc<Stream>) {
        self.adopted
            .lock()
            .insert(Arc::as_ptr(stream) as usize, Arc::clone(stream));
    }

    /// Drop the environment's reference to `stream`, if it holds one.
    pub(crate) fn release(&self, stream: &Stream) -> Option<Arc<Stream>> {
        self.adopted.lock().remove(&(stream as *const Stream as usize))
    }

    /// Number of accepted streams still open.
    pub fn adopted_streams(&self) -> usize {
        self.adopted.lock().len()
    }

    // ========================================================================
    // Correlation registry
    // ========================================================================

    /// Install `handler` for replies carrying `key`.
    pub fn register_response_handler(
        &self,
        handler: Arc<dyn ResponseHandler>,
        key: CorrelationKey,
    ) -> Result<()> {
        if self.is_shutdown() {
            return Err(RemoteError::ShutdownInProgress);
        }
        self.registry.register(key, handler)
    }

    /// Uninstall the handler for `key`; no-op if there is none.
    pub fn remove_response_handler(&self, key: CorrelationKey) {
        self.registry.remove(key);
    }

    /// Install the handler for inbound requests.
    pub fn set_request_handler(&self, handler: impl RequestHandler + 'static) {
        *self.request_handler.write() = Some(Arc::new(handler));
    }

    // ========================================================================
    // Work pump
    // ========================================================================

    /// Queue an inbound document received on `stream`.
    pub fn enqueue(&self, stream: &Arc<Stream>, doc: Document) -> Result<()> {
        if self.is_shutdown() {
            return Err(RemoteError::ShutdownInProgress);
        }
        self.work_tx
            .send(WorkItem {
                stream: Arc::clone(stream),
                doc,
            })
            .map_err(|_| RemoteError::ShutdownInProgress)
    }

    /// Items queued and not yet processed.
    pub fn pending_work_items(&self) -> usize {
        self.work_rx.len()
    }

    /// Route at most one queued document, waiting up to `budget` for one.
    ///
    /// Returns the key of the reply delivered, or `None` if nothing was
    /// delivered to a registered response handler.
    pub fn process_single_work_item(&self, budget: Duration) -> Result<Option<CorrelationKey>> {
        if self.is_shutdown() {
            return Err(RemoteError::ShutdownInProgress);
        }

        let item = match self.work_rx.recv_timeout(budget) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            Err(RecvTimeoutError::Disconnected) => return Err(RemoteError::ShutdownInProgress),
        };

        Ok(self.dispatch(item))
    }

    fn dispatch(&self, item: WorkItem) -> Option<CorrelationKey> {
        let WorkItem { stream, doc } = item;

        if let Some(key) = doc.correlation_key() {
            if self.registry.dispatch(key, doc.clone()) {
                return Some(key);
            }
        }

        if doc.is_response() {
            warn!(
                key = ?doc.correlation_key(),
                message_type = ?doc.message_type(),
                "dropping stale or duplicate reply"
            );
            return None;
        }

        let handler = self.request_handler.read().clone();
        match handler {
            Some(handler) => {
                if let Err(e) = handler.on_request(&stream, &doc) {
                    warn!(error = %e, message_type = ?doc.message_type(), "request handler failed");
                }
            }
            None => {
                debug!(message_type = ?doc.message_type(), "no request handler, dropping message");
            }
        }
        None
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Whether `shutdown` has been called.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop the selector, fail every outstanding request with
    /// `ShutdownInProgress` and discard queued work.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(outstanding = self.registry.len(), "environment shutting down");
        if let Err(e) = self.selector.shutdown() {
            warn!(error = %e, "selector shutdown failed");
        }
        self.registry.fail_all(RemoteError::ShutdownInProgress);
        while self.work_rx.try_recv().is_ok() {}

        let adopted: Vec<Arc<Stream>> = self.adopted.lock().drain().map(|(_, s)| s).collect();
        for stream in adopted {
            let _ = stream.close();
        }
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.shutdown();
    }
}
