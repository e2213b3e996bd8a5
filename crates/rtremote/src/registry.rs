//! Correlation registry
//!
//! Maps the key of each outstanding request to the handler that receives its
//! response. Thread-safe for concurrent registration, removal and dispatch
//! from any number of pumping threads.

use crate::document::{CorrelationKey, Document};
use crate::error::{RemoteError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Receiver of the reply to one outstanding request.
pub trait ResponseHandler: Send + Sync {
    /// Deliver the reply document, or the error that ended the request.
    fn complete(&self, result: Result<Document>);
}

impl<F> ResponseHandler for F
where
    F: Fn(Result<Document>) + Send + Sync,
{
    fn complete(&self, result: Result<Document>) {
        self(result)
    }
}

/// Key → handler map with at most one handler per key.
#[derive(Default)]
pub struct CorrelationRegistry {
    handlers: DashMap<CorrelationKey, Arc<dyn ResponseHandler>>,
}

impl CorrelationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` for `key`.
    ///
    /// Fails with `DuplicateKey` if the key already has a handler; the
    /// existing handler is left in place.
    pub fn register(&self, key: CorrelationKey, handler: Arc<dyn ResponseHandler>) -> Result<()> {
        match self.handlers.entry(key) {
            Entry::Occupied(_) => Err(RemoteError::DuplicateKey(key)),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    /// Uninstall the handler for `key`. Returns whether one was installed.
    pub fn remove(&self, key: CorrelationKey) -> bool {
        self.handlers.remove(&key).is_some()
    }

    /// Whether `key` currently has a handler.
    pub fn contains(&self, key: CorrelationKey) -> bool {
        self.handlers.contains_key(&key)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Hand `doc` to the handler registered for `key`.
    ///
    /// Returns `false` if no handler is registered. The map shard lock is
    /// released before the handler runs, so handlers may touch the registry.
    pub fn dispatch(&self, key: CorrelationKey, doc: Document) -> bool {
        let handler = match self.handlers.get(&key) {
            Some(entry) => Arc::clone(entry.value()),
            None => return false,
        };
        handler.complete(Ok(doc));
        true
    }

    /// Remove every handler, completing each with `err`.
    pub fn fail_all(&self, err: RemoteError) {
        let keys: Vec<CorrelationKey> = self.handlers.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, handler)) = self.handlers.remove(&key) {
                handler.complete(Err(err.clone()));
            }
        }
    }
}
