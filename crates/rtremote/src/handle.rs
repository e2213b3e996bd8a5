//! Async handle: the caller's view of one outstanding request
//!
//! ```text
//! InProgress ──reply──────▶ Completed(Ok(doc))
//!     │──deadline────────▶ Completed(Err(Timeout))
//!     └──shutdown/error──▶ Completed(Err(..))
//! ```
//!
//! `wait` does not hand the request to another thread: the calling thread
//! pumps the environment in short slices until its own completion slot is
//! filled or the deadline passes. Other threads pumping the same environment
//! may deliver this handle's reply; the slot is checked between slices so the
//! reply is picked up whoever routed it.

use crate::document::{CorrelationKey, Document};
use crate::environment::Environment;
use crate::error::{RemoteError, Result};
use crate::registry::ResponseHandler;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Outcome storage shared with the correlation registry.
struct CompletionSlot {
    key: CorrelationKey,
    outcome: Mutex<Option<Result<Document>>>,
}

impl CompletionSlot {
    fn outcome(&self) -> Option<Result<Document>> {
        self.outcome.lock().clone()
    }

    fn is_filled(&self) -> bool {
        self.outcome.lock().is_some()
    }
}

impl ResponseHandler for CompletionSlot {
    fn complete(&self, result: Result<Document>) {
        let mut outcome = self.outcome.lock();
        if outcome.is_some() {
            warn!(key = %self.key, "dropping duplicate reply for completed request");
            return;
        }
        *outcome = Some(result);
    }
}

/// Handle for one request awaiting its reply.
pub struct AsyncHandle {
    env: Arc<Environment>,
    key: CorrelationKey,
    slot: Arc<CompletionSlot>,
    registered: bool,
}

impl AsyncHandle {
    /// Register a handle for `key` with `env`.
    ///
    /// Fails with `DuplicateKey` if `key` is already outstanding.
    pub fn new(env: &Arc<Environment>, key: CorrelationKey) -> Result<Self> {
        let slot = Arc::new(CompletionSlot {
            key,
            outcome: Mutex::new(None),
        });
        env.register_response_handler(Arc::clone(&slot) as Arc<dyn ResponseHandler>, key)?;
        Ok(Self {
            env: Arc::clone(env),
            key,
            slot,
            registered: true,
        })
    }

    /// The request's correlation key.
    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    /// Whether an outcome has been stored.
    pub fn is_completed(&self) -> bool {
        self.slot.is_filled()
    }

    /// Block until the reply arrives or `timeout_ms` elapses.
    ///
    /// `0` uses the configured request timeout. Once completed, every call
    /// returns the same outcome without touching the transport.
    pub fn wait(&mut self, timeout_ms: u64) -> Result<()> {
        if let Some(outcome) = self.slot.outcome() {
            self.deregister();
            return outcome.map(|_| ());
        }

        let timeout = if timeout_ms == 0 {
            self.env.config().request_timeout()
        } else {
            Duration::from_millis(timeout_ms)
        };
        let slice = self.env.config().pump_interval();
        let deadline = Instant::now() + timeout;

        loop {
            if self.slot.is_filled() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                self.slot
                    .complete(Err(RemoteError::Timeout(timeout.as_millis() as u64)));
                break;
            }
            match self.env.process_single_work_item((deadline - now).min(slice)) {
                Ok(Some(k)) if k == self.key => break,
                Ok(_) => {}
                Err(e) => {
                    self.slot.complete(Err(e));
                    break;
                }
            }
        }

        self.deregister();
        trace!(key = %self.key, "request completed");
        match self.slot.outcome() {
            Some(outcome) => outcome.map(|_| ()),
            None => Err(RemoteError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Store an outcome directly, as the registry does when the reply is
    /// routed. Later outcomes are dropped.
    pub fn complete(&self, result: Result<Document>) {
        self.slot.complete(result);
    }

    /// The reply document, after a successful completion.
    pub fn response(&self) -> Option<Document> {
        match self.slot.outcome() {
            Some(Ok(doc)) => Some(doc),
            _ => None,
        }
    }

    fn deregister(&mut self) {
        if self.registered {
            self.env.remove_response_handler(self.key);
            self.registered = false;
        }
    }
}

impl Drop for AsyncHandle {
    fn drop(&mut self) {
        self.deregister();
    }
}

impl std::fmt::Debug for AsyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncHandle")
            .field("key", &self.key)
            .field("completed", &self.is_completed())
            .field("registered", &self.registered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteConfig;
    use serde_json::json;

    fn env() -> Arc<Environment> {
        Environment::new(RemoteConfig {
            request_timeout_ms: 40,
            ..RemoteConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_construction_registers_and_drop_deregisters() {
        let env = env();
        let key = env.next_correlation_key();
        let handle = AsyncHandle::new(&env, key).unwrap();
        assert!(env.registry().contains(key));
        assert!(matches!(
            AsyncHandle::new(&env, key),
            Err(RemoteError::DuplicateKey(k)) if k == key
        ));
        drop(handle);
        assert!(!env.registry().contains(key));
    }

    #[test]
    fn test_reply_before_wait_is_kept() {
        let env = env();
        let key = env.next_correlation_key();
        let mut handle = AsyncHandle::new(&env, key).unwrap();
        let reply = Document::new(json!({ "message.type": "a.response", "correlation.key": key.get() }));

        assert!(env.registry().dispatch(key, reply.clone()));
        assert!(handle.is_completed());
        handle.wait(1000).unwrap();
        assert_eq!(handle.response(), Some(reply));
        assert!(!env.registry().contains(key));
    }

    #[test]
    fn test_duplicate_reply_after_early_completion_is_not_reported() {
        let env = env();
        let (ours, _theirs) = std::os::unix::net::UnixStream::pair().unwrap();
        let stream = crate::stream::Stream::with_socket(
            &env,
            crate::socket::Socket::from_std_unix(ours).unwrap(),
        );
        stream.open().unwrap();

        let key = env.next_correlation_key();
        let mut handle = AsyncHandle::new(&env, key).unwrap();
        let reply = Document::new(json!({ "message.type": "a.response", "correlation.key": key.get() }));
        env.enqueue(&stream, reply.clone()).unwrap();
        env.enqueue(&stream, reply.clone()).unwrap();

        assert_eq!(
            env.process_single_work_item(Duration::from_millis(100)).unwrap(),
            Some(key)
        );
        handle.wait(1000).unwrap();
        assert!(!env.registry().contains(key));

        // The second copy finds no handler and is dropped as stale.
        assert_eq!(
            env.process_single_work_item(Duration::from_millis(100)).unwrap(),
            None
        );
        assert_eq!(handle.response(), Some(reply));
    }

    #[test]
    fn test_zero_timeout_uses_config_and_times_out() {
        let env = env();
        let key = env.next_correlation_key();
        let mut handle = AsyncHandle::new(&env, key).unwrap();

        let start = Instant::now();
        let err = handle.wait(0).unwrap_err();
        assert!(matches!(err, RemoteError::Timeout(40)));
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert!(!env.registry().contains(key));
        assert_eq!(handle.response(), None);
    }

    #[test]
    fn test_wait_after_completion_is_idempotent() {
        let env = env();
        let key = env.next_correlation_key();
        let mut handle = AsyncHandle::new(&env, key).unwrap();
        assert!(handle.wait(5).unwrap_err().is_timeout());

        // A late reply no longer changes the outcome.
        handle.complete(Ok(Document::with_type("late.response")));
        let start = Instant::now();
        assert!(handle.wait(5000).unwrap_err().is_timeout());
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_shutdown_fails_waiting_handle() {
        let env = env();
        let key = env.next_correlation_key();
        let mut handle = AsyncHandle::new(&env, key).unwrap();
        env.shutdown();
        assert!(matches!(handle.wait(1000), Err(RemoteError::ShutdownInProgress)));
    }
}
