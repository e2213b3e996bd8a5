//! Stream selector: one polling thread for every registered stream
//!
//! The selector thread blocks in a bounded readiness wait, resolves the ready
//! tokens to streams under the table lock, releases the lock, and then
//! dispatches read/write readiness to each stream. Registration, removal and
//! shutdown wake the poller through a `mio::Waker` so changes take effect on
//! the next cycle instead of after the poll timeout.
//!
//! The table holds weak references: a stream dropped by everyone else simply
//! disappears from the table on the next cycle.

use crate::error::{RemoteError, Result};
use crate::stream::Stream;
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Token reserved for the waker.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Events buffer capacity per poll.
const EVENTS_CAPACITY: usize = 256;

// ============================================================================
// Shared state
// ============================================================================

/// Registered streams by token
struct StreamTable {
    next_token: usize,
    entries: FxHashMap<Token, Weak<Stream>>,
}

impl StreamTable {
    fn token_of(&self, stream: &Arc<Stream>) -> Option<Token> {
        self.entries
            .iter()
            .find(|(_, w)| std::ptr::eq(w.as_ptr(), Arc::as_ptr(stream)))
            .map(|(t, _)| *t)
    }
}

/// State shared between the selector handle, its thread and the streams
/// registered with it.
pub(crate) struct SelectorShared {
    registry: Registry,
    waker: Waker,
    streams: Mutex<StreamTable>,
    shutdown: AtomicBool,
}

impl SelectorShared {
    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Drop `token` from the table. Used by a stream closing itself.
    pub(crate) fn forget(&self, token: Token) {
        self.streams.lock().entries.remove(&token);
        self.wake();
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake selector");
        }
    }

    /// Strong references to every live stream, pruning dead entries.
    fn live_streams(&self) -> Vec<Arc<Stream>> {
        let mut table = self.streams.lock();
        let mut live = Vec::with_capacity(table.entries.len());
        table.entries.retain(|_, weak| match weak.upgrade() {
            Some(stream) => {
                live.push(stream);
                true
            }
            None => false,
        });
        live
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    ShutDown,
}

// ============================================================================
// StreamSelector
// ============================================================================

/// Multiplexes readiness for any number of streams on one background thread.
pub struct StreamSelector {
    shared: Arc<SelectorShared>,
    /// Moved into the thread by `start`
    poll: Mutex<Option<Poll>>,
    lifecycle: Mutex<Lifecycle>,
    handle: Mutex<Option<JoinHandle<()>>>,
    poll_timeout: Duration,
}

impl StreamSelector {
    /// Create a selector (not yet started) whose readiness wait never
    /// exceeds `poll_timeout`.
    pub fn new(poll_timeout: Duration) -> Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Self {
            shared: Arc::new(SelectorShared {
                registry,
                waker,
                streams: Mutex::new(StreamTable {
                    next_token: 0,
                    entries: FxHashMap::default(),
                }),
                shutdown: AtomicBool::new(false),
            }),
            poll: Mutex::new(Some(poll)),
            lifecycle: Mutex::new(Lifecycle::Idle),
            handle: Mutex::new(None),
            poll_timeout,
        })
    }

    /// Spawn the polling thread.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running => return Err(RemoteError::AlreadyStarted),
            Lifecycle::ShutDown => return Err(RemoteError::ShutdownInProgress),
            Lifecycle::Idle => {}
        }

        let poll = self
            .poll
            .lock()
            .take()
            .ok_or(RemoteError::AlreadyStarted)?;
        let shared = Arc::clone(&self.shared);
        let timeout = self.poll_timeout;
        let handle = thread::Builder::new()
            .name("rtremote-selector".to_string())
            .spawn(move || Self::poll_loop(poll, shared, timeout))?;

        *self.handle.lock() = Some(handle);
        *lifecycle = Lifecycle::Running;
        debug!("selector started");
        Ok(())
    }

    /// Add `stream` to the polled set. Registering the same stream twice is
    /// a no-op.
    pub fn register_stream(&self, stream: &Arc<Stream>) -> Result<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(RemoteError::ShutdownInProgress);
        }

        // The table entry goes in before the socket is registered so that
        // no readiness event can arrive for an unknown token.
        let token = {
            let mut table = self.shared.streams.lock();
            if table.token_of(stream).is_some() {
                return Ok(());
            }
            let token = Token(table.next_token);
            table.next_token += 1;
            table.entries.insert(token, Arc::downgrade(stream));
            token
        };

        if let Err(e) = stream.attach(&self.shared, token) {
            self.shared.streams.lock().entries.remove(&token);
            return Err(e);
        }

        trace!(token = token.0, "stream registered");
        self.shared.wake();
        Ok(())
    }

    /// Remove `stream` from the polled set.
    ///
    /// Safe from any thread, including the stream's own handlers running on
    /// the selector thread. Once this returns the selector dispatches no
    /// further readiness to the stream.
    pub fn remove_stream(&self, stream: &Arc<Stream>) -> Result<()> {
        let token = {
            let mut table = self.shared.streams.lock();
            let token = table.token_of(stream);
            if let Some(t) = token {
                table.entries.remove(&t);
            }
            token
        };

        if let Some(token) = token {
            stream.detach(&self.shared);
            trace!(token = token.0, "stream removed");
            self.shared.wake();
        }
        Ok(())
    }

    /// Whether `stream` is currently registered.
    pub fn contains(&self, stream: &Arc<Stream>) -> bool {
        self.shared.streams.lock().token_of(stream).is_some()
    }

    /// Number of registered streams, dead ones included until pruned.
    pub fn len(&self) -> usize {
        self.shared.streams.lock().entries.len()
    }

    /// Whether no stream is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the polling thread is running.
    pub fn is_running(&self) -> bool {
        *self.lifecycle.lock() == Lifecycle::Running
    }

    /// Stop and join the polling thread and release every registration.
    /// The selector cannot be started again.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::ShutDown {
                return Ok(());
            }
            *lifecycle = Lifecycle::ShutDown;
        }

        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake();

        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() == thread::current().id() {
                // Shut down from one of our own callbacks; the loop exits on
                // its next check.
                debug!("selector shutdown requested from the selector thread");
            } else {
                Self::join_with_timeout(handle, Duration::from_secs(2));
            }
        }

        let streams: Vec<Arc<Stream>> = {
            let mut table = self.shared.streams.lock();
            table.entries.drain().filter_map(|(_, w)| w.upgrade()).collect()
        };
        for stream in streams {
            stream.detach(&self.shared);
        }

        debug!("selector shut down");
        Ok(())
    }

    /// Join a thread with timeout, detach if stuck.
    fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
        let start = Instant::now();
        loop {
            if handle.is_finished() {
                let _ = handle.join();
                return;
            }
            if start.elapsed() > timeout {
                warn!("selector thread did not exit in time, detaching");
                drop(handle);
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    // ========================================================================
    // Poll loop
    // ========================================================================

    fn poll_loop(mut poll: Poll, shared: Arc<SelectorShared>, timeout: Duration) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }

            if let Err(e) = poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %e, "selector poll failed, exiting");
                break;
            }

            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }

            let now = Instant::now();

            // Snapshot the ready streams; the lock is released before any
            // stream code runs.
            let ready: Vec<(Token, Arc<Stream>, bool, bool)> = {
                let table = shared.streams.lock();
                events
                    .iter()
                    .filter(|e| e.token() != WAKE_TOKEN)
                    .filter_map(|e| {
                        let stream = table.entries.get(&e.token())?.upgrade()?;
                        let readable = e.is_readable() || e.is_read_closed() || e.is_error();
                        Some((e.token(), stream, readable, e.is_writable()))
                    })
                    .collect()
            };

            for (token, stream, readable, writable) in ready {
                if writable && stream.is_attached_to(&shared, token) {
                    stream.on_writable();
                }
                if readable && stream.is_attached_to(&shared, token) {
                    stream.on_readable(now);
                }
            }

            for stream in shared.live_streams() {
                stream.on_tick(now);
            }
        }

        debug!("selector thread exiting");
    }
}

impl Drop for StreamSelector {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
