//! Socket stream: one framed, bidirectional connection
//!
//! A stream owns exactly one socket. Writes go straight to the socket and
//! whatever the kernel does not take is buffered until the selector reports
//! the socket writable again. Reads happen on the selector thread, which
//! feeds the bytes to [`Stream::on_incoming_message`]; complete documents are
//! handed to the installed [`MessageHandler`].
//!
//! Locking: the I/O state, the lifecycle state, the timestamps and the
//! handler slots each sit behind their own lock and no two are held at once.
//! Handlers always run with every stream lock released, so they may send,
//! close, or remove the stream from its selector.

use crate::codec::{encode_frame, FrameDecoder, HEADER_SIZE};
use crate::config::RemoteConfig;
use crate::document::Document;
use crate::endpoint::Endpoint;
use crate::environment::{EnqueueOnEnvironment, Environment};
use crate::error::{RemoteError, Result};
use crate::handle::AsyncHandle;
use crate::selector::SelectorShared;
use crate::socket::Socket;
use mio::event::Source;
use mio::{Interest, Token};
use parking_lot::{Mutex, RwLock};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Lifecycle of a stream. `Closed` is terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamState {
    /// Constructed, no usable connection yet
    Created,
    /// Connected and usable
    Opened,
    /// Released; a new stream is needed to talk again
    Closed,
}

/// Receives every complete inbound document.
///
/// Runs on the selector thread and must not block. An error is logged; it
/// never closes the stream.
pub trait MessageHandler: Send + Sync {
    /// Handle one inbound document.
    fn on_message(&self, stream: &Arc<Stream>, doc: &Document) -> Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Arc<Stream>, &Document) -> Result<()> + Send + Sync,
{
    fn on_message(&self, stream: &Arc<Stream>, doc: &Document) -> Result<()> {
        self(stream, doc)
    }
}

/// Notified when a stream becomes `Opened` or `Closed`.
pub trait StateChangedHandler: Send + Sync {
    /// Handle a state transition.
    fn on_state_changed(&self, stream: &Arc<Stream>, state: StreamState) -> Result<()>;
}

impl<F> StateChangedHandler for F
where
    F: Fn(&Arc<Stream>, StreamState) -> Result<()> + Send + Sync,
{
    fn on_state_changed(&self, stream: &Arc<Stream>, state: StreamState) -> Result<()> {
        self(stream, state)
    }
}

/// Back-reference to the selector a stream is registered with.
struct SelectorLink {
    selector: Weak<SelectorShared>,
    token: Token,
}

/// Everything that touches the socket.
struct StreamIo {
    socket: Option<Socket>,
    decoder: FrameDecoder,
    /// Encoded bytes the socket has not accepted yet
    outbound: Vec<u8>,
    link: Option<SelectorLink>,
}

impl StreamIo {
    /// Write buffered bytes until done or the socket would block.
    fn flush_outbound(&mut self) -> io::Result<()> {
        let socket = match self.socket.as_mut() {
            Some(s) => s,
            None => return Err(io::Error::new(io::ErrorKind::NotConnected, "stream is closed")),
        };
        while !self.outbound.is_empty() {
            match socket.write(&self.outbound) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

struct Activity {
    last_message: Instant,
    last_keep_alive: Instant,
}

/// One open, message-framed connection.
pub struct Stream {
    this: Weak<Stream>,
    env: Weak<Environment>,
    config: RemoteConfig,
    io: Mutex<StreamIo>,
    state: Mutex<StreamState>,
    local_endpoint: Mutex<Option<Endpoint>>,
    remote_endpoint: Mutex<Option<Endpoint>>,
    activity: Mutex<Activity>,
    message_handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    state_handler: RwLock<Option<Arc<dyn StateChangedHandler>>>,
}

impl Stream {
    /// Stream that will connect to `remote` on [`connect`](Self::connect).
    ///
    /// Inbound documents are queued on `env`'s work queue until another
    /// message handler is installed.
    pub fn new(env: &Arc<Environment>, remote: Endpoint) -> Arc<Stream> {
        Self::build(env, None, Some(remote))
    }

    /// Stream around an accepted or already connected socket. Call
    /// [`open`](Self::open) before use.
    pub fn with_socket(env: &Arc<Environment>, socket: Socket) -> Arc<Stream> {
        Self::build(env, Some(socket), None)
    }

    fn build(env: &Arc<Environment>, socket: Option<Socket>, remote: Option<Endpoint>) -> Arc<Stream> {
        let config = env.config().clone();
        let now = Instant::now();
        let default_handler: Arc<dyn MessageHandler> = Arc::new(EnqueueOnEnvironment::new(env));
        Arc::new_cyclic(|this| Stream {
            this: this.clone(),
            env: Arc::downgrade(env),
            io: Mutex::new(StreamIo {
                socket,
                decoder: FrameDecoder::new(config.max_message_size),
                outbound: Vec::new(),
                link: None,
            }),
            config,
            state: Mutex::new(StreamState::Created),
            local_endpoint: Mutex::new(None),
            remote_endpoint: Mutex::new(remote),
            activity: Mutex::new(Activity {
                last_message: now,
                last_keep_alive: now,
            }),
            message_handler: RwLock::new(Some(default_handler)),
            state_handler: RwLock::new(None),
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Prepare the socket this stream was built with and move to `Opened`.
    pub fn open(&self) -> Result<()> {
        if self.state() != StreamState::Created {
            return Err(RemoteError::io(
                io::ErrorKind::InvalidInput,
                "stream was already opened or closed",
            ));
        }

        let (local, remote) = {
            let io = self.io.lock();
            let socket = io.socket.as_ref().ok_or_else(|| {
                RemoteError::io(io::ErrorKind::InvalidInput, "stream has no socket")
            })?;
            if let Some(e) = socket.take_error()? {
                return Err(e.into());
            }
            (socket.local_endpoint()?, socket.peer_endpoint()?)
        };

        debug!(local = %local, remote = %remote, "stream opened");
        *self.local_endpoint.lock() = Some(local);
        *self.remote_endpoint.lock() = Some(remote);
        {
            let now = Instant::now();
            let mut activity = self.activity.lock();
            activity.last_message = now;
            activity.last_keep_alive = now;
        }
        *self.state.lock() = StreamState::Opened;
        self.notify_state(StreamState::Opened);
        Ok(())
    }

    /// Connect to the remote endpoint given at construction.
    pub fn connect(&self) -> Result<()> {
        let remote = self
            .remote_endpoint()
            .ok_or_else(|| RemoteError::Connection("no remote endpoint".into()))?;
        if self.state() != StreamState::Created {
            return Err(RemoteError::Connection(format!(
                "cannot connect a stream in state {:?}",
                self.state()
            )));
        }

        let socket = Socket::connect(&remote, self.config.connect_timeout())
            .map_err(|e| RemoteError::Connection(format!("{}: {}", remote, e)))?;
        self.io.lock().socket = Some(socket);
        self.open()
            .map_err(|e| RemoteError::Connection(format!("{}: {}", remote, e)))
    }

    /// Connect to `endpoint`.
    pub fn connect_to(&self, endpoint: Endpoint) -> Result<()> {
        *self.remote_endpoint.lock() = Some(endpoint);
        self.connect()
    }

    /// Release the socket and move to `Closed`.
    ///
    /// The state handler sees `Closed` once, however often this is called.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == StreamState::Closed {
                return Ok(());
            }
            *state = StreamState::Closed;
        }

        let (socket, link) = {
            let mut io = self.io.lock();
            io.outbound.clear();
            (io.socket.take(), io.link.take())
        };

        if let Some(link) = link {
            if let Some(selector) = link.selector.upgrade() {
                if let Some(mut socket) = socket {
                    let _ = socket.deregister(selector.registry());
                }
                selector.forget(link.token);
            }
        }

        debug!(remote = ?self.remote_endpoint(), "stream closed");
        self.notify_state(StreamState::Closed);
        let _owned = self.env.upgrade().and_then(|env| env.release(self));
        Ok(())
    }

    fn fail(&self, err: RemoteError) -> RemoteError {
        warn!(remote = ?self.remote_endpoint(), error = %err, "closing stream after error");
        let _ = self.close();
        err
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Frame and send `doc` without blocking.
    pub fn send(&self, doc: &Document) -> Result<()> {
        if self.state() != StreamState::Opened {
            return Err(RemoteError::not_connected());
        }
        let frame = encode_frame(doc, self.config.max_message_size)?;
        let flushed = {
            let mut io = self.io.lock();
            if io.socket.is_none() {
                return Err(RemoteError::not_connected());
            }
            io.outbound.extend_from_slice(&frame);
            io.flush_outbound()
        };
        trace!(bytes = frame.len(), message_type = ?doc.message_type(), "send");
        flushed.map_err(|e| self.fail(e.into()))
    }

    /// Send `doc` under a freshly minted correlation key and return the
    /// handle that waits for its reply.
    pub fn send_with_wait(&self, doc: &Document) -> Result<AsyncHandle> {
        let env = self.env.upgrade().ok_or(RemoteError::ShutdownInProgress)?;
        let key = env.next_correlation_key();
        // Registered before sending so an immediate reply cannot miss it.
        let handle = AsyncHandle::new(&env, key)?;
        self.send(&doc.with_correlation_key(key))?;
        Ok(handle)
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Replace the message handler.
    pub fn set_message_handler(&self, handler: impl MessageHandler + 'static) {
        *self.message_handler.write() = Some(Arc::new(handler));
    }

    /// Replace the state-change handler.
    pub fn set_state_changed_handler(&self, handler: impl StateChangedHandler + 'static) {
        *self.state_handler.write() = Some(Arc::new(handler));
    }

    fn notify_state(&self, state: StreamState) {
        let handler = self.state_handler.read().clone();
        if let (Some(handler), Some(this)) = (handler, self.this.upgrade()) {
            if let Err(e) = handler.on_state_changed(&this, state) {
                warn!(?state, error = %e, "state change handler failed");
            }
        }
    }

    // ========================================================================
    // Selector callbacks
    // ========================================================================

    /// Accumulate received bytes and dispatch every complete document.
    pub(crate) fn on_incoming_message(&self, bytes: &[u8], now: Instant) -> Result<()> {
        self.activity.lock().last_message = now;

        let mut docs = Vec::new();
        let mut fatal = None;
        {
            let mut io = self.io.lock();
            io.decoder.extend(bytes);
            loop {
                match io.decoder.next_frame() {
                    Ok(Some(doc)) => docs.push(doc),
                    Ok(None) => break,
                    Err(e) if e.is_recoverable() => {
                        warn!(error = %e, "discarding malformed message");
                    }
                    Err(e) => {
                        fatal = Some(e);
                        break;
                    }
                }
            }
        }

        if let Some(this) = self.this.upgrade() {
            for doc in docs {
                if doc.is_keep_alive() {
                    trace!("keep-alive received");
                    continue;
                }
                let handler = self.message_handler.read().clone();
                if let Some(handler) = handler {
                    if let Err(e) = handler.on_message(&this, &doc) {
                        warn!(error = %e, message_type = ?doc.message_type(), "message handler failed");
                    }
                }
            }
        }

        match fatal {
            Some(e) => Err(self.fail(e.into())),
            None => Ok(()),
        }
    }

    /// Drain the socket, then dispatch what arrived.
    ///
    /// Reads in passes of at most one maximal frame so a flooded socket is
    /// decoded as it is drained. Stops early once the stream is closed or
    /// removed from its selector.
    pub(crate) fn on_readable(&self, now: Instant) {
        let limit = self.config.max_message_size + HEADER_SIZE;
        let mut chunk = vec![0u8; self.config.socket_buffer_size];
        let mut attached = None;

        loop {
            let mut received = Vec::new();
            let mut drained = false;
            let mut peer_closed = false;
            let mut error = None;
            {
                let mut io = self.io.lock();
                match attached {
                    None => attached = Some(io.link.is_some()),
                    Some(true) if io.link.is_none() => return,
                    Some(_) => {}
                }
                let socket = match io.socket.as_mut() {
                    Some(s) => s,
                    None => return,
                };
                while received.len() < limit {
                    match socket.read(&mut chunk) {
                        Ok(0) => {
                            peer_closed = true;
                            break;
                        }
                        Ok(n) => received.extend_from_slice(&chunk[..n]),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            drained = true;
                            break;
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            error = Some(e);
                            break;
                        }
                    }
                }
            }

            if !received.is_empty() && self.on_incoming_message(&received, now).is_err() {
                return;
            }
            if let Some(e) = error {
                self.fail(e.into());
                return;
            }
            if peer_closed {
                debug!(remote = ?self.remote_endpoint(), "peer closed connection");
                let _ = self.close();
                return;
            }
            if drained {
                return;
            }
        }
    }

    /// Flush buffered output after a writable notification.
    pub(crate) fn on_writable(&self) {
        let flushed = {
            let mut io = self.io.lock();
            if io.outbound.is_empty() || io.socket.is_none() {
                return;
            }
            io.flush_outbound()
        };
        if let Err(e) = flushed {
            self.fail(e.into());
        }
    }

    /// Periodic bookkeeping from the selector loop: emit a keep-alive when
    /// the interval has elapsed.
    pub(crate) fn on_tick(&self, now: Instant) {
        let interval = match self.config.keep_alive_interval() {
            Some(i) => i,
            None => return,
        };
        if self.state() != StreamState::Opened {
            return;
        }
        {
            let mut activity = self.activity.lock();
            if now.saturating_duration_since(activity.last_keep_alive) < interval {
                return;
            }
            activity.last_keep_alive = now;
        }
        if let Err(e) = self.send(&Document::keep_alive()) {
            debug!(error = %e, "keep-alive send failed");
        }
    }

    // ========================================================================
    // Selector registration
    // ========================================================================

    pub(crate) fn attach(&self, selector: &Arc<SelectorShared>, token: Token) -> Result<()> {
        let mut io = self.io.lock();
        if io.link.is_some() {
            return Err(RemoteError::io(
                io::ErrorKind::AlreadyExists,
                "stream is registered with another selector",
            ));
        }
        let socket = io.socket.as_mut().ok_or_else(RemoteError::not_connected)?;
        socket.register(selector.registry(), token, Interest::READABLE | Interest::WRITABLE)?;
        io.link = Some(SelectorLink {
            selector: Arc::downgrade(selector),
            token,
        });
        Ok(())
    }

    pub(crate) fn detach(&self, selector: &Arc<SelectorShared>) {
        let mut io = self.io.lock();
        let linked_here = io
            .link
            .as_ref()
            .is_some_and(|l| std::ptr::eq(l.selector.as_ptr(), Arc::as_ptr(selector)));
        if !linked_here {
            return;
        }
        io.link = None;
        if let Some(socket) = io.socket.as_mut() {
            let _ = socket.deregister(selector.registry());
        }
    }

    pub(crate) fn is_attached_to(&self, selector: &Arc<SelectorShared>, token: Token) -> bool {
        self.io.lock().link.as_ref().is_some_and(|l| {
            l.token == token && std::ptr::eq(l.selector.as_ptr(), Arc::as_ptr(selector))
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    /// Whether the stream holds an open socket.
    pub fn is_connected(&self) -> bool {
        self.io.lock().socket.is_some()
    }

    /// Descriptor of the socket, `None` once closed or before connect.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.io.lock().socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Local address, known once opened.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.local_endpoint.lock().clone()
    }

    /// Remote address.
    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        self.remote_endpoint.lock().clone()
    }

    /// When bytes last arrived.
    pub fn last_message_time(&self) -> Instant {
        self.activity.lock().last_message
    }

    /// When the last keep-alive was sent.
    pub fn last_keep_alive_time(&self) -> Instant {
        self.activity.lock().last_keep_alive
    }

    /// Bytes queued but not yet accepted by the socket.
    pub fn pending_output(&self) -> usize {
        self.io.lock().outbound.len()
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("state", &self.state())
            .field("local", &self.local_endpoint())
            .field("remote", &self.remote_endpoint())
            .finish()
    }
}
