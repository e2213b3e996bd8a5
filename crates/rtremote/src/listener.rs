//! Accepting side of a connection

use crate::endpoint::Endpoint;
use crate::environment::Environment;
use crate::error::{RemoteError, Result};
use crate::socket::Socket;
use crate::stream::Stream;
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

enum Inner {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

/// Listening socket that turns each accepted connection into an opened,
/// selector-registered [`Stream`].
pub struct StreamListener {
    env: Arc<Environment>,
    inner: Inner,
}

impl StreamListener {
    /// Bind to `endpoint`. TCP port `0` picks a free port; see
    /// [`local_endpoint`](Self::local_endpoint).
    pub fn bind(env: &Arc<Environment>, endpoint: &Endpoint) -> Result<Self> {
        let inner = match endpoint {
            Endpoint::Tcp(addr) => TcpListener::bind(addr).map(Inner::Tcp),
            Endpoint::Unix(path) => {
                UnixListener::bind(path).map(|l| Inner::Unix(l, path.clone()))
            }
        }
        .map_err(|e| RemoteError::Connection(format!("bind {}: {}", endpoint, e)))?;

        debug!(%endpoint, "listening");
        Ok(Self {
            env: Arc::clone(env),
            inner,
        })
    }

    /// Address actually bound.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match &self.inner {
            Inner::Tcp(l) => Ok(Endpoint::Tcp(l.local_addr()?)),
            Inner::Unix(_, path) => Ok(Endpoint::Unix(path.clone())),
        }
    }

    /// Block until a peer connects, then open the stream and hand it to the
    /// environment's selector.
    ///
    /// The environment keeps the stream alive until it closes, so the
    /// returned handle may be dropped.
    pub fn accept(&self) -> Result<Arc<Stream>> {
        if self.env.is_shutdown() {
            return Err(RemoteError::ShutdownInProgress);
        }
        let socket = match &self.inner {
            Inner::Tcp(l) => l.accept().and_then(|(s, _)| Socket::from_std_tcp(s)),
            Inner::Unix(l, _) => l.accept().and_then(|(s, _)| Socket::from_std_unix(s)),
        }
        .map_err(|e| RemoteError::Connection(format!("accept: {}", e)))?;

        let stream = Stream::with_socket(&self.env, socket);
        stream.open()?;
        // Owned before registration: the selector may close it right away.
        self.env.adopt(&stream);
        if let Err(e) = self.env.selector().register_stream(&stream) {
            let _ = stream.close();
            return Err(e);
        }
        Ok(stream)
    }
}

impl Drop for StreamListener {
    fn drop(&mut self) {
        if let Inner::Unix(_, path) = &self.inner {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to remove socket file");
            }
        }
    }
}
