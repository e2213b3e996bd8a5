//! Non-blocking connection owned by a stream

use crate::endpoint::Endpoint;
use mio::event::Source;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::PathBuf;
use std::time::Duration;

/// Connected TCP or unix-domain socket in non-blocking mode.
#[derive(Debug)]
pub enum Socket {
    /// TCP connection
    Tcp(mio::net::TcpStream),
    /// Unix-domain connection
    Unix(mio::net::UnixStream),
}

impl Socket {
    /// Connect to `endpoint`, blocking for at most `timeout`.
    pub fn connect(endpoint: &Endpoint, timeout: Duration) -> io::Result<Socket> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = StdTcpStream::connect_timeout(addr, timeout)?;
                Self::from_std_tcp(stream)
            }
            Endpoint::Unix(path) => Self::from_std_unix(StdUnixStream::connect(path)?),
        }
    }

    /// Adopt an accepted or connected std TCP stream.
    pub fn from_std_tcp(stream: StdTcpStream) -> io::Result<Socket> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Socket::Tcp(mio::net::TcpStream::from_std(stream)))
    }

    /// Adopt an accepted or connected std unix stream.
    pub fn from_std_unix(stream: StdUnixStream) -> io::Result<Socket> {
        stream.set_nonblocking(true)?;
        Ok(Socket::Unix(mio::net::UnixStream::from_std(stream)))
    }

    /// Local address.
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Socket::Tcp(s) => s.local_addr().map(Endpoint::Tcp),
            Socket::Unix(s) => s.local_addr().map(|a| unix_endpoint(a.as_pathname())),
        }
    }

    /// Peer address.
    pub fn peer_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Socket::Tcp(s) => s.peer_addr().map(Endpoint::Tcp),
            Socket::Unix(s) => s.peer_addr().map(|a| unix_endpoint(a.as_pathname())),
        }
    }

    /// Pending socket error (SO_ERROR), if any.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Socket::Tcp(s) => s.take_error(),
            Socket::Unix(s) => s.take_error(),
        }
    }
}

fn unix_endpoint(path: Option<&std::path::Path>) -> Endpoint {
    Endpoint::Unix(path.map(PathBuf::from).unwrap_or_default())
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Socket::Tcp(s) => s.as_raw_fd(),
            Socket::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.read(buf),
            Socket::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.write(buf),
            Socket::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.flush(),
            Socket::Unix(s) => s.flush(),
        }
    }
}

impl Source for Socket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.register(registry, token, interests),
            Socket::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.reregister(registry, token, interests),
            Socket::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.deregister(registry),
            Socket::Unix(s) => s.deregister(registry),
        }
    }
}
