use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::addr::StreamAddr;
use crate::error::{Result, TransportError};
use crate::stream::{StreamInterrupter, TwoWayStream};

/// TCP transport: bind/accept/connect over `std::net`.
///
/// This is the generic initial transport every remote connection starts
/// on; carriers may later bootstrap into something more specialized.
pub struct TcpTransport {
    listener: TcpListener,
    local: SocketAddr,
}

impl TcpTransport {
    /// Bind and listen on `host:port`. Port 0 picks an ephemeral port.
    pub fn bind(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let listener = TcpListener::bind(&addr).map_err(|e| TransportError::Bind {
            addr: addr.clone(),
            source: e,
        })?;
        let local = listener.local_addr().map_err(|e| TransportError::Bind {
            addr: addr.clone(),
            source: e,
        })?;
        info!(%local, "listening on tcp");
        Ok(Self { listener, local })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<TcpTwoWayStream> {
        let (stream, remote) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(%remote, "accepted tcp connection");
        TcpTwoWayStream::from_stream(stream)
    }

    /// Connect to a listening endpoint (blocking).
    pub fn connect(host: &str, port: u16) -> Result<TcpTwoWayStream> {
        Self::connect_timeout(host, port, None)
    }

    /// Connect with an optional connect timeout.
    pub fn connect_timeout(
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<TcpTwoWayStream> {
        let addr = format!("{host}:{port}");
        let stream = match timeout {
            None => TcpStream::connect(&addr).map_err(|e| TransportError::Connect {
                addr: addr.clone(),
                source: e,
            })?,
            Some(limit) => {
                let resolved = addr
                    .to_socket_addrs()
                    .map_err(|e| TransportError::Connect {
                        addr: addr.clone(),
                        source: e,
                    })?
                    .next()
                    .ok_or_else(|| TransportError::Connect {
                        addr: addr.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::AddrNotAvailable,
                            "address did not resolve",
                        ),
                    })?;
                TcpStream::connect_timeout(&resolved, limit).map_err(|e| {
                    TransportError::Connect {
                        addr: addr.clone(),
                        source: e,
                    }
                })?
            }
        };
        debug!(%addr, "connected");
        TcpTwoWayStream::from_stream(stream)
    }

    /// The address this transport is bound to.
    pub fn local_address(&self) -> StreamAddr {
        StreamAddr::from(self.local)
    }
}

struct TcpShutdown {
    stream: TcpStream,
    closed: AtomicBool,
}

impl TcpShutdown {
    fn shut_down(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct TcpInterrupter(Arc<TcpShutdown>);

impl StreamInterrupter for TcpInterrupter {
    fn interrupt(&self) {
        self.0.shut_down();
    }
}

/// A connected TCP stream implementing [`TwoWayStream`].
pub struct TcpTwoWayStream {
    stream: TcpStream,
    shutdown: Arc<TcpShutdown>,
}

impl TcpTwoWayStream {
    /// Wrap an already-connected socket.
    ///
    /// Clones the handle eagerly so an interrupter is always available,
    /// even after the stream itself has been moved into a connection.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let clone = stream.try_clone()?;
        Ok(Self {
            stream,
            shutdown: Arc::new(TcpShutdown {
                stream: clone,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

impl Read for TcpTwoWayStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.shutdown.is_closed() {
            return Ok(0);
        }
        self.stream.read(buf)
    }
}

impl Write for TcpTwoWayStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.shutdown.is_closed() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "stream closed",
            ));
        }
        self.stream.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

impl TwoWayStream for TcpTwoWayStream {
    fn is_ok(&self) -> bool {
        !self.shutdown.is_closed()
    }

    fn close(&mut self) {
        self.shutdown.shut_down();
    }

    fn local_address(&self) -> StreamAddr {
        self.stream
            .local_addr()
            .map(StreamAddr::from)
            .unwrap_or_else(|_| StreamAddr::invalid())
    }

    fn remote_address(&self) -> StreamAddr {
        self.stream
            .peer_addr()
            .map(StreamAddr::from)
            .unwrap_or_else(|_| StreamAddr::invalid())
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    fn interrupter(&self) -> Box<dyn StreamInterrupter> {
        Box::new(TcpInterrupter(Arc::clone(&self.shutdown)))
    }
}

impl Drop for TcpTwoWayStream {
    fn drop(&mut self) {
        self.close();
    }
}
