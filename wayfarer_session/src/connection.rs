// Connection management: TCP streams carrying length-prefixed frames.
//
// `connect` dials a host; `listen` binds a `Listener` whose `accept` hands
// out inbound `Connection`s, at most `max_inbound` alive at once. A
// `Connection` sends and receives whole frames (see
// `wayfarer_protocol::framing`) and can be split into a `ConnectionReader`
// for a dedicated reader thread and a `ConnectionWriter` kept by whoever
// serializes outbound traffic. The two halves share one socket; closing the
// writer shuts the socket down in both directions, which wakes the reader
// with `ConnectionError::Closed`.
//
// Every error that means "the other side is gone" (clean EOF, reset, broken
// pipe) surfaces as `ConnectionError::Closed`. `close()` is idempotent.

use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use wayfarer_protocol::framing::{read_frame, write_frame};

use crate::error::ConnectionError;

/// Dial `host:port`.
pub fn connect(host: &str, port: u16) -> Result<Connection, ConnectionError> {
    let stream = TcpStream::connect((host, port))?;
    Connection::from_stream(stream, None)
}

/// Bind a listener. `port` 0 picks a free port.
pub fn listen(bind_address: &str, port: u16, max_inbound: usize) -> io::Result<Listener> {
    let inner = TcpListener::bind((bind_address, port))?;
    Ok(Listener {
        inner,
        active: Arc::new(AtomicUsize::new(0)),
        max_inbound,
    })
}

/// Releases one inbound slot when the last half of a connection drops.
#[derive(Debug)]
struct SlotGuard(Arc<AtomicUsize>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Listener {
    inner: TcpListener,
    active: Arc<AtomicUsize>,
    max_inbound: usize,
}

impl Listener {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.inner.set_nonblocking(nonblocking)
    }

    /// Number of inbound connections currently alive.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Accept one connection. Over the inbound limit the stream is closed
    /// straight away and `AtCapacity` returned. In non-blocking mode an idle
    /// listener yields `Io` with `ErrorKind::WouldBlock`.
    pub fn accept(&self) -> Result<Connection, ConnectionError> {
        let (stream, addr) = self.inner.accept()?;
        let reserved = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_inbound).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            log::warn!("refusing connection from {addr}: {} inbound already", self.max_inbound);
            let _ = stream.shutdown(Shutdown::Both);
            return Err(ConnectionError::AtCapacity {
                max: self.max_inbound,
            });
        }
        let slot = Arc::new(SlotGuard(self.active.clone()));
        // Accepted sockets may inherit non-blocking mode from the listener.
        stream.set_nonblocking(false)?;
        Connection::from_stream(stream, Some(slot))
    }
}

/// A framed, bidirectional connection.
pub struct Connection {
    reader: ConnectionReader,
    writer: ConnectionWriter,
}

impl Connection {
    fn from_stream(
        stream: TcpStream,
        slot: Option<Arc<SlotGuard>>,
    ) -> Result<Self, ConnectionError> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let read_half = stream.try_clone()?;
        Ok(Self {
            reader: ConnectionReader {
                reader: BufReader::new(read_half),
                peer_addr,
                _slot: slot.clone(),
            },
            writer: ConnectionWriter {
                writer: BufWriter::new(stream),
                peer_addr,
                closed: false,
                _slot: slot,
            },
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.writer.peer_addr
    }

    pub fn send(&mut self, frame: &[u8]) -> Result<(), ConnectionError> {
        self.writer.send(frame)
    }

    pub fn receive(&mut self) -> Result<Vec<u8>, ConnectionError> {
        if self.writer.closed {
            return Err(ConnectionError::Closed);
        }
        self.reader.receive()
    }

    /// Bound how long `receive` may block. `None` blocks indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), ConnectionError> {
        self.reader.reader.get_ref().set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn close(&mut self) {
        self.writer.close();
    }

    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        (self.reader, self.writer)
    }
}

/// Read half of a `Connection`.
pub struct ConnectionReader {
    reader: BufReader<TcpStream>,
    peer_addr: SocketAddr,
    _slot: Option<Arc<SlotGuard>>,
}

impl ConnectionReader {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Block until one full frame arrives.
    pub fn receive(&mut self) -> Result<Vec<u8>, ConnectionError> {
        match read_frame(&mut self.reader) {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(ConnectionError::Closed),
            Err(e) => Err(ConnectionError::from_io(e)),
        }
    }
}

/// Write half of a `Connection`.
pub struct ConnectionWriter {
    writer: BufWriter<TcpStream>,
    peer_addr: SocketAddr,
    closed: bool,
    _slot: Option<Arc<SlotGuard>>,
}

impl ConnectionWriter {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn send(&mut self, frame: &[u8]) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        write_frame(&mut self.writer, frame).map_err(ConnectionError::from_io)
    }

    /// Shut the socket down in both directions. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}
