//! Network transport seam.
//!
//! Replicas and the dispatcher only talk to the network through these
//! traits: accepting connections with a timeout, and connecting with a
//! timeout for liveness probes. [`TcpTransport`] is the real implementation;
//! [`MemoryConnection`] is a scripted connection for exercising request
//! handling without sockets.

use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

/// A bidirectional byte stream to one client.
pub trait Connection: Read + Write + Send {
    /// Human-readable description of the remote end, for logs.
    fn peer(&self) -> String;

    /// Bounds how long a single read may block.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

/// A bound listening endpoint.
pub trait Acceptor: Send {
    /// Waits up to roughly `timeout` for a connection; `Ok(None)` if none arrived.
    fn accept_timeout(&self, timeout: Duration) -> io::Result<Option<Box<dyn Connection>>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

pub trait Transport: Send + Sync {
    fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Acceptor>>;

    fn connect_timeout(&self, addr: SocketAddr, timeout: Duration) -> io::Result<Box<dyn Connection>>;
}

/// Plain TCP sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Acceptor>> {
        let listener = TcpListener::bind(addr)?;
        // Non-blocking so the accept loop can wake up and look at its shutdown flag.
        listener.set_nonblocking(true)?;
        Ok(Box::new(TcpAcceptor { listener }))
    }

    fn connect_timeout(&self, addr: SocketAddr, timeout: Duration) -> io::Result<Box<dyn Connection>> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        Ok(Box::new(stream))
    }
}

struct TcpAcceptor {
    listener: TcpListener,
}

impl Acceptor for TcpAcceptor {
    fn accept_timeout(&self, timeout: Duration) -> io::Result<Option<Box<dyn Connection>>> {
        match self.listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                Ok(Some(Box::new(stream)))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(timeout);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Connection for TcpStream {
    fn peer(&self) -> String {
        self.peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

/// In-memory connection: reads come from a fixed script, writes are captured.
pub struct MemoryConnection {
    input: Cursor<Vec<u8>>,
    output: Arc<Mutex<Vec<u8>>>,
}

impl MemoryConnection {
    /// Returns the connection plus a handle to everything written to it.
    pub fn new(input: impl Into<Vec<u8>>) -> (Self, WrittenBytes) {
        let output = Arc::new(Mutex::new(Vec::new()));
        let connection = Self {
            input: Cursor::new(input.into()),
            output: Arc::clone(&output),
        };
        (connection, WrittenBytes(output))
    }
}

impl Read for MemoryConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for MemoryConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Connection for MemoryConnection {
    fn peer(&self) -> String {
        "memory".to_string()
    }

    fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}

/// Shared view of the bytes written to a [`MemoryConnection`].
#[derive(Clone)]
pub struct WrittenBytes(Arc<Mutex<Vec<u8>>>);

impl WrittenBytes {
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl fmt::Debug for WrittenBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WrittenBytes").field(&self.to_text()).finish()
    }
}
