//! Scoped ownership of one serial line, plus an in-memory stand-in.
//!
//! A transport is single-owner: the motor bus serializes every
//! write/read exchange behind a mutex, so no two frames ever interleave
//! on the wire. `read_once` returns the next incoming chunk in one shot
//! and never accumulates across calls; `clear_input` drops whatever a
//! previous, timed-out exchange may have left behind so late packets
//! cannot be mis-attributed to the next one.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};

use crate::error::{Error, Result};

/// Feetech bus line rate.
pub const BAUD_RATE: u32 = 1_000_000;

/// One open serial line. `Send` so engines can carry it into a worker
/// thread.
pub trait Transport: Send {
    /// Write the whole buffer or fail.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for the next incoming chunk and return it.
    fn read_once(&mut self, timeout: Duration) -> Result<Vec<u8>>;

    /// Drop any buffered incoming bytes.
    fn clear_input(&mut self) -> Result<()>;

    /// Release the line. Idempotent; later calls on a closed transport
    /// fail with a transport error.
    fn close(&mut self);
}

/// Shared handle used by the bus and engines. The mutex is what makes
/// bus operations on one connection strictly ordered.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

pub fn share(transport: Box<dyn Transport>) -> SharedTransport {
    Arc::new(Mutex::new(transport))
}

// ── Real serial line ──

/// Transport over a physical serial port at 1 000 000 baud 8-N-1.
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    path: String,
}

impl SerialTransport {
    /// Open `path` with the Feetech line settings.
    pub fn open(path: &str) -> Result<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_millis(100))
            .open()?;
        Ok(Self {
            port: Some(port),
            path: path.to_string(),
        })
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::Transport(format!("port {} is closed", self.path)))
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port()?;
        port.write_all(bytes)
            .map_err(|e| Error::Transport(format!("serial write failed: {e}")))?;
        port.flush()
            .map_err(|e| Error::Transport(format!("serial flush failed: {e}")))
    }

    fn read_once(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let port = self.port()?;
        port.set_timeout(timeout)
            .map_err(|e| Error::Transport(e.to_string()))?;
        let mut buf = [0u8; 256];
        match port.read(&mut buf) {
            Ok(0) => Err(Error::Timeout),
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(Error::Timeout),
            Err(e) => Err(Error::Transport(format!("serial read failed: {e}"))),
        }
    }

    fn clear_input(&mut self) -> Result<()> {
        self.port()?
            .clear(ClearBuffer::Input)
            .map_err(|e| Error::Transport(e.to_string()))
    }

    fn close(&mut self) {
        // Dropping the handle releases the OS file descriptor.
        self.port.take();
    }
}

// ── In-memory stand-in ──

/// Scripted responder: called with every written frame, returns the
/// response bytes the fake servo puts on the line (or `None` for
/// silence).
pub type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// In-memory transport for hosts and tests running without hardware.
///
/// Every write is recorded and handed to the responder; whatever the
/// responder returns is queued for the next `read_once`. An empty queue
/// reads as an immediate timeout.
pub struct MockTransport {
    responder: Responder,
    inbox: VecDeque<Vec<u8>>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: bool,
}

impl MockTransport {
    pub fn new(responder: Responder) -> Self {
        Self {
            responder,
            inbox: VecDeque::new(),
            writes: Arc::new(Mutex::new(Vec::new())),
            closed: false,
        }
    }

    /// A transport whose servos never answer anything.
    pub fn silent() -> Self {
        Self::new(Box::new(|_| None))
    }

    /// Handle onto the log of every frame written so far. Clone it
    /// before handing the transport to an engine.
    pub fn writes(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.writes)
    }

    /// Number of response chunks queued but not yet read. Zero after a
    /// completed bus operation — stale responses must never survive a
    /// call.
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }
}

impl Transport for MockTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Transport("mock port is closed".into()));
        }
        self.writes
            .lock()
            .expect("mock write log poisoned")
            .push(bytes.to_vec());
        if let Some(response) = (self.responder)(bytes) {
            self.inbox.push_back(response);
        }
        Ok(())
    }

    fn read_once(&mut self, _timeout: Duration) -> Result<Vec<u8>> {
        if self.closed {
            return Err(Error::Transport("mock port is closed".into()));
        }
        self.inbox.pop_front().ok_or(Error::Timeout)
    }

    fn clear_input(&mut self) -> Result<()> {
        self.inbox.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
        self.inbox.clear();
    }
}
