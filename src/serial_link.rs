//! Buffered, pipelined byte I/O to the programmer's USB-serial link.
//!
//! Mirrors `AsyncSerial` in the original host tool: writes are coalesced
//! into 63-byte flushes, reads are queued and satisfied strictly in FIFO
//! order once enough bytes have arrived, and a `task()` tick drives both.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use crate::Result;

/// Maximum pending-write bytes before a flush is forced.
const FLUSH_THRESHOLD: usize = 63;
/// How long unflushed write data may sit before `task()` flushes it anyway.
const FLUSH_TIMEOUT: Duration = Duration::from_millis(1);

/// A callback fired once its requested byte count has arrived.
pub type ReadCompletion = Box<dyn FnOnce(Vec<u8>)>;

/// Reports how many bytes are available to read without blocking.
///
/// Implemented for `serialport::SerialPort` via `bytes_to_read()`; a
/// `VecDeque<u8>`-backed fake can implement this directly for tests,
/// decoupling `SerialLink`'s tests from any real serial port.
pub trait BytesAvailable {
    fn bytes_available(&mut self) -> std::io::Result<usize>;
}

struct PendingRead {
    n: usize,
    completion: ReadCompletion,
}

/// Buffered, pipelined wrapper around a byte transport.
///
/// Generic over any `Read + Write` transport, following the pattern used
/// throughout the retrieval pack (e.g. firmata-rs's `Board`) of accepting
/// any object implementing the standard I/O traits rather than a concrete
/// serial port type — this lets tests drive the link against an in-memory
/// buffer.
pub struct SerialLink<T: Read + Write + BytesAvailable> {
    pub(crate) port: T,
    pending_write: Vec<u8>,
    pending_reads: VecDeque<PendingRead>,
    last_write: Instant,
}

impl<T: Read + Write + BytesAvailable> SerialLink<T> {
    pub fn new(port: T) -> Self {
        SerialLink {
            port,
            pending_write: Vec::new(),
            pending_reads: VecDeque::new(),
            last_write: Instant::now(),
        }
    }

    /// Append bytes to the pending write buffer, flushing in 63-byte
    /// chunks once the threshold is reached.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.pending_write.extend_from_slice(bytes);
        self.last_write = Instant::now();
        while self.pending_write.len() >= FLUSH_THRESHOLD {
            let rest = self.pending_write.split_off(FLUSH_THRESHOLD);
            let chunk = std::mem::replace(&mut self.pending_write, rest);
            self.port.write_all(&chunk).map_err(crate::JflashError::from)?;
        }
        Ok(())
    }

    /// Enqueue an asynchronous read. Never blocks; the completion fires
    /// from a later `task()` call once enough bytes have arrived.
    pub fn read(&mut self, n: usize, completion: ReadCompletion) {
        self.pending_reads.push_back(PendingRead { n, completion });
    }

    /// Flush writes, then block until `n` bytes are available and invoke
    /// `completion` immediately. This is the `blocking=true` variant of
    /// `read()`.
    pub fn read_blocking(&mut self, n: usize, completion: ReadCompletion) -> Result<()> {
        self.flush()?;
        let mut buf = vec![0u8; n];
        self.port.read_exact(&mut buf).map_err(crate::JflashError::from)?;
        completion(buf);
        Ok(())
    }

    /// Progress tick: services the head of the read queue while enough
    /// bytes are available, drains writes in flush-sized chunks, and
    /// flushes any remaining write data older than the flush timeout.
    /// Returns the outstanding read count plus pending write byte count.
    pub fn task(&mut self) -> Result<usize> {
        while let Some(req) = self.pending_reads.front() {
            let available = self.port.bytes_available().map_err(crate::JflashError::from)?;
            if available < req.n {
                break;
            }
            let req = self.pending_reads.pop_front().unwrap();
            let mut buf = vec![0u8; req.n];
            self.port.read_exact(&mut buf).map_err(crate::JflashError::from)?;
            (req.completion)(buf);
        }

        while self.pending_write.len() >= FLUSH_THRESHOLD {
            let rest = self.pending_write.split_off(FLUSH_THRESHOLD);
            let chunk = std::mem::replace(&mut self.pending_write, rest);
            self.port.write_all(&chunk).map_err(crate::JflashError::from)?;
        }

        let expired = self.last_write.elapsed() >= FLUSH_TIMEOUT;
        if expired && !self.pending_write.is_empty() {
            self.flush()?;
        }

        Ok(self.pending_reads.len() + self.pending_write.len())
    }

    /// Synchronously transmit all pending write bytes.
    pub fn flush(&mut self) -> Result<()> {
        if !self.pending_write.is_empty() {
            let data = std::mem::take(&mut self.pending_write);
            self.port.write_all(&data).map_err(crate::JflashError::from)?;
        }
        self.port.flush().map_err(crate::JflashError::from)?;
        Ok(())
    }

    pub fn pending_reads(&self) -> usize {
        self.pending_reads.len()
    }
}

impl BytesAvailable for Box<dyn serialport::SerialPort> {
    fn bytes_available(&mut self) -> std::io::Result<usize> {
        self.bytes_to_read().map(|n| n as usize).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, e)
        })
    }
}

/// In-memory stand-in for a serial port, used by this crate's own unit
/// tests and exported for downstream integration tests (`tests/`) that
/// need to drive a `Programmer`/`JtagOps`/`DeviceSequencer` without a
/// real device attached.
pub mod test_support {
    use super::BytesAvailable;
    use std::collections::VecDeque;
    use std::io::{Read, Write};

    /// An in-memory stand-in for the serial port: bytes written by the
    /// link land in `written`, and bytes queued in `to_read` are what
    /// `read`/`bytes_available` see, modelling a loopback-free firmware
    /// peer.
    #[derive(Default)]
    pub struct FakePort {
        pub written: Vec<u8>,
        pub to_read: VecDeque<u8>,
    }

    impl Read for FakePort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.to_read.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.to_read.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for FakePort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl BytesAvailable for FakePort {
        fn bytes_available(&mut self) -> std::io::Result<usize> {
            Ok(self.to_read.len())
        }
    }
}
