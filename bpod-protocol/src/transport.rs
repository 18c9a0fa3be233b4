//! Byte-stream transports.
//!
//! The driver never touches a serial port directly. It talks to a
//! [`Transport`], which only has to move bytes: the fixed-width framing and
//! underrun detection live in [`crate::codec`].

use bytes::{Bytes, BytesMut};
use std::io;

/// A bidirectional byte stream to the device.
pub trait Transport {
    /// Number of bytes that can be read without blocking.
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Reads up to `n` bytes. A read that times out returns fewer bytes
    /// than requested instead of failing.
    fn read_bytes(&mut self, n: usize) -> io::Result<Bytes>;

    /// Writes all of `bytes`.
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Flushes buffered output.
    fn flush(&mut self) -> io::Result<()>;

    /// Releases the underlying stream.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn bytes_available(&mut self) -> io::Result<usize> {
        (**self).bytes_available()
    }

    fn read_bytes(&mut self, n: usize) -> io::Result<Bytes> {
        (**self).read_bytes(n)
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn bytes_available(&mut self) -> io::Result<usize> {
        (**self).bytes_available()
    }

    fn read_bytes(&mut self, n: usize) -> io::Result<Bytes> {
        (**self).read_bytes(n)
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// In-memory transport fed from a script of device bytes.
///
/// Everything the host writes is captured so tests (and offline replays)
/// can assert on the exact bytes that would have gone over the wire.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    incoming: BytesMut,
    written: BytesMut,
    closed: bool,
    flushes: usize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport that will answer reads with `data`.
    pub fn with_incoming(data: &[u8]) -> Self {
        let mut transport = Self::new();
        transport.push_incoming(data);
        transport
    }

    /// Queues more device bytes.
    pub fn push_incoming(&mut self, data: &[u8]) {
        self.incoming.extend_from_slice(data);
    }

    /// Bytes written by the host so far.
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// Takes and clears the bytes written by the host so far.
    pub fn take_written(&mut self) -> Bytes {
        self.written.split().freeze()
    }

    /// Device bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.incoming.len()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "memory transport closed",
            ));
        }
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn bytes_available(&mut self) -> io::Result<usize> {
        self.ensure_open()?;
        Ok(self.incoming.len())
    }

    fn read_bytes(&mut self, n: usize) -> io::Result<Bytes> {
        self.ensure_open()?;
        let n = n.min(self.incoming.len());
        Ok(self.incoming.split_to(n).freeze())
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.ensure_open()?;
        self.written.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        self.flushes += 1;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}
