//! Serial port transport.

use crate::transport::Transport;
use bytes::{Bytes, BytesMut};
use std::io::{self, Read, Write};
use std::time::Duration;

/// Transport over a USB serial port.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    /// Opens `port_name` at `baud_rate`. Reads give up after `timeout`.
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> io::Result<Self> {
        tracing::debug!("Opening serial port {} at {} baud", port_name, baud_rate);
        let port = serialport::new(port_name, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(io::Error::from)?;
        Ok(Self { port })
    }

    /// Lists the serial ports visible to the host.
    pub fn list_ports() -> Vec<String> {
        serialport::available_ports()
            .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
            .unwrap_or_default()
    }
}

impl Transport for SerialTransport {
    fn bytes_available(&mut self) -> io::Result<usize> {
        let n = self.port.bytes_to_read().map_err(io::Error::from)?;
        Ok(n as usize)
    }

    fn read_bytes(&mut self, n: usize) -> io::Result<Bytes> {
        let mut buf = BytesMut::zeroed(n);
        let mut filled = 0;
        while filled < n {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(buf.freeze())
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}
