//! Byte transports
//!
//! The link layer only needs an ordered byte stream with bounded blocking
//! reads; everything else about the medium stays behind [`Transport`]. Two
//! implementations ship here: a serial port and a TCP socket (for devices
//! bridged over the network), but the simulator and test doubles implement
//! the same trait.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serialport::SerialPort;

/// An unreliable, order-preserving byte stream to the device.
///
/// The protocol engine owns its transport exclusively and drives it with
/// blocking reads bounded by [`set_timeout`](Transport::set_timeout).
pub trait Transport: Read + Write + Send {
    /// Set the timeout for blocking read/write operations.
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discard any bytes received but not yet read.
    fn clear_input(&mut self) -> io::Result<()>;

    /// Discard any bytes written but not yet transmitted.
    fn clear_output(&mut self) -> io::Result<()>;

    /// Number of bytes available to read without blocking.
    fn bytes_to_read(&mut self) -> io::Result<u32>;
}

fn to_io(e: serialport::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

/// [`Transport`] over a serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Wrap an already-open serial port.
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Transport for SerialTransport {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(to_io)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(to_io)
    }

    fn clear_output(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Output)
            .map_err(to_io)
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port.bytes_to_read().map_err(to_io)
    }
}

/// [`Transport`] over a TCP socket.
///
/// Sockets have no discard-buffer syscall and no byte count, so
/// `clear_input` drains with non-blocking reads and `bytes_to_read` peeks.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Wrap a connected TCP stream.
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Run `body` with the socket in non-blocking mode, restoring blocking
    /// mode afterwards even when `body` fails.
    fn nonblocking<T>(
        &mut self,
        body: impl FnOnce(&mut TcpStream) -> io::Result<T>,
    ) -> io::Result<T> {
        self.stream.set_nonblocking(true)?;
        let result = body(&mut self.stream);
        let restored = self.stream.set_nonblocking(false);
        let value = result?;
        restored?;
        Ok(value)
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for TcpTransport {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.stream.set_read_timeout(Some(timeout))?;
        self.stream.set_write_timeout(Some(timeout))?;
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.nonblocking(|stream| {
            let mut sink = [0u8; 1024];
            loop {
                match stream.read(&mut sink) {
                    Ok(0) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        })
    }

    fn clear_output(&mut self) -> io::Result<()> {
        self.stream.flush()
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.nonblocking(|stream| {
            // peek returns min(available, buffer), which is enough for the
            // pump loop's read sizing
            let mut probe = [0u8; 8192];
            match stream.peek(&mut probe) {
                Ok(n) => Ok(n as u32),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(e),
            }
        })
    }
}
