//! Byte stream transport underneath an association.
//!
//! Reads and writes take `&self`
//! so that one thread may block on a read
//! while another one writes to the same connection.
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// A connection-oriented byte stream carrying the PDUs of one association.
///
/// Implemented for [`TcpStream`].
/// Other transports (such as TLS sessions)
/// can be plugged in by implementing this trait.
pub trait Transport: Send + Sync + 'static {
    /// Read some bytes from the stream,
    /// returning 0 at the end of the stream.
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Write all bytes to the stream.
    fn write_all(&self, buf: &[u8]) -> std::io::Result<()>;

    /// Define how long a read may block.
    /// `None` blocks indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;

    /// Close the stream in both directions.
    fn shutdown(&self) -> std::io::Result<()>;
}

impl Transport for TcpStream {
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut stream: &TcpStream = self;
        Read::read(&mut stream, buf)
    }

    fn write_all(&self, buf: &[u8]) -> std::io::Result<()> {
        let mut stream: &TcpStream = self;
        Write::write_all(&mut stream, buf)?;
        Write::flush(&mut stream)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        // a zero duration is refused by the socket API
        let timeout = timeout.filter(|t| !t.is_zero());
        TcpStream::set_read_timeout(self, timeout)
    }

    fn shutdown(&self) -> std::io::Result<()> {
        match TcpStream::shutdown(self, Shutdown::Both) {
            // the peer got there first
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Adapter from a transport to [`std::io::Read`].
pub(crate) struct TransportReader<'a>(pub(crate) &'a dyn Transport);

impl Read for TransportReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn tcp_transport_reads_and_writes_concurrently() {
        let listener = TcpListener::bind("localhost:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            let mut filled = 0;
            while filled < 4 {
                filled += Transport::read(&stream, &mut buf[filled..]).unwrap();
            }
            Transport::write_all(&stream, &buf).unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        Transport::set_read_timeout(&stream, Some(Duration::from_secs(5))).unwrap();
        Transport::write_all(&stream, b"ping").unwrap();
        let mut reader = TransportReader(&stream);
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        handle.join().unwrap();
        Transport::shutdown(&stream).unwrap();
    }
}
