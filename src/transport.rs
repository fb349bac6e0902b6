//! Byte-stream transport seam under the multiplexer.
//!
//! The multiplexer only needs a reliable, bidirectional byte stream. This
//! trait narrows an underlying socket or pipe to exactly that, with `&self`
//! methods so one transport can be shared between the receive loop and
//! concurrent senders.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use crate::pipe::BufferedPipe;

/// A reliable bidirectional byte stream.
pub trait Transport: Send + Sync {
    /// Receive some bytes. `Ok(0)` means the peer is gone.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send some bytes, returning how many were accepted.
    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Close both directions.
    fn close(&self) -> io::Result<()>;

    /// Send the whole buffer.
    fn send_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.send(buf)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "transport accepted no bytes",
                ));
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).recv(buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).send(buf)
    }

    fn close(&self) -> io::Result<()> {
        (**self).close()
    }
}

impl Transport for TcpStream {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self;
        stream.read(buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let mut stream = self;
        stream.write(buf)
    }

    fn close(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

// =============================================================================
// Mock transport (for testing)
// =============================================================================

/// In-memory full-duplex byte stream. `MockTransport::pair` returns the two
/// ends of one link; closing either end kills both directions, so a blocked
/// peer read observes EOF and further sends fail.
pub struct MockTransport {
    name: String,
    outbound: Arc<BufferedPipe>,
    inbound: Arc<BufferedPipe>,
}

impl MockTransport {
    /// Create both ends of an in-memory link.
    pub fn pair(left: &str, right: &str) -> (MockTransport, MockTransport) {
        let l_to_r = Arc::new(BufferedPipe::new());
        let r_to_l = Arc::new(BufferedPipe::new());
        (
            MockTransport {
                name: left.to_string(),
                outbound: Arc::clone(&l_to_r),
                inbound: Arc::clone(&r_to_l),
            },
            MockTransport {
                name: right.to_string(),
                outbound: r_to_l,
                inbound: l_to_r,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Transport for MockTransport {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // The inbound pipe has no read deadline set, so the only outcomes
        // are bytes or EOF.
        match self.inbound.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => Err(io::Error::new(io::ErrorKind::TimedOut, e)),
        }
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.outbound
            .write(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }

    fn close(&self) -> io::Result<()> {
        self.outbound.close_write();
        self.inbound.close_write();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_pair_send_recv() {
        let (a, b) = MockTransport::pair("a", "b");
        a.send_all(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        b.send_all(b"reply").unwrap();
        let n = a.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"reply");
    }

    #[test]
    fn test_recv_blocks_until_send() {
        let (a, b) = MockTransport::pair("a", "b");
        let sender = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            a.send_all(b"x").unwrap();
            a
        });
        let mut buf = [0u8; 4];
        assert_eq!(b.recv(&mut buf).unwrap(), 1);
        sender.join().unwrap();
    }

    #[test]
    fn test_partial_recv() {
        let (a, b) = MockTransport::pair("a", "b");
        a.send_all(b"0123456789").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(b.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(b.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"4567");
        assert_eq!(b.recv(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
    }

    #[test]
    fn test_close_gives_peer_eof() {
        let (a, b) = MockTransport::pair("a", "b");
        a.send_all(b"bye").unwrap();
        a.close().unwrap();

        let mut buf = [0u8; 16];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"bye");
        assert_eq!(b.recv(&mut buf).unwrap(), 0);

        assert!(b.send(b"x").is_err());
        assert!(a.send(b"x").is_err());
        assert_eq!(a.recv(&mut buf).unwrap(), 0);
    }
}
