//! A channel: one flow-controlled, bidirectional sub-connection inside a
//! multiplexed link.
//!
//! Writers reserve credit from the write window under the channel lock,
//! then emit Data frames through the multiplexer's serialised send with the
//! lock released, so a window update from the receive loop can always make
//! progress. Readers drain the channel's buffered pipe and grant the peer
//! fresh credit once less than half the window remains.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use thiserror::Error;
use tracing::debug;

use crate::frame::{Destination, Frame};
use crate::mux::MuxShared;
use crate::pipe::{BufferedPipe, PipeError};
use crate::window::{WindowState, DEFAULT_WINDOW_SIZE};

/// Channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel is closed in the direction being used.
    #[error("channel closed")]
    Closed,
    /// A read or write deadline expired.
    #[error("deadline exceeded")]
    Timeout,
    /// The underlying link failed.
    #[error("link error: {0}")]
    Io(#[from] io::Error),
}

impl From<PipeError> for ChannelError {
    fn from(e: PipeError) -> Self {
        match e {
            PipeError::Closed => ChannelError::Closed,
            PipeError::Timeout => ChannelError::Timeout,
        }
    }
}

impl From<ChannelError> for io::Error {
    fn from(e: ChannelError) -> io::Error {
        match e {
            ChannelError::Closed => io::Error::new(io::ErrorKind::UnexpectedEof, "channel closed"),
            ChannelError::Timeout => io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"),
            ChannelError::Io(inner) => inner,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;

struct ChannelState {
    read: WindowState,
    write: WindowState,
    close_received: bool,
    close_sent: bool,
    shutdown_sent: bool,
    write_deadline: Option<Instant>,
    // Lets tests exercise the misbehaving-peer path where Data follows a
    // Shutdown on the wire.
    allow_data_after_shutdown: bool,
}

pub(crate) struct ChannelShared {
    id: u32,
    destination: Destination,
    mux: Arc<MuxShared>,
    state: Mutex<ChannelState>,
    wake: Condvar,
    read_pipe: BufferedPipe,
}

/// Handle to one channel. Clones share the same underlying channel, and
/// any number of them may read, write and close concurrently.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("destination", &self.shared.destination)
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(mux: Arc<MuxShared>, id: u32, destination: Destination) -> Channel {
        Channel {
            shared: Arc::new(ChannelShared {
                id,
                destination,
                mux,
                state: Mutex::new(ChannelState {
                    read: WindowState::new(DEFAULT_WINDOW_SIZE),
                    write: WindowState::new(DEFAULT_WINDOW_SIZE),
                    close_received: false,
                    close_sent: false,
                    shutdown_sent: false,
                    write_deadline: None,
                    allow_data_after_shutdown: false,
                }),
                wake: Condvar::new(),
                read_pipe: BufferedPipe::new(),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn destination(&self) -> &Destination {
        &self.shared.destination
    }

    pub fn remote_addr(&self) -> Destination {
        self.shared.destination.clone()
    }

    /// There is no distinct local address on a multiplexed link.
    pub fn local_addr(&self) -> Destination {
        self.remote_addr()
    }

    /// Read received bytes. Blocks until data arrives, the read side is
    /// closed (`Ok(0)` after draining), or the read deadline expires.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let result = self.shared.read_pipe.read(buf);
        if let Ok(n) = result {
            let need_update = {
                let mut st = self.shared.state.lock().unwrap();
                st.read.current += n as u64;
                st.read.is_almost_closed()
            };
            if need_update {
                // An opportunistic refresh; if the link is broken the
                // receive loop will notice and tear the channel down.
                if let Err(e) = self.send_window_update() {
                    debug!(id = self.shared.id, error = %e, "dropping window refresh");
                }
            }
        }
        result.map_err(ChannelError::from)
    }

    /// Write bytes to the peer, blocking on window credit. Returns the
    /// short count if the channel closes or the write deadline expires
    /// after partial progress; `Err` only when nothing was written.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let sh = &self.shared;
        let mut written = 0usize;
        let mut st = sh.state.lock().unwrap();
        loop {
            if written == data.len() {
                return Ok(written);
            }
            if st.close_received || st.close_sent || (st.shutdown_sent && !st.allow_data_after_shutdown)
            {
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(ChannelError::Closed)
                };
            }
            let space = st.write.size();
            if space > 0 {
                let take = (data.len() - written).min(space as usize);
                // Reserve the credit before dropping the lock so a
                // concurrent writer cannot claim the same space.
                st.write.current += take as u64;
                drop(st);
                let result = sh.mux.send(&Frame::data(sh.id, take as u32), &data[written..written + take]);
                st = sh.state.lock().unwrap();
                if let Err(e) = result {
                    return if written > 0 {
                        Ok(written)
                    } else {
                        Err(ChannelError::Io(e))
                    };
                }
                written += take;
                continue;
            }

            // No credit. Wait for a window update, a close, or the
            // deadline, whichever comes first.
            match st.write_deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        return if written > 0 {
                            Ok(written)
                        } else {
                            Err(ChannelError::Timeout)
                        };
                    }
                    let (guard, _) = sh.wake.wait_timeout(st, deadline - now).unwrap();
                    st = guard;
                }
                None => st = sh.wake.wait(st).unwrap(),
            }
        }
    }

    /// Close the channel in both directions. Idempotent; only the first
    /// call emits a Close frame.
    pub fn close(&self) -> Result<()> {
        let already_closed = {
            let mut st = self.shared.state.lock().unwrap();
            let already = st.close_sent;
            st.close_sent = true;
            already
        };
        if already_closed {
            return Ok(());
        }
        self.shared.mux.send(&Frame::close(self.shared.id), &[])?;
        self.shared.read_pipe.close_write();
        self.shared.wake.notify_all();
        self.shared.mux.decr_channel_ref(self.shared.id);
        Ok(())
    }

    /// Stop reading. The peer may keep sending; those bytes are discarded
    /// by the receive loop. No frame is emitted.
    pub fn close_read(&self) -> Result<()> {
        self.shared.read_pipe.close_write();
        Ok(())
    }

    /// Half-close: promise the peer no more data in our direction.
    /// Idempotent, and a no-op after `close`.
    pub fn close_write(&self) -> Result<()> {
        let already_shutdown = {
            let mut st = self.shared.state.lock().unwrap();
            let already = st.shutdown_sent || st.close_sent;
            st.shutdown_sent = true;
            already
        };
        if already_shutdown {
            return Ok(());
        }
        self.shared.mux.send(&Frame::shutdown(self.shared.id), &[])?;
        self.shared.wake.notify_all();
        Ok(())
    }

    /// Maximum bytes buffered for reading; the peer receives the new size
    /// as credit on the next window refresh.
    pub fn set_read_buffer(&self, bytes: u64) {
        let mut st = self.shared.state.lock().unwrap();
        st.read.max = bytes;
    }

    pub fn set_write_buffer(&self, bytes: u64) {
        let mut st = self.shared.state.lock().unwrap();
        st.write.max = bytes;
    }

    /// Absolute read deadline; `None` disables.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.shared.read_pipe.set_read_deadline(deadline);
    }

    /// Absolute write deadline; `None` disables. Applies to writes already
    /// blocked on window credit.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        let mut st = self.shared.state.lock().unwrap();
        st.write_deadline = deadline;
        self.shared.wake.notify_all();
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Grant the peer a fresh window of credit for its writes.
    pub(crate) fn send_window_update(&self) -> io::Result<()> {
        let seq = {
            let mut st = self.shared.state.lock().unwrap();
            st.read.advance();
            st.read.allowed
        };
        self.shared.mux.send(&Frame::window(self.shared.id, seq), &[])
    }

    /// Receive-loop entry: the peer raised our write allowance.
    pub(crate) fn recv_window_update(&self, seq: u64) {
        let mut st = self.shared.state.lock().unwrap();
        st.write.allowed = seq;
        // Several writers may be parked on the window; wake them all.
        self.shared.wake.notify_all();
    }

    /// Receive-loop entry: the peer closed the channel.
    pub(crate) fn recv_close(&self) {
        let mut st = self.shared.state.lock().unwrap();
        st.close_received = true;
        self.shared.wake.notify_all();
    }

    pub(crate) fn read_pipe(&self) -> &BufferedPipe {
        &self.shared.read_pipe
    }

    #[cfg(test)]
    pub(crate) fn allow_data_after_close_write(&self) {
        self.shared.state.lock().unwrap().allow_data_after_shutdown = true;
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.state.lock().unwrap();
        write!(f, "ID {} -> {}", self.shared.id, self.shared.destination)?;
        if st.close_received {
            write!(f, " closeReceived")?;
        }
        if st.close_sent {
            write!(f, " closeSent")?;
        }
        if st.shutdown_sent {
            write!(f, " shutdownSent")?;
        }
        Ok(())
    }
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Channel::read(self, buf).map_err(io::Error::from)
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Channel::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::mux_pair;
    use std::net::{IpAddr, Ipv4Addr};
    use std::thread;
    use std::time::Duration;

    fn dest() -> Destination {
        Destination::tcp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 8080)
    }

    #[test]
    fn test_read_deadline() {
        let (a, b) = mux_pair();
        let chan = a.dial(dest()).unwrap();
        let (_peer, _) = b.accept().unwrap();

        chan.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));
        let start = Instant::now();
        let mut buf = [0u8; 8];
        assert!(matches!(
            chan.read(&mut buf).unwrap_err(),
            ChannelError::Timeout
        ));
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_half_close_keeps_reverse_direction() {
        let (a, b) = mux_pair();
        let chan = a.dial(dest()).unwrap();
        let (peer, _) = b.accept().unwrap();

        chan.close_write().unwrap();

        // Our direction is done: the peer drains to EOF and our writes fail.
        let mut buf = [0u8; 8];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
        assert!(matches!(
            chan.write(b"x").unwrap_err(),
            ChannelError::Closed
        ));

        // The reverse direction still flows.
        assert_eq!(peer.write(b"back").unwrap(), 4);
        let n = chan.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"back");
    }

    #[test]
    fn test_close_refuses_both_directions() {
        let (a, b) = mux_pair();
        let chan = a.dial(dest()).unwrap();
        let (_peer, _) = b.accept().unwrap();

        chan.close().unwrap();
        assert!(matches!(chan.write(b"x").unwrap_err(), ChannelError::Closed));
        let mut buf = [0u8; 8];
        assert_eq!(chan.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_close_write_idempotent() {
        let (a, b) = mux_pair();
        let chan = a.dial(dest()).unwrap();
        let (_peer, _) = b.accept().unwrap();

        chan.close_write().unwrap();
        chan.close_write().unwrap();
        chan.close().unwrap();
        chan.close_write().unwrap();
        chan.close().unwrap();
    }

    #[test]
    fn test_small_read_buffer_regime() {
        let (a, b) = mux_pair();
        let chan = a.dial(dest()).unwrap();
        let (peer, _) = b.accept().unwrap();
        peer.set_read_buffer(1024);

        let data: Vec<u8> = (0..300_000).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();
        let writer = thread::spawn(move || {
            let mut off = 0;
            while off < data.len() {
                off += chan.write(&data[off..]).unwrap();
            }
        });

        let mut received = Vec::with_capacity(expected.len());
        let mut buf = [0u8; 4096];
        while received.len() < expected.len() {
            let n = peer.read(&mut buf).unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }
        writer.join().unwrap();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_io_trait_adapters() {
        let (a, b) = mux_pair();
        let mut chan = a.dial(dest()).unwrap();
        let (mut peer, _) = b.accept().unwrap();

        use std::io::{Read, Write};
        chan.write_all(b"via io traits").unwrap();
        chan.flush().unwrap();
        let mut buf = [0u8; 13];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"via io traits");
    }
}
