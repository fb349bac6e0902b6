//! Link multiplexer: many channels over one reliable byte stream.
//!
//! Architecture:
//! - One receive thread per multiplexer drains the transport, decodes
//!   frames and dispatches them to channel state.
//! - All outbound frames go through a single write lock, so a frame header
//!   and its payload are never interleaved with another sender's bytes.
//! - Channel metadata (table, accept queue, id cursor, running flag) lives
//!   behind one mutex paired with the accept condvar; the event ring has
//!   its own short-lived lock. At most one of these is held at a time, and
//!   the write lock is only ever held alone.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use bytes::BytesMut;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::channel::Channel;
use crate::frame::{ConnectionKind, Destination, Frame, FrameBody, FrameError, Handshake};
use crate::trace::{Event, EventRing, EVENT_RING_CAPACITY};
use crate::transport::Transport;

/// Multiplexer errors.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("multiplexer is not running")]
    NotRunning,
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("unknown channel id in frame {0}")]
    UnknownChannel(String),
    #[error("dedicated connections are not supported")]
    DedicatedNotSupported,
}

struct ChannelEntry {
    chan: Channel,
    // Starts at 2: one side released by our Close, one by the peer's.
    refs: u32,
}

struct Meta {
    channels: HashMap<u32, ChannelEntry>,
    pending_accept: VecDeque<Channel>,
    next_channel_id: u32,
    running: bool,
}

impl Meta {
    fn alloc_channel_id(&mut self, backwards: bool) -> u32 {
        let mut id = self.next_channel_id;
        while self.channels.contains_key(&id) {
            id = if backwards {
                id.wrapping_sub(1)
            } else {
                id.wrapping_add(1)
            };
        }
        self.next_channel_id = if backwards {
            id.wrapping_sub(1)
        } else {
            id.wrapping_add(1)
        };
        id
    }
}

pub(crate) struct MuxShared {
    label: String,
    transport: Arc<dyn Transport>,
    write_buf: Mutex<BytesMut>,
    meta: Mutex<Meta>,
    accept_wake: Condvar,
    events: Mutex<EventRing>,
    allocate_backwards: bool,
}

/// Muxes and demuxes channels over a single transport.
///
/// Construction performs the handshake; nothing moves until [`run`] starts
/// the receive thread.
///
/// [`run`]: Multiplexer::run
pub struct Multiplexer {
    shared: Arc<MuxShared>,
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("label", &self.shared.label)
            .finish()
    }
}

impl Multiplexer {
    /// Wrap a transport and exchange greetings with the peer (both
    /// directions, concurrently). The two peers must pass opposite
    /// `allocate_backwards` values so their channel ids never collide.
    pub fn new<T: Transport + 'static>(
        label: &str,
        transport: T,
        allocate_backwards: bool,
    ) -> Result<Multiplexer, MuxError> {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        exchange_handshake(&transport)?;

        let next_channel_id = if allocate_backwards { u32::MAX } else { 0 };
        Ok(Multiplexer {
            shared: Arc::new(MuxShared {
                label: label.to_string(),
                transport,
                write_buf: Mutex::new(BytesMut::with_capacity(4096)),
                meta: Mutex::new(Meta {
                    channels: HashMap::new(),
                    pending_accept: VecDeque::new(),
                    next_channel_id,
                    running: false,
                }),
                accept_wake: Condvar::new(),
                events: Mutex::new(EventRing::new(EVENT_RING_CAPACITY)),
                allocate_backwards,
            }),
        })
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Start the receive thread. `dial` and `accept` work only after this.
    pub fn run(&self) {
        {
            let mut meta = self.shared.meta.lock().unwrap();
            meta.running = true;
        }
        let shared = Arc::clone(&self.shared);
        thread::spawn(move || {
            let result = shared.receive_loop();
            shared.teardown(result);
        });
    }

    /// True while the receive loop is healthy.
    pub fn is_running(&self) -> bool {
        self.shared.meta.lock().unwrap().running
    }

    /// Open a channel to `destination` on the peer.
    pub fn dial(&self, destination: Destination) -> Result<Channel, MuxError> {
        let chan = {
            let mut meta = self.shared.meta.lock().unwrap();
            if !meta.running {
                return Err(MuxError::NotRunning);
            }
            let id = meta.alloc_channel_id(self.shared.allocate_backwards);
            let chan = Channel::new(Arc::clone(&self.shared), id, destination.clone());
            meta.channels.insert(
                id,
                ChannelEntry {
                    chan: chan.clone(),
                    refs: 2,
                },
            );
            chan
        };
        self.shared.send(&Frame::open(chan.id(), destination), &[])?;
        chan.send_window_update()?;
        Ok(chan)
    }

    /// Wait for the peer to open a channel. Fails with
    /// [`MuxError::NotRunning`] once the multiplexer stops.
    pub fn accept(&self) -> Result<(Channel, Destination), MuxError> {
        let chan = self.next_pending_accept()?;
        chan.send_window_update()?;
        let destination = chan.remote_addr();
        Ok((chan, destination))
    }

    fn next_pending_accept(&self) -> Result<Channel, MuxError> {
        let mut meta = self.shared.meta.lock().unwrap();
        loop {
            if !meta.running {
                return Err(MuxError::NotRunning);
            }
            if let Some(chan) = meta.pending_accept.pop_front() {
                return Ok(chan);
            }
            meta = self.shared.accept_wake.wait(meta).unwrap();
        }
    }

    /// Stop the multiplexer and close the transport. The receive loop then
    /// unblocks and tears down every remaining channel.
    pub fn close(&self) -> io::Result<()> {
        {
            let mut meta = self.shared.meta.lock().unwrap();
            meta.running = false;
        }
        self.shared.accept_wake.notify_all();
        self.shared.transport.close()
    }

    /// Write the event trace and one line per live channel.
    pub fn dump_state(&self, w: &mut dyn Write) -> io::Result<()> {
        self.shared.dump_state(w)
    }

    /// Number of live channels in the table.
    pub fn channel_count(&self) -> usize {
        self.shared.meta.lock().unwrap().channels.len()
    }
}

fn exchange_handshake(transport: &Arc<dyn Transport>) -> Result<(), MuxError> {
    let greeting = Handshake::new().encode();
    thread::scope(|s| {
        let writer = s.spawn(|| transport.send_all(&greeting));
        let mut reader = TransportReader {
            transport: Arc::clone(transport),
        };
        let received = Handshake::read_from(&mut reader);
        let sent = writer.join().expect("handshake write thread panicked");
        sent?;
        received?;
        Ok(())
    })
}

/// Adapts the transport's `recv` to `io::Read` for the frame decoder.
struct TransportReader {
    transport: Arc<dyn Transport>,
}

impl Read for TransportReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.transport.recv(buf)
    }
}

impl MuxShared {
    /// Send one frame plus optional payload. Everything goes out in a
    /// single transport write, so concurrent senders can never interleave.
    /// A failure here desynchronises the peer; recovery is not attempted,
    /// the receive loop will observe the broken transport and exit.
    pub(crate) fn send(&self, frame: &Frame, payload: &[u8]) -> io::Result<()> {
        self.append_event(Event::Send(frame.clone()));
        let mut buf = self.write_buf.lock().unwrap();
        buf.clear();
        frame.encode_to(&mut buf);
        buf.extend_from_slice(payload);
        self.transport.send_all(&buf)
    }

    /// Drop one reference to a channel; the entry is removed when both the
    /// local close and the peer's close have released theirs.
    pub(crate) fn decr_channel_ref(&self, id: u32) {
        let removed = {
            let mut meta = self.meta.lock().unwrap();
            let last = matches!(meta.channels.get(&id), Some(entry) if entry.refs <= 1);
            if last {
                meta.channels.remove(&id).map(|entry| entry.chan.remote_addr())
            } else {
                if let Some(entry) = meta.channels.get_mut(&id) {
                    entry.refs -= 1;
                }
                None
            }
        };
        if let Some(destination) = removed {
            self.append_event(Event::Closed { id, destination });
        }
    }

    fn append_event(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn lookup(&self, id: u32) -> Option<Channel> {
        self.meta
            .lock()
            .unwrap()
            .channels
            .get(&id)
            .map(|entry| entry.chan.clone())
    }

    fn receive_loop(self: &Arc<Self>) -> Result<(), MuxError> {
        let mut reader = BufReader::new(TransportReader {
            transport: Arc::clone(&self.transport),
        });
        let mut scratch = Vec::new();
        loop {
            let frame = Frame::read_from(&mut reader)?;
            self.append_event(Event::Recv(frame.clone()));
            match &frame.body {
                FrameBody::Open { kind, destination } => {
                    if *kind == ConnectionKind::Dedicated {
                        return Err(MuxError::DedicatedNotSupported);
                    }
                    let chan = Channel::new(Arc::clone(self), frame.id, destination.clone());
                    {
                        let mut meta = self.meta.lock().unwrap();
                        meta.channels.insert(
                            frame.id,
                            ChannelEntry {
                                chan: chan.clone(),
                                refs: 2,
                            },
                        );
                        meta.pending_accept.push_back(chan);
                    }
                    self.accept_wake.notify_one();
                    self.append_event(Event::Opened {
                        id: frame.id,
                        destination: destination.clone(),
                    });
                }
                FrameBody::Window { seq } => {
                    let chan = self
                        .lookup(frame.id)
                        .ok_or_else(|| MuxError::UnknownChannel(frame.to_string()))?;
                    chan.recv_window_update(*seq);
                }
                FrameBody::Data { len } => {
                    let chan = self
                        .lookup(frame.id)
                        .ok_or_else(|| MuxError::UnknownChannel(frame.to_string()))?;
                    // Always consume exactly `len` bytes, whatever happens
                    // to them afterwards, or the stream desynchronises.
                    scratch.resize(*len as usize, 0);
                    reader.read_exact(&mut scratch).map_err(FrameError::Io)?;
                    if chan.read_pipe().write(&scratch).is_err() {
                        // A confused peer may send Data after Shutdown or
                        // Close. Framing is intact, so keep going.
                        debug!(
                            label = %self.label,
                            id = frame.id,
                            bytes = *len,
                            "discarding data for closed read pipe"
                        );
                    }
                }
                FrameBody::Shutdown => {
                    let chan = self
                        .lookup(frame.id)
                        .ok_or_else(|| MuxError::UnknownChannel(frame.to_string()))?;
                    chan.read_pipe().close_write();
                }
                FrameBody::Close => {
                    let chan = self
                        .lookup(frame.id)
                        .ok_or_else(|| MuxError::UnknownChannel(frame.to_string()))?;
                    // Unblock readers first, then writers.
                    chan.read_pipe().close_write();
                    chan.recv_close();
                    self.decr_channel_ref(frame.id);
                }
            }
        }
    }

    fn teardown(&self, result: Result<(), MuxError>) {
        let eof = match &result {
            Ok(()) => true,
            Err(MuxError::Io(e)) | Err(MuxError::Frame(FrameError::Io(e))) => {
                e.kind() == io::ErrorKind::UnexpectedEof
            }
            Err(_) => false,
        };
        let expected = eof || !self.meta.lock().unwrap().running;

        if expected {
            info!(label = %self.label, "link disconnected: multiplexer is offline");
        } else if let Err(e) = &result {
            let mut dump = Vec::new();
            let _ = self.dump_state(&mut dump);
            error!(
                label = %self.label,
                error = %e,
                state = %String::from_utf8_lossy(&dump),
                "receive loop failed"
            );
        }

        let channels: Vec<Channel> = {
            let mut meta = self.meta.lock().unwrap();
            meta.running = false;
            meta.channels.values().map(|entry| entry.chan.clone()).collect()
        };
        self.accept_wake.notify_all();

        for chan in channels {
            // Unblock waiting reads, then waiting writes.
            chan.read_pipe().close_write();
            chan.recv_close();
            self.decr_channel_ref(chan.id());
        }
    }

    fn dump_state(&self, w: &mut dyn Write) -> io::Result<()> {
        {
            let events = self.events.lock().unwrap();
            writeln!(w, "Event trace:")?;
            for event in events.iter() {
                writeln!(w, "{}", event)?;
            }
        }

        let channels: Vec<Channel> = {
            let meta = self.meta.lock().unwrap();
            meta.channels.values().map(|entry| entry.chan.clone()).collect()
        };
        writeln!(w, "Active channels:")?;
        for chan in channels {
            writeln!(w, "{}", chan)?;
        }
        writeln!(w, "End of state dump")?;
        Ok(())
    }
}

// --- Test infrastructure ---

#[cfg(test)]
pub(crate) fn mux_pair() -> (Multiplexer, Multiplexer) {
    let (a, b) = mux_pair_stopped();
    a.run();
    b.run();
    (a, b)
}

#[cfg(test)]
pub(crate) fn mux_pair_stopped() -> (Multiplexer, Multiplexer) {
    use crate::transport::MockTransport;
    let (ta, tb) = MockTransport::pair("left", "right");
    // Both constructors block on the peer's greeting, so build them on two
    // threads.
    let left = thread::spawn(move || Multiplexer::new("left", ta, false).unwrap());
    let right = Multiplexer::new("right", tb, true).unwrap();
    (left.join().unwrap(), right)
}

#[cfg(test)]
pub(crate) fn wait_until(f: impl Fn() -> bool) -> bool {
    use std::time::{Duration, Instant};
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    f()
}
