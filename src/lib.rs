//! muxlink - many flow-controlled channels over one reliable byte stream.
//!
//! Two symmetric peers exchange framed messages over a single transport
//! (a socket, a pipe, anything implementing [`Transport`]) to open
//! channels, deliver payload bytes, advance per-channel credit windows and
//! signal half- or full-close. Each channel behaves like an ordinary
//! bidirectional connection: blocking reads and writes, deadlines,
//! half-close, and backpressure into writers when the peer stops reading.
//!
//! The peers differ only in channel-id allocation direction: one counts up
//! from 0, the other down from `u32::MAX`, so locally-opened channels never
//! collide.
//!
//! # Example
//!
//! ```rust,ignore
//! use muxlink::{Destination, MockTransport, Multiplexer};
//!
//! let (left, right) = MockTransport::pair("left", "right");
//! // Constructors handshake with each other, so build the two ends on
//! // separate threads.
//! let server = std::thread::spawn(move || Multiplexer::new("server", right, true).unwrap());
//! let client = Multiplexer::new("client", left, false).unwrap();
//! let server = server.join().unwrap();
//! client.run();
//! server.run();
//!
//! let chan = client.dial(Destination::tcp("10.0.0.1".parse().unwrap(), 80))?;
//! let (peer, destination) = server.accept()?;
//! chan.write(b"hello")?;
//! ```

pub mod channel;
pub mod frame;
pub mod mux;
pub mod pipe;
pub mod trace;
pub mod transport;
pub mod window;

// Re-export the working surface at the crate root.
pub use channel::{Channel, ChannelError};
pub use frame::{
    Command, ConnectionKind, Destination, Frame, FrameBody, FrameError, Handshake, Protocol,
    HANDSHAKE_SIZE, HEADER_SIZE, MAX_DATA_LEN, PROTOCOL_VERSION,
};
pub use mux::{Multiplexer, MuxError};
pub use pipe::{BufferedPipe, PipeError};
pub use trace::{Event, EventRing, EVENT_RING_CAPACITY};
pub use transport::{MockTransport, Transport};
pub use window::{WindowState, DEFAULT_WINDOW_SIZE};
