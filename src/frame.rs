//! Wire codec for the multiplexed link protocol.
//!
//! Every message on the link is a frame: a fixed 9-byte big-endian header
//! (`id | command | length`) followed by command-specific inline fields.
//! Data payload bytes are not part of the frame itself; the receive loop
//! consumes exactly `length` raw bytes after a Data frame.
//!
//! A 12-byte handshake greeting (magic + version) precedes all frames,
//! exchanged once in each direction when the link is set up.

use std::fmt;
use std::io::{self, Read};
use std::net::IpAddr;

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Fixed frame header size: id(4) + command(1) + length(4).
pub const HEADER_SIZE: usize = 9;

/// Upper bound on a single Data frame's payload. A header announcing more
/// than this is treated as a desynchronised stream.
pub const MAX_DATA_LEN: u32 = 16 * 1024 * 1024;

/// Handshake greeting size: magic(8) + version(4).
pub const HANDSHAKE_SIZE: usize = 12;

const HANDSHAKE_MAGIC: [u8; 8] = *b"MUXLINK\0";

/// Protocol version carried in the handshake greeting.
pub const PROTOCOL_VERSION: u32 = 1;

/// Codec errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("unknown command {0:#04x}")]
    UnknownCommand(u8),
    #[error("unknown connection kind {0:#04x}")]
    UnknownConnectionKind(u8),
    #[error("unknown protocol {0:#04x}")]
    UnknownProtocol(u8),
    #[error("bad address length {0}")]
    BadAddressLength(u8),
    #[error("data frame length {0} exceeds cap")]
    DataTooLarge(u32),
    #[error("bad handshake magic")]
    BadMagic,
    #[error("unsupported protocol version {got}")]
    Version { got: u32 },
}

/// Frame command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Open = 0x01,
    Close = 0x02,
    Shutdown = 0x03,
    Data = 0x04,
    Window = 0x05,
}

impl Command {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Command::Open),
            0x02 => Some(Command::Close),
            0x03 => Some(Command::Shutdown),
            0x04 => Some(Command::Data),
            0x05 => Some(Command::Window),
            _ => None,
        }
    }
}

/// How the peer wants the new sub-connection carried.
///
/// Only `Multiplexed` is supported; receiving a `Dedicated` open is a fatal
/// link error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionKind {
    Dedicated = 0x00,
    Multiplexed = 0x01,
}

impl ConnectionKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ConnectionKind::Dedicated),
            0x01 => Some(ConnectionKind::Multiplexed),
            _ => None,
        }
    }
}

/// Transport protocol of a channel's destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
    Tcp = 0x01,
    Udp = 0x02,
}

impl Protocol {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Protocol::Tcp),
            0x02 => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// The endpoint a channel targets. Opaque to the multiplexer beyond
/// equality and display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub protocol: Protocol,
    pub addr: IpAddr,
    pub port: u16,
}

impl Destination {
    pub fn new(protocol: Protocol, addr: IpAddr, port: u16) -> Self {
        Destination {
            protocol,
            addr,
            port,
        }
    }

    pub fn tcp(addr: IpAddr, port: u16) -> Self {
        Self::new(Protocol::Tcp, addr, port)
    }

    pub fn udp(addr: IpAddr, port: u16) -> Self {
        Self::new(Protocol::Udp, addr, port)
    }

    fn encode_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.protocol as u8);
        buf.put_u16(self.port);
        match self.addr {
            IpAddr::V4(v4) => {
                buf.put_u8(4);
                buf.put_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                buf.put_u8(16);
                buf.put_slice(&v6.octets());
            }
        }
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self, FrameError> {
        let mut fixed = [0u8; 4];
        r.read_exact(&mut fixed)?;
        let protocol = Protocol::from_byte(fixed[0]).ok_or(FrameError::UnknownProtocol(fixed[0]))?;
        let port = u16::from_be_bytes([fixed[1], fixed[2]]);
        let addr = match fixed[3] {
            4 => {
                let mut octets = [0u8; 4];
                r.read_exact(&mut octets)?;
                IpAddr::from(octets)
            }
            16 => {
                let mut octets = [0u8; 16];
                r.read_exact(&mut octets)?;
                IpAddr::from(octets)
            }
            n => return Err(FrameError::BadAddressLength(n)),
        };
        Ok(Destination {
            protocol,
            addr,
            port,
        })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(v4) => write!(f, "{}:{}:{}", self.protocol, v4, self.port),
            IpAddr::V6(v6) => write!(f, "{}:[{}]:{}", self.protocol, v6, self.port),
        }
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub body: FrameBody,
}

/// Command-specific frame contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    Open {
        kind: ConnectionKind,
        destination: Destination,
    },
    Close,
    Shutdown,
    /// Announces `len` raw payload bytes following the frame.
    Data { len: u32 },
    /// New absolute credit limit for the sender's direction.
    Window { seq: u64 },
}

impl Frame {
    pub fn open(id: u32, destination: Destination) -> Self {
        Frame {
            id,
            body: FrameBody::Open {
                kind: ConnectionKind::Multiplexed,
                destination,
            },
        }
    }

    pub fn close(id: u32) -> Self {
        Frame {
            id,
            body: FrameBody::Close,
        }
    }

    pub fn shutdown(id: u32) -> Self {
        Frame {
            id,
            body: FrameBody::Shutdown,
        }
    }

    pub fn data(id: u32, len: u32) -> Self {
        Frame {
            id,
            body: FrameBody::Data { len },
        }
    }

    pub fn window(id: u32, seq: u64) -> Self {
        Frame {
            id,
            body: FrameBody::Window { seq },
        }
    }

    pub fn command(&self) -> Command {
        match self.body {
            FrameBody::Open { .. } => Command::Open,
            FrameBody::Close => Command::Close,
            FrameBody::Shutdown => Command::Shutdown,
            FrameBody::Data { .. } => Command::Data,
            FrameBody::Window { .. } => Command::Window,
        }
    }

    /// Append the wire bytes of this frame to `buf`. Data payload bytes are
    /// sent separately by the caller, after the frame.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.id);
        buf.put_u8(self.command() as u8);
        match &self.body {
            FrameBody::Open { kind, destination } => {
                buf.put_u32(0);
                buf.put_u8(*kind as u8);
                destination.encode_to(buf);
            }
            FrameBody::Close | FrameBody::Shutdown => buf.put_u32(0),
            FrameBody::Data { len } => buf.put_u32(*len),
            FrameBody::Window { seq } => {
                buf.put_u32(0);
                buf.put_u64(*seq);
            }
        }
    }

    /// Read one fully-parsed frame from the stream. Any error here leaves
    /// the stream position undefined and is fatal for the link.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Frame, FrameError> {
        let mut header = [0u8; HEADER_SIZE];
        r.read_exact(&mut header)?;
        let id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let command = Command::from_byte(header[4]).ok_or(FrameError::UnknownCommand(header[4]))?;
        let length = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);

        let body = match command {
            Command::Open => {
                let mut kind = [0u8; 1];
                r.read_exact(&mut kind)?;
                let kind = ConnectionKind::from_byte(kind[0])
                    .ok_or(FrameError::UnknownConnectionKind(kind[0]))?;
                let destination = Destination::read_from(r)?;
                FrameBody::Open { kind, destination }
            }
            Command::Close => FrameBody::Close,
            Command::Shutdown => FrameBody::Shutdown,
            Command::Data => {
                if length > MAX_DATA_LEN {
                    return Err(FrameError::DataTooLarge(length));
                }
                FrameBody::Data { len: length }
            }
            Command::Window => {
                let mut seq = [0u8; 8];
                r.read_exact(&mut seq)?;
                FrameBody::Window {
                    seq: u64::from_be_bytes(seq),
                }
            }
        };
        Ok(Frame { id, body })
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            FrameBody::Open { destination, .. } => write!(f, "open {} -> {}", self.id, destination),
            FrameBody::Close => write!(f, "close {}", self.id),
            FrameBody::Shutdown => write!(f, "shutdown {}", self.id),
            FrameBody::Data { len } => write!(f, "data {} len {}", self.id, len),
            FrameBody::Window { seq } => write!(f, "window {} seq {}", self.id, seq),
        }
    }
}

/// Fixed greeting exchanged once per link, before any frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub version: u32,
}

impl Handshake {
    pub fn new() -> Self {
        Handshake {
            version: PROTOCOL_VERSION,
        }
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut buf = [0u8; HANDSHAKE_SIZE];
        buf[..8].copy_from_slice(&HANDSHAKE_MAGIC);
        buf[8..].copy_from_slice(&self.version.to_be_bytes());
        buf
    }

    /// Read and verify the peer's greeting. Reads exactly
    /// [`HANDSHAKE_SIZE`] bytes so a buffered decoder can start cleanly
    /// afterwards.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Handshake, FrameError> {
        let mut buf = [0u8; HANDSHAKE_SIZE];
        r.read_exact(&mut buf)?;
        if buf[..8] != HANDSHAKE_MAGIC {
            return Err(FrameError::BadMagic);
        }
        let version = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if version != PROTOCOL_VERSION {
            return Err(FrameError::Version { got: version });
        }
        Ok(Handshake { version })
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        frame.encode_to(&mut buf);
        Frame::read_from(&mut &buf[..]).unwrap()
    }

    #[test]
    fn test_open_roundtrip_v4() {
        let dest = Destination::tcp(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), 443);
        let frame = Frame::open(7, dest.clone());
        let decoded = roundtrip(frame.clone());
        assert_eq!(decoded, frame);
        assert_eq!(
            decoded.body,
            FrameBody::Open {
                kind: ConnectionKind::Multiplexed,
                destination: dest,
            }
        );
    }

    #[test]
    fn test_open_roundtrip_v6_udp() {
        let dest = Destination::udp(IpAddr::V6(Ipv6Addr::LOCALHOST), 53);
        let frame = Frame::open(u32::MAX, dest);
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_control_roundtrips() {
        assert_eq!(roundtrip(Frame::close(3)), Frame::close(3));
        assert_eq!(roundtrip(Frame::shutdown(3)), Frame::shutdown(3));
        assert_eq!(roundtrip(Frame::data(3, 4096)), Frame::data(3, 4096));
        assert_eq!(
            roundtrip(Frame::window(3, u64::MAX / 2)),
            Frame::window(3, u64::MAX / 2)
        );
    }

    #[test]
    fn test_unknown_command() {
        let mut buf = BytesMut::new();
        Frame::close(1).encode_to(&mut buf);
        buf[4] = 0x7f;
        let err = Frame::read_from(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, FrameError::UnknownCommand(0x7f)));
    }

    #[test]
    fn test_dedicated_kind_decodes() {
        // A Dedicated open parses; rejecting it is the receive loop's job.
        let mut buf = BytesMut::new();
        let dest = Destination::tcp(IpAddr::V4(Ipv4Addr::LOCALHOST), 80);
        Frame::open(1, dest).encode_to(&mut buf);
        buf[HEADER_SIZE] = ConnectionKind::Dedicated as u8;
        let frame = Frame::read_from(&mut &buf[..]).unwrap();
        assert!(matches!(
            frame.body,
            FrameBody::Open {
                kind: ConnectionKind::Dedicated,
                ..
            }
        ));
    }

    #[test]
    fn test_truncated_stream() {
        let mut buf = BytesMut::new();
        Frame::window(1, 65536).encode_to(&mut buf);
        let err = Frame::read_from(&mut &buf[..buf.len() - 3]).unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    #[test]
    fn test_data_length_cap() {
        let mut buf = BytesMut::new();
        Frame::data(1, MAX_DATA_LEN + 1).encode_to(&mut buf);
        let err = Frame::read_from(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, FrameError::DataTooLarge(_)));
    }

    #[test]
    fn test_bad_address_length() {
        let mut buf = BytesMut::new();
        let dest = Destination::tcp(IpAddr::V4(Ipv4Addr::LOCALHOST), 80);
        Frame::open(1, dest).encode_to(&mut buf);
        buf[HEADER_SIZE + 4] = 5;
        let err = Frame::read_from(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, FrameError::BadAddressLength(5)));
    }

    #[test]
    fn test_frame_display() {
        let dest = Destination::tcp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 80);
        assert_eq!(Frame::open(5, dest).to_string(), "open 5 -> tcp:10.0.0.1:80");
        assert_eq!(Frame::data(5, 16).to_string(), "data 5 len 16");
        assert_eq!(Frame::window(5, 65536).to_string(), "window 5 seq 65536");
        assert_eq!(Frame::close(5).to_string(), "close 5");
        assert_eq!(Frame::shutdown(5).to_string(), "shutdown 5");
    }

    #[test]
    fn test_destination_display_v6() {
        let dest = Destination::udp(IpAddr::V6(Ipv6Addr::LOCALHOST), 53);
        assert_eq!(dest.to_string(), "udp:[::1]:53");
    }

    #[test]
    fn test_handshake_roundtrip() {
        let encoded = Handshake::new().encode();
        let decoded = Handshake::read_from(&mut &encoded[..]).unwrap();
        assert_eq!(decoded.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_handshake_bad_magic() {
        let mut encoded = Handshake::new().encode();
        encoded[0] = b'X';
        let err = Handshake::read_from(&mut &encoded[..]).unwrap_err();
        assert!(matches!(err, FrameError::BadMagic));
    }

    #[test]
    fn test_handshake_version_mismatch() {
        let mut encoded = Handshake::new().encode();
        encoded[8..].copy_from_slice(&99u32.to_be_bytes());
        let err = Handshake::read_from(&mut &encoded[..]).unwrap_err();
        assert!(matches!(err, FrameError::Version { got: 99 }));
    }
}
