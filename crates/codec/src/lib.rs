//! ## Measurement wire protocol
//!
//! The data path exchanges two fixed-layout records: a request stamped by
//! the sender and a reply reflected by the server. All integer fields are
//! little-endian on the wire regardless of host order.
//!
//! A request occupies 24 bytes (18 bytes of fields, zero padding to the
//! next 8-byte boundary) and may be carried inside a larger message when
//! the sender pads the payload out to the negotiated message size. A reply
//! echoes the six request fields at the same offsets and appends the
//! server timestamp and the receiver-side gap counters, for a fixed 48
//! bytes.
//!
//! The control channel uses a much simpler typed framing: 32-bit
//! little-endian signed integers, and strings as a 32-bit little-endian
//! length followed by the bytes with no terminator. See [`control`].

pub mod control;

use std::str::FromStr;

use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    BufferTooShort,
    UnknownFdType,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Request flag bits.
///
/// `TIMESTAMP` and `RESET` are directives to the server; `SAVE`, `SYNC`
/// and `STOP` are directives to the client's own receive thread, carried
/// on the wire only because the server reflects them back verbatim.
pub mod flags {
    /// server fills `s_timestamp` in the reply
    pub const TIMESTAMP: u8 = 0x01;
    /// server resets its expected sequence and gap counters
    pub const RESET: u8 = 0x02;
    /// receive thread saves a latency record for this reply
    pub const SAVE: u8 = 0x04;
    /// receive thread publishes the sequence and wakes the sender
    pub const SYNC: u8 = 0x08;
    /// receive thread leaves its drain loop
    pub const STOP: u8 = 0x10;
}

/// Receiver-side loss accounting, kept per client by the server and
/// copied into every reply.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GapStats {
    /// sum of all forward-gap sizes observed over the run
    pub n_msgs_dropped: u64,
    /// number of distinct forward-gap events
    pub n_gaps: u32,
    /// messages whose sequence was arithmetically behind the expected one
    pub n_ooo: u32,
}

impl GapStats {
    pub const WIRE_SIZE: usize = 16;

    fn put(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.n_msgs_dropped);
        buf.put_u32_le(self.n_gaps);
        buf.put_u32_le(self.n_ooo);
    }

    fn get(buf: &mut impl Buf) -> Self {
        Self {
            n_msgs_dropped: buf.get_u64_le(),
            n_gaps: buf.get_u32_le(),
            n_ooo: buf.get_u32_le(),
        }
    }
}

/// One paced message from client to server.
///
/// `timestamp` and `send_lateness` are in raw cycle-counter units of the
/// sending host; the server treats them as opaque and only reflects them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub timestamp: u64,
    pub seq: u32,
    pub send_lateness: u32,
    pub flags: u8,
    pub reply_seq: u8,
}

impl Request {
    /// Encoded size including tail padding.
    pub const WIRE_SIZE: usize = 24;

    /// Bytes of real fields; decoding needs no more than this.
    pub const FIELD_BYTES: usize = 18;

    /// Encodes into the head of `buf`, which must hold at least
    /// [`Request::WIRE_SIZE`] bytes. Bytes past the padding are left
    /// untouched so a pre-zeroed message buffer can be reused in the send
    /// loop without re-clearing the payload tail.
    ///
    /// # Test
    ///
    /// ```
    /// use stream_bench_codec::Request;
    ///
    /// let mut buf = [0u8; Request::WIRE_SIZE];
    /// let req = Request { timestamp: 2, seq: 1, ..Default::default() };
    ///
    /// req.encode(&mut buf).unwrap();
    ///
    /// assert_eq!(Request::decode(&buf).unwrap(), req);
    /// ```
    pub fn encode(&self, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(Error::BufferTooShort);
        }

        let mut buf = &mut buf[..Self::WIRE_SIZE];
        buf.put_u64_le(self.timestamp);
        buf.put_u32_le(self.seq);
        buf.put_u32_le(self.send_lateness);
        buf.put_u8(self.flags);
        buf.put_u8(self.reply_seq);
        buf.put_bytes(0, Self::WIRE_SIZE - Self::FIELD_BYTES);
        Ok(())
    }

    /// Decodes the head of `buf`; trailing payload bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::FIELD_BYTES {
            return Err(Error::BufferTooShort);
        }

        let mut buf = &buf[..];
        Ok(Self {
            timestamp: buf.get_u64_le(),
            seq: buf.get_u32_le(),
            send_lateness: buf.get_u32_le(),
            flags: buf.get_u8(),
            reply_seq: buf.get_u8(),
        })
    }
}

/// One reflected message from server to client.
///
/// The first 18 bytes repeat the request fields at their original
/// offsets, so a reply parses as a request too. `s_timestamp` is only
/// filled when the request carried [`flags::TIMESTAMP`], otherwise zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub request: Request,
    pub s_timestamp: u64,
    pub gap_stats: GapStats,
}

impl Reply {
    pub const WIRE_SIZE: usize = 48;

    /// ```
    /// use stream_bench_codec::{GapStats, Reply, Request};
    ///
    /// let mut buf = [0u8; Reply::WIRE_SIZE];
    /// let reply = Reply {
    ///     request: Request { seq: 7, ..Default::default() },
    ///     s_timestamp: 99,
    ///     gap_stats: GapStats { n_gaps: 1, ..Default::default() },
    /// };
    ///
    /// reply.encode(&mut buf).unwrap();
    ///
    /// assert_eq!(Reply::decode(&buf).unwrap(), reply);
    /// ```
    pub fn encode(&self, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(Error::BufferTooShort);
        }

        let mut buf = &mut buf[..Self::WIRE_SIZE];
        buf.put_u64_le(self.request.timestamp);
        buf.put_u32_le(self.request.seq);
        buf.put_u32_le(self.request.send_lateness);
        buf.put_u8(self.request.flags);
        buf.put_u8(self.request.reply_seq);
        buf.put_u16_le(0); // unused1
        buf.put_bytes(0, 4);
        buf.put_u64_le(self.s_timestamp);
        self.gap_stats.put(&mut buf);
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(Error::BufferTooShort);
        }

        let request = Request::decode(buf)?;
        let mut buf = &buf[Request::WIRE_SIZE..];
        Ok(Self {
            request,
            s_timestamp: buf.get_u64_le(),
            gap_stats: GapStats::get(&mut buf),
        })
    }
}

/// Transport type negotiated on the control channel.
///
/// The wire value is a small ordinal combined with three property bits,
/// so either side can branch on the properties without enumerating the
/// variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum FdType {
    Tcp = 0x500,
    Udp = 0x101,
    Pipe = 0x602,
    UnixStream = 0x703,
    UnixDatagram = 0x304,
}

impl FdType {
    const SOCKET: i32 = 0x100;
    const LOCAL: i32 = 0x200;
    const STREAM: i32 = 0x400;

    pub fn is_socket(self) -> bool {
        i32::from(self) & Self::SOCKET != 0
    }

    /// Local transports exist only between a client and a server it
    /// forked itself; their endpoints are inherited, not connected.
    pub fn is_local(self) -> bool {
        i32::from(self) & Self::LOCAL != 0
    }

    pub fn is_stream(self) -> bool {
        i32::from(self) & Self::STREAM != 0
    }
}

impl FromStr for FdType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "pipe" => Ok(Self::Pipe),
            "unix_stream" => Ok(Self::UnixStream),
            "unix_datagram" => Ok(Self::UnixDatagram),
            _ => Err(Error::UnknownFdType),
        }
    }
}

impl std::fmt::Display for FdType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Pipe => "pipe",
            Self::UnixStream => "unix_stream",
            Self::UnixDatagram => "unix_datagram",
        };
        write!(f, "{}", name)
    }
}
