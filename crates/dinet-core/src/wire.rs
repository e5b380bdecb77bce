//! Debug interconnect wire format: packets, flits, and their encodings.
//!
//! These types ARE the protocol. A packet is a run of 16-bit words:
//!
//!   word 0   destination address, bits [9:0]
//!   word 1   source address, bits [9:0]
//!   word 2   class in bits [15:14], subclass in bits [13:10]
//!   word 3.. payload, most-significant word first for wide values
//!
//! Reserved header bits are written as zero and ignored when read back.
//! Class and subclass are decoded into a sum type so that a packet with a
//! subclass its class does not define cannot be constructed.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::reg::RegWidth;

// ── Header layout ─────────────────────────────────────────────────────────────

/// Number of header words in front of every payload.
pub const HEADER_WORDS: usize = 3;

const ADDR_MASK: u16 = 0x03ff;
const CLASS_SHIFT: u16 = 14;
const CLASS_MASK: u16 = 0b11;
const SUBCLASS_SHIFT: u16 = 10;
const SUBCLASS_MASK: u16 = 0b1111;

/// The three header words as they appear in a datagram.
///
/// Wire size: 6 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct HeaderWords {
    pub dest: U16<BigEndian>,
    pub src: U16<BigEndian>,
    pub flags: U16<BigEndian>,
}

// Compile-time size guard. If this fails, the datagram framing has changed.
assert_eq_size!(HeaderWords, [u8; 6]);

/// Payload capacity of a packet when the link allows `max_packet_len` words.
pub fn max_payload_words(max_packet_len: usize) -> usize {
    max_packet_len.saturating_sub(HEADER_WORDS)
}

// ── Addresses ─────────────────────────────────────────────────────────────────

/// A 10-bit debug interconnect module address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct DiAddr(u16);

impl DiAddr {
    /// Highest representable address.
    pub const MAX: u16 = ADDR_MASK;

    pub fn new(raw: u16) -> Result<Self, WireError> {
        if raw > Self::MAX {
            return Err(WireError::AddressOutOfRange(raw));
        }
        Ok(Self(raw))
    }

    /// Build from a header word, dropping the reserved bits.
    pub const fn from_word(word: u16) -> Self {
        Self(word & ADDR_MASK)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for DiAddr {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DiAddr> for u16 {
    fn from(addr: DiAddr) -> u16 {
        addr.0
    }
}

impl fmt::Display for DiAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:03x}", self.0)
    }
}

// ── Class and subclass ────────────────────────────────────────────────────────

/// Primary packet type, bits [15:14] of the flags word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketClass {
    Register = 0,
    Plain = 1,
    Event = 2,
    Reserved = 3,
}

impl PacketClass {
    fn from_bits(bits: u8) -> Self {
        match bits & CLASS_MASK as u8 {
            0 => PacketClass::Register,
            1 => PacketClass::Plain,
            2 => PacketClass::Event,
            _ => PacketClass::Reserved,
        }
    }
}

impl fmt::Display for PacketClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketClass::Register => "REG",
            PacketClass::Plain => "PLAIN",
            PacketClass::Event => "EVENT",
            PacketClass::Reserved => "RESERVED",
        };
        f.write_str(name)
    }
}

/// Subclasses of a REGISTER packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegKind {
    ReadRequest(RegWidth),
    WriteRequest(RegWidth),
    ReadSuccess(RegWidth),
    ReadError,
    WriteSuccess,
    WriteError,
}

impl RegKind {
    const READ_ERROR: u8 = 0b1100;
    const UNDEFINED: u8 = 0b1101;
    const WRITE_SUCCESS: u8 = 0b1110;
    const WRITE_ERROR: u8 = 0b1111;

    pub fn bits(self) -> u8 {
        match self {
            RegKind::ReadRequest(w) => w.index(),
            RegKind::WriteRequest(w) => 0b0100 | w.index(),
            RegKind::ReadSuccess(w) => 0b1000 | w.index(),
            RegKind::ReadError => Self::READ_ERROR,
            RegKind::WriteSuccess => Self::WRITE_SUCCESS,
            RegKind::WriteError => Self::WRITE_ERROR,
        }
    }

    pub fn from_bits(bits: u8) -> Result<Self, WireError> {
        let width = RegWidth::from_index(bits & 0b11);
        match bits {
            0b0000..=0b0011 => Ok(RegKind::ReadRequest(width)),
            0b0100..=0b0111 => Ok(RegKind::WriteRequest(width)),
            0b1000..=0b1011 => Ok(RegKind::ReadSuccess(width)),
            Self::READ_ERROR => Ok(RegKind::ReadError),
            Self::WRITE_SUCCESS => Ok(RegKind::WriteSuccess),
            Self::WRITE_ERROR => Ok(RegKind::WriteError),
            Self::UNDEFINED => Err(WireError::UndefinedSubclass(bits)),
            other => Err(WireError::SubclassOutOfRange(other)),
        }
    }

    pub fn is_request(self) -> bool {
        matches!(self, RegKind::ReadRequest(_) | RegKind::WriteRequest(_))
    }

    /// The error response answering this request, `None` for responses.
    pub fn error_response(self) -> Option<RegKind> {
        match self {
            RegKind::ReadRequest(_) => Some(RegKind::ReadError),
            RegKind::WriteRequest(_) => Some(RegKind::WriteError),
            _ => None,
        }
    }

    /// The success response answering this request, `None` for responses.
    pub fn success_response(self) -> Option<RegKind> {
        match self {
            RegKind::ReadRequest(w) => Some(RegKind::ReadSuccess(w)),
            RegKind::WriteRequest(_) => Some(RegKind::WriteSuccess),
            _ => None,
        }
    }
}

/// A raw 4-bit subclass for classes that give it no fixed meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subtype(u8);

impl Subtype {
    pub fn new(raw: u8) -> Result<Self, WireError> {
        if raw > SUBCLASS_MASK as u8 {
            return Err(WireError::SubclassOutOfRange(raw));
        }
        Ok(Self(raw))
    }

    pub const fn raw(self) -> u8 {
        self.0
    }
}

/// Subclass of an EVENT packet.
///
/// Only `CONTINUATION` joins a packet to the one after it. Every other
/// subclass, `OVERFLOW` included, ends the run it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKind(u8);

impl EventKind {
    /// Last (or only) packet of an event.
    pub const LAST: Self = Self(0);
    /// Intermediate packet; more of the same event follows.
    pub const CONTINUATION: Self = Self(1);
    /// The producer dropped events before this one.
    pub const OVERFLOW: Self = Self(5);

    pub fn new(raw: u8) -> Result<Self, WireError> {
        if raw > SUBCLASS_MASK as u8 {
            return Err(WireError::SubclassOutOfRange(raw));
        }
        Ok(Self(raw))
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn is_continuation(self) -> bool {
        self.0 == Self::CONTINUATION.0
    }
}

/// Class and subclass of a packet, as one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Register(RegKind),
    Plain(Subtype),
    Event(EventKind),
    Reserved(Subtype),
}

impl PacketKind {
    pub fn class(self) -> PacketClass {
        match self {
            PacketKind::Register(_) => PacketClass::Register,
            PacketKind::Plain(_) => PacketClass::Plain,
            PacketKind::Event(_) => PacketClass::Event,
            PacketKind::Reserved(_) => PacketClass::Reserved,
        }
    }

    pub fn subclass_bits(self) -> u8 {
        match self {
            PacketKind::Register(k) => k.bits(),
            PacketKind::Plain(s) | PacketKind::Reserved(s) => s.raw(),
            PacketKind::Event(e) => e.raw(),
        }
    }

    /// The flags header word for this kind.
    pub fn flags_word(self) -> u16 {
        ((self.class() as u16) << CLASS_SHIFT)
            | ((self.subclass_bits() as u16 & SUBCLASS_MASK) << SUBCLASS_SHIFT)
    }

    /// Decode the flags header word.
    pub fn from_flags_word(word: u16) -> Result<Self, WireError> {
        let class = PacketClass::from_bits((word >> CLASS_SHIFT) as u8);
        let sub = ((word >> SUBCLASS_SHIFT) & SUBCLASS_MASK) as u8;
        Ok(match class {
            PacketClass::Register => PacketKind::Register(RegKind::from_bits(sub)?),
            PacketClass::Plain => PacketKind::Plain(Subtype(sub)),
            PacketClass::Event => PacketKind::Event(EventKind(sub)),
            PacketClass::Reserved => PacketKind::Reserved(Subtype(sub)),
        })
    }

    /// Class of a packet given only its flags word. Never fails.
    pub fn class_of_flags_word(word: u16) -> PacketClass {
        PacketClass::from_bits((word >> CLASS_SHIFT) as u8)
    }
}

// ── Flits ─────────────────────────────────────────────────────────────────────

/// One 16-bit word on a link, tagged with the end-of-packet marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flit {
    pub data: u16,
    pub last: bool,
}

impl Flit {
    /// A word in the middle of a packet.
    pub const fn word(data: u16) -> Self {
        Self { data, last: false }
    }

    /// The final word of a packet.
    pub const fn tail(data: u16) -> Self {
        Self { data, last: true }
    }
}

// ── Packet ────────────────────────────────────────────────────────────────────

/// A decoded debug interconnect packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub dest: DiAddr,
    pub src: DiAddr,
    pub kind: PacketKind,
    pub payload: Vec<u16>,
}

impl Packet {
    pub fn new(dest: DiAddr, src: DiAddr, kind: PacketKind, payload: Vec<u16>) -> Self {
        Self {
            dest,
            src,
            kind,
            payload,
        }
    }

    pub fn class(&self) -> PacketClass {
        self.kind.class()
    }

    /// Total length on the wire, header included.
    pub fn len_words(&self) -> usize {
        HEADER_WORDS + self.payload.len()
    }

    /// A packet travelling back to this packet's sender.
    pub fn reply(&self, kind: PacketKind, payload: Vec<u16>) -> Packet {
        Packet::new(self.src, self.dest, kind, payload)
    }

    /// Lay the packet out as words: header first, then payload in order.
    pub fn encode(&self) -> Vec<u16> {
        let mut words = Vec::with_capacity(self.len_words());
        words.push(self.dest.raw());
        words.push(self.src.raw());
        words.push(self.kind.flags_word());
        words.extend_from_slice(&self.payload);
        words
    }

    /// Rebuild a packet from words. Anything after the third word is payload.
    pub fn decode(words: &[u16]) -> Result<Self, WireError> {
        if words.len() < HEADER_WORDS {
            return Err(WireError::TooShort(words.len()));
        }
        Ok(Self {
            dest: DiAddr::from_word(words[0]),
            src: DiAddr::from_word(words[1]),
            kind: PacketKind::from_flags_word(words[2])?,
            payload: words[HEADER_WORDS..].to_vec(),
        })
    }

    /// Encode as flits with `last` set on the final word only.
    pub fn to_flits(&self) -> Vec<Flit> {
        let words = self.encode();
        let n = words.len();
        words
            .into_iter()
            .enumerate()
            .map(|(i, data)| Flit {
                data,
                last: i + 1 == n,
            })
            .collect()
    }

    /// Decode a run of flits that forms exactly one packet.
    pub fn from_flits(flits: &[Flit]) -> Result<Self, WireError> {
        debug_assert!(
            flits.iter().rev().skip(1).all(|f| !f.last),
            "end-of-packet marker inside a packet"
        );
        let words: Vec<u16> = flits.iter().map(|f| f.data).collect();
        Self::decode(&words)
    }

    /// Datagram form: every word big-endian, no framing beyond that.
    pub fn to_bytes(&self) -> Bytes {
        let header = HeaderWords {
            dest: U16::new(self.dest.raw()),
            src: U16::new(self.src.raw()),
            flags: U16::new(self.kind.flags_word()),
        };
        let mut buf = BytesMut::with_capacity(self.len_words() * 2);
        buf.put_slice(header.as_bytes());
        for word in &self.payload {
            buf.put_u16(*word);
        }
        buf.freeze()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() % 2 != 0 {
            return Err(WireError::OddLength(bytes.len()));
        }
        let header = HeaderWords::read_from_prefix(bytes)
            .ok_or(WireError::TooShort(bytes.len() / 2))?;
        let payload = <U16<BigEndian>>::slice_from(&bytes[HEADER_WORDS * 2..])
            .ok_or(WireError::OddLength(bytes.len()))?;
        Ok(Self {
            dest: DiAddr::from_word(header.dest.get()),
            src: DiAddr::from_word(header.src.get()),
            kind: PacketKind::from_flags_word(header.flags.get())?,
            payload: payload.iter().map(|w| w.get()).collect(),
        })
    }

    /// Fail when the packet would not fit on a link of the given limit.
    pub fn check_len(&self, max_packet_len: usize) -> Result<(), WireError> {
        let len = self.len_words();
        if len > max_packet_len {
            return Err(WireError::Oversized {
                len,
                max: max_packet_len,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} {}/{:#06b} [",
            self.src,
            self.dest,
            self.class(),
            self.kind.subclass_bits()
        )?;
        for (i, w) in self.payload.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "0x{w:04x}")?;
        }
        f.write_str("]")
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("packet has {0} words, at least 3 are required")]
    TooShort(usize),

    #[error("undefined register subclass 0b{0:04b}")]
    UndefinedSubclass(u8),

    #[error("subclass {0} does not fit in 4 bits")]
    SubclassOutOfRange(u8),

    #[error("address 0x{0:04x} does not fit in 10 bits")]
    AddressOutOfRange(u16),

    #[error("datagram of {0} bytes is not a whole number of words")]
    OddLength(usize),

    #[error("packet of {len} words exceeds the maximum packet length {max}")]
    Oversized { len: usize, max: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
