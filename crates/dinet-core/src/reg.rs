//! Register access vocabulary shared by targets and hosts.
//!
//! A register transaction is one request packet and exactly one response.
//! The request payload starts with the 16-bit register address; a write
//! carries the value after it, split into 16-bit words most significant
//! first. A successful read answers with those value words alone.

use std::fmt;

use crate::wire::{DiAddr, Packet, PacketKind, RegKind, WireError};

// ── Widths ────────────────────────────────────────────────────────────────────

/// Width of a register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum RegWidth {
    W16,
    W32,
    W64,
    W128,
}

impl RegWidth {
    pub const ALL: [RegWidth; 4] = [RegWidth::W16, RegWidth::W32, RegWidth::W64, RegWidth::W128];

    pub const fn bits(self) -> u32 {
        16 << self.index()
    }

    /// Number of 16-bit words a value of this width occupies.
    pub const fn words(self) -> usize {
        1 << self.index()
    }

    /// The two low subclass bits that encode this width.
    pub const fn index(self) -> u8 {
        match self {
            RegWidth::W16 => 0,
            RegWidth::W32 => 1,
            RegWidth::W64 => 2,
            RegWidth::W128 => 3,
        }
    }

    pub const fn from_index(index: u8) -> Self {
        match index & 0b11 {
            0 => RegWidth::W16,
            1 => RegWidth::W32,
            2 => RegWidth::W64,
            _ => RegWidth::W128,
        }
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|w| w.bits() == bits)
    }

    /// All-ones value of this width.
    pub const fn mask(self) -> u128 {
        match self {
            RegWidth::W128 => u128::MAX,
            w => (1u128 << w.bits()) - 1,
        }
    }

    /// True when `value` has no bits set above this width.
    pub const fn fits(self, value: u128) -> bool {
        value & !self.mask() == 0
    }
}

impl TryFrom<u32> for RegWidth {
    type Error = String;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        Self::from_bits(bits).ok_or_else(|| format!("unsupported register width {bits}"))
    }
}

impl From<RegWidth> for u32 {
    fn from(w: RegWidth) -> u32 {
        w.bits()
    }
}

impl fmt::Display for RegWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

/// Split a value into `width.words()` words, most significant first.
pub fn value_to_words(value: u128, width: RegWidth) -> Vec<u16> {
    (0..width.words())
        .rev()
        .map(|i| (value >> (16 * i)) as u16)
        .collect()
}

/// Join words, most significant first, into one value.
pub fn words_to_value(words: &[u16]) -> u128 {
    words
        .iter()
        .fold(0u128, |acc, w| (acc << 16) | u128::from(*w))
}

// ── Transactions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegOp {
    Read,
    Write(u128),
}

/// A single register request, independent of who sends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterTransaction {
    pub address: u16,
    pub width: RegWidth,
    pub op: RegOp,
}

impl RegisterTransaction {
    pub fn read(address: u16, width: RegWidth) -> Self {
        Self {
            address,
            width,
            op: RegOp::Read,
        }
    }

    pub fn write(address: u16, width: RegWidth, value: u128) -> Self {
        Self {
            address,
            width,
            op: RegOp::Write(value & width.mask()),
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self.op, RegOp::Write(_))
    }

    pub fn request_kind(&self) -> RegKind {
        match self.op {
            RegOp::Read => RegKind::ReadRequest(self.width),
            RegOp::Write(_) => RegKind::WriteRequest(self.width),
        }
    }

    pub fn request_payload(&self) -> Vec<u16> {
        let mut payload = vec![self.address];
        if let RegOp::Write(value) = self.op {
            payload.extend(value_to_words(value, self.width));
        }
        payload
    }

    pub fn into_request(self, dest: DiAddr, src: DiAddr) -> Packet {
        Packet::new(
            dest,
            src,
            PacketKind::Register(self.request_kind()),
            self.request_payload(),
        )
    }

    /// Interpret a request packet's subclass and payload.
    ///
    /// Fails with [`RegFormatError`] when the payload length does not
    /// match what the subclass requires.
    pub fn parse(kind: RegKind, payload: &[u16]) -> Result<Self, RegFormatError> {
        let (address, rest) = payload
            .split_first()
            .ok_or(RegFormatError::MissingAddress)?;
        match kind {
            RegKind::ReadRequest(width) => {
                if !rest.is_empty() {
                    return Err(RegFormatError::PayloadLength {
                        expected: 1,
                        actual: payload.len(),
                    });
                }
                Ok(Self::read(*address, width))
            }
            RegKind::WriteRequest(width) => {
                if rest.len() != width.words() {
                    return Err(RegFormatError::PayloadLength {
                        expected: 1 + width.words(),
                        actual: payload.len(),
                    });
                }
                Ok(Self::write(*address, width, words_to_value(rest)))
            }
            other => Err(RegFormatError::NotARequest(other)),
        }
    }

    /// The successful response packet to `request` carrying `value`.
    pub fn success_response(&self, request: &Packet, value: u128) -> Packet {
        match self.op {
            RegOp::Read => request.reply(
                PacketKind::Register(RegKind::ReadSuccess(self.width)),
                value_to_words(value, self.width),
            ),
            RegOp::Write(_) => request.reply(PacketKind::Register(RegKind::WriteSuccess), vec![]),
        }
    }

    /// The error response to `request`.
    pub fn error_response(&self, request: &Packet) -> Packet {
        let kind = match self.op {
            RegOp::Read => RegKind::ReadError,
            RegOp::Write(_) => RegKind::WriteError,
        };
        request.reply(PacketKind::Register(kind), vec![])
    }
}

impl fmt::Display for RegisterTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            RegOp::Read => write!(f, "read{} 0x{:04x}", self.width, self.address),
            RegOp::Write(v) => write!(f, "write{} 0x{:04x} = {:#x}", self.width, self.address, v),
        }
    }
}

// ── Register maps ─────────────────────────────────────────────────────────────

/// Addresses at or above this go to the module-specific backend.
pub const DEFAULT_BACKEND_BOUNDARY: u16 = 0x200;

/// Base registers every module implements.
pub mod base {
    pub const MOD_VENDOR: u16 = 0x0000;
    pub const MOD_TYPE: u16 = 0x0001;
    pub const MOD_VERSION: u16 = 0x0002;
    /// Control and status. Bit 0 enables event emission.
    pub const MOD_CS: u16 = 0x0003;
    /// Event destination address, 10 bits.
    pub const MOD_EVENT_DEST: u16 = 0x0004;

    pub const CS_ACTIVE: u16 = 1 << 0;
    pub const EVENT_DEST_MASK: u16 = 0x03ff;
}

/// Subnet control module registers.
pub mod scm {
    pub const SYSTEM_VENDOR_ID: u16 = 0x0200;
    pub const SYSTEM_DEVICE_ID: u16 = 0x0201;
    pub const NUM_MOD: u16 = 0x0202;
    pub const MAX_PKT_LEN: u16 = 0x0203;
    /// Bit 0 holds the system in reset, bit 1 the CPUs.
    pub const SYSRST: u16 = 0x0204;

    pub const SYSRST_SYS: u16 = 1 << 0;
    pub const SYSRST_CPU: u16 = 1 << 1;
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegFormatError {
    #[error("register packet has no address word")]
    MissingAddress,

    #[error("register payload has {actual} words, expected {expected}")]
    PayloadLength { expected: usize, actual: usize },

    #[error("{0:?} is not a register request")]
    NotARequest(RegKind),

    #[error(transparent)]
    Wire(#[from] WireError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
