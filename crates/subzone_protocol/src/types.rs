//! Shared wire-level types.

use std::fmt;
use std::io::Write;

use anyhow::bail;
use derive_more::{From, Into};

use crate::{take_bytes, Decode, Encode};

/// A player id, unique within the process while the player is connected.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, From, Into)]
pub struct PlayerId(pub u16);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Encode for PlayerId {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.0.encode(w)
    }
}

impl Decode<'_> for PlayerId {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self(u16::decode(r)?))
    }
}

/// A team ("freq") identifier.
pub type Freq = i16;

/// The freq that means "owned by nobody".
pub const NEUTRAL_FREQ: Freq = -1;

/// The eight ships plus spectator mode.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
#[repr(u8)]
pub enum ShipType {
    Warbird = 0,
    Javelin = 1,
    Spider = 2,
    Leviathan = 3,
    Terrier = 4,
    Weasel = 5,
    Lancaster = 6,
    Shark = 7,
    #[default]
    Spec = 8,
}

impl ShipType {
    pub fn from_wire(raw: u8) -> anyhow::Result<Self> {
        Ok(match raw {
            0 => Self::Warbird,
            1 => Self::Javelin,
            2 => Self::Spider,
            3 => Self::Leviathan,
            4 => Self::Terrier,
            5 => Self::Weasel,
            6 => Self::Lancaster,
            7 => Self::Shark,
            8 => Self::Spec,
            other => bail!("invalid ship {other}"),
        })
    }

    pub fn is_spec(self) -> bool {
        self == Self::Spec
    }
}

impl Encode for ShipType {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        (*self as u8).encode(w)
    }
}

impl Decode<'_> for ShipType {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Self::from_wire(u8::decode(r)?)
    }
}

/// A fixed-width, NUL-padded string field (player names, squad names, arena
/// names). Anything past the first NUL is ignored on decode; oversized input
/// is truncated on construction.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct PadStr<const N: usize>([u8; N]);

impl<const N: usize> PadStr<N> {
    pub fn new(s: &str) -> Self {
        let mut buf = [0u8; N];
        let bytes = s.as_bytes();
        let n = bytes.len().min(N);
        buf[..n].copy_from_slice(&bytes[..n]);
        Self(buf)
    }

    /// The string up to the first NUL, lossily decoded.
    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(N);
        String::from_utf8_lossy(&self.0[..end])
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

impl<const N: usize> Default for PadStr<N> {
    fn default() -> Self {
        Self([0; N])
    }
}

impl<const N: usize> fmt::Display for PadStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl<const N: usize> From<&str> for PadStr<N> {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl<const N: usize> Encode for PadStr<N> {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_all(&self.0)?)
    }
}

impl<const N: usize> Decode<'_> for PadStr<N> {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let bytes = take_bytes(r, N)?;
        Ok(Self(bytes.try_into().expect("length checked above")))
    }
}
