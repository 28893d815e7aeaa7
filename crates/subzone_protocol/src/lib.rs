#![doc = include_str!("../README.md")]

pub mod frame;
pub mod grouped;
mod impls;
pub mod packets;
pub mod seq;
pub mod types;

use std::io::Write;

use anyhow::ensure;
pub use bytes;
pub use frame::CorePacket;
pub use grouped::{GroupedIter, GroupedWriter};
pub use impls::RawBytes;
pub use seq::SequenceNr;
pub use types::{Freq, PadStr, PlayerId, ShipType, NEUTRAL_FREQ};

/// The maximum number of bytes in a single datagram, including all core
/// packet framing. Fixed by client compatibility.
pub const MAX_PACKET_SIZE: usize = 520;

/// The maximum size of a single item inside a grouped packet. Item lengths
/// are a single byte on the wire.
pub const MAX_GROUPED_ITEM: usize = 255;

/// Bytes of framing a reliable packet adds around its payload: the two core
/// header bytes plus the 4-byte sequence number.
pub const RELIABLE_HEADER_SIZE: usize = 6;

/// The `Encode` trait allows objects to be written to the wire. It is the
/// inverse of [`Decode`].
///
/// All multi-byte fields are little-endian, as the clients expect.
pub trait Encode {
    /// Writes this object to the provided writer.
    ///
    /// If this type also implements [`Decode`] then successful calls to this
    /// function returning `Ok(())` must always successfully [`decode`] using
    /// the data that was written to the writer. The exact number of bytes
    /// that were originally written must be consumed during the decoding.
    ///
    /// [`decode`]: Decode::decode
    fn encode(&self, w: impl Write) -> anyhow::Result<()>;

    /// Like [`Encode::encode`], but appends to a `Vec<u8>`.
    fn encode_to_vec(&self, buf: &mut Vec<u8>) -> anyhow::Result<()> {
        self.encode(&mut *buf)
    }
}

/// The `Decode` trait allows objects to be read from the wire. It is the
/// inverse of [`Encode`].
///
/// The lifetime `'a` is the lifetime of the input buffer, enabling
/// zero-copy payload slices.
pub trait Decode<'a>: Sized {
    /// Reads this object from the provided byte slice.
    ///
    /// Implementations must advance the slice past the bytes they consumed.
    fn decode(r: &mut &'a [u8]) -> anyhow::Result<Self>;
}

/// A game packet with a fixed one-byte type id.
///
/// Game packet ids never collide with the core header byte `0x00`.
pub trait GamePacket {
    /// The type id, i.e. the first byte on the wire.
    const ID: u8;
    /// Name for logging and error messages.
    const NAME: &'static str;
}

/// Encodes the id byte followed by the packet body.
pub fn encode_game_packet<P>(pkt: &P) -> anyhow::Result<Vec<u8>>
where
    P: GamePacket + Encode,
{
    let mut buf = vec![P::ID];
    pkt.encode(&mut buf)?;
    Ok(buf)
}

/// Decodes a full game packet (id byte + body). An error is returned if the
/// id does not match or if the input is not read to the end.
pub fn decode_game_packet<'a, P>(mut bytes: &'a [u8]) -> anyhow::Result<P>
where
    P: GamePacket + Decode<'a>,
{
    let id = u8::decode(&mut bytes)?;
    ensure!(id == P::ID, "expected {} (0x{:02x}), got 0x{id:02x}", P::NAME, P::ID);

    let pkt = P::decode(&mut bytes)?;

    ensure!(
        bytes.is_empty(),
        "missed {} bytes while decoding {}",
        bytes.len(),
        P::NAME
    );

    Ok(pkt)
}

/// Takes `n` bytes off the front of `r`, or fails if fewer remain.
pub(crate) fn take_bytes<'a>(r: &mut &'a [u8], n: usize) -> anyhow::Result<&'a [u8]> {
    ensure!(r.len() >= n, "unexpected end of packet ({} < {n} bytes)", r.len());
    let (head, tail) = r.split_at(n);
    *r = tail;
    Ok(head)
}
