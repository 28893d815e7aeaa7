//! The `0x00` core packet layer.
//!
//! Datagrams whose first byte is `0x00` carry transport control traffic: the
//! connection-init handshake, the reliable stream, acknowledgements, clock
//! sync, big/sized data transfers, and grouped packets. Anything else is a
//! raw game packet and is delivered to the application unreliably.

use anyhow::{bail, ensure};

use crate::seq::SequenceNr;
use crate::Decode;

/// First byte of every core packet.
pub const CORE_HEADER: u8 = 0x00;

/// Client flavors announced in conn-init. Selects the encryption scheme.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ClientKind {
    /// The original VIE client ("subspace.exe").
    Vie,
    /// The Continuum client.
    Continuum,
}

impl ClientKind {
    fn from_wire(raw: u16) -> anyhow::Result<Self> {
        match raw {
            0x01 => Ok(Self::Vie),
            0x11 => Ok(Self::Continuum),
            other => bail!("unknown conn-init client kind 0x{other:02x}"),
        }
    }

    fn to_wire(self) -> u16 {
        match self {
            Self::Vie => 0x01,
            Self::Continuum => 0x11,
        }
    }

    /// The encryption scheme name this kind selects.
    pub fn encryption_name(self) -> &'static str {
        match self {
            Self::Vie => "enc-vie",
            Self::Continuum => "enc-cont",
        }
    }
}

/// A decoded core packet. Payload-bearing variants borrow from the input
/// datagram.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CorePacket<'a> {
    /// 0x01: key negotiation, both directions.
    ConnInit { key: i32, kind: ClientKind },
    /// 0x02: completes the key exchange.
    ConnInitResponse { key: i32 },
    /// 0x03: sequenced payload requiring acknowledgement.
    Reliable { seq: SequenceNr, data: &'a [u8] },
    /// 0x04: acknowledges one reliable sequence number.
    Ack { seq: SequenceNr },
    /// 0x05: clock sync request (client to server).
    SyncRequest {
        time: u32,
        pkts_sent: u32,
        pkts_received: u32,
    },
    /// 0x06: clock sync response, mirroring the request timestamp.
    SyncResponse { client_time: u32, server_time: u32 },
    /// 0x07: the remote end wants to tear down the connection.
    Disconnect,
    /// 0x08: one chunk of a big-data transfer.
    BigChunk { data: &'a [u8] },
    /// 0x09: the final chunk; the accumulated buffer is delivered.
    BigTail { data: &'a [u8] },
    /// 0x0A: one chunk of a sized-data stream, tagged with the total size.
    SizedChunk { total: u32, data: &'a [u8] },
    /// 0x0B: the client asks the server to stop a sized-data stream.
    CancelSized,
    /// 0x0C: the server confirms the stream is stopped.
    CancelSizedAck,
    /// 0x0E: length-prefixed concatenation of smaller packets.
    Grouped { data: &'a [u8] },
}

impl<'a> CorePacket<'a> {
    /// Whether a datagram is core traffic (as opposed to a raw game packet).
    pub fn is_core(datagram: &[u8]) -> bool {
        datagram.first() == Some(&CORE_HEADER)
    }

    /// Decodes a whole core datagram, header byte included.
    pub fn decode(datagram: &'a [u8]) -> anyhow::Result<Self> {
        let mut r = datagram;

        let header = u8::decode(&mut r)?;
        ensure!(header == CORE_HEADER, "not a core packet (0x{header:02x})");

        let subtype = u8::decode(&mut r)?;

        Ok(match subtype {
            0x01 => {
                let key = i32::decode(&mut r)?;
                let kind = ClientKind::from_wire(u16::decode(&mut r)?)?;
                Self::ConnInit { key, kind }
            }
            0x02 => Self::ConnInitResponse {
                key: i32::decode(&mut r)?,
            },
            0x03 => Self::Reliable {
                seq: SequenceNr(u32::decode(&mut r)?),
                data: std::mem::take(&mut r),
            },
            0x04 => Self::Ack {
                seq: SequenceNr(u32::decode(&mut r)?),
            },
            0x05 => Self::SyncRequest {
                time: u32::decode(&mut r)?,
                pkts_sent: u32::decode(&mut r)?,
                pkts_received: u32::decode(&mut r)?,
            },
            0x06 => Self::SyncResponse {
                client_time: u32::decode(&mut r)?,
                server_time: u32::decode(&mut r)?,
            },
            0x07 => Self::Disconnect,
            0x08 => Self::BigChunk {
                data: std::mem::take(&mut r),
            },
            0x09 => Self::BigTail {
                data: std::mem::take(&mut r),
            },
            0x0A => Self::SizedChunk {
                total: u32::decode(&mut r)?,
                data: std::mem::take(&mut r),
            },
            0x0B => Self::CancelSized,
            0x0C => Self::CancelSizedAck,
            0x0D => bail!("cluster packets are unused"),
            0x0E => Self::Grouped {
                data: std::mem::take(&mut r),
            },
            other => bail!("unknown core packet subtype 0x{other:02x}"),
        })
    }

    /// Appends the encoded packet (header included) to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(CORE_HEADER);
        match *self {
            Self::ConnInit { key, kind } => {
                buf.push(0x01);
                buf.extend_from_slice(&key.to_le_bytes());
                buf.extend_from_slice(&kind.to_wire().to_le_bytes());
            }
            Self::ConnInitResponse { key } => {
                buf.push(0x02);
                buf.extend_from_slice(&key.to_le_bytes());
            }
            Self::Reliable { seq, data } => {
                buf.push(0x03);
                buf.extend_from_slice(&seq.0.to_le_bytes());
                buf.extend_from_slice(data);
            }
            Self::Ack { seq } => {
                buf.push(0x04);
                buf.extend_from_slice(&seq.0.to_le_bytes());
            }
            Self::SyncRequest {
                time,
                pkts_sent,
                pkts_received,
            } => {
                buf.push(0x05);
                buf.extend_from_slice(&time.to_le_bytes());
                buf.extend_from_slice(&pkts_sent.to_le_bytes());
                buf.extend_from_slice(&pkts_received.to_le_bytes());
            }
            Self::SyncResponse {
                client_time,
                server_time,
            } => {
                buf.push(0x06);
                buf.extend_from_slice(&client_time.to_le_bytes());
                buf.extend_from_slice(&server_time.to_le_bytes());
            }
            Self::Disconnect => buf.push(0x07),
            Self::BigChunk { data } => {
                buf.push(0x08);
                buf.extend_from_slice(data);
            }
            Self::BigTail { data } => {
                buf.push(0x09);
                buf.extend_from_slice(data);
            }
            Self::SizedChunk { total, data } => {
                buf.push(0x0A);
                buf.extend_from_slice(&total.to_le_bytes());
                buf.extend_from_slice(data);
            }
            Self::CancelSized => buf.push(0x0B),
            Self::CancelSizedAck => buf.push(0x0C),
            Self::Grouped { data } => {
                buf.push(0x0E);
                buf.extend_from_slice(data);
            }
        }
    }

    /// Encodes into a fresh buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn core_round_trip() {
        let payload = [0x22, 1, 0, 2, 0];
        let cases = [
            CorePacket::ConnInit {
                key: -12345,
                kind: ClientKind::Vie,
            },
            CorePacket::ConnInitResponse { key: 12345 },
            CorePacket::Reliable {
                seq: SequenceNr(0xFFFF_FFFF),
                data: &payload,
            },
            CorePacket::Ack {
                seq: SequenceNr(7),
            },
            CorePacket::SyncRequest {
                time: 123,
                pkts_sent: 4,
                pkts_received: 5,
            },
            CorePacket::SyncResponse {
                client_time: 123,
                server_time: 456,
            },
            CorePacket::Disconnect,
            CorePacket::BigChunk { data: &payload },
            CorePacket::BigTail { data: &payload },
            CorePacket::SizedChunk {
                total: 512 * 1024,
                data: &payload,
            },
            CorePacket::CancelSized,
            CorePacket::CancelSizedAck,
            CorePacket::Grouped { data: &payload },
        ];

        for pkt in cases {
            let bytes = pkt.to_vec();
            assert!(CorePacket::is_core(&bytes));
            assert_eq!(CorePacket::decode(&bytes).unwrap(), pkt);
        }
    }

    #[test]
    fn reliable_header_is_six_bytes() {
        let bytes = CorePacket::Reliable {
            seq: SequenceNr(1),
            data: &[],
        }
        .to_vec();
        assert_eq!(bytes.len(), crate::RELIABLE_HEADER_SIZE);
    }

    #[test]
    fn rejects_cluster_and_unknown_subtypes() {
        assert!(CorePacket::decode(&[0x00, 0x0D]).is_err());
        assert!(CorePacket::decode(&[0x00, 0x0F]).is_err());
        assert!(CorePacket::decode(&[0x01, 0x03]).is_err());
    }

    #[test]
    fn truncated_packets_fail() {
        assert!(CorePacket::decode(&[0x00, 0x03, 1, 2]).is_err());
        assert!(CorePacket::decode(&[0x00, 0x01, 1, 2, 3, 4]).is_err());
    }
}
