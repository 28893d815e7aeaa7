//! Client-to-server game packets.

use std::io::Write;

use bitfield_struct::bitfield;

use crate::types::{PadStr, ShipType};
use crate::{Decode, Encode, GamePacket};

/// 0x01: request to enter an arena.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct GoArenaC2s {
    pub ship: ShipType,
    pub obscenity_filter: u8,
    pub wav_messages: u8,
    pub x_res: i16,
    pub y_res: i16,
    /// >= 0 selects a numbered public arena, -3 a named arena, -2 any public.
    pub arena_type: i16,
    pub arena_name: PadStr<16>,
}

impl GamePacket for GoArenaC2s {
    const ID: u8 = 0x01;
    const NAME: &'static str = "go_arena";
}

impl Encode for GoArenaC2s {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.ship.encode(&mut w)?;
        self.obscenity_filter.encode(&mut w)?;
        self.wav_messages.encode(&mut w)?;
        self.x_res.encode(&mut w)?;
        self.y_res.encode(&mut w)?;
        self.arena_type.encode(&mut w)?;
        self.arena_name.encode(&mut w)
    }
}

impl Decode<'_> for GoArenaC2s {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            ship: ShipType::decode(r)?,
            obscenity_filter: u8::decode(r)?,
            wav_messages: u8::decode(r)?,
            x_res: i16::decode(r)?,
            y_res: i16::decode(r)?,
            arena_type: i16::decode(r)?,
            arena_name: PadStr::decode(r)?,
        })
    }
}

/// 0x02: leave the current arena.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct LeaveArenaC2s;

impl GamePacket for LeaveArenaC2s {
    const ID: u8 = 0x02;
    const NAME: &'static str = "leave_arena";
}

impl Encode for LeaveArenaC2s {
    fn encode(&self, _w: impl Write) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Decode<'_> for LeaveArenaC2s {
    fn decode(_r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

/// Status bits carried in every position packet.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct PositionStatus {
    pub stealth: bool,
    pub cloak: bool,
    pub x_radar: bool,
    pub anti_warp: bool,
    pub flash: bool,
    pub safe_zone: bool,
    pub ufo: bool,
    #[bits(1)]
    _padding: u8,
}

impl Encode for PositionStatus {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.into_bits().encode(w)
    }
}

impl Decode<'_> for PositionStatus {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self::from_bits(u8::decode(r)?))
    }
}

/// 0x03: periodic position report.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PositionC2s {
    pub rotation: i8,
    pub time: u16,
    pub x_speed: i16,
    pub y: i16,
    pub checksum: u8,
    pub status: PositionStatus,
    pub x: i16,
    pub y_speed: i16,
    pub bounty: u16,
    pub energy: i16,
    pub weapon: u16,
}

impl GamePacket for PositionC2s {
    const ID: u8 = 0x03;
    const NAME: &'static str = "position";
}

impl Encode for PositionC2s {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.rotation.encode(&mut w)?;
        self.time.encode(&mut w)?;
        self.x_speed.encode(&mut w)?;
        self.y.encode(&mut w)?;
        self.checksum.encode(&mut w)?;
        self.status.encode(&mut w)?;
        self.x.encode(&mut w)?;
        self.y_speed.encode(&mut w)?;
        self.bounty.encode(&mut w)?;
        self.energy.encode(&mut w)?;
        self.weapon.encode(&mut w)
    }
}

impl Decode<'_> for PositionC2s {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            rotation: i8::decode(r)?,
            time: u16::decode(r)?,
            x_speed: i16::decode(r)?,
            y: i16::decode(r)?,
            checksum: u8::decode(r)?,
            status: PositionStatus::decode(r)?,
            x: i16::decode(r)?,
            y_speed: i16::decode(r)?,
            bounty: u16::decode(r)?,
            energy: i16::decode(r)?,
            weapon: u16::decode(r)?,
        })
    }
}

/// 0x09: login request.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LoginC2s {
    pub new_user: u8,
    pub name: PadStr<32>,
    pub password: PadStr<32>,
    pub machine_id: u32,
    pub conn_type: u8,
    pub time_zone: i16,
    pub client_version: u16,
}

impl GamePacket for LoginC2s {
    const ID: u8 = 0x09;
    const NAME: &'static str = "login";
}

impl Encode for LoginC2s {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.new_user.encode(&mut w)?;
        self.name.encode(&mut w)?;
        self.password.encode(&mut w)?;
        self.machine_id.encode(&mut w)?;
        self.conn_type.encode(&mut w)?;
        self.time_zone.encode(&mut w)?;
        self.client_version.encode(&mut w)
    }
}

impl Decode<'_> for LoginC2s {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            new_user: u8::decode(r)?,
            name: PadStr::decode(r)?,
            password: PadStr::decode(r)?,
            machine_id: u32::decode(r)?,
            conn_type: u8::decode(r)?,
            time_zone: i16::decode(r)?,
            client_version: u16::decode(r)?,
        })
    }
}

/// 0x1B: the player flew over a turf flag.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct TouchFlagC2s {
    pub flag_id: u16,
}

impl GamePacket for TouchFlagC2s {
    const ID: u8 = 0x1B;
    const NAME: &'static str = "touch_flag";
}

impl Encode for TouchFlagC2s {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.flag_id.encode(w)
    }
}

impl Decode<'_> for TouchFlagC2s {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            flag_id: u16::decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{decode_game_packet, encode_game_packet};

    #[test]
    fn position_round_trip() {
        let pkt = PositionC2s {
            rotation: 17,
            time: 60000,
            x_speed: -300,
            y: 8192,
            checksum: 0xA5,
            status: PositionStatus::new().with_cloak(true).with_safe_zone(true),
            x: -8192,
            y_speed: 120,
            bounty: 240,
            energy: 1500,
            weapon: 0,
        };

        let bytes = encode_game_packet(&pkt).unwrap();
        assert_eq!(bytes[0], PositionC2s::ID);
        assert_eq!(bytes.len(), 20);
        assert_eq!(decode_game_packet::<PositionC2s>(&bytes).unwrap(), pkt);
    }

    #[test]
    fn login_round_trip() {
        let pkt = LoginC2s {
            new_user: 0,
            name: "pilot one".into(),
            password: "hunter2".into(),
            machine_id: 0xDEAD_BEEF,
            conn_type: 1,
            time_zone: 240,
            client_version: 134,
        };

        let bytes = encode_game_packet(&pkt).unwrap();
        assert_eq!(decode_game_packet::<LoginC2s>(&bytes).unwrap(), pkt);
    }

    #[test]
    fn trailing_garbage_is_an_error() {
        let mut bytes = encode_game_packet(&TouchFlagC2s { flag_id: 3 }).unwrap();
        bytes.push(0);
        assert!(decode_game_packet::<TouchFlagC2s>(&bytes).is_err());
    }
}
