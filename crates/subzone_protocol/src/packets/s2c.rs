//! Server-to-client game packets.

use std::io::Write;

use crate::types::{Freq, PadStr, PlayerId, ShipType};
use crate::{Decode, Encode, GamePacket};

/// 0x01: tells a client its own player id.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct WhoAmIS2c {
    pub pid: PlayerId,
}

impl GamePacket for WhoAmIS2c {
    const ID: u8 = 0x01;
    const NAME: &'static str = "who_am_i";
}

impl Encode for WhoAmIS2c {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.pid.encode(w)
    }
}

impl Decode<'_> for WhoAmIS2c {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            pid: PlayerId::decode(r)?,
        })
    }
}

/// 0x02: the player-entering burst is complete; the client is in the arena.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct EnteringArenaS2c;

impl GamePacket for EnteringArenaS2c {
    const ID: u8 = 0x02;
    const NAME: &'static str = "entering_arena";
}

impl Encode for EnteringArenaS2c {
    fn encode(&self, _w: impl Write) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Decode<'_> for EnteringArenaS2c {
    fn decode(_r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

/// 0x03: announces a player in the arena (sent for each existing player on
/// entry, and for every later arrival).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PlayerEnteringS2c {
    pub ship: ShipType,
    pub accepts_audio: u8,
    pub name: PadStr<20>,
    pub squad: PadStr<20>,
    pub kill_points: i32,
    pub flag_points: i32,
    pub pid: PlayerId,
    pub freq: Freq,
    pub wins: u16,
    pub losses: u16,
    pub attached_to: i16,
    pub flags_carried: u16,
}

impl GamePacket for PlayerEnteringS2c {
    const ID: u8 = 0x03;
    const NAME: &'static str = "player_entering";
}

impl Encode for PlayerEnteringS2c {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.ship.encode(&mut w)?;
        self.accepts_audio.encode(&mut w)?;
        self.name.encode(&mut w)?;
        self.squad.encode(&mut w)?;
        self.kill_points.encode(&mut w)?;
        self.flag_points.encode(&mut w)?;
        self.pid.encode(&mut w)?;
        self.freq.encode(&mut w)?;
        self.wins.encode(&mut w)?;
        self.losses.encode(&mut w)?;
        self.attached_to.encode(&mut w)?;
        self.flags_carried.encode(&mut w)
    }
}

impl Decode<'_> for PlayerEnteringS2c {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            ship: ShipType::decode(r)?,
            accepts_audio: u8::decode(r)?,
            name: PadStr::decode(r)?,
            squad: PadStr::decode(r)?,
            kill_points: i32::decode(r)?,
            flag_points: i32::decode(r)?,
            pid: PlayerId::decode(r)?,
            freq: Freq::decode(r)?,
            wins: u16::decode(r)?,
            losses: u16::decode(r)?,
            attached_to: i16::decode(r)?,
            flags_carried: u16::decode(r)?,
        })
    }
}

/// 0x04: a player left the arena.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PlayerLeavingS2c {
    pub pid: PlayerId,
}

impl GamePacket for PlayerLeavingS2c {
    const ID: u8 = 0x04;
    const NAME: &'static str = "player_leaving";
}

impl Encode for PlayerLeavingS2c {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.pid.encode(w)
    }
}

impl Decode<'_> for PlayerLeavingS2c {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            pid: PlayerId::decode(r)?,
        })
    }
}

/// 0x06: a kill happened. `flag_count` is how many carried flags transferred
/// to the killer.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct KillS2c {
    pub green: u8,
    pub killer: PlayerId,
    pub killed: PlayerId,
    pub bounty: i16,
    pub flag_count: u16,
}

impl GamePacket for KillS2c {
    const ID: u8 = 0x06;
    const NAME: &'static str = "kill";
}

impl Encode for KillS2c {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.green.encode(&mut w)?;
        self.killer.encode(&mut w)?;
        self.killed.encode(&mut w)?;
        self.bounty.encode(&mut w)?;
        self.flag_count.encode(&mut w)
    }
}

impl Decode<'_> for KillS2c {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            green: u8::decode(r)?,
            killer: PlayerId::decode(r)?,
            killed: PlayerId::decode(r)?,
            bounty: i16::decode(r)?,
            flag_count: u16::decode(r)?,
        })
    }
}

/// Login result codes for [`LoginResponseS2c`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum LoginCode {
    Ok = 0x00,
    NewUser = 0x01,
    InvalidPassword = 0x02,
    ArenaFull = 0x03,
    LockedOut = 0x04,
    NoPermission = 0x05,
    ServerBusy = 0x06,
    TooNew = 0x07,
}

/// 0x0A: response to a login request.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LoginResponseS2c {
    pub code: u8,
    pub server_version: u32,
    pub registration_request: u8,
    pub news_checksum: u32,
}

impl GamePacket for LoginResponseS2c {
    const ID: u8 = 0x0A;
    const NAME: &'static str = "login_response";
}

impl Encode for LoginResponseS2c {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.code.encode(&mut w)?;
        self.server_version.encode(&mut w)?;
        self.registration_request.encode(&mut w)?;
        self.news_checksum.encode(&mut w)
    }
}

impl Decode<'_> for LoginResponseS2c {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            code: u8::decode(r)?,
            server_version: u32::decode(r)?,
            registration_request: u8::decode(r)?,
            news_checksum: u32::decode(r)?,
        })
    }
}

/// 0x12: a carry flag is on the map at a location, owned by a freq.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FlagLocationS2c {
    pub flag_id: u16,
    pub x: u16,
    pub y: u16,
    pub freq: Freq,
}

impl GamePacket for FlagLocationS2c {
    const ID: u8 = 0x12;
    const NAME: &'static str = "flag_location";
}

impl Encode for FlagLocationS2c {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.flag_id.encode(&mut w)?;
        self.x.encode(&mut w)?;
        self.y.encode(&mut w)?;
        self.freq.encode(&mut w)
    }
}

impl Decode<'_> for FlagLocationS2c {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            flag_id: u16::decode(r)?,
            x: u16::decode(r)?,
            y: u16::decode(r)?,
            freq: Freq::decode(r)?,
        })
    }
}

/// 0x13: a player picked up a flag (or, in turf mode, claimed it).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FlagPickupS2c {
    pub flag_id: u16,
    pub pid: PlayerId,
}

impl GamePacket for FlagPickupS2c {
    const ID: u8 = 0x13;
    const NAME: &'static str = "flag_pickup";
}

impl Encode for FlagPickupS2c {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.flag_id.encode(&mut w)?;
        self.pid.encode(&mut w)
    }
}

impl Decode<'_> for FlagPickupS2c {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            flag_id: u16::decode(r)?,
            pid: PlayerId::decode(r)?,
        })
    }
}

/// 0x14: the flag game was reset. Clients clear all flag state; a winning
/// freq and its reward may be attached.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FlagResetS2c {
    pub freq: Freq,
    pub points: i32,
}

impl GamePacket for FlagResetS2c {
    const ID: u8 = 0x14;
    const NAME: &'static str = "flag_reset";
}

impl Encode for FlagResetS2c {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.freq.encode(&mut w)?;
        self.points.encode(&mut w)
    }
}

impl Decode<'_> for FlagResetS2c {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            freq: Freq::decode(r)?,
            points: i32::decode(r)?,
        })
    }
}

/// 0x16: a player dropped every flag they carried.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FlagDropS2c {
    pub pid: PlayerId,
}

impl GamePacket for FlagDropS2c {
    const ID: u8 = 0x16;
    const NAME: &'static str = "flag_drop";
}

impl Encode for FlagDropS2c {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.pid.encode(w)
    }
}

impl Decode<'_> for FlagDropS2c {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            pid: PlayerId::decode(r)?,
        })
    }
}

/// 0x22: full turf-flag ownership table, one freq per flag id.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TurfFlagsS2c {
    pub owners: Vec<Freq>,
}

impl TurfFlagsS2c {
    /// Encoded size including the id byte: `1 + 2N`.
    pub fn wire_size(flag_count: usize) -> usize {
        1 + 2 * flag_count
    }
}

impl GamePacket for TurfFlagsS2c {
    const ID: u8 = 0x22;
    const NAME: &'static str = "turf_flags";
}

impl Encode for TurfFlagsS2c {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        for owner in &self.owners {
            owner.encode(&mut w)?;
        }
        Ok(())
    }
}

impl Decode<'_> for TurfFlagsS2c {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(r.len() % 2 == 0, "odd turf flag payload");
        let mut owners = Vec::with_capacity(r.len() / 2);
        while !r.is_empty() {
            owners.push(Freq::decode(r)?);
        }
        Ok(Self { owners })
    }
}
