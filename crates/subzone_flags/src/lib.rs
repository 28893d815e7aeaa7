#![doc = include_str!("../README.md")]

pub mod behavior;
pub mod carry;
mod placement;
pub mod static_game;

use std::sync::Arc;

pub use behavior::{AdjustReason, CarryFlagBehavior, DefaultCarryBehavior};
pub use carry::{
    CarryArenaData, CarryFlag, CarryFlagGame, CarryFlagModule, CarryFlagState, CarryGameCtx,
    CarrySettings,
};
pub use static_game::{StaticFlagGame, StaticFlagModule};
use subzone_broker::Callback;
use subzone_protocol::{Freq, PlayerId};
use subzone_server::{Arena, ConfigExt, ConfigProvider, Player};

/// What `[Flag] CarryFlags` selects: turf (static) flags, or carry flags
/// with a per-player cap.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FlagMode {
    /// `None`/`0`: flags are fixed turf tiles.
    Static,
    /// Anything else: movable flags; a player may carry up to this many.
    Carry(u16),
}

impl FlagMode {
    /// Reads `[Flag] CarryFlags`. `None`/`0` selects static mode, `Yes`/`1`
    /// carry mode with an effectively unlimited cap, and `N >= 2` carry mode
    /// capped at `N - 1`.
    pub fn from_config(cfg: &dyn ConfigProvider) -> Self {
        let raw = cfg.get_str("Flag", "CarryFlags", "None");
        match raw.trim() {
            "None" | "none" | "0" | "" => Self::Static,
            "Yes" | "yes" | "1" => Self::Carry(256),
            other => match other.parse::<u16>() {
                Ok(n) if n >= 2 => Self::Carry(n - 1),
                _ => Self::Static,
            },
        }
    }

    pub fn is_carry(self) -> bool {
        matches!(self, Self::Carry(_))
    }
}

/// Fired on the arena broker when a flag game resets.
pub struct FlagGameResetCallback;

impl Callback for FlagGameResetCallback {
    type Args = Arc<Arena>;
}

/// Fired on the arena broker for every valid turf-flag touch, rate limiting
/// notwithstanding: `(arena, player, flag_id, old_freq, new_freq)`.
pub struct StaticFlagClaimedCallback;

impl Callback for StaticFlagClaimedCallback {
    type Args = (Arc<Arena>, Arc<Player>, u16, Freq, Freq);
}

/// Fired on the arena broker when a player picks up a carry flag:
/// `(arena, player, flag_id)`.
pub struct FlagPickupCallback;

impl Callback for FlagPickupCallback {
    type Args = (Arc<Arena>, Arc<Player>, u16);
}

/// Fired on the arena broker when a player's carried flags leave them
/// (drop, kill placement, adjustment): `(arena, player_id)`.
pub struct FlagDropCallback;

impl Callback for FlagDropCallback {
    type Args = (Arc<Arena>, PlayerId);
}

/// Operations common to both flag games, exposed on the arena broker.
pub trait FlagGame: Send + Sync {
    /// Restarts the game: static owners go neutral, carry flags respawn.
    fn reset_game(&self, arena: &Arc<Arena>);

    /// Total number of flags in this arena's game.
    fn flag_count(&self, arena: &Arc<Arena>) -> usize;

    /// Number of flags owned by `freq`.
    fn freq_flag_count(&self, arena: &Arc<Arena>, freq: Freq) -> usize;

    /// Owner of one flag; `None` when the id is out of range.
    fn flag_owner(&self, arena: &Arc<Arena>, flag_id: u16) -> Option<Freq>;
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use subzone_server::TableConfig;

    use super::*;

    #[test]
    fn carry_flags_config_parsing() {
        let cfg = TableConfig::new();
        assert_eq!(FlagMode::from_config(&cfg), FlagMode::Static);

        cfg.set("Flag", "CarryFlags", "None");
        assert_eq!(FlagMode::from_config(&cfg), FlagMode::Static);

        cfg.set("Flag", "CarryFlags", "Yes");
        assert_eq!(FlagMode::from_config(&cfg), FlagMode::Carry(256));

        cfg.set("Flag", "CarryFlags", "3");
        assert_eq!(FlagMode::from_config(&cfg), FlagMode::Carry(2));

        cfg.set("Flag", "CarryFlags", "garbage");
        assert_eq!(FlagMode::from_config(&cfg), FlagMode::Static);
    }
}
