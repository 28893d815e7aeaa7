//! The pluggable carry-flag rules.
//!
//! The module delegates every game decision to whatever
//! [`CarryFlagBehavior`] is on top of the arena broker's stack;
//! [`DefaultCarryBehavior`] implements the standard rules.

use std::sync::Arc;

use rand::Rng;
use rustc_hash::FxHashSet;
use subzone_protocol::packets::s2c::{FlagDropS2c, FlagLocationS2c, FlagPickupS2c};
use subzone_protocol::{Freq, NEUTRAL_FREQ};
use subzone_server::{Player, TileCoord};
use tracing::debug;

use crate::carry::{CarryFlagState, CarryGameCtx};
use crate::placement::{find_drop_spots, random_in_circle};
use crate::{FlagDropCallback, FlagPickupCallback};

/// Why carried flags are being re-placed on the map.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AdjustReason {
    ShipChange,
    FreqChange,
    LeaveArena,
    InSafe,
    Dropped,
}

/// The carry game's decision points. Implementations run on the mainloop.
pub trait CarryFlagBehavior: Send + Sync {
    /// Spawns a fresh set of flags at game start/reset.
    fn start_game(&self, ctx: &CarryGameCtx<'_>);

    /// A valid touch of `flag_id` by `player` (the module has already
    /// validated status, ship, and range).
    fn touch_flag(&self, ctx: &CarryGameCtx<'_>, player: &Arc<Player>, flag_id: u16);

    /// `killed` died to `killer` while carrying flags. Returns the number
    /// of flags transferred to the killer, which the kill packet carries in
    /// place of separate pickup packets.
    fn player_kill(&self, ctx: &CarryGameCtx<'_>, killed: &Arc<Player>, killer: &Arc<Player>)
        -> u16;

    /// Re-places `player`'s carried flags for `reason`.
    fn adjust_flags(
        &self,
        ctx: &CarryGameCtx<'_>,
        player: &Arc<Player>,
        reason: AdjustReason,
        old_freq: Freq,
    );
}

/// The standard rules.
pub struct DefaultCarryBehavior;

impl DefaultCarryBehavior {
    /// Current on-map flag locations, for collision avoidance.
    fn occupied(ctx: &CarryGameCtx<'_>) -> FxHashSet<TileCoord> {
        ctx.data
            .flags
            .lock()
            .iter()
            .filter_map(|f| match f.state {
                CarryFlagState::OnMap(loc) => Some(loc),
                _ => None,
            })
            .collect()
    }

    /// Places the given flags on the map around `target` (already resolved
    /// to either the spawn center or an event position), assigning owner
    /// `freq` or neutral. Unplaceable flags land on the spawn center.
    fn place_set(ctx: &CarryGameCtx<'_>, ids: &[u16], target: TileCoord, owned: bool, freq: Freq) {
        if ids.is_empty() {
            return;
        }
        let owner = if owned { freq } else { NEUTRAL_FREQ };
        let mut rng = rand::thread_rng();

        let spots = match &ctx.map {
            Some(map) => {
                let occupied = Self::occupied(ctx);
                find_drop_spots(
                    &**map,
                    &occupied,
                    target,
                    ids.len(),
                    ctx.settings.drop_radius,
                    &mut rng,
                )
            }
            None => Vec::new(),
        };

        let center = ctx.settings.spawn_center();
        let mut flags = ctx.data.flags.lock();
        for (i, &id) in ids.iter().enumerate() {
            let loc = spots.get(i).copied().unwrap_or(center);
            if let Some(flag) = flags.get_mut(id as usize) {
                flag.state = CarryFlagState::OnMap(loc);
                flag.owner = owner;
            }
        }
        let updates: Vec<FlagLocationS2c> = ids
            .iter()
            .filter_map(|&id| {
                let flag = flags.get(id as usize)?;
                let CarryFlagState::OnMap(loc) = flag.state else {
                    return None;
                };
                Some(FlagLocationS2c {
                    flag_id: id,
                    x: loc.x,
                    y: loc.y,
                    freq: flag.owner,
                })
            })
            .collect();
        drop(flags);

        for pkt in updates {
            ctx.broadcast(&pkt);
        }
    }

    fn carried_ids(ctx: &CarryGameCtx<'_>, player: &Arc<Player>) -> Vec<u16> {
        ctx.data
            .flags
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, f)| match f.state {
                CarryFlagState::Carried(pid) if pid == player.id() => Some(i as u16),
                _ => None,
            })
            .collect()
    }
}

impl CarryFlagBehavior for DefaultCarryBehavior {
    fn start_game(&self, ctx: &CarryGameCtx<'_>) {
        let s = &ctx.settings;
        let mut rng = rand::thread_rng();
        let count = if s.max_flags == 0 || s.max_flags < s.min_flags {
            0
        } else {
            rng.gen_range(s.min_flags..=s.max_flags)
        };

        {
            let mut flags = ctx.data.flags.lock();
            flags.clear();
            flags.resize_with(count as usize, Default::default);
        }
        if count == 0 {
            return;
        }

        let center = s.spawn_center();
        let ids: Vec<u16> = (0..count).collect();
        match &ctx.map {
            Some(_) => {
                // Scatter: each flag walks from its own random point in the
                // spawn circle.
                for id in ids {
                    let around = random_in_circle(
                        &**ctx.map.as_ref().expect("checked above"),
                        center,
                        s.spawn_radius,
                        &mut rng,
                    );
                    Self::place_set(ctx, &[id], around, false, NEUTRAL_FREQ);
                }
            }
            None => Self::place_set(ctx, &ids, center, false, NEUTRAL_FREQ),
        }
        debug!(arena = %ctx.arena.name(), count, "carry flag game started");
    }

    fn touch_flag(&self, ctx: &CarryGameCtx<'_>, player: &Arc<Player>, flag_id: u16) {
        let cap = ctx.settings.carry_cap();
        if player.flags_carried() >= cap {
            return;
        }

        {
            let mut flags = ctx.data.flags.lock();
            let Some(flag) = flags.get_mut(flag_id as usize) else {
                return;
            };
            if !matches!(flag.state, CarryFlagState::OnMap(_)) {
                return;
            }
            flag.state = CarryFlagState::Carried(player.id());
            flag.owner = player.state().freq;
        }
        player.add_flags_carried(1);

        ctx.broadcast(&FlagPickupS2c {
            flag_id,
            pid: player.id(),
        });
        ctx.arena.broker().fire_callback::<FlagPickupCallback>(&(
            Arc::clone(ctx.arena),
            Arc::clone(player),
            flag_id,
        ));
    }

    fn player_kill(
        &self,
        ctx: &CarryGameCtx<'_>,
        killed: &Arc<Player>,
        killer: &Arc<Player>,
    ) -> u16 {
        let carried = Self::carried_ids(ctx, killed);
        if carried.is_empty() {
            return 0;
        }

        let killed_freq = killed.state().freq;
        let killer_freq = killer.state().freq;
        let team_kill = killed_freq == killer_freq;
        let cap = ctx.settings.carry_cap();

        let mut transferred = 0u16;
        let mut team_kill_set = Vec::new();
        let mut drop_set = Vec::new();

        {
            let mut flags = ctx.data.flags.lock();
            for &id in &carried {
                let Some(flag) = flags.get_mut(id as usize) else {
                    continue;
                };
                if team_kill && !ctx.settings.friendly_transfer {
                    team_kill_set.push(id);
                } else if killer.flags_carried() + transferred < cap {
                    // The kill packet's transfer count stands in for pickup
                    // packets; clients move the flags themselves.
                    flag.state = CarryFlagState::Carried(killer.id());
                    flag.owner = killer_freq;
                    transferred += 1;
                } else {
                    drop_set.push(id);
                }
            }
        }

        killed.set_flags_carried(0);
        killer.add_flags_carried(transferred);

        let killed_pos = ctx.player_tile(killed);
        let s = &ctx.settings;

        let tk_target = if s.tk_center { s.spawn_center() } else { killed_pos };
        Self::place_set(ctx, &team_kill_set, tk_target, s.tk_owned, killed_freq);

        let drop_target = if s.drop_center { s.spawn_center() } else { killed_pos };
        Self::place_set(ctx, &drop_set, drop_target, s.drop_owned, killed_freq);

        if !team_kill_set.is_empty() || !drop_set.is_empty() {
            ctx.arena
                .broker()
                .fire_callback::<FlagDropCallback>(&(Arc::clone(ctx.arena), killed.id()));
        }

        transferred
    }

    fn adjust_flags(
        &self,
        ctx: &CarryGameCtx<'_>,
        player: &Arc<Player>,
        reason: AdjustReason,
        old_freq: Freq,
    ) {
        let carried = Self::carried_ids(ctx, player);
        if carried.is_empty() {
            return;
        }
        player.set_flags_carried(0);

        let s = &ctx.settings;
        let (owned, centered) = match reason {
            AdjustReason::InSafe => (s.safe_owned, s.safe_center),
            AdjustReason::ShipChange
            | AdjustReason::FreqChange
            | AdjustReason::LeaveArena
            | AdjustReason::Dropped => (s.drop_owned, s.drop_center),
        };
        let target = if centered {
            s.spawn_center()
        } else {
            ctx.player_tile(player)
        };

        ctx.broadcast(&FlagDropS2c { pid: player.id() });
        Self::place_set(ctx, &carried, target, owned, old_freq);
        ctx.arena
            .broker()
            .fire_callback::<FlagDropCallback>(&(Arc::clone(ctx.arena), player.id()));
    }
}
