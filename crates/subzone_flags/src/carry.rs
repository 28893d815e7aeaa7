//! The carry flag game module.

use std::sync::{Arc, Weak};

use anyhow::Context;
use parking_lot::Mutex;
use subzone_broker::{CallbackToken, ComponentBroker, InterfaceLease, InterfaceToken, Module};
use subzone_protocol::packets::c2s::TouchFlagC2s;
use subzone_protocol::{decode_game_packet, encode_game_packet, Encode, Freq, GamePacket, PlayerId, NEUTRAL_FREQ};
use subzone_server::{
    Arena, ArenaAction, ArenaActionCallback, ArenaManager, ConfigExt, MapData, Network, Player,
    PlayerAction, PlayerActionCallback, PlayerRegistry, PlayerStatus, Reliability, TileCoord,
};
use tracing::{debug, warn};

use crate::behavior::{AdjustReason, CarryFlagBehavior, DefaultCarryBehavior};
use crate::{FlagGame, FlagGameResetCallback, FlagMode};

/// One carry flag. Exactly one of on-map location or carrier is meaningful
/// outside `None`.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub enum CarryFlagState {
    /// Not in play (between games, or beyond the current count).
    #[default]
    None,
    OnMap(TileCoord),
    Carried(PlayerId),
}

#[derive(Copy, Clone, Debug)]
pub struct CarryFlag {
    pub state: CarryFlagState,
    pub owner: Freq,
}

impl Default for CarryFlag {
    fn default() -> Self {
        Self {
            state: CarryFlagState::None,
            owner: NEUTRAL_FREQ,
        }
    }
}

/// Per-arena flag array, stored in an arena extra-data slot.
#[derive(Default)]
pub struct CarryArenaData {
    pub flags: Mutex<Vec<CarryFlag>>,
}

/// `[Flag]` settings governing the carry game, read per arena.
#[derive(Copy, Clone, Debug)]
pub struct CarrySettings {
    pub mode: FlagMode,
    pub min_flags: u16,
    pub max_flags: u16,
    pub friendly_transfer: bool,
    pub drop_owned: bool,
    pub drop_center: bool,
    pub tk_owned: bool,
    pub tk_center: bool,
    pub safe_owned: bool,
    pub safe_center: bool,
    pub spawn_x: u16,
    pub spawn_y: u16,
    pub spawn_radius: u32,
    pub drop_radius: u32,
}

impl CarrySettings {
    pub fn from_arena(arena: &Arena) -> Self {
        let cfg = arena.config();
        Self {
            mode: FlagMode::from_config(&**cfg),
            min_flags: cfg.get_u32("Flag", "MinFlags", 0) as u16,
            max_flags: cfg.get_u32("Flag", "MaxFlags", 0) as u16,
            friendly_transfer: cfg.get_bool("Flag", "FriendlyTransfer", false),
            drop_owned: cfg.get_bool("Flag", "DropOwned", false),
            drop_center: cfg.get_bool("Flag", "DropCenter", false),
            tk_owned: cfg.get_bool("Flag", "TKOwned", false),
            tk_center: cfg.get_bool("Flag", "TKCenter", false),
            safe_owned: cfg.get_bool("Flag", "SafeOwned", false),
            safe_center: cfg.get_bool("Flag", "SafeCenter", false),
            spawn_x: cfg.get_u32("Flag", "SpawnX", 512) as u16,
            spawn_y: cfg.get_u32("Flag", "SpawnY", 512) as u16,
            spawn_radius: cfg.get_u32("Flag", "SpawnRadius", 50),
            drop_radius: cfg.get_u32("Flag", "DropRadius", 20),
        }
    }

    pub fn spawn_center(&self) -> TileCoord {
        TileCoord::new(self.spawn_x, self.spawn_y)
    }

    /// How many flags one player may carry: the `CarryFlags` cap, further
    /// bounded by `MaxFlags` when that is set.
    pub fn carry_cap(&self) -> u16 {
        match self.mode {
            FlagMode::Static => 0,
            FlagMode::Carry(cap) if self.max_flags > 0 => cap.min(self.max_flags),
            FlagMode::Carry(cap) => cap,
        }
    }
}

/// Everything a behavior invocation needs.
pub struct CarryGameCtx<'a> {
    pub arena: &'a Arc<Arena>,
    pub data: &'a CarryArenaData,
    pub settings: CarrySettings,
    pub map: Option<InterfaceLease<dyn MapData>>,
    network: &'a dyn Network,
    players: &'a PlayerRegistry,
}

impl CarryGameCtx<'_> {
    /// Broadcasts one game packet reliably to the whole arena.
    pub fn broadcast<P: GamePacket + Encode>(&self, pkt: &P) {
        match encode_game_packet(pkt) {
            Ok(bytes) => self
                .network
                .send_to_arena(self.arena, None, &bytes, Reliability::Reliable),
            Err(e) => warn!("failed to encode {}: {e}", P::NAME),
        }
    }

    pub fn players(&self) -> &PlayerRegistry {
        self.players
    }

    /// The player's position as a tile coordinate.
    pub fn player_tile(&self, player: &Arc<Player>) -> TileCoord {
        let pos = player.state().pos;
        TileCoord::new((pos.x.max(0) as u16) >> 4, (pos.y.max(0) as u16) >> 4)
    }
}

/// The carry game's broker surface, on the arena broker. Gameplay modules
/// (kills, ship changes) call in through this.
pub trait CarryFlagGame: FlagGame {
    /// Handles a kill; returns the flag-transfer count for the kill packet.
    fn player_kill(&self, arena: &Arc<Arena>, killed: &Arc<Player>, killer: &Arc<Player>) -> u16;

    /// Re-places a player's carried flags (ship change, safe zone, etc.).
    fn adjust_flags(
        &self,
        arena: &Arc<Arena>,
        player: &Arc<Player>,
        reason: AdjustReason,
        old_freq: Freq,
    );

    fn flag_state(&self, arena: &Arc<Arena>, flag_id: u16) -> Option<CarryFlagState>;
}

struct CarryShared {
    network: InterfaceLease<dyn Network>,
    players: InterfaceLease<PlayerRegistry>,
    arenas: InterfaceLease<ArenaManager>,
    slot: subzone_server::ExtraDataKey<CarryArenaData>,
}

impl CarryShared {
    fn data(&self, arena: &Arc<Arena>) -> Option<Arc<CarryArenaData>> {
        arena.extra(self.slot)
    }

    fn settings(arena: &Arc<Arena>) -> CarrySettings {
        CarrySettings::from_arena(arena)
    }

    fn with_ctx<R>(&self, arena: &Arc<Arena>, f: impl FnOnce(&CarryGameCtx<'_>) -> R) -> Option<R> {
        let settings = Self::settings(arena);
        if !settings.mode.is_carry() {
            return None;
        }
        let data = self.data(arena)?;
        let ctx = CarryGameCtx {
            arena,
            data: &data,
            settings,
            map: arena.broker().get_interface::<dyn MapData>(),
            network: &*self.network,
            players: &self.players,
        };
        Some(f(&ctx))
    }

    fn behavior(arena: &Arc<Arena>) -> Arc<dyn CarryFlagBehavior> {
        // The top of the stack wins; the module registered the default at
        // attach, so something is always there for a carry arena.
        match arena.broker().get_interface::<dyn CarryFlagBehavior>() {
            Some(lease) => {
                // Hold only for the duration of the call chain.
                struct LeaseHolder(InterfaceLease<dyn CarryFlagBehavior>);
                impl CarryFlagBehavior for LeaseHolder {
                    fn start_game(&self, ctx: &CarryGameCtx<'_>) {
                        self.0.start_game(ctx);
                    }
                    fn touch_flag(&self, ctx: &CarryGameCtx<'_>, p: &Arc<Player>, id: u16) {
                        self.0.touch_flag(ctx, p, id);
                    }
                    fn player_kill(
                        &self,
                        ctx: &CarryGameCtx<'_>,
                        killed: &Arc<Player>,
                        killer: &Arc<Player>,
                    ) -> u16 {
                        self.0.player_kill(ctx, killed, killer)
                    }
                    fn adjust_flags(
                        &self,
                        ctx: &CarryGameCtx<'_>,
                        p: &Arc<Player>,
                        reason: AdjustReason,
                        old_freq: Freq,
                    ) {
                        self.0.adjust_flags(ctx, p, reason, old_freq)
                    }
                }
                Arc::new(LeaseHolder(lease))
            }
            None => Arc::new(DefaultCarryBehavior),
        }
    }

    fn start_game(&self, arena: &Arc<Arena>) {
        let behavior = Self::behavior(arena);
        self.with_ctx(arena, |ctx| behavior.start_game(ctx));
    }

    fn on_touch_packet(&self, player: &Arc<Player>, data: &[u8]) {
        let pkt = match decode_game_packet::<TouchFlagC2s>(data) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!(player = %player.id(), "malformed flag touch dropped: {e}");
                return;
            }
        };
        let Some(arena) = player.arena_id().and_then(|id| self.arenas.get_by_id(id)) else {
            return;
        };

        {
            let state = player.state();
            if state.status != PlayerStatus::Playing
                || state.ship.is_spec()
                || state.during_change
                || state.no_flags_balls
            {
                return;
            }
        }

        let behavior = Self::behavior(&arena);
        self.with_ctx(&arena, |ctx| {
            let count = ctx.data.flags.lock().len();
            if (pkt.flag_id as usize) >= count {
                debug!(player = %player.id(), flag = pkt.flag_id, "flag touch out of range");
                return;
            }
            behavior.touch_flag(ctx, player, pkt.flag_id);
        });
    }
}

struct CarryGameImpl {
    shared: Arc<CarryShared>,
}

impl FlagGame for CarryGameImpl {
    fn reset_game(&self, arena: &Arc<Arena>) {
        // Respawn everything; carriers lose their flags.
        for player in self.shared.players.in_arena(arena.id()) {
            player.set_flags_carried(0);
        }
        self.shared.start_game(arena);
        arena
            .broker()
            .fire_callback::<FlagGameResetCallback>(&Arc::clone(arena));
    }

    fn flag_count(&self, arena: &Arc<Arena>) -> usize {
        self.shared
            .data(arena)
            .map(|d| d.flags.lock().len())
            .unwrap_or(0)
    }

    fn freq_flag_count(&self, arena: &Arc<Arena>, freq: Freq) -> usize {
        self.shared
            .data(arena)
            .map(|d| {
                d.flags
                    .lock()
                    .iter()
                    .filter(|f| f.state != CarryFlagState::None && f.owner == freq)
                    .count()
            })
            .unwrap_or(0)
    }

    fn flag_owner(&self, arena: &Arc<Arena>, flag_id: u16) -> Option<Freq> {
        let data = self.shared.data(arena)?;
        let flags = data.flags.lock();
        flags.get(flag_id as usize).map(|f| f.owner)
    }
}

impl CarryFlagGame for CarryGameImpl {
    fn player_kill(&self, arena: &Arc<Arena>, killed: &Arc<Player>, killer: &Arc<Player>) -> u16 {
        let behavior = CarryShared::behavior(arena);
        self.shared
            .with_ctx(arena, |ctx| behavior.player_kill(ctx, killed, killer))
            .unwrap_or(0)
    }

    fn adjust_flags(
        &self,
        arena: &Arc<Arena>,
        player: &Arc<Player>,
        reason: AdjustReason,
        old_freq: Freq,
    ) {
        let behavior = CarryShared::behavior(arena);
        self.shared
            .with_ctx(arena, |ctx| behavior.adjust_flags(ctx, player, reason, old_freq));
    }

    fn flag_state(&self, arena: &Arc<Arena>, flag_id: u16) -> Option<CarryFlagState> {
        let data = self.shared.data(arena)?;
        let flags = data.flags.lock();
        flags.get(flag_id as usize).map(|f| f.state)
    }
}

struct Attachment {
    broker: Arc<ComponentBroker>,
    game_token: InterfaceToken<dyn FlagGame>,
    carry_token: InterfaceToken<dyn CarryFlagGame>,
    behavior_token: InterfaceToken<dyn CarryFlagBehavior>,
    arena_cb: CallbackToken,
    player_cb: CallbackToken,
}

/// The loadable carry-flag module. Attach it to arenas whose config selects
/// carry mode.
#[derive(Default)]
pub struct CarryFlagModule {
    shared: Option<Arc<CarryShared>>,
    attachments: Vec<Attachment>,
}

impl Module for CarryFlagModule {
    fn load(&mut self, broker: &Arc<ComponentBroker>) -> anyhow::Result<()> {
        let network = broker
            .get_interface::<dyn Network>()
            .context("carry flags need the Network interface")?;
        let players = broker
            .get_interface::<PlayerRegistry>()
            .context("carry flags need the PlayerRegistry")?;
        let arenas = broker
            .get_interface::<ArenaManager>()
            .context("carry flags need the ArenaManager")?;

        let slot = arenas.extra_registry().register(CarryArenaData::default);

        let shared = Arc::new(CarryShared {
            network,
            players,
            arenas,
            slot,
        });

        let weak: Weak<CarryShared> = Arc::downgrade(&shared);
        shared.network.add_packet_handler(
            TouchFlagC2s::ID,
            Arc::new(move |player, data| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_touch_packet(player, data);
                }
            }),
        );

        self.shared = Some(shared);
        Ok(())
    }

    fn unload(&mut self, _broker: &Arc<ComponentBroker>) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.attachments.is_empty(),
            "carry flags still attached to {} arena(s)",
            self.attachments.len()
        );
        if let Some(shared) = self.shared.take() {
            let slot = shared.slot;
            shared.arenas.extra_registry().unregister(slot);
        }
        Ok(())
    }

    fn attach(&mut self, arena_broker: &Arc<ComponentBroker>) -> anyhow::Result<()> {
        let shared = self
            .shared
            .as_ref()
            .context("carry flags attached before load")?;

        let game = Arc::new(CarryGameImpl {
            shared: Arc::clone(shared),
        });
        let game_token = arena_broker.register_interface::<dyn FlagGame>(game.clone());
        let carry_token = arena_broker.register_interface::<dyn CarryFlagGame>(game);
        let behavior_token =
            arena_broker.register_interface::<dyn CarryFlagBehavior>(Arc::new(DefaultCarryBehavior));

        // Start the game when the arena comes up (or its config changes to
        // carry mode with no flags in play yet).
        let weak = Arc::downgrade(shared);
        let arena_cb = arena_broker.register_callback::<ArenaActionCallback>(move |(arena, action)| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            match action {
                ArenaAction::Create => shared.start_game(arena),
                ArenaAction::ConfChanged => {
                    let empty = shared
                        .data(arena)
                        .map(|d| d.flags.lock().is_empty())
                        .unwrap_or(true);
                    if empty {
                        shared.start_game(arena);
                    }
                }
                ArenaAction::PreCreate | ArenaAction::Destroy => {}
            }
        });

        // A player leaving the arena drops everything they carry.
        let weak = Arc::downgrade(shared);
        let player_cb =
            arena_broker.register_callback::<PlayerActionCallback>(move |(player, action)| {
                if *action != PlayerAction::LeaveArena {
                    return;
                }
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let Some(arena) = player.arena_id().and_then(|id| shared.arenas.get_by_id(id))
                else {
                    return;
                };
                let behavior = CarryShared::behavior(&arena);
                let old_freq = player.state().freq;
                shared.with_ctx(&arena, |ctx| {
                    behavior.adjust_flags(ctx, player, AdjustReason::LeaveArena, old_freq);
                });
            });

        self.attachments.push(Attachment {
            broker: Arc::clone(arena_broker),
            game_token,
            carry_token,
            behavior_token,
            arena_cb,
            player_cb,
        });
        Ok(())
    }

    fn detach(&mut self, arena_broker: &Arc<ComponentBroker>) -> anyhow::Result<()> {
        let Some(pos) = self
            .attachments
            .iter()
            .position(|a| Arc::ptr_eq(&a.broker, arena_broker))
        else {
            anyhow::bail!("carry flags not attached to this arena");
        };
        let att = self.attachments.remove(pos);

        let _ = att.broker.unregister_callback(att.arena_cb);
        let _ = att.broker.unregister_callback(att.player_cb);
        att.broker
            .unregister_interface(att.behavior_token)
            .map_err(|(_, e)| e)?;
        att.broker
            .unregister_interface(att.carry_token)
            .map_err(|(_, e)| e)?;
        att.broker
            .unregister_interface(att.game_token)
            .map_err(|(_, e)| e)?;
        Ok(())
    }
}
