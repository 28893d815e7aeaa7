//! The static (turf) flag game module.
//!
//! Turf flags never move: every map flag tile has an owning freq, touches
//! re-own the tile, and clients are kept current through rate-limited single
//! updates plus a periodic batch sender that picks whichever encoding is
//! cheaper on the wire.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::{ensure, Context};
use parking_lot::Mutex;
use subzone_broker::{CallbackToken, ComponentBroker, InterfaceLease, InterfaceToken, Module};
use subzone_protocol::packets::c2s::TouchFlagC2s;
use subzone_protocol::packets::s2c::{FlagPickupS2c, FlagResetS2c, TurfFlagsS2c};
use subzone_protocol::{
    decode_game_packet, encode_game_packet, Decode, Encode, Freq, GamePacket, PlayerId,
    NEUTRAL_FREQ,
};
use subzone_server::{
    Arena, ArenaAction, ArenaActionCallback, ArenaManager, ConfigExt, MainloopHandle, MapData,
    Network, PersistInterval, PersistentStorage, Player, PlayerAction, PlayerActionCallback,
    PlayerStatus, Reliability, TimerKey, TimerKind,
};
use tracing::{debug, info, warn};

use crate::{FlagGame, FlagGameResetCallback, FlagMode, StaticFlagClaimedCallback};

/// Persist key for the turf owner record.
const PERSIST_KEY: u32 = 0x464C_4147; // "FLAG"

/// Batch-timer invocations between persistence writes (with a 1 s interval,
/// roughly every five minutes).
const SAVE_EVERY: u32 = 300;

/// Static flags are capped at 256 regardless of the map.
const MAX_STATIC_FLAGS: usize = 256;

struct TurfFlag {
    owner: Freq,
    /// Who caused the unsent ownership change.
    dirty: Option<PlayerId>,
    last_send: Option<Instant>,
}

fn neutral_flag() -> TurfFlag {
    TurfFlag {
        owner: NEUTRAL_FREQ,
        dirty: None,
        last_send: None,
    }
}

#[derive(Default)]
struct StaticArenaData {
    flags: Mutex<Vec<TurfFlag>>,
    timer: Mutex<Option<TimerKey>>,
    save_countdown: Mutex<u32>,
}

/// Per-arena `[Flag]` settings for turf mode.
#[derive(Copy, Clone, Debug)]
struct TurfSettings {
    mode: FlagMode,
    /// Minimum time between broadcasts for one flag, in centiseconds.
    update_cooldown_cs: u32,
    /// Batch sender period, in centiseconds.
    update_interval_cs: u32,
    persistent_owners: bool,
}

impl TurfSettings {
    fn from_arena(arena: &Arena) -> Self {
        let cfg = arena.config();
        Self {
            mode: FlagMode::from_config(&**cfg),
            update_cooldown_cs: cfg.get_u32("Flag", "FlagUpdateCooldown", 200),
            update_interval_cs: cfg.get_u32("Flag", "FlagUpdateInterval", 100),
            persistent_owners: cfg.get_bool("Flag", "PersistentTurfOwners", true),
        }
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(u64::from(self.update_cooldown_cs) * 10)
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.update_interval_cs) * 10)
    }
}

/// The turf game's broker surface, on the arena broker.
pub trait StaticFlagGame: FlagGame {
    /// Bulk-replaces the ownership table and broadcasts the full update.
    fn set_owners(&self, arena: &Arc<Arena>, owners: &[Freq]) -> anyhow::Result<()>;

    /// Processes a touch as if `player` had flown over the flag.
    fn fake_touch(&self, arena: &Arc<Arena>, player: &Arc<Player>, flag_id: u16);
}

struct StaticShared {
    broker: Arc<ComponentBroker>,
    network: InterfaceLease<dyn Network>,
    arenas: InterfaceLease<ArenaManager>,
    mainloop: MainloopHandle,
    slot: subzone_server::ExtraDataKey<StaticArenaData>,
}

impl StaticShared {
    fn data(&self, arena: &Arc<Arena>) -> Option<Arc<StaticArenaData>> {
        arena.extra(self.slot)
    }

    fn broadcast<P: GamePacket + Encode>(&self, arena: &Arc<Arena>, pkt: &P) {
        match encode_game_packet(pkt) {
            Ok(bytes) => self
                .network
                .send_to_arena(arena, None, &bytes, Reliability::Reliable),
            Err(e) => warn!("failed to encode {}: {e}", P::NAME),
        }
    }

    fn broadcast_full(&self, arena: &Arc<Arena>, now: Instant) {
        let Some(data) = self.data(arena) else {
            return;
        };
        let owners = {
            let mut flags = data.flags.lock();
            for f in flags.iter_mut() {
                f.dirty = None;
                f.last_send = Some(now);
            }
            flags.iter().map(|f| f.owner).collect::<Vec<Freq>>()
        };
        if !owners.is_empty() {
            self.broadcast(arena, &TurfFlagsS2c { owners });
        }
    }

    /// Brings the arena in or out of turf mode after create/conf-change.
    fn reconfigure(self: &Arc<Self>, arena: &Arc<Arena>, action: ArenaAction) {
        let settings = TurfSettings::from_arena(arena);
        let map_flags = arena
            .broker()
            .get_interface::<dyn MapData>()
            .map(|m| usize::from(m.flag_count()).min(MAX_STATIC_FLAGS))
            .unwrap_or(0);

        let Some(data) = self.data(arena) else {
            return;
        };

        if settings.mode == FlagMode::Static && map_flags > 0 {
            {
                let mut flags = data.flags.lock();
                // Conf changes preserve existing owners; a changed flag
                // count means a different map, so start over.
                if flags.len() != map_flags {
                    flags.clear();
                    flags.resize_with(map_flags, neutral_flag);
                }
            }
            if action == ArenaAction::Create && settings.persistent_owners {
                self.load_persisted(arena, &data);
            }
            self.start_timer(arena, &data, settings);
        } else {
            // Not a turf arena (anymore): stop and tell clients to clear
            // any overlays.
            self.stop_timer(&data);
            data.flags.lock().clear();
            self.broadcast(
                arena,
                &FlagResetS2c {
                    freq: NEUTRAL_FREQ,
                    points: 0,
                },
            );
        }
    }

    fn start_timer(self: &Arc<Self>, arena: &Arc<Arena>, data: &Arc<StaticArenaData>, settings: TurfSettings) {
        let mut timer = data.timer.lock();
        if timer.is_some() {
            return;
        }
        let key = TimerKey::unique();
        *timer = Some(key);

        let weak = Arc::downgrade(self);
        let arena_id = arena.id();
        self.mainloop.set_timer(
            TimerKind::Server,
            key,
            settings.interval(),
            settings.interval(),
            move || {
                let Some(shared) = weak.upgrade() else {
                    return false;
                };
                let Some(arena) = shared.arenas.get_by_id(arena_id) else {
                    return false;
                };
                shared.batch_send(&arena);
                true
            },
        );
    }

    fn stop_timer(&self, data: &Arc<StaticArenaData>) {
        if let Some(key) = data.timer.lock().take() {
            self.mainloop.clear_timers(key);
        }
    }

    /// The periodic sender: counts pending-dirty flags and broadcasts either
    /// one full table or individual updates, whichever costs fewer bytes.
    fn batch_send(self: &Arc<Self>, arena: &Arc<Arena>) {
        let Some(data) = self.data(arena) else {
            return;
        };
        let now = Instant::now();

        let (dirty, total) = {
            let flags = data.flags.lock();
            let dirty: Vec<(u16, PlayerId)> = flags
                .iter()
                .enumerate()
                .filter_map(|(i, f)| f.dirty.map(|pid| (i as u16, pid)))
                .collect();
            (dirty, flags.len())
        };

        if !dirty.is_empty() {
            // Reliable overhead + id byte + one i16 per flag, vs. reliable
            // overhead + grouped header + per-update item (length byte +
            // 5-byte pickup packet).
            let full_cost = 6 + 1 + 2 * total;
            let individual_cost = 6 + 2 + dirty.len() * (1 + 5);

            if full_cost <= individual_cost {
                self.broadcast_full(arena, now);
            } else {
                let mut flags = data.flags.lock();
                for &(id, _) in &dirty {
                    if let Some(f) = flags.get_mut(id as usize) {
                        f.dirty = None;
                        f.last_send = Some(now);
                    }
                }
                drop(flags);
                for (id, pid) in dirty {
                    self.broadcast(arena, &FlagPickupS2c { flag_id: id, pid });
                }
            }
        }

        // Periodic persistence.
        let settings = TurfSettings::from_arena(arena);
        if settings.persistent_owners {
            let mut countdown = data.save_countdown.lock();
            if *countdown == 0 {
                *countdown = SAVE_EVERY;
                drop(countdown);
                self.save_persisted(arena, &data);
            } else {
                *countdown -= 1;
            }
        }
    }

    /// The touch path shared by the packet handler and `fake_touch`.
    fn touch(&self, arena: &Arc<Arena>, player: &Arc<Player>, flag_id: u16) {
        let Some(data) = self.data(arena) else {
            return;
        };
        let settings = TurfSettings::from_arena(arena);
        let now = Instant::now();
        let freq = player.state().freq;

        let (old, send_now) = {
            let mut flags = data.flags.lock();
            let Some(flag) = flags.get_mut(flag_id as usize) else {
                debug!(player = %player.id(), flag = flag_id, "flag touch out of range");
                return;
            };
            if flag.owner == freq {
                return;
            }
            let old = flag.owner;
            flag.owner = freq;
            flag.dirty = Some(player.id());

            // Immediate single-flag update, unless this flag broadcast too
            // recently; the batch timer picks it up then.
            let send_now = flag
                .last_send
                .map_or(true, |t| now.saturating_duration_since(t) >= settings.cooldown());
            if send_now {
                flag.dirty = None;
                flag.last_send = Some(now);
            }
            (old, send_now)
        };

        if send_now {
            self.broadcast(
                arena,
                &FlagPickupS2c {
                    flag_id,
                    pid: player.id(),
                },
            );
        }

        arena
            .broker()
            .fire_callback::<StaticFlagClaimedCallback>(&(
                Arc::clone(arena),
                Arc::clone(player),
                flag_id,
                old,
                freq,
            ));
    }

    fn on_touch_packet(&self, player: &Arc<Player>, bytes: &[u8]) {
        let pkt = match decode_game_packet::<TouchFlagC2s>(bytes) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!(player = %player.id(), "malformed flag touch dropped: {e}");
                return;
            }
        };
        let Some(arena) = player.arena_id().and_then(|id| self.arenas.get_by_id(id)) else {
            return;
        };
        if TurfSettings::from_arena(&arena).mode != FlagMode::Static {
            return;
        }

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

        self.touch(&arena, player, pkt.flag_id);
    }

    // ----- persistence -----

    fn persist(&self) -> Option<InterfaceLease<dyn PersistentStorage>> {
        self.broker.get_interface::<dyn PersistentStorage>()
    }

    fn map_checksum(&self, arena: &Arc<Arena>) -> u32 {
        arena
            .broker()
            .get_interface::<dyn MapData>()
            .map(|m| m.checksum())
            .unwrap_or(0)
    }

    fn save_persisted(&self, arena: &Arc<Arena>, data: &Arc<StaticArenaData>) {
        let Some(persist) = self.persist() else {
            return;
        };
        let owners: Vec<Freq> = data.flags.lock().iter().map(|f| f.owner).collect();
        if owners.is_empty() {
            return;
        }
        let blob = encode_turf_record(self.map_checksum(arena), &owners);
        persist.put(PERSIST_KEY, PersistInterval::Forever, Some(arena.name()), &blob);
    }

    fn load_persisted(&self, arena: &Arc<Arena>, data: &Arc<StaticArenaData>) {
        let Some(persist) = self.persist() else {
            return;
        };
        let Some(blob) = persist.get(PERSIST_KEY, PersistInterval::Forever, Some(arena.name()))
        else {
            return;
        };
        let (checksum, owners) = match decode_turf_record(&blob) {
            Ok(r) => r,
            Err(e) => {
                warn!(arena = %arena.name(), "discarding corrupt turf record: {e}");
                return;
            }
        };

        let mut flags = data.flags.lock();
        if checksum != self.map_checksum(arena) || owners.len() != flags.len() {
            info!(arena = %arena.name(), "stale turf record ignored (map changed)");
            return;
        }
        for (f, owner) in flags.iter_mut().zip(owners) {
            f.owner = owner;
        }
    }
}

/// `u32` map checksum, `u16` count, then one `i16` owner per flag, all
/// little-endian.
fn encode_turf_record(checksum: u32, owners: &[Freq]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(6 + owners.len() * 2);
    blob.extend_from_slice(&checksum.to_le_bytes());
    blob.extend_from_slice(&(owners.len() as u16).to_le_bytes());
    for owner in owners {
        blob.extend_from_slice(&owner.to_le_bytes());
    }
    blob
}

fn decode_turf_record(mut blob: &[u8]) -> anyhow::Result<(u32, Vec<Freq>)> {
    let r = &mut blob;
    let checksum = u32::decode(r)?;
    let count = u16::decode(r)?;
    let mut owners = Vec::with_capacity(count.into());
    for _ in 0..count {
        owners.push(Freq::decode(r)?);
    }
    ensure!(r.is_empty(), "trailing bytes in turf record");
    Ok((checksum, owners))
}

struct StaticGameImpl {
    shared: Arc<StaticShared>,
}

impl FlagGame for StaticGameImpl {
    fn reset_game(&self, arena: &Arc<Arena>) {
        let Some(data) = self.shared.data(arena) else {
            return;
        };
        for f in data.flags.lock().iter_mut() {
            f.owner = NEUTRAL_FREQ;
            f.dirty = None;
        }
        self.shared.broadcast_full(arena, Instant::now());
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
            .map(|d| d.flags.lock().iter().filter(|f| f.owner == freq).count())
            .unwrap_or(0)
    }

    fn flag_owner(&self, arena: &Arc<Arena>, flag_id: u16) -> Option<Freq> {
        let data = self.shared.data(arena)?;
        let flags = data.flags.lock();
        flags.get(flag_id as usize).map(|f| f.owner)
    }
}

impl StaticFlagGame for StaticGameImpl {
    fn set_owners(&self, arena: &Arc<Arena>, owners: &[Freq]) -> anyhow::Result<()> {
        let data = self
            .shared
            .data(arena)
            .context("arena has no turf flag data")?;
        {
            let mut flags = data.flags.lock();
            ensure!(
                owners.len() == flags.len(),
                "owner table size {} does not match flag count {}",
                owners.len(),
                flags.len()
            );
            for (f, &owner) in flags.iter_mut().zip(owners) {
                f.owner = owner;
                f.dirty = None;
            }
        }
        self.shared.broadcast_full(arena, Instant::now());
        Ok(())
    }

    fn fake_touch(&self, arena: &Arc<Arena>, player: &Arc<Player>, flag_id: u16) {
        self.shared.touch(arena, player, flag_id);
    }
}

struct Attachment {
    broker: Arc<ComponentBroker>,
    game_token: InterfaceToken<dyn FlagGame>,
    static_token: InterfaceToken<dyn StaticFlagGame>,
    arena_cb: CallbackToken,
    player_cb: CallbackToken,
}

/// The loadable turf module. Attach it to arenas whose config selects
/// static mode (it stays dormant elsewhere).
#[derive(Default)]
pub struct StaticFlagModule {
    shared: Option<Arc<StaticShared>>,
    attachments: Vec<Attachment>,
}

impl Module for StaticFlagModule {
    fn load(&mut self, broker: &Arc<ComponentBroker>) -> anyhow::Result<()> {
        let network = broker
            .get_interface::<dyn Network>()
            .context("turf flags need the Network interface")?;
        let arenas = broker
            .get_interface::<ArenaManager>()
            .context("turf flags need the ArenaManager")?;
        let mainloop = broker
            .get_interface::<MainloopHandle>()
            .context("turf flags need the MainloopHandle")?
            .clone();

        let slot = arenas.extra_registry().register(StaticArenaData::default);

        let shared = Arc::new(StaticShared {
            broker: Arc::clone(broker),
            network,
            arenas,
            mainloop,
            slot,
        });

        let weak: Weak<StaticShared> = Arc::downgrade(&shared);
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
            "turf flags still attached to {} arena(s)",
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
            .context("turf flags attached before load")?;

        let game = Arc::new(StaticGameImpl {
            shared: Arc::clone(shared),
        });
        let game_token = arena_broker.register_interface::<dyn FlagGame>(game.clone());
        let static_token = arena_broker.register_interface::<dyn StaticFlagGame>(game);

        let weak = Arc::downgrade(shared);
        let arena_cb =
            arena_broker.register_callback::<ArenaActionCallback>(move |(arena, action)| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                match action {
                    ArenaAction::Create | ArenaAction::ConfChanged => {
                        shared.reconfigure(arena, *action);
                    }
                    ArenaAction::Destroy => {
                        if let Some(data) = shared.data(arena) {
                            if TurfSettings::from_arena(arena).persistent_owners {
                                shared.save_persisted(arena, &data);
                            }
                            shared.stop_timer(&data);
                        }
                    }
                    ArenaAction::PreCreate => {}
                }
            });

        // A player entering the game needs the current ownership table.
        let weak = Arc::downgrade(shared);
        let player_cb =
            arena_broker.register_callback::<PlayerActionCallback>(move |(player, action)| {
                if *action != PlayerAction::EnterGame {
                    return;
                }
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let Some(arena) = player.arena_id().and_then(|id| shared.arenas.get_by_id(id))
                else {
                    return;
                };
                let Some(data) = shared.data(&arena) else {
                    return;
                };
                let owners: Vec<Freq> = data.flags.lock().iter().map(|f| f.owner).collect();
                if owners.is_empty() {
                    return;
                }
                match encode_game_packet(&TurfFlagsS2c { owners }) {
                    Ok(bytes) => shared.network.send(player, &bytes, Reliability::Reliable),
                    Err(e) => warn!("failed to encode turf table: {e}"),
                }
            });

        self.attachments.push(Attachment {
            broker: Arc::clone(arena_broker),
            game_token,
            static_token,
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
            anyhow::bail!("turf flags not attached to this arena");
        };
        let att = self.attachments.remove(pos);

        let _ = att.broker.unregister_callback(att.arena_cb);
        let _ = att.broker.unregister_callback(att.player_cb);
        att.broker
            .unregister_interface(att.static_token)
            .map_err(|(_, e)| e)?;
        att.broker
            .unregister_interface(att.game_token)
            .map_err(|(_, e)| e)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn turf_record_round_trip() {
        let owners = vec![1i16, -1, 3, 0];
        let blob = encode_turf_record(0xDEAD_BEEF, &owners);
        let (checksum, decoded) = decode_turf_record(&blob).unwrap();
        assert_eq!(checksum, 0xDEAD_BEEF);
        assert_eq!(decoded, owners);

        // Storing what was loaded is a no-op.
        assert_eq!(encode_turf_record(checksum, &decoded), blob);
    }

    #[test]
    fn turf_record_rejects_corruption() {
        let blob = encode_turf_record(7, &[1, 2, 3]);
        assert!(decode_turf_record(&blob[..blob.len() - 1]).is_err());

        let mut long = blob.clone();
        long.push(0);
        assert!(decode_turf_record(&long).is_err());
    }

    #[test]
    fn batch_cost_model_prefers_full_update_when_cheaper() {
        // 10 flags: full = 6 + 1 + 20 = 27. Three dirty: individual =
        // 6 + 2 + 3*6 = 26, so individual wins; four dirty costs 32 and the
        // full table wins.
        let total = 10usize;
        let full = 6 + 1 + 2 * total;
        assert!(full > 6 + 2 + 3 * 6);
        assert!(full <= 6 + 2 + 4 * 6);
    }
}
