//! Flag-game scenarios driven through the broker with a recording network.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use subzone_flags::{
    CarryFlagGame, CarryFlagModule, CarryFlagState, StaticFlagClaimedCallback, StaticFlagGame,
    StaticFlagModule,
};
use subzone_protocol::packets::c2s::TouchFlagC2s;
use subzone_protocol::packets::s2c::{FlagPickupS2c, TurfFlagsS2c};
use subzone_protocol::{decode_game_packet, encode_game_packet, GamePacket, PlayerId};
use subzone_server::{
    Arena, ArenaManager, ConfigProvider, GridMap, Mainloop, MainloopHandle, MapData, Network,
    PacketHandler, Player, PlayerRegistry, Reliability, TableConfig, WorkerPool,
};

// ---- recording network double ----

#[derive(Default)]
struct TestNet {
    sent: Mutex<Vec<Vec<u8>>>,
    handlers: RwLock<FxHashMap<u8, Vec<PacketHandler>>>,
}

impl TestNet {
    fn sent_with_id(&self, id: u8) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .iter()
            .filter(|b| b.first() == Some(&id))
            .cloned()
            .collect()
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Simulates a client packet arriving for `player`.
    fn deliver(&self, player: &Arc<Player>, bytes: &[u8]) {
        let handlers = self
            .handlers
            .read()
            .get(&bytes[0])
            .cloned()
            .unwrap_or_default();
        for h in handlers {
            h(player, bytes);
        }
    }
}

impl Network for TestNet {
    fn send(&self, _player: &Arc<Player>, data: &[u8], _rel: Reliability) {
        self.sent.lock().push(data.to_vec());
    }

    fn send_to_arena(
        &self,
        _arena: &Arc<Arena>,
        _except: Option<PlayerId>,
        data: &[u8],
        _rel: Reliability,
    ) {
        self.sent.lock().push(data.to_vec());
    }

    fn send_sized(
        &self,
        _player: &Arc<Player>,
        _source: Box<dyn subzone_server::SizedSource>,
    ) -> bool {
        false
    }

    fn add_packet_handler(&self, packet_id: u8, handler: PacketHandler) {
        self.handlers.write().entry(packet_id).or_default().push(handler);
    }

    fn disconnect(&self, _player: &Arc<Player>) {}
}

// ---- harness ----

struct Zone {
    mainloop: Mainloop,
    net: Arc<TestNet>,
    players: Arc<PlayerRegistry>,
    arenas: Arc<ArenaManager>,
    /// Kept alive so per-arena attach/detach keeps working.
    _modules: Arc<Mutex<subzone_broker::ModuleManager>>,
}

fn zone(cfg: Arc<TableConfig>, module: &str) -> Zone {
    use subzone_broker::{ComponentBroker, ModuleManager};
    use subzone_server::arena::{ArenaConfigSource, SharedConfigSource};

    let broker = ComponentBroker::new_root();
    let mainloop = Mainloop::new();
    let handle = mainloop.handle();

    let net = Arc::new(TestNet::default());
    let players = Arc::new(PlayerRegistry::new());
    let cfg_dyn: Arc<dyn ConfigProvider> = cfg;
    let arenas = Arc::new(ArenaManager::new(
        Arc::clone(&broker),
        Arc::new(SharedConfigSource(Arc::clone(&cfg_dyn))) as Arc<dyn ArenaConfigSource>,
    ));

    let _ = broker.register_interface::<dyn ConfigProvider>(cfg_dyn);
    let _ = broker.register_interface::<dyn Network>(Arc::clone(&net) as Arc<dyn Network>);
    let _ = broker.register_interface::<PlayerRegistry>(Arc::clone(&players));
    let _ = broker.register_interface::<ArenaManager>(Arc::clone(&arenas));
    let _ = broker.register_interface::<MainloopHandle>(Arc::new(handle.clone()));
    let _ = broker.register_interface::<WorkerPool>(Arc::new(WorkerPool::new(1)));

    let mut mm = ModuleManager::new(Arc::clone(&broker));
    mm.register("turf_flags", || {
        Box::new(StaticFlagModule::default()) as Box<dyn subzone_broker::Module>
    });
    mm.register("carry_flags", || {
        Box::new(CarryFlagModule::default()) as Box<dyn subzone_broker::Module>
    });
    mm.load_module(module).unwrap();
    let modules = Arc::new(Mutex::new(mm));
    arenas.set_module_manager(Arc::clone(&modules));

    Zone {
        mainloop,
        net,
        players,
        arenas,
        _modules: modules,
    }
}

/// Creates the arena with a map registered, walks it to Running.
fn running_arena(z: &Zone, map: Arc<GridMap>) -> Arc<Arena> {
    let arena = z.arenas.get_or_create("turf");
    let _map_token = arena
        .broker()
        .register_interface::<dyn MapData>(map as Arc<dyn MapData>);
    for _ in 0..6 {
        z.arenas.process(&z.players);
    }
    assert!(arena.is_running());
    arena
}

// ---- static game ----

#[test]
fn static_flag_rate_limit_and_batching() {
    let cfg = Arc::new(TableConfig::new());
    cfg.set("Flag", "CarryFlags", "None");
    cfg.set("Modules", "AttachModules", "turf_flags");

    let mut z = zone(cfg, "turf_flags");
    let arena = running_arena(&z, Arc::new(GridMap::new(3, 0x1234)));

    let turf = arena
        .broker()
        .get_interface::<dyn StaticFlagGame>()
        .expect("turf game attached");
    assert_eq!(turf.flag_count(&arena), 3);

    let p0 = z.players.new_fake("p0", arena.id(), warbird(), 0);
    let p1 = z.players.new_fake("p1", arena.id(), warbird(), 1);

    let claims = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&claims);
    let _cb = arena
        .broker()
        .register_callback::<StaticFlagClaimedCallback>(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

    let before = z.net.sent_with_id(FlagPickupS2c::ID).len();

    // Two players on different freqs fight over flag 1, four touches each,
    // well inside the cooldown window.
    for _ in 0..4 {
        turf.fake_touch(&arena, &p0, 1);
        turf.fake_touch(&arena, &p1, 1);
    }

    // Every valid touch fired the callback...
    assert_eq!(claims.load(Ordering::SeqCst), 8);
    // ...but only the first broadcast went out inside the cooldown.
    assert_eq!(z.net.sent_with_id(FlagPickupS2c::ID).len(), before + 1);

    // After the update interval, the batch sender reports the final owner.
    z.mainloop.step(Instant::now() + Duration::from_secs(3));
    let full = z.net.sent_with_id(TurfFlagsS2c::ID);
    let last = decode_game_packet::<TurfFlagsS2c>(full.last().expect("a full update")).unwrap();
    assert_eq!(last.owners[1], 1); // p1 touched last

    // And the owner is queryable through the interface.
    assert_eq!(turf.flag_owner(&arena, 1), Some(1));
    assert_eq!(turf.freq_flag_count(&arena, 1), 1);
}

#[test]
fn static_touch_packet_validates_range() {
    let cfg = Arc::new(TableConfig::new());
    cfg.set("Flag", "CarryFlags", "None");
    cfg.set("Modules", "AttachModules", "turf_flags");

    let z = zone(cfg, "turf_flags");
    let arena = running_arena(&z, Arc::new(GridMap::new(3, 1)));
    let p = z.players.new_fake("p", arena.id(), warbird(), 0);

    let turf = arena
        .broker()
        .get_interface::<dyn StaticFlagGame>()
        .unwrap();

    // In-range touch through the wire path works.
    let pkt = encode_game_packet(&TouchFlagC2s { flag_id: 2 }).unwrap();
    z.net.deliver(&p, &pkt);
    assert_eq!(turf.flag_owner(&arena, 2), Some(0));

    // Out-of-range id is rejected as malicious; nothing changes.
    let before = z.net.sent_count();
    let pkt = encode_game_packet(&TouchFlagC2s { flag_id: 300 }).unwrap();
    z.net.deliver(&p, &pkt);
    assert_eq!(z.net.sent_count(), before);
}

// ---- carry game ----

fn warbird() -> subzone_protocol::ShipType {
    subzone_protocol::ShipType::Warbird
}

fn carry_zone() -> (Zone, Arc<Arena>) {
    let cfg = Arc::new(TableConfig::new());
    cfg.set("Flag", "CarryFlags", "Yes");
    // Pin the flag count so the scenarios are deterministic.
    cfg.set("Flag", "MinFlags", "8");
    cfg.set("Flag", "MaxFlags", "8");
    cfg.set("Flag", "FriendlyTransfer", "yes");
    cfg.set("Flag", "DropOwned", "yes");
    cfg.set("Flag", "DropCenter", "no");
    cfg.set("Flag", "SpawnX", "100");
    cfg.set("Flag", "SpawnY", "100");
    cfg.set("Flag", "SpawnRadius", "10");
    cfg.set("Modules", "AttachModules", "carry_flags");

    let z = zone(cfg, "carry_flags");
    let arena = running_arena(&z, Arc::new(GridMap::new(0, 0)));
    (z, arena)
}

/// Sum of per-player carried counts must equal the number of flags in the
/// `Carried` state.
fn assert_carry_invariant(z: &Zone, arena: &Arc<Arena>, carry: &dyn CarryFlagGame) {
    let carried_flags = (0..carry.flag_count(arena) as u16)
        .filter(|&i| matches!(carry.flag_state(arena, i), Some(CarryFlagState::Carried(_))))
        .count() as u16;
    let carried_by_players: u16 = z
        .players
        .players()
        .iter()
        .map(|p| p.flags_carried())
        .sum();
    assert_eq!(carried_flags, carried_by_players);
}

#[test]
fn carry_kill_transfers_without_drops() {
    let (z, arena) = carry_zone();

    let carry = arena
        .broker()
        .get_interface::<dyn CarryFlagGame>()
        .expect("carry game attached");
    assert_eq!(carry.flag_count(&arena), 8);

    let killed = z.players.new_fake("victim", arena.id(), warbird(), 0);
    let killer = z.players.new_fake("killer", arena.id(), warbird(), 1);

    // Pick up flags through the wire path: victim takes 3, killer takes 5.
    for id in 0..3u16 {
        z.net
            .deliver(&killed, &encode_game_packet(&TouchFlagC2s { flag_id: id }).unwrap());
    }
    for id in 3..8u16 {
        z.net
            .deliver(&killer, &encode_game_packet(&TouchFlagC2s { flag_id: id }).unwrap());
    }
    assert_eq!(killed.flags_carried(), 3);
    assert_eq!(killer.flags_carried(), 5);
    assert_carry_invariant(&z, &arena, &*carry);

    let sends_before = z.net.sent_count();
    let transferred = carry.player_kill(&arena, &killed, &killer);

    // All three flags move to the killer inside the kill packet.
    assert_eq!(transferred, 3);
    assert_eq!(killed.flags_carried(), 0);
    assert_eq!(killer.flags_carried(), 8);
    for id in 0..3u16 {
        assert_eq!(
            carry.flag_state(&arena, id),
            Some(CarryFlagState::Carried(killer.id()))
        );
    }
    // No drop or location packets were generated.
    assert_eq!(z.net.sent_count(), sends_before);
    assert_carry_invariant(&z, &arena, &*carry);
}

#[test]
fn carry_capacity_blocks_pickup() {
    let cfg = Arc::new(TableConfig::new());
    cfg.set("Flag", "CarryFlags", "3"); // cap = 2
    cfg.set("Flag", "MinFlags", "4");
    cfg.set("Flag", "MaxFlags", "4");
    cfg.set("Modules", "AttachModules", "carry_flags");

    let z = zone(cfg, "carry_flags");
    let arena = running_arena(&z, Arc::new(GridMap::new(0, 0)));
    let carry = arena.broker().get_interface::<dyn CarryFlagGame>().unwrap();

    let p = z.players.new_fake("p", arena.id(), warbird(), 0);
    for id in 0..4u16 {
        z.net
            .deliver(&p, &encode_game_packet(&TouchFlagC2s { flag_id: id }).unwrap());
    }

    assert_eq!(p.flags_carried(), 2);
    assert!(matches!(
        carry.flag_state(&arena, 2),
        Some(CarryFlagState::OnMap(_))
    ));
    assert_carry_invariant(&z, &arena, &*carry);
}

#[test]
fn carry_flags_spawn_on_map_with_neutral_owner() {
    let (z, arena) = carry_zone();
    let carry = arena.broker().get_interface::<dyn CarryFlagGame>().unwrap();

    for id in 0..8u16 {
        assert!(matches!(
            carry.flag_state(&arena, id),
            Some(CarryFlagState::OnMap(_))
        ));
        assert_eq!(carry.flag_owner(&arena, id), Some(-1));
    }
    assert_carry_invariant(&z, &arena, &*carry);
}
