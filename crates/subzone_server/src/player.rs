//! The player registry.
//!
//! A [`Player`] is one connected (or fake) participant. Its mutable state
//! advances only on the mainloop thread; other threads read snapshots
//! through the state lock or the atomic fields.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard, RwLock};
use rustc_hash::FxHashMap;
use subzone_broker::Callback;
use subzone_network::ConnId;
use subzone_protocol::frame::ClientKind;
use subzone_protocol::{Freq, PlayerId, ShipType};
use tracing::warn;

use crate::arena::ArenaId;
use crate::extra::{ExtraData, ExtraDataKey, ExtraDataRegistry};

/// The login/arena state machine. Monotonic except for the arena-change
/// cycle (`Playing → LeavingArena → DoGameCallbacks → … → Playing`).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PlayerStatus {
    /// Allocated, no transport yet (fake players pass through here).
    NoSocket,
    /// Transport established, nothing heard.
    Connected,
    /// Login received; authentication pending.
    NeedAuth,
    /// Authenticated; global persistent data loading.
    NeedGlobalSync,
    /// Fire the global connect callbacks.
    DoGlobalCallbacks,
    /// Send the login response; idle here until an arena is requested.
    SendLoginResponse,
    /// Arena chosen and running; fire the pre-entry game callbacks.
    DoGameCallbacks,
    /// Send the arena response burst (whoami, rosters, map info).
    SendArenaResponse,
    /// Arena response sent; fire the enter-arena callbacks.
    ArenaRespAndCbs,
    /// In the game.
    Playing,
    /// Leaving the current arena (possibly to enter another).
    LeavingArena,
    /// Leaving the server.
    LeavingZone,
    /// Awaiting final reap.
    TimeWait,
}

/// Multicast player lifecycle event.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PlayerAction {
    /// Fully logged in (global scope).
    Connect,
    /// Leaving the zone (global scope).
    Disconnect,
    /// Entering an arena; fired on the arena broker.
    EnterArena,
    /// Entered and visible to others; fired on the arena broker.
    EnterGame,
    /// Leaving an arena; fired on the arena broker.
    LeaveArena,
}

/// Fired for every [`PlayerAction`]. Enter/leave fire on the arena broker,
/// connect/disconnect on the root.
pub struct PlayerActionCallback;

impl Callback for PlayerActionCallback {
    type Args = (Arc<Player>, PlayerAction);
}

/// Pixel-space position report.
#[derive(Copy, Clone, Default, Debug)]
pub struct Position {
    pub x: i16,
    pub y: i16,
    pub rotation: i8,
    pub x_speed: i16,
    pub y_speed: i16,
}

/// The lock-guarded mutable portion of a player.
pub struct PlayerState {
    pub status: PlayerStatus,
    pub name: String,
    pub squad: String,
    /// Held only between the login packet and the auth verdict.
    pub password: String,
    pub machine_id: u32,
    pub client_kind: Option<ClientKind>,
    pub ship: ShipType,
    pub freq: Freq,
    pub pos: Position,
    pub arena: Option<ArenaId>,
    /// Arena requested by the client, pending entry.
    pub target_arena: Option<String>,
    /// Mid ship/freq change; position and flag packets are ignored.
    pub during_change: bool,
    /// This player may not touch flags or balls.
    pub no_flags_balls: bool,
    /// An auth request is in flight on the worker pool.
    pub auth_pending: bool,
    pub wins: u16,
    pub losses: u16,
    pub kill_points: i32,
    pub flag_points: i32,
}

pub struct Player {
    id: PlayerId,
    conn: Option<ConnId>,
    fake: bool,
    connect_time: Instant,
    state: Mutex<PlayerState>,
    flags_carried: AtomicU16,
    extra_registry: Arc<ExtraDataRegistry>,
    extra: ExtraData,
}

impl Player {
    pub fn id(&self) -> PlayerId {
        self.id
    }

    /// The transport connection; `None` for fake players.
    pub fn conn(&self) -> Option<ConnId> {
        self.conn
    }

    pub fn is_fake(&self) -> bool {
        self.fake
    }

    pub fn connect_time(&self) -> Instant {
        self.connect_time
    }

    pub fn state(&self) -> MutexGuard<'_, PlayerState> {
        self.state.lock()
    }

    pub fn status(&self) -> PlayerStatus {
        self.state.lock().status
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn arena_id(&self) -> Option<ArenaId> {
        self.state.lock().arena
    }

    /// Carried-flag count, readable without the state lock.
    pub fn flags_carried(&self) -> u16 {
        self.flags_carried.load(Ordering::SeqCst)
    }

    pub fn set_flags_carried(&self, n: u16) {
        self.flags_carried.store(n, Ordering::SeqCst);
    }

    pub fn add_flags_carried(&self, n: u16) {
        self.flags_carried.fetch_add(n, Ordering::SeqCst);
    }

    pub fn sub_flags_carried(&self, n: u16) {
        let prev = self.flags_carried.fetch_sub(n, Ordering::SeqCst);
        if prev < n {
            warn!(player = %self.id, "carried-flag count underflow");
            self.flags_carried.store(0, Ordering::SeqCst);
        }
    }

    /// Module data in this player's slot for `key`.
    pub fn extra<T>(&self, key: ExtraDataKey<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.extra.get(&self.extra_registry, key)
    }
}

/// Owns every player record in the process.
pub struct PlayerRegistry {
    players: RwLock<FxHashMap<PlayerId, Arc<Player>>>,
    by_conn: RwLock<FxHashMap<ConnId, PlayerId>>,
    extra_registry: Arc<ExtraDataRegistry>,
    alloc_hint: Mutex<u16>,
}

impl Default for PlayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self {
            players: RwLock::default(),
            by_conn: RwLock::default(),
            extra_registry: Arc::new(ExtraDataRegistry::new()),
            alloc_hint: Mutex::new(0),
        }
    }

    /// The slot registry for per-player module data.
    pub fn extra_registry(&self) -> &Arc<ExtraDataRegistry> {
        &self.extra_registry
    }

    fn alloc_pid(&self, players: &FxHashMap<PlayerId, Arc<Player>>) -> PlayerId {
        let mut hint = self.alloc_hint.lock();
        for _ in 0..=u16::MAX {
            let candidate = PlayerId(*hint);
            *hint = hint.wrapping_add(1);
            if !players.contains_key(&candidate) {
                return candidate;
            }
        }
        unreachable!("more than 65536 concurrent players");
    }

    fn blank_state(name: String) -> PlayerState {
        PlayerState {
            status: PlayerStatus::NoSocket,
            name,
            squad: String::new(),
            password: String::new(),
            machine_id: 0,
            client_kind: None,
            ship: ShipType::Spec,
            freq: 0,
            pos: Position::default(),
            arena: None,
            target_arena: None,
            during_change: false,
            no_flags_balls: false,
            auth_pending: false,
            wins: 0,
            losses: 0,
            kill_points: 0,
            flag_points: 0,
        }
    }

    /// Creates a player for a fresh transport connection, in `Connected`.
    pub fn new_from_conn(&self, conn: ConnId, kind: ClientKind) -> Arc<Player> {
        let mut players = self.players.write();
        let id = self.alloc_pid(&players);

        let mut state = Self::blank_state(String::new());
        state.status = PlayerStatus::Connected;
        state.client_kind = Some(kind);

        let player = Arc::new(Player {
            id,
            conn: Some(conn),
            fake: false,
            connect_time: Instant::now(),
            state: Mutex::new(state),
            flags_carried: AtomicU16::new(0),
            extra_registry: Arc::clone(&self.extra_registry),
            extra: ExtraData::new(),
        });

        players.insert(id, Arc::clone(&player));
        self.by_conn.write().insert(conn, id);
        player
    }

    /// Creates a server-side fake player, already `Playing`. The caller
    /// places it in an arena and fires the enter callbacks.
    pub fn new_fake(&self, name: &str, arena: ArenaId, ship: ShipType, freq: Freq) -> Arc<Player> {
        let mut players = self.players.write();
        let id = self.alloc_pid(&players);

        let mut state = Self::blank_state(name.to_owned());
        state.status = PlayerStatus::Playing;
        state.arena = Some(arena);
        state.ship = ship;
        state.freq = freq;

        let player = Arc::new(Player {
            id,
            conn: None,
            fake: true,
            connect_time: Instant::now(),
            state: Mutex::new(state),
            flags_carried: AtomicU16::new(0),
            extra_registry: Arc::clone(&self.extra_registry),
            extra: ExtraData::new(),
        });

        players.insert(id, Arc::clone(&player));
        player
    }

    pub fn get(&self, id: PlayerId) -> Option<Arc<Player>> {
        self.players.read().get(&id).map(Arc::clone)
    }

    pub fn by_conn(&self, conn: ConnId) -> Option<Arc<Player>> {
        let id = *self.by_conn.read().get(&conn)?;
        self.get(id)
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Player>> {
        self.players
            .read()
            .values()
            .find(|p| p.state.lock().name.eq_ignore_ascii_case(name))
            .map(Arc::clone)
    }

    /// A snapshot of every player; safe to iterate while players come and
    /// go.
    pub fn players(&self) -> Vec<Arc<Player>> {
        self.players.read().values().map(Arc::clone).collect()
    }

    /// Players currently in `arena`, in any status from entry onward.
    pub fn in_arena(&self, arena: ArenaId) -> Vec<Arc<Player>> {
        self.players
            .read()
            .values()
            .filter(|p| p.state.lock().arena == Some(arena))
            .map(Arc::clone)
            .collect()
    }

    pub fn playing_count(&self) -> usize {
        self.players
            .read()
            .values()
            .filter(|p| p.state.lock().status == PlayerStatus::Playing)
            .count()
    }

    pub fn count(&self) -> usize {
        self.players.read().len()
    }

    /// Reaps a player in `TimeWait`: frees the pid and drops module data.
    pub fn remove(&self, id: PlayerId) {
        let player = self.players.write().remove(&id);
        if let Some(player) = player {
            if let Some(conn) = player.conn {
                self.by_conn.write().remove(&conn);
            }
            player.extra.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn pid_reuse_after_remove() {
        let reg = PlayerRegistry::new();
        let a = reg.new_from_conn(ConnId(1), ClientKind::Vie);
        let b = reg.new_from_conn(ConnId(2), ClientKind::Vie);
        assert_ne!(a.id(), b.id());

        reg.remove(a.id());
        assert!(reg.get(a.id()).is_none());
        assert!(reg.by_conn(ConnId(1)).is_none());

        // The freed pid comes back around eventually.
        let ids: Vec<PlayerId> = (0..u16::MAX)
            .map(|_| {
                let p = reg.new_fake("f", ArenaId(0), ShipType::Spec, 0);
                let id = p.id();
                reg.remove(id);
                id
            })
            .collect();
        assert!(ids.contains(&a.id()));
    }

    #[test]
    fn fake_players_start_playing() {
        let reg = PlayerRegistry::new();
        let p = reg.new_fake("turret", ArenaId(3), ShipType::Warbird, 1);
        assert!(p.is_fake());
        assert_eq!(p.status(), PlayerStatus::Playing);
        assert_eq!(p.arena_id(), Some(ArenaId(3)));
        assert_eq!(reg.in_arena(ArenaId(3)).len(), 1);
        assert_eq!(reg.playing_count(), 1);
    }

    #[test]
    fn carried_flag_counter_saturates() {
        let reg = PlayerRegistry::new();
        let p = reg.new_fake("x", ArenaId(0), ShipType::Warbird, 0);
        p.add_flags_carried(2);
        p.sub_flags_carried(3);
        assert_eq!(p.flags_carried(), 0);
    }
}
