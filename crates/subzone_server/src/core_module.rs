//! The core flow module: drives the player status machine on the mainloop,
//! handles the login/arena packets, and owns the default auth provider.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use subzone_broker::{ComponentBroker, InterfaceLease, InterfaceToken, Module};
use subzone_protocol::packets::c2s::{GoArenaC2s, LeaveArenaC2s, LoginC2s, PositionC2s};
use subzone_protocol::packets::s2c::{
    EnteringArenaS2c, LoginCode, LoginResponseS2c, PlayerEnteringS2c, PlayerLeavingS2c, WhoAmIS2c,
};
use subzone_protocol::{decode_game_packet, encode_game_packet, Encode, GamePacket};
use subzone_protocol::frame::ClientKind;
use tracing::{debug, info, warn};

use crate::arena::{ArenaManager, ArenaStatus};
use crate::mainloop::{MainloopHandle, TimerKey, TimerKind, WorkerPool};
use crate::net_module::{Network, Reliability};
use crate::player::{Player, PlayerAction, PlayerActionCallback, PlayerRegistry, PlayerStatus};
use crate::services::{AllowAllAuth, Auth, AuthRequest};

/// A server version magic the clients accept.
const SERVER_VERSION: u32 = 134;

struct CoreShared {
    broker: Arc<ComponentBroker>,
    network: InterfaceLease<dyn Network>,
    players: InterfaceLease<PlayerRegistry>,
    arenas: InterfaceLease<ArenaManager>,
    mainloop: MainloopHandle,
    pool: InterfaceLease<WorkerPool>,
}

impl CoreShared {
    fn send<P>(&self, player: &Arc<Player>, pkt: &P, rel: Reliability)
    where
        P: GamePacket + Encode,
    {
        match encode_game_packet(pkt) {
            Ok(bytes) => self.network.send(player, &bytes, rel),
            Err(e) => warn!("failed to encode {}: {e}", P::NAME),
        }
    }

    fn entering_packet(&self, player: &Arc<Player>) -> PlayerEnteringS2c {
        let state = player.state();
        PlayerEnteringS2c {
            ship: state.ship,
            accepts_audio: 0,
            name: state.name.as_str().into(),
            squad: state.squad.as_str().into(),
            kill_points: state.kill_points,
            flag_points: state.flag_points,
            pid: player.id(),
            freq: state.freq,
            wins: state.wins,
            losses: state.losses,
            attached_to: -1,
            flags_carried: player.flags_carried(),
        }
    }

    /// One pass of the status machine over every player.
    fn process_players(self: &Arc<Self>) {
        for player in self.players.players() {
            self.process_player(&player);
        }
    }

    fn process_player(self: &Arc<Self>, player: &Arc<Player>) {
        match player.status() {
            PlayerStatus::NoSocket | PlayerStatus::Connected => {}
            PlayerStatus::NeedAuth => self.begin_auth(player),
            PlayerStatus::NeedGlobalSync => {
                // Global persistent sync is the persist module's business;
                // without one there is nothing to wait for.
                player.state().status = PlayerStatus::DoGlobalCallbacks;
            }
            PlayerStatus::DoGlobalCallbacks => {
                player.state().status = PlayerStatus::SendLoginResponse;
                self.broker
                    .fire_callback::<PlayerActionCallback>(&(
                        Arc::clone(player),
                        PlayerAction::Connect,
                    ));
                self.send(
                    player,
                    &LoginResponseS2c {
                        code: LoginCode::Ok as u8,
                        server_version: SERVER_VERSION,
                        registration_request: 0,
                        news_checksum: 0,
                    },
                    Reliability::Reliable,
                );
                info!(player = %player.id(), name = %player.name(), "logged in");
            }
            PlayerStatus::SendLoginResponse => self.try_enter_arena(player),
            PlayerStatus::DoGameCallbacks => {
                let Some(arena) = player.arena_id().and_then(|id| self.arenas.get_by_id(id))
                else {
                    player.state().status = PlayerStatus::SendLoginResponse;
                    return;
                };
                player.state().status = PlayerStatus::SendArenaResponse;
                arena
                    .broker()
                    .fire_callback::<PlayerActionCallback>(&(
                        Arc::clone(player),
                        PlayerAction::EnterArena,
                    ));
            }
            PlayerStatus::SendArenaResponse => self.send_arena_response(player),
            PlayerStatus::ArenaRespAndCbs => {
                let Some(arena) = player.arena_id().and_then(|id| self.arenas.get_by_id(id))
                else {
                    player.state().status = PlayerStatus::SendLoginResponse;
                    return;
                };
                {
                    let mut state = player.state();
                    state.status = PlayerStatus::Playing;
                    state.during_change = false;
                }
                arena
                    .broker()
                    .fire_callback::<PlayerActionCallback>(&(
                        Arc::clone(player),
                        PlayerAction::EnterGame,
                    ));
            }
            PlayerStatus::Playing => {}
            PlayerStatus::LeavingArena => {
                self.leave_current_arena(player);
                player.state().status = PlayerStatus::SendLoginResponse;
            }
            PlayerStatus::LeavingZone => {
                self.leave_current_arena(player);
                player.state().status = PlayerStatus::TimeWait;
                self.broker
                    .fire_callback::<PlayerActionCallback>(&(
                        Arc::clone(player),
                        PlayerAction::Disconnect,
                    ));
            }
            PlayerStatus::TimeWait => {
                info!(player = %player.id(), name = %player.name(), "reaped");
                self.players.remove(player.id());
            }
        }
    }

    fn begin_auth(self: &Arc<Self>, player: &Arc<Player>) {
        let req = {
            let mut state = player.state();
            if state.auth_pending {
                return;
            }
            state.auth_pending = true;
            AuthRequest {
                name: state.name.clone(),
                password: std::mem::take(&mut state.password),
                machine_id: state.machine_id,
                client_kind: state.client_kind.unwrap_or(ClientKind::Vie),
            }
        };

        let weak = Arc::downgrade(self);
        let pid = player.id();
        self.pool.submit(move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            // A registered auth module shadows the default.
            let result = match shared.broker.get_interface::<dyn Auth>() {
                Some(auth) => auth.authenticate(req),
                None => AllowAllAuth.authenticate(req),
            };

            let weak = Arc::downgrade(&shared);
            shared.mainloop.submit(move || {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let Some(player) = shared.players.get(pid) else {
                    return; // disconnected while authenticating
                };
                if player.status() != PlayerStatus::NeedAuth {
                    return;
                }

                if result.code == LoginCode::Ok {
                    let mut state = player.state();
                    state.name = result.name;
                    state.squad = result.squad;
                    state.auth_pending = false;
                    state.status = PlayerStatus::NeedGlobalSync;
                } else {
                    debug!(player = %pid, code = ?result.code, "auth rejected");
                    shared.send(
                        &player,
                        &LoginResponseS2c {
                            code: result.code as u8,
                            server_version: SERVER_VERSION,
                            registration_request: 0,
                            news_checksum: 0,
                        },
                        Reliability::Reliable,
                    );
                    shared.network.disconnect(&player);
                }
            });
        });
    }

    /// Moves a logged-in player with a pending arena request into the entry
    /// sequence once the arena is running.
    fn try_enter_arena(&self, player: &Arc<Player>) {
        let target = {
            let state = player.state();
            match &state.target_arena {
                Some(t) => t.clone(),
                None => return,
            }
        };

        let arena = self.arenas.get_or_create(&target);
        if arena.status() != ArenaStatus::Running {
            return; // creation still in progress
        }

        let mut state = player.state();
        state.arena = Some(arena.id());
        state.target_arena = None;
        state.during_change = true;
        state.status = PlayerStatus::DoGameCallbacks;
    }

    fn send_arena_response(&self, player: &Arc<Player>) {
        let Some(arena) = player.arena_id().and_then(|id| self.arenas.get_by_id(id)) else {
            player.state().status = PlayerStatus::SendLoginResponse;
            return;
        };

        self.send(player, &WhoAmIS2c { pid: player.id() }, Reliability::Reliable);

        // Current roster to the newcomer, the newcomer to everyone else.
        for other in self.players.in_arena(arena.id()) {
            if other.id() == player.id() || other.status() != PlayerStatus::Playing {
                continue;
            }
            let pkt = self.entering_packet(&other);
            self.send(player, &pkt, Reliability::Reliable);
        }
        let own = self.entering_packet(player);
        self.send(player, &own, Reliability::Reliable);
        match encode_game_packet(&own) {
            Ok(bytes) => self.network.send_to_arena(
                &arena,
                Some(player.id()),
                &bytes,
                Reliability::Reliable,
            ),
            Err(e) => warn!("failed to encode player_entering: {e}"),
        }

        self.send(player, &EnteringArenaS2c, Reliability::Reliable);
        player.state().status = PlayerStatus::ArenaRespAndCbs;
    }

    /// Fires the leave callbacks and tells the arena, if the player was in
    /// one.
    fn leave_current_arena(&self, player: &Arc<Player>) {
        let Some(arena) = player.arena_id().and_then(|id| self.arenas.get_by_id(id)) else {
            return;
        };

        arena
            .broker()
            .fire_callback::<PlayerActionCallback>(&(
                Arc::clone(player),
                PlayerAction::LeaveArena,
            ));

        match encode_game_packet(&PlayerLeavingS2c { pid: player.id() }) {
            Ok(bytes) => self.network.send_to_arena(
                &arena,
                Some(player.id()),
                &bytes,
                Reliability::Reliable,
            ),
            Err(e) => warn!("failed to encode player_leaving: {e}"),
        }

        player.state().arena = None;
    }

    // ----- packet handlers -----

    fn on_login(&self, player: &Arc<Player>, data: &[u8]) {
        if player.status() != PlayerStatus::Connected {
            debug!(player = %player.id(), "login in wrong state ignored");
            return;
        }
        let pkt = match decode_game_packet::<LoginC2s>(data) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!(player = %player.id(), "malformed login dropped: {e}");
                return;
            }
        };

        let mut state = player.state();
        state.name = pkt.name.as_str().trim().to_owned();
        state.password = pkt.password.as_str().into_owned();
        state.machine_id = pkt.machine_id;
        if state.name.is_empty() {
            drop(state);
            debug!(player = %player.id(), "empty login name, dropping");
            self.network.disconnect(player);
            return;
        }
        state.status = PlayerStatus::NeedAuth;
    }

    fn on_go_arena(&self, player: &Arc<Player>, data: &[u8]) {
        let status = player.status();
        if !matches!(status, PlayerStatus::SendLoginResponse | PlayerStatus::Playing) {
            return;
        }
        let pkt = match decode_game_packet::<GoArenaC2s>(data) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!(player = %player.id(), "malformed go-arena dropped: {e}");
                return;
            }
        };

        // -3 asks for a named arena; everything else is a public arena,
        // numbered when non-negative.
        let target = match pkt.arena_type {
            -3 => {
                let name = pkt.arena_name.as_str().trim().to_ascii_lowercase();
                if name.is_empty() {
                    "0".to_owned()
                } else {
                    name
                }
            }
            t if t >= 0 => t.to_string(),
            _ => "0".to_owned(),
        };

        let mut state = player.state();
        state.ship = pkt.ship;
        state.target_arena = Some(target);
        if status == PlayerStatus::Playing {
            state.status = PlayerStatus::LeavingArena;
        }
    }

    fn on_leave_arena(&self, player: &Arc<Player>, data: &[u8]) {
        if decode_game_packet::<LeaveArenaC2s>(data).is_err() {
            return;
        }
        if player.status() == PlayerStatus::Playing {
            let mut state = player.state();
            state.target_arena = None;
            state.status = PlayerStatus::LeavingArena;
        }
    }

    fn on_position(&self, player: &Arc<Player>, data: &[u8]) {
        if player.status() != PlayerStatus::Playing {
            return;
        }
        let pkt = match decode_game_packet::<PositionC2s>(data) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!(player = %player.id(), "malformed position dropped: {e}");
                return;
            }
        };

        let mut state = player.state();
        if state.during_change {
            return;
        }
        state.pos.x = pkt.x;
        state.pos.y = pkt.y;
        state.pos.rotation = pkt.rotation;
        state.pos.x_speed = pkt.x_speed;
        state.pos.y_speed = pkt.y_speed;
    }
}

/// The loadable core-flow module.
#[derive(Default)]
pub struct CoreModule {
    shared: Option<Arc<CoreShared>>,
    auth_token: Option<InterfaceToken<dyn Auth>>,
    timer_key: Option<TimerKey>,
}

impl Module for CoreModule {
    fn load(&mut self, broker: &Arc<ComponentBroker>) -> anyhow::Result<()> {
        let network = broker
            .get_interface::<dyn Network>()
            .context("core module needs the Network interface")?;
        let players = broker
            .get_interface::<PlayerRegistry>()
            .context("core module needs the PlayerRegistry")?;
        let arenas = broker
            .get_interface::<ArenaManager>()
            .context("core module needs the ArenaManager")?;
        let mainloop = broker
            .get_interface::<MainloopHandle>()
            .context("core module needs the MainloopHandle")?
            .clone();
        let pool = broker
            .get_interface::<WorkerPool>()
            .context("core module needs the WorkerPool")?;

        let shared = Arc::new(CoreShared {
            broker: Arc::clone(broker),
            network,
            players,
            arenas,
            mainloop: mainloop.clone(),
            pool,
        });

        // Packet handlers hold weak references so an unloaded module's
        // handlers become no-ops rather than keeping it alive.
        let handlers: [(u8, fn(&CoreShared, &Arc<Player>, &[u8])); 4] = [
            (LoginC2s::ID, |s, p, d| s.on_login(p, d)),
            (GoArenaC2s::ID, |s, p, d| s.on_go_arena(p, d)),
            (LeaveArenaC2s::ID, |s, p, d| s.on_leave_arena(p, d)),
            (PositionC2s::ID, |s, p, d| s.on_position(p, d)),
        ];
        for (id, f) in handlers {
            let weak: Weak<CoreShared> = Arc::downgrade(&shared);
            shared.network.add_packet_handler(
                id,
                Arc::new(move |player, data| {
                    if let Some(shared) = weak.upgrade() {
                        f(&shared, player, data);
                    }
                }),
            );
        }

        // The default auth provider; real auth modules shadow it.
        self.auth_token = Some(broker.register_interface::<dyn Auth>(Arc::new(AllowAllAuth)));

        // The heartbeat that advances players and arenas.
        let timer_key = TimerKey::unique();
        let weak = Arc::downgrade(&shared);
        mainloop.set_timer(
            TimerKind::Mainloop,
            timer_key,
            Duration::from_millis(10),
            Duration::from_millis(10),
            move || {
                let Some(shared) = weak.upgrade() else {
                    return false;
                };
                shared.process_players();
                shared.arenas.process(&shared.players);
                true
            },
        );

        self.timer_key = Some(timer_key);
        self.shared = Some(shared);
        Ok(())
    }

    fn unload(&mut self, broker: &Arc<ComponentBroker>) -> anyhow::Result<()> {
        if let Some(token) = self.auth_token.take() {
            if let Err((token, e)) = broker.unregister_interface(token) {
                self.auth_token = Some(token);
                return Err(e.into());
            }
        }
        if let Some(shared) = self.shared.take() {
            if let Some(key) = self.timer_key.take() {
                shared.mainloop.clear_timers(key);
            }
        }
        Ok(())
    }
}
