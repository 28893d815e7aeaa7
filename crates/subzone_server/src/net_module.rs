//! The network module: owns the transport engine, pumps its events onto the
//! mainloop, and exposes the `Network` interface the rest of the server
//! sends through.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use subzone_broker::{ComponentBroker, InterfaceLease, InterfaceToken, Module};
use subzone_network::bandwidth::{Priority, TokenBucketConfig, TokenBucketProvider};
use subzone_network::lag::{ConnStats, LagStats};
use subzone_network::{ConnSettings, NetEngine, NetEvent, NetSettings, SizedSource};
use subzone_protocol::PlayerId;
use tracing::{debug, info, trace};

use crate::arena::Arena;
use crate::config::{ConfigExt, ConfigProvider};
use crate::mainloop::{MainloopHandle, TimerKey, TimerKind};
use crate::player::{Player, PlayerRegistry, PlayerStatus};
use crate::services::LagQuery;

/// Delivery class for an outgoing packet.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Reliability {
    Reliable,
    Unreliable(Priority),
}

/// A game-packet handler, keyed by the packet's first byte. Handlers always
/// run on the mainloop thread.
pub type PacketHandler = Arc<dyn Fn(&Arc<Player>, &[u8]) + Send + Sync>;

/// The send/receive surface modules use, registered on the root broker.
pub trait Network: Send + Sync {
    fn send(&self, player: &Arc<Player>, data: &[u8], rel: Reliability);

    /// Sends to every playing member of the arena, optionally excluding one
    /// player (typically the packet's subject).
    fn send_to_arena(&self, arena: &Arc<Arena>, except: Option<PlayerId>, data: &[u8], rel: Reliability);

    /// Streams a sized transfer (map download). Returns `false` for fake
    /// players and gone connections.
    fn send_sized(&self, player: &Arc<Player>, source: Box<dyn SizedSource>) -> bool;

    /// Registers a handler for one game packet id. Multiple handlers per id
    /// are invoked in registration order.
    fn add_packet_handler(&self, packet_id: u8, handler: PacketHandler);

    fn disconnect(&self, player: &Arc<Player>);
}

struct NetShared {
    engine: NetEngine,
    /// Lease on the core registry; held for the module's lifetime.
    players: InterfaceLease<PlayerRegistry>,
    handlers: RwLock<FxHashMap<u8, Vec<PacketHandler>>>,
}

impl NetShared {
    /// Runs on the mainloop for every transport event.
    fn handle_event(&self, event: NetEvent) {
        match event {
            NetEvent::Connected { id, addr, kind } => {
                let player = self.players.new_from_conn(id, kind);
                info!(player = %player.id(), conn = %id, %addr, ?kind, "new connection");
            }
            NetEvent::Packet { id, data, reliable: _ } => {
                let Some(player) = self.players.by_conn(id) else {
                    trace!(conn = %id, "packet for unknown connection dropped");
                    return;
                };
                if data.is_empty() {
                    return;
                }
                let handlers = {
                    let map = self.handlers.read();
                    map.get(&data[0]).cloned().unwrap_or_default()
                };
                if handlers.is_empty() {
                    trace!(player = %player.id(), packet = data[0], "unhandled packet");
                }
                for h in handlers {
                    h(&player, &data);
                }
            }
            NetEvent::Disconnected { id, reason } => {
                let Some(player) = self.players.by_conn(id) else {
                    return;
                };
                debug!(player = %player.id(), ?reason, "connection gone");
                let mut state = player.state();
                if !matches!(state.status, PlayerStatus::LeavingZone | PlayerStatus::TimeWait) {
                    state.status = PlayerStatus::LeavingZone;
                }
            }
            NetEvent::SizedDone { id, cancelled } => {
                trace!(conn = %id, cancelled, "sized transfer finished");
            }
        }
    }
}

struct NetworkImpl {
    shared: Arc<NetShared>,
}

impl Network for NetworkImpl {
    fn send(&self, player: &Arc<Player>, data: &[u8], rel: Reliability) {
        let Some(conn) = player.conn() else {
            return; // fake player
        };
        let sent = match rel {
            Reliability::Reliable => self.shared.engine.send_reliable(conn, data),
            Reliability::Unreliable(pri) => self.shared.engine.send_unreliable(conn, data, pri),
        };
        if !sent {
            trace!(player = %player.id(), "send to dead connection dropped");
        }
    }

    fn send_to_arena(
        &self,
        arena: &Arc<Arena>,
        except: Option<PlayerId>,
        data: &[u8],
        rel: Reliability,
    ) {
        for player in self.shared.players.in_arena(arena.id()) {
            if Some(player.id()) == except {
                continue;
            }
            if player.status() != PlayerStatus::Playing {
                continue;
            }
            self.send(&player, data, rel);
        }
    }

    fn send_sized(&self, player: &Arc<Player>, source: Box<dyn SizedSource>) -> bool {
        match player.conn() {
            Some(conn) => self.shared.engine.send_sized(conn, source),
            None => false,
        }
    }

    fn add_packet_handler(&self, packet_id: u8, handler: PacketHandler) {
        self.shared
            .handlers
            .write()
            .entry(packet_id)
            .or_default()
            .push(handler);
    }

    fn disconnect(&self, player: &Arc<Player>) {
        if let Some(conn) = player.conn() {
            self.shared.engine.disconnect(conn);
        }
    }
}

struct LagQueryImpl {
    shared: Arc<NetShared>,
}

impl LagQuery for LagQueryImpl {
    fn lag(&self, player: &Arc<Player>) -> Option<LagStats> {
        self.shared.engine.lag_stats(player.conn()?)
    }

    fn traffic(&self, player: &Arc<Player>) -> Option<ConnStats> {
        self.shared.engine.conn_stats(player.conn()?)
    }
}

/// Builds [`NetSettings`] from the `[Net]` config section.
fn net_settings(cfg: &dyn ConfigProvider) -> anyhow::Result<(NetSettings, TokenBucketConfig)> {
    let bind_addr = cfg.get_str("Net", "BindAddress", "0.0.0.0");
    let port = cfg.get_u32("Net", "Port", 5000);
    let bind = format!("{bind_addr}:{port}")
        .parse()
        .with_context(|| format!("bad [Net] BindAddress/Port: {bind_addr}:{port}"))?;

    let conn = ConnSettings {
        recv_window: cfg.get_u32("Net", "PlayerReliableReceiveWindowSize", 64).max(1),
        send_window: cfg.get_u32("Net", "ReliableSendWindowSize", 30).max(1) as usize,
        retry_initial: Duration::from_millis(u64::from(cfg.get_u32("Net", "RetryBaseMs", 400))),
        retry_min: Duration::from_millis(u64::from(cfg.get_u32("Net", "RetryMinMs", 250))),
        retry_max: Duration::from_millis(u64::from(cfg.get_u32("Net", "RetryMaxMs", 2000))),
        max_retries: cfg.get_u32("Net", "MaxRetries", 15).max(1),
        no_data_timeout: Duration::from_secs(u64::from(cfg.get_u32("Net", "NoDataTimeout", 30))),
        drain_linger: Duration::from_secs(u64::from(cfg.get_u32("Net", "DrainLinger", 2))),
        big_data_cap: cfg.get_u32("Net", "MaxBigPacket", 256 * 1024) as usize,
        sized_chunk: cfg.get_u32("Net", "SizedChunk", 480).clamp(16, 500) as usize,
        sized_queue_limit: cfg.get_u32("Net", "SizedQueueLimit", 4).max(1) as usize,
        group_fit_inside_grouped: cfg.get_bool("Net", "GroupFitInsideGrouped", false),
    };

    let bandwidth = TokenBucketConfig {
        rate: cfg.get_u32("Net", "BandwidthLimit", 3500),
        class_weights: [
            cfg.get_u32("Net", "LimitAck", 140),
            cfg.get_u32("Net", "LimitUrgent", 100),
            cfg.get_u32("Net", "LimitHigh", 60),
            cfg.get_u32("Net", "LimitDefault", 40),
            cfg.get_u32("Net", "LimitLow", 20),
        ],
        burst_seconds: cfg.get_u32("Net", "BandwidthBurst", 2).max(1),
    };

    Ok((
        NetSettings {
            bind: vec![bind],
            allow_vie: cfg.get_bool("Net", "AllowVIE", true),
            allow_cont: cfg.get_bool("Net", "AllowCont", true),
            conn,
            send_interval: Duration::from_millis(
                u64::from(cfg.get_u32("Net", "SendIntervalMs", 10)).max(1),
            ),
            recv_workers: cfg.get_u32("Net", "ReceiveWorkers", 2).max(1) as usize,
            tokio_handle: None,
        },
        bandwidth,
    ))
}

/// The loadable network module.
#[derive(Default)]
pub struct NetworkModule {
    shared: Option<Arc<NetShared>>,
    net_token: Option<InterfaceToken<dyn Network>>,
    lag_token: Option<InterfaceToken<dyn LagQuery>>,
    timer_key: Option<TimerKey>,
    mainloop: Option<InterfaceLease<MainloopHandle>>,
}

impl Module for NetworkModule {
    fn load(&mut self, broker: &Arc<ComponentBroker>) -> anyhow::Result<()> {
        let cfg = broker
            .get_interface::<dyn ConfigProvider>()
            .context("network module needs a ConfigProvider")?;
        let players = broker
            .get_interface::<PlayerRegistry>()
            .context("network module needs the PlayerRegistry")?;
        let mainloop = broker
            .get_interface::<MainloopHandle>()
            .context("network module needs the MainloopHandle")?;

        let (settings, bandwidth) = net_settings(&*cfg)?;
        let (engine, events_rx) =
            NetEngine::new(settings, Arc::new(TokenBucketProvider::new(bandwidth)))?;
        engine.start()?;

        let shared = Arc::new(NetShared {
            engine,
            players,
            handlers: RwLock::default(),
        });

        // Forward transport events onto the mainloop, where all gameplay
        // mutation happens.
        let weak: Weak<NetShared> = Arc::downgrade(&shared);
        let ml = mainloop.clone();
        std::thread::Builder::new()
            .name("subzone-netpump".to_owned())
            .spawn(move || {
                while let Ok(event) = events_rx.recv() {
                    let Some(shared) = weak.upgrade() else {
                        return;
                    };
                    ml.submit(move || shared.handle_event(event));
                }
            })
            .context("spawning network event pump")?;

        // Keep the ping responder's population current.
        let timer_key = TimerKey::unique();
        {
            let weak = Arc::downgrade(&shared);
            mainloop.set_timer(
                TimerKind::Server,
                timer_key,
                Duration::from_secs(1),
                Duration::from_secs(1),
                move || {
                    let Some(shared) = weak.upgrade() else {
                        return false;
                    };
                    shared.engine.set_population(shared.players.count() as u32);
                    true
                },
            );
        }

        self.net_token = Some(broker.register_interface::<dyn Network>(Arc::new(NetworkImpl {
            shared: Arc::clone(&shared),
        })));
        self.lag_token = Some(broker.register_interface::<dyn LagQuery>(Arc::new(LagQueryImpl {
            shared: Arc::clone(&shared),
        })));

        self.shared = Some(shared);
        self.mainloop = Some(mainloop);
        self.timer_key = Some(timer_key);
        Ok(())
    }

    fn unload(&mut self, broker: &Arc<ComponentBroker>) -> anyhow::Result<()> {
        if let Some(token) = self.net_token.take() {
            if let Err((token, e)) = broker.unregister_interface(token) {
                self.net_token = Some(token);
                return Err(e.into());
            }
        }
        if let Some(token) = self.lag_token.take() {
            if let Err((token, e)) = broker.unregister_interface(token) {
                self.lag_token = Some(token);
                return Err(e.into());
            }
        }
        if let (Some(ml), Some(key)) = (&self.mainloop, self.timer_key.take()) {
            ml.clear_timers(key);
        }
        if let Some(shared) = self.shared.take() {
            shared.engine.shutdown();
        }
        self.mainloop = None;
        Ok(())
    }
}
