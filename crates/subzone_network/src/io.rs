//! The tokio shell around [`ConnectionCore`]: sockets, receive workers, the
//! send ticker, the reliable-dispatch worker, and the ping responder.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use subzone_protocol::frame::{ClientKind, CorePacket};
use subzone_protocol::MAX_PACKET_SIZE;
use tokio::net::UdpSocket;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, error, info, trace, warn};

use crate::bandwidth::{BandwidthLimiterProvider, Priority};
use crate::conn::{ConnState, ConnectionCore};
use crate::crypt::{EncryptionRegistry, NullEncryption};
use crate::lag::{ConnStats, LagStats};
use crate::{ConnId, DisconnectReason, NetEvent, NetSettings};

/// A finite lazy byte source for a sized-data stream (a map download, for
/// example). Reads run on the blocking worker pool, never on the game loop.
pub trait SizedSource: Send {
    /// Total stream size; fixed for the life of the transfer.
    fn total(&self) -> u32;

    /// Fills `buf` with bytes starting at `offset`. Short reads are treated
    /// as stream corruption and abort the transfer.
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> anyhow::Result<usize>;

    /// Called exactly once, whether the transfer completed, was cancelled,
    /// or the connection died.
    fn close(&mut self);
}

struct SizedQueue {
    active: Option<Box<dyn SizedSource>>,
    waiting: VecDeque<Box<dyn SizedSource>>,
}

struct ConnEntry {
    id: ConnId,
    addr: SocketAddr,
    socket: Arc<UdpSocket>,
    core: Mutex<ConnectionCore>,
    sized: Mutex<SizedQueue>,
}

struct Inner {
    settings: NetSettings,
    epoch: Instant,
    conns: RwLock<FxHashMap<ConnId, Arc<ConnEntry>>>,
    by_addr: RwLock<FxHashMap<SocketAddr, ConnId>>,
    next_id: AtomicU64,
    events_tx: flume::Sender<NetEvent>,
    ready_tx: flume::Sender<ConnId>,
    encryption: EncryptionRegistry,
    bandwidth: Arc<dyn BandwidthLimiterProvider>,
    population: AtomicU32,
    handle: Handle,
    /// Owning the runtime keeps the workers alive; dropping it tears every
    /// task down.
    _runtime: Mutex<Option<Runtime>>,
}

/// The UDP transport engine. One per zone process.
///
/// Create with [`NetEngine::new`], register encryption schemes, then
/// [`start`](Self::start). Application payloads arrive on the event channel
/// returned by `new`; sends go through the `send_*` methods from any thread.
pub struct NetEngine {
    inner: Arc<Inner>,
}

impl NetEngine {
    pub fn new(
        settings: NetSettings,
        bandwidth: Arc<dyn BandwidthLimiterProvider>,
    ) -> anyhow::Result<(Self, flume::Receiver<NetEvent>)> {
        let runtime = if settings.tokio_handle.is_none() {
            Some(Runtime::new().context("building tokio runtime")?)
        } else {
            None
        };
        let handle = match &runtime {
            Some(rt) => rt.handle().clone(),
            None => settings.tokio_handle.clone().expect("checked above"),
        };

        let (events_tx, events_rx) = flume::unbounded();
        let (ready_tx, ready_rx) = flume::unbounded();

        let inner = Arc::new(Inner {
            settings,
            epoch: Instant::now(),
            conns: RwLock::default(),
            by_addr: RwLock::default(),
            next_id: AtomicU64::new(1),
            events_tx,
            ready_tx,
            encryption: EncryptionRegistry::new(),
            bandwidth,
            population: AtomicU32::new(0),
            handle,
            _runtime: Mutex::new(runtime),
        });

        // The reliable-dispatch worker: one thread, in-order payloads per
        // connection. Holds only a weak reference so engine drop ends it.
        let weak = Arc::downgrade(&inner);
        std::thread::Builder::new()
            .name("subzone-reldispatch".to_owned())
            .spawn(move || dispatch_worker(weak, ready_rx))
            .context("spawning reliable-dispatch worker")?;

        Ok((Self { inner }, events_rx))
    }

    /// Registered schemes are matched against conn-init client kinds; absent
    /// a match the engine falls back to passthrough.
    pub fn encryption(&self) -> &EncryptionRegistry {
        &self.inner.encryption
    }

    /// Binds the sockets and spawns the socket workers.
    pub fn start(&self) -> anyhow::Result<()> {
        let inner = &self.inner;
        let _guard = inner.handle.enter();

        for &addr in &inner.settings.bind {
            let std_sock = std::net::UdpSocket::bind(addr)
                .with_context(|| format!("binding game socket {addr}"))?;
            std_sock.set_nonblocking(true)?;
            let socket = Arc::new(UdpSocket::from_std(std_sock)?);
            info!(%addr, "game listener up");

            for _ in 0..inner.settings.recv_workers.max(1) {
                let weak = Arc::downgrade(inner);
                let socket = Arc::clone(&socket);
                tokio::spawn(recv_worker(weak, socket));
            }

            let weak = Arc::downgrade(inner);
            let socket = Arc::clone(&socket);
            tokio::spawn(send_ticker(weak, socket));

            // Ping responder on port + 1.
            let mut ping_addr = addr;
            ping_addr.set_port(addr.port().wrapping_add(1));
            let std_ping = std::net::UdpSocket::bind(ping_addr)
                .with_context(|| format!("binding ping socket {ping_addr}"))?;
            std_ping.set_nonblocking(true)?;
            let ping_socket = Arc::new(UdpSocket::from_std(std_ping)?);
            let weak = Arc::downgrade(inner);
            tokio::spawn(ping_responder(weak, ping_socket));
        }
        Ok(())
    }

    /// Current zone population, reported by the ping responder.
    pub fn set_population(&self, n: u32) {
        self.inner.population.store(n, Ordering::Relaxed);
    }

    pub fn conn_count(&self) -> usize {
        self.inner.conns.read().len()
    }

    pub fn send_reliable(&self, id: ConnId, data: &[u8]) -> bool {
        let Some(entry) = self.inner.entry(id) else {
            return false;
        };
        entry.core.lock().queue_reliable(data);
        true
    }

    pub fn send_unreliable(&self, id: ConnId, data: &[u8], pri: Priority) -> bool {
        let Some(entry) = self.inner.entry(id) else {
            return false;
        };
        entry.core.lock().queue_unreliable(data, pri);
        true
    }

    /// Queues a sized-data stream. Streams to one connection run one at a
    /// time in submission order.
    pub fn send_sized(&self, id: ConnId, source: Box<dyn SizedSource>) -> bool {
        let Some(entry) = self.inner.entry(id) else {
            return false;
        };
        {
            let mut sized = entry.sized.lock();
            if sized.active.is_some() {
                sized.waiting.push_back(source);
                return true;
            }
            let total = source.total();
            if !entry.core.lock().start_sized(total) {
                sized.waiting.push_back(source);
                return true;
            }
            sized.active = Some(source);
        }
        self.inner.pump_sized(&entry);
        true
    }

    pub fn disconnect(&self, id: ConnId) {
        if let Some(entry) = self.inner.entry(id) {
            entry
                .core
                .lock()
                .request_disconnect(DisconnectReason::Requested, Instant::now());
        }
    }

    pub fn lag_stats(&self, id: ConnId) -> Option<LagStats> {
        Some(self.inner.entry(id)?.core.lock().lag_stats())
    }

    pub fn conn_stats(&self, id: ConnId) -> Option<ConnStats> {
        Some(self.inner.entry(id)?.core.lock().stats)
    }

    /// Asks every connection to drain and stop. Events already queued still
    /// reach the application.
    pub fn shutdown(&self) {
        let now = Instant::now();
        for entry in self.inner.conns.read().values() {
            entry
                .core
                .lock()
                .request_disconnect(DisconnectReason::ServerShutdown, now);
        }
    }
}

impl Drop for NetEngine {
    fn drop(&mut self) {
        // Tear the runtime down without blocking: a worker task may hold a
        // temporary strong reference, and dropping a runtime from inside
        // itself is not allowed.
        if let Some(rt) = self.inner._runtime.lock().take() {
            rt.shutdown_background();
        }
    }
}

impl Inner {
    fn entry(&self, id: ConnId) -> Option<Arc<ConnEntry>> {
        self.conns.read().get(&id).map(Arc::clone)
    }

    /// Routes one received datagram: existing connections go through their
    /// core; unknown addresses may only speak conn-init.
    fn handle_datagram(self: &Arc<Self>, socket: &Arc<UdpSocket>, from: SocketAddr, data: Vec<u8>) {
        let existing = self.by_addr.read().get(&from).copied();

        if let Some(id) = existing {
            let Some(entry) = self.entry(id) else {
                return;
            };
            let mut events = Vec::new();
            let ready = entry
                .core
                .lock()
                .handle_datagram(data, Instant::now(), &mut events);
            if ready {
                let _ = self.ready_tx.send(id);
            }
            self.forward_events(events);
            self.pump_sized(&entry);
            return;
        }

        // New address: only a conn-init opens a connection.
        let pkt = match CorePacket::decode(&data) {
            Ok(pkt) => pkt,
            Err(_) => {
                trace!(%from, "non-core datagram from unknown address dropped");
                return;
            }
        };
        let CorePacket::ConnInit { key, kind } = pkt else {
            trace!(%from, "unexpected core packet from unknown address dropped");
            return;
        };

        let allowed = match kind {
            ClientKind::Vie => self.settings.allow_vie,
            ClientKind::Continuum => self.settings.allow_cont,
        };
        if !allowed {
            debug!(%from, ?kind, "client kind not allowed here");
            return;
        }

        // Encryption scheme chain: the registered scheme for this client
        // kind handles the key; passthrough otherwise.
        let scheme = self
            .encryption
            .get(kind.encryption_name())
            .unwrap_or_else(|| Arc::new(NullEncryption));
        let (response_key, cipher) = scheme.init(key);

        let id = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let core = ConnectionCore::new(
            id,
            from,
            kind,
            response_key,
            cipher,
            self.bandwidth.new_limiter(),
            self.settings.conn.clone(),
            self.epoch,
            Instant::now(),
        );
        let entry = Arc::new(ConnEntry {
            id,
            addr: from,
            socket: Arc::clone(socket),
            core: Mutex::new(core),
            sized: Mutex::new(SizedQueue {
                active: None,
                waiting: VecDeque::new(),
            }),
        });

        self.conns.write().insert(id, Arc::clone(&entry));
        self.by_addr.write().insert(from, id);
        debug!(conn = %id, %from, ?kind, "connection in key exchange");
    }

    /// Handles engine-internal consequences of events, then forwards them to
    /// the application channel.
    fn forward_events(self: &Arc<Self>, events: Vec<NetEvent>) {
        for event in events {
            match &event {
                NetEvent::Disconnected { id, .. } => self.remove_conn(*id),
                NetEvent::SizedDone { id, .. } => self.finish_sized(*id),
                _ => {}
            }
            if self.events_tx.send(event).is_err() {
                // Application side is gone; nothing to do but drop events.
                return;
            }
        }
    }

    fn remove_conn(self: &Arc<Self>, id: ConnId) {
        let entry = self.conns.write().remove(&id);
        if let Some(entry) = entry {
            self.by_addr.write().remove(&entry.addr);
            let mut sized = entry.sized.lock();
            if let Some(mut src) = sized.active.take() {
                src.close();
            }
            for mut src in sized.waiting.drain(..) {
                src.close();
            }
            debug!(conn = %id, "connection removed");
        }
    }

    /// Closes the finished producer and starts the next queued one.
    fn finish_sized(self: &Arc<Self>, id: ConnId) {
        let Some(entry) = self.entry(id) else {
            return;
        };
        let started = {
            let mut sized = entry.sized.lock();
            if let Some(mut src) = sized.active.take() {
                src.close();
            }
            loop {
                let Some(next) = sized.waiting.pop_front() else {
                    break false;
                };
                let total = next.total();
                if entry.core.lock().start_sized(total) {
                    sized.active = Some(next);
                    break true;
                }
                // Core still busy (cancel ack in flight); retry later.
                sized.waiting.push_front(next);
                break false;
            }
        };
        if started {
            self.pump_sized(&entry);
        }
    }

    /// Feeds producer chunks into the core while it wants them. The actual
    /// read runs on the blocking pool; completion re-enters this pump.
    fn pump_sized(self: &Arc<Self>, entry: &Arc<ConnEntry>) {
        let need = {
            let mut core = entry.core.lock();
            match core.sized_need_read() {
                Some(need) => {
                    core.sized_mark_reading();
                    Some(need)
                }
                None => None,
            }
        };
        let Some((offset, len)) = need else {
            return;
        };

        let weak = Arc::downgrade(self);
        let entry = Arc::clone(entry);
        self.handle.spawn_blocking(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };

            let mut buf = vec![0u8; len];
            let result = {
                let mut sized = entry.sized.lock();
                match sized.active.as_mut() {
                    Some(src) => src.read(offset, &mut buf),
                    // Cancelled while the read was queued.
                    None => return,
                }
            };

            match result {
                Ok(n) if n == len => {
                    entry.core.lock().sized_chunk_read(&buf);
                    // The window may have room for more.
                    inner.pump_sized(&entry);
                }
                Ok(n) => {
                    warn!(conn = %entry.id, expected = len, got = n, "short sized read, aborting");
                    inner.abort_sized(&entry);
                }
                Err(e) => {
                    warn!(conn = %entry.id, "sized read failed: {e}");
                    inner.abort_sized(&entry);
                }
            }
        });
    }

    fn abort_sized(self: &Arc<Self>, entry: &Arc<ConnEntry>) {
        entry.core.lock().take_sized();
        let mut sized = entry.sized.lock();
        if let Some(mut src) = sized.active.take() {
            src.close();
        }
    }
}

async fn recv_worker(weak: Weak<Inner>, socket: Arc<UdpSocket>) {
    // Oversized datagrams are read in full and rejected by length, rather
    // than silently truncated.
    let mut buf = vec![0u8; MAX_PACKET_SIZE * 2];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                error!("udp recv error: {e}");
                continue;
            }
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if n > MAX_PACKET_SIZE {
            trace!(%from, len = n, "oversized datagram dropped");
            continue;
        }
        inner.handle_datagram(&socket, from, buf[..n].to_vec());
    }
}

async fn send_ticker(weak: Weak<Inner>, socket: Arc<UdpSocket>) {
    let interval = match weak.upgrade() {
        Some(inner) => inner.settings.send_interval,
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };

        let entries: Vec<Arc<ConnEntry>> = inner
            .conns
            .read()
            .values()
            .filter(|e| Arc::ptr_eq(&e.socket, &socket))
            .map(Arc::clone)
            .collect();

        let now = Instant::now();
        for entry in entries {
            let mut out = Vec::new();
            let mut events = Vec::new();
            let dead = {
                let mut core = entry.core.lock();
                core.tick(now, &mut out, &mut events);
                core.state() == ConnState::Dead
            };

            for datagram in out {
                if let Err(e) = socket.send_to(&datagram, entry.addr).await {
                    debug!(conn = %entry.id, "udp send error: {e}");
                }
            }
            inner.forward_events(events);
            if dead {
                // Key-exchange timeouts die without a Disconnected event;
                // make sure the entry is reaped either way.
                inner.remove_conn(entry.id);
            } else {
                inner.pump_sized(&entry);
            }
        }
    }
}

/// The simple-ping protocol on port + 1: a 4-byte probe is answered with the
/// player count followed by the probe bytes, so server browsers can poll
/// population without connecting.
async fn ping_responder(weak: Weak<Inner>, socket: Arc<UdpSocket>) {
    let mut buf = [0u8; 16];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                error!("ping recv error: {e}");
                continue;
            }
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if n != 4 {
            continue;
        }
        let count = inner.population.load(Ordering::Relaxed);
        let mut reply = [0u8; 8];
        reply[..4].copy_from_slice(&count.to_le_bytes());
        reply[4..].copy_from_slice(&buf[..4]);
        if let Err(e) = socket.send_to(&reply, from).await {
            debug!("ping send error: {e}");
        }
    }
}

/// The single reliable-dispatch worker: drains in-order payloads, one
/// connection at a time, and forwards the resulting application events.
fn dispatch_worker(weak: Weak<Inner>, ready_rx: flume::Receiver<ConnId>) {
    while let Ok(id) = ready_rx.recv() {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let Some(entry) = inner.entry(id) else {
            continue;
        };
        loop {
            let mut core = entry.core.lock();
            let Some(payload) = core.next_ready() else {
                break;
            };
            let mut events = Vec::new();
            core.process_ready(&payload, Instant::now(), &mut events);
            drop(core);
            inner.forward_events(events);
        }
        inner.pump_sized(&entry);
    }
}
