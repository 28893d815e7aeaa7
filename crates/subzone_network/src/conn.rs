//! The per-connection protocol engine.
//!
//! [`ConnectionCore`] is a sans-IO state machine: datagrams go in through
//! [`handle_datagram`](ConnectionCore::handle_datagram), time advances
//! through [`tick`](ConnectionCore::tick), and everything that should hit
//! the socket comes back out as byte buffers. The tokio shell in this crate
//! drives it against real sockets; tests drive it with injected loss,
//! duplication, and reordering.

mod reliable;
mod stream;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use subzone_protocol::frame::{ClientKind, CorePacket};
use subzone_protocol::{
    GroupedIter, GroupedWriter, SequenceNr, MAX_GROUPED_ITEM, MAX_PACKET_SIZE,
    RELIABLE_HEADER_SIZE,
};
use tracing::{debug, trace};

use crate::bandwidth::{BandwidthLimiter, Priority};
use crate::crypt::ConnCipher;
use crate::lag::{ticks_since, ConnStats, LagStats, PingTracker};
use crate::{ConnId, DisconnectReason, NetEvent};
use reliable::{InFlight, RecvWindow, SendWindow};
use stream::{BigAssembler, SizedOut};

/// How deep grouped packets may nest before we call it hostile.
const MAX_GROUP_DEPTH: u8 = 4;

/// Per-connection tuning, resolved from `[Net]` config keys when the
/// connection is created. Nothing in the engine falls back to constants
/// other than these defaults.
#[derive(Clone, Debug)]
pub struct ConnSettings {
    /// `[Net] PlayerReliableReceiveWindowSize`.
    pub recv_window: u32,
    /// Soft cap on unacked in-flight reliables; new payloads wait in the
    /// unsent queue past this.
    pub send_window: usize,
    /// Retransmit timeout before any RTT sample exists.
    pub retry_initial: Duration,
    pub retry_min: Duration,
    pub retry_max: Duration,
    /// A reliable retransmitted more than this many times drops the
    /// connection.
    pub max_retries: u32,
    /// `[Net] NoDataTimeout`: idle this long means the peer is gone.
    pub no_data_timeout: Duration,
    /// How long a disconnecting connection lingers to drain its queues.
    pub drain_linger: Duration,
    /// Cap on an incoming big-data transfer.
    pub big_data_cap: usize,
    /// Payload bytes per sized-data chunk.
    pub sized_chunk: usize,
    /// Outstanding (queued + unacked) sized chunks.
    pub sized_queue_limit: usize,
    /// When set, a grouped-reliable is kept under 255 bytes so it can still
    /// ride inside another grouped packet.
    pub group_fit_inside_grouped: bool,
}

impl Default for ConnSettings {
    fn default() -> Self {
        Self {
            recv_window: 64,
            send_window: 30,
            retry_initial: Duration::from_millis(400),
            retry_min: Duration::from_millis(250),
            retry_max: Duration::from_secs(2),
            max_retries: 15,
            no_data_timeout: Duration::from_secs(30),
            drain_linger: Duration::from_secs(2),
            big_data_cap: 256 * 1024,
            sized_chunk: 480,
            sized_queue_limit: 4,
            group_fit_inside_grouped: false,
        }
    }
}

/// Connection lifecycle. "Unknown" from the state diagram is the absence of
/// a connection entry; a core is born in `KeyExchange`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ConnState {
    KeyExchange,
    Established,
    Disconnecting,
    Dead,
}

/// The sans-IO protocol engine for one connection.
pub struct ConnectionCore {
    id: ConnId,
    addr: SocketAddr,
    kind: ClientKind,
    state: ConnState,
    settings: ConnSettings,
    limiter: Box<dyn BandwidthLimiter>,
    cipher: Box<dyn ConnCipher>,
    epoch: Instant,
    last_recv: Instant,

    send: SendWindow,
    recv: RecvWindow,
    /// In-order reliable payloads awaiting the dispatch worker.
    rel_ready: VecDeque<Bytes>,
    acks_pending: Vec<SequenceNr>,
    out_queues: [VecDeque<Vec<u8>>; 5],

    big: BigAssembler,
    sized: Option<SizedOut>,

    srtt: Option<Duration>,
    rttvar: Duration,

    /// The conn-init response datagram, kept to answer retransmitted inits.
    init_response: Vec<u8>,

    disconnect_reason: Option<DisconnectReason>,
    disconnect_deadline: Option<Instant>,

    pub stats: ConnStats,
    ping: PingTracker,
}

impl ConnectionCore {
    /// Creates a connection answering a conn-init. The response datagram is
    /// queued immediately.
    pub fn new(
        id: ConnId,
        addr: SocketAddr,
        kind: ClientKind,
        response_key: i32,
        cipher: Box<dyn ConnCipher>,
        limiter: Box<dyn BandwidthLimiter>,
        settings: ConnSettings,
        epoch: Instant,
        now: Instant,
    ) -> Self {
        let init_response = CorePacket::ConnInitResponse { key: response_key }.to_vec();
        let recv_window = settings.recv_window;
        let big_cap = settings.big_data_cap;

        let mut core = Self {
            id,
            addr,
            kind,
            state: ConnState::KeyExchange,
            settings,
            limiter,
            cipher,
            epoch,
            last_recv: now,
            send: SendWindow::default(),
            recv: RecvWindow::new(recv_window),
            rel_ready: VecDeque::new(),
            acks_pending: Vec::new(),
            out_queues: Default::default(),
            big: BigAssembler::new(big_cap),
            sized: None,
            srtt: None,
            rttvar: Duration::ZERO,
            init_response,
            disconnect_reason: None,
            disconnect_deadline: None,
            stats: ConnStats::default(),
            ping: PingTracker::new(),
        };
        core.queue_init_response();
        core
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_dead(&self) -> bool {
        self.state == ConnState::Dead
    }

    pub fn lag_stats(&self) -> LagStats {
        self.ping.snapshot()
    }

    /// Reliable payloads not yet acknowledged (queued or in flight).
    pub fn pending_reliable(&self) -> usize {
        self.send.unsent.len() + self.send.inflight.len()
    }

    fn queue_init_response(&mut self) {
        let pkt = self.init_response.clone();
        self.out_queues[Priority::Urgent.index()].push_back(pkt);
    }

    // ----- receiving -----

    /// Feeds one received datagram (still encrypted) into the engine.
    /// Returns `true` when in-order reliable payloads became available for
    /// [`next_ready`](Self::next_ready).
    pub fn handle_datagram(
        &mut self,
        mut datagram: Vec<u8>,
        now: Instant,
        events: &mut Vec<NetEvent>,
    ) -> bool {
        if self.state == ConnState::Dead {
            return false;
        }

        self.stats.pkts_received += 1;
        self.stats.bytes_received += datagram.len() as u64;

        if !self.cipher.decrypt(&mut datagram) {
            debug!(conn = %self.id, "datagram failed decryption, dropped");
            return false;
        }
        if datagram.len() > MAX_PACKET_SIZE || datagram.is_empty() {
            debug!(conn = %self.id, len = datagram.len(), "oversized datagram dropped");
            return false;
        }

        self.last_recv = now;

        let ready_before = self.rel_ready.len();
        self.process_packet(&datagram, false, 0, now, events);
        self.rel_ready.len() > ready_before
    }

    /// Pops the next in-order reliable payload. Called by the dispatch
    /// worker, which then runs [`process_ready`](Self::process_ready) on it.
    pub fn next_ready(&mut self) -> Option<Bytes> {
        self.rel_ready.pop_front()
    }

    /// Processes one in-order reliable payload, unwrapping nested core
    /// packets (grouped, big data) and emitting application events.
    pub fn process_ready(&mut self, payload: &Bytes, now: Instant, events: &mut Vec<NetEvent>) {
        self.process_packet(payload, true, 0, now, events);
    }

    fn process_packet(
        &mut self,
        data: &[u8],
        from_reliable: bool,
        depth: u8,
        now: Instant,
        events: &mut Vec<NetEvent>,
    ) {
        if data.is_empty() {
            return;
        }

        if !CorePacket::is_core(data) {
            // A raw game packet.
            if self.state == ConnState::KeyExchange {
                self.note_established(events);
            }
            if self.state != ConnState::Dead {
                events.push(NetEvent::Packet {
                    id: self.id,
                    data: Bytes::copy_from_slice(data),
                    reliable: from_reliable,
                });
            }
            return;
        }

        let pkt = match CorePacket::decode(data) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!(conn = %self.id, "malformed core packet dropped: {e}");
                return;
            }
        };

        if self.state == ConnState::KeyExchange
            && !matches!(pkt, CorePacket::ConnInit { .. })
        {
            self.note_established(events);
        }

        match pkt {
            CorePacket::ConnInit { .. } => {
                // A retransmitted init; answer it again.
                if self.state == ConnState::KeyExchange {
                    self.queue_init_response();
                } else {
                    trace!(conn = %self.id, "conn-init on live connection ignored");
                }
            }
            CorePacket::ConnInitResponse { .. } => {
                // Only meaningful for outgoing (client-side) connections,
                // which this server does not make.
                trace!(conn = %self.id, "unexpected conn-init response ignored");
            }
            CorePacket::Reliable { seq, data } => {
                // Ack everything, in or out of window; acks are idempotent
                // and stop the peer retransmitting.
                self.acks_pending.push(seq);
                let out = self.recv.accept(seq, Bytes::copy_from_slice(data));
                if out.duplicate {
                    self.stats.reliable_dups += 1;
                }
                self.rel_ready.extend(out.delivered);
            }
            CorePacket::Ack { seq } => self.handle_ack(seq, now, events),
            CorePacket::SyncRequest {
                time,
                pkts_sent,
                pkts_received: _,
            } => {
                let server_time = ticks_since(self.epoch, now);
                self.ping
                    .record_sync(time, server_time, pkts_sent, self.stats.pkts_received);
                let resp = CorePacket::SyncResponse {
                    client_time: time,
                    server_time,
                }
                .to_vec();
                self.out_queues[Priority::Urgent.index()].push_back(resp);
            }
            CorePacket::SyncResponse { .. } => {
                trace!(conn = %self.id, "unexpected sync response ignored");
            }
            CorePacket::Disconnect => {
                debug!(conn = %self.id, "remote disconnect");
                self.state = ConnState::Dead;
                events.push(NetEvent::Disconnected {
                    id: self.id,
                    reason: DisconnectReason::Remote,
                });
            }
            CorePacket::BigChunk { data } => self.big.chunk(data),
            CorePacket::BigTail { data } => {
                if let Some(buf) = self.big.tail(data) {
                    events.push(NetEvent::Packet {
                        id: self.id,
                        data: Bytes::from(buf),
                        reliable: from_reliable,
                    });
                }
            }
            CorePacket::SizedChunk { .. } => {
                trace!(conn = %self.id, "client-sent sized data ignored");
            }
            CorePacket::CancelSized => self.handle_cancel_sized(events),
            CorePacket::CancelSizedAck => {
                trace!(conn = %self.id, "unexpected cancel-sized ack ignored");
            }
            CorePacket::Grouped { data } => {
                if depth >= MAX_GROUP_DEPTH {
                    debug!(conn = %self.id, "grouped packet nesting too deep, dropped");
                    return;
                }
                for item in GroupedIter::new(data) {
                    match item {
                        Ok(item) => {
                            self.process_packet(item, from_reliable, depth + 1, now, events);
                        }
                        Err(e) => {
                            debug!(conn = %self.id, "malformed grouped packet: {e}");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn note_established(&mut self, events: &mut Vec<NetEvent>) {
        self.state = ConnState::Established;
        events.push(NetEvent::Connected {
            id: self.id,
            addr: self.addr,
            kind: self.kind,
        });
    }

    fn handle_ack(&mut self, seq: SequenceNr, now: Instant, events: &mut Vec<NetEvent>) {
        let Some(item) = self.send.ack(seq) else {
            // Unknown or already-acked sequence number.
            return;
        };
        self.stats.acks_received += 1;

        if item.sends == 1 {
            // Only clean first-transmission acks update the RTT estimate.
            let rtt = now.saturating_duration_since(item.first_send);
            self.ping.record_rtt(rtt.as_millis() as u32);
            match self.srtt {
                None => {
                    self.srtt = Some(rtt);
                    self.rttvar = rtt / 2;
                }
                Some(srtt) => {
                    let delta = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                    self.rttvar = (self.rttvar * 3 + delta) / 4;
                    self.srtt = Some((srtt * 7 + rtt) / 8);
                }
            }
            self.limiter.on_ack();
        }

        if item.is_sized {
            self.note_sized_ack(seq, events);
        }
    }

    fn rto(&self) -> Duration {
        match self.srtt {
            None => self.settings.retry_initial,
            Some(srtt) => {
                (srtt + 4 * self.rttvar).clamp(self.settings.retry_min, self.settings.retry_max)
            }
        }
    }

    // ----- sending -----

    /// Queues an application payload on the reliable stream. Payloads too
    /// large for a single reliable packet are converted into a big-data
    /// transfer transparently.
    pub fn queue_reliable(&mut self, data: &[u8]) {
        let max_payload = MAX_PACKET_SIZE - RELIABLE_HEADER_SIZE;
        if data.len() <= max_payload {
            self.send.queue(data.to_vec(), false);
            return;
        }

        // Big data: 0x08 chunks with a 0x09 tail, each riding reliably.
        let chunk_room = max_payload - 2;
        let mut rest = data;
        while rest.len() > chunk_room {
            let (head, tail) = rest.split_at(chunk_room);
            self.send.queue(CorePacket::BigChunk { data: head }.to_vec(), false);
            rest = tail;
        }
        self.send.queue(CorePacket::BigTail { data: rest }.to_vec(), false);
    }

    /// Queues an unreliable payload at the given priority.
    pub fn queue_unreliable(&mut self, data: &[u8], pri: Priority) {
        self.out_queues[pri.index()].push_back(data.to_vec());
    }

    /// Starts the server-initiated teardown: queue a polite 0x07, then drain.
    pub fn request_disconnect(&mut self, reason: DisconnectReason, now: Instant) {
        if matches!(self.state, ConnState::Disconnecting | ConnState::Dead) {
            return;
        }
        self.out_queues[Priority::Urgent.index()].push_back(CorePacket::Disconnect.to_vec());
        self.state = ConnState::Disconnecting;
        self.disconnect_reason = Some(reason);
        self.disconnect_deadline = Some(now + self.settings.drain_linger);
    }

    /// Advances timers and produces the datagrams to put on the wire.
    pub fn tick(&mut self, now: Instant, out: &mut Vec<Vec<u8>>, events: &mut Vec<NetEvent>) {
        if self.state == ConnState::Dead {
            return;
        }

        self.limiter.tick(now);

        // Lifecycle checks first.
        match self.state {
            ConnState::KeyExchange => {
                if now.saturating_duration_since(self.last_recv) > self.settings.no_data_timeout {
                    // Never completed the handshake; vanish silently.
                    self.state = ConnState::Dead;
                    return;
                }
            }
            ConnState::Established => {
                if now.saturating_duration_since(self.last_recv) > self.settings.no_data_timeout {
                    debug!(conn = %self.id, "no data timeout");
                    self.request_disconnect(DisconnectReason::IdleTimeout, now);
                }
            }
            ConnState::Disconnecting => {
                let drained = self.send.is_drained()
                    && self.out_queues.iter().all(VecDeque::is_empty)
                    && self.acks_pending.is_empty();
                let expired = self.disconnect_deadline.is_some_and(|d| now >= d);
                if drained || expired {
                    self.state = ConnState::Dead;
                    events.push(NetEvent::Disconnected {
                        id: self.id,
                        reason: self
                            .disconnect_reason
                            .take()
                            .unwrap_or(DisconnectReason::Requested),
                    });
                    return;
                }
            }
            ConnState::Dead => return,
        }

        let mut wire: Vec<Vec<u8>> = Vec::new();

        // 1. Acks, highest priority. These are cheap and unblock the peer.
        let mut unsent_acks = Vec::new();
        for seq in self.acks_pending.drain(..) {
            let pkt = CorePacket::Ack { seq }.to_vec();
            if self.limiter.check(pkt.len(), Priority::Ack) {
                wire.push(pkt);
            } else {
                unsent_acks.push(seq);
            }
        }
        self.acks_pending = unsent_acks;

        // 2. Retransmits of overdue in-flight reliables.
        let rto = self.rto();
        let mut drop_reason = None;
        for item in &mut self.send.inflight {
            if now.saturating_duration_since(item.last_send) < rto {
                continue;
            }
            if item.sends >= self.settings.max_retries {
                drop_reason = Some(item.seq);
                break;
            }
            if !self.limiter.check(item.wire.len(), Priority::High) {
                break;
            }
            item.last_send = now;
            item.sends += 1;
            self.stats.retries += 1;
            self.limiter.on_retry();
            wire.push(item.wire.clone());
        }
        if let Some(seq) = drop_reason {
            debug!(conn = %self.id, %seq, "reliable exceeded max retries");
            self.request_disconnect(DisconnectReason::TooManyRetries, now);
        }

        // 3. Move unsent reliables to the wire, compacting consecutive small
        // payloads into one grouped packet under a single reliable header.
        self.promote_unsent(now, &mut wire);

        // 4. Unreliable queues in priority order.
        for pri in Priority::ALL {
            if pri == Priority::Ack {
                continue;
            }
            let queue = &mut self.out_queues[pri.index()];
            while let Some(front) = queue.front() {
                if !self.limiter.check(front.len(), pri) {
                    break;
                }
                let pkt = queue.pop_front().expect("front was Some");
                wire.push(pkt);
            }
        }

        // 5. Pack everything destined for this peer into as few datagrams as
        // possible and encrypt.
        for mut datagram in pack_datagrams(wire) {
            self.cipher.encrypt(&mut datagram);
            self.stats.pkts_sent += 1;
            self.stats.bytes_sent += datagram.len() as u64;
            out.push(datagram);
        }
    }

    /// Assigns sequence numbers to queued reliable payloads and frames them,
    /// grouping consecutive payloads while they fit.
    fn promote_unsent(&mut self, now: Instant, wire: &mut Vec<Vec<u8>>) {
        // A grouped-reliable's payload is itself a full grouped packet
        // (header included), so the datagram is 6 + that.
        let group_cap = if self.settings.group_fit_inside_grouped {
            MAX_GROUPED_ITEM
        } else {
            MAX_PACKET_SIZE - RELIABLE_HEADER_SIZE
        };

        while !self.send.unsent.is_empty() && self.send.inflight.len() < self.settings.send_window
        {
            let first_len = self.send.unsent[0].payload.len();

            // Worst case wire size decides the bandwidth check; grouping
            // only shrinks it.
            if !self
                .limiter
                .check(first_len + RELIABLE_HEADER_SIZE, Priority::High)
            {
                break;
            }

            let mut batch = vec![self.send.unsent.pop_front().expect("checked nonempty")];

            // Try to pull more payloads into one grouped packet. Grouping
            // saves a 6-byte reliable header per extra item at the cost of a
            // 1-byte length, so two items always beat two datagrams.
            let mut writer = GroupedWriter::new(group_cap);
            if writer.fits(&batch[0].payload) {
                while let Some(next) = self.send.unsent.front() {
                    if batch.len() == 1 {
                        // Writer only becomes the wire format once a second
                        // item joins.
                        if !writer.fits(&next.payload) {
                            break;
                        }
                        writer
                            .push(&batch[0].payload)
                            .expect("first fits by construction");
                    }
                    if !writer.fits(&next.payload) {
                        break;
                    }
                    let next = self.send.unsent.pop_front().expect("front was Some");
                    writer.push(&next.payload).expect("fits checked");
                    batch.push(next);
                }
            }

            let seq = self.send.assign_seq();
            let is_sized = batch.iter().any(|u| u.is_sized);
            if is_sized {
                if let Some(s) = &mut self.sized {
                    let sized_in_batch = batch.iter().filter(|u| u.is_sized).count();
                    s.queued_unsent = s.queued_unsent.saturating_sub(sized_in_batch);
                    s.wrapper_seqs.insert(seq.0);
                }
            }

            let payload;
            let datagram = if batch.len() == 1 {
                payload = std::mem::take(&mut batch[0].payload);
                CorePacket::Reliable {
                    seq,
                    data: &payload,
                }
                .to_vec()
            } else {
                let body = writer.into_body();
                payload = CorePacket::Grouped { data: &body }.to_vec();
                CorePacket::Reliable {
                    seq,
                    data: &payload,
                }
                .to_vec()
            };

            wire.push(datagram.clone());
            self.send.inflight.push_back(InFlight {
                seq,
                wire: datagram,
                first_send: now,
                last_send: now,
                sends: 1,
                is_sized,
            });
        }
    }

    // ----- sized data -----

    /// Begins a sized-data stream of `total` bytes. Returns `false` while
    /// another stream is active; the caller keeps the producer queued.
    pub fn start_sized(&mut self, total: u32) -> bool {
        if self.sized.is_some() || self.state != ConnState::Established {
            return false;
        }
        self.sized = Some(SizedOut::new(total));
        true
    }

    /// Asks whether the engine wants the next chunk read from the producer.
    /// Returns the file offset and length to read.
    pub fn sized_need_read(&self) -> Option<(u32, usize)> {
        let s = self.sized.as_ref()?;
        if s.cancelled || s.read_pending || s.fully_queued() {
            return None;
        }
        if s.wrapper_seqs.len() + s.queued_unsent >= self.settings.sized_queue_limit {
            return None;
        }
        let len = self.settings.sized_chunk.min((s.total - s.offset) as usize);
        Some((s.offset, len))
    }

    /// Marks a producer read as outstanding so only one runs at a time.
    pub fn sized_mark_reading(&mut self) {
        if let Some(s) = &mut self.sized {
            s.read_pending = true;
        }
    }

    /// Feeds back the bytes a producer read. No-op if the stream was
    /// cancelled while the read was in flight; a cancelled stream never
    /// queues another chunk.
    pub fn sized_chunk_read(&mut self, chunk: &[u8]) {
        let Some(s) = &mut self.sized else {
            return;
        };
        s.read_pending = false;
        if s.cancelled || chunk.is_empty() {
            return;
        }
        let total = s.total;
        s.offset += chunk.len() as u32;
        s.queued_unsent += 1;
        let payload = CorePacket::SizedChunk { total, data: chunk }.to_vec();
        self.send.queue(payload, true);
    }

    fn note_sized_ack(&mut self, seq: SequenceNr, events: &mut Vec<NetEvent>) {
        let Some(s) = &mut self.sized else {
            return;
        };
        s.wrapper_seqs.remove(&seq.0);
        if s.complete() {
            self.sized = None;
            events.push(NetEvent::SizedDone {
                id: self.id,
                cancelled: false,
            });
        }
    }

    fn handle_cancel_sized(&mut self, events: &mut Vec<NetEvent>) {
        if let Some(mut s) = self.sized.take() {
            s.cancelled = true;
            // Chunks that never reached the wire are gone; chunks already in
            // flight keep their place in the reliable stream, so the peer
            // sees only bytes that were queued before the cancel.
            self.send.unsent.retain(|u| !u.is_sized);
            events.push(NetEvent::SizedDone {
                id: self.id,
                cancelled: true,
            });
        }
        // Confirm exactly once per 0x0B; the ack rides the reliable stream
        // behind any chunks already queued.
        self.queue_reliable(&CorePacket::CancelSizedAck.to_vec());
    }

    /// Tears down any active sized stream at disconnect so the engine can
    /// close the producer exactly once.
    pub fn take_sized(&mut self) -> bool {
        self.sized.take().is_some()
    }
}

/// Packs wire items into as few datagrams as possible: items small enough
/// are merged into 0x0E grouped packets (up to 520 bytes per datagram, 255
/// per item); anything bigger ships alone. A group that ends up with a
/// single item is unwrapped back to the bare packet.
fn pack_datagrams(items: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut writer: Option<GroupedWriter> = None;

    fn flush(writer: &mut Option<GroupedWriter>, out: &mut Vec<Vec<u8>>) {
        let Some(w) = writer.take() else {
            return;
        };
        match w.count() {
            0 => {}
            1 => {
                // Unwrap the lone item: skip its length prefix.
                let body = w.into_body();
                out.push(body[1..].to_vec());
            }
            _ => {
                let body = w.into_body();
                out.push(CorePacket::Grouped { data: &body }.to_vec());
            }
        }
    }

    for item in items {
        if item.len() > MAX_GROUPED_ITEM {
            out.push(item);
            continue;
        }
        loop {
            let w = writer.get_or_insert_with(|| GroupedWriter::new(MAX_PACKET_SIZE));
            if w.fits(&item) {
                w.push(&item).expect("fits checked");
                break;
            }
            flush(&mut writer, &mut out);
        }
    }
    flush(&mut writer, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bandwidth::UnlimitedProvider;
    use crate::bandwidth::BandwidthLimiterProvider;
    use crate::crypt::NullEncryption;
    use crate::crypt::EncryptionScheme;

    fn test_core() -> ConnectionCore {
        let now = Instant::now();
        let (_, cipher) = NullEncryption.init(0);
        ConnectionCore::new(
            ConnId(1),
            "127.0.0.1:5000".parse().unwrap(),
            ClientKind::Vie,
            0,
            cipher,
            UnlimitedProvider.new_limiter(),
            ConnSettings::default(),
            now,
            now,
        )
    }

    #[test]
    fn pack_merges_small_items() {
        let out = pack_datagrams(vec![vec![1, 2], vec![3], vec![4, 5, 6]]);
        assert_eq!(out.len(), 1);
        assert!(CorePacket::is_core(&out[0]));
        let CorePacket::Grouped { data } = CorePacket::decode(&out[0]).unwrap() else {
            panic!("expected grouped");
        };
        let items: Vec<_> = GroupedIter::new(data).collect::<anyhow::Result<_>>().unwrap();
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn pack_leaves_single_item_unwrapped() {
        let out = pack_datagrams(vec![vec![0x08, 1, 2]]);
        assert_eq!(out, vec![vec![0x08, 1, 2]]);
    }

    #[test]
    fn pack_ships_big_items_alone() {
        let big = vec![7u8; 400];
        let out = pack_datagrams(vec![big.clone(), vec![1]]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], big);
    }

    #[test]
    fn grouped_compaction_uses_one_reliable_header() {
        // Five 40-byte payloads queued in one tick become one reliable
        // datagram whose payload is a grouped packet with five items.
        let mut core = test_core();
        let mut events = Vec::new();

        // Flush the queued conn-init response out of the way first.
        let mut out = Vec::new();
        core.tick(Instant::now(), &mut out, &mut events);

        for i in 0..5u8 {
            core.queue_reliable(&[0x40 + i; 40]);
        }

        let mut out = Vec::new();
        core.tick(Instant::now(), &mut out, &mut events);

        let reliable: Vec<_> = out
            .iter()
            .filter(|d| matches!(CorePacket::decode(d), Ok(CorePacket::Reliable { .. })))
            .collect();
        assert_eq!(reliable.len(), 1);

        let CorePacket::Reliable { data, .. } = CorePacket::decode(reliable[0]).unwrap() else {
            unreachable!();
        };
        let CorePacket::Grouped { data } = CorePacket::decode(data).unwrap() else {
            panic!("expected grouped payload");
        };
        let items: Vec<_> = GroupedIter::new(data).collect::<anyhow::Result<_>>().unwrap();
        assert_eq!(items.len(), 5);
        assert!(items.iter().all(|i| i.len() == 40));

        // 6 (reliable) + 2 (grouped) + 5 * (1 + 40).
        assert!(reliable[0].len() <= 213);
    }
}
