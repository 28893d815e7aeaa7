//! Transport-level scenarios driven against the sans-IO connection core
//! with injected loss, duplication, and reordering.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use subzone_network::bandwidth::{BandwidthLimiterProvider, UnlimitedProvider};
use subzone_network::crypt::{EncryptionScheme, NullEncryption};
use subzone_network::{ConnId, ConnSettings, ConnectionCore, NetEvent};
use subzone_protocol::frame::{ClientKind, CorePacket};
use subzone_protocol::{GroupedIter, SequenceNr};

fn addr() -> SocketAddr {
    "127.0.0.1:5000".parse().unwrap()
}

fn core(id: u64, now: Instant) -> ConnectionCore {
    let (_, cipher) = NullEncryption.init(0);
    ConnectionCore::new(
        ConnId(id),
        addr(),
        ClientKind::Vie,
        0,
        cipher,
        UnlimitedProvider.new_limiter(),
        ConnSettings::default(),
        now,
        now,
    )
}

/// Feeds a datagram and drains every in-order reliable payload the way the
/// dispatch worker would.
fn feed(core: &mut ConnectionCore, datagram: &[u8], now: Instant, events: &mut Vec<NetEvent>) {
    core.handle_datagram(datagram.to_vec(), now, events);
    while let Some(payload) = core.next_ready() {
        core.process_ready(&payload, now, events);
    }
}

fn app_payloads(events: &[NetEvent]) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|e| match e {
            NetEvent::Packet { data, .. } => Some(data.to_vec()),
            _ => None,
        })
        .collect()
}

/// Every ack sequence number found in a batch of datagrams, grouped packets
/// included.
fn acks_in(datagrams: &[Vec<u8>]) -> Vec<SequenceNr> {
    let mut acks = Vec::new();
    for d in datagrams {
        collect_acks(d, &mut acks);
    }
    acks
}

fn collect_acks(datagram: &[u8], acks: &mut Vec<SequenceNr>) {
    match CorePacket::decode(datagram) {
        Ok(CorePacket::Ack { seq }) => acks.push(seq),
        Ok(CorePacket::Grouped { data }) => {
            for item in GroupedIter::new(data).flatten() {
                collect_acks(item, acks);
            }
        }
        _ => {}
    }
}

#[test]
fn reliable_reorder_loss_duplication() {
    let t0 = Instant::now();
    let mut sender = core(1, t0);
    let mut receiver = core(2, t0);
    let mut events = Vec::new();

    // Flush both init responses out of the way.
    let mut scratch = Vec::new();
    sender.tick(t0, &mut scratch, &mut events);
    receiver.tick(t0, &mut scratch, &mut events);

    // Queue A..E, ticking after each so every payload is its own reliable.
    let payloads: Vec<Vec<u8>> = (0..5u8).map(|i| vec![0x41 + i]).collect();
    let mut wire: Vec<Vec<u8>> = Vec::new();
    for p in &payloads {
        sender.queue_reliable(p);
        let mut out = Vec::new();
        sender.tick(t0, &mut out, &mut events);
        assert_eq!(out.len(), 1);
        wire.extend(out);
    }
    assert_eq!(sender.pending_reliable(), 5);

    // Transport mangling: drop B (seq 1), reorder C and D, deliver E twice.
    events.clear();
    let t1 = t0 + Duration::from_millis(10);
    feed(&mut receiver, &wire[0], t1, &mut events); // A
    feed(&mut receiver, &wire[3], t1, &mut events); // D (early)
    feed(&mut receiver, &wire[2], t1, &mut events); // C
    feed(&mut receiver, &wire[4], t1, &mut events); // E
    feed(&mut receiver, &wire[4], t1, &mut events); // E again

    // Only A is deliverable so far.
    assert_eq!(app_payloads(&events), vec![b"A".to_vec()]);

    // The receiver acks everything it saw; feed those back to the sender.
    let mut recv_out = Vec::new();
    receiver.tick(t1, &mut recv_out, &mut events);
    let acked = acks_in(&recv_out);
    assert_eq!(acked.len(), 5); // four distinct + one for the duplicate E
    for ack in &recv_out {
        feed(&mut sender, ack, t1, &mut events);
    }
    assert_eq!(sender.pending_reliable(), 1); // B is still out there

    // B retransmits after the timeout and completes the stream.
    events.clear();
    let t2 = t1 + Duration::from_millis(600);
    let mut retrans = Vec::new();
    sender.tick(t2, &mut retrans, &mut events);
    let resent: Vec<&Vec<u8>> = retrans
        .iter()
        .filter(|d| matches!(CorePacket::decode(d), Ok(CorePacket::Reliable { .. })))
        .collect();
    assert_eq!(resent.len(), 1);

    feed(&mut receiver, resent[0], t2, &mut events);
    assert_eq!(
        app_payloads(&events),
        vec![b"B".to_vec(), b"C".to_vec(), b"D".to_vec(), b"E".to_vec()]
    );

    // Final ack empties the sender's window.
    let mut recv_out = Vec::new();
    receiver.tick(t2, &mut recv_out, &mut events);
    for ack in &recv_out {
        feed(&mut sender, ack, t2, &mut events);
    }
    assert_eq!(sender.pending_reliable(), 0);

    // Exactly once, in order: the five payloads were never redelivered.
    assert_eq!(receiver.stats.reliable_dups, 1);
}

#[test]
fn every_sequence_number_delivered_exactly_once() {
    let t0 = Instant::now();
    let mut sender = core(1, t0);
    let mut receiver = core(2, t0);
    let mut events = Vec::new();
    let mut scratch = Vec::new();
    sender.tick(t0, &mut scratch, &mut events);

    let mut delivered = Vec::new();
    for i in 0..200u32 {
        sender.queue_reliable(&i.to_le_bytes());
        let mut out = Vec::new();
        sender.tick(t0, &mut out, &mut events);
        for d in &out {
            // Duplicate every third datagram.
            events.clear();
            feed(&mut receiver, d, t0, &mut events);
            if i % 3 == 0 {
                feed(&mut receiver, d, t0, &mut events);
            }
            delivered.extend(app_payloads(&events));
            // Ack promptly so the sender window never fills.
            let mut acks = Vec::new();
            receiver.tick(t0, &mut acks, &mut events);
            for a in &acks {
                feed(&mut sender, a, t0, &mut events);
            }
        }
    }

    assert_eq!(delivered.len(), 200);
    for (i, p) in delivered.iter().enumerate() {
        assert_eq!(p.as_slice(), (i as u32).to_le_bytes());
    }
}

#[test]
fn oversized_reliable_travels_as_big_data() {
    let t0 = Instant::now();
    let mut sender = core(1, t0);
    let mut receiver = core(2, t0);
    let mut events = Vec::new();
    let mut scratch = Vec::new();
    sender.tick(t0, &mut scratch, &mut events);

    let big: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
    sender.queue_reliable(&big);

    events.clear();
    // Several ack round-trips may be needed as the send window drains.
    let mut t = t0;
    for _ in 0..20 {
        t += Duration::from_millis(20);
        let mut out = Vec::new();
        sender.tick(t, &mut out, &mut events);
        for d in &out {
            feed(&mut receiver, d, t, &mut events);
        }
        let mut acks = Vec::new();
        receiver.tick(t, &mut acks, &mut events);
        for a in &acks {
            feed(&mut sender, a, t, &mut events);
        }
        if sender.pending_reliable() == 0 {
            break;
        }
    }

    assert_eq!(app_payloads(&events), vec![big]);
}

#[test]
fn sized_cancel_race() {
    let t0 = Instant::now();
    let mut server = core(1, t0);
    let mut events = Vec::new();
    let mut scratch = Vec::new();
    server.tick(t0, &mut scratch, &mut events);

    // Establish the server side so sized streaming is allowed.
    events.clear();
    feed(&mut server, &[0x03, 0x01], t0, &mut events);
    assert!(matches!(events[0], NetEvent::Connected { .. }));

    let total: u32 = 4800;
    assert!(server.start_sized(total));

    // A wire-level client: collects the server's reliable payloads, replays
    // them in sequence order, and acks everything.
    let mut expected: u32 = 0;
    let mut stash: std::collections::HashMap<u32, Vec<u8>> = std::collections::HashMap::new();

    let mut received: u32 = 0;
    let mut cancel_acks = 0;
    let mut saw_cancel_ack = false;
    let mut sized_done: Vec<bool> = Vec::new();
    let mut t = t0;

    for round in 0..40 {
        // Simulate the worker feeding the next chunk.
        while let Some((offset, len)) = server.sized_need_read() {
            server.sized_mark_reading();
            let chunk: Vec<u8> = (offset..offset + len as u32).map(|i| i as u8).collect();
            server.sized_chunk_read(&chunk);
        }

        t += Duration::from_millis(20);
        let mut out = Vec::new();
        events.clear();
        server.tick(t, &mut out, &mut events);
        for e in &events {
            if let NetEvent::SizedDone { cancelled, .. } = e {
                sized_done.push(*cancelled);
            }
        }

        let mut acks = Vec::new();
        for d in &out {
            if let Ok(CorePacket::Reliable { seq, data }) = CorePacket::decode(d) {
                acks.push(seq);
                stash.insert(seq.0, data.to_vec());
            }
        }

        // In-order replay of the reliable stream.
        while let Some(payload) = stash.remove(&expected) {
            expected += 1;
            match CorePacket::decode(&payload) {
                Ok(CorePacket::SizedChunk { data, .. }) => {
                    // The cancel-ack rides the reliable stream behind the
                    // last queued chunk, so nothing may follow it.
                    assert!(!saw_cancel_ack, "0x0A after 0x0C");
                    received += data.len() as u32;
                }
                Ok(CorePacket::CancelSizedAck) => {
                    cancel_acks += 1;
                    saw_cancel_ack = true;
                }
                _ => {}
            }
        }

        for seq in acks {
            let mut server_events = Vec::new();
            feed(&mut server, &CorePacket::Ack { seq }.to_vec(), t, &mut server_events);
            for e in &server_events {
                if let NetEvent::SizedDone { cancelled, .. } = e {
                    sized_done.push(*cancelled);
                }
            }
        }

        // After the first batch of chunks, the client cancels mid-stream.
        if round == 0 {
            let mut server_events = Vec::new();
            feed(
                &mut server,
                &CorePacket::CancelSized.to_vec(),
                t,
                &mut server_events,
            );
            for e in &server_events {
                if let NetEvent::SizedDone { cancelled, .. } = e {
                    sized_done.push(*cancelled);
                }
            }
        }
    }

    assert!(received > 0, "some chunks flowed before the cancel");
    assert!(received < total, "cancel must stop the stream early");
    assert!(saw_cancel_ack);
    assert_eq!(cancel_acks, 1, "exactly one 0x0C");
    assert_eq!(sized_done, vec![true], "producer closed exactly once, as cancelled");
}

#[test]
fn first_valid_packet_establishes() {
    let t0 = Instant::now();
    let mut server = core(1, t0);
    let mut events = Vec::new();

    // Garbage while in key exchange is dropped without establishing.
    server.handle_datagram(vec![0x00, 0xFF, 0x01], t0, &mut events);
    assert!(events.is_empty());

    // A position packet establishes and is delivered.
    feed(&mut server, &[0x03, 0x11, 0x22], t0, &mut events);
    assert!(matches!(events[0], NetEvent::Connected { .. }));
    assert!(matches!(events[1], NetEvent::Packet { reliable: false, .. }));
}
