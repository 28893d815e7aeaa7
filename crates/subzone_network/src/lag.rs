//! Per-connection latency and loss bookkeeping.

use std::time::Instant;

/// Raw traffic counters for one connection.
#[derive(Copy, Clone, Default, Debug)]
pub struct ConnStats {
    pub pkts_sent: u64,
    pub pkts_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reliable_dups: u64,
    pub retries: u64,
    pub acks_received: u64,
}

/// A snapshot of what the lag query interface reports for a connection.
#[derive(Copy, Clone, Default, Debug)]
pub struct LagStats {
    /// Most recent reliable round trip, in milliseconds.
    pub current_ms: u32,
    /// Average over the sample ring.
    pub average_ms: u32,
    pub max_ms: u32,
    /// Client-reported send/receive counts from the last clock sync, used
    /// for an upstream loss estimate in percent.
    pub c2s_loss_percent: f32,
    /// Clock drift between client and server, in centiseconds.
    pub time_delta_cs: i32,
}

const PING_SAMPLES: usize = 16;

/// Rolling reliable-RTT histogram plus the latest clock-sync data.
pub(crate) struct PingTracker {
    samples: [u32; PING_SAMPLES],
    len: usize,
    next: usize,
    max_ms: u32,
    time_delta_cs: i32,
    c2s_loss_percent: f32,
}

impl PingTracker {
    pub(crate) fn new() -> Self {
        Self {
            samples: [0; PING_SAMPLES],
            len: 0,
            next: 0,
            max_ms: 0,
            time_delta_cs: 0,
            c2s_loss_percent: 0.0,
        }
    }

    pub(crate) fn record_rtt(&mut self, rtt_ms: u32) {
        self.samples[self.next] = rtt_ms;
        self.next = (self.next + 1) % PING_SAMPLES;
        self.len = (self.len + 1).min(PING_SAMPLES);
        self.max_ms = self.max_ms.max(rtt_ms);
    }

    /// Records a 0x05 sync exchange: the client's clock and its own counts
    /// of packets sent/received, against what we have seen.
    pub(crate) fn record_sync(
        &mut self,
        client_time_cs: u32,
        server_time_cs: u32,
        client_sent: u32,
        server_received: u64,
    ) {
        self.time_delta_cs = server_time_cs.wrapping_sub(client_time_cs) as i32;
        if client_sent > 0 {
            let received = server_received.min(u64::from(client_sent)) as f32;
            self.c2s_loss_percent = 100.0 * (1.0 - received / client_sent as f32);
        }
    }

    pub(crate) fn snapshot(&self) -> LagStats {
        let (current, average) = if self.len == 0 {
            (0, 0)
        } else {
            let last = self.samples[(self.next + PING_SAMPLES - 1) % PING_SAMPLES];
            let sum: u64 = self.samples[..self.len].iter().map(|&s| u64::from(s)).sum();
            (last, (sum / self.len as u64) as u32)
        };
        LagStats {
            current_ms: current,
            average_ms: average,
            max_ms: self.max_ms,
            c2s_loss_percent: self.c2s_loss_percent,
            time_delta_cs: self.time_delta_cs,
        }
    }
}

/// Server time in centiseconds, the protocol's native clock unit.
pub fn ticks_since(epoch: Instant, now: Instant) -> u32 {
    (now.saturating_duration_since(epoch).as_millis() / 10) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_ring_averages() {
        let mut t = PingTracker::new();
        t.record_rtt(10);
        t.record_rtt(30);

        let s = t.snapshot();
        assert_eq!(s.current_ms, 30);
        assert_eq!(s.average_ms, 20);
        assert_eq!(s.max_ms, 30);
    }

    #[test]
    fn ring_overwrites_oldest() {
        let mut t = PingTracker::new();
        for i in 0..PING_SAMPLES as u32 + 4 {
            t.record_rtt(i);
        }
        let s = t.snapshot();
        assert_eq!(s.current_ms, PING_SAMPLES as u32 + 3);
        assert_eq!(s.max_ms, PING_SAMPLES as u32 + 3);
    }

    #[test]
    fn sync_estimates_upstream_loss() {
        let mut t = PingTracker::new();
        t.record_sync(1000, 1500, 200, 150);
        let s = t.snapshot();
        assert_eq!(s.time_delta_cs, 500);
        assert!((s.c2s_loss_percent - 25.0).abs() < 0.01);
    }
}
