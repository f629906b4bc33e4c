//! Peer (`spec.md` §4.5): aggregates three channels, the remote address, the
//! RTT estimator, timeout counter, ping timer, per-peer pacing state, and a
//! reference-count lifecycle.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU32,
            Ordering,
        },
        Mutex,
    },
    time::Duration,
};

use crate::{
    channel::Channel,
    CHANNEL_COUNT,
    PeerId,
    RESEND_TIMEOUT_FACTOR,
    RESEND_TIMEOUT_MAX,
    RESEND_TIMEOUT_MIN,
    PING_INTERVAL,
};

struct RttState {
    avg_rtt: Option<Duration>,
    resend_timeout: Duration,
}

struct PacingState {
    idle_timer: Duration,
    ping_timer: Duration,
    send_accumulator: f64,
}

/// A remote endpoint paired with local transport state. Reference-counted
/// via `Arc`: the peer table holds one clone, every worker-side borrow holds
/// another. `removed` is the tombstone that lets iteration skip a peer on
/// its way out without waiting for the strong count to drop.
pub struct Peer {
    id: PeerId,
    addr: Mutex<SocketAddr>,
    pub channels: [Channel; CHANNEL_COUNT],
    rtt: Mutex<RttState>,
    pacing: Mutex<PacingState>,
    removed: AtomicBool,
    timed_out: AtomicBool,
    /// Gates the address-based fallback used to identify a peer whose
    /// datagrams still carry `PEER_ID_INEXISTENT` right after the server
    /// assigned it an id but before its first datagram carrying that id
    /// arrives.
    has_sent_with_id: AtomicBool,
    max_packets_per_second: AtomicU32,
}

impl Peer {
    pub fn new(id: PeerId, addr: SocketAddr) -> Self {
        Peer {
            id,
            addr: Mutex::new(addr),
            channels: [Channel::new(0), Channel::new(1), Channel::new(2)],
            rtt: Mutex::new(RttState {
                avg_rtt: None,
                resend_timeout: RESEND_TIMEOUT_MIN,
            }),
            pacing: Mutex::new(PacingState {
                idle_timer: Duration::ZERO,
                ping_timer: Duration::ZERO,
                send_accumulator: 0.0,
            }),
            removed: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            has_sent_with_id: AtomicBool::new(false),
            max_packets_per_second: AtomicU32::new(10),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        *self.addr.lock().unwrap()
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn mark_for_removal(&self, timed_out: bool) {
        if timed_out {
            self.timed_out.store(true, Ordering::Relaxed);
        }
        self.removed.store(true, Ordering::Release);
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Relaxed)
    }

    pub fn has_sent_with_id(&self) -> bool {
        self.has_sent_with_id.load(Ordering::Relaxed)
    }

    pub fn set_has_sent_with_id(&self) {
        self.has_sent_with_id.store(true, Ordering::Relaxed);
    }

    pub fn report_rtt(&self, sample: Duration) {
        let mut rtt = self.rtt.lock().unwrap();
        let avg = match rtt.avg_rtt {
            None => sample,
            Some(prev) => {
                let prev_ms = prev.as_secs_f64() * 1000.0;
                let sample_ms = sample.as_secs_f64() * 1000.0;
                Duration::from_secs_f64((0.1 * sample_ms + 0.9 * prev_ms) / 1000.0)
            },
        };
        rtt.avg_rtt = Some(avg);
        let resend = avg.mul_f64(RESEND_TIMEOUT_FACTOR).clamp(RESEND_TIMEOUT_MIN, RESEND_TIMEOUT_MAX);
        rtt.resend_timeout = resend;
    }

    pub fn avg_rtt(&self) -> Option<Duration> {
        self.rtt.lock().unwrap().avg_rtt
    }

    pub fn resend_timeout(&self) -> Duration {
        self.rtt.lock().unwrap().resend_timeout
    }

    /// Advances the idle and ping timers by `dt`. Returns `true` once per
    /// elapsed ping interval, so the caller can synthesize a PING.
    pub fn tick_timers(&self, dt: Duration) -> bool {
        let mut pacing = self.pacing.lock().unwrap();
        pacing.idle_timer += dt;
        pacing.ping_timer += dt;
        if pacing.ping_timer >= PING_INTERVAL {
            pacing.ping_timer = Duration::ZERO;
            true
        } else {
            false
        }
    }

    pub fn idle_timer(&self) -> Duration {
        self.pacing.lock().unwrap().idle_timer
    }

    pub fn reset_idle_timer(&self) {
        self.pacing.lock().unwrap().idle_timer = Duration::ZERO;
    }

    pub fn set_max_packets_per_second(&self, rate: u32) {
        self.max_packets_per_second.store(rate.max(1), Ordering::Relaxed);
    }

    /// Charges the pacing accumulator for `dt` elapsed, clamped so a quiet
    /// peer cannot bank unlimited budget.
    pub fn charge_accumulator(&self, dt: Duration) {
        let rate = self.max_packets_per_second.load(Ordering::Relaxed) as f64;
        let mut pacing = self.pacing.lock().unwrap();
        pacing.send_accumulator += dt.as_secs_f64() * rate;
        let cap = 10.0 / rate.max(1.0);
        if pacing.send_accumulator > cap {
            pacing.send_accumulator = cap;
        }
    }

    /// Attempts to debit one packet from the pacing accumulator; `true` if
    /// there was budget to spend.
    pub fn try_spend_one(&self) -> bool {
        let mut pacing = self.pacing.lock().unwrap();
        if pacing.send_accumulator >= 1.0 {
            pacing.send_accumulator -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        ([127, 0, 0, 1], 1234).into()
    }

    #[test]
    fn first_rtt_sample_is_avg() {
        let peer = Peer::new(2, addr());
        peer.report_rtt(Duration::from_millis(100));
        assert_eq!(peer.avg_rtt(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn rtt_ewma_and_resend_timeout_clamped() {
        let peer = Peer::new(2, addr());
        peer.report_rtt(Duration::from_millis(100));
        peer.report_rtt(Duration::from_millis(100));
        let resend = peer.resend_timeout();
        assert!(resend >= RESEND_TIMEOUT_MIN);
        assert!(resend <= RESEND_TIMEOUT_MAX);
    }

    #[test]
    fn ping_fires_every_interval() {
        let peer = Peer::new(2, addr());
        assert!(!peer.tick_timers(Duration::from_secs(4)));
        assert!(peer.tick_timers(Duration::from_secs(2)));
    }

    #[test]
    fn pacing_accumulator_caps() {
        let peer = Peer::new(2, addr());
        peer.set_max_packets_per_second(5);
        peer.charge_accumulator(Duration::from_secs(100));
        assert!(peer.try_spend_one());
    }
}
