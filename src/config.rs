//! Configuration collaborator (`spec.md` §6 "Tunables" plus the constructor
//! arguments named throughout §4 and §6).

use std::time::Duration;

/// Tunables a `Connection` reads from, plus the values that are fixed at
/// construction time. None of these are named `spec.md`'s Non-goals exclude
/// -- observability/ambient behavior is carried regardless of what feature
/// Non-goals scope out.
#[derive(Debug, Clone)]
pub struct Config {
    /// Constant compared against every inbound datagram's base header;
    /// mismatches are dropped silently.
    pub protocol_id: u32,
    /// Ceiling on a single datagram, including the base header.
    pub max_packet_size: usize,
    /// Connection-wide idle timeout: no inbound datagram, or a reliable
    /// frame buffered past this age, marks the peer for removal.
    pub peer_timeout: Duration,
    /// Target round-trip time the pacing heuristic scales the send rate
    /// against once an RTT sample exists: at or under this RTT a peer is
    /// paced at `congestion_control_max_rate`, and the rate is scaled down
    /// proportionally as the measured RTT grows past it.
    pub congestion_control_aim_rtt: Duration,
    /// Per-peer pacing ceiling, packets/second.
    pub congestion_control_max_rate: u32,
    /// Per-peer pacing floor, packets/second: applied before any RTT sample
    /// exists, and as the lower clamp on the RTT-scaled rate afterward.
    pub congestion_control_min_rate: u32,
}

impl Config {
    pub fn new(protocol_id: u32) -> Self {
        Config {
            protocol_id,
            ..Config::default()
        }
    }

    /// Maximum application bytes a single ORIGINAL frame may carry.
    pub fn max_original_payload(&self) -> usize {
        self.max_packet_size
            .saturating_sub(crate::BASE_HEADER_SIZE)
            .saturating_sub(1)
    }

    /// Maximum application bytes a single SPLIT chunk may carry.
    pub fn max_split_chunk(&self) -> usize {
        self.max_packet_size
            .saturating_sub(crate::BASE_HEADER_SIZE)
            .saturating_sub(1 + 2 + 2 + 2)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            protocol_id: 0,
            max_packet_size: 512,
            peer_timeout: Duration::from_secs(30),
            congestion_control_aim_rtt: Duration::from_millis(200),
            congestion_control_max_rate: 100,
            congestion_control_min_rate: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bounds_are_sane() {
        let config = Config::default();
        assert!(config.max_split_chunk() < config.max_original_payload());
        assert!(config.max_split_chunk() > 0);
    }
}
