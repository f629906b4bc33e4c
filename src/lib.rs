//! Reliable, ordered, channel-multiplexed transport on top of an unreliable
//! datagram socket. See `connection::Connection` for the public entry point.

use std::{
    fmt,
    io::Error as StdIoError,
    time::Duration,
};

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod peer;
pub mod reliable;
pub mod split;

pub use config::Config;
pub use connection::{
    Connection,
    Event,
};

/// Peer identifier. `0` is reserved (`PEER_ID_INEXISTENT`), `1` is reserved
/// for the listening endpoint (`PEER_ID_SERVER`).
pub type PeerId = u16;

/// 16-bit modular sequence number, used for both the reliable-frame counter
/// and the split-group counter.
pub type Sequence = u16;

/// Channel number, always `0`, `1` or `2`.
pub type ChannelNum = u8;

pub const PEER_ID_INEXISTENT: PeerId = 0;
pub const PEER_ID_SERVER: PeerId = 1;
pub const PEER_ID_FIRST_ASSIGNED: PeerId = 2;

pub const CHANNEL_COUNT: usize = 3;

pub const BASE_HEADER_SIZE: usize = 4 + 2 + 1;

pub const SEQNUM_INITIAL: Sequence = 65500;

pub const MAX_RELIABLE_WINDOW_SIZE: u32 = 1024;
pub const MIN_RELIABLE_WINDOW_SIZE: u32 = 64;

pub const RESEND_TIMEOUT_MIN: Duration = Duration::from_millis(500);
pub const RESEND_TIMEOUT_MAX: Duration = Duration::from_secs(3);
pub const RESEND_TIMEOUT_FACTOR: f64 = 2.0;

pub const PING_INTERVAL: Duration = Duration::from_secs(5);
pub const CONGESTION_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);
pub const THROUGHPUT_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on reliable/receiver iterations serviced per loop tick, a
/// guard against a single connection starving the rest of the process.
pub const MAX_RECEIVER_ITERATIONS: usize = 1000;

/// `true` iff `a` is strictly modular-ahead of `b` on the 16-bit ring, i.e.
/// the shortest modular distance from `b` to `a` is in the forward
/// direction.
pub fn seqnum_higher(a: Sequence, b: Sequence) -> bool {
    let diff = a.wrapping_sub(b);
    diff != 0 && diff <= 32767
}

#[derive(Debug)]
pub enum Error {
    /// IO error wrapper.
    Io(StdIoError),
    /// Sequence number absent (ACK for an unknown frame).
    NotFound,
    /// Duplicate sequence number on insert into a reliable buffer.
    AlreadyExists,
    /// Malformed datagram: short header, unknown frame type, bad channel,
    /// nested RELIABLE, or a stale-but-unbuffered reliable frame.
    InvalidIncomingData(&'static str),
    /// An API call referenced a peer id that is not (or no longer) known.
    PeerNotFound,
    /// Socket bind failed while serving.
    ConnectionBindFailed(StdIoError),
    /// Socket transmit failed; the frame, if reliable, stays buffered so the
    /// retransmission loop retries it.
    SendFailed(StdIoError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {}

impl From<StdIoError> for Error {
    fn from(from: StdIoError) -> Self {
        Self::Io(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqnum_higher_basic() {
        assert!(seqnum_higher(1, 0));
        assert!(!seqnum_higher(0, 1));
        assert!(!seqnum_higher(0, 0));
    }

    #[test]
    fn seqnum_higher_wraps() {
        assert!(seqnum_higher(0, 65535));
        assert!(seqnum_higher(65535, 65534));
        assert!(!seqnum_higher(65534, 65535));
    }

    #[test]
    fn seqnum_higher_initial_ordering() {
        assert!(seqnum_higher(SEQNUM_INITIAL + 1, SEQNUM_INITIAL));
        assert!(seqnum_higher(0, 65535));
        assert!(seqnum_higher(1, 0));
    }
}
