//! Per-peer, per-channel state machine (`spec.md` §4.4): sequence counters,
//! the two reliable buffers, the split reassembly buffer, the command and
//! ready-reliable queues, and the congestion window.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{
            AtomicU32,
            AtomicU64,
            Ordering,
        },
        Mutex,
    },
    time::Duration,
};

use crate::{
    codec::{
        self,
        BaseHeader,
        ControlType,
        Frame,
    },
    connection::Command,
    peer::Peer,
    reliable::{
        BufferedFrame,
        ReliablePacketBuffer,
    },
    seqnum_higher,
    split::SplitBuffer,
    ChannelNum,
    Error,
    Sequence,
    MAX_RELIABLE_WINDOW_SIZE,
    MIN_RELIABLE_WINDOW_SIZE,
};

struct Counters {
    next_outgoing_seqnum: Sequence,
    next_incoming_seqnum: Sequence,
    next_outgoing_split_seqnum: u16,
}

/// One of the three priority channels a peer carries. Channel 0 is also
/// where control frames (PING, SET_PEER_ID, DISCO) travel.
pub struct Channel {
    pub num: ChannelNum,
    counters: Mutex<Counters>,
    pub outgoing_unacked: ReliablePacketBuffer,
    incoming_reorder: ReliablePacketBuffer,
    split: SplitBuffer,
    /// Raw payloads that have not yet been fragmented because the window
    /// was full when the application asked to send them.
    command_queue: Mutex<VecDeque<Vec<u8>>>,
    /// Fully-framed reliable datagrams, seqnum already assigned, waiting to
    /// be handed to the socket as window space allows.
    ready_reliables: Mutex<VecDeque<BufferedFrame>>,
    window_size: AtomicU32,
    loss_counter: AtomicU32,
    bytes_counter: AtomicU64,
    max_bpm: AtomicU64,
}

impl Channel {
    pub fn new(num: ChannelNum) -> Self {
        Channel {
            num,
            counters: Mutex::new(Counters {
                next_outgoing_seqnum: crate::SEQNUM_INITIAL,
                next_incoming_seqnum: crate::SEQNUM_INITIAL,
                next_outgoing_split_seqnum: 0,
            }),
            outgoing_unacked: ReliablePacketBuffer::new(),
            incoming_reorder: ReliablePacketBuffer::new(),
            split: SplitBuffer::new(),
            command_queue: Mutex::new(VecDeque::new()),
            ready_reliables: Mutex::new(VecDeque::new()),
            window_size: AtomicU32::new(MIN_RELIABLE_WINDOW_SIZE),
            loss_counter: AtomicU32::new(0),
            bytes_counter: AtomicU64::new(0),
            max_bpm: AtomicU64::new(0),
        }
    }

    pub fn window_size(&self) -> u32 {
        self.window_size.load(Ordering::Relaxed)
    }

    pub fn has_window_space(&self) -> bool {
        (self.outgoing_unacked.size() as u32) < self.window_size()
    }

    /// Returns the next value to use as an outgoing sequence number,
    /// skipping any value still present in the outgoing-unacked buffer, and
    /// advances the counter past it.
    pub fn next_sequence_number(&self) -> Sequence {
        let mut counters = self.counters.lock().unwrap();
        let mut seq = counters.next_outgoing_seqnum;
        while self.outgoing_unacked.contains(seq) {
            seq = seq.wrapping_add(1);
        }
        counters.next_outgoing_seqnum = seq.wrapping_add(1);
        seq
    }

    fn peek_split_seqnum(&self) -> u16 {
        self.counters.lock().unwrap().next_outgoing_split_seqnum
    }

    fn store_split_seqnum(&self, seq: u16) {
        self.counters.lock().unwrap().next_outgoing_split_seqnum = seq;
    }

    pub fn queue_command(&self, payload: Vec<u8>) {
        self.command_queue.lock().unwrap().push_back(payload);
    }

    pub fn push_ready(&self, frame: BufferedFrame) {
        self.ready_reliables.lock().unwrap().push_back(frame);
    }

    /// Drains the command queue, fragmenting and assigning sequence numbers
    /// while window space remains, pushing the result onto `ready_reliables`.
    pub fn drain_commands(
        &self,
        header: &BaseHeader,
        addr: SocketAddr,
        fits_max: usize,
        chunk_max: usize,
    ) {
        loop {
            if !self.has_window_space() {
                break;
            }
            let payload = {
                let mut queue = self.command_queue.lock().unwrap();
                match queue.pop_front() {
                    Some(p) => p,
                    None => break,
                }
            };
            self.fragment_and_queue(&payload, header, addr, fits_max, chunk_max);
        }
    }

    /// Fragments `payload`, wraps each piece RELIABLE with a freshly
    /// allocated sequence number, wraps the base header, and pushes onto
    /// `ready_reliables`.
    pub fn fragment_and_queue(
        &self,
        payload: &[u8],
        header: &BaseHeader,
        addr: SocketAddr,
        fits_max: usize,
        chunk_max: usize,
    ) {
        let mut split_seqnum = self.peek_split_seqnum();
        let frames = codec::auto_split(payload, fits_max, chunk_max, &mut split_seqnum);
        self.store_split_seqnum(split_seqnum);
        for frame in frames {
            let seqnum = self.next_sequence_number();
            let reliable = match codec::make_reliable(frame, seqnum) {
                Ok(f) => f,
                Err(_) => continue,
            };
            let bytes = match codec::encode_datagram(header, &reliable) {
                Ok(b) => b,
                Err(_) => continue,
            };
            self.push_ready(BufferedFrame::new(seqnum, bytes, addr));
        }
    }

    /// Shifts as many ready-reliable frames as window space permits into
    /// the unacked buffer, returning them so the caller can transmit.
    pub fn shift_ready_into_window(&self) -> Vec<BufferedFrame> {
        let mut shifted = Vec::new();
        loop {
            if !self.has_window_space() {
                break;
            }
            let frame = {
                let mut ready = self.ready_reliables.lock().unwrap();
                match ready.pop_front() {
                    Some(f) => f,
                    None => break,
                }
            };
            if self.outgoing_unacked.insert(frame.clone()).is_ok() {
                shifted.push(frame);
            }
        }
        shifted
    }

    pub fn record_loss(&self, count: u32) {
        self.loss_counter.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.bytes_counter.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Congestion window adjustment sampled every 5s from the loss counter
    /// (`spec.md` §4.4). The 10..=20 bracket is intentionally left a no-op.
    pub fn sample_congestion(&self) {
        let loss = self.loss_counter.swap(0, Ordering::Relaxed);
        let window = self.window_size.load(Ordering::Relaxed);
        let next = match loss {
            0 => (window + 10).min(MAX_RELIABLE_WINDOW_SIZE),
            1 ..= 9 => (window + 2).min(MAX_RELIABLE_WINDOW_SIZE),
            21 ..= 50 => window.saturating_sub(2).max(MIN_RELIABLE_WINDOW_SIZE),
            loss if loss > 50 => window.saturating_sub(10).max(MIN_RELIABLE_WINDOW_SIZE),
            _ => window,
        };
        if next != window {
            log::trace!("channel {} window {window} -> {next} (loss {loss})", self.num);
        }
        self.window_size.store(next, Ordering::Relaxed);
    }

    /// Byte-throughput sample every 60s; observability only.
    pub fn sample_throughput(&self) {
        let bytes = self.bytes_counter.swap(0, Ordering::Relaxed);
        let bpm = bytes.saturating_mul(60);
        let prev = self.max_bpm.load(Ordering::Relaxed);
        if bpm > prev {
            self.max_bpm.store(bpm, Ordering::Relaxed);
        }
    }

    pub fn max_bpm(&self) -> u64 {
        self.max_bpm.load(Ordering::Relaxed)
    }

    pub fn age_split(&self, dt: Duration, timeout: Duration) {
        self.split.age_unreliable(dt, timeout);
    }

    /// Processes one channel packet recursively (`spec.md` §4.6 "Channel
    /// packet processing"). `reliable` is true when we are recursing out of
    /// a RELIABLE wrapper. Returns the delivered application payload, if
    /// any was produced.
    pub fn process(
        &self,
        frame: Frame,
        reliable: bool,
        addr: SocketAddr,
        peer: &Peer,
        own_id: &std::sync::atomic::AtomicU16,
        command_tx: &tokio::sync::mpsc::UnboundedSender<Command>,
    ) -> Result<Option<Vec<u8>>, Error> {
        match frame {
            Frame::Control(ControlType::Ack(seqnum)) => {
                match self.outgoing_unacked.pop(seqnum) {
                    Ok(removed) => {
                        peer.report_rtt(removed.total_timer);
                        self.record_bytes(removed.bytes.len() as u64);
                    },
                    Err(Error::NotFound) => {
                        log::debug!("ACK for unknown seqnum {seqnum} on channel {}", self.num);
                    },
                    Err(e) => return Err(e),
                }
                Ok(None)
            },
            Frame::Control(ControlType::SetPeerId(new_id)) => {
                match own_id.compare_exchange(
                    crate::PEER_ID_INEXISTENT,
                    new_id,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => log::info!("assigned own peer id {new_id}"),
                    Err(_) => log::warn!("SET_PEER_ID received but own id is already assigned"),
                }
                Ok(None)
            },
            Frame::Control(ControlType::Ping) => Ok(None),
            Frame::Control(ControlType::Disco) => {
                peer.mark_for_removal(false);
                Ok(None)
            },
            Frame::Original(payload) => Ok(Some(payload)),
            Frame::Split {
                split_seqnum,
                chunk_count,
                chunk_num,
                data,
            } => Ok(self
                .split
                .insert(split_seqnum, chunk_count, chunk_num, data, reliable)),
            Frame::Reliable { seqnum, inner } => {
                if reliable {
                    return Err(Error::InvalidIncomingData("nested RELIABLE frame"));
                }

                let _ = command_tx.send(Command::SendAck {
                    peer_id: peer.id(),
                    channel: self.num,
                    seqnum,
                });

                let next_incoming = self.counters.lock().unwrap().next_incoming_seqnum;

                let is_future = seqnum_higher(seqnum, next_incoming);
                let is_old = seqnum_higher(next_incoming, seqnum);

                if is_future {
                    let mut encoded = Vec::new();
                    if inner.encode(&mut encoded).is_ok() {
                        let _ = self
                            .incoming_reorder
                            .insert(BufferedFrame::new(seqnum, encoded, addr));
                    }
                    Ok(None)
                } else if is_old {
                    Err(Error::InvalidIncomingData("stale reliable frame"))
                } else {
                    self.counters.lock().unwrap().next_incoming_seqnum =
                        next_incoming.wrapping_add(1);
                    self.process(*inner, true, addr, peer, own_id, command_tx)
                }
            },
        }
    }

    /// Scans the incoming reorder buffer: evicts superseded entries, then
    /// delivers the head if it is now the expected sequence number. Returns
    /// at most one delivered payload per call, matching the receiver loop's
    /// one-extraction-per-iteration contract.
    pub fn pump_reorder_buffer(
        &self,
        addr: SocketAddr,
        peer: &Peer,
        own_id: &std::sync::atomic::AtomicU16,
        command_tx: &tokio::sync::mpsc::UnboundedSender<Command>,
    ) -> Option<Vec<u8>> {
        loop {
            let next_incoming = self.counters.lock().unwrap().next_incoming_seqnum;

            let head = self.incoming_reorder.first_seqnum()?;

            if seqnum_higher(next_incoming, head) {
                // superseded, drop it
                let _ = self.incoming_reorder.pop(head);
                continue;
            }

            if head != next_incoming {
                return None;
            }

            let buffered = self.incoming_reorder.pop(head).ok()?;
            let frame = Frame::decode(&buffered.bytes).ok()?;
            match self.process(frame, true, addr, peer, own_id, command_tx) {
                Ok(Some(payload)) => return Some(payload),
                Ok(None) => continue,
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_sequence_number_skips_in_flight() {
        let channel = Channel::new(0);
        let first = channel.next_sequence_number();
        channel
            .outgoing_unacked
            .insert(BufferedFrame::new(first + 1, vec![], ([127, 0, 0, 1], 0).into()))
            .unwrap();
        let second = channel.next_sequence_number();
        assert_eq!(second, first + 2);
        let third = channel.next_sequence_number();
        assert_eq!(third, first + 3);
    }

    #[test]
    fn congestion_window_bounds_and_gap() {
        let channel = Channel::new(0);
        channel.window_size.store(MIN_RELIABLE_WINDOW_SIZE, Ordering::Relaxed);
        channel.record_loss(15);
        channel.sample_congestion();
        assert_eq!(channel.window_size(), MIN_RELIABLE_WINDOW_SIZE);

        channel.record_loss(0);
        channel.sample_congestion();
        assert_eq!(
            channel.window_size(),
            (MIN_RELIABLE_WINDOW_SIZE + 10).min(MAX_RELIABLE_WINDOW_SIZE)
        );
    }

    #[test]
    fn congestion_window_floors_and_caps() {
        let channel = Channel::new(0);
        channel.window_size.store(MAX_RELIABLE_WINDOW_SIZE, Ordering::Relaxed);
        channel.record_loss(200);
        channel.sample_congestion();
        assert_eq!(
            channel.window_size(),
            MAX_RELIABLE_WINDOW_SIZE.saturating_sub(10)
        );

        channel.window_size.store(MIN_RELIABLE_WINDOW_SIZE, Ordering::Relaxed);
        channel.record_loss(200);
        channel.sample_congestion();
        assert_eq!(channel.window_size(), MIN_RELIABLE_WINDOW_SIZE);
    }
}
