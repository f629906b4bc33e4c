//! Reliable packet buffer (`spec.md` §4.2): an ordered collection of buffered
//! frames keyed by sequence number, with retransmit/total-age timer
//! bookkeeping. One instance serves as a channel's outgoing-unacked buffer,
//! another as its incoming-out-of-order buffer.

use std::{
    net::SocketAddr,
    sync::Mutex,
    time::Duration,
};

use crate::{
    seqnum_higher,
    Error,
    Sequence,
};

/// The fully-framed datagram bytes plus the bookkeeping the reliable layer
/// needs: who it's for, how long since the last send attempt, and how long
/// since it was first buffered.
#[derive(Clone, Debug)]
pub struct BufferedFrame {
    pub seqnum: Sequence,
    pub bytes: Vec<u8>,
    pub addr: SocketAddr,
    pub retransmit_timer: Duration,
    pub total_timer: Duration,
}

impl BufferedFrame {
    pub fn new(seqnum: Sequence, bytes: Vec<u8>, addr: SocketAddr) -> Self {
        BufferedFrame {
            seqnum,
            bytes,
            addr,
            retransmit_timer: Duration::ZERO,
            total_timer: Duration::ZERO,
        }
    }
}

/// Entries are kept modular-sorted ascending from the buffer's current
/// window base; a single mutex guards every operation, held only for the
/// operation itself so callers can do I/O after releasing it.
pub struct ReliablePacketBuffer {
    entries: Mutex<Vec<BufferedFrame>>,
}

impl ReliablePacketBuffer {
    pub fn new() -> Self {
        ReliablePacketBuffer {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, frame: BufferedFrame) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|f| f.seqnum == frame.seqnum) {
            return Err(Error::AlreadyExists);
        }
        let pos = entries
            .iter()
            .position(|f| seqnum_higher(f.seqnum, frame.seqnum))
            .unwrap_or(entries.len());
        entries.insert(pos, frame);
        Ok(())
    }

    pub fn pop(&self, seqnum: Sequence) -> Result<BufferedFrame, Error> {
        let mut entries = self.entries.lock().unwrap();
        let pos = entries
            .iter()
            .position(|f| f.seqnum == seqnum)
            .ok_or(Error::NotFound)?;
        Ok(entries.remove(pos))
    }

    pub fn pop_first(&self) -> Option<BufferedFrame> {
        let mut entries = self.entries.lock().unwrap();
        if entries.is_empty() {
            None
        } else {
            Some(entries.remove(0))
        }
    }

    pub fn first_seqnum(&self) -> Option<Sequence> {
        self.entries.lock().unwrap().first().map(|f| f.seqnum)
    }

    pub fn contains(&self, seqnum: Sequence) -> bool {
        self.entries.lock().unwrap().iter().any(|f| f.seqnum == seqnum)
    }

    pub fn size(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn increment_timers(&self, dt: Duration) {
        let mut entries = self.entries.lock().unwrap();
        for frame in entries.iter_mut() {
            frame.retransmit_timer += dt;
            frame.total_timer += dt;
        }
    }

    /// Zeroes the retransmit timer of any frame whose timer has reached
    /// `threshold`; called right after those frames have been retransmitted.
    pub fn reset_retransmit_timers(&self, threshold: Duration) {
        let mut entries = self.entries.lock().unwrap();
        for frame in entries.iter_mut() {
            if frame.retransmit_timer >= threshold {
                frame.retransmit_timer = Duration::ZERO;
            }
        }
    }

    pub fn any_totaltime_reached(&self, threshold: Duration) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|frame| frame.total_timer >= threshold)
    }

    /// Value-copy snapshot of every frame whose retransmit timer has reached
    /// `threshold`, so the caller can do socket I/O after releasing the lock.
    pub fn collect_timed_out(&self, threshold: Duration) -> Vec<BufferedFrame> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame.retransmit_timer >= threshold)
            .cloned()
            .collect()
    }
}

impl Default for ReliablePacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        ([127, 0, 0, 1], 0).into()
    }

    #[test]
    fn insert_rejects_duplicate() {
        let buf = ReliablePacketBuffer::new();
        buf.insert(BufferedFrame::new(5, vec![], addr())).unwrap();
        assert!(matches!(
            buf.insert(BufferedFrame::new(5, vec![], addr())),
            Err(Error::AlreadyExists)
        ));
    }

    #[test]
    fn pop_missing_is_not_found() {
        let buf = ReliablePacketBuffer::new();
        assert!(matches!(buf.pop(1), Err(Error::NotFound)));
    }

    #[test]
    fn entries_stay_modular_sorted() {
        let buf = ReliablePacketBuffer::new();
        buf.insert(BufferedFrame::new(65534, vec![], addr())).unwrap();
        buf.insert(BufferedFrame::new(1, vec![], addr())).unwrap();
        buf.insert(BufferedFrame::new(65535, vec![], addr())).unwrap();
        buf.insert(BufferedFrame::new(0, vec![], addr())).unwrap();

        assert_eq!(buf.first_seqnum(), Some(65534));
        assert_eq!(buf.pop_first().unwrap().seqnum, 65534);
        assert_eq!(buf.pop_first().unwrap().seqnum, 65535);
        assert_eq!(buf.pop_first().unwrap().seqnum, 0);
        assert_eq!(buf.pop_first().unwrap().seqnum, 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn timers_and_collect_timed_out() {
        let buf = ReliablePacketBuffer::new();
        buf.insert(BufferedFrame::new(1, vec![1], addr())).unwrap();
        buf.insert(BufferedFrame::new(2, vec![2], addr())).unwrap();

        buf.increment_timers(Duration::from_millis(600));
        assert!(buf.any_totaltime_reached(Duration::from_millis(500)));

        let timed_out = buf.collect_timed_out(Duration::from_millis(500));
        assert_eq!(timed_out.len(), 2);

        buf.reset_retransmit_timers(Duration::from_millis(500));
        assert!(!buf.any_totaltime_reached(Duration::from_millis(700)));
        let timed_out = buf.collect_timed_out(Duration::from_millis(500));
        assert!(timed_out.is_empty());
    }
}
