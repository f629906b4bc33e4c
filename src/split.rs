//! Split reassembly buffer (`spec.md` §4.3): per-channel map from
//! split-sequence-number to a chunk set, reconstructing oversized messages.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

struct SplitEntry {
    chunk_count: u16,
    reliable: bool,
    age: Duration,
    chunks: HashMap<u16, Vec<u8>>,
}

pub struct SplitBuffer {
    entries: Mutex<HashMap<u16, SplitEntry>>,
}

impl SplitBuffer {
    pub fn new() -> Self {
        SplitBuffer {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Stores one chunk of a split group. Returns the reassembled message
    /// once every chunk has arrived, evicting the entry; otherwise `None`.
    /// Duplicate chunk indices are silently ignored.
    pub fn insert(
        &self,
        split_seqnum: u16,
        chunk_count: u16,
        chunk_num: u16,
        data: Vec<u8>,
        reliable: bool,
    ) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock().unwrap();

        {
            let entry = entries.entry(split_seqnum).or_insert_with(|| SplitEntry {
                chunk_count,
                reliable,
                age: Duration::ZERO,
                chunks: HashMap::new(),
            });

            if entry.chunk_count != chunk_count || entry.reliable != reliable {
                log::warn!(
                    "split {split_seqnum} chunk arrived with mismatched chunk_count/reliable, \
                     keeping the values from the first chunk"
                );
            }

            entry.chunks.entry(chunk_num).or_insert(data);

            if (entry.chunks.len() as u16) < entry.chunk_count {
                return None;
            }
        }

        let entry = entries.remove(&split_seqnum).unwrap();
        let mut out = Vec::new();
        for i in 0 .. entry.chunk_count {
            if let Some(chunk) = entry.chunks.get(&i) {
                out.extend_from_slice(chunk);
            }
        }
        Some(out)
    }

    /// Ages every unreliable entry by `dt`, evicting those that have reached
    /// `timeout`. Reliable entries are never evicted by time.
    pub fn age_unreliable(&self, dt: Duration, timeout: Duration) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, entry| {
            if entry.reliable {
                return true;
            }
            entry.age += dt;
            entry.age < timeout
        });
    }
}

impl Default for SplitBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_out_of_order() {
        let buf = SplitBuffer::new();
        assert!(buf.insert(1, 3, 2, b"ghi".to_vec(), false).is_none());
        assert!(buf.insert(1, 3, 0, b"abc".to_vec(), false).is_none());
        let result = buf.insert(1, 3, 1, b"def".to_vec(), false);
        assert_eq!(result, Some(b"abcdefghi".to_vec()));
    }

    #[test]
    fn duplicate_chunk_ignored() {
        let buf = SplitBuffer::new();
        assert!(buf.insert(1, 2, 0, b"aa".to_vec(), false).is_none());
        assert!(buf.insert(1, 2, 0, b"bb".to_vec(), false).is_none());
        let result = buf.insert(1, 2, 1, b"cc".to_vec(), false);
        assert_eq!(result, Some(b"aacc".to_vec()));
    }

    #[test]
    fn chunk_count_one_reassembles_single_chunk() {
        let buf = SplitBuffer::new();
        let result = buf.insert(9, 1, 0, b"solo".to_vec(), false);
        assert_eq!(result, Some(b"solo".to_vec()));
    }

    #[test]
    fn unreliable_entries_age_out() {
        let buf = SplitBuffer::new();
        buf.insert(1, 2, 0, b"a".to_vec(), false);
        buf.age_unreliable(Duration::from_secs(31), Duration::from_secs(30));
        assert!(buf.insert(1, 2, 1, b"b".to_vec(), false).is_none());
        // entry evicted, this chunk starts a fresh one-chunk-received entry
        assert_eq!(buf.entries.lock().unwrap().len(), 1);
    }

    #[test]
    fn reliable_entries_never_age_out() {
        let buf = SplitBuffer::new();
        buf.insert(1, 2, 0, b"a".to_vec(), true);
        buf.age_unreliable(Duration::from_secs(3600), Duration::from_secs(30));
        let result = buf.insert(1, 2, 1, b"b".to_vec(), true);
        assert_eq!(result, Some(b"ab".to_vec()));
    }
}
