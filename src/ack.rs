use bitvec::{BitArr, order::Lsb0};
use ringbuf::{
    HeapRb,
    traits::{Consumer, Observer, RingBuffer},
};

use crate::{constants::ACK_WINDOW, seq_nr::SeqNr};

pub const ACK_BITFIELD_BYTES: usize = ACK_WINDOW / 8;

type AckBitfieldData = BitArr!(for ACK_WINDOW, in u8, Lsb0);

// The most recently received sequence numbers of one connection. Oldest entries
// are evicted as new ones arrive.
pub struct ReceivedWindow {
    rb: HeapRb<SeqNr>,
}

impl std::fmt::Debug for ReceivedWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedWindow")
            .field("len", &self.rb.occupied_len())
            .field("capacity", &self.rb.capacity())
            .finish_non_exhaustive()
    }
}

impl Default for ReceivedWindow {
    fn default() -> Self {
        Self::new(ACK_WINDOW)
    }
}

impl ReceivedWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            rb: HeapRb::new(capacity.max(1)),
        }
    }

    pub fn push(&mut self, seq: SeqNr) {
        self.rb.push_overwrite(seq);
    }

    pub fn contains(&self, seq: SeqNr) -> bool {
        self.rb.iter().any(|s| *s == seq)
    }

    pub fn len(&self) -> usize {
        self.rb.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.rb.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = SeqNr> + '_ {
        self.rb.iter().copied()
    }
}

/// Acknowledges the [`ACK_WINDOW`] packets before the ACK number. Bit `i` covers
/// sequence `ack - i - 1`.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AckBitfield {
    data: AckBitfieldData,
}

impl std::fmt::Debug for AckBitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.data.iter_ones()).finish()
    }
}

impl AckBitfield {
    pub fn build(ack: SeqNr, window: &ReceivedWindow) -> Self {
        let mut data = AckBitfieldData::default();
        for seq in window.iter() {
            let dist = (ack - seq) as usize;
            if dist >= 1 && dist <= ACK_WINDOW {
                data.set(dist - 1, true);
            }
        }
        Self { data }
    }

    #[cfg(test)]
    pub fn new_test(set: impl IntoIterator<Item = usize>) -> Self {
        let mut data = AckBitfieldData::default();
        for idx in set {
            data.set(idx, true);
        }
        Self { data }
    }

    pub fn get(&self, idx: usize) -> bool {
        self.data.get(idx).map(|b| *b).unwrap_or(false)
    }

    pub fn count_ones(&self) -> usize {
        self.data.count_ones()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_raw_slice()
    }

    pub fn from_bytes(bytes: &[u8; ACK_BITFIELD_BYTES]) -> Self {
        let mut data = AckBitfieldData::default();
        data.as_raw_mut_slice().copy_from_slice(bytes);
        Self { data }
    }

    /// The sequence numbers this field acknowledges, given the ACK it travelled with.
    pub fn acked_seqs(&self, ack: SeqNr) -> impl Iterator<Item = SeqNr> + '_ {
        self.data.iter_ones().map(move |i| ack - (i as u16) - 1)
    }
}
