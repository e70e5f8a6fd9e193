//! Received-sequence-number cache for duplicate suppression.
//!
//! A bounded FIFO of (sender address, sequence number) pairs consulted
//! before a received data frame is delivered upward. Grounded on the same
//! fixed-capacity `heapless::Vec` shape `neighbor.rs`'s table uses; eviction
//! shifts the array on every insert rather than tracking a ring index, an
//! O(cache size)-per-packet cost the original design notes call out
//! explicitly and accept.

use heapless::Vec;
use ieee802154::mac::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SeqnoEntry {
    address: Address,
    seq: u8,
}

pub struct SeqnoCache<const N: usize> {
    entries: Vec<SeqnoEntry, N>,
}

impl<const N: usize> SeqnoCache<N> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Records `(address, seq)` and reports whether it had already been
    /// seen. Best-effort: a sender/seq pair evicted by a more recent one
    /// from an unrelated sender will be treated as new again.
    pub fn check_and_insert(&mut self, address: Address, seq: u8) -> bool {
        let seen = self.entries.iter().any(|e| e.address == address && e.seq == seq);

        if self.entries.is_full() {
            self.entries.remove(0);
        }
        let _ = self.entries.push(SeqnoEntry { address, seq });

        seen
    }
}

impl<const N: usize> Default for SeqnoCache<N> {
    fn default() -> Self {
        Self::new()
    }
}
