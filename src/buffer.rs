use bytes::Bytes;
use std::io::IoSlice;

/// Consumed-fragment count beyond which the chain compacts its backing
/// storage instead of letting the prefix grow without bound.
const REBASE_THRESHOLD: usize = 128;

/// An ordered chain of byte fragments with front-consumption.
///
/// Appending takes ownership of a fragment without copying its payload.
/// `advance` consumes bytes from the front, splitting a fragment when the
/// count lands inside it. Consumed fragments are skipped over with a cursor
/// and reclaimed in batches, so advancing is cheap even for long chains.
#[derive(Debug, Default)]
pub struct BufferChain {
    fragments: Vec<Bytes>,
    cursor: usize,
    total: usize,
}

impl BufferChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unconsumed bytes across all fragments.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Number of live (unconsumed) fragments.
    pub fn num_fragments(&self) -> usize {
        self.fragments.len() - self.cursor
    }

    /// Append a fragment to the back of the chain. Empty fragments are
    /// dropped rather than stored.
    pub fn append(&mut self, fragment: Bytes) {
        if fragment.is_empty() {
            return;
        }
        self.total += fragment.len();
        self.fragments.push(fragment);
    }

    /// Move every fragment of `other` onto the back of `self`, leaving
    /// `other` empty.
    pub fn append_chain(&mut self, other: &mut BufferChain) {
        for fragment in other.fragments.drain(other.cursor..) {
            self.total += fragment.len();
            self.fragments.push(fragment);
        }
        other.clear();
    }

    /// Vectored-io view of the live fragments, in order.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.fragments[self.cursor..]
            .iter()
            .map(|f| IoSlice::new(f))
            .collect()
    }

    /// Consume `count` bytes from the front.
    ///
    /// Panics if `count` exceeds the unconsumed length.
    pub fn advance(&mut self, mut count: usize) {
        assert!(count <= self.total, "advance past end of chain");
        self.total -= count;
        while count > 0 {
            let front = &mut self.fragments[self.cursor];
            if count >= front.len() {
                count -= front.len();
                self.cursor += 1;
            } else {
                *front = front.slice(count..);
                count = 0;
            }
        }
        if self.cursor == self.fragments.len() {
            self.fragments.clear();
            self.cursor = 0;
        } else if self.cursor > REBASE_THRESHOLD {
            self.fragments.drain(..self.cursor);
            self.cursor = 0;
        }
    }

    /// Remove and return the front fragment.
    pub fn pop_fragment(&mut self) -> Option<Bytes> {
        if self.cursor == self.fragments.len() {
            return None;
        }
        let fragment = std::mem::take(&mut self.fragments[self.cursor]);
        self.cursor += 1;
        self.total -= fragment.len();
        if self.cursor == self.fragments.len() {
            self.fragments.clear();
            self.cursor = 0;
        }
        Some(fragment)
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
        self.cursor = 0;
        self.total = 0;
    }

    /// Take the whole chain, leaving `self` empty.
    pub fn take(&mut self) -> BufferChain {
        std::mem::take(self)
    }

    /// Copy the unconsumed bytes into a single contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total);
        for fragment in &self.fragments[self.cursor..] {
            out.extend_from_slice(fragment);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_of(parts: &[&[u8]]) -> BufferChain {
        let mut chain = BufferChain::new();
        for p in parts {
            chain.append(Bytes::copy_from_slice(p));
        }
        chain
    }

    #[test]
    fn test_append_advance_roundtrip() {
        let mut chain = chain_of(&[b"hello ", b"chain ", b"world"]);
        assert_eq!(chain.len(), 17);
        assert_eq!(chain.num_fragments(), 3);

        // consume across a fragment boundary
        chain.advance(8);
        assert_eq!(chain.len(), 9);
        assert_eq!(chain.to_vec(), b"ain world");

        // consume landing exactly on a boundary
        chain.advance(4);
        assert_eq!(chain.to_vec(), b"world");

        chain.advance(5);
        assert!(chain.is_empty());
        assert_eq!(chain.num_fragments(), 0);
    }

    #[test]
    fn test_empty_fragments_dropped() {
        let mut chain = BufferChain::new();
        chain.append(Bytes::new());
        assert!(chain.is_empty());
        assert_eq!(chain.num_fragments(), 0);
    }

    #[test]
    fn test_append_chain_drains_source() {
        let mut a = chain_of(&[b"one", b"two"]);
        let mut b = chain_of(&[b"three"]);
        a.append_chain(&mut b);
        assert!(b.is_empty());
        assert_eq!(a.to_vec(), b"onetwothree");
    }

    #[test]
    fn test_io_slices_match_content() {
        let chain = chain_of(&[b"ab", b"cd"]);
        let slices = chain.io_slices();
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"ab");
        assert_eq!(&*slices[1], b"cd");
    }

    #[test]
    fn test_rebase_reclaims_consumed_fragments() {
        let mut chain = BufferChain::new();
        for i in 0..200u8 {
            chain.append(Bytes::copy_from_slice(&[i]));
        }
        chain.advance(150);
        assert_eq!(chain.len(), 50);
        assert_eq!(chain.num_fragments(), 50);
        // the consumed prefix was compacted away
        assert!(chain.fragments.len() <= 50 + REBASE_THRESHOLD);
        assert_eq!(chain.to_vec()[0], 150);
    }

    #[test]
    #[should_panic(expected = "advance past end")]
    fn test_advance_past_end_panics() {
        let mut chain = chain_of(&[b"abc"]);
        chain.advance(4);
    }

    #[test]
    fn test_pop_fragment_in_order() {
        let mut chain = chain_of(&[b"a", b"bb"]);
        assert_eq!(chain.pop_fragment().unwrap(), &b"a"[..]);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.pop_fragment().unwrap(), &b"bb"[..]);
        assert!(chain.pop_fragment().is_none());
        assert!(chain.is_empty());
    }

    #[test]
    fn test_take_leaves_empty() {
        let mut chain = chain_of(&[b"data"]);
        let taken = chain.take();
        assert!(chain.is_empty());
        assert_eq!(taken.to_vec(), b"data");
    }
}
