//! The remembered set: card-marked mature chunks
//!
//! Every write of a young pointer into a mature object flags the holder's
//! chunk. Flagged chunks are scanned as additional roots by the next young
//! collection, so mature-to-young references survive evacuation without
//! tracing the whole mature space.

use rustc_hash::FxHashSet;

/// The set of mature chunks holding young pointers
#[derive(Default)]
pub struct RememberedSet {
    cards: FxHashSet<usize>,
}

impl RememberedSet {
    /// Create an empty remembered set
    pub fn new() -> Self {
        Self {
            cards: FxHashSet::default(),
        }
    }

    /// Flag a chunk as holding at least one young pointer
    pub fn remember(&mut self, chunk: usize) {
        self.cards.insert(chunk);
    }

    /// Whether a chunk is flagged
    pub fn contains(&self, chunk: usize) -> bool {
        self.cards.contains(&chunk)
    }

    /// Take all flagged chunks, leaving the set empty
    pub fn take(&mut self) -> Vec<usize> {
        let cards: Vec<usize> = self.cards.iter().copied().collect();

        self.cards.clear();
        cards
    }

    /// The number of flagged chunks
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Whether no chunks are flagged
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}
