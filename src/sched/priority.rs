//! Bitmap ready queue
//!
//! One FIFO chain per priority level plus a [`PriorityBitmap`] marking the
//! non-empty levels. `first()` is two bit scans and a chain head read.
//! Within a level the chain is kept sorted by sequence number; appends
//! land at the tail in O(1), re-insertions after a priority change walk
//! back from the tail to their old position.

use alloc::vec;
use alloc::vec::Vec;

use super::ReadyQueue;
use crate::kern::bitmap::PriorityBitmap;
use crate::kern::chain::{Chain, ChainNode};
use crate::kern::priority::Priority;
use crate::types::ThreadIndex;

/// Bitmap plus per-level chains
#[derive(Debug)]
pub struct PriorityReadyQueue {
    bitmap: PriorityBitmap,
    levels: Vec<Chain>,
    links: Vec<ChainNode>,
    level_of: Vec<usize>,
    sequence: Vec<i64>,
    count: usize,
}

impl PriorityReadyQueue {
    fn grow(&mut self, thread: ThreadIndex) {
        if thread >= self.links.len() {
            self.links.resize(thread + 1, ChainNode::new());
            self.level_of.resize(thread + 1, 0);
            self.sequence.resize(thread + 1, 0);
        }
    }
}

impl ReadyQueue for PriorityReadyQueue {
    fn new(levels: usize, threads: usize) -> Self {
        Self {
            bitmap: PriorityBitmap::new(levels),
            levels: vec![Chain::new(); levels],
            links: vec![ChainNode::new(); threads],
            level_of: vec![0; threads],
            sequence: vec![0; threads],
            count: 0,
        }
    }

    fn insert(&mut self, thread: ThreadIndex, priority: Priority, sequence: i64) {
        self.grow(thread);
        let level = priority.value() as usize;
        self.bitmap.set(level);

        let mut after = self.levels[level].last();
        while let Some(node) = after {
            if self.sequence[node] < sequence {
                break;
            }
            after = self.links[node].prev();
        }
        self.levels[level].insert_after(&mut self.links, after, thread);
        self.level_of[thread] = level;
        self.sequence[thread] = sequence;
        self.count += 1;
    }

    fn extract(&mut self, thread: ThreadIndex) {
        if !self.contains(thread) {
            return;
        }
        let level = self.level_of[thread];
        self.levels[level].extract(&mut self.links, thread);
        if self.levels[level].is_empty() {
            self.bitmap.clear(level);
        }
        self.count -= 1;
    }

    fn first(&self) -> Option<ThreadIndex> {
        let level = self.bitmap.get_highest()?;
        self.levels[level].first()
    }

    fn first_matching(&self, filter: &mut dyn FnMut(ThreadIndex) -> bool) -> Option<ThreadIndex> {
        self.bitmap
            .iter()
            .flat_map(|level| self.levels[level].iter(&self.links))
            .find(|thread| filter(*thread))
    }

    fn contains(&self, thread: ThreadIndex) -> bool {
        self.links.get(thread).is_some_and(ChainNode::is_on_chain)
    }

    fn len(&self) -> usize {
        self.count
    }
}
