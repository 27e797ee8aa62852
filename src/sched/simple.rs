//! Simple ready queue: one chain ordered by priority
//!
//! Insertion walks the chain, so it is O(n) in the number of ready
//! threads; in exchange there is no per-level storage at all. Suited to
//! small systems with few threads.

use alloc::vec;
use alloc::vec::Vec;

use super::ReadyQueue;
use crate::kern::chain::{Chain, ChainNode};
use crate::kern::priority::Priority;
use crate::types::ThreadIndex;

#[derive(Debug)]
pub struct SimpleReadyQueue {
    chain: Chain,
    links: Vec<ChainNode>,
    keys: Vec<(Priority, i64)>,
}

impl ReadyQueue for SimpleReadyQueue {
    fn new(_levels: usize, threads: usize) -> Self {
        Self {
            chain: Chain::new(),
            links: vec![ChainNode::new(); threads],
            keys: vec![(Priority::HIGHEST, 0); threads],
        }
    }

    fn insert(&mut self, thread: ThreadIndex, priority: Priority, sequence: i64) {
        if thread >= self.links.len() {
            self.links.resize(thread + 1, ChainNode::new());
            self.keys.resize(thread + 1, (Priority::HIGHEST, 0));
        }
        self.keys[thread] = (priority, sequence);
        let keys = &self.keys;
        self.chain
            .insert_ordered(&mut self.links, thread, |a, b| keys[a] < keys[b]);
    }

    fn extract(&mut self, thread: ThreadIndex) {
        if self.contains(thread) {
            self.chain.extract(&mut self.links, thread);
        }
    }

    fn first(&self) -> Option<ThreadIndex> {
        self.chain.first()
    }

    fn first_matching(&self, filter: &mut dyn FnMut(ThreadIndex) -> bool) -> Option<ThreadIndex> {
        self.chain.iter(&self.links).find(|thread| filter(*thread))
    }

    fn contains(&self, thread: ThreadIndex) -> bool {
        self.links.get(thread).is_some_and(ChainNode::is_on_chain)
    }

    fn len(&self) -> usize {
        self.chain.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_by_priority_then_sequence() {
        let mut queue = SimpleReadyQueue::new(0, 4);
        queue.insert(0, Priority(5), 1);
        queue.insert(1, Priority(5), 2);
        queue.insert(2, Priority(3), 3);
        queue.insert(3, Priority(5), -1);
        let order: Vec<ThreadIndex> = queue.chain.iter(&queue.links).collect();
        assert_eq!(order, [2, 3, 0, 1]);
        queue.extract(2);
        assert_eq!(queue.first(), Some(3));
        assert_eq!(queue.first_matching(&mut |t| t < 2), Some(0));
        assert_eq!(queue.len(), 3);
    }
}
