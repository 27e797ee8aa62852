//! Earliest-deadline-first ready queue
//!
//! Ready threads sit in a red-black tree keyed by `(priority, sequence)`.
//! Under the deadline mapping a thread with a released job has its
//! absolute deadline as priority, while a thread without a job carries its
//! user priority with the background bit set, so every job orders before
//! every background thread.

use alloc::vec;
use alloc::vec::Vec;

use super::ReadyQueue;
use crate::kern::priority::Priority;
use crate::kern::rbtree::{RbHandle, RbTree};
use crate::types::ThreadIndex;

#[derive(Debug)]
pub struct EdfReadyQueue {
    tree: RbTree<(Priority, i64), ThreadIndex>,
    handles: Vec<Option<RbHandle>>,
}

impl ReadyQueue for EdfReadyQueue {
    fn new(_levels: usize, threads: usize) -> Self {
        Self {
            tree: RbTree::with_capacity(threads),
            handles: vec![None; threads],
        }
    }

    fn insert(&mut self, thread: ThreadIndex, priority: Priority, sequence: i64) {
        if thread >= self.handles.len() {
            self.handles.resize(thread + 1, None);
        }
        debug_assert!(
            self.handles[thread].is_none(),
            "thread {} already ready",
            thread
        );
        self.handles[thread] = Some(self.tree.insert((priority, sequence), thread));
    }

    fn extract(&mut self, thread: ThreadIndex) {
        if let Some(handle) = self.handles.get_mut(thread).and_then(Option::take) {
            self.tree.remove(handle);
        }
    }

    fn first(&self) -> Option<ThreadIndex> {
        let min = self.tree.min()?;
        self.tree.get(min).map(|(_, thread)| *thread)
    }

    fn first_matching(&self, filter: &mut dyn FnMut(ThreadIndex) -> bool) -> Option<ThreadIndex> {
        self.tree
            .iter()
            .map(|(_, _, thread)| *thread)
            .find(|thread| filter(*thread))
    }

    fn contains(&self, thread: ThreadIndex) -> bool {
        self.handles.get(thread).is_some_and(Option::is_some)
    }

    fn len(&self) -> usize {
        self.tree.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::PriorityMapping;

    #[test]
    fn test_earliest_deadline_first() {
        let mapping = PriorityMapping::Deadline;
        let mut queue = EdfReadyQueue::new(0, 4);
        queue.insert(0, mapping.map(Priority(1)), 1);
        queue.insert(1, mapping.job(500).unwrap(), 2);
        queue.insert(2, mapping.job(200).unwrap(), 3);
        assert_eq!(queue.first(), Some(2));
        queue.extract(2);
        assert_eq!(queue.first(), Some(1));
        queue.extract(1);
        assert_eq!(queue.first(), Some(0));
        assert_eq!(queue.len(), 1);
        assert!(queue.first_matching(&mut |_| true).is_some());
    }

    #[test]
    fn test_equal_deadlines_fifo() {
        let mut queue = EdfReadyQueue::new(0, 4);
        queue.insert(3, Priority(100), 1);
        queue.insert(1, Priority(100), 2);
        assert_eq!(queue.first(), Some(3));
        assert_eq!(queue.first_matching(&mut |t| t != 3), Some(1));
        queue.extract(3);
        queue.extract(3);
        assert!(!queue.contains(3));
        assert_eq!(queue.len(), 1);
    }
}
