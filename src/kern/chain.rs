//! Chain - intrusive doubly-linked list over index-addressed nodes
//!
//! The chain is the building block for ready queues, FIFO wait queues and
//! help-request lists. Linkage lives in a [`ChainNode`] per element, stored
//! in a table owned by whoever owns the elements (one slot per thread, for
//! instance). The [`Chain`] head itself only holds indices into that table.
//!
//! ## Design Notes
//!
//! - No operation allocates; every operation is O(1) except
//!   [`Chain::insert_ordered`].
//! - Each element may be on at most one chain per node table. Callers that
//!   need an element on several chains keep several node tables.
//! - Empty results are reported through `Option`, never as errors.
//!
//! ```ignore
//! let mut links = vec![ChainNode::new(); 8];
//! let mut chain = Chain::new();
//! chain.append(&mut links, 3);
//! assert_eq!(chain.get_first(&mut links), Some(3));
//! ```

pub type NodeIndex = usize;

// ============================================================================
// Chain Node
// ============================================================================

/// Per-element linkage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainNode {
    next: Option<NodeIndex>,
    prev: Option<NodeIndex>,
    on_chain: bool,
}

impl ChainNode {
    /// Create an unlinked node
    pub const fn new() -> Self {
        Self {
            next: None,
            prev: None,
            on_chain: false,
        }
    }

    /// Whether the node is linked into a chain
    pub fn is_on_chain(&self) -> bool {
        self.on_chain
    }

    /// Successor on the chain
    pub fn next(&self) -> Option<NodeIndex> {
        self.next
    }

    /// Predecessor on the chain
    pub fn prev(&self) -> Option<NodeIndex> {
        self.prev
    }
}

// ============================================================================
// Chain Head
// ============================================================================

/// Chain head: first, last and element count
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Chain {
    head: Option<NodeIndex>,
    tail: Option<NodeIndex>,
    count: usize,
}

impl Chain {
    /// Create an empty chain
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    /// First element without removing it
    pub fn first(&self) -> Option<NodeIndex> {
        self.head
    }

    /// Last element without removing it
    pub fn last(&self) -> Option<NodeIndex> {
        self.tail
    }

    /// Whether `index` is the only element
    pub fn has_only_one(&self, index: NodeIndex) -> bool {
        self.count == 1 && self.head == Some(index)
    }

    /// Append to the tail
    pub fn append(&mut self, links: &mut [ChainNode], index: NodeIndex) {
        debug_assert!(!links[index].on_chain, "node {} already on a chain", index);
        links[index] = ChainNode {
            next: None,
            prev: self.tail,
            on_chain: true,
        };
        match self.tail {
            Some(tail) => links[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.count += 1;
    }

    /// Append and report whether the chain was empty before
    pub fn append_with_empty_check(&mut self, links: &mut [ChainNode], index: NodeIndex) -> bool {
        let was_empty = self.is_empty();
        self.append(links, index);
        was_empty
    }

    /// Prepend to the head
    pub fn prepend(&mut self, links: &mut [ChainNode], index: NodeIndex) {
        self.insert_after(links, None, index);
    }

    /// Prepend and report whether the chain was empty before
    pub fn prepend_with_empty_check(&mut self, links: &mut [ChainNode], index: NodeIndex) -> bool {
        let was_empty = self.is_empty();
        self.prepend(links, index);
        was_empty
    }

    /// Insert `index` after `after`; `None` inserts at the head
    pub fn insert_after(
        &mut self,
        links: &mut [ChainNode],
        after: Option<NodeIndex>,
        index: NodeIndex,
    ) {
        debug_assert!(!links[index].on_chain, "node {} already on a chain", index);
        let next = match after {
            Some(after) => {
                debug_assert!(links[after].on_chain);
                links[after].next
            }
            None => self.head,
        };
        links[index] = ChainNode {
            next,
            prev: after,
            on_chain: true,
        };
        match after {
            Some(after) => links[after].next = Some(index),
            None => self.head = Some(index),
        }
        match next {
            Some(next) => links[next].prev = Some(index),
            None => self.tail = Some(index),
        }
        self.count += 1;
    }

    /// Remove a node from anywhere in the chain
    pub fn extract(&mut self, links: &mut [ChainNode], index: NodeIndex) {
        debug_assert!(links[index].on_chain, "node {} not on a chain", index);
        let ChainNode { next, prev, .. } = links[index];
        match prev {
            Some(prev) => links[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => links[next].prev = prev,
            None => self.tail = prev,
        }
        links[index] = ChainNode::new();
        self.count -= 1;
    }

    /// Remove and return the first node
    pub fn get_first(&mut self, links: &mut [ChainNode]) -> Option<NodeIndex> {
        let first = self.head?;
        self.extract(links, first);
        Some(first)
    }

    /// Remove the first node and report whether the chain is now empty
    ///
    /// A producer that sees `true` knows the consumer has drained the chain
    /// and must be notified again on the next append.
    pub fn get_with_empty_check(&mut self, links: &mut [ChainNode]) -> (Option<NodeIndex>, bool) {
        let first = self.get_first(links);
        (first, self.is_empty())
    }

    /// Insert before the first element that `index` orders before
    ///
    /// `precedes(a, b)` must be a strict order. Elements comparing equal to
    /// `index` stay in front of it, so equal keys keep insertion order.
    pub fn insert_ordered<F>(&mut self, links: &mut [ChainNode], index: NodeIndex, mut precedes: F)
    where
        F: FnMut(NodeIndex, NodeIndex) -> bool,
    {
        let mut after = None;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            if precedes(index, node) {
                break;
            }
            after = Some(node);
            cursor = links[node].next;
        }
        self.insert_after(links, after, index);
    }

    /// Successor of `index`
    pub fn next(&self, links: &[ChainNode], index: NodeIndex) -> Option<NodeIndex> {
        links[index].next
    }

    /// Iterate head to tail
    pub fn iter<'a>(&self, links: &'a [ChainNode]) -> ChainIter<'a> {
        ChainIter {
            links,
            cursor: self.head,
        }
    }
}

/// Head-to-tail iterator
pub struct ChainIter<'a> {
    links: &'a [ChainNode],
    cursor: Option<NodeIndex>,
}

impl Iterator for ChainIter<'_> {
    type Item = NodeIndex;

    fn next(&mut self) -> Option<NodeIndex> {
        let current = self.cursor?;
        self.cursor = self.links[current].next;
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    fn collect(chain: &Chain, links: &[ChainNode]) -> Vec<NodeIndex> {
        chain.iter(links).collect()
    }

    #[test]
    fn test_append_is_fifo() {
        let mut links = vec![ChainNode::new(); 4];
        let mut chain = Chain::new();
        assert!(chain.append_with_empty_check(&mut links, 2));
        assert!(!chain.append_with_empty_check(&mut links, 0));
        chain.append(&mut links, 3);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.get_first(&mut links), Some(2));
        assert_eq!(chain.get_first(&mut links), Some(0));
        assert_eq!(chain.get_with_empty_check(&mut links), (Some(3), true));
        assert_eq!(chain.get_first(&mut links), None);
        assert!(!links[3].is_on_chain());
    }

    #[test]
    fn test_prepend_and_insert_after() {
        let mut links = vec![ChainNode::new(); 5];
        let mut chain = Chain::new();
        chain.append(&mut links, 1);
        chain.prepend(&mut links, 0);
        chain.insert_after(&mut links, Some(1), 4);
        chain.insert_after(&mut links, Some(0), 2);
        assert_eq!(collect(&chain, &links), [0, 2, 1, 4]);
        assert_eq!(chain.first(), Some(0));
        assert_eq!(chain.last(), Some(4));
        assert_eq!(links[1].prev(), Some(2));
    }

    #[test]
    fn test_extract_anywhere() {
        let mut links = vec![ChainNode::new(); 4];
        let mut chain = Chain::new();
        for i in 0..4 {
            chain.append(&mut links, i);
        }
        chain.extract(&mut links, 2);
        chain.extract(&mut links, 0);
        chain.extract(&mut links, 3);
        assert_eq!(collect(&chain, &links), [1]);
        assert!(chain.has_only_one(1));
        chain.extract(&mut links, 1);
        assert!(chain.is_empty());
        assert_eq!(chain.last(), None);
    }

    #[test]
    fn test_insert_ordered_keeps_ties_in_order() {
        let keys = [5u32, 3, 5, 1, 3];
        let mut links = vec![ChainNode::new(); keys.len()];
        let mut chain = Chain::new();
        for i in 0..keys.len() {
            chain.insert_ordered(&mut links, i, |a, b| keys[a] < keys[b]);
        }
        assert_eq!(collect(&chain, &links), [3, 1, 4, 0, 2]);
    }
}
