//! Red-black tree over a slot arena
//!
//! Ordered container used by the EDF ready queue, priority wait queues and
//! the watchdog header. Nodes live in a slab; callers keep the returned
//! [`RbHandle`] to extract a specific entry in O(log n). Handles carry the
//! slot generation, so a handle to an entry that was already removed is
//! rejected instead of hitting the slot's next occupant.
//!
//! Keys equal under `Ord` are kept in insertion order: a new key goes to
//! the right of every key that compares equal.

use alloc::vec::Vec;

/// Handle to a tree entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RbHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

#[derive(Debug, Clone, Copy)]
struct Links {
    parent: Option<u32>,
    left: Option<u32>,
    right: Option<u32>,
    color: Color,
}

/// Red-black tree keyed by `K`
#[derive(Debug)]
pub struct RbTree<K: Ord, V> {
    links: Vec<Links>,
    /// Key and value per slot, `None` while the slot is free
    entries: Vec<Option<(K, V)>>,
    generations: Vec<u32>,
    free: Vec<u32>,
    root: Option<u32>,
    len: usize,
}

impl<K: Ord, V> Default for RbTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V> RbTree<K, V> {
    /// Create an empty tree
    pub const fn new() -> Self {
        Self {
            links: Vec::new(),
            entries: Vec::new(),
            generations: Vec::new(),
            free: Vec::new(),
            root: None,
            len: 0,
        }
    }

    /// Create an empty tree with room for `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            links: Vec::with_capacity(capacity),
            entries: Vec::with_capacity(capacity),
            generations: Vec::with_capacity(capacity),
            free: Vec::new(),
            root: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // ========================================================================
    // Slot access
    // ========================================================================

    fn link(&self, index: u32) -> &Links {
        &self.links[index as usize]
    }

    fn link_mut(&mut self, index: u32) -> &mut Links {
        &mut self.links[index as usize]
    }

    fn key(&self, index: u32) -> Option<&K> {
        self.entries[index as usize].as_ref().map(|(key, _)| key)
    }

    fn resolve(&self, handle: RbHandle) -> Option<u32> {
        let index = handle.index as usize;
        match (self.entries.get(index), self.generations.get(index)) {
            (Some(Some(_)), Some(&generation)) if generation == handle.generation => {
                Some(handle.index)
            }
            _ => None,
        }
    }

    fn handle_of(&self, index: u32) -> RbHandle {
        RbHandle {
            index,
            generation: self.generations[index as usize],
        }
    }

    fn parent(&self, index: u32) -> Option<u32> {
        self.link(index).parent
    }

    fn left(&self, index: u32) -> Option<u32> {
        self.link(index).left
    }

    fn right(&self, index: u32) -> Option<u32> {
        self.link(index).right
    }

    fn is_red(&self, index: Option<u32>) -> bool {
        index.is_some_and(|i| self.link(i).color == Color::Red)
    }

    fn is_black(&self, index: Option<u32>) -> bool {
        !self.is_red(index)
    }

    fn set_color(&mut self, index: Option<u32>, color: Color) {
        if let Some(i) = index {
            self.link_mut(i).color = color;
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Whether `handle` refers to a live entry
    pub fn contains(&self, handle: RbHandle) -> bool {
        self.resolve(handle).is_some()
    }

    /// Key and value of an entry
    pub fn get(&self, handle: RbHandle) -> Option<(&K, &V)> {
        let index = self.resolve(handle)?;
        let (key, value) = self.entries[index as usize].as_ref()?;
        Some((key, value))
    }

    /// Mutable value of an entry; the key is fixed
    pub fn value_mut(&mut self, handle: RbHandle) -> Option<&mut V> {
        let index = self.resolve(handle)?;
        self.entries[index as usize]
            .as_mut()
            .map(|(_, value)| value)
    }

    fn minimum_from(&self, mut index: u32) -> u32 {
        while let Some(left) = self.left(index) {
            index = left;
        }
        index
    }

    fn maximum_from(&self, mut index: u32) -> u32 {
        while let Some(right) = self.right(index) {
            index = right;
        }
        index
    }

    /// Leftmost entry
    pub fn min(&self) -> Option<RbHandle> {
        self.root.map(|r| self.handle_of(self.minimum_from(r)))
    }

    /// Rightmost entry
    pub fn max(&self) -> Option<RbHandle> {
        self.root.map(|r| self.handle_of(self.maximum_from(r)))
    }

    fn successor(&self, index: u32) -> Option<u32> {
        if let Some(right) = self.right(index) {
            return Some(self.minimum_from(right));
        }
        let mut child = index;
        let mut parent = self.parent(index);
        while let Some(p) = parent {
            if self.right(p) != Some(child) {
                break;
            }
            child = p;
            parent = self.parent(p);
        }
        parent
    }

    /// In-order successor of an entry
    pub fn next(&self, handle: RbHandle) -> Option<RbHandle> {
        let index = self.resolve(handle)?;
        self.successor(index).map(|i| self.handle_of(i))
    }

    /// In-order iteration
    pub fn iter(&self) -> RbIter<'_, K, V> {
        RbIter {
            tree: self,
            cursor: self.root.map(|r| self.minimum_from(r)),
        }
    }

    // ========================================================================
    // Insert
    // ========================================================================

    fn allocate(&mut self, entry: (K, V), links: Links) -> u32 {
        match self.free.pop() {
            Some(index) => {
                self.entries[index as usize] = Some(entry);
                self.links[index as usize] = links;
                index
            }
            None => {
                self.entries.push(Some(entry));
                self.links.push(links);
                self.generations.push(0);
                (self.entries.len() - 1) as u32
            }
        }
    }

    /// Insert an entry and return its handle
    pub fn insert(&mut self, key: K, value: V) -> RbHandle {
        let mut parent = None;
        let mut go_left = false;
        let mut cursor = self.root;
        while let Some(c) = cursor {
            parent = Some(c);
            go_left = self.key(c).is_some_and(|existing| key < *existing);
            cursor = if go_left { self.left(c) } else { self.right(c) };
        }

        let links = Links {
            parent,
            left: None,
            right: None,
            color: Color::Red,
        };
        let index = self.allocate((key, value), links);
        match parent {
            None => self.root = Some(index),
            Some(p) if go_left => self.link_mut(p).left = Some(index),
            Some(p) => self.link_mut(p).right = Some(index),
        }
        self.len += 1;
        self.insert_fixup(index);
        self.handle_of(index)
    }

    fn rotate_left(&mut self, x: u32) {
        let Some(y) = self.right(x) else { return };
        let y_left = self.left(y);
        self.link_mut(x).right = y_left;
        if let Some(yl) = y_left {
            self.link_mut(yl).parent = Some(x);
        }
        let x_parent = self.parent(x);
        self.link_mut(y).parent = x_parent;
        match x_parent {
            None => self.root = Some(y),
            Some(p) if self.left(p) == Some(x) => self.link_mut(p).left = Some(y),
            Some(p) => self.link_mut(p).right = Some(y),
        }
        self.link_mut(y).left = Some(x);
        self.link_mut(x).parent = Some(y);
    }

    fn rotate_right(&mut self, x: u32) {
        let Some(y) = self.left(x) else { return };
        let y_right = self.right(y);
        self.link_mut(x).left = y_right;
        if let Some(yr) = y_right {
            self.link_mut(yr).parent = Some(x);
        }
        let x_parent = self.parent(x);
        self.link_mut(y).parent = x_parent;
        match x_parent {
            None => self.root = Some(y),
            Some(p) if self.right(p) == Some(x) => self.link_mut(p).right = Some(y),
            Some(p) => self.link_mut(p).left = Some(y),
        }
        self.link_mut(y).right = Some(x);
        self.link_mut(x).parent = Some(y);
    }

    fn insert_fixup(&mut self, mut z: u32) {
        loop {
            let Some(p) = self.parent(z) else { break };
            if self.is_black(Some(p)) {
                break;
            }
            // A red parent is never the root, so the grandparent exists.
            let Some(g) = self.parent(p) else { break };
            if self.left(g) == Some(p) {
                let uncle = self.right(g);
                if self.is_red(uncle) {
                    self.set_color(Some(p), Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(Some(g), Color::Red);
                    z = g;
                } else {
                    if self.right(p) == Some(z) {
                        z = p;
                        self.rotate_left(z);
                    }
                    let Some(p) = self.parent(z) else { break };
                    let Some(g) = self.parent(p) else { break };
                    self.set_color(Some(p), Color::Black);
                    self.set_color(Some(g), Color::Red);
                    self.rotate_right(g);
                }
            } else {
                let uncle = self.left(g);
                if self.is_red(uncle) {
                    self.set_color(Some(p), Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(Some(g), Color::Red);
                    z = g;
                } else {
                    if self.left(p) == Some(z) {
                        z = p;
                        self.rotate_right(z);
                    }
                    let Some(p) = self.parent(z) else { break };
                    let Some(g) = self.parent(p) else { break };
                    self.set_color(Some(p), Color::Black);
                    self.set_color(Some(g), Color::Red);
                    self.rotate_left(g);
                }
            }
        }
        let root = self.root;
        self.set_color(root, Color::Black);
    }

    // ========================================================================
    // Remove
    // ========================================================================

    fn transplant(&mut self, u: u32, v: Option<u32>) {
        let u_parent = self.parent(u);
        match u_parent {
            None => self.root = v,
            Some(p) if self.left(p) == Some(u) => self.link_mut(p).left = v,
            Some(p) => self.link_mut(p).right = v,
        }
        if let Some(v) = v {
            self.link_mut(v).parent = u_parent;
        }
    }

    /// Remove an entry; `None` if the handle is stale
    pub fn remove(&mut self, handle: RbHandle) -> Option<(K, V)> {
        let z = self.resolve(handle)?;

        let (x, x_parent, removed_color) = match (self.left(z), self.right(z)) {
            (None, x) | (x, None) => {
                let x_parent = self.parent(z);
                let removed_color = self.link(z).color;
                self.transplant(z, x);
                (x, x_parent, removed_color)
            }
            (Some(zl), Some(zr)) => {
                let y = self.minimum_from(zr);
                let removed_color = self.link(y).color;
                let x = self.right(y);
                let x_parent = if self.parent(y) == Some(z) {
                    Some(y)
                } else {
                    let y_parent = self.parent(y);
                    self.transplant(y, x);
                    self.link_mut(y).right = Some(zr);
                    self.link_mut(zr).parent = Some(y);
                    y_parent
                };
                self.transplant(z, Some(y));
                self.link_mut(y).left = Some(zl);
                self.link_mut(zl).parent = Some(y);
                let z_color = self.link(z).color;
                self.link_mut(y).color = z_color;
                (x, x_parent, removed_color)
            }
        };

        if removed_color == Color::Black {
            self.remove_fixup(x, x_parent);
        }

        self.len -= 1;
        let generation = &mut self.generations[z as usize];
        *generation = generation.wrapping_add(1);
        self.free.push(z);
        self.entries[z as usize].take()
    }

    fn remove_fixup(&mut self, mut x: Option<u32>, mut x_parent: Option<u32>) {
        while x != self.root && self.is_black(x) {
            let Some(p) = x_parent else { break };
            if self.left(p) == x {
                let mut w = self.right(p);
                if self.is_red(w) {
                    self.set_color(w, Color::Black);
                    self.set_color(Some(p), Color::Red);
                    self.rotate_left(p);
                    w = self.right(p);
                }
                let Some(wi) = w else { break };
                if self.is_black(self.left(wi)) && self.is_black(self.right(wi)) {
                    self.set_color(w, Color::Red);
                    x = Some(p);
                    x_parent = self.parent(p);
                } else {
                    if self.is_black(self.right(wi)) {
                        self.set_color(self.left(wi), Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_right(wi);
                        w = self.right(p);
                    }
                    let Some(wi) = w else { break };
                    let parent_color = self.link(p).color;
                    self.set_color(w, parent_color);
                    self.set_color(Some(p), Color::Black);
                    self.set_color(self.right(wi), Color::Black);
                    self.rotate_left(p);
                    x = self.root;
                    x_parent = None;
                }
            } else {
                let mut w = self.left(p);
                if self.is_red(w) {
                    self.set_color(w, Color::Black);
                    self.set_color(Some(p), Color::Red);
                    self.rotate_right(p);
                    w = self.left(p);
                }
                let Some(wi) = w else { break };
                if self.is_black(self.left(wi)) && self.is_black(self.right(wi)) {
                    self.set_color(w, Color::Red);
                    x = Some(p);
                    x_parent = self.parent(p);
                } else {
                    if self.is_black(self.left(wi)) {
                        self.set_color(self.right(wi), Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_left(wi);
                        w = self.left(p);
                    }
                    let Some(wi) = w else { break };
                    let parent_color = self.link(p).color;
                    self.set_color(w, parent_color);
                    self.set_color(Some(p), Color::Black);
                    self.set_color(self.left(wi), Color::Black);
                    self.rotate_right(p);
                    x = self.root;
                    x_parent = None;
                }
            }
        }
        self.set_color(x, Color::Black);
    }

    /// Remove and return the leftmost entry
    pub fn pop_min(&mut self) -> Option<(K, V)> {
        let min = self.min()?;
        self.remove(min)
    }

    /// Check red-black invariants; returns the black height
    #[cfg(test)]
    pub(crate) fn validate(&self) -> usize {
        fn walk<K: Ord, V>(tree: &RbTree<K, V>, node: Option<u32>, parent: Option<u32>) -> usize {
            let Some(n) = node else { return 1 };
            assert_eq!(tree.parent(n), parent, "broken parent link");
            if tree.is_red(node) {
                assert!(tree.is_black(tree.left(n)), "red node with red child");
                assert!(tree.is_black(tree.right(n)), "red node with red child");
            }
            if let Some(l) = tree.left(n) {
                assert!(tree.key(l) <= tree.key(n), "left key out of order");
            }
            if let Some(r) = tree.right(n) {
                assert!(tree.key(r) >= tree.key(n), "right key out of order");
            }
            let left = walk(tree, tree.left(n), Some(n));
            let right = walk(tree, tree.right(n), Some(n));
            assert_eq!(left, right, "unequal black height");
            left + usize::from(tree.is_black(node))
        }
        assert!(self.is_black(self.root), "red root");
        walk(self, self.root, None)
    }
}

/// In-order iterator yielding handle, key and value
pub struct RbIter<'a, K: Ord, V> {
    tree: &'a RbTree<K, V>,
    cursor: Option<u32>,
}

impl<'a, K: Ord, V> Iterator for RbIter<'a, K, V> {
    type Item = (RbHandle, &'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        self.cursor = self.tree.successor(index);
        let (key, value) = self.tree.entries[index as usize].as_ref()?;
        Some((self.tree.handle_of(index), key, value))
    }
}
