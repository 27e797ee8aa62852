//! Two-level priority bitmap
//!
//! One bit per priority level, grouped into 64-bit minor words; a major
//! word records which minor words are non-empty. Finding the highest
//! (numerically lowest) set priority takes two `trailing_zeros` operations
//! regardless of how many levels are configured.
//!
//! ```text
//! major:  ...0101     minor[0]: bit p set <=> level p has ready threads
//!            ||       minor[2]: levels 128..191
//!            |+-- minor[0] non-empty
//!            +--- minor[2] non-empty
//! ```

/// Bits per bitmap word
pub const BITMAP_WORD_BITS: usize = 64;

/// Maximum number of priority levels
pub const BITMAP_MAX_LEVELS: usize = BITMAP_WORD_BITS * BITMAP_WORD_BITS;

/// Priority bitmap with a fixed number of levels
#[derive(Debug, Clone)]
pub struct PriorityBitmap {
    major: u64,
    minor: [u64; BITMAP_WORD_BITS],
    levels: usize,
}

impl PriorityBitmap {
    /// Create an empty bitmap for priorities `0..levels`
    pub const fn new(levels: usize) -> Self {
        assert!(levels > 0 && levels <= BITMAP_MAX_LEVELS);
        Self {
            major: 0,
            minor: [0; BITMAP_WORD_BITS],
            levels,
        }
    }

    /// Number of priority levels
    pub fn levels(&self) -> usize {
        self.levels
    }

    #[inline]
    fn split(&self, priority: usize) -> (usize, u64) {
        assert!(
            priority < self.levels,
            "priority {} out of range (levels {})",
            priority,
            self.levels
        );
        (
            priority / BITMAP_WORD_BITS,
            1u64 << (priority % BITMAP_WORD_BITS),
        )
    }

    /// Mark a priority level non-empty
    pub fn set(&mut self, priority: usize) {
        let (major, bit) = self.split(priority);
        self.minor[major] |= bit;
        self.major |= 1u64 << major;
    }

    /// Mark a priority level empty
    pub fn clear(&mut self, priority: usize) {
        let (major, bit) = self.split(priority);
        self.minor[major] &= !bit;
        if self.minor[major] == 0 {
            self.major &= !(1u64 << major);
        }
    }

    pub fn is_set(&self, priority: usize) -> bool {
        let (major, bit) = self.split(priority);
        self.minor[major] & bit != 0
    }

    pub fn is_empty(&self) -> bool {
        self.major == 0
    }

    /// Highest set priority (numerically lowest)
    pub fn get_highest(&self) -> Option<usize> {
        if self.major == 0 {
            return None;
        }
        let major = self.major.trailing_zeros() as usize;
        let minor = self.minor[major].trailing_zeros() as usize;
        Some(major * BITMAP_WORD_BITS + minor)
    }

    /// Set priorities in ascending numeric order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let mut major = self.major;
        let mut current = 0u64;
        let mut base = 0usize;
        core::iter::from_fn(move || loop {
            if current != 0 {
                let bit = current.trailing_zeros() as usize;
                current &= current - 1;
                return Some(base + bit);
            }
            if major == 0 {
                return None;
            }
            let word = major.trailing_zeros() as usize;
            major &= major - 1;
            current = self.minor[word];
            base = word * BITMAP_WORD_BITS;
        })
    }
}
