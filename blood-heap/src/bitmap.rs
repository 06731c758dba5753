//! Word-granular bitmaps.
//!
//! One bit per word of a region. Bits are stored in atomics so that the
//! profiler can extend a permanent region's header map while other threads
//! read it; the collector and the code allocator set and clear bits under
//! their own locks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{MemError, MemResult};

const BITS: usize = u64::BITS as usize;

/// A fixed-size bitmap.
pub struct Bitmap {
    words: Box<[AtomicU64]>,
    bits: usize,
}

impl Bitmap {
    /// Create a cleared bitmap of `bits` bits.
    ///
    /// Fails rather than aborting if the storage cannot be allocated.
    pub fn new(bits: usize) -> MemResult<Self> {
        let len = bits.div_ceil(BITS);
        let mut words = Vec::new();
        words
            .try_reserve_exact(len)
            .map_err(|_| MemError::OutOfMemory { what: "bitmap" })?;
        words.extend((0..len).map(|_| AtomicU64::new(0)));
        Ok(Self { words: words.into_boxed_slice(), bits })
    }

    /// Number of bits.
    pub fn len(&self) -> usize {
        self.bits
    }

    /// Whether the bitmap has no bits.
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Set bit `n`.
    pub fn set(&self, n: usize) {
        debug_assert!(n < self.bits);
        self.words[n / BITS].fetch_or(1 << (n % BITS), Ordering::Release);
    }

    /// Clear bit `n`.
    pub fn clear(&self, n: usize) {
        debug_assert!(n < self.bits);
        self.words[n / BITS].fetch_and(!(1 << (n % BITS)), Ordering::Release);
    }

    /// Test bit `n`.
    pub fn test(&self, n: usize) -> bool {
        n < self.bits && self.words[n / BITS].load(Ordering::Acquire) & (1 << (n % BITS)) != 0
    }

    /// Clear `count` bits starting at `start`.
    pub fn clear_range(&self, start: usize, count: usize) {
        let end = (start + count).min(self.bits);
        let mut n = start;
        while n < end {
            if n % BITS == 0 && end - n >= BITS {
                self.words[n / BITS].store(0, Ordering::Release);
                n += BITS;
            } else {
                self.clear(n);
                n += 1;
            }
        }
    }

    /// Clear every bit.
    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }

    /// Index of the highest set bit at or below `n`, or 0 if there is none.
    pub fn find_last_set(&self, n: usize) -> usize {
        if self.bits == 0 {
            return 0;
        }
        let n = n.min(self.bits - 1);
        let mut index = n / BITS;
        // Keep bits 0..=n of the first word examined.
        let mut mask = u64::MAX >> (BITS - 1 - n % BITS);
        loop {
            let word = self.words[index].load(Ordering::Acquire) & mask;
            if word != 0 {
                return index * BITS + (BITS - 1 - word.leading_zeros() as usize);
            }
            if index == 0 {
                return 0;
            }
            index -= 1;
            mask = u64::MAX;
        }
    }

    /// Number of set bits.
    pub fn count_set(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("bits", &self.bits)
            .field("set", &self.count_set())
            .finish()
    }
}
