//! Word-packed free/used bitmap.
//!
//! Backs both the write-buffer stripe pool and the segment allocator. Not
//! synchronised: the allocation context keeps it under the array lock.

const WORD_BITS: u32 = u64::BITS;

#[derive(Debug, Clone)]
pub struct Bitmap {
    words: Vec<u64>,
    num_bits: u32,
    num_set: u32,
}

impl Bitmap {
    pub fn new(num_bits: u32) -> Self {
        let words = num_bits.div_ceil(WORD_BITS) as usize;
        Self {
            words: vec![0; words],
            num_bits,
            num_set: 0,
        }
    }

    pub fn num_bits(&self) -> u32 {
        self.num_bits
    }

    pub fn num_set(&self) -> u32 {
        self.num_set
    }

    pub fn num_clear(&self) -> u32 {
        self.num_bits - self.num_set
    }

    pub fn is_full(&self) -> bool {
        self.num_set == self.num_bits
    }

    pub fn is_set(&self, bit: u32) -> bool {
        if bit >= self.num_bits {
            return false;
        }
        self.words[(bit / WORD_BITS) as usize] & (1 << (bit % WORD_BITS)) != 0
    }

    /// Set `bit`. Returns false if it was already set or out of range.
    pub fn set(&mut self, bit: u32) -> bool {
        if bit >= self.num_bits || self.is_set(bit) {
            return false;
        }
        self.words[(bit / WORD_BITS) as usize] |= 1 << (bit % WORD_BITS);
        self.num_set += 1;
        true
    }

    /// Clear `bit`. Returns false if it was already clear or out of range.
    pub fn clear(&mut self, bit: u32) -> bool {
        if !self.is_set(bit) {
            return false;
        }
        self.words[(bit / WORD_BITS) as usize] &= !(1 << (bit % WORD_BITS));
        self.num_set -= 1;
        true
    }

    /// Find the first clear bit at or after `hint`, wrapping around once.
    pub fn find_first_clear_from(&self, hint: u32) -> Option<u32> {
        if self.is_full() {
            return None;
        }
        let hint = if hint >= self.num_bits { 0 } else { hint };
        self.scan_clear(hint, self.num_bits)
            .or_else(|| self.scan_clear(0, hint))
    }

    /// Set and return the first clear bit at or after `hint`.
    pub fn set_first_clear_from(&mut self, hint: u32) -> Option<u32> {
        let bit = self.find_first_clear_from(hint)?;
        self.set(bit);
        Some(bit)
    }

    /// Iterate every set bit in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(move |(i, &word)| {
            let base = i as u32 * WORD_BITS;
            let mut w = word;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let tz = w.trailing_zeros();
                w &= w - 1;
                Some(base + tz)
            })
        })
    }

    fn scan_clear(&self, from: u32, to: u32) -> Option<u32> {
        let mut bit = from;
        while bit < to {
            let word_idx = (bit / WORD_BITS) as usize;
            let shift = bit % WORD_BITS;
            // Treat bits below `shift` as used.
            let free = !self.words[word_idx] & (u64::MAX << shift);
            if free != 0 {
                let found = word_idx as u32 * WORD_BITS + free.trailing_zeros();
                return if found < to { Some(found) } else { None };
            }
            bit = (word_idx as u32 + 1) * WORD_BITS;
        }
        None
    }
}
