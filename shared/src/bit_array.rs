use alloc::{boxed::Box, vec};

const WORD_BITS: usize = u64::BITS as usize;

/// A fixed-length bitmap, used for slot allocation.
#[derive(Clone, Debug)]
pub struct BitArray {
    words: Box<[u64]>,
    len: usize,
}

impl BitArray {
    /// A bitmap of `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)].into_boxed_slice(),
            len,
        }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bit {idx} out of range ({})", self.len);
        self.words[idx / WORD_BITS] >> (idx % WORD_BITS) & 1 != 0
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bit {idx} out of range ({})", self.len);
        let mask = 1 << (idx % WORD_BITS);
        if value {
            self.words[idx / WORD_BITS] |= mask;
        } else {
            self.words[idx / WORD_BITS] &= !mask;
        }
    }

    /// Index of the lowest clear bit.
    pub fn first_clear(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(i, word)| i * WORD_BITS + word.trailing_ones() as usize)
            .filter(|idx| *idx < self.len)
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear() {
        let mut bits = BitArray::new(70);
        assert_eq!(bits.first_clear(), Some(0));
        bits.set(0, true);
        bits.set(65, true);
        assert!(bits.get(0));
        assert!(bits.get(65));
        assert!(!bits.get(64));
        assert_eq!(bits.count_ones(), 2);
        bits.set(0, false);
        assert_eq!(bits.first_clear(), Some(0));
        assert_eq!(bits.count_ones(), 1);
    }

    #[test]
    fn full_bitmap_has_no_clear_bit() {
        let mut bits = BitArray::new(3);
        for i in 0..3 {
            assert_eq!(bits.first_clear(), Some(i));
            bits.set(i, true);
        }
        assert_eq!(bits.first_clear(), None);
    }

    #[test]
    fn skips_full_words() {
        let mut bits = BitArray::new(130);
        for i in 0..64 {
            bits.set(i, true);
        }
        bits.set(64, true);
        assert_eq!(bits.first_clear(), Some(65));
    }
}
