//! Fixed-width integer packing for section storage.
//!
//! [`PackedArray`] backs the palette indices of a native section, and
//! [`NibbleArray`] (a 4-bit [`PackedArray`]) backs the two light channels.
//! Elements never straddle a `u64` word because every supported width divides 64.

use serde::{Deserialize, Serialize};

use crate::section::SECTION_VOLUME;

/// A compact array where each element is stored using a fixed number of bits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedArray {
    /// Packed words, lowest element in the lowest bits.
    words: Vec<u64>,
    /// Bits per element (0, 2, 4, 8, or 16).
    bits: u8,
    /// Number of logical elements.
    len: usize,
}

impl PackedArray {
    /// Creates an array of `len` zeroed elements.
    ///
    /// A width of 0 stores nothing and reads back zero everywhere; palettes use
    /// it for uniform sections.
    pub fn new(bits: u8, len: usize) -> Self {
        debug_assert!(
            matches!(bits, 0 | 2 | 4 | 8 | 16),
            "unsupported element width {bits}"
        );
        let words = if bits == 0 {
            0
        } else {
            (len as u64 * u64::from(bits)).div_ceil(64) as usize
        };
        Self {
            words: vec![0; words],
            bits,
            len,
        }
    }

    /// Returns the element at `index`.
    pub fn get(&self, index: usize) -> u16 {
        debug_assert!(index < self.len, "index {index} out of bounds");
        if self.bits == 0 {
            return 0;
        }
        let (word, shift) = self.locate(index);
        ((self.words[word] >> shift) & self.mask()) as u16
    }

    /// Stores `value` at `index`. Values wider than the element width are truncated.
    pub fn set(&mut self, index: usize, value: u16) {
        debug_assert!(index < self.len, "index {index} out of bounds");
        if self.bits == 0 {
            return;
        }
        let (word, shift) = self.locate(index);
        let mask = self.mask();
        self.words[word] &= !(mask << shift);
        self.words[word] |= (u64::from(value) & mask) << shift;
    }

    /// Sets every element to `value`.
    pub fn fill(&mut self, value: u16) {
        if self.bits == 0 {
            return;
        }
        let per_word = 64 / usize::from(self.bits);
        let mut pattern = 0u64;
        for slot in 0..per_word {
            pattern |= (u64::from(value) & self.mask()) << (slot * usize::from(self.bits));
        }
        self.words.fill(pattern);
    }

    /// Returns a copy re-encoded at a different element width.
    ///
    /// Elements that do not fit the narrower width are truncated; callers only
    /// narrow after proving every element fits.
    pub fn with_width(&self, bits: u8) -> Self {
        let mut widened = Self::new(bits, self.len);
        if self.bits > 0 {
            for index in 0..self.len {
                widened.set(index, self.get(index));
            }
        }
        widened
    }

    /// Bits per element.
    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Number of logical elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the packed words in bytes.
    pub fn storage_bytes(&self) -> usize {
        self.words.len() * 8
    }

    /// Iterates over all elements in index order.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.len).map(move |index| self.get(index))
    }

    fn locate(&self, index: usize) -> (usize, u32) {
        let bit = index as u64 * u64::from(self.bits);
        ((bit / 64) as usize, (bit % 64) as u32)
    }

    fn mask(&self) -> u64 {
        (1u64 << self.bits) - 1
    }
}

/// One 4-bit light value per block of a section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NibbleArray(PackedArray);

impl NibbleArray {
    /// A section-sized array of zero light.
    pub fn new() -> Self {
        Self(PackedArray::new(4, SECTION_VOLUME))
    }

    /// Light level at `index`, in `0..=15`.
    pub fn get(&self, index: usize) -> u8 {
        self.0.get(index) as u8
    }

    /// Stores `level & 15` at `index`.
    pub fn set(&mut self, index: usize, level: u8) {
        self.0.set(index, u16::from(level & 15));
    }

    /// Sets every block to `level & 15`.
    pub fn fill(&mut self, level: u8) {
        self.0.fill(u16::from(level & 15));
    }

    /// Overwrites the whole array from dense levels, masking each to 4 bits.
    pub fn copy_from(&mut self, levels: &[u8]) {
        debug_assert_eq!(levels.len(), SECTION_VOLUME);
        for (index, &level) in levels.iter().enumerate() {
            self.set(index, level);
        }
    }

    /// Unpacks into one byte per block.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.iter().map(|level| level as u8).collect()
    }
}

impl Default for NibbleArray {
    fn default() -> Self {
        Self::new()
    }
}
