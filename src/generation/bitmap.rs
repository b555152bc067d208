//! Fixed-capacity atomic bitmap, used for the shadowed-entity set

use std::sync::atomic::{AtomicU64, Ordering};

/// A bitmap writers mark concurrently and readers probe without locking.
/// Bits outside the capacity read as unset.
pub struct Bitmap {
    words: Vec<AtomicU64>,
    bits: usize,
}

impl Bitmap {
    pub fn new(bits: usize) -> Self {
        let words = (bits + 63) / 64;
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            bits,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bits
    }

    pub fn set(&self, bit: u32) {
        let bit = bit as usize;
        if bit < self.bits {
            self.words[bit / 64].fetch_or(1 << (bit % 64), Ordering::AcqRel);
        }
    }

    pub fn get(&self, bit: u32) -> bool {
        let bit = bit as usize;
        bit < self.bits && self.words[bit / 64].load(Ordering::Acquire) & (1 << (bit % 64)) != 0
    }

    pub fn any(&self) -> bool {
        self.words.iter().any(|w| w.load(Ordering::Acquire) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let bitmap = Bitmap::new(130);
        assert!(!bitmap.any());

        bitmap.set(0);
        bitmap.set(63);
        bitmap.set(64);
        bitmap.set(129);

        assert!(bitmap.get(0));
        assert!(bitmap.get(63));
        assert!(bitmap.get(64));
        assert!(bitmap.get(129));
        assert!(!bitmap.get(1));
        assert!(bitmap.any());
    }

    #[test]
    fn test_out_of_range() {
        let bitmap = Bitmap::new(8);
        bitmap.set(1000);
        assert!(!bitmap.get(1000));
        assert!(!bitmap.get(u32::MAX));
        assert!(!bitmap.any());
    }
}
