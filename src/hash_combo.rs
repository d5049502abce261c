//! Key-derived addressing: full hash, bin number, fingerprint, and tag, all derived once per
//! key via `xxh3` and threaded through every lookup so a key's hash is never recomputed twice.

use xxhash_rust::xxh3::xxh3_64;

/// Number of bits of the full hash that select the bin, fixed for the life of a storage
/// (`HashMetadata::bin_bits`).
pub const DEFAULT_BIN_BITS: u8 = 20;

/// Everything derivable from a key: the full 64-bit hash, the bin it lands in, a 16-bit
/// fingerprint for cheap in-page filtering, and an 8-bit tag for the fingerprint's low bits
/// cached in the intermediate page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashCombo {
    pub full_hash: u64,
    pub bin: u64,
    pub fingerprint: u16,
    pub tag: u8,
}

impl HashCombo {
    /// Derive a [`HashCombo`] from a raw key under the given bin-bits width.
    pub fn derive(key: &[u8], bin_bits: u8) -> Self {
        let full_hash = xxh3_64(key);
        Self::from_hash(full_hash, bin_bits)
    }

    /// Rebuild a [`HashCombo`] from an already-computed full hash (used when re-deriving the
    /// bin/fingerprint/tag after `bin_bits` changes, or in tests).
    ///
    /// `bin` is the top `bin_bits` bits of the hash; `fingerprint` is the 16 bits directly below
    /// it (falling back to the bottom 16 bits if `bin_bits` leaves fewer than 16 bits spare).
    pub fn from_hash(full_hash: u64, bin_bits: u8) -> Self {
        debug_assert!(bin_bits <= 64);
        let bin = if bin_bits == 0 {
            0
        } else {
            full_hash >> (64 - bin_bits as u32)
        };
        let fingerprint_shift = 64u32
            .saturating_sub(bin_bits as u32)
            .saturating_sub(16);
        let fingerprint = ((full_hash >> fingerprint_shift) & 0xFFFF) as u16;
        let tag = (fingerprint & 0xFF) as u8;
        HashCombo {
            full_hash,
            bin,
            fingerprint,
            tag,
        }
    }
}

/// Per-storage hash metadata: the bin-bits width and the resulting bin count, fixed at
/// `create_storage` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashMetadata {
    pub bin_bits: u8,
    pub bin_count: u64,
}

impl HashMetadata {
    pub fn new(bin_bits: u8) -> Self {
        HashMetadata {
            bin_bits,
            bin_count: 1u64 << bin_bits,
        }
    }

    pub fn default_for_capacity(expected_records: u64) -> Self {
        let mut bin_bits = 1u8;
        while (1u64 << bin_bits) < expected_records.max(1) && bin_bits < 40 {
            bin_bits += 1;
        }
        Self::new(bin_bits)
    }
}

impl Default for HashMetadata {
    fn default() -> Self {
        Self::new(DEFAULT_BIN_BITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic() {
        let a = HashCombo::derive(b"hello", 16);
        let b = HashCombo::derive(b"hello", 16);
        assert_eq!(a, b);
    }

    #[test]
    fn bin_is_masked_to_bin_bits() {
        let combo = HashCombo::derive(b"some key", 10);
        assert!(combo.bin < (1 << 10));
    }

    #[test]
    fn bin_is_the_top_bits_of_the_hash() {
        let combo = HashCombo::from_hash(0xABCD_EF01_2345_6789, 8);
        assert_eq!(combo.bin, 0xABCD_EF01_2345_6789u64 >> 56);
    }

    #[test]
    fn tag_is_low_byte_of_fingerprint() {
        let combo = HashCombo::from_hash(0xABCD_EF01_2345_6789, 8);
        assert_eq!(combo.tag, (combo.fingerprint & 0xFF) as u8);
    }

    #[test]
    fn different_keys_usually_differ() {
        let a = HashCombo::derive(b"key-one", 20);
        let b = HashCombo::derive(b"key-two", 20);
        assert_ne!(a.full_hash, b.full_hash);
    }
}
