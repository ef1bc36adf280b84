//! Utils for hash

use std::hash::Hash;

use crate::common::types::HashValue;

/// Default hash builder
pub type BuildHasherDefault = ahash::RandomState;

/// Constant build hasher default. Seeds are fixed, the same key always lands in the
/// same bucket across groupers
pub const BUILD_HASHER_DEFAULT: BuildHasherDefault = BuildHasherDefault::with_seeds(9, 7, 9, 8);

/// Mask that clears the highest bit of the [`HashValue`]
pub const HASH_MASK: HashValue = 0x7fff_ffff;

/// Hash the key with [`BUILD_HASHER_DEFAULT`] into a non-negative 31-bit value
#[inline]
pub fn hash_key<K: Hash + ?Sized>(key: &K) -> HashValue {
    (BUILD_HASHER_DEFAULT.hash_one(key) as HashValue) & HASH_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_key_is_stable_and_non_negative() {
        let keys = ["", "a", "grouper", "a much longer key than the others"];
        for key in keys {
            let hash = hash_key(key);
            assert_eq!(hash & !HASH_MASK, 0);
            assert_eq!(hash, hash_key(key));
        }
    }
}
