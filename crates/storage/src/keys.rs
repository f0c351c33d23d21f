//! Helper functions for key encoding/decoding used by storage implementations.

use tangle_types::Hash;

/// Round-indexed keys are big-endian so byte order matches numeric order.
pub fn round_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

/// Decode a key written by [`round_key`].
pub fn decode_round_key(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// `parent ‖ child` key for one-to-many index columns.
pub fn pair_key(parent: &Hash, child: &Hash) -> [u8; 64] {
    let mut key = [0u8; 64];
    key[..32].copy_from_slice(parent.as_bytes());
    key[32..].copy_from_slice(child.as_bytes());
    key
}

/// Child half of a [`pair_key`].
pub fn pair_child(key: &[u8]) -> Option<Hash> {
    if key.len() != 64 {
        return None;
    }
    Hash::try_from_slice(&key[32..])
}

/// Compute the exclusive end key for a prefix scan.
///
/// Returns `None` if the prefix is all `0xFF` bytes (no valid exclusive upper bound).
/// In practice this never happens with structured storage keys.
pub fn next_prefix(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    for i in (0..next.len()).rev() {
        if next[i] < 255 {
            next[i] += 1;
            next.truncate(i + 1);
            return Some(next);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_keys_sort_numerically() {
        assert!(round_key(255) < round_key(256));
        assert_eq!(decode_round_key(&round_key(77)), Some(77));
        assert_eq!(decode_round_key(&[1, 2]), None);
    }

    #[test]
    fn test_pair_key_child() {
        let parent = Hash::from_bytes(b"p");
        let child = Hash::from_bytes(b"c");
        let key = pair_key(&parent, &child);
        assert!(key.starts_with(parent.as_bytes()));
        assert_eq!(pair_child(&key), Some(child));
    }

    #[test]
    fn test_next_prefix() {
        assert_eq!(next_prefix(&[1, 2, 3]), Some(vec![1, 2, 4]));
        assert_eq!(next_prefix(&[1, 255]), Some(vec![2]));
        assert_eq!(next_prefix(&[255, 255]), None);
    }
}
