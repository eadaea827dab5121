//! Key slices for Masstree navigation.
//!
//! Keys are divided into 8-byte slices. Layer `k` of the tree is indexed
//! by the `k`-th slice; when keys share slices `0..k`, a border-page slot
//! becomes a pointer to the layer-`k` root. Slices are stored as
//! big-endian `u64` values so that standard integer comparison is
//! equivalent to lexicographic byte comparison.

use std::cmp::Ordering;

/// An 8-byte key slice in big-endian integer form.
pub type KeySlice = u64;

/// Size of a key slice in bytes.
pub const SLICE_SIZE: usize = 8;

/// Maximum supported key length in bytes (31 layers * 8 bytes).
///
/// Keys longer than this are rejected to prevent unbounded trie layer
/// recursion. The bound also keeps every per-layer remaining length
/// below the `0xFF` slot value reserved for next-layer pointers.
pub const MAX_KEY_LENGTH: usize = 248;

/// The smallest key slice; low fence of a layer root.
pub const INFIMUM_SLICE: KeySlice = 0;

/// The largest key slice; paired with the high-fence-supremum flag this
/// marks the upper sentinel of a layer root.
pub const SUPREMUM_SLICE: KeySlice = KeySlice::MAX;

/// Extract the slice for `layer` from a key.
///
/// Pads with zeros when fewer than 8 bytes remain. Returns 0 when the
/// layer starts at or past the end of the key.
#[inline]
#[must_use]
pub fn slice_layer(key: &[u8], layer: usize) -> KeySlice {
    read_slice(key, layer * SLICE_SIZE)
}

/// Read an 8-byte slice from `data` at the given byte offset.
///
/// Pads with zeros if fewer than 8 bytes remain.
#[inline]
#[must_use]
pub fn read_slice(data: &[u8], offset: usize) -> KeySlice {
    if let Some(remaining) = data.get(offset..) {
        if let Some(bytes) = remaining.first_chunk::<SLICE_SIZE>() {
            return KeySlice::from_be_bytes(*bytes);
        }
        if !remaining.is_empty() {
            return read_slice_slow(remaining);
        }
    }
    0
}

/// Slow path for a partial (1-7 byte) trailing slice.
#[cold]
#[inline]
#[must_use]
fn read_slice_slow(remaining: &[u8]) -> KeySlice {
    let mut bytes: [u8; SLICE_SIZE] = [0u8; SLICE_SIZE];
    bytes[..remaining.len()].copy_from_slice(remaining);
    KeySlice::from_be_bytes(bytes)
}

/// Key bytes remaining at and after `layer`.
///
/// This is the length the layer's border page stores in its slot: the
/// slice bytes plus the suffix.
#[inline]
#[must_use]
pub const fn remaining_length(key_length: usize, layer: usize) -> usize {
    key_length.saturating_sub(layer * SLICE_SIZE)
}

/// The suffix of a key at `layer`: the bytes after the layer's slice.
///
/// Empty when the key ends within the slice.
#[inline]
#[must_use]
pub fn key_suffix(key: &[u8], layer: usize) -> &[u8] {
    let start = (layer + 1) * SLICE_SIZE;
    key.get(start..).unwrap_or(&[])
}

/// Normalize a `u64` into a key slice preserving integer order.
///
/// An 8-byte normalized key is exactly one slice, so normalized
/// operations never descend past the first layer.
#[inline]
#[must_use]
pub const fn normalize_u64(value: u64) -> KeySlice {
    value
}

/// The big-endian byte representation of a normalized key, for redo logs
/// and key reconstruction.
#[inline]
#[must_use]
pub const fn slice_to_bytes(slice: KeySlice) -> [u8; SLICE_SIZE] {
    slice.to_be_bytes()
}

/// Compare a search key against a stored slot at one layer.
///
/// `stored_remaining` is the slot's remaining key length; values greater
/// than [`SLICE_SIZE`] mean the slot carries a suffix (or points to a
/// next layer). Equal slices with both sides longer than a slice compare
/// `Equal` here; the suffix comparison happens at the border page.
#[must_use]
pub fn compare_slices(
    slice: KeySlice,
    remaining: usize,
    stored_slice: KeySlice,
    stored_remaining: usize,
) -> Ordering {
    match slice.cmp(&stored_slice) {
        Ordering::Equal => {}
        ord => return ord,
    }
    if remaining > SLICE_SIZE {
        if stored_remaining <= SLICE_SIZE {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    } else {
        remaining.cmp(&stored_remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_extraction() {
        let key = b"hello world!";
        assert_eq!(slice_layer(key, 0), u64::from_be_bytes(*b"hello wo"));
        let expected = u64::from_be_bytes([b'r', b'l', b'd', b'!', 0, 0, 0, 0]);
        assert_eq!(slice_layer(key, 1), expected);
    }

    #[test]
    fn test_short_key_padding() {
        let key = b"hi";
        let expected = u64::from_be_bytes([b'h', b'i', 0, 0, 0, 0, 0, 0]);
        assert_eq!(slice_layer(key, 0), expected);
    }

    #[test]
    fn test_slice_past_end() {
        let key = b"12345678";
        assert_eq!(slice_layer(key, 1), 0);
        assert_eq!(slice_layer(b"", 0), 0);
    }

    #[test]
    fn test_remaining_length() {
        assert_eq!(remaining_length(12, 0), 12);
        assert_eq!(remaining_length(12, 1), 4);
        assert_eq!(remaining_length(12, 2), 0);
    }

    #[test]
    fn test_suffix() {
        let key = b"0123456789ABCDEF0123"; // 20 bytes
        assert_eq!(key_suffix(key, 0), b"89ABCDEF0123");
        assert_eq!(key_suffix(key, 1), b"0123");
        assert_eq!(key_suffix(key, 2), b"");
    }

    #[test]
    fn test_lexicographic_ordering() {
        assert!(slice_layer(b"aaa", 0) < slice_layer(b"aab", 0));
        assert!(slice_layer(b"aab", 0) < slice_layer(b"baa", 0));
    }

    #[test]
    fn test_normalized_ordering() {
        // Normalized keys compare as integers.
        assert!(normalize_u64(12345) < normalize_u64(12346));
        assert_eq!(
            read_slice(&slice_to_bytes(normalize_u64(12345)), 0),
            12345u64
        );
    }

    #[test]
    fn test_compare_equal_lengths() {
        let slice = slice_layer(b"hello", 0);
        assert_eq!(compare_slices(slice, 5, slice, 5), Ordering::Equal);
        assert_eq!(compare_slices(slice, 5, slice, 3), Ordering::Greater);
        assert_eq!(compare_slices(slice, 5, slice, 7), Ordering::Less);
    }

    #[test]
    fn test_compare_with_suffix() {
        let slice = slice_layer(b"hello wo", 0);
        // Search key has a suffix, stored key does not: search is greater.
        assert_eq!(compare_slices(slice, 12, slice, 8), Ordering::Greater);
        // Both carry suffixes: equal at this layer, suffix decides later.
        assert_eq!(compare_slices(slice, 12, slice, 10), Ordering::Equal);
    }
}
