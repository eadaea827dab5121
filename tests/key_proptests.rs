//! Property tests for key slicing.

use proptest::prelude::*;

use ironwood::key::{
    key_suffix, read_slice, remaining_length, slice_layer, slice_to_bytes, SLICE_SIZE,
};

proptest! {
    /// Slice comparison of full 8-byte chunks equals lexicographic byte
    /// comparison.
    #[test]
    fn slice_order_matches_byte_order(a in any::<[u8; 8]>(), b in any::<[u8; 8]>()) {
        let slice_a = read_slice(&a, 0);
        let slice_b = read_slice(&b, 0);
        prop_assert_eq!(slice_a.cmp(&slice_b), a.cmp(&b));
    }

    /// Round trip: a slice re-encodes to the bytes it was read from.
    #[test]
    fn slice_byte_round_trip(bytes in any::<[u8; 8]>()) {
        prop_assert_eq!(slice_to_bytes(read_slice(&bytes, 0)), bytes);
    }

    /// Every layer's slice is the big-endian reading of that layer's
    /// zero-padded 8-byte chunk.
    #[test]
    fn layer_slices_cover_key(key in proptest::collection::vec(any::<u8>(), 0..64)) {
        let layers = key.len().div_ceil(SLICE_SIZE).max(1);
        for layer in 0..layers {
            let mut chunk = [0u8; SLICE_SIZE];
            let start = layer * SLICE_SIZE;
            if start < key.len() {
                let end = (start + SLICE_SIZE).min(key.len());
                chunk[..end - start].copy_from_slice(&key[start..end]);
            }
            prop_assert_eq!(slice_layer(&key, layer), u64::from_be_bytes(chunk));
        }
    }

    /// Remaining length plus consumed slices reconstructs the key length,
    /// and the suffix is exactly the bytes past the layer's slice.
    #[test]
    fn suffix_consistent_with_remaining(key in proptest::collection::vec(any::<u8>(), 0..64), layer in 0usize..8) {
        let remaining = remaining_length(key.len(), layer);
        prop_assert_eq!(remaining, key.len().saturating_sub(layer * SLICE_SIZE));
        let suffix = key_suffix(&key, layer);
        if remaining > SLICE_SIZE {
            prop_assert_eq!(suffix.len(), remaining - SLICE_SIZE);
            prop_assert_eq!(suffix, &key[(layer + 1) * SLICE_SIZE..]);
        } else {
            prop_assert!(suffix.is_empty());
        }
    }
}
