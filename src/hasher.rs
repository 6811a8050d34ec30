//! Label computation for leaves and internal nodes.
//!
//! Labels are blake3 hashes with a one-byte domain prefix so that leaves
//! and internal nodes can never collide. An internal label commits to the
//! raw balance byte and both child labels; a leaf label commits to the key,
//! value and the next key of the sorted leaf chain. Changing any of these
//! preimages breaks wire compatibility.

use crate::{
    constant::{INTERNAL_PREFIX, LEAF_PREFIX},
    types::{Balance, Label},
};

/// Computes the label of a leaf: `H(0x00 ‖ key ‖ value ‖ next_leaf_key)`.
#[inline]
pub(crate) fn leaf_label(key: &[u8], value: &[u8], next_leaf_key: &[u8]) -> Label {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(key);
    hasher.update(value);
    hasher.update(next_leaf_key);
    *hasher.finalize().as_bytes()
}

/// Computes the label of an internal node:
/// `H(0x01 ‖ balance ‖ left.label ‖ right.label)`.
#[inline]
pub(crate) fn internal_label(balance: Balance, left: &Label, right: &Label) -> Label {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[INTERNAL_PREFIX]);
    hasher.update(&[balance as u8]);
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Labels are deterministic and sensitive to every preimage field,
    /// including the field boundaries (the chain key must not be able to
    /// masquerade as value bytes).
    #[test]
    fn label_commits_to_every_field() {
        let base = leaf_label(&[1u8; 4], &[2u8; 2], &[3u8; 4]);
        assert_eq!(base, leaf_label(&[1u8; 4], &[2u8; 2], &[3u8; 4]));
        assert_ne!(base, leaf_label(&[9u8; 4], &[2u8; 2], &[3u8; 4]));
        assert_ne!(base, leaf_label(&[1u8; 4], &[9u8; 2], &[3u8; 4]));
        assert_ne!(base, leaf_label(&[1u8; 4], &[2u8; 2], &[9u8; 4]));

        let internal = internal_label(-1, &base, &base);
        assert_eq!(internal, internal_label(-1, &base, &base));
        assert_ne!(internal, internal_label(-1, &base, &leaf_label(&[9u8; 4], &[2u8; 2], &[3u8; 4])));
    }

    /// Leaf and internal domains must not overlap even on identical bytes.
    #[test]
    fn domains_are_separated() {
        let payload = [0u8; 65];
        let as_leaf = leaf_label(&payload[..32], &payload[32..33], &payload[33..]);
        let mut left = [0u8; 32];
        left.copy_from_slice(&payload[..32]);
        let mut right = [0u8; 32];
        right.copy_from_slice(&payload[33..]);
        let as_internal = internal_label(payload[32] as i8, &left, &right);
        assert_ne!(as_leaf, as_internal);
    }

    #[test]
    fn balance_byte_changes_the_label() {
        let child = [9u8; 32];
        assert_ne!(
            internal_label(-1, &child, &child),
            internal_label(0, &child, &child)
        );
        assert_ne!(
            internal_label(0, &child, &child),
            internal_label(1, &child, &child)
        );
    }
}
