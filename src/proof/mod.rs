//! Proof machinery: wire-format plumbing shared by both sides, the prover
//! and the verifier.
//!
//! A serialized proof is `skeleton ‖ EndOfTree ‖ direction bits`. The
//! skeleton is a post-order token stream over the subtree touched by the
//! batch (see `constant.rs` for the token bytes); the direction bits record,
//! one bit per internal node visited, whether the descent went left
//! (1 = left, 0 = right, LSB-first within each byte, zero-padded to a byte
//! boundary).

use crate::operation::OperationError;
use derive_more::Deref;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod prover;
pub mod verifier;

pub use prover::BatchAvlProver;
pub use verifier::BatchAvlVerifier;

/// Error type for prover-side modifications.
///
/// A failed modification leaves the tree, the recorded direction stream and
/// all node flags byte-identical to the pre-call state; the batch may
/// continue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProverError {
    /// The operation key does not have the configured key length.
    #[error("key is {got} bytes, the tree is configured for {expected}")]
    KeyLength { got: usize, expected: usize },

    /// The written value does not have the configured value length.
    #[error("value is {got} bytes, the tree is configured for {expected}")]
    ValueLength { got: usize, expected: usize },

    /// The operation key is one of the reserved infinity sentinels.
    #[error("the reserved infinity keys cannot be used")]
    ReservedKey,

    /// The update function rejected the modification.
    #[error(transparent)]
    Operation(#[from] OperationError),
}

/// Error type for verifier-side construction and replay.
///
/// Replay errors are sticky: after the first failure every subsequent call
/// fails with [`VerifierError::AlreadyFailed`] and `digest()` stays `None`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifierError {
    /// The skeleton could not be parsed into a single well-formed tree.
    #[error("malformed proof: {0}")]
    ProofMalformed(&'static str),

    /// The skeleton holds more nodes than the declared envelope admits.
    #[error("proof conveys {nodes} nodes, the envelope admits {max}")]
    ProofTooLong { nodes: usize, max: usize },

    /// The reconstructed root label differs from the starting digest.
    #[error("reconstructed root label does not match the starting digest")]
    DigestMismatch,

    /// The proof does not convey the structure a replayed modification
    /// needs (wrong leaf band, or an opaque subtree where the replay must
    /// descend).
    #[error("proof does not convey the required structure: {0}")]
    ModificationInapplicable(&'static str),

    /// More modifications were replayed than the envelope declared, or the
    /// batch ended with recorded descents never replayed.
    #[error("replayed batch does not match the declared envelope: {0}")]
    EnvelopeMismatch(&'static str),

    /// The operation key does not have the configured key length.
    #[error("key is {got} bytes, the tree is configured for {expected}")]
    KeyLength { got: usize, expected: usize },

    /// The written value does not have the configured value length.
    #[error("value is {got} bytes, the tree is configured for {expected}")]
    ValueLength { got: usize, expected: usize },

    /// The operation key is one of the reserved infinity sentinels.
    #[error("the reserved infinity keys cannot be used")]
    ReservedKey,

    /// The update function rejected the modification.
    #[error(transparent)]
    Operation(#[from] OperationError),

    /// An earlier call in this batch already failed.
    #[error("verifier failed earlier in this batch")]
    AlreadyFailed,
}

/// A serialized batch proof, owned by the caller. The prover never hands
/// out its internal buffers.
#[derive(Clone, Debug, Deref, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedProof(pub Vec<u8>);

impl From<Vec<u8>> for SerializedProof {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Result of one recursive modification step over either side's tree.
pub(crate) struct ModifyStep<N> {
    /// Root of the (possibly rebuilt) subtree.
    pub(crate) node: std::rc::Rc<N>,
    /// Whether anything at or below this subtree changed.
    pub(crate) changed: bool,
    /// Whether the subtree grew by one level.
    pub(crate) height_increased: bool,
    /// Whether the located leaf must be detached in a second pass.
    pub(crate) to_delete: bool,
    /// Value stored under the operation key before the modification.
    pub(crate) old_value: Option<crate::types::AdValue>,
}

/// Reads one direction bit at an absolute bit index of a proof byte string.
/// Returns `None` past the end. Bit set means the descent went left.
#[inline]
pub(crate) fn proof_direction_is_left(proof: &[u8], bit_index: usize) -> Option<bool> {
    let byte = proof.get(bit_index >> 3)?;
    Some(byte & (1 << (bit_index & 7)) != 0)
}

/// Append-only direction bit recorder used by the prover.
///
/// Bits are packed LSB-first. A failed modification truncates back to the
/// bit length saved at its start, so the buffer only ever holds descents of
/// successful modifications.
#[derive(Debug, Default)]
pub(crate) struct DirectionBits {
    bytes: Vec<u8>,
    bit_length: usize,
}

impl DirectionBits {
    pub(crate) fn push(&mut self, is_left: bool) {
        if self.bit_length & 7 == 0 {
            self.bytes.push(0);
        }
        if is_left {
            self.bytes[self.bit_length >> 3] |= 1 << (self.bit_length & 7);
        }
        self.bit_length += 1;
    }

    /// Whether the bit at `index` recorded a left turn.
    pub(crate) fn is_left(&self, index: usize) -> bool {
        debug_assert!(index < self.bit_length);
        self.bytes[index >> 3] & (1 << (index & 7)) != 0
    }

    pub(crate) fn bit_length(&self) -> usize {
        self.bit_length
    }

    /// Drops every bit recorded at or after `bit_length`, clearing the
    /// partial trailing byte so later pushes find zeroed padding.
    pub(crate) fn truncate(&mut self, bit_length: usize) {
        debug_assert!(bit_length <= self.bit_length);
        self.bytes.truncate(bit_length.div_ceil(8));
        if bit_length & 7 != 0 {
            let keep = (1u16 << (bit_length & 7)) as u8 - 1;
            if let Some(last) = self.bytes.last_mut() {
                *last &= keep;
            }
        }
        self.bit_length = bit_length;
    }

    /// The packed bytes, zero-padded to the byte boundary.
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn clear(&mut self) {
        self.bytes.clear();
        self.bit_length = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_pack_lsb_first() {
        let mut bits = DirectionBits::default();
        // left, right, right, left -> 0b...1001
        bits.push(true);
        bits.push(false);
        bits.push(false);
        bits.push(true);
        assert_eq!(bits.as_bytes(), &[0b0000_1001]);
        assert_eq!(bits.bit_length(), 4);
        assert!(bits.is_left(0));
        assert!(!bits.is_left(1));
        assert!(!bits.is_left(2));
        assert!(bits.is_left(3));

        for i in 0..9 {
            bits.push(i % 2 == 0);
        }
        assert_eq!(bits.bit_length(), 13);
        assert_eq!(bits.as_bytes().len(), 2);
    }

    #[test]
    fn truncate_zeroes_the_partial_byte() {
        let mut bits = DirectionBits::default();
        for _ in 0..6 {
            bits.push(true);
        }
        bits.truncate(3);
        assert_eq!(bits.bit_length(), 3);
        assert_eq!(bits.as_bytes(), &[0b0000_0111]);

        // A fresh push lands on the cleared position.
        bits.push(false);
        bits.push(true);
        assert_eq!(bits.as_bytes(), &[0b0001_0111]);

        bits.truncate(0);
        assert_eq!(bits.as_bytes(), &[] as &[u8]);
    }

    #[test]
    fn absolute_reader_matches_writer() {
        let mut bits = DirectionBits::default();
        let pattern = [true, false, true, true, false, false, true, false, true];
        for &b in &pattern {
            bits.push(b);
        }
        for (i, &b) in pattern.iter().enumerate() {
            assert_eq!(proof_direction_is_left(bits.as_bytes(), i), Some(b));
        }
        assert_eq!(proof_direction_is_left(bits.as_bytes(), 16), None);
    }
}
