//! Define the types used for keys, values, labels and digests.

use crate::constant::{AD_DIGEST_LENGTH, DIGEST_LENGTH};
use derive_more::{Deref, DerefMut};
use serde::{Deserialize, Serialize};

/// A cryptographic label: the hash of a node together with its subtree.
pub type Label = [u8; DIGEST_LENGTH];

/// Balance of an internal node: height(right) − height(left), in {−1, 0, +1}.
pub type Balance = i8;

/// Height of the tree root, serialized as the last byte of a digest.
pub type NodeHeight = usize;

/// A dictionary key: a fixed-length opaque byte string. The length is
/// configured per tree (`key_length`) and checked on every operation.
/// Ordering is unsigned lexicographic, most significant byte first.
#[derive(Clone, Debug, Deref, DerefMut, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AdKey(pub Box<[u8]>);

impl AdKey {
    /// Whether every byte is `0x00`, i.e. the key is at or below the
    /// reserved *NegativeInfinity* sentinel.
    #[inline]
    pub fn is_negative_infinity(&self) -> bool {
        self.iter().all(|&b| b == 0x00)
    }

    /// Whether every byte is `0xFF`, i.e. the key is at or above the
    /// reserved *PositiveInfinity* sentinel.
    #[inline]
    pub fn is_positive_infinity(&self) -> bool {
        self.iter().all(|&b| b == 0xFF)
    }
}

impl From<Vec<u8>> for AdKey {
    #[inline]
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into_boxed_slice())
    }
}

impl From<&[u8]> for AdKey {
    #[inline]
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}

/// A dictionary value: a fixed-length opaque byte string. The length is
/// configured per tree (`value_length`). Values are opaque to the tree;
/// only update functions interpret them.
#[derive(Clone, Debug, Deref, DerefMut, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AdValue(pub Box<[u8]>);

impl AdValue {
    /// The all-zero value of the given length, carried by the initial leaf.
    #[inline]
    pub fn zero(value_length: usize) -> Self {
        Self(vec![0u8; value_length].into_boxed_slice())
    }
}

impl From<Vec<u8>> for AdValue {
    #[inline]
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into_boxed_slice())
    }
}

impl From<&[u8]> for AdValue {
    #[inline]
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}

impl From<i64> for AdValue {
    /// Encodes a signed 64-bit counter value big-endian, the interpretation
    /// used by [`Modification::UpdateLongBy`](crate::Modification).
    #[inline]
    fn from(v: i64) -> Self {
        Self(v.to_be_bytes().to_vec().into_boxed_slice())
    }
}

/// The constant-size commitment held by a verifier: the root label followed
/// by one byte carrying the root height as an unsigned integer. A reader
/// that interprets the height byte as signed must add 256 to negative
/// values.
#[derive(Clone, Copy, Debug, Deref, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdDigest(#[serde(with = "serde_arrays")] pub [u8; AD_DIGEST_LENGTH]);

impl AdDigest {
    /// Assembles a digest from a root label and the root height.
    ///
    /// Heights are bounded by the AVL property long before 255, so the
    /// truncation to one byte is lossless in any reachable tree.
    #[inline]
    pub fn new(label: &Label, height: NodeHeight) -> Self {
        let mut bytes = [0u8; AD_DIGEST_LENGTH];
        bytes[..DIGEST_LENGTH].copy_from_slice(label);
        bytes[DIGEST_LENGTH] = height as u8;
        Self(bytes)
    }

    /// The root label part of the digest.
    #[inline]
    pub fn label(&self) -> Label {
        let mut label = [0u8; DIGEST_LENGTH];
        label.copy_from_slice(&self.0[..DIGEST_LENGTH]);
        label
    }

    /// The root height encoded in the last byte.
    #[inline]
    pub fn height(&self) -> NodeHeight {
        self.0[AD_DIGEST_LENGTH - 1] as NodeHeight
    }
}

impl TryFrom<&[u8]> for AdDigest {
    type Error = &'static str;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; AD_DIGEST_LENGTH] = bytes
            .try_into()
            .map_err(|_| "digest must be exactly label length + 1 bytes")?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ordering_is_unsigned_lexicographic() {
        let a = AdKey::from(vec![0x00, 0xFF]);
        let b = AdKey::from(vec![0x01, 0x00]);
        let c = AdKey::from(vec![0x80, 0x00]);
        assert!(a < b);
        assert!(b < c);
        assert!(AdKey::from(vec![0x00, 0x00]).is_negative_infinity());
        assert!(AdKey::from(vec![0xFF, 0xFF]).is_positive_infinity());
        assert!(!a.is_negative_infinity());
        assert!(!a.is_positive_infinity());
    }

    #[test]
    fn digest_round_trips_label_and_height() {
        let label = [7u8; DIGEST_LENGTH];
        let digest = AdDigest::new(&label, 42);
        assert_eq!(digest.label(), label);
        assert_eq!(digest.height(), 42);

        let parsed = AdDigest::try_from(digest.0.as_slice()).unwrap();
        assert_eq!(parsed, digest);
        assert!(AdDigest::try_from([0u8; 5].as_slice()).is_err());
    }

    /// A height byte above 127 must read back as an unsigned value.
    #[test]
    fn height_byte_is_unsigned() {
        let digest = AdDigest::new(&[0u8; DIGEST_LENGTH], 200);
        assert_eq!(digest.height(), 200);
    }

    #[test]
    fn counter_values_encode_big_endian() {
        let v = AdValue::from(1i64);
        assert_eq!(&v[..], &[0, 0, 0, 0, 0, 0, 0, 1]);
        let v = AdValue::from(-1i64);
        assert_eq!(&v[..], &[0xFF; 8]);
    }
}
