//! Modifications and the update-function seam shared by prover and verifier.
//!
//! Both sides run the same descent algorithm against an [`Operation`]: a key
//! plus a deterministic update function evaluated at the leaf covering that
//! key. Determinism is part of the contract — the verifier replays the very
//! same operation against the partial tree reconstructed from a proof, and
//! any divergence between the two evaluations breaks digest agreement.

use crate::types::{AdKey, AdValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of an update function against the current state of a key.
///
/// These are per-call failures: the tree (and, on the prover, the recorded
/// proof stream) is left exactly as it was before the failing call.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OperationError {
    /// Insert of a key that is already present.
    #[error("cannot insert: the key is already present")]
    DuplicateKey,

    /// Update or remove of a key that is not present.
    #[error("cannot modify: the key is not present")]
    MissingKey,

    /// Counter arithmetic left the signed 64-bit range.
    #[error("counter arithmetic overflow")]
    ArithmeticOverflow,

    /// A negative delta applied to a key that is not present.
    #[error("cannot decrement a missing counter")]
    DecrementMissing,

    /// The stored value is not a well-formed big-endian signed 64-bit
    /// counter (wrong length for the configured tree).
    #[error("value is not an 8-byte counter")]
    NotACounter,

    /// The update function produced the delete sentinel for an absent key.
    #[error("update function deleted an absent key")]
    DeleteOfAbsent,
}

/// What an update function decided at the target leaf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Keep the current state: a pure lookup, or a silently skipped removal.
    Unchanged,
    /// Write this value: an in-place update if the key existed, an
    /// insertion otherwise.
    Write(AdValue),
    /// Delete the key. Only valid when the key existed.
    Delete,
}

/// A keyed operation replayable by both prover and verifier.
///
/// `update` must be a pure function of its argument: the prover evaluates it
/// against the live tree, the verifier against the proof-reconstructed
/// partial tree, and both must reach the same outcome.
pub trait Operation {
    /// The key this operation descends to.
    fn key(&self) -> &AdKey;

    /// Evaluates the update function at the target leaf. `old` is the
    /// current value when the key is present, `None` otherwise.
    fn update(&self, old: Option<&AdValue>) -> Result<UpdateOutcome, OperationError>;
}

/// The built-in modification family.
///
/// Semantics per variant, with `f` the update function of the [`Operation`]
/// implementation:
///
/// | Variant | `f(None)` | `f(Some(old))` |
/// |---|---|---|
/// | `Lookup` | unchanged | unchanged |
/// | `Insert(v)` | write `v` | error: duplicate |
/// | `Update(v)` | error: missing | write `v` |
/// | `InsertOrUpdate(v)` | write `v` | write `v` |
/// | `Remove` | error: missing | delete |
/// | `RemoveIfExists` | unchanged | delete |
/// | `UpdateLongBy(δ)` | write `δ` if `δ ≥ 0`, else error | write `old + δ` unless it overflows |
///
/// `UpdateLongBy` interprets values as big-endian signed 64-bit integers and
/// therefore requires trees configured with 8-byte values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modification {
    /// Authenticated read: no state change, but the descent is recorded in
    /// the proof so the verifier can re-derive the read value.
    Lookup { key: AdKey },
    /// Insert a fresh key; fails on a duplicate.
    Insert { key: AdKey, value: AdValue },
    /// Overwrite an existing key; fails when absent.
    Update { key: AdKey, value: AdValue },
    /// Insert or overwrite unconditionally.
    InsertOrUpdate { key: AdKey, value: AdValue },
    /// Remove an existing key; fails when absent.
    Remove { key: AdKey },
    /// Remove a key if present; silently succeeds when absent.
    RemoveIfExists { key: AdKey },
    /// Add `delta` to a big-endian signed 64-bit counter value.
    UpdateLongBy { key: AdKey, delta: i64 },
}

impl Modification {
    fn decode_counter(value: &AdValue) -> Result<i64, OperationError> {
        let bytes: [u8; 8] = value[..].try_into().map_err(|_| OperationError::NotACounter)?;
        Ok(i64::from_be_bytes(bytes))
    }
}

impl Operation for Modification {
    fn key(&self) -> &AdKey {
        match self {
            Modification::Lookup { key }
            | Modification::Insert { key, .. }
            | Modification::Update { key, .. }
            | Modification::InsertOrUpdate { key, .. }
            | Modification::Remove { key }
            | Modification::RemoveIfExists { key }
            | Modification::UpdateLongBy { key, .. } => key,
        }
    }

    fn update(&self, old: Option<&AdValue>) -> Result<UpdateOutcome, OperationError> {
        match (self, old) {
            (Modification::Lookup { .. }, _) => Ok(UpdateOutcome::Unchanged),

            (Modification::Insert { .. }, Some(_)) => Err(OperationError::DuplicateKey),
            (Modification::Insert { value, .. }, None) => Ok(UpdateOutcome::Write(value.clone())),

            (Modification::Update { .. }, None) => Err(OperationError::MissingKey),
            (Modification::Update { value, .. }, Some(_)) => {
                Ok(UpdateOutcome::Write(value.clone()))
            }

            (Modification::InsertOrUpdate { value, .. }, _) => {
                Ok(UpdateOutcome::Write(value.clone()))
            }

            (Modification::Remove { .. }, None) => Err(OperationError::MissingKey),
            (Modification::Remove { .. }, Some(_)) => Ok(UpdateOutcome::Delete),

            (Modification::RemoveIfExists { .. }, None) => Ok(UpdateOutcome::Unchanged),
            (Modification::RemoveIfExists { .. }, Some(_)) => Ok(UpdateOutcome::Delete),

            (Modification::UpdateLongBy { delta, .. }, None) => {
                if *delta >= 0 {
                    Ok(UpdateOutcome::Write(AdValue::from(*delta)))
                } else {
                    Err(OperationError::DecrementMissing)
                }
            }
            (Modification::UpdateLongBy { delta, .. }, Some(old)) => {
                let current = Self::decode_counter(old)?;
                let next = current
                    .checked_add(*delta)
                    .ok_or(OperationError::ArithmeticOverflow)?;
                Ok(UpdateOutcome::Write(AdValue::from(next)))
            }
        }
    }
}
