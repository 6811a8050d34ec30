//! Define the trait for persisting prover trees as rollback-able versions.

use crate::{
    node::ProverNode,
    proof::BatchAvlProver,
    types::{AdDigest, NodeHeight},
};
use std::{fmt::Debug, rc::Rc};

/// A versioned snapshot store for prover trees.
///
/// One version is durable per successful proof generation: the persistent
/// prover flushes the batch's new nodes here immediately before the proof
/// is serialized, labelled by the post-batch digest. Implementations are
/// expected to serialize their own writers; this crate never shares a
/// store across threads.
pub trait VersionedStorage {
    /// Implementation-specific error type.
    type Error: Debug + Send;

    /// Snapshots every node reachable from the prover's current root that
    /// is marked new, and records the prover's digest as the latest
    /// version. Flushing the same version twice is a no-op.
    fn update(&mut self, prover: &BatchAvlProver) -> Result<(), Self::Error>;

    /// Restores the tree as of `version` and drops every later version.
    /// Returns the reconstructed root and its height.
    fn rollback(&mut self, version: &AdDigest)
        -> Result<(Rc<ProverNode>, NodeHeight), Self::Error>;

    /// The digest of the latest stored version, if any.
    fn version(&self) -> Option<AdDigest>;

    /// Whether any snapshot exists.
    fn non_empty(&self) -> bool {
        self.version().is_some()
    }
}
