//! Prover wrapper that keeps every proved batch durable in a versioned
//! store and can roll the tree back to any stored digest.

use crate::{
    operation::Operation,
    proof::{BatchAvlProver, ProverError, SerializedProof},
    traits::VersionedStorage,
    types::{AdDigest, AdKey, AdValue, NodeHeight},
};

/// A [`BatchAvlProver`] layered over a [`VersionedStorage`].
///
/// Opening over a non-empty store restores its latest version; opening over
/// an empty store seeds it with the initial single-leaf tree, so a reopened
/// wrapper always observes the digest it last made durable. Exactly one
/// version becomes durable per successful
/// [`generate_proof_and_update_storage`](Self::generate_proof_and_update_storage):
/// the batch's nodes are flushed first, then the proof is serialized.
///
/// To abandon a half-applied batch, drop the wrapper (or call
/// [`rollback`](Self::rollback) with the last durable digest): nothing of an
/// unproved batch ever reaches the store.
#[derive(Debug)]
pub struct PersistentBatchAvlProver<S: VersionedStorage> {
    prover: BatchAvlProver,
    storage: S,
}

impl<S: VersionedStorage> PersistentBatchAvlProver<S> {
    /// Opens a persistent prover over `storage`.
    pub fn new(key_length: usize, value_length: usize, mut storage: S) -> Result<Self, S::Error> {
        let prover = match storage.version() {
            Some(version) => {
                let (root, height) = storage.rollback(&version)?;
                BatchAvlProver::with_root(key_length, value_length, root, height)
            }
            None => {
                let prover = BatchAvlProver::new(key_length, value_length);
                storage.update(&prover)?;
                prover
            }
        };
        Ok(Self { prover, storage })
    }

    /// The in-memory prover's current digest (including unproved
    /// modifications of the running batch).
    pub fn digest(&self) -> AdDigest {
        self.prover.digest()
    }

    /// Current root height.
    pub fn height(&self) -> NodeHeight {
        self.prover.height()
    }

    /// Read-only lookup against the in-memory tree.
    pub fn unauthenticated_lookup(&self, key: &AdKey) -> Option<AdValue> {
        self.prover.unauthenticated_lookup(key)
    }

    /// Applies one modification to the running batch.
    pub fn perform_one_modification<O: Operation>(
        &mut self,
        operation: &O,
    ) -> Result<Option<AdValue>, ProverError> {
        self.prover.perform_one_modification(operation)
    }

    /// Flushes the batch's nodes to the store under the post-batch digest,
    /// then serializes and returns the batch proof.
    pub fn generate_proof_and_update_storage(&mut self) -> Result<SerializedProof, S::Error> {
        self.storage.update(&self.prover)?;
        Ok(self.prover.generate_proof())
    }

    /// Restores the tree as of `version`, discarding any running batch and
    /// every later stored version.
    pub fn rollback(&mut self, version: &AdDigest) -> Result<(), S::Error> {
        let (root, height) = self.storage.rollback(version)?;
        self.prover = BatchAvlProver::with_root(
            self.prover.key_length(),
            self.prover.value_length(),
            root,
            height,
        );
        Ok(())
    }

    /// The underlying store.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// The underlying in-memory prover.
    pub fn prover(&self) -> &BatchAvlProver {
        &self.prover
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constant::{DEFAULT_KEY_LENGTH, DEFAULT_VALUE_LENGTH},
        mem_store::MemStore,
        operation::Modification,
    };

    const KL: usize = DEFAULT_KEY_LENGTH;
    const VL: usize = DEFAULT_VALUE_LENGTH;

    fn key(b: u8) -> AdKey {
        let mut bytes = vec![0u8; KL];
        bytes[0] = b;
        AdKey::from(bytes)
    }

    fn insert(b: u8) -> Modification {
        Modification::Insert {
            key: key(b),
            value: AdValue::from(vec![b; VL]),
        }
    }

    /// A fresh wrapper seeds the store, and proving makes versions durable.
    #[test]
    fn versions_accumulate_per_proof() {
        let mut prover =
            PersistentBatchAvlProver::new(KL, VL, MemStore::new(KL, VL)).unwrap();
        let genesis = prover.digest();
        assert_eq!(prover.storage().version(), Some(genesis));

        prover.perform_one_modification(&insert(1)).unwrap();
        // the running batch is not durable yet
        assert_eq!(prover.storage().version(), Some(genesis));

        prover.generate_proof_and_update_storage().unwrap();
        assert_eq!(prover.storage().version(), Some(prover.digest()));
    }

    /// Rollback restores an earlier digest and reopening the store lands on
    /// the rolled-back version.
    #[test]
    fn rollback_and_reopen() {
        let mut prover =
            PersistentBatchAvlProver::new(KL, VL, MemStore::new(KL, VL)).unwrap();

        prover.perform_one_modification(&insert(1)).unwrap();
        prover.generate_proof_and_update_storage().unwrap();
        let v1 = prover.digest();

        prover.perform_one_modification(&insert(2)).unwrap();
        prover.generate_proof_and_update_storage().unwrap();
        assert_ne!(prover.digest(), v1);

        prover.rollback(&v1).unwrap();
        assert_eq!(prover.digest(), v1);
        assert_eq!(prover.unauthenticated_lookup(&key(2)), None);
        prover.prover().check_tree(false);

        // a reopened wrapper on the same store sees the rolled-back state
        let store = prover.storage().clone();
        let reopened = PersistentBatchAvlProver::new(KL, VL, store).unwrap();
        assert_eq!(reopened.digest(), v1);
    }

    /// An abandoned batch leaves no trace after rollback to the last
    /// durable version.
    #[test]
    fn abandoned_batch_rolls_back_clean() {
        let mut prover =
            PersistentBatchAvlProver::new(KL, VL, MemStore::new(KL, VL)).unwrap();
        prover.perform_one_modification(&insert(1)).unwrap();
        prover.generate_proof_and_update_storage().unwrap();
        let durable = prover.digest();

        prover.perform_one_modification(&insert(2)).unwrap();
        prover.perform_one_modification(&insert(3)).unwrap();
        prover.rollback(&durable).unwrap();
        assert_eq!(prover.digest(), durable);
        assert_eq!(prover.unauthenticated_lookup(&key(2)), None);
        assert_eq!(prover.unauthenticated_lookup(&key(3)), None);
    }
}
