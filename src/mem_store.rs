//! In-memory storage backend for prover trees.
//!
//! This module provides [`MemStore`], a simple in-memory implementation of
//! the [`VersionedStorage`] trait. Node records are keyed by their label,
//! so identical subtrees shared across versions are stored once, and a
//! version is nothing but a digest remembering its root label and height.
//!
//! # Note
//!
//! `MemStore` is a storage backend, not part of the authenticated
//! structure: the prover and verifier never depend on it. It is primarily
//! intended for unit and integration testing, development, and as a
//! reference implementation of the storage trait. Records of retired
//! versions are not garbage collected; a database-backed implementation
//! should take care of that.

use crate::{
    constant::{INTERNAL_PREFIX, LEAF_PREFIX},
    node::{InternalProverNode, ProverLeaf, ProverNode},
    proof::BatchAvlProver,
    traits::VersionedStorage,
    types::{AdDigest, AdKey, AdValue, Balance, Label, NodeHeight},
};
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// In-memory versioned node store.
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    key_length: usize,
    value_length: usize,
    /// Serialized node records keyed by node label.
    nodes: FxHashMap<Label, Vec<u8>>,
    /// Stored versions in creation order; the last entry is current.
    versions: Vec<AdDigest>,
}

impl MemStore {
    /// Creates an empty store for trees of the given key and value lengths.
    pub fn new(key_length: usize, value_length: usize) -> Self {
        Self {
            key_length,
            value_length,
            nodes: FxHashMap::default(),
            versions: Vec::new(),
        }
    }

    /// All stored versions, oldest first.
    pub fn versions(&self) -> &[AdDigest] {
        &self.versions
    }

    /// Number of node records currently held.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Walks the new nodes of a subtree and stores their records. Nodes
    /// that predate the current batch were flushed with an earlier version
    /// and are skipped together with their descendants.
    fn store_subtree(&mut self, node: &Rc<ProverNode>) {
        if !node.is_new() {
            return;
        }
        match node.as_ref() {
            ProverNode::Leaf(leaf) => {
                self.nodes.insert(node.label(), Self::encode_leaf(leaf));
            }
            ProverNode::Internal(internal) => {
                self.store_subtree(&internal.left);
                self.store_subtree(&internal.right);
                self.nodes
                    .insert(node.label(), Self::encode_internal(internal));
            }
        }
    }

    fn encode_leaf(leaf: &ProverLeaf) -> Vec<u8> {
        let mut record =
            Vec::with_capacity(1 + leaf.key.len() + leaf.value.len() + leaf.next_leaf_key.len());
        record.push(LEAF_PREFIX);
        record.extend_from_slice(&leaf.key);
        record.extend_from_slice(&leaf.value);
        record.extend_from_slice(&leaf.next_leaf_key);
        record
    }

    fn encode_internal(node: &InternalProverNode) -> Vec<u8> {
        let mut record = Vec::with_capacity(2 + node.key.len() + 64);
        record.push(INTERNAL_PREFIX);
        record.push(node.balance as u8);
        record.extend_from_slice(&node.key);
        record.extend_from_slice(&node.left.label());
        record.extend_from_slice(&node.right.label());
        record
    }

    /// Rebuilds the subtree rooted at `label` from stored records. The
    /// reconstructed nodes are not new (they are already durable) and carry
    /// their label pre-seeded.
    fn fetch_subtree(&self, label: &Label) -> Result<Rc<ProverNode>, &'static str> {
        let record = self.nodes.get(label).ok_or("missing node record")?;
        let (kind, body) = record.split_first().ok_or("empty node record")?;
        match *kind {
            LEAF_PREFIX => {
                if body.len() != 2 * self.key_length + self.value_length {
                    return Err("leaf record length mismatch");
                }
                let (key, rest) = body.split_at(self.key_length);
                let (value, next_leaf_key) = rest.split_at(self.value_length);
                let leaf = ProverLeaf::new(
                    AdKey::from(key),
                    AdValue::from(value),
                    AdKey::from(next_leaf_key),
                );
                leaf.is_new.set(false);
                leaf.label.set(Some(*label));
                Ok(Rc::new(ProverNode::Leaf(leaf)))
            }
            INTERNAL_PREFIX => {
                if body.len() != 1 + self.key_length + 64 {
                    return Err("internal record length mismatch");
                }
                let (balance, rest) = body.split_first().ok_or("empty internal record")?;
                let balance = *balance as Balance;
                if balance.abs() > 1 {
                    return Err("internal record balance out of range");
                }
                let (key, rest) = rest.split_at(self.key_length);
                let (left_label, right_label) = rest.split_at(32);
                let mut child_label: Label = [0u8; 32];
                child_label.copy_from_slice(left_label);
                let left = self.fetch_subtree(&child_label)?;
                child_label.copy_from_slice(right_label);
                let right = self.fetch_subtree(&child_label)?;
                let node = InternalProverNode::new(AdKey::from(key), left, right, balance);
                node.is_new.set(false);
                node.label.set(Some(*label));
                Ok(Rc::new(ProverNode::Internal(node)))
            }
            _ => Err("unknown node record kind"),
        }
    }
}

impl VersionedStorage for MemStore {
    type Error = &'static str;

    fn update(&mut self, prover: &BatchAvlProver) -> Result<(), Self::Error> {
        if prover.key_length() != self.key_length || prover.value_length() != self.value_length {
            return Err("store and prover disagree on key or value length");
        }
        self.store_subtree(prover.root());
        let digest = prover.digest();
        if self.versions.last() != Some(&digest) {
            self.versions.push(digest);
        }
        Ok(())
    }

    fn rollback(
        &mut self,
        version: &AdDigest,
    ) -> Result<(Rc<ProverNode>, NodeHeight), Self::Error> {
        let position = self
            .versions
            .iter()
            .position(|v| v == version)
            .ok_or("unknown version")?;
        let root = self.fetch_subtree(&version.label())?;
        self.versions.truncate(position + 1);
        Ok((root, version.height()))
    }

    fn version(&self) -> Option<AdDigest> {
        self.versions.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constant::{DEFAULT_KEY_LENGTH, DEFAULT_VALUE_LENGTH},
        operation::Modification,
    };

    const KL: usize = DEFAULT_KEY_LENGTH;
    const VL: usize = DEFAULT_VALUE_LENGTH;

    fn insert(b: u8) -> Modification {
        let mut key = vec![0u8; KL];
        key[0] = b;
        Modification::Insert {
            key: AdKey::from(key),
            value: AdValue::from(vec![b; VL]),
        }
    }

    /// A stored tree must round-trip: flushing and re-fetching by digest
    /// reproduces the same root label and height.
    #[test]
    fn update_then_rollback_round_trips() {
        let mut store = MemStore::new(KL, VL);
        let mut prover = BatchAvlProver::new(KL, VL);
        for b in 1..=20 {
            prover.perform_one_modification(&insert(b)).unwrap();
        }
        let digest = prover.digest();
        store.update(&prover).unwrap();
        assert!(store.non_empty());
        assert_eq!(store.version(), Some(digest));

        let (root, height) = store.rollback(&digest).unwrap();
        let restored = BatchAvlProver::with_root(KL, VL, root, height);
        assert_eq!(restored.digest(), digest);
        restored.check_tree(false);
        // restored nodes are durable, not part of a running batch
        restored.check_tree(true);
    }

    /// Rolling back to an earlier version drops the later ones.
    #[test]
    fn rollback_truncates_later_versions() {
        let mut store = MemStore::new(KL, VL);
        let mut prover = BatchAvlProver::new(KL, VL);

        prover.perform_one_modification(&insert(1)).unwrap();
        let v1 = prover.digest();
        store.update(&prover).unwrap();
        prover.generate_proof();

        prover.perform_one_modification(&insert(2)).unwrap();
        let v2 = prover.digest();
        store.update(&prover).unwrap();
        prover.generate_proof();

        assert_eq!(store.versions(), &[v1, v2]);
        store.rollback(&v1).unwrap();
        assert_eq!(store.versions(), &[v1]);
        assert_eq!(store.version(), Some(v1));

        assert!(store.rollback(&v2).is_err());
    }

    /// Incremental flushes only write the nodes the batch created.
    #[test]
    fn incremental_flush_reuses_old_records() {
        let mut store = MemStore::new(KL, VL);
        let mut prover = BatchAvlProver::new(KL, VL);
        for b in 1..=10 {
            prover.perform_one_modification(&insert(b)).unwrap();
        }
        store.update(&prover).unwrap();
        prover.generate_proof();
        let full_count = store.node_count();

        // one more insert touches only a spine of the tree
        prover.perform_one_modification(&insert(11)).unwrap();
        store.update(&prover).unwrap();
        let grown = store.node_count() - full_count;
        assert!(grown > 0);
        assert!(
            grown <= 2 * (prover.height() + 1),
            "flush wrote {grown} records for a single insert"
        );

        let digest = prover.digest();
        let (root, height) = store.rollback(&digest).unwrap();
        assert_eq!(
            BatchAvlProver::with_root(KL, VL, root, height).digest(),
            digest
        );
    }

    #[test]
    fn mismatched_configuration_is_rejected() {
        let mut store = MemStore::new(KL, VL);
        let prover = BatchAvlProver::new(KL / 2, VL);
        assert!(store.update(&prover).is_err());
    }
}
