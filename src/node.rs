//! Node variants for the prover tree and the verifier's partial tree.
//!
//! Prover nodes carry the search key on internal nodes plus two bookkeeping
//! flags: `is_new` marks nodes created in the current batch (they are the
//! ones a versioned store must flush), `visited` marks nodes the current
//! batch touched (they form the proof skeleton; everything else is conveyed
//! as a bare label). Labels are computed lazily and cached per node.
//!
//! Verifier internal nodes carry no key — the direction stream replaces key
//! comparisons — and untouched subtrees exist only as [`VerifierNode::LabelOnly`].
//!
//! Nodes are immutable once built; a modification rebuilds the touched spine
//! and shares every untouched subtree, which keeps the pre-batch tree alive
//! for proof generation at no extra cost.

use crate::{
    hasher,
    types::{AdKey, AdValue, Balance, Label},
};
use std::{cell::Cell, rc::Rc};

/// A node of the prover's live tree.
#[derive(Debug)]
pub enum ProverNode {
    /// A key-bearing leaf of the sorted leaf chain.
    Leaf(ProverLeaf),
    /// An internal AVL node; `key` equals the smallest key of its right
    /// subtree.
    Internal(InternalProverNode),
}

/// Leaf of the prover tree: `(key, value, next_leaf_key)`.
#[derive(Debug)]
pub struct ProverLeaf {
    pub(crate) key: AdKey,
    pub(crate) value: AdValue,
    pub(crate) next_leaf_key: AdKey,
    pub(crate) label: Cell<Option<Label>>,
    pub(crate) is_new: Cell<bool>,
    pub(crate) visited: Cell<bool>,
}

/// Internal node of the prover tree.
#[derive(Debug)]
pub struct InternalProverNode {
    pub(crate) key: AdKey,
    pub(crate) left: Rc<ProverNode>,
    pub(crate) right: Rc<ProverNode>,
    pub(crate) balance: Balance,
    pub(crate) label: Cell<Option<Label>>,
    pub(crate) is_new: Cell<bool>,
    pub(crate) visited: Cell<bool>,
}

impl ProverLeaf {
    /// Creates a leaf marked as new (created in the current batch).
    pub(crate) fn new(key: AdKey, value: AdValue, next_leaf_key: AdKey) -> Self {
        Self {
            key,
            value,
            next_leaf_key,
            label: Cell::new(None),
            is_new: Cell::new(true),
            visited: Cell::new(false),
        }
    }

    /// The cached label, computed on first use.
    pub fn label(&self) -> Label {
        if let Some(label) = self.label.get() {
            return label;
        }
        let label = hasher::leaf_label(&self.key, &self.value, &self.next_leaf_key);
        self.label.set(Some(label));
        label
    }

    /// The leaf's key.
    pub fn key(&self) -> &AdKey {
        &self.key
    }

    /// The leaf's value.
    pub fn value(&self) -> &AdValue {
        &self.value
    }

    /// The key of the next leaf in the sorted chain.
    pub fn next_leaf_key(&self) -> &AdKey {
        &self.next_leaf_key
    }
}

impl InternalProverNode {
    /// Creates an internal node marked as new (created in the current batch).
    pub(crate) fn new(
        key: AdKey,
        left: Rc<ProverNode>,
        right: Rc<ProverNode>,
        balance: Balance,
    ) -> Self {
        Self {
            key,
            left,
            right,
            balance,
            label: Cell::new(None),
            is_new: Cell::new(true),
            visited: Cell::new(false),
        }
    }

    /// The cached label, computed on first use from the child labels.
    pub fn label(&self) -> Label {
        if let Some(label) = self.label.get() {
            return label;
        }
        let label = hasher::internal_label(self.balance, &self.left.label(), &self.right.label());
        self.label.set(Some(label));
        label
    }

    /// The smallest key of the right subtree.
    pub fn key(&self) -> &AdKey {
        &self.key
    }

    /// The left child.
    pub fn left(&self) -> &Rc<ProverNode> {
        &self.left
    }

    /// The right child.
    pub fn right(&self) -> &Rc<ProverNode> {
        &self.right
    }

    /// height(right) − height(left), in {−1, 0, +1}.
    pub fn balance(&self) -> Balance {
        self.balance
    }
}

impl ProverNode {
    /// The node's label, computed lazily.
    pub fn label(&self) -> Label {
        match self {
            ProverNode::Leaf(leaf) => leaf.label(),
            ProverNode::Internal(node) => node.label(),
        }
    }

    pub(crate) fn visited(&self) -> bool {
        match self {
            ProverNode::Leaf(leaf) => leaf.visited.get(),
            ProverNode::Internal(node) => node.visited.get(),
        }
    }

    pub(crate) fn mark_visited(&self) {
        match self {
            ProverNode::Leaf(leaf) => leaf.visited.set(true),
            ProverNode::Internal(node) => node.visited.set(true),
        }
    }

    pub(crate) fn clear_visited(&self) {
        match self {
            ProverNode::Leaf(leaf) => leaf.visited.set(false),
            ProverNode::Internal(node) => node.visited.set(false),
        }
    }

    /// Whether this node was created in the current batch, i.e. is not yet
    /// covered by any stored version.
    pub fn is_new(&self) -> bool {
        match self {
            ProverNode::Leaf(leaf) => leaf.is_new.get(),
            ProverNode::Internal(node) => node.is_new.get(),
        }
    }

    pub(crate) fn clear_new(&self) {
        match self {
            ProverNode::Leaf(leaf) => leaf.is_new.set(false),
            ProverNode::Internal(node) => node.is_new.set(false),
        }
    }

    /// The node as a leaf, when it is one.
    pub fn as_leaf(&self) -> Option<&ProverLeaf> {
        match self {
            ProverNode::Leaf(leaf) => Some(leaf),
            ProverNode::Internal(_) => None,
        }
    }

    /// The node as an internal node, when it is one.
    pub fn as_internal(&self) -> Option<&InternalProverNode> {
        match self {
            ProverNode::Internal(node) => Some(node),
            ProverNode::Leaf(_) => None,
        }
    }
}

/// A node of the verifier's partial tree, reconstructed from a proof.
#[derive(Debug)]
pub(crate) enum VerifierNode {
    /// An untouched subtree, known only by its label.
    LabelOnly(Label),
    /// A reconstructed leaf.
    Leaf(VerifierLeaf),
    /// A reconstructed internal node. Unlike the prover's, it carries no
    /// key: the direction stream stands in for key comparisons.
    Internal(InternalVerifierNode),
}

#[derive(Debug)]
pub(crate) struct VerifierLeaf {
    pub(crate) key: AdKey,
    pub(crate) value: AdValue,
    pub(crate) next_leaf_key: AdKey,
    pub(crate) label: Cell<Option<Label>>,
}

#[derive(Debug)]
pub(crate) struct InternalVerifierNode {
    pub(crate) left: Rc<VerifierNode>,
    pub(crate) right: Rc<VerifierNode>,
    pub(crate) balance: Balance,
    pub(crate) label: Cell<Option<Label>>,
}

impl VerifierLeaf {
    pub(crate) fn new(key: AdKey, value: AdValue, next_leaf_key: AdKey) -> Self {
        Self {
            key,
            value,
            next_leaf_key,
            label: Cell::new(None),
        }
    }

    pub(crate) fn label(&self) -> Label {
        if let Some(label) = self.label.get() {
            return label;
        }
        let label = hasher::leaf_label(&self.key, &self.value, &self.next_leaf_key);
        self.label.set(Some(label));
        label
    }
}

impl InternalVerifierNode {
    pub(crate) fn new(left: Rc<VerifierNode>, right: Rc<VerifierNode>, balance: Balance) -> Self {
        Self {
            left,
            right,
            balance,
            label: Cell::new(None),
        }
    }

    pub(crate) fn label(&self) -> Label {
        if let Some(label) = self.label.get() {
            return label;
        }
        let label = hasher::internal_label(self.balance, &self.left.label(), &self.right.label());
        self.label.set(Some(label));
        label
    }
}

impl VerifierNode {
    pub(crate) fn label(&self) -> Label {
        match self {
            VerifierNode::LabelOnly(label) => *label,
            VerifierNode::Leaf(leaf) => leaf.label(),
            VerifierNode::Internal(node) => node.label(),
        }
    }

    pub(crate) fn as_leaf(&self) -> Option<&VerifierLeaf> {
        match self {
            VerifierNode::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> AdKey {
        AdKey::from(vec![b; 4])
    }

    fn value(b: u8) -> AdValue {
        AdValue::from(vec![b; 2])
    }

    /// Prover and verifier leaves with the same content must agree on the
    /// label, and so must internal nodes built over them.
    #[test]
    fn prover_and_verifier_labels_agree() {
        let pl = ProverLeaf::new(key(1), value(2), key(3));
        let vl = VerifierLeaf::new(key(1), value(2), key(3));
        assert_eq!(pl.label(), vl.label());

        let pl2 = ProverLeaf::new(key(3), value(4), key(0xFF));
        let vl2 = VerifierLeaf::new(key(3), value(4), key(0xFF));

        let pi = InternalProverNode::new(
            key(3),
            Rc::new(ProverNode::Leaf(pl)),
            Rc::new(ProverNode::Leaf(pl2)),
            0,
        );
        let vi = InternalVerifierNode::new(
            Rc::new(VerifierNode::Leaf(vl)),
            Rc::new(VerifierNode::Leaf(vl2)),
            0,
        );
        assert_eq!(pi.label(), vi.label());

        // A label-only stand-in is transparent to the parent label.
        let stub = VerifierNode::LabelOnly(pi.left.label());
        let vi_with_stub = InternalVerifierNode::new(
            Rc::new(stub),
            Rc::clone(&vi.right),
            0,
        );
        assert_eq!(pi.label(), vi_with_stub.label());
    }

    #[test]
    fn label_cache_is_populated_once() {
        let leaf = ProverLeaf::new(key(1), value(2), key(3));
        assert_eq!(leaf.label.get(), None);
        let first = leaf.label();
        assert_eq!(leaf.label.get(), Some(first));
        assert_eq!(leaf.label(), first);
    }
}
