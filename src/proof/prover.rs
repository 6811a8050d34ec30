//! Prover side of the batched authenticated dictionary.
//!
//! [`BatchAvlProver`] owns the live AVL tree. Modifications rebuild the
//! touched spine into fresh nodes while the pre-batch root stays reachable,
//! so the two trees share every untouched subtree. `generate_proof` walks
//! the pre-batch tree: nodes the batch visited are serialized structurally,
//! everything else collapses to a bare label. Together with the recorded
//! direction bits this is exactly what a verifier needs to re-run the batch
//! against the starting digest.

use crate::{
    constant::{negative_infinity_key, positive_infinity_key, END_OF_TREE_IN_PROOF, LABEL_IN_PROOF, LEAF_IN_PROOF},
    node::{InternalProverNode, ProverLeaf, ProverNode},
    operation::{Operation, OperationError, UpdateOutcome},
    proof::{DirectionBits, ModifyStep, ProverError, SerializedProof},
    types::{AdDigest, AdKey, AdValue, Balance, NodeHeight},
};
use std::rc::Rc;

/// New balances of the two rotated parents after a double rotation, chosen
/// by the grandchild's pre-rotation balance. The same table serves both
/// orientations and both the growth and shrink cases.
#[inline]
pub(crate) fn double_rotation_balances(grandchild: Balance) -> (Balance, Balance) {
    match grandchild {
        0 => (0, 0),
        -1 => (0, 1),
        _ => (-1, 0),
    }
}

/// Mutable AVL dictionary that records a batch proof as it is modified.
#[derive(Debug)]
pub struct BatchAvlProver {
    key_length: usize,
    value_length: usize,
    root: Rc<ProverNode>,
    /// Root as of the last `generate_proof`; shares all untouched subtrees
    /// with `root` and carries the `visited` marks of the running batch.
    pre_batch_root: Rc<ProverNode>,
    root_height: NodeHeight,
    directions: DirectionBits,
    /// Bit index of the latest right turn, used to replay the deletion
    /// descent without re-reading keys.
    last_right_step: usize,
    /// Read cursor over the recorded bits during a deletion replay.
    replay_index: usize,
    /// Chain predecessor captured while detaching it during a deletion.
    saved_leaf: Option<(AdKey, AdValue)>,
}

impl BatchAvlProver {
    /// Creates a prover over the initial single-leaf tree
    /// `(NegativeInfinity, 0^VL, PositiveInfinity)`.
    pub fn new(key_length: usize, value_length: usize) -> Self {
        assert!(key_length > 0, "key length must be positive");
        let leaf = ProverLeaf::new(
            AdKey::from(negative_infinity_key(key_length)),
            AdValue::zero(value_length),
            AdKey::from(positive_infinity_key(key_length)),
        );
        let root = Rc::new(ProverNode::Leaf(leaf));
        Self::with_root(key_length, value_length, root, 0)
    }

    /// Creates a prover seeded with a restored tree, e.g. after a rollback
    /// of the versioned store.
    pub fn with_root(
        key_length: usize,
        value_length: usize,
        root: Rc<ProverNode>,
        height: NodeHeight,
    ) -> Self {
        Self {
            key_length,
            value_length,
            pre_batch_root: Rc::clone(&root),
            root,
            root_height: height,
            directions: DirectionBits::default(),
            last_right_step: 0,
            replay_index: 0,
            saved_leaf: None,
        }
    }

    /// The configured key length in bytes.
    pub fn key_length(&self) -> usize {
        self.key_length
    }

    /// The configured value length in bytes.
    pub fn value_length(&self) -> usize {
        self.value_length
    }

    /// Current root height.
    pub fn height(&self) -> NodeHeight {
        self.root_height
    }

    /// The live tree root.
    pub fn root(&self) -> &Rc<ProverNode> {
        &self.root
    }

    /// The current digest: root label plus one height byte.
    pub fn digest(&self) -> AdDigest {
        AdDigest::new(&self.root.label(), self.root_height)
    }

    /// Read-only lookup that bypasses proof recording entirely.
    pub fn unauthenticated_lookup(&self, key: &AdKey) -> Option<AdValue> {
        let mut current = &self.root;
        loop {
            match current.as_ref() {
                ProverNode::Internal(r) => {
                    current = if *key < r.key { &r.left } else { &r.right };
                }
                ProverNode::Leaf(leaf) => {
                    return (leaf.key == *key).then(|| leaf.value.clone());
                }
            }
        }
    }

    /// Applies one modification and records its descent for the batch proof.
    ///
    /// Returns the value stored under the key before the call. On error the
    /// tree, the direction stream and every node flag are exactly as they
    /// were before the call, and the batch may continue.
    pub fn perform_one_modification<O: Operation>(
        &mut self,
        operation: &O,
    ) -> Result<Option<AdValue>, ProverError> {
        let key = operation.key();
        if key.len() != self.key_length {
            return Err(ProverError::KeyLength {
                got: key.len(),
                expected: self.key_length,
            });
        }
        if key.is_negative_infinity() || key.is_positive_infinity() {
            return Err(ProverError::ReservedKey);
        }

        let checkpoint = self.directions.bit_length();
        self.replay_index = checkpoint;
        let root = Rc::clone(&self.root);
        match self.modify_helper(&root, operation) {
            Err(e) => {
                // drop the bits of the failed descent; nothing was marked
                self.directions.truncate(checkpoint);
                Err(e)
            }
            Ok(step) => {
                if step.to_delete {
                    let (new_root, height_decreased) = self.delete_helper(&root, false);
                    self.root = new_root;
                    if height_decreased {
                        self.root_height -= 1;
                    }
                } else {
                    self.root = step.node;
                    if step.height_increased {
                        self.root_height += 1;
                    }
                }
                Ok(step.old_value)
            }
        }
    }

    /// Serializes the batch proof, then resets all bookkeeping so the next
    /// batch starts from the tree this one produced.
    ///
    /// The returned bytes are freshly allocated and owned by the caller.
    pub fn generate_proof(&mut self) -> SerializedProof {
        let mut packed = Vec::new();
        let mut previous_leaf_available = false;
        Self::pack_tree(&self.pre_batch_root, &mut packed, &mut previous_leaf_available);
        packed.push(END_OF_TREE_IN_PROOF);
        packed.extend_from_slice(self.directions.as_bytes());

        self.directions.clear();
        self.last_right_step = 0;
        self.replay_index = 0;
        Self::reset_new(&self.root);
        self.pre_batch_root = Rc::clone(&self.root);

        SerializedProof(packed)
    }

    /// Full invariant audit, for tests and debugging; panics on the first
    /// violation. With `post_proof` set it additionally requires every
    /// `visited`/`is_new` flag to be clear.
    pub fn check_tree(&self, post_proof: bool) {
        let mut leaves = Vec::new();
        let (height, _, _) = Self::check_subtree(&self.root, post_proof, &mut leaves);
        assert_eq!(height, self.root_height, "stored root height is stale");

        assert!(
            leaves.first().is_some_and(|l| l.key().is_negative_infinity()),
            "the chain must start at the negative-infinity leaf"
        );
        for pair in leaves.windows(2) {
            assert!(pair[0].key() < pair[1].key(), "leaf keys out of order");
            assert_eq!(
                pair[0].next_leaf_key(),
                pair[1].key(),
                "broken leaf chain link"
            );
        }
        assert!(
            leaves
                .last()
                .is_some_and(|l| l.next_leaf_key().is_positive_infinity()),
            "the chain must end at positive infinity"
        );
    }

    fn check_subtree<'a>(
        node: &'a Rc<ProverNode>,
        post_proof: bool,
        leaves: &mut Vec<&'a ProverLeaf>,
    ) -> (NodeHeight, &'a AdKey, &'a AdKey) {
        if post_proof {
            assert!(!node.visited(), "visited flag survived generate_proof");
            assert!(!node.is_new(), "is_new flag survived generate_proof");
        }
        match node.as_ref() {
            ProverNode::Leaf(leaf) => {
                leaves.push(leaf);
                (0, &leaf.key, &leaf.key)
            }
            ProverNode::Internal(r) => {
                let (left_height, left_min, left_max) =
                    Self::check_subtree(&r.left, post_proof, leaves);
                let (right_height, right_min, right_max) =
                    Self::check_subtree(&r.right, post_proof, leaves);
                assert!(
                    r.balance.abs() <= 1,
                    "balance out of range at key {:?}",
                    r.key
                );
                assert_eq!(
                    r.balance as i64,
                    right_height as i64 - left_height as i64,
                    "stored balance disagrees with child heights"
                );
                assert_eq!(&r.key, right_min, "internal key must be min of right subtree");
                assert!(left_max < &r.key, "left subtree reaches into the right");
                (left_height.max(right_height) + 1, left_min, right_max)
            }
        }
    }

    // --- the four descent capabilities -----------------------------------

    /// Compares against the live key and records the turn as one proof bit.
    fn next_direction_is_left(&mut self, key: &AdKey, node: &InternalProverNode) -> bool {
        let is_left = *key < node.key;
        if !is_left {
            self.last_right_step = self.directions.bit_length();
        }
        self.directions.push(is_left);
        is_left
    }

    /// The live tree holds real keys, so a plain equality suffices; the
    /// search invariant guarantees the descent leaf covers the key band.
    fn key_matches_leaf(key: &AdKey, leaf: &ProverLeaf) -> bool {
        *key == leaf.key
    }

    /// Re-derives the comparison at the next node of the deletion descent
    /// from the bits recorded by the first descent, so that prover and
    /// verifier walk byte-identical paths.
    fn replay_comparison(&mut self) -> i8 {
        let index = self.replay_index;
        self.replay_index += 1;
        if index == self.last_right_step {
            0
        } else if index < self.last_right_step && !self.directions.is_left(index) {
            1
        } else {
            -1
        }
    }

    /// Splices a fresh leaf after `leaf`, returning the two-leaf subtree.
    fn add_node(&self, leaf: &ProverLeaf, key: &AdKey, value: AdValue) -> Rc<ProverNode> {
        let new_leaf = Rc::new(ProverNode::Leaf(ProverLeaf::new(
            key.clone(),
            value,
            leaf.next_leaf_key.clone(),
        )));
        let rewired = Rc::new(ProverNode::Leaf(ProverLeaf::new(
            leaf.key.clone(),
            leaf.value.clone(),
            key.clone(),
        )));
        Rc::new(ProverNode::Internal(InternalProverNode::new(
            key.clone(),
            rewired,
            new_leaf,
            0,
        )))
    }

    // --- modification descent --------------------------------------------

    fn check_value_length(&self, value: &AdValue) -> Result<(), ProverError> {
        if value.len() != self.value_length {
            return Err(ProverError::ValueLength {
                got: value.len(),
                expected: self.value_length,
            });
        }
        Ok(())
    }

    fn internal(
        key: AdKey,
        left: Rc<ProverNode>,
        right: Rc<ProverNode>,
        balance: Balance,
    ) -> Rc<ProverNode> {
        Rc::new(ProverNode::Internal(InternalProverNode::new(
            key, left, right, balance,
        )))
    }

    fn modify_helper<O: Operation>(
        &mut self,
        node: &Rc<ProverNode>,
        operation: &O,
    ) -> Result<ModifyStep<ProverNode>, ProverError> {
        // Nodes are marked visited only once the update function is known to
        // succeed, so a failed modification leaves no trace in the proof.
        match node.as_ref() {
            ProverNode::Leaf(leaf) => {
                let key = operation.key();
                if Self::key_matches_leaf(key, leaf) {
                    let old_value = Some(leaf.value.clone());
                    match operation.update(Some(&leaf.value))? {
                        UpdateOutcome::Unchanged => {
                            node.mark_visited();
                            Ok(ModifyStep {
                                node: Rc::clone(node),
                                changed: false,
                                height_increased: false,
                                to_delete: false,
                                old_value,
                            })
                        }
                        UpdateOutcome::Write(value) => {
                            self.check_value_length(&value)?;
                            node.mark_visited();
                            let updated = Rc::new(ProverNode::Leaf(ProverLeaf::new(
                                leaf.key.clone(),
                                value,
                                leaf.next_leaf_key.clone(),
                            )));
                            Ok(ModifyStep {
                                node: updated,
                                changed: true,
                                height_increased: false,
                                to_delete: false,
                                old_value,
                            })
                        }
                        UpdateOutcome::Delete => {
                            node.mark_visited();
                            Ok(ModifyStep {
                                node: Rc::clone(node),
                                changed: false,
                                height_increased: false,
                                to_delete: true,
                                old_value,
                            })
                        }
                    }
                } else {
                    // leaf.key < key < leaf.next_leaf_key
                    match operation.update(None)? {
                        UpdateOutcome::Unchanged => {
                            node.mark_visited();
                            Ok(ModifyStep {
                                node: Rc::clone(node),
                                changed: false,
                                height_increased: false,
                                to_delete: false,
                                old_value: None,
                            })
                        }
                        UpdateOutcome::Write(value) => {
                            self.check_value_length(&value)?;
                            node.mark_visited();
                            Ok(ModifyStep {
                                node: self.add_node(leaf, key, value),
                                changed: true,
                                height_increased: true,
                                to_delete: false,
                                old_value: None,
                            })
                        }
                        UpdateOutcome::Delete => Err(OperationError::DeleteOfAbsent.into()),
                    }
                }
            }
            ProverNode::Internal(r) => {
                if self.next_direction_is_left(operation.key(), r) {
                    let step = self.modify_helper(&r.left, operation)?;
                    node.mark_visited();
                    if !step.changed {
                        return Ok(ModifyStep {
                            node: Rc::clone(node),
                            changed: false,
                            height_increased: false,
                            to_delete: step.to_delete,
                            old_value: step.old_value,
                        });
                    }
                    if step.height_increased && r.balance < 0 {
                        // the left subtree is now two levels taller
                        let new_left = step
                            .node
                            .as_internal()
                            .expect("a grown subtree root is internal");
                        let rotated = if new_left.balance < 0 {
                            // single right rotation
                            let new_r = Self::internal(
                                r.key.clone(),
                                Rc::clone(&new_left.right),
                                Rc::clone(&r.right),
                                0,
                            );
                            Self::internal(new_left.key.clone(), Rc::clone(&new_left.left), new_r, 0)
                        } else {
                            // left-right double rotation
                            let grand = new_left
                                .right
                                .as_internal()
                                .expect("double rotation pivots on an internal grandchild");
                            let (left_balance, right_balance) =
                                double_rotation_balances(grand.balance);
                            let new_l = Self::internal(
                                new_left.key.clone(),
                                Rc::clone(&new_left.left),
                                Rc::clone(&grand.left),
                                left_balance,
                            );
                            let new_r = Self::internal(
                                r.key.clone(),
                                Rc::clone(&grand.right),
                                Rc::clone(&r.right),
                                right_balance,
                            );
                            Self::internal(grand.key.clone(), new_l, new_r, 0)
                        };
                        Ok(ModifyStep {
                            node: rotated,
                            changed: true,
                            height_increased: false,
                            to_delete: false,
                            old_value: step.old_value,
                        })
                    } else {
                        let grown = step.height_increased && r.balance == 0;
                        let balance = if step.height_increased {
                            r.balance - 1
                        } else {
                            r.balance
                        };
                        Ok(ModifyStep {
                            node: Self::internal(
                                r.key.clone(),
                                step.node,
                                Rc::clone(&r.right),
                                balance,
                            ),
                            changed: true,
                            height_increased: grown,
                            to_delete: false,
                            old_value: step.old_value,
                        })
                    }
                } else {
                    let step = self.modify_helper(&r.right, operation)?;
                    node.mark_visited();
                    if !step.changed {
                        return Ok(ModifyStep {
                            node: Rc::clone(node),
                            changed: false,
                            height_increased: false,
                            to_delete: step.to_delete,
                            old_value: step.old_value,
                        });
                    }
                    if step.height_increased && r.balance > 0 {
                        // the right subtree is now two levels taller
                        let new_right = step
                            .node
                            .as_internal()
                            .expect("a grown subtree root is internal");
                        let rotated = if new_right.balance > 0 {
                            // single left rotation
                            let new_l = Self::internal(
                                r.key.clone(),
                                Rc::clone(&r.left),
                                Rc::clone(&new_right.left),
                                0,
                            );
                            Self::internal(
                                new_right.key.clone(),
                                new_l,
                                Rc::clone(&new_right.right),
                                0,
                            )
                        } else {
                            // right-left double rotation
                            let grand = new_right
                                .left
                                .as_internal()
                                .expect("double rotation pivots on an internal grandchild");
                            let (left_balance, right_balance) =
                                double_rotation_balances(grand.balance);
                            let new_l = Self::internal(
                                r.key.clone(),
                                Rc::clone(&r.left),
                                Rc::clone(&grand.left),
                                left_balance,
                            );
                            let new_r = Self::internal(
                                new_right.key.clone(),
                                Rc::clone(&grand.right),
                                Rc::clone(&new_right.right),
                                right_balance,
                            );
                            Self::internal(grand.key.clone(), new_l, new_r, 0)
                        };
                        Ok(ModifyStep {
                            node: rotated,
                            changed: true,
                            height_increased: false,
                            to_delete: false,
                            old_value: step.old_value,
                        })
                    } else {
                        let grown = step.height_increased && r.balance == 0;
                        let balance = if step.height_increased {
                            r.balance + 1
                        } else {
                            r.balance
                        };
                        Ok(ModifyStep {
                            node: Self::internal(
                                r.key.clone(),
                                Rc::clone(&r.left),
                                step.node,
                                balance,
                            ),
                            changed: true,
                            height_increased: grown,
                            to_delete: false,
                            old_value: step.old_value,
                        })
                    }
                }
            }
        }
    }

    // --- deletion ---------------------------------------------------------

    /// Detaches the leaf the preceding descent located, replaying that
    /// descent from the recorded bits. Returns the new subtree root and
    /// whether its height decreased.
    ///
    /// With `delete_max` the maximum leaf of the subtree is detached and
    /// saved instead: its key and value later overwrite the minimum leaf of
    /// the matched node's right subtree, which keeps every internal key
    /// equal to the smallest key of its right subtree.
    fn delete_helper(&mut self, node: &Rc<ProverNode>, delete_max: bool) -> (Rc<ProverNode>, bool) {
        node.mark_visited();
        let r = node
            .as_internal()
            .expect("the deletion descent only passes internal nodes");
        let direction = if delete_max { 1 } else { self.replay_comparison() };

        if direction >= 0 {
            if let Some(right_leaf) = r.right.as_leaf() {
                r.right.mark_visited();
                if delete_max {
                    // detach the subtree maximum and hand it upward
                    self.saved_leaf = Some((right_leaf.key.clone(), right_leaf.value.clone()));
                    return (Rc::clone(&r.left), true);
                }
                debug_assert_eq!(direction, 0);
                // the right leaf holds the key; its predecessor is the
                // maximum of the left subtree
                let new_left = self
                    .change_next_leaf_key_of_max_node(&r.left, right_leaf.next_leaf_key.clone());
                return (new_left, true);
            }
        }

        if direction == 0 {
            if let Some(left_leaf) = r.left.as_leaf() {
                // the left leaf is the predecessor itself: it replaces the
                // doomed minimum of the right subtree, and this node
                // dissolves
                r.left.mark_visited();
                let new_right = self.change_key_and_value_of_min_node(
                    &r.right,
                    left_leaf.key.clone(),
                    left_leaf.value.clone(),
                );
                return (new_right, true);
            }
            // both children internal: pull the predecessor out of the left
            // subtree and splice it over the minimum of the right one
            let (new_left, left_shrank) = self.delete_helper(&r.left, true);
            let (predecessor_key, predecessor_value) = self
                .saved_leaf
                .take()
                .expect("delete_max always saves the detached leaf");
            let new_right = self.change_key_and_value_of_min_node(
                &r.right,
                predecessor_key.clone(),
                predecessor_value,
            );
            return if left_shrank {
                self.rebalance_after_left_shrink(predecessor_key, r.balance, new_left, &new_right)
            } else {
                (
                    Self::internal(predecessor_key, new_left, new_right, r.balance),
                    false,
                )
            };
        }

        if direction < 0 {
            let (new_left, shrank) = self.delete_helper(&r.left, false);
            if shrank {
                self.rebalance_after_left_shrink(r.key.clone(), r.balance, new_left, &r.right)
            } else {
                (
                    Self::internal(r.key.clone(), new_left, Rc::clone(&r.right), r.balance),
                    false,
                )
            }
        } else {
            let (new_right, shrank) = self.delete_helper(&r.right, delete_max);
            if shrank {
                self.rebalance_after_right_shrink(r.key.clone(), r.balance, &r.left, new_right)
            } else {
                (
                    Self::internal(r.key.clone(), Rc::clone(&r.left), new_right, r.balance),
                    false,
                )
            }
        }
    }

    /// Rebuilds the right spine of a subtree so its maximum leaf points at
    /// `next_leaf_key`, closing the chain over a removed successor.
    fn change_next_leaf_key_of_max_node(
        &mut self,
        node: &Rc<ProverNode>,
        next_leaf_key: AdKey,
    ) -> Rc<ProverNode> {
        node.mark_visited();
        match node.as_ref() {
            ProverNode::Leaf(leaf) => Rc::new(ProverNode::Leaf(ProverLeaf::new(
                leaf.key.clone(),
                leaf.value.clone(),
                next_leaf_key,
            ))),
            ProverNode::Internal(r) => {
                let new_right = self.change_next_leaf_key_of_max_node(&r.right, next_leaf_key);
                Self::internal(r.key.clone(), Rc::clone(&r.left), new_right, r.balance)
            }
        }
    }

    /// Rebuilds the left spine of a subtree so its minimum leaf carries the
    /// given key and value; the leaf keeps its `next_leaf_key`.
    fn change_key_and_value_of_min_node(
        &mut self,
        node: &Rc<ProverNode>,
        key: AdKey,
        value: AdValue,
    ) -> Rc<ProverNode> {
        node.mark_visited();
        match node.as_ref() {
            ProverNode::Leaf(leaf) => Rc::new(ProverNode::Leaf(ProverLeaf::new(
                key,
                value,
                leaf.next_leaf_key.clone(),
            ))),
            ProverNode::Internal(r) => {
                let new_left = self.change_key_and_value_of_min_node(&r.left, key, value);
                Self::internal(r.key.clone(), new_left, Rc::clone(&r.right), r.balance)
            }
        }
    }

    /// Rebalances a node whose left subtree lost one level. The sibling
    /// (and, for a double rotation, its inner child) is marked visited
    /// because the verifier must read its balance to replay the rotation.
    fn rebalance_after_left_shrink(
        &mut self,
        key: AdKey,
        balance: Balance,
        new_left: Rc<ProverNode>,
        right: &Rc<ProverNode>,
    ) -> (Rc<ProverNode>, bool) {
        match balance {
            -1 => (Self::internal(key, new_left, Rc::clone(right), 0), true),
            0 => (Self::internal(key, new_left, Rc::clone(right), 1), false),
            _ => {
                right.mark_visited();
                let sibling = right
                    .as_internal()
                    .expect("the taller sibling of a shrunk subtree is internal");
                if sibling.balance == 0 {
                    // single left rotation, height preserved
                    let new_l =
                        Self::internal(key, new_left, Rc::clone(&sibling.left), 1);
                    (
                        Self::internal(
                            sibling.key.clone(),
                            new_l,
                            Rc::clone(&sibling.right),
                            -1,
                        ),
                        false,
                    )
                } else if sibling.balance > 0 {
                    // single left rotation
                    let new_l =
                        Self::internal(key, new_left, Rc::clone(&sibling.left), 0);
                    (
                        Self::internal(sibling.key.clone(), new_l, Rc::clone(&sibling.right), 0),
                        true,
                    )
                } else {
                    // right-left double rotation through the inner child
                    sibling.left.mark_visited();
                    let grand = sibling
                        .left
                        .as_internal()
                        .expect("double rotation pivots on an internal grandchild");
                    let (left_balance, right_balance) = double_rotation_balances(grand.balance);
                    let new_l = Self::internal(key, new_left, Rc::clone(&grand.left), left_balance);
                    let new_r = Self::internal(
                        sibling.key.clone(),
                        Rc::clone(&grand.right),
                        Rc::clone(&sibling.right),
                        right_balance,
                    );
                    (Self::internal(grand.key.clone(), new_l, new_r, 0), true)
                }
            }
        }
    }

    /// Mirror of [`Self::rebalance_after_left_shrink`].
    fn rebalance_after_right_shrink(
        &mut self,
        key: AdKey,
        balance: Balance,
        left: &Rc<ProverNode>,
        new_right: Rc<ProverNode>,
    ) -> (Rc<ProverNode>, bool) {
        match balance {
            1 => (Self::internal(key, Rc::clone(left), new_right, 0), true),
            0 => (Self::internal(key, Rc::clone(left), new_right, -1), false),
            _ => {
                left.mark_visited();
                let sibling = left
                    .as_internal()
                    .expect("the taller sibling of a shrunk subtree is internal");
                if sibling.balance == 0 {
                    // single right rotation, height preserved
                    let new_r =
                        Self::internal(key, Rc::clone(&sibling.right), new_right, -1);
                    (
                        Self::internal(
                            sibling.key.clone(),
                            Rc::clone(&sibling.left),
                            new_r,
                            1,
                        ),
                        false,
                    )
                } else if sibling.balance < 0 {
                    // single right rotation
                    let new_r =
                        Self::internal(key, Rc::clone(&sibling.right), new_right, 0);
                    (
                        Self::internal(sibling.key.clone(), Rc::clone(&sibling.left), new_r, 0),
                        true,
                    )
                } else {
                    // left-right double rotation through the inner child
                    sibling.right.mark_visited();
                    let grand = sibling
                        .right
                        .as_internal()
                        .expect("double rotation pivots on an internal grandchild");
                    let (left_balance, right_balance) = double_rotation_balances(grand.balance);
                    let new_l = Self::internal(
                        sibling.key.clone(),
                        Rc::clone(&sibling.left),
                        Rc::clone(&grand.left),
                        left_balance,
                    );
                    let new_r = Self::internal(key, Rc::clone(&grand.right), new_right, right_balance);
                    (Self::internal(grand.key.clone(), new_l, new_r, 0), true)
                }
            }
        }
    }

    // --- proof packing ----------------------------------------------------

    /// Post-order serialization of the pre-batch tree: visited nodes appear
    /// structurally, untouched subtrees as bare labels. Clears the visited
    /// marks as it goes.
    fn pack_tree(node: &Rc<ProverNode>, packed: &mut Vec<u8>, previous_leaf_available: &mut bool) {
        if !node.visited() {
            packed.push(LABEL_IN_PROOF);
            packed.extend_from_slice(&node.label());
            *previous_leaf_available = false;
            return;
        }
        node.clear_visited();
        match node.as_ref() {
            ProverNode::Leaf(leaf) => {
                packed.push(LEAF_IN_PROOF);
                if !*previous_leaf_available {
                    packed.extend_from_slice(&leaf.key);
                }
                packed.extend_from_slice(&leaf.next_leaf_key);
                packed.extend_from_slice(&leaf.value);
                *previous_leaf_available = true;
            }
            ProverNode::Internal(r) => {
                Self::pack_tree(&r.left, packed, previous_leaf_available);
                Self::pack_tree(&r.right, packed, previous_leaf_available);
                packed.push(r.balance as u8);
            }
        }
    }

    /// Clears `is_new` (and any `visited` marks sitting on batch-created
    /// nodes) across the surviving tree. Both flag sets are downward-closed
    /// from the root, so the walk prunes at the first clean node.
    fn reset_new(node: &Rc<ProverNode>) {
        if !node.is_new() && !node.visited() {
            return;
        }
        node.clear_new();
        node.clear_visited();
        if let ProverNode::Internal(r) = node.as_ref() {
            Self::reset_new(&r.left);
            Self::reset_new(&r.right);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constant::{DEFAULT_KEY_LENGTH, DEFAULT_VALUE_LENGTH},
        operation::Modification,
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const KL: usize = DEFAULT_KEY_LENGTH;
    const VL: usize = DEFAULT_VALUE_LENGTH;

    fn key(b: u8) -> AdKey {
        let mut bytes = vec![0u8; KL];
        bytes[0] = b;
        AdKey::from(bytes)
    }

    fn value(b: u8) -> AdValue {
        AdValue::from(vec![b; VL])
    }

    fn insert(b: u8) -> Modification {
        Modification::Insert { key: key(b), value: value(b) }
    }

    /// Inserting changes the digest and height; the inserted pair is
    /// retrievable; the tree invariants hold.
    #[test]
    fn insert_and_lookup() {
        let mut prover = BatchAvlProver::new(KL, VL);
        let d0 = prover.digest();
        assert_eq!(d0.height(), 0);

        assert_eq!(prover.perform_one_modification(&insert(1)).unwrap(), None);
        assert_ne!(prover.digest(), d0);
        assert_eq!(prover.digest().height(), 1);
        assert_eq!(prover.unauthenticated_lookup(&key(1)), Some(value(1)));
        assert_eq!(prover.unauthenticated_lookup(&key(2)), None);
        prover.check_tree(false);
    }

    /// The digest is a deterministic function of the modification history:
    /// independent provers replaying the same sequence agree at every step,
    /// and batch boundaries (`generate_proof` calls) never affect it.
    #[test]
    fn digest_is_deterministic_over_the_history() {
        // ascending drives left rotations, descending right rotations, and
        // the shuffled tail exercises both double-rotation shapes
        let mut ops: Vec<u8> = (1..=16).collect();
        ops.extend((17..=32).rev());
        let mut rng = StdRng::seed_from_u64(7);
        for i in (1..ops.len()).rev() {
            ops.swap(i, rng.gen_range(0..=i));
        }

        let mut a = BatchAvlProver::new(KL, VL);
        let mut b = BatchAvlProver::new(KL, VL);
        for (i, &byte) in ops.iter().enumerate() {
            a.perform_one_modification(&insert(byte)).unwrap();
            b.perform_one_modification(&insert(byte)).unwrap();
            assert_eq!(a.digest(), b.digest());
            a.check_tree(false);
            if i % 5 == 0 {
                // proof generation must not disturb the tree itself
                b.generate_proof();
                b.check_tree(true);
            }
        }
        assert_eq!(a.digest(), b.digest());
    }

    /// A failing modification must leave the digest byte-identical and keep
    /// the batch usable.
    #[test]
    fn failure_does_not_mutate() {
        let mut prover = BatchAvlProver::new(KL, VL);
        prover.perform_one_modification(&insert(1)).unwrap();
        let digest = prover.digest();

        // duplicate insert
        assert!(prover.perform_one_modification(&insert(1)).is_err());
        assert_eq!(prover.digest(), digest);

        // update of a missing key
        let update = Modification::Update { key: key(9), value: value(9) };
        assert!(prover.perform_one_modification(&update).is_err());
        assert_eq!(prover.digest(), digest);

        // remove of a missing key
        let remove = Modification::Remove { key: key(9) };
        assert!(prover.perform_one_modification(&remove).is_err());
        assert_eq!(prover.digest(), digest);

        // counter overflow
        prover
            .perform_one_modification(&Modification::UpdateLongBy { key: key(2), delta: i64::MAX })
            .unwrap();
        let digest = prover.digest();
        assert_eq!(
            prover.perform_one_modification(&Modification::UpdateLongBy {
                key: key(2),
                delta: 1
            }),
            Err(ProverError::Operation(OperationError::ArithmeticOverflow))
        );
        assert_eq!(prover.digest(), digest);

        // reserved keys and malformed keys never reach the tree
        let bad = Modification::Insert {
            key: AdKey::from(negative_infinity_key(KL)),
            value: value(0),
        };
        assert_eq!(
            prover.perform_one_modification(&bad),
            Err(ProverError::ReservedKey)
        );
        let short = Modification::Insert { key: AdKey::from(vec![1u8; 4]), value: value(0) };
        assert!(matches!(
            prover.perform_one_modification(&short),
            Err(ProverError::KeyLength { got: 4, .. })
        ));
        assert_eq!(prover.digest(), digest);
        prover.check_tree(false);
    }

    /// Removing every key shrinks the tree back to the single initial leaf,
    /// whose digest is canonical: it must equal the pre-insert digest.
    #[test]
    fn removing_everything_restores_the_empty_digest() {
        let mut prover = BatchAvlProver::new(KL, VL);
        let empty = prover.digest();

        let keys: Vec<u8> = (1..=16).collect();
        for &b in &keys {
            prover.perform_one_modification(&insert(b)).unwrap();
        }

        // removal order deliberately differs from insertion order
        let mut rng = StdRng::seed_from_u64(3);
        let mut order = keys.clone();
        for i in (1..order.len()).rev() {
            order.swap(i, rng.gen_range(0..=i));
        }
        for &b in &order {
            prover
                .perform_one_modification(&Modification::Remove { key: key(b) })
                .unwrap();
            prover.check_tree(false);
            assert_eq!(prover.unauthenticated_lookup(&key(b)), None);
        }

        assert_eq!(prover.digest(), empty);
        assert_eq!(prover.digest().height(), 0);
    }

    /// Deleting interior keys exercises the predecessor splice and the
    /// shrink rotations; the strict invariants must survive every step.
    #[test]
    fn randomized_insert_remove_audit() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut prover = BatchAvlProver::new(KL, VL);
        let mut live: Vec<u8> = Vec::new();

        for round in 0..500 {
            let b = rng.gen_range(1..=250u8);
            if live.contains(&b) {
                let m = if round % 2 == 0 {
                    Modification::Remove { key: key(b) }
                } else {
                    Modification::RemoveIfExists { key: key(b) }
                };
                assert_eq!(prover.perform_one_modification(&m).unwrap(), Some(value(b)));
                live.retain(|&x| x != b);
            } else {
                prover.perform_one_modification(&insert(b)).unwrap();
                live.push(b);
            }
            prover.check_tree(false);
        }
        for &b in &live {
            assert_eq!(prover.unauthenticated_lookup(&key(b)), Some(value(b)));
        }
    }

    /// RemoveIfExists of an absent key succeeds, returns no old value and
    /// leaves the digest unchanged.
    #[test]
    fn remove_if_exists_of_absent_key_is_silent() {
        let mut prover = BatchAvlProver::new(KL, VL);
        prover.perform_one_modification(&insert(1)).unwrap();
        let digest = prover.digest();
        let m = Modification::RemoveIfExists { key: key(7) };
        assert_eq!(prover.perform_one_modification(&m).unwrap(), None);
        assert_eq!(prover.digest(), digest);
    }

    /// The proof for one insert on the initial tree is the genesis leaf,
    /// the terminator and no direction bytes; generate_proof resets all
    /// flags and hands out an owned buffer.
    #[test]
    fn first_proof_bytes_and_reset() {
        let mut prover = BatchAvlProver::new(KL, VL);
        prover.perform_one_modification(&insert(1)).unwrap();
        let proof = prover.generate_proof();

        // leaf token + key + next_leaf_key + value + terminator
        assert_eq!(proof.len(), 1 + KL + KL + VL + 1);
        assert_eq!(proof[0], LEAF_IN_PROOF);
        assert_eq!(&proof[1..1 + KL], negative_infinity_key(KL).as_slice());
        assert_eq!(
            &proof[1 + KL..1 + 2 * KL],
            positive_infinity_key(KL).as_slice()
        );
        assert_eq!(&proof[1 + 2 * KL..1 + 2 * KL + VL], vec![0u8; VL].as_slice());
        assert_eq!(proof[1 + 2 * KL + VL], END_OF_TREE_IN_PROOF);

        prover.check_tree(true);

        // the next batch descends one internal node per modification
        prover.perform_one_modification(&insert(2)).unwrap();
        let proof = prover.generate_proof();
        assert_eq!(*proof.last().unwrap() & 1, 0); // first turn went right
        prover.check_tree(true);
    }

    /// Old values are reported exactly as they stood before each call.
    #[test]
    fn old_values_are_returned() {
        let mut prover = BatchAvlProver::new(KL, VL);
        assert_eq!(prover.perform_one_modification(&insert(3)).unwrap(), None);
        let update = Modification::Update { key: key(3), value: value(9) };
        assert_eq!(
            prover.perform_one_modification(&update).unwrap(),
            Some(value(3))
        );
        let remove = Modification::Remove { key: key(3) };
        assert_eq!(
            prover.perform_one_modification(&remove).unwrap(),
            Some(value(9))
        );
        let lookup = Modification::Lookup { key: key(3) };
        assert_eq!(prover.perform_one_modification(&lookup).unwrap(), None);
    }
}
