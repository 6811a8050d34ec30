//! Verifier side of the batched authenticated dictionary.
//!
//! [`BatchAvlVerifier`] parses a proof into a partial tree (untouched
//! subtrees stay opaque labels), checks the reconstructed root against the
//! starting digest, then replays the batch. Key comparisons at internal
//! nodes are impossible — the reconstructed nodes carry no keys — so the
//! descent consumes the proof's direction bits instead, and the leaf
//! reached must cover the operation key in its `[key, next_leaf_key)` band.
//! Any failed check pins the verifier: every later call fails and
//! `digest()` stays `None`.

use crate::{
    constant::{DIGEST_LENGTH, END_OF_TREE_IN_PROOF, LABEL_IN_PROOF, LEAF_IN_PROOF},
    node::{InternalVerifierNode, VerifierLeaf, VerifierNode},
    operation::{Operation, OperationError, UpdateOutcome},
    proof::{
        proof_direction_is_left, prover::double_rotation_balances, ModifyStep, SerializedProof,
        VerifierError,
    },
    types::{AdDigest, AdKey, AdValue, Balance, Label, NodeHeight},
};
use std::{cmp::Ordering, rc::Rc};

/// Stream-driven verifier: reconstructs the touched subtree from a proof
/// and re-executes the batch against it.
#[derive(Debug)]
pub struct BatchAvlVerifier {
    key_length: usize,
    value_length: usize,
    proof: Vec<u8>,
    /// Current root; `None` once any check has failed (sticky).
    root: Option<Rc<VerifierNode>>,
    root_height: NodeHeight,
    /// Read cursor over the direction bits, in absolute bit positions.
    directions_index: usize,
    /// Bit index of the latest right turn within the current modification.
    last_right_step: usize,
    /// Read cursor for the deletion replay of the current modification.
    replay_index: usize,
    /// Chain predecessor captured while detaching it during a deletion.
    saved_leaf: Option<(AdKey, AdValue)>,
    max_inserts: Option<usize>,
    max_deletes: Option<usize>,
    inserts_replayed: usize,
    deletes_replayed: usize,
}

impl BatchAvlVerifier {
    /// Parses and checks a proof against `starting_digest`.
    ///
    /// `max_inserts` bounds every replayed non-deleting modification
    /// (inserts, updates, lookups), `max_deletes` the deleting ones; a
    /// `None` bound leaves that class unbounded. When both are given, the
    /// proof skeleton is capped at
    /// `(I + D)·(2h + 1) + D·6·(1 + max(h, ⌈log₂(I + D)⌉))` nodes before
    /// anything is hashed, so an oversized proof is rejected cheaply. With
    /// a partial envelope no size cap exists and only the per-class replay
    /// counters apply.
    pub fn new(
        starting_digest: &AdDigest,
        proof: SerializedProof,
        key_length: usize,
        value_length: usize,
        max_inserts: Option<usize>,
        max_deletes: Option<usize>,
    ) -> Result<Self, VerifierError> {
        assert!(key_length > 0, "key length must be positive");
        let root_height = starting_digest.height();
        let max_nodes = Self::max_skeleton_nodes(root_height, max_inserts, max_deletes);

        let bytes = proof.0;
        let mut stack: Vec<Rc<VerifierNode>> = Vec::new();
        let mut previous_leaf_next: Option<AdKey> = None;
        let mut nodes = 0usize;
        let mut i = 0usize;

        loop {
            let token = *bytes
                .get(i)
                .ok_or(VerifierError::ProofMalformed("skeleton has no terminator"))?;
            i += 1;
            match token {
                END_OF_TREE_IN_PROOF => break,
                LABEL_IN_PROOF => {
                    let raw = bytes
                        .get(i..i + DIGEST_LENGTH)
                        .ok_or(VerifierError::ProofMalformed("truncated label"))?;
                    let mut label: Label = [0u8; DIGEST_LENGTH];
                    label.copy_from_slice(raw);
                    i += DIGEST_LENGTH;
                    stack.push(Rc::new(VerifierNode::LabelOnly(label)));
                    previous_leaf_next = None;
                }
                LEAF_IN_PROOF => {
                    // the key is carried only when it cannot be derived from
                    // the previously streamed leaf's chain link
                    let key = match previous_leaf_next.take() {
                        Some(key) => key,
                        None => {
                            let raw = bytes
                                .get(i..i + key_length)
                                .ok_or(VerifierError::ProofMalformed("truncated leaf key"))?;
                            i += key_length;
                            AdKey::from(raw)
                        }
                    };
                    let raw = bytes
                        .get(i..i + key_length)
                        .ok_or(VerifierError::ProofMalformed("truncated next leaf key"))?;
                    let next_leaf_key = AdKey::from(raw);
                    i += key_length;
                    let raw = bytes
                        .get(i..i + value_length)
                        .ok_or(VerifierError::ProofMalformed("truncated leaf value"))?;
                    let value = AdValue::from(raw);
                    i += value_length;

                    previous_leaf_next = Some(next_leaf_key.clone());
                    stack.push(Rc::new(VerifierNode::Leaf(VerifierLeaf::new(
                        key,
                        value,
                        next_leaf_key,
                    ))));
                }
                balance @ (0x00 | 0x01 | 0xFF) => {
                    let right = stack
                        .pop()
                        .ok_or(VerifierError::ProofMalformed("stack underflow"))?;
                    let left = stack
                        .pop()
                        .ok_or(VerifierError::ProofMalformed("stack underflow"))?;
                    stack.push(Rc::new(VerifierNode::Internal(InternalVerifierNode::new(
                        left,
                        right,
                        balance as Balance,
                    ))));
                }
                _ => return Err(VerifierError::ProofMalformed("unknown skeleton token")),
            }
            nodes += 1;
            if let Some(max) = max_nodes {
                if nodes > max {
                    return Err(VerifierError::ProofTooLong { nodes, max });
                }
            }
        }

        let root = stack
            .pop()
            .ok_or(VerifierError::ProofMalformed("empty skeleton"))?;
        if !stack.is_empty() {
            return Err(VerifierError::ProofMalformed("unconsumed skeleton nodes"));
        }
        if root.label() != starting_digest.label() {
            return Err(VerifierError::DigestMismatch);
        }

        // direction bits start at the byte following the terminator
        let directions_index = i * 8;
        Ok(Self {
            key_length,
            value_length,
            proof: bytes,
            root: Some(root),
            root_height,
            directions_index,
            last_right_step: 0,
            replay_index: 0,
            saved_leaf: None,
            max_inserts,
            max_deletes,
            inserts_replayed: 0,
            deletes_replayed: 0,
        })
    }

    /// Skeleton node cap derived from the declared envelope. Each touched
    /// leaf contributes its descent path plus one label per level; a delete
    /// additionally conveys the predecessor spine it rewires and the
    /// sibling/grandchild balances of every shrink rotation, which the
    /// six-fold term covers even for a rotation cascade over the whole
    /// path.
    fn max_skeleton_nodes(
        height: NodeHeight,
        max_inserts: Option<usize>,
        max_deletes: Option<usize>,
    ) -> Option<usize> {
        // a missing bound leaves that modification class unbounded, so no
        // finite skeleton cap can be derived; replay counters still apply
        let inserts = max_inserts?;
        let deletes = max_deletes?;
        let total = inserts + deletes;
        let mut log = 0usize;
        let mut pow = 1usize;
        while pow < total {
            pow *= 2;
            log += 1;
        }
        let grown = 1 + height.max(log);
        // an untouched-tree proof still carries the root label
        Some((total * (2 * height + 1) + deletes * 6 * grown).max(1))
    }

    /// Replays one modification against the partial tree.
    ///
    /// Returns the value the proof conveys for the key prior to this
    /// modification. The first failure of any kind is sticky.
    pub fn perform_one_modification<O: Operation>(
        &mut self,
        operation: &O,
    ) -> Result<Option<AdValue>, VerifierError> {
        if self.root.is_none() {
            return Err(VerifierError::AlreadyFailed);
        }
        match self.try_modification(operation) {
            Ok(old_value) => Ok(old_value),
            Err(e) => {
                self.root = None;
                Err(e)
            }
        }
    }

    /// The current digest, or `None` when the verifier has failed or the
    /// proof conveys recorded descents that were never replayed.
    pub fn digest(&self) -> Option<AdDigest> {
        let root = self.root.as_ref()?;
        let leftover = (self.proof.len() * 8).saturating_sub(self.directions_index);
        if leftover >= 8 {
            // at most seven padding bits may remain after a full replay
            return None;
        }
        Some(AdDigest::new(&root.label(), self.root_height))
    }

    fn try_modification<O: Operation>(
        &mut self,
        operation: &O,
    ) -> Result<Option<AdValue>, VerifierError> {
        let key = operation.key();
        if key.len() != self.key_length {
            return Err(VerifierError::KeyLength {
                got: key.len(),
                expected: self.key_length,
            });
        }
        if key.is_negative_infinity() || key.is_positive_infinity() {
            return Err(VerifierError::ReservedKey);
        }

        let root = Rc::clone(self.root.as_ref().ok_or(VerifierError::AlreadyFailed)?);
        self.replay_index = self.directions_index;
        let step = self.modify_helper(&root, operation)?;

        let deleting = step.to_delete;
        if deleting {
            let (new_root, height_decreased) = self.delete_helper(&root, false)?;
            self.root = Some(new_root);
            if height_decreased {
                self.root_height = self
                    .root_height
                    .checked_sub(1)
                    .ok_or(VerifierError::ProofMalformed("height underflow"))?;
            }
        } else {
            self.root = Some(step.node);
            if step.height_increased {
                self.root_height += 1;
            }
        }

        if deleting {
            self.deletes_replayed += 1;
            if self
                .max_deletes
                .is_some_and(|max| self.deletes_replayed > max)
            {
                return Err(VerifierError::EnvelopeMismatch(
                    "more deletions than declared",
                ));
            }
        } else {
            self.inserts_replayed += 1;
            if self
                .max_inserts
                .is_some_and(|max| self.inserts_replayed > max)
            {
                return Err(VerifierError::EnvelopeMismatch(
                    "more modifications than declared",
                ));
            }
        }
        Ok(step.old_value)
    }

    // --- the four descent capabilities -----------------------------------

    /// Consumes the next direction bit instead of comparing keys.
    fn next_direction_is_left(&mut self) -> Result<bool, VerifierError> {
        let is_left = proof_direction_is_left(&self.proof, self.directions_index)
            .ok_or(VerifierError::ProofMalformed("direction bits exhausted"))?;
        if !is_left {
            self.last_right_step = self.directions_index;
        }
        self.directions_index += 1;
        Ok(is_left)
    }

    /// The conveyed leaf must cover the key in `[key, next_leaf_key)`;
    /// equality decides the match, anything else means the proof walked the
    /// descent to the wrong leaf.
    fn key_matches_leaf(&self, key: &AdKey, leaf: &VerifierLeaf) -> Result<bool, VerifierError> {
        match key.cmp(&leaf.key) {
            Ordering::Equal => Ok(true),
            Ordering::Greater if *key < leaf.next_leaf_key => Ok(false),
            _ => Err(VerifierError::ModificationInapplicable(
                "conveyed leaf does not cover the key",
            )),
        }
    }

    /// Re-derives the deletion-descent comparison from bits already
    /// consumed by the first descent of this modification.
    fn replay_comparison(&mut self) -> Result<i8, VerifierError> {
        let index = self.replay_index;
        self.replay_index += 1;
        let is_left = proof_direction_is_left(&self.proof, index)
            .ok_or(VerifierError::ProofMalformed("replay past direction bits"))?;
        Ok(if index == self.last_right_step {
            0
        } else if index < self.last_right_step && !is_left {
            1
        } else {
            -1
        })
    }

    /// Splices a fresh leaf after `leaf`; the new internal node carries no
    /// key on this side.
    fn add_node(&self, leaf: &VerifierLeaf, key: &AdKey, value: AdValue) -> Rc<VerifierNode> {
        let new_leaf = Rc::new(VerifierNode::Leaf(VerifierLeaf::new(
            key.clone(),
            value,
            leaf.next_leaf_key.clone(),
        )));
        let rewired = Rc::new(VerifierNode::Leaf(VerifierLeaf::new(
            leaf.key.clone(),
            leaf.value.clone(),
            key.clone(),
        )));
        Rc::new(VerifierNode::Internal(InternalVerifierNode::new(
            rewired, new_leaf, 0,
        )))
    }

    // --- replay descent ---------------------------------------------------

    fn check_value_length(&self, value: &AdValue) -> Result<(), VerifierError> {
        if value.len() != self.value_length {
            return Err(VerifierError::ValueLength {
                got: value.len(),
                expected: self.value_length,
            });
        }
        Ok(())
    }

    fn require_internal(node: &Rc<VerifierNode>) -> Result<&InternalVerifierNode, VerifierError> {
        match node.as_ref() {
            VerifierNode::Internal(r) => Ok(r),
            _ => Err(VerifierError::ModificationInapplicable(
                "replay descends into a subtree the proof left opaque",
            )),
        }
    }

    fn internal(
        left: Rc<VerifierNode>,
        right: Rc<VerifierNode>,
        balance: Balance,
    ) -> Rc<VerifierNode> {
        Rc::new(VerifierNode::Internal(InternalVerifierNode::new(
            left, right, balance,
        )))
    }

    fn modify_helper<O: Operation>(
        &mut self,
        node: &Rc<VerifierNode>,
        operation: &O,
    ) -> Result<ModifyStep<VerifierNode>, VerifierError> {
        match node.as_ref() {
            VerifierNode::LabelOnly(_) => Err(VerifierError::ModificationInapplicable(
                "replay descends into a subtree the proof left opaque",
            )),
            VerifierNode::Leaf(leaf) => {
                let key = operation.key();
                if self.key_matches_leaf(key, leaf)? {
                    let old_value = Some(leaf.value.clone());
                    match operation.update(Some(&leaf.value))? {
                        UpdateOutcome::Unchanged => Ok(ModifyStep {
                            node: Rc::clone(node),
                            changed: false,
                            height_increased: false,
                            to_delete: false,
                            old_value,
                        }),
                        UpdateOutcome::Write(value) => {
                            self.check_value_length(&value)?;
                            let updated = Rc::new(VerifierNode::Leaf(VerifierLeaf::new(
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
                        UpdateOutcome::Delete => Ok(ModifyStep {
                            node: Rc::clone(node),
                            changed: false,
                            height_increased: false,
                            to_delete: true,
                            old_value,
                        }),
                    }
                } else {
                    match operation.update(None)? {
                        UpdateOutcome::Unchanged => Ok(ModifyStep {
                            node: Rc::clone(node),
                            changed: false,
                            height_increased: false,
                            to_delete: false,
                            old_value: None,
                        }),
                        UpdateOutcome::Write(value) => {
                            self.check_value_length(&value)?;
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
            VerifierNode::Internal(r) => {
                if self.next_direction_is_left()? {
                    let step = self.modify_helper(&r.left, operation)?;
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
                        let new_left = Self::require_internal(&step.node)?;
                        let rotated = if new_left.balance < 0 {
                            // single right rotation
                            let new_r =
                                Self::internal(Rc::clone(&new_left.right), Rc::clone(&r.right), 0);
                            Self::internal(Rc::clone(&new_left.left), new_r, 0)
                        } else {
                            // left-right double rotation
                            let grand = Self::require_internal(&new_left.right)?;
                            let (left_balance, right_balance) =
                                double_rotation_balances(grand.balance);
                            let new_l = Self::internal(
                                Rc::clone(&new_left.left),
                                Rc::clone(&grand.left),
                                left_balance,
                            );
                            let new_r = Self::internal(
                                Rc::clone(&grand.right),
                                Rc::clone(&r.right),
                                right_balance,
                            );
                            Self::internal(new_l, new_r, 0)
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
                            node: Self::internal(step.node, Rc::clone(&r.right), balance),
                            changed: true,
                            height_increased: grown,
                            to_delete: false,
                            old_value: step.old_value,
                        })
                    }
                } else {
                    let step = self.modify_helper(&r.right, operation)?;
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
                        let new_right = Self::require_internal(&step.node)?;
                        let rotated = if new_right.balance > 0 {
                            // single left rotation
                            let new_l =
                                Self::internal(Rc::clone(&r.left), Rc::clone(&new_right.left), 0);
                            Self::internal(new_l, Rc::clone(&new_right.right), 0)
                        } else {
                            // right-left double rotation
                            let grand = Self::require_internal(&new_right.left)?;
                            let (left_balance, right_balance) =
                                double_rotation_balances(grand.balance);
                            let new_l = Self::internal(
                                Rc::clone(&r.left),
                                Rc::clone(&grand.left),
                                left_balance,
                            );
                            let new_r = Self::internal(
                                Rc::clone(&grand.right),
                                Rc::clone(&new_right.right),
                                right_balance,
                            );
                            Self::internal(new_l, new_r, 0)
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
                            node: Self::internal(Rc::clone(&r.left), step.node, balance),
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

    // --- deletion replay --------------------------------------------------

    /// Mirror of the prover's deletion pass, driven purely by the recorded
    /// bits. Any structure the rotation or splice needs that the proof left
    /// opaque fails the replay.
    fn delete_helper(
        &mut self,
        node: &Rc<VerifierNode>,
        delete_max: bool,
    ) -> Result<(Rc<VerifierNode>, bool), VerifierError> {
        let r = Self::require_internal(node)?;
        let direction = if delete_max {
            1
        } else {
            self.replay_comparison()?
        };

        if direction >= 0 {
            if let Some(right_leaf) = r.right.as_leaf() {
                if delete_max {
                    self.saved_leaf = Some((right_leaf.key.clone(), right_leaf.value.clone()));
                    return Ok((Rc::clone(&r.left), true));
                }
                if direction != 0 {
                    return Err(VerifierError::ModificationInapplicable(
                        "deletion replay overran the recorded descent",
                    ));
                }
                let new_left = self
                    .change_next_leaf_key_of_max_node(&r.left, right_leaf.next_leaf_key.clone())?;
                return Ok((new_left, true));
            }
        }

        if direction == 0 {
            if let Some(left_leaf) = r.left.as_leaf() {
                let new_right = self.change_key_and_value_of_min_node(
                    &r.right,
                    left_leaf.key.clone(),
                    left_leaf.value.clone(),
                )?;
                return Ok((new_right, true));
            }
            let (new_left, left_shrank) = self.delete_helper(&r.left, true)?;
            let (predecessor_key, predecessor_value) = self.saved_leaf.take().ok_or(
                VerifierError::ModificationInapplicable("deletion replay lost its predecessor"),
            )?;
            let new_right = self.change_key_and_value_of_min_node(
                &r.right,
                predecessor_key,
                predecessor_value,
            )?;
            return if left_shrank {
                self.rebalance_after_left_shrink(r.balance, new_left, &new_right)
            } else {
                Ok((Self::internal(new_left, new_right, r.balance), false))
            };
        }

        if direction < 0 {
            let (new_left, shrank) = self.delete_helper(&r.left, false)?;
            if shrank {
                self.rebalance_after_left_shrink(r.balance, new_left, &r.right)
            } else {
                Ok((
                    Self::internal(new_left, Rc::clone(&r.right), r.balance),
                    false,
                ))
            }
        } else {
            let (new_right, shrank) = self.delete_helper(&r.right, delete_max)?;
            if shrank {
                self.rebalance_after_right_shrink(r.balance, &r.left, new_right)
            } else {
                Ok((
                    Self::internal(Rc::clone(&r.left), new_right, r.balance),
                    false,
                ))
            }
        }
    }

    fn change_next_leaf_key_of_max_node(
        &mut self,
        node: &Rc<VerifierNode>,
        next_leaf_key: AdKey,
    ) -> Result<Rc<VerifierNode>, VerifierError> {
        match node.as_ref() {
            VerifierNode::LabelOnly(_) => Err(VerifierError::ModificationInapplicable(
                "predecessor spine is opaque in the proof",
            )),
            VerifierNode::Leaf(leaf) => Ok(Rc::new(VerifierNode::Leaf(VerifierLeaf::new(
                leaf.key.clone(),
                leaf.value.clone(),
                next_leaf_key,
            )))),
            VerifierNode::Internal(r) => {
                let new_right = self.change_next_leaf_key_of_max_node(&r.right, next_leaf_key)?;
                Ok(Self::internal(Rc::clone(&r.left), new_right, r.balance))
            }
        }
    }

    fn change_key_and_value_of_min_node(
        &mut self,
        node: &Rc<VerifierNode>,
        key: AdKey,
        value: AdValue,
    ) -> Result<Rc<VerifierNode>, VerifierError> {
        match node.as_ref() {
            VerifierNode::LabelOnly(_) => Err(VerifierError::ModificationInapplicable(
                "successor spine is opaque in the proof",
            )),
            VerifierNode::Leaf(leaf) => Ok(Rc::new(VerifierNode::Leaf(VerifierLeaf::new(
                key,
                value,
                leaf.next_leaf_key.clone(),
            )))),
            VerifierNode::Internal(r) => {
                let new_left = self.change_key_and_value_of_min_node(&r.left, key, value)?;
                Ok(Self::internal(new_left, Rc::clone(&r.right), r.balance))
            }
        }
    }

    fn rebalance_after_left_shrink(
        &mut self,
        balance: Balance,
        new_left: Rc<VerifierNode>,
        right: &Rc<VerifierNode>,
    ) -> Result<(Rc<VerifierNode>, bool), VerifierError> {
        match balance {
            -1 => Ok((Self::internal(new_left, Rc::clone(right), 0), true)),
            0 => Ok((Self::internal(new_left, Rc::clone(right), 1), false)),
            _ => {
                let sibling = Self::require_internal(right)?;
                if sibling.balance == 0 {
                    let new_l = Self::internal(new_left, Rc::clone(&sibling.left), 1);
                    Ok((Self::internal(new_l, Rc::clone(&sibling.right), -1), false))
                } else if sibling.balance > 0 {
                    let new_l = Self::internal(new_left, Rc::clone(&sibling.left), 0);
                    Ok((Self::internal(new_l, Rc::clone(&sibling.right), 0), true))
                } else {
                    let grand = Self::require_internal(&sibling.left)?;
                    let (left_balance, right_balance) = double_rotation_balances(grand.balance);
                    let new_l = Self::internal(new_left, Rc::clone(&grand.left), left_balance);
                    let new_r = Self::internal(
                        Rc::clone(&grand.right),
                        Rc::clone(&sibling.right),
                        right_balance,
                    );
                    Ok((Self::internal(new_l, new_r, 0), true))
                }
            }
        }
    }

    fn rebalance_after_right_shrink(
        &mut self,
        balance: Balance,
        left: &Rc<VerifierNode>,
        new_right: Rc<VerifierNode>,
    ) -> Result<(Rc<VerifierNode>, bool), VerifierError> {
        match balance {
            1 => Ok((Self::internal(Rc::clone(left), new_right, 0), true)),
            0 => Ok((Self::internal(Rc::clone(left), new_right, -1), false)),
            _ => {
                let sibling = Self::require_internal(left)?;
                if sibling.balance == 0 {
                    let new_r = Self::internal(Rc::clone(&sibling.right), new_right, -1);
                    Ok((Self::internal(Rc::clone(&sibling.left), new_r, 1), false))
                } else if sibling.balance < 0 {
                    let new_r = Self::internal(Rc::clone(&sibling.right), new_right, 0);
                    Ok((Self::internal(Rc::clone(&sibling.left), new_r, 0), true))
                } else {
                    let grand = Self::require_internal(&sibling.right)?;
                    let (left_balance, right_balance) = double_rotation_balances(grand.balance);
                    let new_l = Self::internal(
                        Rc::clone(&sibling.left),
                        Rc::clone(&grand.left),
                        left_balance,
                    );
                    let new_r = Self::internal(Rc::clone(&grand.right), new_right, right_balance);
                    Ok((Self::internal(new_l, new_r, 0), true))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher;

    const KL: usize = 4;
    const VL: usize = 2;

    fn digest_for(label: Label, height: NodeHeight) -> AdDigest {
        AdDigest::new(&label, height)
    }

    /// A proof carrying a single opaque root reconstructs any tree whose
    /// label it matches.
    #[test]
    fn single_label_proof_reconstructs() {
        let label = [7u8; DIGEST_LENGTH];
        let mut proof = vec![LABEL_IN_PROOF];
        proof.extend_from_slice(&label);
        proof.push(END_OF_TREE_IN_PROOF);

        let digest = digest_for(label, 3);
        let verifier = BatchAvlVerifier::new(
            &digest,
            SerializedProof(proof.clone()),
            KL,
            VL,
            Some(0),
            Some(0),
        )
        .unwrap();
        assert_eq!(verifier.digest(), Some(digest));

        // the same proof against a different starting digest must fail
        let wrong = digest_for([8u8; DIGEST_LENGTH], 3);
        assert_eq!(
            BatchAvlVerifier::new(&wrong, SerializedProof(proof), KL, VL, None, None).err(),
            Some(VerifierError::DigestMismatch)
        );
    }

    /// A skeleton of one leaf plus an opaque sibling reduces under an
    /// internal token to the label both sides compute.
    #[test]
    fn leaf_and_label_combine() {
        let key = [0u8; 4];
        let next = [9u8; 4];
        let value = [1u8; 2];
        let leaf_label = hasher::leaf_label(&key, &value, &next);
        let sibling = [3u8; DIGEST_LENGTH];
        let root_label = hasher::internal_label(-1, &leaf_label, &sibling);

        let mut proof = vec![LEAF_IN_PROOF];
        proof.extend_from_slice(&key);
        proof.extend_from_slice(&next);
        proof.extend_from_slice(&value);
        proof.push(LABEL_IN_PROOF);
        proof.extend_from_slice(&sibling);
        proof.push(0xFF); // internal, balance -1
        proof.push(END_OF_TREE_IN_PROOF);

        let digest = digest_for(root_label, 1);
        let verifier =
            BatchAvlVerifier::new(&digest, SerializedProof(proof), KL, VL, None, None).unwrap();
        assert_eq!(verifier.digest(), Some(digest));
    }

    #[test]
    fn malformed_skeletons_are_rejected() {
        let digest = digest_for([0u8; DIGEST_LENGTH], 0);
        let check = |bytes: Vec<u8>, expected: &'static str| {
            match BatchAvlVerifier::new(&digest, SerializedProof(bytes), KL, VL, None, None) {
                Err(VerifierError::ProofMalformed(reason)) => assert_eq!(reason, expected),
                other => panic!("expected ProofMalformed({expected}), got {other:?}"),
            }
        };

        check(vec![], "skeleton has no terminator");
        check(vec![END_OF_TREE_IN_PROOF], "empty skeleton");
        check(vec![0x00], "stack underflow");
        check(vec![0xAB], "unknown skeleton token");
        check(vec![LABEL_IN_PROOF, 1, 2, 3], "truncated label");
        check(vec![LEAF_IN_PROOF, 1, 2], "truncated leaf key");

        // two pushes and no combine leave an extra node on the stack
        let mut two_labels = vec![LABEL_IN_PROOF];
        two_labels.extend_from_slice(&[0u8; DIGEST_LENGTH]);
        two_labels.push(LABEL_IN_PROOF);
        two_labels.extend_from_slice(&[0u8; DIGEST_LENGTH]);
        two_labels.push(END_OF_TREE_IN_PROOF);
        check(two_labels, "unconsumed skeleton nodes");
    }

    /// The envelope bound rejects oversized skeletons before hashing.
    #[test]
    fn envelope_bound_rejects_long_proofs() {
        // height 0 and an empty envelope admit exactly one node
        let digest = digest_for([0u8; DIGEST_LENGTH], 0);
        let mut proof = Vec::new();
        for _ in 0..2 {
            proof.push(LABEL_IN_PROOF);
            proof.extend_from_slice(&[0u8; DIGEST_LENGTH]);
        }
        proof.push(0x00);
        proof.push(END_OF_TREE_IN_PROOF);

        match BatchAvlVerifier::new(
            &digest,
            SerializedProof(proof.clone()),
            KL,
            VL,
            Some(0),
            Some(0),
        ) {
            Err(VerifierError::ProofTooLong { nodes, max }) => {
                assert_eq!(max, 1);
                assert!(nodes > max);
            }
            other => panic!("expected ProofTooLong, got {other:?}"),
        }

        // without a declared envelope the same skeleton only fails the
        // digest comparison
        assert_eq!(
            BatchAvlVerifier::new(&digest, SerializedProof(proof), KL, VL, None, None).err(),
            Some(VerifierError::DigestMismatch)
        );
    }

    #[test]
    fn envelope_node_cap_grows_with_height_and_deletes() {
        assert_eq!(BatchAvlVerifier::max_skeleton_nodes(5, None, None), None);
        // a partial envelope leaves one class unbounded: no finite cap
        assert_eq!(BatchAvlVerifier::max_skeleton_nodes(5, Some(1), None), None);
        assert_eq!(BatchAvlVerifier::max_skeleton_nodes(5, None, Some(1)), None);
        assert_eq!(
            BatchAvlVerifier::max_skeleton_nodes(0, Some(0), Some(0)),
            Some(1)
        );
        let shallow = BatchAvlVerifier::max_skeleton_nodes(4, Some(8), Some(0)).unwrap();
        let deep = BatchAvlVerifier::max_skeleton_nodes(10, Some(8), Some(0)).unwrap();
        assert!(deep > shallow);
        let with_deletes = BatchAvlVerifier::max_skeleton_nodes(4, Some(4), Some(4)).unwrap();
        assert!(with_deletes > shallow);
        assert!(with_deletes > BatchAvlVerifier::max_skeleton_nodes(4, Some(4), Some(0)).unwrap());
    }
}
