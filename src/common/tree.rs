//! DHT routing using a binary prefix tree and no buckets.
//!
//! Nodes have ids of 20 bytes. The distance between a node and an infohash
//! is the XOR of the respective byte strings, which means sorting nodes only
//! makes sense with an infohash as the pivot.
//!
//! All nodes are inserted into a binary tree with a nominal height of 160,
//! one edge per id bit from most to least significant. To look up an
//! infohash the traversal is in-order, guided by the infohash bit at each
//! level: the matching child first, then the other, collecting up to the 8
//! closest nodes.
//!
//! The tree is path compressed: a leaf may sit above its full depth while no
//! sibling exists, and is branched out when a colliding insert arrives.

use crate::common::{Id, KNODES, MAX_COMMON_BITS};

/// A back-reference to a routing table entry. The address is the canonical
/// "ip:port" key into the owning address index; holders re-validate against
/// that index instead of keeping pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    pub id: Id,
    pub addr: String,
}

#[derive(Debug, Default)]
pub struct Tree {
    zero: Option<Box<Tree>>,
    one: Option<Box<Tree>>,
    leaf: Option<NodeRef>,
}

impl Tree {
    pub fn insert(&mut self, node: NodeRef) {
        self.put(node, 0);
    }

    fn put(&mut self, node: NodeRef, i: usize) {
        if i >= MAX_COMMON_BITS {
            self.leaf = Some(node);
            return;
        }

        if let Some(existing) = self.leaf.take() {
            if existing.id == node.id {
                // Replace the existing compressed value.
                self.leaf = Some(node);
                return;
            }
            // Compression collision. Branch them out.
            self.branch_out(node, existing, i);
            return;
        }

        let child = if node.id.bit(i) {
            &mut self.one
        } else {
            &mut self.zero
        };
        match child {
            Some(subtree) => subtree.put(node, i + 1),
            None => {
                *child = Some(Box::new(Tree {
                    leaf: Some(node),
                    ..Tree::default()
                }));
            }
        }
    }

    // Since the two nodes are branching out it's guaranteed that nothing
    // else exists below this branch, so subtrees are created until their
    // respective bits differ.
    fn branch_out(&mut self, a: NodeRef, b: NodeRef, i: usize) {
        if a.id.bit(i) != b.id.bit(i) {
            self.put(a, i);
            self.put(b, i);
            return;
        }

        let child = if a.id.bit(i) {
            &mut self.one
        } else {
            &mut self.zero
        };
        child
            .get_or_insert_with(Default::default)
            .branch_out(a, b, i + 1);
    }

    /// Up to [KNODES] nodes closest to `target` by XOR distance.
    pub fn lookup(&self, target: &Id) -> Vec<NodeRef> {
        let mut found = Vec::with_capacity(KNODES);
        self.traverse(target, 0, &mut found, None);
        found
    }

    /// Same as [Tree::lookup], but leaves failing the `keep` predicate are
    /// skipped. Used to pick recipients for new queries.
    pub fn lookup_filtered(&self, target: &Id, keep: &dyn Fn(&NodeRef) -> bool) -> Vec<NodeRef> {
        let mut found = Vec::with_capacity(KNODES);
        self.traverse(target, 0, &mut found, Some(keep));
        found
    }

    fn traverse(
        &self,
        target: &Id,
        i: usize,
        found: &mut Vec<NodeRef>,
        keep: Option<&dyn Fn(&NodeRef) -> bool>,
    ) {
        if let Some(leaf) = &self.leaf {
            if keep.map_or(true, |keep| keep(leaf)) {
                found.push(leaf.clone());
            }
            return;
        }
        if i >= MAX_COMMON_BITS || found.len() >= KNODES {
            return;
        }

        let (closer, farther) = if target.bit(i) {
            (&self.one, &self.zero)
        } else {
            (&self.zero, &self.one)
        };

        if let Some(subtree) = closer {
            subtree.traverse(target, i + 1, found, keep);
        }
        if found.len() >= KNODES {
            return;
        }
        if let Some(subtree) = farther {
            subtree.traverse(target, i + 1, found, keep);
        }
    }

    /// Goes down the path of `id` and deletes subtrees whose leaves all
    /// became empty. Returns true when this subtree itself became empty.
    pub fn cut(&mut self, id: &Id, i: usize) -> bool {
        if i >= MAX_COMMON_BITS {
            return true;
        }

        if id.bit(i) {
            if self.one.as_mut().map_or(true, |t| t.cut(id, i + 1)) {
                self.one = None;
                if self.zero.is_none() {
                    return true;
                }
            }
        } else if self.zero.as_mut().map_or(true, |t| t.cut(id, i + 1)) {
            self.zero = None;
            if self.one.is_none() {
                return true;
            }
        }

        false
    }
}
