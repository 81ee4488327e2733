//! Claimed descent. Every walk holds at most two flags at a time and moves
//! hand over hand: claim the child, then let go of the node above. An edge
//! read under its parent's flag cannot move, so descent needs no
//! revalidation, only the willingness to start over when a claim fails.

use crate::claim;
use crate::node::{Dir, NodeRef};
use crate::Retry;

/// Walks from the anchor to the first node matching `key`, returning it
/// still claimed, or `None` if the key is absent. Any contention unwinds to
/// a [`Retry`] for the caller's outer loop.
pub(crate) fn find_claimed<K: Ord>(
    anchor: NodeRef<K>,
    key: &K,
) -> Result<Option<NodeRef<K>>, Retry> {
    if !claim::try_acquire(anchor) {
        return Err(Retry);
    }
    let mut cur = anchor.child(Dir::Left);
    if !claim::try_acquire(cur) {
        claim::release(anchor);
        return Err(Retry);
    }
    claim::release(anchor);

    loop {
        if cur.is_leaf() {
            claim::release(cur);
            return Ok(None);
        }
        let dir = match key.cmp(cur.key()) {
            std::cmp::Ordering::Equal => return Ok(Some(cur)),
            std::cmp::Ordering::Less => Dir::Left,
            std::cmp::Ordering::Greater => Dir::Right,
        };
        let next = cur.child(dir);
        if !claim::try_acquire(next) {
            claim::release(cur);
            return Err(Retry);
        }
        claim::release(cur);
        cur = next;
    }
}

/// The claimed neighborhood of an insertion point: the leaf sentinel to
/// promote, its parent (the anchor when the tree is empty), and the parent's
/// other child. Holding the third flag keeps any other operation from
/// starting a fix-up against the new node's first-round neighborhood before
/// the inserter does.
pub(crate) struct InsertSpot<K> {
    pub(crate) target: NodeRef<K>,
    pub(crate) parent: NodeRef<K>,
    pub(crate) sibling: NodeRef<K>,
}

/// Walks to the sentinel where `key` belongs and claims the insertion
/// neighborhood. Keys equal to a node on the path descend right, so repeated
/// inserts of one key build up distinct nodes.
pub(crate) fn find_slot<K: Ord>(anchor: NodeRef<K>, key: &K) -> Result<InsertSpot<K>, Retry> {
    if !claim::try_acquire(anchor) {
        return Err(Retry);
    }
    let mut parent = anchor;
    let mut cur = anchor.child(Dir::Left);
    if !claim::try_acquire(cur) {
        claim::release(parent);
        return Err(Retry);
    }

    while !cur.is_leaf() {
        let dir = if *key < *cur.key() {
            Dir::Left
        } else {
            Dir::Right
        };
        let next = cur.child(dir);
        if !claim::try_acquire(next) {
            claim::release(cur);
            claim::release(parent);
            return Err(Retry);
        }
        claim::release(parent);
        parent = cur;
        cur = next;
    }

    let sibling = parent.other_child(cur);
    if !claim::try_acquire(sibling) {
        claim::release(cur);
        claim::release(parent);
        return Err(Retry);
    }
    Ok(InsertSpot {
        target: cur,
        parent,
        sibling,
    })
}

/// Claims the in-order successor of `z`, which must itself be claimed and
/// have two real children. Only `z` and the returned node are held on exit.
pub(crate) fn claim_successor<K>(z: NodeRef<K>) -> Result<NodeRef<K>, Retry> {
    let mut cur = z.child(Dir::Right);
    if !claim::try_acquire(cur) {
        return Err(Retry);
    }
    loop {
        let next = cur.child(Dir::Left);
        if next.is_leaf() {
            return Ok(cur);
        }
        if !claim::try_acquire(next) {
            claim::release(cur);
            return Err(Retry);
        }
        claim::release(cur);
        cur = next;
    }
}
