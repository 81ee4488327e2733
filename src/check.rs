//! Whole-tree validation used by tests: structural invariants, plus the
//! hygiene property that a quiet tree carries no claim flags and no markers.

use std::sync::atomic::Ordering;

use crate::node::{Color, Dir, NodeRef, NO_OWNER};

/// Asserts every structural invariant below `anchor` and returns the number
/// of keys reachable: parent backrefs are consistent, keys sort in order
/// with duplicates to the right, the root is black, no red node has a red
/// child, and every path to a sentinel crosses the same number of blacks.
pub(crate) fn verify_structure<K: Ord>(anchor: NodeRef<K>) -> usize {
    let root = anchor.child(Dir::Left);
    assert!(
        root.parent() == anchor,
        "the root must point back at the anchor"
    );
    if root.is_leaf() {
        return 0;
    }
    assert!(root.color() == Color::Black, "the root must be black");
    let mut count = 0;
    verify_subtree(root, anchor, None, None, &mut count);
    count
}

fn verify_subtree<K: Ord>(
    node: NodeRef<K>,
    parent: NodeRef<K>,
    lower: Option<&K>,
    upper: Option<&K>,
    count: &mut usize,
) -> usize {
    assert!(
        node.parent() == parent,
        "every child must point back at its parent"
    );
    if node.is_leaf() {
        assert!(node.color() == Color::Black, "sentinels are black");
        return 1;
    }
    *count = count.saturating_add(1);

    let key = node.key();
    if let Some(low) = lower {
        assert!(key >= low, "keys in a right subtree sort after the fork");
    }
    if let Some(high) = upper {
        assert!(key < high, "keys in a left subtree sort before the fork");
    }

    if node.color() == Color::Red {
        assert!(
            node.child(Dir::Left).color() == Color::Black
                && node.child(Dir::Right).color() == Color::Black,
            "a red node cannot have a red child"
        );
    }

    let left = verify_subtree(node.child(Dir::Left), node, lower, Some(key), count);
    let right = verify_subtree(node.child(Dir::Right), node, Some(key), upper, count);
    assert_eq!(left, right, "every path must cross the same number of blacks");

    left.saturating_add(usize::from(node.color() == Color::Black))
}

/// Asserts that nothing reachable carries a claim flag or a marker. Holds
/// at any point where no operation is in flight.
pub(crate) fn verify_quiescent<K>(anchor: NodeRef<K>) {
    quiet(anchor);
    quiet(anchor.child(Dir::Right));
    quiet_subtree(anchor.child(Dir::Left));
}

fn quiet_subtree<K>(node: NodeRef<K>) {
    quiet(node);
    if !node.is_leaf() {
        quiet_subtree(node.child(Dir::Left));
        quiet_subtree(node.child(Dir::Right));
    }
}

fn quiet<K>(node: NodeRef<K>) {
    assert!(
        !node.flag.load(Ordering::Acquire),
        "a quiet tree holds no claim flags"
    );
    assert_eq!(node.marker(), NO_OWNER, "a quiet tree holds no markers");
}

/// Clones every key in order, for comparison against reference collections.
pub(crate) fn collect_sorted<K: Clone>(anchor: NodeRef<K>) -> Vec<K> {
    let mut out = Vec::new();
    fill(anchor.child(Dir::Left), &mut out);
    out
}

fn fill<K: Clone>(node: NodeRef<K>, out: &mut Vec<K>) {
    if node.is_leaf() {
        return;
    }
    fill(node.child(Dir::Left), out);
    out.push(node.key().clone());
    fill(node.child(Dir::Right), out);
}
