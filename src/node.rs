use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};

/// Marker value meaning "no worker has reserved this node".
pub(crate) const NO_OWNER: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Color {
    Red,
    Black,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dir {
    Left,
    Right,
}

impl Dir {
    pub(crate) const fn opposite(self) -> Dir {
        match self {
            Dir::Left => Dir::Right,
            Dir::Right => Dir::Left,
        }
    }
}

/// A tree node. Every field that participates in the protocol is atomic:
/// `flag` is the claim bit, `marker` the advisory reservation, and the three
/// links are only rewritten by a claimant of the nodes whose shape changes.
///
/// The key slot is written exactly once, when a leaf sentinel is promoted to
/// a real node under its claim flag, and rewritten only by a two-child
/// delete that holds the node claimed. `leaf` doubles as the key-present
/// bit: sentinels and the anchor never carry a key.
pub(crate) struct Node<K> {
    key: UnsafeCell<MaybeUninit<K>>,
    leaf: AtomicBool,
    retired: AtomicBool,
    color: AtomicU8,
    pub(crate) flag: AtomicBool,
    marker: AtomicUsize,
    parent: AtomicPtr<Node<K>>,
    left: AtomicPtr<Node<K>>,
    right: AtomicPtr<Node<K>>,
}

impl<K> Drop for Node<K> {
    fn drop(&mut self) {
        if !*self.leaf.get_mut() {
            unsafe {
                self.key.get_mut().assume_init_drop();
            }
        }
    }
}

impl<K> Node<K> {
    /// A fresh black leaf sentinel. Links are wired by the caller.
    pub(crate) fn sentinel() -> Box<Node<K>> {
        Box::new(Node {
            key: UnsafeCell::new(MaybeUninit::uninit()),
            leaf: AtomicBool::new(true),
            retired: AtomicBool::new(false),
            color: AtomicU8::new(Color::Black as u8),
            flag: AtomicBool::new(false),
            marker: AtomicUsize::new(NO_OWNER),
            parent: AtomicPtr::new(std::ptr::null_mut()),
            left: AtomicPtr::new(std::ptr::null_mut()),
            right: AtomicPtr::new(std::ptr::null_mut()),
        })
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.leaf.load(Ordering::Acquire)
    }

    pub(crate) fn color(&self) -> Color {
        if self.color.load(Ordering::Acquire) == Color::Red as u8 {
            Color::Red
        } else {
            Color::Black
        }
    }

    pub(crate) fn set_color(&self, color: Color) {
        self.color.store(color as u8, Ordering::Release);
    }

    pub(crate) fn marker(&self) -> usize {
        self.marker.load(Ordering::Acquire)
    }

    pub(crate) fn set_marker(&self, owner: usize) {
        self.marker.store(owner, Ordering::Release);
    }

    pub(crate) fn key(&self) -> &K {
        assert!(!self.is_leaf(), "sentinel nodes carry no key");
        unsafe { (*self.key.get()).assume_init_ref() }
    }

    /// Overwrites the key of a real node. Used when a two-child delete moves
    /// the successor's key into the doomed node's position. The caller must
    /// hold this node's claim flag.
    pub(crate) fn replace_key(&self, key: K) {
        assert!(!self.is_leaf(), "only real nodes hold a key to replace");
        unsafe {
            let slot = &mut *self.key.get();
            slot.assume_init_drop();
            slot.write(key);
        }
    }
}

/// A shared view of a node. Nodes are only reclaimed through epoch-based
/// deferral, and every `NodeRef` is derived while the owning operation holds
/// a pinned guard, so dereferencing is sound for the life of the operation.
pub(crate) struct NodeRef<K>(NonNull<Node<K>>);

impl<K> Clone for NodeRef<K> {
    fn clone(&self) -> NodeRef<K> {
        *self
    }
}

impl<K> Copy for NodeRef<K> {}

impl<K> PartialEq for NodeRef<K> {
    fn eq(&self, other: &NodeRef<K>) -> bool {
        self.0 == other.0
    }
}

impl<K> Eq for NodeRef<K> {}

unsafe impl<K: Send> Send for NodeRef<K> {}
unsafe impl<K: Send + Sync> Sync for NodeRef<K> {}

impl<K> fmt::Debug for NodeRef<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeRef").field(&self.0).finish()
    }
}

impl<K> Deref for NodeRef<K> {
    type Target = Node<K>;

    fn deref(&self) -> &Node<K> {
        unsafe { self.0.as_ref() }
    }
}

impl<K> NodeRef<K> {
    pub(crate) fn from_owned(node: Box<Node<K>>) -> NodeRef<K> {
        NodeRef(NonNull::from(Box::leak(node)))
    }

    pub(crate) fn as_ptr(self) -> *mut Node<K> {
        self.0.as_ptr()
    }

    pub(crate) fn parent(self) -> NodeRef<K> {
        let ptr = self.parent.load(Ordering::Acquire);
        assert!(!ptr.is_null(), "parent link read before the node was wired");
        NodeRef(unsafe { NonNull::new_unchecked(ptr) })
    }

    pub(crate) fn child(self, dir: Dir) -> NodeRef<K> {
        let slot = match dir {
            Dir::Left => &self.left,
            Dir::Right => &self.right,
        };
        let ptr = slot.load(Ordering::Acquire);
        assert!(!ptr.is_null(), "leaf sentinels have no children");
        NodeRef(unsafe { NonNull::new_unchecked(ptr) })
    }

    pub(crate) fn set_parent(self, to: NodeRef<K>) {
        self.parent.store(to.as_ptr(), Ordering::Release);
    }

    pub(crate) fn set_child(self, dir: Dir, to: NodeRef<K>) {
        let slot = match dir {
            Dir::Left => &self.left,
            Dir::Right => &self.right,
        };
        slot.store(to.as_ptr(), Ordering::Release);
    }

    /// Which side of `self` the given child hangs from.
    pub(crate) fn dir_of(self, child: NodeRef<K>) -> Dir {
        if self.child(Dir::Left) == child {
            Dir::Left
        } else {
            assert!(
                self.child(Dir::Right) == child,
                "node is not a child of its supposed parent"
            );
            Dir::Right
        }
    }

    pub(crate) fn other_child(self, one: NodeRef<K>) -> NodeRef<K> {
        self.child(self.dir_of(one).opposite())
    }

    /// Promotes a claimed leaf sentinel into a real red node in place. The
    /// parent's child pointer never moves, which is what lets an insert get
    /// away without restructuring the neighborhood.
    pub(crate) fn promote(self, key: K, left: NodeRef<K>, right: NodeRef<K>) {
        assert!(self.is_leaf(), "only a leaf sentinel can be promoted");
        unsafe {
            (*self.key.get()).write(key);
        }
        left.set_parent(self);
        right.set_parent(self);
        self.set_child(Dir::Left, left);
        self.set_child(Dir::Right, right);
        self.set_color(Color::Red);
        self.leaf.store(false, Ordering::Release);
    }

    /// Tombstones an unlinked node. The self-parent marks it as out of the
    /// tree, and the claim flag stays set forever so any stale claimant
    /// fails out and re-finds its position from the root.
    pub(crate) fn retire(self) {
        self.set_parent(self);
        self.retired.store(true, Ordering::Release);
    }

    pub(crate) fn is_retired(self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

/// Rotates the child of `node` on the side away from `dir` up into `node`'s
/// place, returning the raised child. `dir` is the direction `node` itself
/// moves: `rotate(node, Dir::Left)` is a classical left-rotation.
///
/// The caller must hold the claim flags of `node`, the raised child, and
/// `node`'s parent. The transplanted grandchild's parent backref is rewritten
/// without its flag; any concurrent claimant of that node validates its
/// parent link after acquiring and restarts on a mismatch, so the stale read
/// costs it only a retry.
pub(crate) fn rotate<K>(node: NodeRef<K>, dir: Dir) -> NodeRef<K> {
    let raised = node.child(dir.opposite());
    assert!(!raised.is_leaf(), "only a real child can be rotated up");
    let parent = node.parent();
    let transplant = raised.child(dir);

    node.set_child(dir.opposite(), transplant);
    transplant.set_parent(node);

    parent.set_child(parent.dir_of(node), raised);
    raised.set_parent(parent);

    raised.set_child(dir, node);
    node.set_parent(raised);

    raised
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_tree() -> (NodeRef<u64>, NodeRef<u64>) {
        // anchor whose left child is a promoted root with two leaf children
        let anchor = NodeRef::from_owned(Node::sentinel());
        anchor.set_parent(anchor);
        let root = NodeRef::from_owned(Node::sentinel());
        let spare = NodeRef::from_owned(Node::sentinel());
        root.set_parent(anchor);
        spare.set_parent(anchor);
        anchor.set_child(Dir::Left, root);
        anchor.set_child(Dir::Right, spare);
        root.promote(
            10,
            NodeRef::from_owned(Node::sentinel()),
            NodeRef::from_owned(Node::sentinel()),
        );
        (anchor, root)
    }

    fn free(tree: NodeRef<u64>) {
        if !tree.is_leaf() {
            free(tree.child(Dir::Left));
            free(tree.child(Dir::Right));
        }
        drop(unsafe { Box::from_raw(tree.as_ptr()) });
    }

    #[test]
    fn rotation_reshapes_and_preserves_links() {
        let (anchor, root) = tiny_tree();
        let right = root.child(Dir::Right);
        right.promote(
            20,
            NodeRef::from_owned(Node::sentinel()),
            NodeRef::from_owned(Node::sentinel()),
        );
        let transplant = right.child(Dir::Left);

        let raised = rotate(root, Dir::Left);

        assert_eq!(raised, right);
        assert_eq!(anchor.child(Dir::Left), right);
        assert_eq!(right.parent(), anchor);
        assert_eq!(right.child(Dir::Left), root);
        assert_eq!(root.parent(), right);
        assert_eq!(root.child(Dir::Right), transplant);
        assert_eq!(transplant.parent(), root);

        free(anchor.child(Dir::Left));
        free(anchor.child(Dir::Right));
        drop(unsafe { Box::from_raw(anchor.as_ptr()) });
    }

    #[test]
    fn promotion_turns_a_sentinel_real() {
        let (anchor, root) = tiny_tree();
        assert!(!root.is_leaf());
        assert_eq!(*root.key(), 10);
        assert_eq!(root.color(), Color::Red);
        assert!(root.child(Dir::Left).is_leaf());
        assert!(root.child(Dir::Right).is_leaf());

        free(anchor.child(Dir::Left));
        free(anchor.child(Dir::Right));
        drop(unsafe { Box::from_raw(anchor.as_ptr()) });
    }
}
