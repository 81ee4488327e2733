#![cfg_attr(
    test,
    deny(
        missing_docs,
        future_incompatible,
        nonstandard_style,
        rust_2018_idioms,
        missing_copy_implementations,
        trivial_casts,
        trivial_numeric_casts,
        unused_qualifications,
    )
)]
#![cfg_attr(test, deny(
    clippy::cast_lossless,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::decimal_literal_representation,
    clippy::doc_markdown,
    // clippy::else_if_without_else,
    clippy::empty_enum,
    clippy::explicit_into_iter_loop,
    clippy::explicit_iter_loop,
    clippy::expl_impl_clone_on_copy,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_arithmetic,
    clippy::get_unwrap,
    clippy::if_not_else,
    clippy::indexing_slicing,
    clippy::inline_always,
    clippy::integer_arithmetic,
    clippy::invalid_upcast_comparisons,
    clippy::items_after_statements,
    clippy::manual_find_map,
    clippy::map_entry,
    clippy::map_flatten,
    clippy::match_like_matches_macro,
    clippy::match_same_arms,
    clippy::maybe_infinite_iter,
    clippy::mem_forget,
    // clippy::missing_docs_in_private_items,
    clippy::module_name_repetitions,
    clippy::multiple_inherent_impl,
    clippy::mut_mut,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::needless_pass_by_value,
    clippy::non_ascii_literal,
    clippy::path_buf_push_overwrite,
    // clippy::print_stdout,
    clippy::redundant_closure_for_method_calls,
    clippy::shadow_reuse,
    clippy::shadow_same,
    clippy::shadow_unrelated,
    clippy::single_match_else,
    clippy::string_add,
    clippy::string_add_assign,
    clippy::type_repetition_in_bounds,
    clippy::unicode_not_nfc,
    clippy::unimplemented,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding,
    clippy::wildcard_dependencies,
))]
#![cfg_attr(
    test,
    warn(
        clippy::missing_const_for_fn,
        clippy::multiple_crate_versions,
        clippy::wildcard_enum_match_arm,
    )
)]

//! A lock-free red-black tree in the style of Kim, Cameron and Graham,
//! built on per-node claim flags instead of locks.
//!
//! Every mutation claims a small working area of nodes with atomic flags,
//! publishes an intention marker on a short chain of ancestors before
//! restructuring near them, and backs off without blocking whenever it
//! loses a race. Readers claim hand-over-hand along their descent and
//! never wait on a writer above them. Workers whose territories collide
//! hand claimed flags to each other through a per-worker mailbox: a
//! mutation that has not yet changed the tree donates its whole area and
//! retries, while a delete fix-up caught mid-repair parks on the one
//! node whose black count is short, keeping that claim and a marker
//! naming itself until the deficit is paid or handed to the worker it
//! collided with.
//!
//! Each handle owns a protocol identity, so a handle serves one thread:
//! share the tree by cloning it, not by reference. `MAX_WORKERS` bounds
//! how many handles may be live at once, and `LOCAL_GC_BUFFER_SIZE` tunes
//! the granularity of epoch-based memory reclamation.
//!
//! Keys are kept in sorted order with duplicates allowed; removing a key
//! unlinks one occurrence at a time.

#[cfg(not(feature = "fault_injection"))]
#[inline]
const fn debug_delay() -> bool {
    false
}

/// This function is useful for inducing random jitter into
/// our atomic operations, shaking out more possible
/// interleavings quickly. It gets fully eliminated by the
/// compiler in non-test code.
#[cfg(feature = "fault_injection")]
fn debug_delay() -> bool {
    use rand::{thread_rng, Rng};

    let mut rng = thread_rng();

    match rng.gen_range(0..100) {
        0..=98 => false,
        _ => true,
    }
}

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use ebr::Ebr;

mod check;
mod claim;
mod handoff;
mod insert;
mod marker;
mod navigate;
mod node;
mod remove;

use claim::backoff;
use handoff::HandoffTable;
use node::{Dir, Node, NodeRef};

/// An attempt lost a race and unwound itself; the operation starts over.
#[derive(Debug)]
pub(crate) struct Retry;

/// A lock-free red-black tree of keys, with duplicates allowed.
///
/// Writers claim the handful of nodes they need with per-node atomic
/// flags and mark the few ancestors they might rotate near, so operations
/// on distant keys never disturb each other and colliding operations
/// resolve by backing off or handing their claims over, never by
/// blocking.
///
/// A handle carries its own worker identity: clone the tree once per
/// thread. `MAX_WORKERS` caps the number of simultaneously live handles
/// and the `Clone` impl panics beyond it.
///
/// The `LOCAL_GC_BUFFER_SIZE` const generic must be greater than 0. It
/// controls the epoch-based reclamation granularity: unlinked nodes are
/// placed into fixed-size arrays, and garbage collection only happens
/// after an array fills up and a final timestamp is assigned to it. Lower
/// values cause removed nodes to be dropped more quickly, but the
/// efficiency will be lower.
///
/// # Examples
///
/// ```
/// let tree = concurrent_rbtree::RbTree::<usize>::default();
///
/// tree.insert(1);
/// assert!(tree.contains(&1));
///
/// assert!(tree.remove(&1));
/// assert!(!tree.remove(&1));
/// assert!(!tree.contains(&1));
/// ```
pub struct RbTree<K, const MAX_WORKERS: usize = 64, const LOCAL_GC_BUFFER_SIZE: usize = 128>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    // epoch-based reclamation
    ebr: Ebr<Box<Node<K>>, LOCAL_GC_BUFFER_SIZE>,
    // the tree structure, shared between handles
    inner: Arc<Inner<K>>,
    // an eventually consistent, lagging count of the
    // number of keys in this structure.
    len: Arc<AtomicUsize>,
    // this handle's claim and marker identity
    me: usize,
    // one handle serves one thread at a time
    _not_sync: PhantomData<Cell<()>>,
}

impl<K, const MAX_WORKERS: usize, const LOCAL_GC_BUFFER_SIZE: usize> fmt::Debug
    for RbTree<K, MAX_WORKERS, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RbTree").field("len", &self.len()).finish()
    }
}

impl<K, const MAX_WORKERS: usize, const LOCAL_GC_BUFFER_SIZE: usize> Default
    for RbTree<K, MAX_WORKERS, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    fn default() -> RbTree<K, MAX_WORKERS, LOCAL_GC_BUFFER_SIZE> {
        assert!(MAX_WORKERS > 0, "RbTree MAX_WORKERS must be greater than 0");
        assert!(
            LOCAL_GC_BUFFER_SIZE > 0,
            "LOCAL_GC_BUFFER_SIZE must be greater than 0"
        );

        // the anchor sits above the root and is claimed like any node, so
        // operations at the top of the tree need no special cases. Its left
        // child is the root position, its right child a spare sentinel that
        // stands in as the sibling during root-level claims.
        let anchor = NodeRef::from_owned(Node::sentinel());
        let root = NodeRef::from_owned(Node::sentinel());
        let spare = NodeRef::from_owned(Node::sentinel());
        anchor.set_parent(anchor);
        anchor.set_child(Dir::Left, root);
        anchor.set_child(Dir::Right, spare);
        root.set_parent(anchor);
        spare.set_parent(anchor);

        let registry: Vec<AtomicBool> = (0..MAX_WORKERS).map(|_| AtomicBool::new(false)).collect();
        let inner = Arc::new(Inner {
            anchor,
            handoff: HandoffTable::new(MAX_WORKERS),
            registry,
        });

        let me = inner.register().expect("a fresh registry has a free slot");

        RbTree {
            ebr: Ebr::default(),
            inner,
            len: Arc::new(0.into()),
            me,
            _not_sync: PhantomData,
        }
    }
}

impl<K, const MAX_WORKERS: usize, const LOCAL_GC_BUFFER_SIZE: usize> Clone
    for RbTree<K, MAX_WORKERS, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    fn clone(&self) -> RbTree<K, MAX_WORKERS, LOCAL_GC_BUFFER_SIZE> {
        let me = self
            .inner
            .register()
            .expect("more live RbTree handles than MAX_WORKERS");
        RbTree {
            ebr: self.ebr.clone(),
            inner: self.inner.clone(),
            len: self.len.clone(),
            me,
            _not_sync: PhantomData,
        }
    }
}

impl<K, const MAX_WORKERS: usize, const LOCAL_GC_BUFFER_SIZE: usize> Drop
    for RbTree<K, MAX_WORKERS, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    fn drop(&mut self) {
        // a grant parked in this worker's slot holds real flags
        self.inner.handoff.consume(self.me);
        self.inner.unregister(self.me);
    }
}

struct Inner<K>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    anchor: NodeRef<K>,
    handoff: HandoffTable<K>,
    registry: Vec<AtomicBool>,
}

impl<K> Inner<K>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    fn register(&self) -> Option<usize> {
        for (id, slot) in self.registry.iter().enumerate() {
            if slot
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(id);
            }
        }
        None
    }

    fn unregister(&self, me: usize) {
        let slot = self.registry.get(me).expect("worker id out of range");
        slot.store(false, Ordering::Release);
    }
}

impl<K> Drop for Inner<K>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    fn drop(&mut self) {
        let mut stack = vec![
            self.anchor.child(Dir::Left),
            self.anchor.child(Dir::Right),
        ];
        while let Some(node) = stack.pop() {
            if !node.is_leaf() {
                stack.push(node.child(Dir::Left));
                stack.push(node.child(Dir::Right));
            }
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }
        drop(unsafe { Box::from_raw(self.anchor.as_ptr()) });
    }
}

impl<K, const MAX_WORKERS: usize, const LOCAL_GC_BUFFER_SIZE: usize>
    RbTree<K, MAX_WORKERS, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    /// Inserts a key. Duplicates are kept; each insert adds one occurrence.
    ///
    /// # Examples
    /// ```
    /// let tree = concurrent_rbtree::RbTree::<usize>::default();
    ///
    /// tree.insert(7);
    /// tree.insert(7);
    ///
    /// assert_eq!(tree.len(), 2);
    /// ```
    pub fn insert(&self, key: K) {
        let _guard = self.ebr.pin();
        let mut attempt = 0;
        while insert::insert_attempt(self.inner.anchor, &key, self.me).is_err() {
            backoff(attempt);
            attempt = attempt.saturating_add(1);
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes one occurrence of a key, returning whether one was found.
    ///
    /// # Examples
    /// ```
    /// let tree = concurrent_rbtree::RbTree::<usize>::default();
    ///
    /// tree.insert(3);
    ///
    /// assert!(tree.remove(&3));
    /// assert!(!tree.remove(&3));
    /// ```
    pub fn remove(&self, key: &K) -> bool {
        let mut guard = self.ebr.pin();
        let mut attempt = 0;
        loop {
            match remove::remove_attempt(
                self.inner.anchor,
                &self.inner.handoff,
                self.me,
                key,
                &mut guard,
            ) {
                Ok(removed) => {
                    if removed {
                        self.len.fetch_sub(1, Ordering::Relaxed);
                    }
                    return removed;
                }
                Err(Retry) => {
                    backoff(attempt);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Returns whether the key is present.
    ///
    /// # Examples
    /// ```
    /// let tree = concurrent_rbtree::RbTree::<usize>::default();
    ///
    /// tree.insert(9);
    ///
    /// assert!(tree.contains(&9));
    /// assert!(!tree.contains(&8));
    /// ```
    pub fn contains(&self, key: &K) -> bool {
        let _guard = self.ebr.pin();
        let mut attempt = 0;
        loop {
            match navigate::find_claimed(self.inner.anchor, key) {
                Ok(Some(node)) => {
                    claim::release(node);
                    return true;
                }
                Ok(None) => return false,
                Err(Retry) => {
                    backoff(attempt);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// An eventually consistent count of the keys in the tree.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns whether the lagging key count is zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walks the whole tree asserting every structural invariant and
    /// returns the number of keys found. Intended for tests, at points
    /// where the caller knows no operation is in flight.
    pub fn check_invariants(&self) -> usize {
        let _guard = self.ebr.pin();
        check::verify_structure(self.inner.anchor)
    }

    /// Asserts that no reachable node carries a claim flag or a marker.
    /// Intended for tests, at points where the caller knows no operation
    /// is in flight.
    pub fn assert_quiescent(&self) {
        let _guard = self.ebr.pin();
        check::verify_quiescent(self.inner.anchor);
    }

    /// Clones every key out in sorted order. Intended for tests, at
    /// points where the caller knows no operation is in flight.
    pub fn sorted_keys(&self) -> Vec<K> {
        let _guard = self.ebr.pin();
        check::collect_sorted(self.inner.anchor)
    }
}
