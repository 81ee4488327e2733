use std::sync::atomic::Ordering;

use crate::debug_delay;
use crate::node::NodeRef;
use crate::Retry;

/// Tries to claim `node`'s flag, failing if another operation holds it.
/// Claiming orders all of the holder's later reads after the previous
/// holder's writes.
pub(crate) fn try_acquire<K>(node: NodeRef<K>) -> bool {
    if debug_delay() {
        // injected contention
        return false;
    }
    node.flag
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

pub(crate) fn release<K>(node: NodeRef<K>) {
    node.flag.store(false, Ordering::Release);
}

/// Progressive spin-then-yield backoff for retry loops.
pub(crate) fn backoff(attempt: u32) {
    let spins = 1_u32.checked_shl(attempt.min(6)).unwrap_or(u32::MAX);
    for _ in 0..spins {
        std::hint::spin_loop();
    }
    if attempt > 6 {
        std::thread::yield_now();
    }
}

/// The set of claim flags one operation currently holds. Operations remember
/// every node they claim so that abort paths can put everything back and
/// restart cleanly.
pub(crate) struct LocalArea<K> {
    held: Vec<NodeRef<K>>,
}

/// Claims `node`'s parent, validating the link afterwards: a rotation may
/// rewrite a parent backref without holding the child's flag, so the value
/// read is only trusted once the named node is claimed and still the parent.
/// A node the area already holds is trusted as-is, since no rotation can
/// move an edge between two nodes we hold.
pub(crate) fn claim_parent_of<K>(
    area: &mut LocalArea<K>,
    node: NodeRef<K>,
) -> Result<NodeRef<K>, Retry> {
    loop {
        let parent = node.parent();
        if area.holds(parent) {
            return Ok(parent);
        }
        if !try_acquire(parent) {
            return Err(Retry);
        }
        if node.parent() != parent {
            release(parent);
            continue;
        }
        area.remember(parent);
        return Ok(parent);
    }
}

impl<K> LocalArea<K> {
    pub(crate) fn new() -> LocalArea<K> {
        LocalArea {
            held: Vec::with_capacity(8),
        }
    }

    pub(crate) fn remember(&mut self, node: NodeRef<K>) {
        assert!(!self.holds(node), "a node was claimed twice by one operation");
        self.held.push(node);
    }

    /// Stops tracking `node` without releasing it. Used when a flag's
    /// ownership moves somewhere else, such as a hand-off grant.
    pub(crate) fn forget(&mut self, node: NodeRef<K>) {
        let position = self
            .held
            .iter()
            .position(|held| *held == node)
            .expect("released a node that was never claimed");
        self.held.swap_remove(position);
    }

    pub(crate) fn holds(&self, node: NodeRef<K>) -> bool {
        self.held.iter().any(|held| *held == node)
    }

    pub(crate) fn nodes(&self) -> &[NodeRef<K>] {
        &self.held
    }

    /// Releases one tracked node.
    pub(crate) fn release(&mut self, node: NodeRef<K>) {
        self.forget(node);
        release(node);
    }

    /// Releases every tracked flag, most recently claimed first.
    pub(crate) fn release_all(&mut self) {
        while let Some(node) = self.held.pop() {
            release(node);
        }
    }

    /// Releases every tracked flag except `keep`'s, which stays claimed
    /// and tracked. A parked fix-up lives here: the deficit node's claim
    /// is never surrendered while the debt is unpaid.
    pub(crate) fn release_all_but(&mut self, keep: NodeRef<K>) {
        assert!(self.holds(keep), "parking keeps only a node the area holds");
        self.held.retain(|held| {
            if *held == keep {
                true
            } else {
                release(*held);
                false
            }
        });
    }

    /// Drops the bookkeeping without touching any flags.
    pub(crate) fn clear(&mut self) {
        self.held.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::node::Node;

    #[test]
    fn the_flag_admits_one_holder_at_a_time() {
        let node = NodeRef::from_owned(Node::<u64>::sentinel());
        let holder = AtomicUsize::new(usize::MAX);
        let acquisitions = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for id in 0..4 {
                let holder_2 = &holder;
                let acquisitions_2 = &acquisitions;
                s.spawn(move || {
                    for _ in 0..10_000 {
                        if try_acquire(node) {
                            let previous = holder_2.swap(id, Ordering::SeqCst);
                            assert_eq!(
                                previous,
                                usize::MAX,
                                "a second worker got inside a held claim"
                            );
                            acquisitions_2.fetch_add(1, Ordering::Relaxed);
                            for _ in 0..16 {
                                std::hint::spin_loop();
                            }
                            holder_2.store(usize::MAX, Ordering::SeqCst);
                            release(node);
                        }
                    }
                });
            }
        });

        assert!(acquisitions.load(Ordering::Relaxed) > 0);
        assert!(!node.flag.load(Ordering::Acquire));
        drop(unsafe { Box::from_raw(node.as_ptr()) });
    }

    #[test]
    fn the_area_returns_everything_it_still_tracks() {
        let a = NodeRef::from_owned(Node::<u64>::sentinel());
        let b = NodeRef::from_owned(Node::<u64>::sentinel());

        let mut area = LocalArea::new();
        assert!(try_acquire(a));
        assert!(try_acquire(b));
        area.remember(a);
        area.remember(b);
        assert!(area.holds(a) && area.holds(b));

        area.forget(b);
        assert!(!area.holds(b));
        area.release_all();
        assert!(!a.flag.load(Ordering::Acquire));
        assert!(
            b.flag.load(Ordering::Acquire),
            "a forgotten flag is the new owner's to release"
        );

        release(b);
        for node in [a, b] {
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }
    }

    #[test]
    fn parking_keeps_exactly_the_named_flag() {
        let a = NodeRef::from_owned(Node::<u64>::sentinel());
        let b = NodeRef::from_owned(Node::<u64>::sentinel());
        let c = NodeRef::from_owned(Node::<u64>::sentinel());

        let mut area = LocalArea::new();
        for node in [a, b, c] {
            assert!(try_acquire(node));
            area.remember(node);
        }

        area.release_all_but(b);
        assert!(!a.flag.load(Ordering::Acquire));
        assert!(!c.flag.load(Ordering::Acquire));
        assert!(b.flag.load(Ordering::Acquire), "the kept claim stays held");
        assert!(area.holds(b) && !area.holds(a) && !area.holds(c));

        area.release_all();
        assert!(!b.flag.load(Ordering::Acquire));
        for node in [a, b, c] {
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }
    }
}
