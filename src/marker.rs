//! Intention markers. A delete whose fix-up may climb publishes a chain of
//! markers on the ancestors above its working area before it restructures
//! anything, so the territory it may need next is visible before it is
//! entered.
//!
//! Markers are advisory: they never stop a flag from being claimed. They
//! constrain two things instead. No worker may mark a node that carries or
//! directly neighbors another worker's marker, which keeps any two
//! published chains a full rotation apart. And no rotation may move a node
//! carrying another worker's marker, which keeps every published chain a
//! contiguous parent path until its owner takes it down. A marker is only
//! ever written under the marked node's claim flag, so whoever holds a
//! flag can trust the marker it reads.
//!
//! A chain is [`CHAIN_LEN`] links long when placed and moves up one level
//! per climb. Rotations inside the owner's own area fold a risen node or
//! two into the bottom of the chain; the release walk sweeps those out
//! with the rest, so a chain never outlives its operation.

use crate::claim::{self, LocalArea};
use crate::handoff::Inherited;
use crate::node::{NodeRef, NO_OWNER};

/// How many marked ancestors a delete keeps above its working area while
/// its fix-up may still climb.
pub(crate) const CHAIN_LEN: usize = 4;

/// A climb walks the whole standing chain plus the one level it grows by.
const EXTEND_SPAN: usize = CHAIN_LEN + 1;

/// The release walk covers the chain plus the risen nodes a fix-up's two
/// marking rotations can fold into it before it comes down.
const RELEASE_SPAN: usize = CHAIN_LEN + 2;

/// Whether a marker read from a prospective neighbor lets us proceed:
/// nobody's, our own, or the cooperating worker named by a hand-off grant.
fn tolerated(marker: usize, me: usize, peer: usize) -> bool {
    marker == NO_OWNER || marker == me || marker == peer
}

/// The spacing rule for a node about to be marked: its parent and its
/// sibling must be clear of intolerable markers, so two chains can never
/// come within one rotation of each other. Each neighbor is frozen with a
/// transient claim while its marker is read; a neighbor whose flag the
/// caller already holds (`held`) or that sits inside this worker's grant
/// is read as-is, since nobody can mark a node whose flag is taken.
fn spacing_ok<K>(
    t: NodeRef<K>,
    held: Option<NodeRef<K>>,
    me: usize,
    peer: usize,
    inh: Option<&Inherited<K>>,
) -> bool {
    let borrowed =
        |node: NodeRef<K>| Some(node) == held || inh.map_or(false, |grant| grant.holds(node));
    loop {
        let tp = t.parent();
        let tp_claimed = if borrowed(tp) {
            false
        } else {
            if !claim::try_acquire(tp) {
                return false;
            }
            if t.parent() != tp {
                claim::release(tp);
                continue;
            }
            true
        };

        let mut ok = tolerated(tp.marker(), me, peer);
        if ok {
            let ts = tp.other_child(t);
            if borrowed(ts) {
                ok = tolerated(ts.marker(), me, peer);
            } else if claim::try_acquire(ts) {
                ok = tolerated(ts.marker(), me, peer);
                claim::release(ts);
            } else {
                ok = false;
            }
        }

        if tp_claimed {
            claim::release(tp);
        }
        return ok;
    }
}

/// One link secured while building or tearing down a chain: the node, and
/// whether its flag is ours to put back. Links borrowed from the caller's
/// holdings or from a grant are not.
struct ChainClaim<K> {
    node: NodeRef<K>,
    transient: bool,
}

fn unwind<K>(links: &[ChainClaim<K>]) {
    for link in links.iter().rev() {
        if link.transient {
            claim::release(link.node);
        }
    }
}

/// Publishes this worker's marker chain on the [`CHAIN_LEN`] ancestors
/// above `base`, claiming each link transiently and vetting it against the
/// spacing rule before any marker is written. A chain that reaches the
/// anchor simply stops early. `exempt` names a node the caller already
/// holds (the doomed node of a two-child delete, when it stands on the
/// ancestor path); its flag is not claimed, but its marker slot has to be
/// free like any other link's.
///
/// Returns false and leaves no trace when a link cannot be secured.
pub(crate) fn place_chain_above<K>(
    base: NodeRef<K>,
    exempt: Option<NodeRef<K>>,
    me: usize,
    peer: usize,
    inh: Option<&Inherited<K>>,
) -> bool {
    let mut links: Vec<ChainClaim<K>> = Vec::with_capacity(CHAIN_LEN);
    let mut cur = base;
    for _ in 0..CHAIN_LEN {
        let above = cur.parent();
        if above.parent() == above {
            break;
        }
        let transient = if Some(above) == exempt || inh.map_or(false, |grant| grant.holds(above)) {
            false
        } else {
            if !claim::try_acquire(above) {
                unwind(&links);
                return false;
            }
            if cur.parent() != above {
                claim::release(above);
                unwind(&links);
                return false;
            }
            true
        };
        links.push(ChainClaim {
            node: above,
            transient,
        });
        if above.marker() != NO_OWNER || !spacing_ok(above, exempt, me, peer, inh) {
            unwind(&links);
            return false;
        }
        cur = above;
    }
    for link in &links {
        link.node.set_marker(me);
    }
    unwind(&links);
    true
}

/// What a chain extension secured for the level a fix-up is about to
/// climb onto.
pub(crate) struct Extension<K> {
    /// The lowest chain link, which becomes the climbing round's next
    /// parent. Its flag is still held on return.
    pub(crate) next_parent: NodeRef<K>,
    /// Whether that flag was claimed here, or belongs to the caller's
    /// grant and still has to be adopted out of it.
    pub(crate) owned: bool,
}

/// Walks the chain above `x` and pushes it one level higher, so the climb
/// onto `x`'s parent will again have [`CHAIN_LEN`] marked ancestors above
/// it. Existing links are claimed and re-verified on the way up; a
/// position another delete spliced a link out of is vetted and re-marked
/// in passing, so the chain heals as it climbs. Every flag but the lowest
/// link's is released before returning. The markers stay.
///
/// Returns `None` with all flags released when a link cannot be secured
/// or a fresh position fails the spacing rule. Markers written before the
/// failure stand; the caller tears the whole chain down when it backs
/// out.
pub(crate) fn extend_chain_above<K>(
    x: NodeRef<K>,
    me: usize,
    peer: usize,
    inh: Option<&Inherited<K>>,
) -> Option<Extension<K>> {
    let mut links: Vec<ChainClaim<K>> = Vec::with_capacity(EXTEND_SPAN);
    let mut cur = x;
    for _ in 0..EXTEND_SPAN {
        let above = cur.parent();
        if above.parent() == above {
            break;
        }
        let transient = if inh.map_or(false, |grant| grant.holds(above)) {
            false
        } else {
            if !claim::try_acquire(above) {
                unwind(&links);
                return None;
            }
            if cur.parent() != above {
                claim::release(above);
                unwind(&links);
                return None;
            }
            true
        };
        links.push(ChainClaim {
            node: above,
            transient,
        });
        let marker = above.marker();
        if marker != me {
            if marker != NO_OWNER || !spacing_ok(above, None, me, peer, inh) {
                unwind(&links);
                return None;
            }
            above.set_marker(me);
        }
        cur = above;
    }

    assert!(
        !links.is_empty(),
        "a climb is never attempted with the anchor for a parent"
    );
    while links.len() > 1 {
        if let Some(link) = links.pop() {
            if link.transient {
                claim::release(link.node);
            }
        }
    }
    links.pop().map(|lowest| Extension {
        next_parent: lowest.node,
        owned: lowest.transient,
    })
}

/// Takes this worker's marker chain down: walks the run of ancestors
/// above `base` marked `me`, freezing each link before anything is
/// cleared. Links whose flags the caller's area still holds are borrowed
/// rather than claimed. The walk spans up to [`RELEASE_SPAN`] links, the
/// most a fix-up's rotations can fold into a chain before it comes down.
///
/// Nothing is cleared unless the entire run freezes at once, so a failed
/// attempt (false) leaves the chain standing for the caller to retry.
pub(crate) fn try_release_chain<K>(base: NodeRef<K>, me: usize, area: &LocalArea<K>) -> bool {
    let mut links: Vec<ChainClaim<K>> = Vec::with_capacity(RELEASE_SPAN);
    let mut cur = base;
    for _ in 0..RELEASE_SPAN {
        let above = cur.parent();
        if above.marker() != me {
            break;
        }
        let transient = if area.holds(above) {
            false
        } else {
            if !claim::try_acquire(above) {
                unwind(&links);
                return false;
            }
            if cur.parent() != above {
                claim::release(above);
                unwind(&links);
                return false;
            }
            true
        };
        links.push(ChainClaim {
            node: above,
            transient,
        });
        cur = above;
    }
    for link in &links {
        link.node.set_marker(NO_OWNER);
    }
    unwind(&links);
    true
}

/// Whether a rotation that would lower `lowered` and raise `raised` has
/// to wait. A node carrying another worker's marker is one link of a
/// published chain; moving it would tear that chain's parent path, so the
/// rotation defers until the owner has moved on. The caller holds both
/// flags, which pins both markers while it decides.
pub(crate) fn blocks_rotation<K>(lowered: NodeRef<K>, raised: NodeRef<K>, me: usize) -> bool {
    let foreign = |marker: usize| marker != NO_OWNER && marker != me;
    foreign(lowered.marker()) || foreign(raised.marker())
}
