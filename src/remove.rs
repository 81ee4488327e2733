//! Removal, the long half of the protocol.
//!
//! Unlinking a key claims a neighborhood around the doomed node, reserves a
//! marker chain above it, and splices the node out under those flags. A black
//! removal leaves one child short and enters the fix-up loop, which may climb
//! the tree one level per round. Each climb extends the marker chain upward
//! before any flag moves, so the set of ancestors this worker may restructure
//! is always published before it is touched.
//!
//! Two workers whose territories collide resolve it by handing flags over,
//! never by waiting with work half done. A worker that has not yet unlinked
//! anything offers its entire flagged area to the marker chain blocked on it
//! (see [`crossing_chain`]) and retries from scratch. A worker blocked
//! mid-fix-up takes its marker chain down and parks, but keeps the short
//! node claimed the whole time: that one flag gates the only region whose
//! black count is wrong, and the marker on it names the worker the deficit
//! answers to. When two deficits meet across one parent, the higher id pays
//! its flags and its debt down to the lower, which climbs once for both.

use ebr::Guard;

use crate::claim::{self, backoff, LocalArea};
use crate::handoff::HandoffTable;
use crate::marker;
use crate::navigate;
use crate::node::{rotate, Color, Dir, Node, NodeRef, NO_OWNER};
use crate::Retry;

#[cfg(test)]
static SURRENDERED_AREAS: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
#[cfg(test)]
static CEDED_DEBTS: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

/// Looks for another worker's marker chain crossing the claimed neighborhood
/// around the parent `p` and sibling `w`. Four configurations count: the
/// chain enters from the right nephew and exits through the parent, it
/// enters from the left nephew and exits through the parent, it starts or
/// ends on the sibling itself, or it ends on the parent from the unlinked
/// side. All of them mean the owner's climb will need flags we hold while it
/// cannot move, so the caller must pay it instead of retrying against it.
/// Returns that owner, plus the owner of a second chain crowding one of the
/// remaining nodes, if any.
fn crossing_chain<K>(p: NodeRef<K>, w: NodeRef<K>, me: usize) -> Option<(usize, usize)> {
    let foreign = |m: usize| m != NO_OWNER && m != me;
    let pm = p.marker();
    let (wm, lm, rm) = if w.is_leaf() {
        (NO_OWNER, NO_OWNER, NO_OWNER)
    } else {
        (
            w.marker(),
            w.child(Dir::Left).marker(),
            w.child(Dir::Right).marker(),
        )
    };

    let (owner, crowding) = if foreign(wm) && pm == wm && rm == wm {
        // up through the right nephew and out the top; only the left
        // nephew has room for a second chain
        (wm, lm)
    } else if foreign(wm) && pm == wm && lm == wm {
        (wm, rm)
    } else if foreign(wm) && (pm == wm || lm == wm || rm == wm) {
        // the chain starts or ends on the sibling, so one neighbor link
        // sits inside the area and the rest of it is out of view
        let other = if pm != wm {
            pm
        } else if lm != wm {
            lm
        } else {
            rm
        };
        (wm, other)
    } else if foreign(pm) {
        // a chain from somewhere below the doomed node ends on the parent
        (pm, wm)
    } else {
        return None;
    };

    let peer = if foreign(crowding) && crowding != owner {
        crowding
    } else {
        NO_OWNER
    };
    Some((owner, peer))
}

/// Offers every flag this worker holds to `owner`, whose marker chain is
/// blocked on them. The flags travel with the grant and become the owner's
/// to adopt or release. If the owner's slot is already full the flags are
/// released normally instead.
fn surrender<K>(
    handoff: &HandoffTable<K>,
    area: &mut LocalArea<K>,
    owner: usize,
    peer: usize,
    goal: NodeRef<K>,
) {
    let granted = area.nodes().to_vec();
    match handoff.offer(owner, granted, goal, peer) {
        Ok(()) => {
            #[cfg(test)]
            SURRENDERED_AREAS.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            area.clear();
        }
        Err(_) => area.release_all(),
    }
}

/// Takes the standing marker chain down, retrying until the whole marked
/// run can be frozen at once. The walk borrows flags the area still holds;
/// idle grants are released between attempts so their pinned flags cannot
/// starve it.
fn lower_chain<K>(
    handoff: &HandoffTable<K>,
    area: &LocalArea<K>,
    me: usize,
    chain: &mut Option<NodeRef<K>>,
) {
    if let Some(base) = chain.take() {
        let mut attempt: u32 = 0;
        while !marker::try_release_chain(base, me, area) {
            backoff(attempt);
            attempt = attempt.saturating_add(1);
            handoff.shed(me);
        }
    }
}

/// Releases everything an operation still holds: the marker chain standing
/// above `standing`, any idle grant parked in this worker's slot, then the
/// flagged area. A deficit grant is not released with the rest: its flags
/// gate a debt some donor paid down to this worker, so the caller gets the
/// donated short node back, with the granted flags already in the area, and
/// keeps fixing.
fn depart<K>(
    handoff: &HandoffTable<K>,
    area: &mut LocalArea<K>,
    me: usize,
    standing: Option<NodeRef<K>>,
) -> Option<NodeRef<K>> {
    let mut chain = standing;
    lower_chain(handoff, area, me, &mut chain);
    let residual = match handoff.take(me) {
        Some((granted, Some(debt))) => {
            for node in granted {
                area.remember(node);
            }
            Some(debt)
        }
        Some((granted, None)) => {
            for node in granted {
                claim::release(node);
            }
            None
        }
        None => None,
    };
    if residual.is_none() {
        area.release_all();
    }
    residual
}

/// Pays this worker's whole position down to `owner`, whose own deficit is
/// parked on `gate`. Every flag in the area travels by grant, and the
/// marker on `short` is rewritten to name its new owner, so later colliders
/// settle with the right worker. The grant records `short` itself: the
/// inheritor that finds it as its own sibling knows both children of the
/// parent are short by the same one black. The donor's chain must already
/// be down. Returns false with everything intact when the owner's slot is
/// full or the parked deficit on `gate` has already settled.
fn cede<K>(
    handoff: &HandoffTable<K>,
    area: &mut LocalArea<K>,
    me: usize,
    owner: usize,
    short: NodeRef<K>,
    goal: NodeRef<K>,
    gate: NodeRef<K>,
) -> bool {
    short.set_marker(owner);
    let granted = area.nodes().to_vec();
    match handoff.offer_debt(owner, granted, goal, me, short, gate) {
        Ok(()) => {
            #[cfg(test)]
            CEDED_DEBTS.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            area.clear();
            true
        }
        Err(_) => {
            short.set_marker(me);
            false
        }
    }
}

/// Claims `node`, counting a node granted through the hand-off table as
/// claimable. Adopted nodes move out of the grant and into the area so they
/// are released exactly once.
fn claim_with_grant<K>(
    area: &mut LocalArea<K>,
    handoff: &HandoffTable<K>,
    me: usize,
    node: NodeRef<K>,
) -> bool {
    if area.holds(node) {
        return true;
    }
    if handoff.adopt(me, node) {
        area.remember(node);
        return true;
    }
    if claim::try_acquire(node) {
        area.remember(node);
        return true;
    }
    false
}

/// Parent claim that re-validates the edge after acquisition, since a
/// rotation elsewhere may rewrite a child's parent pointer without holding
/// the child's flag.
fn claim_parent_with_grant<K>(
    area: &mut LocalArea<K>,
    handoff: &HandoffTable<K>,
    me: usize,
    node: NodeRef<K>,
) -> Result<NodeRef<K>, Retry> {
    loop {
        let parent = node.parent();
        if area.holds(parent) {
            return Ok(parent);
        }
        if handoff.adopt(me, parent) {
            if node.parent() != parent {
                claim::release(parent);
                continue;
            }
            area.remember(parent);
            return Ok(parent);
        }
        if !claim::try_acquire(parent) {
            return Err(Retry);
        }
        if node.parent() != parent {
            claim::release(parent);
            continue;
        }
        area.remember(parent);
        return Ok(parent);
    }
}

/// One full removal attempt. `Err(Retry)` means contention unwound the
/// attempt before any key was unlinked and the caller should start over;
/// `Ok(false)` means the key is absent.
pub(crate) fn remove_attempt<K, const LOCAL_GC_BUFFER_SIZE: usize>(
    anchor: NodeRef<K>,
    handoff: &HandoffTable<K>,
    me: usize,
    key: &K,
    guard: &mut Guard<'_, Box<Node<K>>, LOCAL_GC_BUFFER_SIZE>,
) -> Result<bool, Retry>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    let z = match navigate::find_claimed(anchor, key)? {
        Some(found) => found,
        None => return Ok(false),
    };

    let mut area = LocalArea::new();
    area.remember(z);

    macro_rules! bail {
        () => {{
            area.release_all();
            return Err(Retry);
        }};
    }

    // the node physically unlinked: z itself when a child is a sentinel,
    // otherwise its successor, whose key will move into z
    let y = if z.child(Dir::Left).is_leaf() || z.child(Dir::Right).is_leaf() {
        z
    } else {
        match navigate::claim_successor(z) {
            Ok(successor) => {
                area.remember(successor);
                successor
            }
            Err(Retry) => bail!(),
        }
    };

    // x replaces y below; a sentinel replacement is claimed like any node
    let x = if y.child(Dir::Left).is_leaf() {
        y.child(Dir::Right)
    } else {
        y.child(Dir::Left)
    };
    if !claim::try_acquire(x) {
        bail!();
    }
    area.remember(x);

    // the other child comes out with y; it must be flagged before it can
    // be retired, or an inserter aiming at it could release the tombstone
    let orphan = y.other_child(x);
    if !claim::try_acquire(orphan) {
        bail!();
    }
    area.remember(orphan);

    let yp = match claim::claim_parent_of(&mut area, y) {
        Ok(parent) => parent,
        Err(Retry) => bail!(),
    };

    let w = yp.other_child(y);
    if !claim::try_acquire(w) {
        bail!();
    }
    area.remember(w);
    if !w.is_leaf() {
        for side in [Dir::Left, Dir::Right] {
            let nephew = w.child(side);
            if !claim::try_acquire(nephew) {
                bail!();
            }
            area.remember(nephew);
        }
    }

    // another deleter's chain may cross this neighborhood; nothing has been
    // unlinked yet, so handing it the whole area and retrying is free
    if let Some((owner, peer)) = crossing_chain(yp, w, me) {
        let goal = yp.parent();
        surrender(handoff, &mut area, owner, peer, goal);
        return Err(Retry);
    }

    // a chain that runs through y must continue through its replacement
    // after the splice; two different chains pinched between the two nodes
    // cannot both survive it
    let removed_color = y.color();
    let (ym, xm) = (y.marker(), x.marker());
    if ym != NO_OWNER && xm != NO_OWNER && xm != ym {
        bail!();
    }
    // a black unlink with a black replacement advertises its deficit on
    // x's marker slot, so both slots must be clear of standing chains
    // first; nothing is unlinked yet and waiting the owner out is free
    if removed_color == Color::Black
        && x.color() == Color::Black
        && (ym != NO_OWNER || xm != NO_OWNER)
    {
        bail!();
    }

    let exempt = if y == z { None } else { Some(z) };
    if !marker::place_chain_above(yp, exempt, me, NO_OWNER, None) {
        bail!();
    }

    // unlink y
    let ydir = yp.dir_of(y);
    yp.set_child(ydir, x);
    x.set_parent(yp);

    // a foreign chain that ran through y now runs through its replacement
    if ym != NO_OWNER {
        x.set_marker(ym);
    }

    if y != z {
        z.replace_key(y.key().clone());
    }

    assert!(orphan.is_leaf(), "the unlinked node kept a real child behind");
    orphan.retire();
    area.forget(orphan);
    y.retire();
    area.forget(y);

    guard.defer_drop(unsafe { Box::from_raw(y.as_ptr()) });
    guard.defer_drop(unsafe { Box::from_raw(orphan.as_ptr()) });

    // z's key is final; its flag is only still needed if it borders the gap
    if y != z && z != yp {
        area.release(z);
    }

    if removed_color == Color::Red {
        if let Some(debt) = depart(handoff, &mut area, me, Some(yp)) {
            fix_after_remove(anchor, handoff, me, &mut area, debt, None);
        }
        return Ok(true);
    }
    if x.color() == Color::Red {
        x.set_color(Color::Black);
        if let Some(debt) = depart(handoff, &mut area, me, Some(yp)) {
            fix_after_remove(anchor, handoff, me, &mut area, debt, None);
        }
        return Ok(true);
    }

    // the deficit is real; it stays advertised on x until paid or ceded
    x.set_marker(me);
    fix_after_remove(anchor, handoff, me, &mut area, x, Some(yp));
    Ok(true)
}

/// Restores the black-height invariant after a black node left the tree.
/// `x` is the short node, claimed and carrying this worker's marker as its
/// deficit advertisement. `entry` names the fix-up parent when the caller's
/// chain still stands above it; from a bare `x` the first round re-claims
/// and re-places everything itself.
fn fix_after_remove<K>(
    anchor: NodeRef<K>,
    handoff: &HandoffTable<K>,
    me: usize,
    area: &mut LocalArea<K>,
    mut x: NodeRef<K>,
    entry: Option<NodeRef<K>>,
) {
    // the node whose ancestors carry this worker's markers, or None after
    // a stall has taken the chain down
    let mut chain: Option<NodeRef<K>> = entry;
    let mut stalls: u32 = 0;

    'round: loop {
        // a grant may have arrived from a worker whose area the chain
        // crosses or whose deficit met ours; its flags count as claimable
        // below, and its peer's markers are tolerated the way our own are
        let inherited = handoff.snapshot(me);
        let inh = inherited.as_ref();
        let peer = inh.map_or(NO_OWNER, |grant| grant.peer);

        // A blocked round takes its chain down and parks on x alone. The
        // short node's claim is never given up while the debt is unpaid:
        // the held flag keeps every operation out of the one region whose
        // black count is wrong, and the marker on x names the worker a
        // colliding deleter settles with. Idle grants are released before
        // parking; a deficit grant stays, since its flags gate a debt of
        // its own.
        macro_rules! stall {
            () => {{
                handoff.shed(me);
                lower_chain(handoff, area, me, &mut chain);
                area.release_all_but(x);
                backoff(stalls);
                stalls = stalls.saturating_add(1);
                continue 'round;
            }};
        }

        // A paid deficit leaves no trace: the advertisement comes off x
        // before the flags go back. A debt granted while we finished comes
        // out of the slot instead, and the fix-up continues at the donated
        // short node with the granted flags already in the area.
        macro_rules! settle {
            () => {{
                x.set_marker(NO_OWNER);
                match depart(handoff, area, me, chain.take()) {
                    None => return,
                    Some(debt) => {
                        x = debt;
                        stalls = 0;
                        continue 'round;
                    }
                }
            }};
        }

        let p = match claim_parent_with_grant(area, handoff, me, x) {
            Ok(parent) => parent,
            Err(Retry) => stall!(),
        };
        if p == anchor {
            // the whole tree is short by the same amount; nothing to fix
            settle!();
        }

        match chain {
            Some(base) => assert!(
                base == p,
                "the marker chain stands above the fix-up parent"
            ),
            // after a stall the old chain is gone; publish a new one above
            // the re-claimed position before restructuring
            None => {
                if !marker::place_chain_above(p, None, me, peer, inh) {
                    stall!();
                }
                chain = Some(p);
            }
        }

        let w = p.other_child(x);
        // a sibling named by the slot's debt grant, or one already wearing
        // this worker's own marker: the only marker of ours that can sit
        // below p is a transferred advertisement, and a donation adopted
        // before its snapshot was visible still has to be merged
        let short_sibling =
            inh.map_or(false, |grant| grant.short == Some(w)) || w.marker() == me;

        // Claims a node of the working area, or settles with whoever's
        // deficit is parked on it. Ids break the tie so exactly one of two
        // meeting debts donates: the higher pays its whole position down
        // to the lower, which keeps fixing for both. A donor whose own
        // slot holds an inherited debt picks it up on the way out instead
        // of stranding it.
        macro_rules! claim_or_settle {
            ($node:expr) => {{
                let wanted = $node;
                if !claim_with_grant(area, handoff, me, wanted) {
                    let holder = wanted.marker();
                    if holder == me {
                        // a donation can land between the round's snapshot
                        // and this claim; re-read the slot instead of
                        // contending with our own transferred debt
                        stalls = 0;
                        continue 'round;
                    }
                    if holder < me {
                        lower_chain(handoff, area, me, &mut chain);
                        if cede(handoff, area, me, holder, x, p, wanted) {
                            match depart(handoff, area, me, None) {
                                None => return,
                                Some(debt) => {
                                    x = debt;
                                    stalls = 0;
                                    continue 'round;
                                }
                            }
                        }
                    }
                    stall!();
                }
            }};
        }

        // The deficit climbs: p becomes the short node. The chain is
        // pushed one level higher and the advertisement moves with the
        // debt before any flag is given back, so the reserved corridor
        // and the settlement address never lapse. The next round claims
        // the new sibling level.
        macro_rules! climb {
            () => {{
                let short = x;
                x = p;
                short.set_marker(NO_OWNER);
                x.set_marker(me);
                let ext = match marker::extend_chain_above(x, me, peer, inh) {
                    Some(extension) => extension,
                    None => stall!(),
                };
                let next = ext.next_parent;
                if ext.owned {
                    area.remember(next);
                } else {
                    let adopted = handoff.adopt(me, next);
                    assert!(
                        adopted,
                        "an unclaimed chain link must come out of this worker's grant"
                    );
                    area.remember(next);
                }
                // the freshly claimed link leaves the chain and becomes
                // the next round's parent
                next.set_marker(NO_OWNER);
                chain = Some(next);

                area.release(short);
                if area.holds(w) {
                    area.release(w);
                }
                if !w.is_leaf() {
                    for side in [Dir::Left, Dir::Right] {
                        let nephew = w.child(side);
                        if area.holds(nephew) {
                            area.release(nephew);
                        }
                    }
                }
                // once the area has climbed past a grant's goal, the
                // remaining granted flags have served their purpose
                let past_goal = inh.map_or(false, |grant| {
                    grant.goal == short
                        || grant.goal == w
                        || (!w.is_leaf()
                            && (grant.goal == w.child(Dir::Left)
                                || grant.goal == w.child(Dir::Right)))
                });
                if past_goal {
                    handoff.consume(me);
                }
                stalls = 0;
                continue 'round;
            }};
        }

        // A sibling subtree that is short by the same one black as x:
        // either it is empty, or the deficit grant in this worker's slot
        // named it. Both children of p short means p is short, with no
        // recolor at all, and a red p settles both sides at once.
        if short_sibling || w.is_leaf() {
            if !short_sibling {
                let holder = w.marker();
                if holder == me {
                    // a donation naming this sentinel landed after the
                    // round's snapshot; re-read the slot so the grant is
                    // merged, not silently climbed past
                    stalls = 0;
                    continue 'round;
                }
                if holder != NO_OWNER {
                    // the sentinel is another worker's parked deficit;
                    // settle with it the way a failed sibling claim would
                    if holder < me {
                        lower_chain(handoff, area, me, &mut chain);
                        if cede(handoff, area, me, holder, x, p, w) {
                            match depart(handoff, area, me, None) {
                                None => return,
                                Some(debt) => {
                                    x = debt;
                                    stalls = 0;
                                    continue 'round;
                                }
                            }
                        }
                    }
                    stall!();
                }
            }
            // the advertisement is about to move onto p; a marker already
            // there is someone's standing corridor
            if p.marker() != NO_OWNER {
                stall!();
            }
            if short_sibling {
                let adopted = claim_with_grant(area, handoff, me, w);
                assert!(adopted, "a debt grant keeps its short node claimable");
                w.set_marker(NO_OWNER);
            }
            if p.color() == Color::Red {
                p.set_color(Color::Black);
                settle!();
            }
            if p.parent() == anchor {
                settle!();
            }
            climb!();
        }

        let xdir = p.dir_of(x);
        claim_or_settle!(w);
        if w.marker() == me {
            // the sibling claim can succeed by adopting a debt donated
            // after the round's snapshot; re-read the slot rather than
            // treat the donated short node as sound height
            stalls = 0;
            continue 'round;
        }
        for side in [Dir::Left, Dir::Right] {
            claim_or_settle!(w.child(side));
        }
        let near = w.child(xdir);
        let far = w.child(xdir.opposite());

        // a foreign corridor through this neighborhood would be torn by
        // the rotations below, so the round parks until its owner moves
        // on. No new marker can land on a node whose flag is held, which
        // leaves the rest of the round free to restructure.
        let intolerable = |node: NodeRef<K>| {
            let marker = node.marker();
            marker != NO_OWNER && marker != me && marker != peer
        };
        if intolerable(p) || intolerable(w) || intolerable(near) || intolerable(far) {
            stall!();
        }

        if w.color() == Color::Red {
            // the red sibling rises, leaving x a black sibling below it;
            // the parent above p has a child pointer rewritten, so its
            // flag is needed too
            let ggp = match claim_parent_with_grant(area, handoff, me, p) {
                Ok(parent) => parent,
                Err(Retry) => stall!(),
            };
            if marker::blocks_rotation(p, w, me) {
                stall!();
            }
            p.set_color(Color::Red);
            w.set_color(Color::Black);
            let risen = rotate(p, xdir);
            assert!(risen == w, "the red sibling rises over its parent");
            // the risen node now stands between p and the chain; marking
            // it keeps the corridor contiguous, and the release walk
            // sweeps the extra link out with the rest
            risen.set_marker(me);

            let sibling = p.other_child(x);
            for side in [Dir::Left, Dir::Right] {
                claim_or_settle!(sibling.child(side));
            }
            area.release(risen);
            area.release(far);
            area.release(ggp);
            continue 'round;
        }

        if near.color() == Color::Black && far.color() == Color::Black {
            // the deficit is about to move onto p, whose marker slot must
            // be free of standing corridors before the recolor commits
            if p.marker() != NO_OWNER {
                stall!();
            }
            w.set_color(Color::Red);
            if p.color() == Color::Red {
                p.set_color(Color::Black);
                settle!();
            }
            if p.parent() == anchor {
                // the deficit reached the root and vanishes there
                settle!();
            }
            climb!();
        }

        if far.color() == Color::Black {
            // the near nephew is red; it rises to become the new sibling
            if marker::blocks_rotation(w, near, me) {
                stall!();
            }
            near.set_color(Color::Black);
            w.set_color(Color::Red);
            let risen = rotate(w, xdir.opposite());
            assert!(risen == near, "the near nephew rises over the sibling");

            let grandnephew = risen.child(xdir);
            claim_or_settle!(grandnephew);
            area.release(far);
            continue 'round;
        }

        // the far nephew is red; one rotation settles the debt
        if claim_parent_with_grant(area, handoff, me, p).is_err() {
            stall!();
        }
        if marker::blocks_rotation(p, w, me) {
            stall!();
        }
        w.set_color(p.color());
        p.set_color(Color::Black);
        far.set_color(Color::Black);
        let risen = rotate(p, xdir);
        assert!(risen == w, "the sibling rises over its parent");
        risen.set_marker(me);
        settle!();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use ebr::Ebr;

    use super::*;
    use crate::check;

    const ME: usize = 1;
    const OTHER: usize = 2;

    fn wire_anchor() -> NodeRef<u64> {
        let anchor = NodeRef::from_owned(Node::sentinel());
        anchor.set_parent(anchor);
        let root = NodeRef::from_owned(Node::sentinel());
        let spare = NodeRef::from_owned(Node::sentinel());
        root.set_parent(anchor);
        spare.set_parent(anchor);
        anchor.set_child(Dir::Left, root);
        anchor.set_child(Dir::Right, spare);
        anchor
    }

    /// Promotes a sentinel slot into a real node with two fresh sentinel
    /// children.
    fn grow(slot: NodeRef<u64>, key: u64, color: Color) -> NodeRef<u64> {
        slot.promote(
            key,
            NodeRef::from_owned(Node::sentinel()),
            NodeRef::from_owned(Node::sentinel()),
        );
        slot.set_color(color);
        slot
    }

    fn free(tree: NodeRef<u64>) {
        if !tree.is_leaf() {
            free(tree.child(Dir::Left));
            free(tree.child(Dir::Right));
        }
        drop(unsafe { Box::from_raw(tree.as_ptr()) });
    }

    fn free_all(anchor: NodeRef<u64>) {
        free(anchor.child(Dir::Left));
        free(anchor.child(Dir::Right));
        drop(unsafe { Box::from_raw(anchor.as_ptr()) });
    }

    #[test]
    fn removing_beside_an_empty_sibling_settles_the_height() {
        let anchor = wire_anchor();
        let root = grow(anchor.child(Dir::Left), 10, Color::Black);
        grow(root.child(Dir::Right), 20, Color::Black);

        let handoff: HandoffTable<u64> = HandoffTable::new(4);
        let ebr: Ebr<Box<Node<u64>>, 8> = Ebr::default();
        let mut guard = ebr.pin();

        // the left side is one black shorter than the right, the shape a
        // parked deficit leaves behind; pulling 20 out meets the empty
        // sibling and settles the difference at the root
        let removed = remove_attempt(anchor, &handoff, ME, &20, &mut guard)
            .expect("nothing contends here");
        assert!(removed);

        assert_eq!(check::verify_structure(anchor), 1);
        check::verify_quiescent(anchor);
        drop(guard);
        free_all(anchor);
    }

    #[test]
    fn a_parked_deficit_keeps_its_region_unclaimable() {
        let anchor = wire_anchor();
        let root = grow(anchor.child(Dir::Left), 10, Color::Black);
        let high = grow(root.child(Dir::Right), 20, Color::Black);
        let parked = root.child(Dir::Left);

        // OTHER's deficit is parked on the left sentinel: claim held,
        // marker advertising the debt
        assert!(claim::try_acquire(parked));
        parked.set_marker(OTHER);

        let handoff: HandoffTable<u64> = HandoffTable::new(4);
        let ebr: Ebr<Box<Node<u64>>, 8> = Ebr::default();
        let mut guard = ebr.pin();

        // the removal next door needs the parked flag for its sibling and
        // unwinds whole instead of unlinking beside an unpaid debt
        assert!(remove_attempt(anchor, &handoff, ME, &20, &mut guard).is_err());
        assert!(!root.flag.load(Ordering::Acquire));
        assert!(!high.flag.load(Ordering::Acquire));
        assert!(parked.flag.load(Ordering::Acquire));
        assert_eq!(parked.marker(), OTHER);

        // the parked worker resumes and pays; only then is the region open
        let mut other_area = LocalArea::new();
        other_area.remember(parked);
        fix_after_remove(anchor, &handoff, OTHER, &mut other_area, parked, None);
        assert_eq!(check::verify_structure(anchor), 2);
        check::verify_quiescent(anchor);

        let removed = remove_attempt(anchor, &handoff, ME, &20, &mut guard)
            .expect("the region is open again");
        assert!(removed);
        assert_eq!(check::verify_structure(anchor), 1);
        check::verify_quiescent(anchor);
        drop(guard);
        free_all(anchor);
    }

    #[test]
    fn meeting_deficits_merge_through_the_handoff() {
        let anchor = wire_anchor();
        let root = grow(anchor.child(Dir::Left), 10, Color::Black);
        let left = root.child(Dir::Left);
        let right = root.child(Dir::Right);

        // two removals left both children of the root one black short:
        // ME parked on the left sentinel, OTHER still fixing on the right
        assert!(claim::try_acquire(left));
        left.set_marker(ME);
        assert!(claim::try_acquire(right));
        right.set_marker(OTHER);

        let handoff: HandoffTable<u64> = HandoffTable::new(4);

        let mut other_area = LocalArea::new();
        other_area.remember(right);
        fix_after_remove(anchor, &handoff, OTHER, &mut other_area, right, None);

        // OTHER met the parked deficit across the root and paid its whole
        // position down through the table
        let grant = handoff.snapshot(ME).expect("the donation landed");
        assert_eq!(grant.short, Some(right));
        assert_eq!(grant.peer, OTHER);
        assert!(grant.holds(root) && grant.holds(right));
        assert_eq!(right.marker(), ME, "the debt answers to its new owner");
        assert!(other_area.nodes().is_empty());

        // ME resumes: the granted sibling is exactly as short as its own
        // node, so the root absorbs both deficits and the tree is whole
        let mut my_area = LocalArea::new();
        my_area.remember(left);
        fix_after_remove(anchor, &handoff, ME, &mut my_area, left, None);

        assert!(handoff.snapshot(ME).is_none());
        assert_eq!(check::verify_structure(anchor), 1);
        check::verify_quiescent(anchor);
        free_all(anchor);
    }

    #[test]
    fn a_marked_victim_waits_before_anything_is_unlinked() {
        let anchor = wire_anchor();
        let root = grow(anchor.child(Dir::Left), 10, Color::Black);
        grow(root.child(Dir::Left), 5, Color::Black);
        let high = grow(root.child(Dir::Right), 20, Color::Black);

        let handoff: HandoffTable<u64> = HandoffTable::new(4);
        let ebr: Ebr<Box<Node<u64>>, 8> = Ebr::default();
        let mut guard = ebr.pin();

        // a chain link on the doomed node occupies the marker slot its
        // deficit advertisement would need; the removal waits it out whole
        high.set_marker(OTHER);
        assert!(remove_attempt(anchor, &handoff, ME, &20, &mut guard).is_err());
        assert_eq!(check::verify_structure(anchor), 3);
        assert_eq!(high.marker(), OTHER, "the foreign marker is untouched");

        high.set_marker(NO_OWNER);
        let removed = remove_attempt(anchor, &handoff, ME, &20, &mut guard)
            .expect("the slot is free again");
        assert!(removed);
        assert_eq!(check::verify_structure(anchor), 2);
        check::verify_quiescent(anchor);
        drop(guard);
        free_all(anchor);
    }

    #[test]
    fn a_crossing_chain_inherits_the_area_it_blocked() {
        let anchor = wire_anchor();
        let root = grow(anchor.child(Dir::Left), 10, Color::Black);
        let low = grow(root.child(Dir::Left), 5, Color::Black);
        grow(root.child(Dir::Right), 20, Color::Black);

        let handoff: HandoffTable<u64> = HandoffTable::new(4);
        let ebr: Ebr<Box<Node<u64>>, 8> = Ebr::default();
        let mut guard = ebr.pin();

        // OTHER's chain from somewhere below ends on the parent of the
        // node ME wants out; the whole setup area crosses it
        root.set_marker(OTHER);
        assert!(remove_attempt(anchor, &handoff, ME, &5, &mut guard).is_err());

        // nothing was unlinked and every flag travelled: the area waits
        // in OTHER's slot, still claimed
        assert_eq!(check::verify_structure(anchor), 3);
        let grant = handoff.snapshot(OTHER).expect("the surrender landed");
        assert_eq!(grant.short, None);
        assert!(grant.holds(root) && grant.holds(low));
        assert!(root.flag.load(Ordering::Acquire));
        assert!(low.flag.load(Ordering::Acquire));

        // OTHER adopts what its own climb needs, finishes, and departs;
        // the rest of the grant is consumed and the region comes back
        let mut other_area = LocalArea::new();
        assert!(claim_with_grant(&mut other_area, &handoff, OTHER, root));
        assert!(other_area.holds(root));
        assert!(depart(&handoff, &mut other_area, OTHER, Some(low)).is_none());
        assert_eq!(root.marker(), NO_OWNER);
        assert!(handoff.snapshot(OTHER).is_none());
        check::verify_quiescent(anchor);
        assert_eq!(check::verify_structure(anchor), 3);

        let removed = remove_attempt(anchor, &handoff, ME, &5, &mut guard)
            .expect("nothing blocks the retry");
        assert!(removed);
        assert_eq!(check::verify_structure(anchor), 2);
        check::verify_quiescent(anchor);
        drop(guard);
        free_all(anchor);
    }

    #[test]
    fn a_blocked_fix_up_parks_without_giving_up_its_short_node() {
        let anchor = wire_anchor();
        let root = grow(anchor.child(Dir::Left), 10, Color::Black);
        grow(root.child(Dir::Right), 20, Color::Black);
        let short = root.child(Dir::Left);

        // the parent is in someone else's hands for a while; the fix-up
        // must hold the short node's claim the entire time it waits
        assert!(claim::try_acquire(root));
        assert!(claim::try_acquire(short));
        short.set_marker(ME);

        let handoff: HandoffTable<u64> = HandoffTable::new(4);
        std::thread::scope(|s| {
            let worker = s.spawn(|| {
                let mut area = LocalArea::new();
                area.remember(short);
                fix_after_remove(anchor, &handoff, ME, &mut area, short, None);
            });

            for _ in 0..100 {
                assert!(
                    short.flag.load(Ordering::Acquire),
                    "a parked deficit never gives up its claim"
                );
                assert_eq!(short.marker(), ME, "the deficit stays advertised");
                std::thread::yield_now();
            }
            claim::release(root);
            worker.join().expect("the fix-up settles once the parent frees");
        });

        assert_eq!(check::verify_structure(anchor), 2);
        check::verify_quiescent(anchor);
        free_all(anchor);
    }

    #[test]
    fn contention_exercises_the_surrender_path() {
        // a small keyspace keeps neighborhoods overlapping; churn until a
        // setup has actually handed its area to a blocked chain owner
        for _ in 0..64 {
            let before = SURRENDERED_AREAS.load(Ordering::Relaxed);
            let tree = crate::RbTree::<u64, 8, 8>::default();
            std::thread::scope(|s| {
                for worker in 0..3_u64 {
                    let handle = tree.clone();
                    s.spawn(move || {
                        for i in 0..4_000_u64 {
                            let key = i.wrapping_mul(13).wrapping_add(worker).wrapping_rem(16);
                            if i.wrapping_rem(3) == 0 {
                                handle.insert(key);
                            } else {
                                handle.remove(&key);
                            }
                        }
                    });
                }
            });
            tree.check_invariants();
            tree.assert_quiescent();
            if SURRENDERED_AREAS.load(Ordering::Relaxed) > before {
                return;
            }
        }
        panic!("sixty-four contended rounds never handed an area over");
    }
}
