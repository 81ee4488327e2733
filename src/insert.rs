//! Insert and its fix-up. Inserts never hold flags while waiting: any claim
//! that fails releases the whole working set, backs off, and resumes from
//! the node being repaired. The red-red violation an insert chases is
//! self-describing, so a resumed round that finds it already gone simply
//! leaves.

use crate::claim::{self, backoff, LocalArea};
use crate::marker;
use crate::navigate::{self, InsertSpot};
use crate::node::{rotate, Color, Node, NodeRef};
use crate::Retry;

/// One attempt at inserting `key`: walk to its slot, promote the sentinel
/// there, and rebalance. Fails only if the descent could not claim a path;
/// once the node is linked, the fix-up always runs to completion.
pub(crate) fn insert_attempt<K: Ord + Clone>(
    anchor: NodeRef<K>,
    key: &K,
    me: usize,
) -> Result<(), Retry> {
    let spot = navigate::find_slot(anchor, key)?;
    let left = NodeRef::from_owned(Node::sentinel());
    let right = NodeRef::from_owned(Node::sentinel());
    spot.target.promote(key.clone(), left, right);
    fix_after_insert(anchor, me, spot);
    Ok(())
}

/// Rebalances upward from a freshly promoted red node. On entry the spot's
/// three flags are held; on exit the tree is balanced and no flags are held.
fn fix_after_insert<K>(anchor: NodeRef<K>, me: usize, spot: InsertSpot<K>) {
    let mut area = LocalArea::new();
    area.remember(spot.sibling);
    area.remember(spot.parent);
    area.remember(spot.target);
    let mut x = spot.target;
    let mut attempt: u32 = 0;

    'round: loop {
        macro_rules! yield_and_resume {
            () => {{
                area.release_all();
                loop {
                    backoff(attempt);
                    attempt = attempt.saturating_add(1);
                    if x.is_retired() {
                        // someone deleted the node we were repairing, and
                        // rebalanced for its removal; the violation is gone
                        return;
                    }
                    if claim::try_acquire(x) {
                        break;
                    }
                }
                area.remember(x);
                continue 'round;
            }};
        }

        if x.color() == Color::Black {
            break;
        }
        let p = match claim::claim_parent_of(&mut area, x) {
            Ok(p) => p,
            Err(Retry) => yield_and_resume!(),
        };
        if p == anchor {
            x.set_color(Color::Black);
            break;
        }
        if p.color() == Color::Black {
            break;
        }
        let gp = match claim::claim_parent_of(&mut area, p) {
            Ok(gp) => gp,
            Err(Retry) => yield_and_resume!(),
        };
        if gp == anchor {
            p.set_color(Color::Black);
            break;
        }
        let side = gp.dir_of(p);
        let uncle = gp.child(side.opposite());
        if !area.holds(uncle) {
            if !claim::try_acquire(uncle) {
                yield_and_resume!();
            }
            area.remember(uncle);
        }

        if uncle.color() == Color::Red {
            p.set_color(Color::Black);
            uncle.set_color(Color::Black);
            gp.set_color(Color::Red);
            // any violation that remains now lives at the grandparent; track
            // it there before anything below can force a yield
            x = gp;
            attempt = 0;

            // climb: claim the neighborhood two levels up before letting the
            // old one go, so the owned region never has a gap another
            // operation could restructure through
            let q = match claim::claim_parent_of(&mut area, gp) {
                Ok(q) => q,
                Err(Retry) => yield_and_resume!(),
            };
            let mut keep = vec![gp, q];
            if q != anchor {
                let qq = match claim::claim_parent_of(&mut area, q) {
                    Ok(qq) => qq,
                    Err(Retry) => yield_and_resume!(),
                };
                let next_uncle = qq.other_child(q);
                if !area.holds(next_uncle) {
                    if !claim::try_acquire(next_uncle) {
                        yield_and_resume!();
                    }
                    area.remember(next_uncle);
                }
                keep.push(qq);
                keep.push(next_uncle);
            }
            for node in area.nodes().to_vec() {
                if !keep.contains(&node) {
                    area.release(node);
                }
            }
            continue 'round;
        }

        // uncle black: one or two rotations finish the repair
        let high = if p.dir_of(x) != side {
            // inner child: straighten the zig-zag first
            if marker::blocks_rotation(p, x, me) {
                yield_and_resume!();
            }
            let raised = rotate(p, side);
            // the red pair inverted; a resume must chase the lower node
            x = raised.child(side);
            raised
        } else {
            p
        };
        if let Err(Retry) = claim::claim_parent_of(&mut area, gp) {
            yield_and_resume!();
        }
        if marker::blocks_rotation(gp, high, me) {
            yield_and_resume!();
        }
        high.set_color(Color::Black);
        gp.set_color(Color::Red);
        let raised = rotate(gp, side.opposite());
        assert!(raised == high, "the red parent rises in the final rotation");
        break;
    }

    area.release_all();
}
