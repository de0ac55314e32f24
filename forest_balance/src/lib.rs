//! The 2:1 balance engine.
//!
//! [`balance`] completes a tree (fills any gaps so it tiles its bounding
//! region) and, unless [`BalanceMode::None`] is requested, enforces that no
//! two face-adjacent quadrants (and, in [`BalanceMode::EdgeCorner`], no two
//! corner-adjacent quadrants) differ by more than one level.
//!
//! The algorithm walks levels bottom-up. At each level it considers every
//! quadrant already present (in the input or freshly generated at that
//! level) and generates a small set of *candidate relatives*: its missing
//! siblings, its parent, and the parent's three indirect neighbors (the
//! parent-level neighbors not reachable by flipping `q`'s own bits). A
//! level-bucketed hash deduplicates candidates against each other and
//! against the input, so each candidate is considered exactly once.

use forest_quadrant::{Quadrant, MAX_LEVEL};
use forest_tree::{Payload, Tree};
use hashbrown::HashMap;

/// How aggressively to enforce the 2:1 level constraint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BalanceMode {
    /// Complete the tree but do not enforce any level constraint.
    None,
    /// Enforce 2:1 across faces only.
    Edge,
    /// Enforce 2:1 across faces and corners.
    EdgeCorner,
}

/// The offsets of the 3 indirect neighbors in units of the parent's side
/// length, indexed `[child_id][neighbor]`. Neighbors are listed in Morton
/// order among themselves.
const INDIRECT_NEIGHBORS: [[(i64, i64); 3]; 4] = [
    [(-1, -1), (1, -1), (-1, 1)],
    [(0, -1), (2, -1), (1, 0)],
    [(-1, 0), (-2, 1), (0, 1)],
    [(1, -1), (-1, 1), (1, 1)],
];

/// Which of the 3 indirect neighbors is corner-only (needed for
/// corner balance but not edge balance), indexed by parent child id.
const CORNERS_OMITTED: [usize; 4] = [0, 1, 1, 2];

/// Completes `tree` and, per `mode`, balances it to a 2:1 level constraint.
///
/// The tree's input order must be *almost sorted* (see
/// [`Tree::is_almost_sorted`]); it is rebuilt, sorted, and linearized
/// in place.
pub fn balance(tree: &mut Tree, mode: BalanceMode) {
    let bbound = if mode == BalanceMode::None { 5 } else { 8 };
    let (quadrants, payloads) = tree.take_all();
    let incount = quadrants.len();
    if incount <= 1 {
        tree.replace_all(quadrants, payloads);
        return;
    }

    let inmaxl = quadrants.iter().map(|q| q.level).max().unwrap_or(0);

    let Some(first_inside) = quadrants.iter().position(Quadrant::is_inside_root) else {
        // Only extended (out-of-tree) quadrants: nothing to balance.
        tree.replace_all(quadrants, payloads);
        return;
    };
    let tree_first = quadrants[first_inside].first_descendant(inmaxl);
    let mut tree_last = quadrants[first_inside].last_descendant(inmaxl);
    for q in &quadrants[first_inside + 1..] {
        if !q.is_inside_root() {
            break;
        }
        let ld = q.last_descendant(inmaxl);
        if tree_last < ld {
            tree_last = ld;
        }
    }

    // hash[level] maps a candidate quadrant to whether it was inserted as
    // someone's parent (sid == 4), which lets a later sibling short-circuit
    // re-deriving the same parent's indirect neighbors.
    let mut hash: HashMap<Quadrant, bool> = HashMap::new();
    let mut outlist: Vec<Vec<Quadrant>> = vec![Vec::new(); MAX_LEVEL as usize + 1];

    for l in (1..=inmaxl).rev() {
        let level = l as usize;
        let ocount = outlist[level].len();
        let mut i = 0usize;
        while i < incount + ocount {
            let (q, isfamily) = if i < incount {
                let q = quadrants[i];
                if q.level != l {
                    i += 1;
                    continue;
                }
                let isfamily = i + 4 <= incount
                    && Quadrant::is_family(
                        &quadrants[i],
                        &quadrants[i + 1],
                        &quadrants[i + 2],
                        &quadrants[i + 3],
                    );
                (q, isfamily)
            } else {
                (outlist[level][i - incount], false)
            };

            generate_candidates(
                q, isfamily, mode, bbound, inmaxl, &tree_first, &tree_last, &quadrants, &mut hash,
                &mut outlist,
            );

            i += if isfamily { 4 } else { 1 };
        }
    }

    tree.replace_all(quadrants, payloads);
    for level_list in outlist {
        for q in level_list {
            let payload = tree.default_payload();
            tree.insert(q, payload);
        }
    }

    sort_tree(tree);
    forest_linearize::linearize(tree);
}

/// Generates and records the candidate relatives of `q` at its own level:
/// missing siblings, its parent, and (when `bbound > 5`) the parent's three
/// indirect neighbors.
#[allow(clippy::too_many_arguments)]
fn generate_candidates(
    q: Quadrant,
    isfamily: bool,
    mode: BalanceMode,
    bbound: usize,
    inmaxl: u8,
    tree_first: &Quadrant,
    tree_last: &Quadrant,
    inlist: &[Quadrant],
    hash: &mut HashMap<Quadrant, bool>,
    outlist: &mut [Vec<Quadrant>],
) {
    let is_outroot = !q.is_inside_root();
    let qid = q.child_id_or_root() as usize;
    let mut parent = q.parent();
    let mut ph = 0i64;
    let mut pid = 0usize;

    let mut sid = 0usize;
    while sid < bbound {
        let candidate = if sid < 4 {
            if qid == sid || isfamily || is_outroot {
                sid += 1;
                continue;
            }
            q.sibling(sid as u8)
        } else if sid == 4 {
            parent = q.parent();
            if bbound > 5 {
                ph = Quadrant::side_len_at(parent.level);
                pid = parent.child_id_or_root() as usize;
            }
            parent
        } else {
            let idx = sid - 5;
            if mode != BalanceMode::EdgeCorner && idx == CORNERS_OMITTED[pid] {
                sid += 1;
                continue;
            }
            let (dx, dy) = INDIRECT_NEIGHBORS[pid][idx];
            let candidate = Quadrant::new(parent.x + dx * ph, parent.y + dy * ph, parent.level);
            let outface = candidate.outface();
            if is_outroot {
                if (outface[0] || outface[2]) && (outface[1] || outface[3]) {
                    // Across the corner from an already-outside quadrant:
                    // belongs to a different tree entirely.
                    sid += 1;
                    continue;
                }
            } else if outface.iter().any(|&f| f) {
                // q is inside the tree but this relative falls outside the
                // root: belongs to a neighbor tree, handled by overlap.
                sid += 1;
                continue;
            }
            candidate
        };

        if candidate.is_inside_root() {
            let ld = candidate.last_descendant(inmaxl);
            let before_tree_first = *tree_first > candidate
                && (candidate.x != tree_first.x || candidate.y != tree_first.y);
            if before_tree_first || ld > *tree_last {
                // Inside the root, but outside this tree's owned window.
                sid += 1;
                continue;
            }
        }

        if let Some(&is_parent_marker) = hash.get(&candidate) {
            if sid == 4 && is_parent_marker {
                // This parent's relatives were already generated by an
                // earlier sibling; nothing further to do for q.
                break;
            }
            sid += 1;
            continue;
        }
        if inlist.binary_search(&candidate).is_ok() {
            sid += 1;
            continue;
        }

        hash.insert(candidate, sid == 4);
        outlist[candidate.level as usize].push(candidate);
        sid += 1;
    }
}

/// Sorts a tree's quadrants (and their payloads in lockstep) into Morton
/// order, without disturbing which payload belongs to which quadrant.
fn sort_tree(tree: &mut Tree) {
    let (quadrants, payloads) = tree.take_all();
    let mut order: Vec<usize> = (0..quadrants.len()).collect();
    order.sort_by(|&a, &b| quadrants[a].cmp(&quadrants[b]));

    let sorted_quadrants: Vec<Quadrant> = order.iter().map(|&i| quadrants[i]).collect();
    let mut slots: Vec<Option<Payload>> = payloads.into_iter().map(Some).collect();
    let sorted_payloads: Vec<Payload> = order.iter().map(|&i| slots[i].take().unwrap()).collect();

    tree.replace_all(sorted_quadrants, sorted_payloads);
}

#[cfg(test)]
mod tests {
    use super::*;
    use forest_quadrant::Quadrant;

    fn every_face_neighbor_differs_by_at_most_one_level(tree: &Tree) -> bool {
        let quadrants = tree.quadrants();
        for (i, q) in quadrants.iter().enumerate() {
            for r in &quadrants[i + 1..] {
                if !q.is_sibling(r) && faces_touch(q, r) && q.level.abs_diff(r.level) > 1 {
                    return false;
                }
            }
        }
        true
    }

    fn faces_touch(q: &Quadrant, r: &Quadrant) -> bool {
        let (qh, rh) = (q.side_len(), r.side_len());
        let x_touch = (q.x + qh == r.x || r.x + rh == q.x) && q.y < r.y + rh && r.y < q.y + qh;
        let y_touch = (q.y + qh == r.y || r.y + rh == q.y) && q.x < r.x + rh && r.x < q.x + qh;
        x_touch || y_touch
    }

    #[test]
    fn balances_a_single_deep_insertion_to_2_1() {
        // One quadrant at level 5 amid an otherwise unrefined tree (just
        // the root quadrant).
        let mut tree = Tree::new(0);
        let deep = Quadrant::root().child(0).child(0).child(0).child(0).child(0);
        tree.insert(Quadrant::root(), Payload::None);
        tree.insert(deep, Payload::None);

        balance(&mut tree, BalanceMode::EdgeCorner);

        assert!(tree.is_sorted());
        assert!(tree.is_linear());
        assert!(tree.is_complete());
        assert!(every_face_neighbor_differs_by_at_most_one_level(&tree));
    }

    #[test]
    fn mode_none_only_completes() {
        let mut tree = Tree::new(0);
        tree.insert(Quadrant::root().child(0), Payload::None);
        tree.insert(Quadrant::root().child(3), Payload::None);
        balance(&mut tree, BalanceMode::None);
        assert!(tree.is_complete());
    }

    #[test]
    fn balance_is_idempotent_on_already_balanced_input() {
        let mut tree = Tree::new(0);
        tree.insert(Quadrant::root().child(0), Payload::None);
        tree.insert(Quadrant::root().child(3), Payload::None);
        balance(&mut tree, BalanceMode::EdgeCorner);
        let first_pass_len = tree.len();
        balance(&mut tree, BalanceMode::EdgeCorner);
        assert_eq!(tree.len(), first_pass_len);
    }

    #[test]
    fn pool_outstanding_matches_final_quadrant_count() {
        let mut tree = Tree::new(8);
        tree.insert(Quadrant::root().child(0), Payload::User(Vec::new()));
        tree.insert(Quadrant::root().child(3), Payload::User(Vec::new()));
        balance(&mut tree, BalanceMode::EdgeCorner);
        assert_eq!(tree.pool_outstanding(), tree.len() as u64);
    }
}
