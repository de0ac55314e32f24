//! Cross-tree ghost/overlap discovery.
//!
//! Given a local tree and a buffer of remote candidate quadrants each
//! tagged with the tree they were queried against, [`compute_overlap`]
//! finds every locally-owned quadrant that some remote process needs a
//! copy of in order to see one level of 2:1-consistent neighbors across
//! a tree boundary. The candidates in `in` are themselves the insulation
//! layer of a *remote* process's owned quadrants, projected into this
//! tree's coordinate frame by the caller; this module only has to match
//! them against the local window and answer which of our quadrants are
//! close enough to matter.

use forest_connectivity::Connectivity;
use forest_quadrant::{translate_across_face, Quadrant, MAX_LEVEL, ROOT_LEN};
use forest_tree::Tree;
use smallvec::SmallVec;

/// A quadrant paired with the tree it belongs to (or, in the overlap
/// buffers, the tree it is a query against).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaggedQuadrant {
    pub quadrant: Quadrant,
    pub tree: u32,
}

impl TaggedQuadrant {
    #[must_use]
    pub fn new(quadrant: Quadrant, tree: u32) -> Self {
        Self { quadrant, tree }
    }
}

/// The piggy-extended total order: primarily by quadrant, with the tree
/// tag as tiebreaker so that per-tree runs of an otherwise-equal quadrant
/// sort together.
impl PartialOrd for TaggedQuadrant {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaggedQuadrant {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.quadrant
            .cmp(&other.quadrant)
            .then_with(|| self.tree.cmp(&other.tree))
    }
}

/// The eight quadrants adjacent to `q` on the same level, in `(row,
/// col)` iteration order skipping `q` itself; the 3x3 layer minus its
/// center.
#[must_use]
pub fn insulation_layer(q: Quadrant) -> SmallVec<[Quadrant; 8]> {
    let h = q.side_len();
    let mut layer = SmallVec::new();
    for k in -1i64..=1 {
        for l in -1i64..=1 {
            if k == 0 && l == 0 {
                continue;
            }
            layer.push(Quadrant::new(q.x + l * h, q.y + k * h, q.level));
        }
    }
    layer
}

/// Walks `q` up towards `level`, at each step taking the sibling at
/// `corner`; returns the deepest level `>= level` at which that sibling
/// still lies within the root on the sides `corner` requires. This is
/// the shallowest level at which a single quadrant across the corner
/// suffices to cover every finer quadrant touching it from our side.
#[must_use]
pub fn corner_level(q: Quadrant, corner: u8, level: u8) -> u8 {
    const STEPS: [(i64, i64); 4] = [(-1, -1), (1, -1), (-1, 1), (1, 1)];
    let (stepx, stepy) = STEPS[corner as usize];

    let mut quad = q;
    while quad.level > level {
        let th = ROOT_LEN - Quadrant::side_len_at(quad.level);
        let sibling = quad.sibling(corner);
        let inside = match corner {
            0 => sibling.x <= 0 && sibling.y <= 0,
            1 => sibling.x >= th && sibling.y <= 0,
            2 => sibling.x <= 0 && sibling.y >= th,
            3 => sibling.x >= th && sibling.y >= th,
            _ => unreachable!("corner out of range"),
        };
        if inside {
            return quad.level;
        }
        let parent = quad.parent();
        let h = Quadrant::side_len_at(parent.level);
        quad = Quadrant::new(parent.x + stepx * h, parent.y + stepy * h, parent.level);
    }
    level
}

/// Builds the extended quadrant anchored one cell outside the receiving
/// tree at `corner`, at `level`: the minimal single quadrant that covers
/// everything [`corner_level`] found on our side.
#[must_use]
pub fn corner_quadrant(corner: u8, level: u8) -> Quadrant {
    let lshift = -Quadrant::side_len_at(level);
    let rshift = ROOT_LEN;
    let (x, y) = match corner {
        0 => (lshift, lshift),
        1 => (rshift, lshift),
        2 => (lshift, rshift),
        3 => (rshift, rshift),
        _ => unreachable!("corner out of range"),
    };
    Quadrant::new(x, y, level)
}

/// For every candidate in `input` tagged with `tree_index`, finds the
/// locally-owned quadrants (in `tree`) that a remote neighbor across
/// that candidate's insulation layer would need, and appends them to
/// `output` tagged with the tree that should receive them.
///
/// `input` candidates that are inside the root are queried against
/// `tree` directly (same-tree overlap, used e.g. to re-derive a
/// neighbor's view after balance). Candidates that stick out of the
/// root on one axis are face-crossing; on two axes, corner-crossing.
pub fn compute_overlap(
    conn: &Connectivity,
    tree_index: u32,
    tree: &Tree,
    input: &[TaggedQuadrant],
    output: &mut Vec<TaggedQuadrant>,
) {
    let quadrants = tree.quadrants();
    if quadrants.is_empty() {
        return;
    }
    let tree_fd = quadrants[0].first_descendant(MAX_LEVEL);
    let tree_ld = quadrants[quadrants.len() - 1].last_descendant(MAX_LEVEL);

    for tagged in input {
        if tagged.tree != tree_index {
            continue;
        }
        let inq = tagged.quadrant;

        let mut corner: Option<u8> = None;
        let mut face: Option<u8> = None;
        let mut ntree = tree_index;

        if !inq.is_inside_root() {
            // Face ids follow the connectivity's convention: 0 = -y, 1 =
            // +x, 2 = +y, 3 = -x. A corner id is then the x/y outface
            // bits packed the same way `Transform::transform_corner`
            // reads a corner id: bit 0 x-side, bit 1 y-side.
            let outface = inq.outface();
            let is_corner = (outface[0] || outface[2]) && (outface[1] || outface[3]);
            if is_corner {
                corner = Some(u8::from(outface[1]) | (u8::from(outface[2]) << 1));
            } else {
                let f = outface
                    .iter()
                    .position(|&x| x)
                    .expect("extended quadrant must set at least one outface flag")
                    as u8;
                face = Some(f);
                ntree = conn.tree_to_tree[tree_index as usize][f as usize];
            }
        }

        for s in insulation_layer(inq) {
            if !s.is_inside_root() {
                continue;
            }
            let fd = s.first_descendant(MAX_LEVEL);
            let ld = s.last_descendant(MAX_LEVEL);
            if ld < tree_fd || tree_ld < fd {
                continue;
            }

            let first = if fd <= tree_fd {
                0
            } else {
                quadrants.partition_point(|t| t.last_descendant(MAX_LEVEL) < fd)
            };
            if first >= quadrants.len() {
                continue;
            }
            let last = if tree_ld <= ld {
                quadrants.len() - 1
            } else {
                let idx = quadrants.partition_point(|t| t.first_descendant(MAX_LEVEL) <= ld);
                if idx == 0 {
                    continue;
                }
                idx - 1
            };
            if first > last {
                continue;
            }
            let window = &quadrants[first..=last];

            if let Some(c) = corner {
                let mut level = 0u8;
                for tq in window {
                    if tq.level > level {
                        level = corner_level(*tq, c, level);
                    }
                }
                for (ntree2, ncorner) in conn.corner_info(tree_index, c) {
                    output.push(TaggedQuadrant::new(corner_quadrant(ncorner, level), ntree2));
                }
            } else {
                for tq in window {
                    if tq.level > inq.level + 1 {
                        let out_q = match face {
                            Some(f) => conn
                                .face_transform(tree_index, f)
                                .apply(translate_across_face(*tq, f)),
                            None => *tq,
                        };
                        output.push(TaggedQuadrant::new(out_q, ntree));
                    }
                }
            }
        }
    }
}

/// Sorts `out` by the piggy-extended total order, drops duplicates, and
/// drops anything also present in `not` (typically the receiver's own
/// quadrants, so it isn't sent a copy of something it already owns).
pub fn uniqify_overlap(out: &mut Vec<TaggedQuadrant>, not: &[TaggedQuadrant]) {
    out.sort_unstable();
    out.dedup();
    if not.is_empty() {
        return;
    }
    let mut sorted_not = not.to_vec();
    sorted_not.sort_unstable();
    out.retain(|tq| sorted_not.binary_search(tq).is_err());
}

#[cfg(test)]
mod tests {
    use super::*;
    use forest_tree::Payload;

    const L_SHAPE: &str = include_str!("../../forest_connectivity/tests/fixtures/l_shape.mesh");

    #[test]
    fn insulation_layer_has_eight_same_level_neighbors() {
        let q = Quadrant::new(ROOT_LEN / 2, ROOT_LEN / 2, 4);
        let layer = insulation_layer(q);
        assert_eq!(layer.len(), 8);
        assert!(layer.iter().all(|n| n.level == q.level));
        assert!(!layer.contains(&q));
    }

    #[test]
    fn corner_level_returns_its_own_level_when_already_at_the_corner() {
        // A quadrant that already sits at the tree's own corner 0 is its
        // own corner-0 sibling, so no promotion is needed.
        let leaf = Quadrant::root().child(0).child(0).child(0);
        let level = corner_level(leaf, 0, 0);
        assert_eq!(level, leaf.level);
    }

    #[test]
    fn corner_level_promotes_until_the_sibling_reaches_the_corner() {
        // A quadrant offset from corner 0 by one cell at level 1 needs one
        // promotion before its corner-0 sibling actually touches corner 0.
        let leaf = Quadrant::root().child(3).child(0);
        let level = corner_level(leaf, 0, 0);
        assert_eq!(level, 1);
    }

    #[test]
    fn corner_level_never_promotes_past_the_floor() {
        let leaf = Quadrant::root().child(3).child(3);
        let level = corner_level(leaf, 0, leaf.level);
        assert_eq!(level, leaf.level);
    }

    #[test]
    fn face_crossing_overlap_lands_in_the_neighbor_tree() {
        let conn = Connectivity::read_str(L_SHAPE).unwrap();

        // Tree 0's +y face (local y = 1, corners 2 and 3) shares its two
        // vertices with tree 2's -y face (local y = 0, corners 0 and 1),
        // straight from the fixture's vertex table -- independent of
        // whatever face id compute_overlap itself assigns to "+y".
        assert_eq!(conn.tree_to_vertex[0][2], conn.tree_to_vertex[2][0]);
        assert_eq!(conn.tree_to_vertex[0][3], conn.tree_to_vertex[2][1]);
        let expected_neighbor = 2u32;

        let mut tree = Tree::new(0);
        // A full level-1 refinement of tree 0, so something is deep enough
        // (level > inq.level + 1) to be worth sending.
        for q in Quadrant::root().children() {
            for c in q.children() {
                tree.insert(c, Payload::None);
            }
        }

        // A remote quadrant that pokes one cell across tree 0's +y face,
        // at level 1: y >= ROOT_LEN.
        let remote = Quadrant::new(0, ROOT_LEN, 1);
        let input = vec![TaggedQuadrant::new(remote, 0)];
        let mut output = Vec::new();
        compute_overlap(&conn, 0, &tree, &input, &mut output);

        assert!(!output.is_empty());
        assert!(output.iter().all(|tq| tq.tree == expected_neighbor));
    }

    #[test]
    fn same_tree_candidates_are_ignored_for_other_trees() {
        let conn = Connectivity::read_str(L_SHAPE).unwrap();
        let mut tree = Tree::new(0);
        tree.insert(Quadrant::root(), Payload::None);
        let input = vec![TaggedQuadrant::new(Quadrant::root(), 1)];
        let mut output = Vec::new();
        compute_overlap(&conn, 0, &tree, &input, &mut output);
        assert!(output.is_empty());
    }

    #[test]
    fn uniqify_drops_duplicates_and_the_not_filter() {
        let a = TaggedQuadrant::new(Quadrant::root().child(0), 0);
        let b = TaggedQuadrant::new(Quadrant::root().child(1), 0);
        let mut out = vec![a, b, a];
        uniqify_overlap(&mut out, &[b]);
        assert_eq!(out, vec![a]);
    }
}
