//! Region completion: filling the gap between two quadrants of the same
//! tree with the minimum set of equal-sized squares needed to tile it.
//!
//! Given `a < b`, [`complete_region`] builds the unique linear complete
//! sequence whose first element is (at least) `a` and whose last is (at
//! most) `b`, writing it into an empty [`Tree`].

use forest_quadrant::Quadrant;
use forest_tree::Tree;

/// Fills `tree` (which must be empty) with the minimal linear complete
/// quadrant sequence spanning `[a, b]`.
///
/// `include_a`/`include_b` control whether the endpoints themselves are
/// part of the output, or only the quadrants strictly between them.
/// `a` and `b` must be extended quadrants of the same tree with `a < b`.
pub fn complete_region(a: Quadrant, include_a: bool, b: Quadrant, include_b: bool, tree: &mut Tree) {
    debug_assert!(tree.is_empty(), "complete_region requires an empty tree");
    debug_assert!(a.is_extended() && b.is_extended());
    debug_assert!(a < b, "complete_region requires a < b");

    if include_a {
        insert(tree, a);
    }

    let finest_ancestor = a.nearest_common_ancestor(&b);
    let mut stack: Vec<Quadrant> = Vec::new();
    push_children(&mut stack, &finest_ancestor);

    while let Some(w) = stack.pop() {
        if a < w && w < b && !w.is_ancestor(&b) {
            insert(tree, w);
        } else if w.is_ancestor(&a) || w.is_ancestor(&b) {
            push_children(&mut stack, &w);
        }
    }

    if include_b {
        insert(tree, b);
    }

    debug_assert!(tree.is_complete());
}

/// Pushes `q`'s four children onto `stack` so that popping them back off
/// yields Morton order: the stack is a LIFO, so children go on in reverse.
fn push_children(stack: &mut Vec<Quadrant>, q: &Quadrant) {
    for id in (0..4u8).rev() {
        stack.push(q.child(id));
    }
}

fn insert(tree: &mut Tree, q: Quadrant) {
    let payload = tree.default_payload();
    tree.insert(q, payload);
}

#[cfg(test)]
mod tests {
    use super::*;
    use forest_quadrant::ROOT_LEN;

    #[test]
    fn completes_the_canonical_scenario() {
        // Root-tree, a=(0,0,L=1), b=(R-h(3), R-h(3), L=3), both endpoints
        // included.
        let h3 = Quadrant::side_len_at(3);
        let a = Quadrant::new(0, 0, 1);
        let b = Quadrant::new(ROOT_LEN - h3, ROOT_LEN - h3, 3);
        let mut tree = Tree::new(0);
        complete_region(a, true, b, true, &mut tree);

        assert!(tree.is_complete());
        assert!(tree.is_sorted());
        assert_eq!(*tree.quadrants().first().unwrap(), a);
        assert_eq!(*tree.quadrants().last().unwrap(), b);
    }

    #[test]
    fn union_of_output_equals_the_morton_interval() {
        let a = Quadrant::root().child(0).child(2);
        let b = Quadrant::root().child(3);
        let mut tree = Tree::new(0);
        complete_region(a, true, b, true, &mut tree);

        // Every emitted quadrant must lie within [a, b], and the sequence
        // must have no gaps (is_complete), which together with sortedness
        // establishes the closed Morton interval is exactly tiled.
        for q in tree.quadrants() {
            assert!(a <= *q && *q <= b);
        }
        assert!(tree.is_complete());
    }

    #[test]
    fn excluding_endpoints_drops_them_from_the_output() {
        let a = Quadrant::root().child(0);
        let b = Quadrant::root().child(3);
        let mut tree = Tree::new(0);
        complete_region(a, false, b, false, &mut tree);
        assert!(tree.quadrants().iter().all(|q| *q != a && *q != b));
    }

    #[test]
    fn allocates_a_user_payload_per_quadrant_when_the_tree_carries_data() {
        let a = Quadrant::root().child(0);
        let b = Quadrant::root().child(3);
        let mut tree = Tree::new(8);
        complete_region(a, true, b, true, &mut tree);
        assert_eq!(tree.pool_outstanding(), tree.len() as u64);
    }
}
