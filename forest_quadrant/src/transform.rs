//! The eight symmetry transforms relating a quadrant's coordinate frame in
//! one tree to the frame of a face- or corner-adjacent tree.
//!
//! Two trees sharing a face may disagree about which direction is "up":
//! the transform code recorded in the connectivity's `tree_to_face` table
//! says how to rotate or reflect a quadrant's local coordinates before it
//! is meaningful in the neighbor's frame. The eight codes are the dihedral
//! group of the square: identity, three rotations, four reflections.

use crate::{Quadrant, MAX_LEVEL, ROOT_LEN};

/// One of the eight symmetries of the square, applied to a quadrant's
/// local `(x, y)` coordinates (face 0-3) or to a corner id (0-3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transform {
    Identity,
    Rotate90,
    Rotate180,
    Rotate270,
    ReflectHorizontal,
    ReflectVertical,
    ReflectDiagonal,
    ReflectAntiDiagonal,
}

impl Transform {
    /// All eight codes, in the order used to index a connectivity's
    /// `tree_to_face` transform field.
    pub const ALL: [Transform; 8] = [
        Transform::Identity,
        Transform::Rotate90,
        Transform::Rotate180,
        Transform::Rotate270,
        Transform::ReflectHorizontal,
        Transform::ReflectVertical,
        Transform::ReflectDiagonal,
        Transform::ReflectAntiDiagonal,
    ];

    /// Decodes a transform code `0..8` as stored in a connectivity file.
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        Self::ALL[code as usize % 8]
    }

    /// Encodes this transform back to its `0..8` code.
    #[must_use]
    pub fn code(self) -> u8 {
        Self::ALL.iter().position(|t| *t == self).unwrap() as u8
    }

    /// The transform that undoes this one.
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Transform::Rotate90 => Transform::Rotate270,
            Transform::Rotate270 => Transform::Rotate90,
            other => other,
        }
    }

    /// Applies the transform to `q`'s coordinates, keeping its level and
    /// hence its side length fixed. `th` is the last valid offset at that
    /// level (`ROOT_LEN - side_len`), the pivot every rotation/reflection
    /// is taken about.
    #[must_use]
    pub fn apply(self, q: Quadrant) -> Quadrant {
        let th = ROOT_LEN - q.side_len();
        let (x, y) = self.map(q.x, q.y, th);
        Quadrant::new(x, y, q.level)
    }

    fn map(self, x: i64, y: i64, th: i64) -> (i64, i64) {
        match self {
            Transform::Identity => (x, y),
            Transform::Rotate90 => (y, th - x),
            Transform::Rotate180 => (th - x, th - y),
            Transform::Rotate270 => (th - y, x),
            Transform::ReflectHorizontal => (x, th - y),
            Transform::ReflectVertical => (th - x, y),
            Transform::ReflectDiagonal => (y, x),
            Transform::ReflectAntiDiagonal => (th - y, th - x),
        }
    }

    /// Applies the same symmetry to a corner id (`0..4`, bit 0 = x side,
    /// bit 1 = y side) so that corner identities stay consistent across a
    /// coordinate transform.
    #[must_use]
    pub fn transform_corner(self, corner: u8) -> u8 {
        debug_assert!(corner < 4);
        let x = (corner & 1) as i64;
        let y = ((corner >> 1) & 1) as i64;
        let (tx, ty) = self.map(x, y, 1);
        (tx as u8) | ((ty as u8) << 1)
    }
}

/// Translates an extended quadrant across a face boundary (face `0..4`:
/// `-y, +x, +y, -x`) by one root length, so that it becomes an extended
/// quadrant expressed in the neighbor tree's *untransformed* coordinate
/// frame. Apply the neighbor's [`Transform`] afterward to land in its
/// local frame.
#[must_use]
pub fn translate_across_face(q: Quadrant, face: u8) -> Quadrant {
    debug_assert!(q.level <= MAX_LEVEL);
    let (dx, dy) = match face {
        0 => (0, ROOT_LEN),
        1 => (-ROOT_LEN, 0),
        2 => (0, -ROOT_LEN),
        3 => (ROOT_LEN, 0),
        _ => panic!("face out of range"),
    };
    Quadrant::new(q.x + dx, q.y + dy, q.level)
}
