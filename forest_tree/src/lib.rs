//! A single tree's ordered quadrant sequence.
//!
//! A [`Tree`] holds the quadrants belonging to one macro-cell, kept in the
//! Morton total order defined by `forest_quadrant`. Each quadrant carries
//! a [`Payload`]: either nothing, an opaque user byte buffer (checked out
//! of a [`Pool`]), or a *piggy* tree tag used only while quadrants are in
//! transit between trees (region completion scratch, transport buffers).
//!
//! ```rust
//! use forest_quadrant::Quadrant;
//! use forest_tree::{Payload, Tree};
//!
//! let mut tree = Tree::new(4);
//! tree.insert(Quadrant::root(), Payload::None);
//! assert!(tree.is_sorted());
//! assert_eq!(tree.len(), 1);
//! ```

mod pool;

pub use pool::Pool;

use forest_quadrant::{Quadrant, MAX_LEVEL};

/// What a quadrant carries while it lives in a tree or in transit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// No attached data.
    None,
    /// Opaque user bytes, checked out of the tree's user-data pool.
    User(Vec<u8>),
    /// A tree index, used to tag a quadrant while it is in a transport
    /// buffer rather than living inside a tree (region completion
    /// scratch, ghost/overlap output, partition wire payloads).
    Piggy(u32),
}

/// An ordered sequence of quadrants belonging to one macro-cell.
#[derive(Debug)]
pub struct Tree {
    quadrants: Vec<Quadrant>,
    payloads: Vec<Payload>,
    per_level: Vec<u32>,
    max_level: u8,
    data_size: usize,
    user_data_pool: Pool<Vec<u8>>,
}

impl Tree {
    /// An empty tree whose user payloads are `data_size` bytes each.
    #[must_use]
    pub fn new(data_size: usize) -> Self {
        Self {
            quadrants: Vec::new(),
            payloads: Vec::new(),
            per_level: vec![0; MAX_LEVEL as usize + 1],
            max_level: 0,
            data_size,
            user_data_pool: Pool::new(),
        }
    }

    /// Number of quadrants in the tree.
    #[must_use]
    pub fn len(&self) -> usize {
        self.quadrants.len()
    }

    /// `true` if the tree has no quadrants.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.quadrants.is_empty()
    }

    /// The quadrants, in their current order.
    #[must_use]
    pub fn quadrants(&self) -> &[Quadrant] {
        &self.quadrants
    }

    /// The payload of the quadrant at `index`.
    #[must_use]
    pub fn payload(&self, index: usize) -> &Payload {
        &self.payloads[index]
    }

    /// Count of quadrants at each level, index `0..=MAX_LEVEL`.
    #[must_use]
    pub fn per_level(&self) -> &[u32] {
        &self.per_level
    }

    /// The deepest level with at least one quadrant (`0` if empty).
    #[must_use]
    pub fn max_level(&self) -> u8 {
        self.max_level
    }

    /// Appends a quadrant at the end of the current sequence, without
    /// checking order. Allocates a fresh user-data buffer if `payload` is
    /// [`Payload::User`] and the buffer is empty, checking it out of the
    /// tree's pool.
    pub fn insert(&mut self, q: Quadrant, payload: Payload) {
        let payload = match payload {
            Payload::User(bytes) if bytes.is_empty() && self.data_size > 0 => {
                Payload::User(self.user_data_pool.alloc(|| vec![0u8; self.data_size]))
            }
            other => other,
        };
        self.per_level[q.level as usize] += 1;
        self.max_level = self.max_level.max(q.level);
        self.quadrants.push(q);
        self.payloads.push(payload);
    }

    /// Builds a [`Payload`] carrying a copy of `bytes`, checking a buffer
    /// out of the tree's pool rather than adopting `bytes` directly. Used
    /// when payload content arrives from outside the tree (partition's
    /// wire transfer) and must still be accounted for by the pool's
    /// outstanding-allocation invariant before it reaches
    /// [`Tree::insert`]/[`Tree::replace_all`].
    #[must_use]
    pub fn checkout_user_payload(&mut self, bytes: &[u8]) -> Payload {
        if self.data_size == 0 {
            return Payload::None;
        }
        debug_assert_eq!(bytes.len(), self.data_size);
        let mut buf = self.user_data_pool.alloc(|| vec![0u8; self.data_size]);
        buf.copy_from_slice(bytes);
        Payload::User(buf)
    }

    /// Removes the quadrant at `index`, returning its payload's backing
    /// buffer (if any) to the user-data pool.
    pub fn remove(&mut self, index: usize) -> Quadrant {
        let q = self.quadrants.remove(index);
        let payload = self.payloads.remove(index);
        self.per_level[q.level as usize] -= 1;
        if let Payload::User(bytes) = payload {
            self.user_data_pool.free(bytes);
        }
        q
    }

    /// Replaces the whole quadrant sequence (used by linearization,
    /// balance, and partition once they have computed the new contents)
    /// and recomputes `per_level`/`max_level` from scratch.
    pub fn replace_all(&mut self, quadrants: Vec<Quadrant>, payloads: Vec<Payload>) {
        debug_assert_eq!(quadrants.len(), payloads.len());
        for payload in self.payloads.drain(..) {
            if let Payload::User(bytes) = payload {
                self.user_data_pool.free(bytes);
            }
        }
        self.quadrants = quadrants;
        self.payloads = payloads;
        self.recompute_levels();
    }

    /// Moves the tree's quadrants and payloads out, leaving it empty, for
    /// an algorithm (linearization, balance, region completion) to rebuild
    /// from scratch via [`Tree::replace_all`]. Ownership of any
    /// [`Payload::User`] buffer moves with it; a caller that drops one
    /// without re-inserting it must return it via [`Tree::free_payload`]
    /// first, or the pool's outstanding count will never balance.
    pub fn take_all(&mut self) -> (Vec<Quadrant>, Vec<Payload>) {
        self.per_level.iter_mut().for_each(|c| *c = 0);
        self.max_level = 0;
        (
            std::mem::take(&mut self.quadrants),
            std::mem::take(&mut self.payloads),
        )
    }

    /// Returns a payload's backing buffer (if any) to the tree's user-data
    /// pool, for use by algorithms that drop a quadrant taken out via
    /// [`Tree::take_all`] rather than carrying it through to
    /// [`Tree::replace_all`].
    pub fn free_payload(&mut self, payload: Payload) {
        if let Payload::User(bytes) = payload {
            self.user_data_pool.free(bytes);
        }
    }

    /// Bytes of opaque user payload attached to each quadrant in this tree.
    #[must_use]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// A fresh payload of the kind this tree's quadrants carry: an
    /// empty user buffer (to be allocated from the pool on insert) if
    /// `data_size() > 0`, otherwise [`Payload::None`].
    #[must_use]
    pub fn default_payload(&self) -> Payload {
        if self.data_size > 0 {
            Payload::User(Vec::new())
        } else {
            Payload::None
        }
    }

    fn recompute_levels(&mut self) {
        self.per_level.iter_mut().for_each(|c| *c = 0);
        self.max_level = 0;
        for q in &self.quadrants {
            self.per_level[q.level as usize] += 1;
            self.max_level = self.max_level.max(q.level);
        }
    }

    /// Outstanding (checked-out but not freed) user-data buffers; should
    /// return to its pre-operation value once a pipeline stage completes.
    #[must_use]
    pub fn pool_outstanding(&self) -> u64 {
        self.user_data_pool.outstanding()
    }

    /// `true` if the quadrants are in strictly increasing Morton order.
    #[must_use]
    pub fn is_sorted(&self) -> bool {
        self.quadrants.windows(2).all(|w| w[0] < w[1])
    }

    /// `true` if no quadrant is an ancestor of another.
    #[must_use]
    pub fn is_linear(&self) -> bool {
        self.quadrants
            .windows(2)
            .all(|w| !w[0].is_ancestor_or_self(&w[1]))
    }

    /// A relaxation of [`Tree::is_sorted`] that additionally tolerates
    /// consecutive duplicate entries: distinct extended quadrants outside
    /// the tree that alias at a single shared corner may legitimately
    /// repeat in balance's input stream.
    #[must_use]
    pub fn is_almost_sorted(&self) -> bool {
        self.quadrants.windows(2).all(|w| w[0] <= w[1])
    }

    /// `true` if consecutive quadrants are exact Morton successors at
    /// their shared level, i.e. the sequence tiles its bounding region
    /// with no gaps.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.quadrants.windows(2).all(|w| w[0].is_next(&w[1]))
    }
}
