//! Global load redistribution.
//!
//! [`partition_begin`]/[`partition_finish`] reshape a forest's per-process
//! quadrant ownership to match a requested per-process count array,
//! shipping the difference between the old and new ranges over a
//! [`Fabric`]. The two-phase split mirrors the non-blocking send/receive
//! shape of the protocol itself: `begin` posts receives and ships the
//! quadrants this process no longer owns, `finish` waits for incoming
//! quadrants and rebuilds the local trees around them.
//!
//! [`recompute_global_first_position_begin`]/[`recompute_global_first_position_finish`]
//! are a separate, later step, split the same way: once every process has
//! settled into its new range, this figures out where in the global
//! quadrant stream every *other* process's range now begins, which a
//! process with an empty range cannot do purely from local state. Every
//! process's `begin` must run before any process's `finish`, and rank 0's
//! `finish` must run before any other rank's, since rank 0 only learns the
//! full table by gathering everyone else's contribution first.
//! [`recompute_global_first_position`] fuses the two for the one case where
//! the split does not matter: a single-process group, which never touches
//! the fabric at all.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use forest_fabric::{Fabric, FabricError, Request};
use forest_quadrant::{Quadrant, MAX_LEVEL};
use forest_tree::{Payload, Tree};
use std::io::{self, Cursor, Read};

/// Byte width of one quadrant on the wire: `x:i32, y:i32, level:u8` plus 3
/// bytes of padding. Frozen explicitly rather than relying on host struct
/// layout, since the bytes cross a process boundary.
const QUAD_WIRE_SIZE: usize = 12;

const TAG_QUADRANTS: i32 = 0x5054_4e31; // "PTN1"
const TAG_GATHER: i32 = 0x5054_4e32; // "PTN2"
const TAG_BCAST: i32 = 0x5054_4e33; // "PTN3"

/// A failure during partition redistribution.
#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error("requested per-process counts sum to {actual}, expected {expected}")]
    RequestMismatch { expected: i64, actual: i64 },
    #[error("fabric error during partition: {0}")]
    Fabric(#[from] FabricError),
    #[error("malformed partition wire payload: {0}")]
    Wire(#[from] io::Error),
}

/// The first quadrant a process owns: a tree index plus the quadrant's
/// anchor coordinates at [`MAX_LEVEL`]. Slot `P` of the array (one past the
/// last real process) holds the sentinel [`GlobalPosition::sentinel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalPosition {
    pub tree: i64,
    pub x: i64,
    pub y: i64,
}

impl GlobalPosition {
    /// The one-past-the-end marker stored at index `P`.
    #[must_use]
    pub fn sentinel(num_trees: usize) -> Self {
        Self {
            tree: num_trees as i64,
            x: 0,
            y: 0,
        }
    }
}

/// A CRC32 over the `(x, y, level)` triple of each quadrant in `quadrants`,
/// in order. Used to check that partition neither drops nor duplicates
/// quadrants: the multiset of quadrants across all processes must hash the
/// same before and after redistribution (order permitted to differ only
/// across process boundaries, never within one).
#[must_use]
pub fn checksum(quadrants: &[Quadrant]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for q in quadrants {
        hasher.update(&(q.x as i32).to_be_bytes());
        hasher.update(&(q.y as i32).to_be_bytes());
        hasher.update(&[q.level]);
    }
    hasher.finalize()
}

fn interval_overlap(a_lo: i64, a_hi: i64, b_lo: i64, b_hi: i64) -> Option<(i64, i64)> {
    let lo = a_lo.max(b_lo);
    let hi = a_hi.min(b_hi);
    (lo <= hi).then_some((lo, hi))
}

fn write_quadrant(buf: &mut Vec<u8>, q: &Quadrant) {
    buf.write_i32::<LittleEndian>(q.x as i32).unwrap();
    buf.write_i32::<LittleEndian>(q.y as i32).unwrap();
    buf.write_u8(q.level).unwrap();
    buf.extend_from_slice(&[0u8; 3]);
}

fn read_quadrant(cursor: &mut Cursor<&[u8]>) -> io::Result<Quadrant> {
    let x = i64::from(cursor.read_i32::<LittleEndian>()?);
    let y = i64::from(cursor.read_i32::<LittleEndian>()?);
    let level = cursor.read_u8()?;
    let mut pad = [0u8; 3];
    cursor.read_exact(&mut pad)?;
    Ok(Quadrant::new(x, y, level))
}

/// A packed `(numPerTree, quadrants, payload bytes)` triple, in the order
/// the wire format uses: counts first, then every quadrant, then every
/// payload, each in ascending tree order.
struct Packed {
    num_per_tree: Vec<i32>,
    quadrants: Vec<Quadrant>,
    payload: Vec<u8>,
}

impl Packed {
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            self.num_per_tree.len() * 4 + self.quadrants.len() * QUAD_WIRE_SIZE + self.payload.len(),
        );
        for &n in &self.num_per_tree {
            buf.write_i32::<LittleEndian>(n).unwrap();
        }
        for q in &self.quadrants {
            write_quadrant(&mut buf, q);
        }
        buf.extend_from_slice(&self.payload);
        buf
    }

    fn from_bytes(bytes: &[u8], num_trees_decl: usize, data_size: usize) -> io::Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let mut num_per_tree = Vec::with_capacity(num_trees_decl);
        for _ in 0..num_trees_decl {
            num_per_tree.push(cursor.read_i32::<LittleEndian>()?);
        }
        let total: usize = num_per_tree.iter().map(|&n| n as usize).sum();
        let mut quadrants = Vec::with_capacity(total);
        for _ in 0..total {
            quadrants.push(read_quadrant(&mut cursor)?);
        }
        let mut payload = vec![0u8; total * data_size];
        cursor.read_exact(&mut payload)?;
        Ok(Self {
            num_per_tree,
            quadrants,
            payload,
        })
    }
}

/// Reads `[lo, hi]` (inclusive, 0-based into this process's local quadrant
/// stream) out of `trees[first_local_tree..=last_local_tree]` without
/// mutating them, packing the result per-tree for the wire.
fn pack_range(
    trees: &[Tree],
    first_local_tree: i64,
    last_local_tree: i64,
    local_tree_last: &[i64],
    num_send_trees: usize,
    lo: i64,
    hi: i64,
    data_size: usize,
) -> Packed {
    let mut num_per_tree = vec![0i32; num_send_trees];
    let mut quadrants = Vec::new();
    let mut payload = Vec::new();
    if first_local_tree < 0 || hi < lo {
        return Packed {
            num_per_tree,
            quadrants,
            payload,
        };
    }
    let ft = first_local_tree as usize;
    let lt = last_local_tree as usize;
    for t in ft..=lt {
        let tree_begin = if t == ft { 0 } else { local_tree_last[t - 1] + 1 };
        let tree_end = local_tree_last[t];
        let Some((a, b)) = interval_overlap(lo, hi, tree_begin, tree_end) else {
            continue;
        };
        let count = (b - a + 1) as usize;
        num_per_tree[t - ft] = count as i32;
        let start = (a - tree_begin) as usize;
        let tree = &trees[t];
        for i in start..start + count {
            quadrants.push(tree.quadrants()[i]);
            if data_size > 0 {
                match tree.payload(i) {
                    Payload::User(bytes) => payload.extend_from_slice(bytes),
                    _ => payload.extend(std::iter::repeat_n(0u8, data_size)),
                }
            }
        }
    }
    Packed {
        num_per_tree,
        quadrants,
        payload,
    }
}

/// State threaded from [`partition_begin`] to [`partition_finish`]: the new
/// boundaries, who sends to whom, and the retained self-range still sitting
/// (unsent, unread) in this process's own trees.
#[derive(Debug)]
pub struct PendingPartition {
    new_global_last_quad_index: Vec<i64>,
    local_tree_last: Vec<i64>,
    send_count: Vec<i64>,
    send_begin: Vec<i64>,
    recv_count: Vec<i64>,
    recv_requests: Vec<(usize, Request)>,
    old_first_local_tree: i64,
    old_last_local_tree: i64,
}

/// Posts this process's receives and ships every quadrant it no longer
/// owns, per the requested per-process counts in `req`. Does not touch
/// `trees` yet; call [`partition_finish`] once every process in the group
/// has called this to actually wait for and merge incoming quadrants.
pub fn partition_begin(
    fabric: &dyn Fabric,
    trees: &[Tree],
    data_size: usize,
    global_first_position: &[GlobalPosition],
    global_last_quad_index: &[i64],
    first_local_tree: i64,
    last_local_tree: i64,
    req: &[u64],
) -> Result<PendingPartition, PartitionError> {
    let num_procs = fabric.size() as usize;
    let rank = fabric.rank() as usize;
    let num_trees = trees.len();
    debug_assert_eq!(req.len(), num_procs, "one request per process");
    debug_assert_eq!(global_last_quad_index.len(), num_procs);
    debug_assert_eq!(global_first_position.len(), num_procs + 1);

    let global_num_quadrants = global_last_quad_index[num_procs - 1] + 1;
    let total: i64 = req.iter().map(|&r| r as i64).sum();
    if total != global_num_quadrants {
        return Err(PartitionError::RequestMismatch {
            expected: global_num_quadrants,
            actual: total,
        });
    }

    let mut new_global_last_quad_index = vec![0i64; num_procs];
    let mut acc = -1i64;
    for (p, slot) in new_global_last_quad_index.iter_mut().enumerate() {
        acc += req[p] as i64;
        *slot = acc;
    }
    debug_assert_eq!(
        new_global_last_quad_index[num_procs - 1],
        global_last_quad_index[num_procs - 1],
        "redistribution must not change the global quadrant count",
    );

    let mut local_tree_last = vec![0i64; num_trees];
    if first_local_tree >= 0 {
        let ft = first_local_tree as usize;
        let lt = last_local_tree as usize;
        local_tree_last[ft] = trees[ft].len() as i64 - 1;
        for t in (ft + 1)..=lt {
            local_tree_last[t] = trees[t].len() as i64 + local_tree_last[t - 1];
        }
    }

    let old_begin = |p: usize| if p == 0 { 0 } else { global_last_quad_index[p - 1] + 1 };
    let old_end = |p: usize| global_last_quad_index[p];
    let new_begin = |p: usize| if p == 0 { 0 } else { new_global_last_quad_index[p - 1] + 1 };
    let new_end = |p: usize| new_global_last_quad_index[p];

    let my_old_begin = old_begin(rank);
    let my_old_end = old_end(rank);
    let my_new_begin = new_begin(rank);
    let my_new_end = new_end(rank);

    let mut recv_count = vec![0i64; num_procs];
    for p in 0..num_procs {
        if let Some((lo, hi)) = interval_overlap(my_new_begin, my_new_end, old_begin(p), old_end(p)) {
            recv_count[p] = hi - lo + 1;
        }
    }
    let mut send_count = vec![0i64; num_procs];
    let mut send_begin = vec![-1i64; num_procs];
    for p in 0..num_procs {
        if let Some((lo, hi)) = interval_overlap(my_old_begin, my_old_end, new_begin(p), new_end(p)) {
            send_count[p] = hi - lo + 1;
            send_begin[p] = lo;
        }
    }

    let mut recv_requests = Vec::new();
    for from_proc in 0..num_procs {
        if from_proc == rank || recv_count[from_proc] == 0 {
            continue;
        }
        let num_recv_trees = (global_first_position[from_proc + 1].tree
            - global_first_position[from_proc].tree
            + 1) as usize;
        let size =
            num_recv_trees * 4 + recv_count[from_proc] as usize * (QUAD_WIRE_SIZE + data_size);
        let request = fabric.irecv(size, from_proc as u32, TAG_QUADRANTS)?;
        recv_requests.push((from_proc, request));
    }

    let num_send_trees =
        (global_first_position[rank + 1].tree - global_first_position[rank].tree + 1).max(0) as usize;
    for to_proc in 0..num_procs {
        if to_proc == rank || send_count[to_proc] == 0 {
            continue;
        }
        let lo = send_begin[to_proc] - my_old_begin;
        let hi = lo + send_count[to_proc] - 1;
        let packed = pack_range(
            trees,
            first_local_tree,
            last_local_tree,
            &local_tree_last,
            num_send_trees,
            lo,
            hi,
            data_size,
        );
        let bytes = packed.to_bytes();
        fabric.isend(&bytes, to_proc as u32, TAG_QUADRANTS)?;
    }

    Ok(PendingPartition {
        new_global_last_quad_index,
        local_tree_last,
        send_count,
        send_begin,
        recv_count,
        recv_requests,
        old_first_local_tree: first_local_tree,
        old_last_local_tree: last_local_tree,
    })
}

/// Waits for every quadrant this process is due to receive, merges them
/// with whatever it keeps of its own old range, and rebuilds `trees` in
/// place. Updates `global_last_quad_index`/`first_local_tree`/
/// `last_local_tree` to the new layout; `global_first_position` is left
/// untouched; call [`recompute_global_first_position`] afterwards once
/// every process has finished.
pub fn partition_finish(
    pending: PendingPartition,
    fabric: &dyn Fabric,
    trees: &mut [Tree],
    data_size: usize,
    global_first_position: &[GlobalPosition],
    global_last_quad_index: &mut Vec<i64>,
    first_local_tree: &mut i64,
    last_local_tree: &mut i64,
) -> Result<(), PartitionError> {
    let num_procs = fabric.size() as usize;
    let rank = fabric.rank() as usize;
    let num_trees = trees.len();

    let PendingPartition {
        new_global_last_quad_index,
        local_tree_last,
        send_count,
        send_begin,
        recv_count,
        recv_requests,
        old_first_local_tree,
        old_last_local_tree,
    } = pending;

    let (peers, requests): (Vec<usize>, Vec<Request>) = recv_requests.into_iter().unzip();
    let results = fabric.wait_all(requests)?;
    let mut recv_bytes: std::collections::HashMap<usize, Vec<u8>> = peers
        .into_iter()
        .zip(results)
        .map(|(peer, bytes)| (peer, bytes.expect("a posted recv resolves to Some(bytes)")))
        .collect();

    let my_old_begin = if rank == 0 {
        0
    } else {
        global_last_quad_index[rank - 1] + 1
    };

    let mut new_quads: Vec<Vec<Quadrant>> = vec![Vec::new(); num_trees];
    let mut new_payloads: Vec<Vec<Payload>> = vec![Vec::new(); num_trees];

    for from_proc in 0..num_procs {
        if from_proc == rank {
            if old_first_local_tree >= 0 {
                let ft = old_first_local_tree as usize;
                let lt = old_last_local_tree as usize;
                let keep_lo = send_begin[rank] - my_old_begin;
                let keep_hi = keep_lo + send_count[rank] - 1;
                for t in ft..=lt {
                    let tree_begin = if t == ft { 0 } else { local_tree_last[t - 1] + 1 };
                    let (quads_t, payloads_t) = trees[t].take_all();
                    for (i, (q, payload)) in quads_t.into_iter().zip(payloads_t).enumerate() {
                        let gi = tree_begin + i as i64;
                        if send_count[rank] > 0 && gi >= keep_lo && gi <= keep_hi {
                            new_quads[t].push(q);
                            new_payloads[t].push(payload);
                        } else {
                            trees[t].free_payload(payload);
                        }
                    }
                }
            }
            continue;
        }
        if recv_count[from_proc] == 0 {
            continue;
        }
        let bytes = recv_bytes
            .remove(&from_proc)
            .expect("a posted recv for this peer must have a matching result");
        let num_recv_trees = (global_first_position[from_proc + 1].tree
            - global_first_position[from_proc].tree
            + 1) as usize;
        let first_tree = global_first_position[from_proc].tree as usize;
        let packed = Packed::from_bytes(&bytes, num_recv_trees, data_size)?;
        let mut qi = 0usize;
        let mut pi = 0usize;
        for (i, &n) in packed.num_per_tree.iter().enumerate() {
            let t = first_tree + i;
            for _ in 0..n as usize {
                new_quads[t].push(packed.quadrants[qi]);
                let payload = if data_size > 0 {
                    trees[t].checkout_user_payload(&packed.payload[pi..pi + data_size])
                } else {
                    Payload::None
                };
                new_payloads[t].push(payload);
                qi += 1;
                pi += data_size;
            }
        }
    }

    for t in 0..num_trees {
        trees[t].replace_all(
            std::mem::take(&mut new_quads[t]),
            std::mem::take(&mut new_payloads[t]),
        );
    }

    let mut new_first = -1i64;
    let mut new_last = -2i64;
    for (t, tree) in trees.iter().enumerate() {
        if !tree.is_empty() {
            if new_first < 0 {
                new_first = t as i64;
            }
            new_last = t as i64;
        }
    }
    *first_local_tree = new_first;
    *last_local_tree = new_last;
    *global_last_quad_index = new_global_last_quad_index;

    Ok(())
}

fn encode_position(position: Option<GlobalPosition>) -> [u8; 24] {
    let mut buf = [0u8; 24];
    let p = position.unwrap_or(GlobalPosition {
        tree: -1,
        x: 0,
        y: 0,
    });
    buf[0..8].copy_from_slice(&p.tree.to_le_bytes());
    buf[8..16].copy_from_slice(&p.x.to_le_bytes());
    buf[16..24].copy_from_slice(&p.y.to_le_bytes());
    buf
}

fn decode_position(bytes: &[u8]) -> Option<GlobalPosition> {
    let tree = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
    if tree < 0 {
        return None;
    }
    let x = i64::from_le_bytes(bytes[8..16].try_into().unwrap());
    let y = i64::from_le_bytes(bytes[16..24].try_into().unwrap());
    Some(GlobalPosition { tree, x, y })
}

/// Recomputes `globalFirstPosition` for the whole group, after every
/// process has finished [`partition_finish`].
///
/// Every process that owns at least one quadrant reports the first
/// descendant of its first owned quadrant; an empty process has no such
/// quadrant to report, so it inherits the position of the nearest
/// non-empty process to its right (the point at which its own, empty,
/// range would have begun). Gathered to rank 0 and broadcast back over
/// point-to-point sends, since [`Fabric::allgather`] is only guaranteed to
/// work for a single-process group on the in-process stub.
/// State carried between [`recompute_global_first_position_begin`] and
/// [`recompute_global_first_position_finish`].
pub struct PendingGlobalPosition {
    num_procs: usize,
    num_trees: usize,
    rank: usize,
    my_position: Option<GlobalPosition>,
    gather_requests: Vec<Request>,
}

/// Posts this process's contribution towards the group-wide table of where
/// each process's range begins: rank 0 posts a receive per peer, every
/// other rank ships its own first quadrant's position to rank 0. Every
/// process in the group must call this before any process calls
/// [`recompute_global_first_position_finish`]; call order among `begin`
/// calls themselves does not matter, since none of them wait on anything.
pub fn recompute_global_first_position_begin(
    fabric: &dyn Fabric,
    trees: &[Tree],
    first_local_tree: i64,
    num_trees: usize,
) -> Result<PendingGlobalPosition, PartitionError> {
    let num_procs = fabric.size() as usize;
    let rank = fabric.rank() as usize;

    let my_position = if first_local_tree >= 0 {
        let ft = first_local_tree as usize;
        let q = trees[ft].quadrants()[0];
        let fd = q.first_descendant(MAX_LEVEL);
        Some(GlobalPosition {
            tree: ft as i64,
            x: fd.x,
            y: fd.y,
        })
    } else {
        None
    };

    let gather_requests = if num_procs == 1 {
        Vec::new()
    } else if rank == 0 {
        (1..num_procs)
            .map(|p| fabric.irecv(24, p as u32, TAG_GATHER))
            .collect::<Result<Vec<_>, _>>()?
    } else {
        let bytes = encode_position(my_position);
        fabric.isend(&bytes, 0, TAG_GATHER)?;
        Vec::new()
    };

    Ok(PendingGlobalPosition {
        num_procs,
        num_trees,
        rank,
        my_position,
        gather_requests,
    })
}

/// Waits for whatever [`recompute_global_first_position_begin`] posted and
/// returns the full table. Rank 0 must call this before any other rank
/// does: rank 0 waits only on sends every other rank already posted during
/// `begin`, then broadcasts the combined table out; every other rank waits
/// on that broadcast here.
pub fn recompute_global_first_position_finish(
    pending: PendingGlobalPosition,
    fabric: &dyn Fabric,
) -> Result<Vec<GlobalPosition>, PartitionError> {
    let PendingGlobalPosition {
        num_procs,
        num_trees,
        rank,
        my_position,
        gather_requests,
    } = pending;

    if num_procs == 1 {
        let mut out = vec![my_position.unwrap_or(GlobalPosition::sentinel(num_trees))];
        out.push(GlobalPosition::sentinel(num_trees));
        return Ok(out);
    }

    let mut positions = vec![GlobalPosition::sentinel(num_trees); num_procs + 1];
    if rank == 0 {
        let mut gathered = vec![None; num_procs];
        gathered[0] = my_position;
        for (p, bytes) in (1..num_procs).zip(fabric.wait_all(gather_requests)?) {
            let bytes = bytes.expect("gather recv resolves to Some(bytes)");
            gathered[p] = decode_position(&bytes);
        }

        let mut next = GlobalPosition::sentinel(num_trees);
        for p in (0..num_procs).rev() {
            if let Some(pos) = gathered[p] {
                next = pos;
            }
            positions[p] = next;
        }
        let broadcast = {
            let mut buf = Vec::with_capacity((num_procs + 1) * 24);
            for pos in &positions {
                buf.extend_from_slice(&encode_position(Some(*pos)));
            }
            buf
        };
        for p in 1..num_procs {
            fabric.isend(&broadcast, p as u32, TAG_BCAST)?;
        }
    } else {
        let request = fabric.irecv((num_procs + 1) * 24, 0, TAG_BCAST)?;
        let bytes = fabric
            .wait_all(vec![request])?
            .remove(0)
            .expect("broadcast recv resolves to Some(bytes)");
        for (p, slot) in positions.iter_mut().enumerate() {
            *slot = decode_position(&bytes[p * 24..p * 24 + 24]).unwrap_or(GlobalPosition::sentinel(num_trees));
        }
    }

    Ok(positions)
}

/// Convenience wrapper for a single-process group, where neither phase
/// touches the fabric. Not safe to call per-rank across a multi-process
/// group: use [`recompute_global_first_position_begin`]/
/// [`recompute_global_first_position_finish`] there instead, with every
/// rank's `begin` running before any rank's `finish`.
pub fn recompute_global_first_position(
    fabric: &dyn Fabric,
    trees: &[Tree],
    first_local_tree: i64,
    num_trees: usize,
) -> Result<Vec<GlobalPosition>, PartitionError> {
    debug_assert_eq!(fabric.size(), 1, "use the begin/finish split for a multi-process group");
    let pending = recompute_global_first_position_begin(fabric, trees, first_local_tree, num_trees)?;
    recompute_global_first_position_finish(pending, fabric)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forest_fabric::SerialFabric;

    fn single_tree_state(quadrants: Vec<Quadrant>) -> Tree {
        let mut tree = Tree::new(0);
        for q in quadrants {
            tree.insert(q, Payload::None);
        }
        tree
    }

    #[test]
    fn single_process_round_trip_is_a_no_op() {
        let fabric = SerialFabric::single();
        let quadrants: Vec<Quadrant> = Quadrant::root().children().collect();
        let before = checksum(&quadrants);
        let mut trees = vec![single_tree_state(quadrants)];

        let global_first_position = vec![
            GlobalPosition { tree: 0, x: 0, y: 0 },
            GlobalPosition::sentinel(1),
        ];
        let mut global_last_quad_index = vec![3i64];
        let mut first_local_tree = 0i64;
        let mut last_local_tree = 0i64;

        let pending = partition_begin(
            &fabric,
            &trees,
            0,
            &global_first_position,
            &global_last_quad_index,
            first_local_tree,
            last_local_tree,
            &[4],
        )
        .unwrap();
        partition_finish(
            pending,
            &fabric,
            &mut trees,
            0,
            &global_first_position,
            &mut global_last_quad_index,
            &mut first_local_tree,
            &mut last_local_tree,
        )
        .unwrap();

        assert_eq!(checksum(trees[0].quadrants()), before);
        assert_eq!(trees[0].len(), 4);
        assert_eq!(first_local_tree, 0);
        assert_eq!(last_local_tree, 0);

        let positions = recompute_global_first_position(&fabric, &trees, first_local_tree, 1).unwrap();
        assert_eq!(positions[0].tree, 0);
        assert_eq!(positions[1], GlobalPosition::sentinel(1));
    }

    #[test]
    fn request_sum_mismatch_is_rejected() {
        let fabric = SerialFabric::single();
        let trees = vec![single_tree_state(Quadrant::root().children().collect())];
        let global_first_position = vec![
            GlobalPosition { tree: 0, x: 0, y: 0 },
            GlobalPosition::sentinel(1),
        ];
        let global_last_quad_index = vec![3i64];
        let err = partition_begin(
            &fabric,
            &trees,
            0,
            &global_first_position,
            &global_last_quad_index,
            0,
            0,
            &[3],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PartitionError::RequestMismatch {
                expected: 4,
                actual: 3
            }
        ));
    }

    #[test]
    fn four_process_redistribution_preserves_the_multiset() {
        // 16 level-2 quadrants of a single tree, all owned by rank 0 to
        // start, redistributed 4/4/4/4 across a group of 4.
        let num_procs = 4u32;
        let handles = SerialFabric::group(num_procs);

        let mut all_quads = Vec::new();
        for a in Quadrant::root().children() {
            for b in a.children() {
                all_quads.push(b);
            }
        }
        assert_eq!(all_quads.len(), 16);
        let before = checksum(&all_quads);

        let mut trees: Vec<Tree> = (0..num_procs)
            .map(|rank| {
                let mut tree = Tree::new(0);
                if rank == 0 {
                    for q in &all_quads {
                        tree.insert(*q, Payload::None);
                    }
                }
                tree
            })
            .collect();

        let global_first_position = vec![
            GlobalPosition { tree: 0, x: 0, y: 0 },
            GlobalPosition::sentinel(1),
            GlobalPosition::sentinel(1),
            GlobalPosition::sentinel(1),
            GlobalPosition::sentinel(1),
        ];
        let mut global_last_quad_index = vec![15i64, 15, 15, 15];
        let mut first_local_tree = vec![0i64, -1, -1, -1];
        let mut last_local_tree = vec![0i64, -2, -2, -2];
        let req = [4u64, 4, 4, 4];

        let mut pendings = Vec::new();
        for rank in 0..num_procs as usize {
            let local_trees = std::slice::from_ref(&trees[rank]);
            let pending = partition_begin(
                &handles[rank],
                local_trees,
                0,
                &global_first_position,
                &global_last_quad_index,
                first_local_tree[rank],
                last_local_tree[rank],
                &req,
            )
            .unwrap();
            pendings.push(pending);
        }

        for (rank, pending) in pendings.into_iter().enumerate() {
            let local_trees = std::slice::from_mut(&mut trees[rank]);
            partition_finish(
                pending,
                &handles[rank],
                local_trees,
                0,
                &global_first_position,
                &mut global_last_quad_index,
                &mut first_local_tree[rank],
                &mut last_local_tree[rank],
            )
            .unwrap();
        }

        for rank in 0..num_procs as usize {
            assert_eq!(trees[rank].len(), 4, "rank {rank} should own exactly req[rank]");
            assert!(trees[rank].is_sorted());
        }

        let mut after_quads = Vec::new();
        for tree in &trees {
            after_quads.extend_from_slice(tree.quadrants());
        }
        after_quads.sort();
        let mut before_sorted = all_quads;
        before_sorted.sort();
        assert_eq!(after_quads, before_sorted);
        assert_eq!(checksum(&after_quads), before);
    }

    #[test]
    fn four_process_recompute_global_first_position_gathers_then_broadcasts() {
        // Each rank already owns a contiguous quarter of one tree's 16
        // level-2 quadrants; recompute_global_first_position should report
        // where each rank's slice begins.
        let num_procs = 4u32;
        let handles = SerialFabric::group(num_procs);

        let mut all_quads = Vec::new();
        for a in Quadrant::root().children() {
            for b in a.children() {
                all_quads.push(b);
            }
        }

        let trees: Vec<Tree> = (0..num_procs as usize)
            .map(|rank| single_tree_state(all_quads[rank * 4..rank * 4 + 4].to_vec()))
            .collect();

        // Every rank's `begin` must run before any rank's `finish`.
        let pendings: Vec<_> = (0..num_procs as usize)
            .map(|rank| {
                recompute_global_first_position_begin(
                    &handles[rank],
                    std::slice::from_ref(&trees[rank]),
                    0,
                    1,
                )
                .unwrap()
            })
            .collect();

        // Rank 0's `finish` must run before any other rank's, since it
        // gathers everyone else's contribution and broadcasts the result.
        let positions: Vec<Vec<GlobalPosition>> = pendings
            .into_iter()
            .enumerate()
            .map(|(rank, pending)| recompute_global_first_position_finish(pending, &handles[rank]).unwrap())
            .collect();

        for rank in 0..num_procs as usize {
            let expected_fd = all_quads[rank * 4].first_descendant(MAX_LEVEL);
            assert_eq!(positions[rank][rank].tree, 0);
            assert_eq!(positions[rank][rank].x, expected_fd.x);
            assert_eq!(positions[rank][rank].y, expected_fd.y);
            assert_eq!(positions[rank][num_procs as usize], GlobalPosition::sentinel(1));
        }
        for a in 1..num_procs as usize {
            assert_eq!(positions[0], positions[a], "every rank must agree on the full table");
        }
    }
}
