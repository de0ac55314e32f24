//! The forest-wide checksum of §6.3: a CRC32 over every locally owned
//! quadrant's `(x, y, level)` triple, combined across processes in rank
//! order.
//!
//! [`forest_partition::checksum`] hashes one process's quadrants; this
//! module extends that to the whole group by gathering every other
//! process's hash input to rank 0, in rank order, since
//! [`Fabric::allgather`] only works for a single-process group on the
//! in-process stub. Only rank 0 learns the combined value: every other
//! rank's call is a one-way contribution, since there is no blocking
//! collective here to have rank 0 broadcast the result back without
//! every rank also waiting on rank 0 (a cycle [`SerialFabric`]'s
//! non-blocking, immediately-resolved `wait_all` cannot express).

use crate::ForestError;
use forest_fabric::Fabric;
use forest_tree::Tree;

const TAG_LEN: i32 = 0x4348_4b31; // "CHK1"
const TAG_DATA: i32 = 0x4348_4b32; // "CHK2"

fn local_bytes(trees: &[Tree]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for tree in trees {
        for q in tree.quadrants() {
            bytes.extend_from_slice(&(q.x as i32).to_be_bytes());
            bytes.extend_from_slice(&(q.y as i32).to_be_bytes());
            bytes.push(q.level);
        }
    }
    bytes
}

/// The combined checksum of every quadrant the group owns, on rank 0;
/// `None` on every other rank. Every process must call this, and every
/// non-root rank must call it before rank 0 does, since rank 0's gather
/// depends on messages the others have already sent.
pub(crate) fn combined(fabric: &dyn Fabric, trees: &[Tree]) -> Result<Option<u32>, ForestError> {
    let num_procs = fabric.size() as usize;
    let rank = fabric.rank() as usize;
    let mine = local_bytes(trees);

    if num_procs == 1 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&mine);
        return Ok(Some(hasher.finalize()));
    }

    if rank != 0 {
        fabric.isend(&(mine.len() as u64).to_le_bytes(), 0, TAG_LEN)?;
        fabric.isend(&mine, 0, TAG_DATA)?;
        return Ok(None);
    }

    let len_requests = (1..num_procs)
        .map(|from| fabric.irecv(8, from as u32, TAG_LEN))
        .collect::<Result<Vec<_>, _>>()?;
    let len_results = fabric.wait_all(len_requests)?;
    let mut lens = vec![0usize; num_procs];
    for (from, resolved) in (1..num_procs).zip(len_results) {
        let bytes = resolved.expect("length recv always resolves to bytes");
        let array: [u8; 8] = bytes.try_into().expect("length is 8 bytes");
        lens[from] = u64::from_le_bytes(array) as usize;
    }

    let data_requests = (1..num_procs)
        .map(|from| fabric.irecv(lens[from], from as u32, TAG_DATA))
        .collect::<Result<Vec<_>, _>>()?;
    let data_results = fabric.wait_all(data_requests)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&mine);
    for resolved in data_results {
        hasher.update(&resolved.expect("data recv always resolves to bytes"));
    }
    Ok(Some(hasher.finalize()))
}
