//! The ordered messaging fabric the forest pipeline calls into.
//!
//! [`Fabric`] is a small, byte-oriented abstraction over a process group:
//! size/rank queries, the three collectives (barrier, broadcast, reduce
//! family), and non-blocking point-to-point send/receive. The core never
//! talks to a real network; it is written once against this trait and
//! tested against [`SerialFabric`], a same-process stand-in that loops
//! sends back to receives through an internal mailbox.

use hashbrown::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// The element type carried by a collective or point-to-point buffer,
/// needed only so a real fabric knows how many bytes one element is and
/// how to byte-swap it; [`SerialFabric`] treats every datatype as opaque
/// bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Datatype {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Byte,
}

impl Datatype {
    /// Width in bytes of one element.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            Datatype::I8 | Datatype::U8 | Datatype::Byte => 1,
            Datatype::I16 | Datatype::U16 => 2,
            Datatype::I32 | Datatype::U32 | Datatype::F32 => 4,
            Datatype::I64 | Datatype::U64 | Datatype::F64 => 8,
        }
    }
}

/// Reduction operator for [`Fabric::reduce`]/[`Fabric::allreduce`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Max,
    Min,
    Sum,
    Prod,
    BitAnd,
    BitOr,
    BitXor,
    LogicalAnd,
    LogicalOr,
    LogicalXor,
    MinLoc,
    MaxLoc,
    Replace,
}

/// A failure reported by a fabric call.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("collective called with mismatched buffer lengths: {send} vs {recv}")]
    LengthMismatch { send: usize, recv: usize },
    #[error("point-to-point peer {0} is out of range for a group of size {1}")]
    PeerOutOfRange(u32, u32),
    #[error("no matching send queued for recv from peer {peer} tag {tag}")]
    NoMatchingSend { peer: u32, tag: i32 },
    #[error("collective requires a group of size 1, got {0}")]
    RequiresSingleProcess(u32),
}

/// A pending non-blocking operation returned by [`Fabric::isend`] or
/// [`Fabric::irecv`]. Resolved by [`Fabric::wait_all`].
#[derive(Debug)]
pub enum Request {
    /// A send; always resolves to `None`, since the fabric has already
    /// taken ownership of the bytes.
    Send,
    /// A pending receive of `len` bytes from `peer` tagged `tag`;
    /// resolves to `Some(bytes)`.
    Recv { peer: u32, tag: i32, len: usize },
}

/// The ordered messaging fabric: size/rank, the three collective shapes,
/// and non-blocking point-to-point with an explicit wait.
///
/// Every method returns `Result`; a real network fabric's failures are
/// fatal by convention (see the forest pipeline's error hierarchy), but
/// the trait itself makes no assumption about that.
pub trait Fabric {
    /// Number of processes in the group.
    fn size(&self) -> u32;
    /// This process's id within the group, `0..size()`.
    fn rank(&self) -> u32;

    /// Blocks until every process in the group has called `barrier`.
    fn barrier(&self) -> Result<(), FabricError>;

    /// Copies `root`'s `buf` to every process's `buf`.
    fn broadcast(&self, buf: &mut [u8], root: u32) -> Result<(), FabricError>;

    /// Concatenates every process's `send` (each the same length) into
    /// `recv`, ordered by rank.
    fn allgather(&self, send: &[u8], recv: &mut [u8]) -> Result<(), FabricError>;

    /// Elementwise-applies `op` over every process's `send`, writing the
    /// result into `root`'s `recv`.
    fn reduce(
        &self,
        send: &[u8],
        recv: &mut [u8],
        datatype: Datatype,
        op: Op,
        root: u32,
    ) -> Result<(), FabricError>;

    /// As [`Fabric::reduce`], but every process receives the result.
    fn allreduce(
        &self,
        send: &[u8],
        recv: &mut [u8],
        datatype: Datatype,
        op: Op,
    ) -> Result<(), FabricError>;

    /// Posts a non-blocking send of `buf` to `peer` tagged `tag`.
    fn isend(&self, buf: &[u8], peer: u32, tag: i32) -> Result<Request, FabricError>;

    /// Posts a non-blocking receive of `len` bytes from `peer` tagged
    /// `tag`.
    fn irecv(&self, len: usize, peer: u32, tag: i32) -> Result<Request, FabricError>;

    /// Blocks until every request in `requests` completes, returning the
    /// bytes received for each `Request::Recv` (in the same order,
    /// `None` for sends).
    fn wait_all(&self, requests: Vec<Request>) -> Result<Vec<Option<Vec<u8>>>, FabricError>;
}

#[derive(Default)]
struct Mailbox {
    queues: Mutex<HashMap<(u32, u32, i32), VecDeque<Vec<u8>>>>,
}

/// A single-process stand-in for [`Fabric`]. Collectives degenerate to a
/// memcpy and assume a group of size 1 (mirroring the reference MPI
/// stub's `rank == 0` assumption); point-to-point loops sends back to
/// receives through a mailbox shared by every handle in the same
/// [`SerialFabric::group`], so a test can drive several handles end to
/// end without real concurrency.
#[derive(Clone)]
pub struct SerialFabric {
    rank: u32,
    size: u32,
    mailbox: Arc<Mailbox>,
}

impl std::fmt::Debug for SerialFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialFabric")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl SerialFabric {
    /// A lone process, group size 1.
    #[must_use]
    pub fn single() -> Self {
        Self::group(1).into_iter().next().unwrap()
    }

    /// `size` handles sharing one mailbox, ranks `0..size`, so
    /// point-to-point calls between them can be exercised in a test
    /// without a real transport.
    #[must_use]
    pub fn group(size: u32) -> Vec<Self> {
        assert!(size > 0, "a fabric group must have at least one process");
        let mailbox = Arc::new(Mailbox::default());
        (0..size)
            .map(|rank| Self {
                rank,
                size,
                mailbox: mailbox.clone(),
            })
            .collect()
    }
}

impl Fabric for SerialFabric {
    fn size(&self) -> u32 {
        self.size
    }

    fn rank(&self) -> u32 {
        self.rank
    }

    fn barrier(&self) -> Result<(), FabricError> {
        Ok(())
    }

    fn broadcast(&self, buf: &mut [u8], root: u32) -> Result<(), FabricError> {
        if self.size != 1 {
            return Err(FabricError::RequiresSingleProcess(self.size));
        }
        let _ = (buf, root);
        Ok(())
    }

    fn allgather(&self, send: &[u8], recv: &mut [u8]) -> Result<(), FabricError> {
        if self.size != 1 {
            return Err(FabricError::RequiresSingleProcess(self.size));
        }
        if send.len() != recv.len() {
            return Err(FabricError::LengthMismatch {
                send: send.len(),
                recv: recv.len(),
            });
        }
        recv.copy_from_slice(send);
        Ok(())
    }

    fn reduce(
        &self,
        send: &[u8],
        recv: &mut [u8],
        _datatype: Datatype,
        _op: Op,
        _root: u32,
    ) -> Result<(), FabricError> {
        if self.size != 1 {
            return Err(FabricError::RequiresSingleProcess(self.size));
        }
        if send.len() != recv.len() {
            return Err(FabricError::LengthMismatch {
                send: send.len(),
                recv: recv.len(),
            });
        }
        recv.copy_from_slice(send);
        Ok(())
    }

    fn allreduce(
        &self,
        send: &[u8],
        recv: &mut [u8],
        _datatype: Datatype,
        _op: Op,
    ) -> Result<(), FabricError> {
        if self.size != 1 {
            return Err(FabricError::RequiresSingleProcess(self.size));
        }
        if send.len() != recv.len() {
            return Err(FabricError::LengthMismatch {
                send: send.len(),
                recv: recv.len(),
            });
        }
        recv.copy_from_slice(send);
        Ok(())
    }

    fn isend(&self, buf: &[u8], peer: u32, tag: i32) -> Result<Request, FabricError> {
        if peer >= self.size {
            return Err(FabricError::PeerOutOfRange(peer, self.size));
        }
        self.mailbox
            .queues
            .lock()
            .unwrap()
            .entry((self.rank, peer, tag))
            .or_default()
            .push_back(buf.to_vec());
        Ok(Request::Send)
    }

    fn irecv(&self, len: usize, peer: u32, tag: i32) -> Result<Request, FabricError> {
        if peer >= self.size {
            return Err(FabricError::PeerOutOfRange(peer, self.size));
        }
        Ok(Request::Recv { peer, tag, len })
    }

    fn wait_all(&self, requests: Vec<Request>) -> Result<Vec<Option<Vec<u8>>>, FabricError> {
        let mut out = Vec::with_capacity(requests.len());
        for request in requests {
            match request {
                Request::Send => out.push(None),
                Request::Recv { peer, tag, len } => {
                    let mut queues = self.mailbox.queues.lock().unwrap();
                    let bytes = queues
                        .get_mut(&(peer, self.rank, tag))
                        .and_then(VecDeque::pop_front)
                        .ok_or(FabricError::NoMatchingSend { peer, tag })?;
                    debug_assert_eq!(bytes.len(), len, "received message length mismatch");
                    out.push(Some(bytes));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_process_collectives_are_copies() {
        let fabric = SerialFabric::single();
        assert_eq!(fabric.size(), 1);
        assert_eq!(fabric.rank(), 0);

        let mut buf = [0u8; 4];
        fabric.broadcast(&mut buf, 0).unwrap();

        let send = [1u8, 2, 3, 4];
        let mut recv = [0u8; 4];
        fabric.allgather(&send, &mut recv).unwrap();
        assert_eq!(recv, send);

        fabric
            .allreduce(&send, &mut recv, Datatype::Byte, Op::Sum)
            .unwrap();
        assert_eq!(recv, send);
    }

    #[test]
    fn collectives_reject_a_multi_process_group() {
        let handles = SerialFabric::group(2);
        let mut buf = [0u8; 1];
        assert!(matches!(
            handles[0].broadcast(&mut buf, 0),
            Err(FabricError::RequiresSingleProcess(2))
        ));
    }

    #[test]
    fn point_to_point_round_trips_between_two_handles() {
        let handles = SerialFabric::group(2);
        let (rank0, rank1) = (&handles[0], &handles[1]);

        let payload = b"ghost-quadrant".to_vec();
        let send_req = rank0.isend(&payload, 1, 7).unwrap();
        let recv_req = rank1.irecv(payload.len(), 0, 7).unwrap();

        let mut received = rank1.wait_all(vec![recv_req]).unwrap();
        rank0.wait_all(vec![send_req]).unwrap();

        assert_eq!(received.remove(0).unwrap(), payload);
    }

    #[test]
    fn waiting_on_an_unmatched_recv_errors_instead_of_blocking() {
        let fabric = SerialFabric::single();
        let recv_req = fabric.irecv(4, 0, 0).unwrap();
        assert!(matches!(
            fabric.wait_all(vec![recv_req]),
            Err(FabricError::NoMatchingSend { peer: 0, tag: 0 })
        ));
    }

    #[test]
    fn peer_out_of_range_is_rejected_eagerly() {
        let fabric = SerialFabric::single();
        assert!(matches!(
            fabric.isend(&[], 3, 0),
            Err(FabricError::PeerOutOfRange(3, 1))
        ));
    }
}
