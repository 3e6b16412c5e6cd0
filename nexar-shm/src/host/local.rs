//! In-process host runtime: every participant is a thread of this process.
//!
//! Used by the test suite and by single-process embedders. The exchange is a
//! mutex-protected slot table fenced by a barrier; locality comes from a
//! synthetic block layout instead of a hardware probe.

use std::sync::{Arc, Barrier, Mutex};

use crate::error::{Result, ShmCommError};
use crate::flag::YieldProgress;
use crate::host::adapter::{Bootstrap, Fallback, HostReducer};
use crate::host::xmem::{CrossMemory, SameAddressSpace};
use crate::host::HostServices;
use crate::reduce::reduce_slice;
use crate::topology::Locality;
use crate::types::{DataType, Rank, ReduceOp};

/// Locality derived from fixed block sizes.
///
/// Ranks `a` and `b` share a scope of block size `n` iff `a / n == b / n`.
/// Every rank shares [`Locality::NODE`].
#[derive(Debug, Clone, Default)]
pub struct SyntheticTopology {
    blocks: Vec<(Locality, u32)>,
}

impl SyntheticTopology {
    /// A single node with no finer structure.
    pub fn flat() -> Self {
        Self::default()
    }

    /// Add a scope grouping consecutive ranks in blocks of `block` ranks.
    pub fn with(mut self, scope: Locality, block: u32) -> Self {
        self.blocks.push((scope, block.max(1)));
        self
    }

    pub fn locality(&self, me: Rank, peer: Rank) -> Locality {
        if me == peer {
            return Locality::ALL_NAMED;
        }
        self.blocks
            .iter()
            .filter(|(_, n)| me / n == peer / n)
            .fold(Locality::NODE, |acc, (scope, _)| acc | *scope)
    }
}

struct Exchange {
    slots: Mutex<Vec<Vec<u8>>>,
    barrier: Barrier,
}

/// A group of in-process participants.
pub struct LocalWorld {
    exchange: Arc<Exchange>,
    topology: Arc<SyntheticTopology>,
    world_size: u32,
}

impl LocalWorld {
    pub fn new(world_size: u32, topology: SyntheticTopology) -> Self {
        let n = world_size as usize;
        Self {
            exchange: Arc::new(Exchange {
                slots: Mutex::new(vec![Vec::new(); n]),
                barrier: Barrier::new(n),
            }),
            topology: Arc::new(topology),
            world_size,
        }
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    /// Participant handle for `rank`.
    pub fn peer(&self, rank: Rank) -> LocalPeer {
        LocalPeer {
            rank,
            world_size: self.world_size,
            exchange: Arc::clone(&self.exchange),
            topology: Arc::clone(&self.topology),
        }
    }

    /// Host services for every rank, sharing one address space.
    pub fn services(&self) -> Vec<HostServices> {
        self.services_with_xmem(Arc::new(SameAddressSpace))
    }

    /// Host services for every rank with a caller-chosen memory mechanism.
    pub fn services_with_xmem(&self, xmem: Arc<dyn CrossMemory>) -> Vec<HostServices> {
        (0..self.world_size)
            .map(|r| {
                let peer = Arc::new(self.peer(r));
                HostServices {
                    bootstrap: peer.clone(),
                    fallback: peer,
                    xmem: Arc::clone(&xmem),
                    reducer: Arc::new(HostReducer),
                    progress: Arc::new(YieldProgress),
                }
            })
            .collect()
    }
}

/// One participant of a [`LocalWorld`].
pub struct LocalPeer {
    rank: Rank,
    world_size: u32,
    exchange: Arc<Exchange>,
    topology: Arc<SyntheticTopology>,
}

impl LocalPeer {
    fn slots(&self) -> Result<std::sync::MutexGuard<'_, Vec<Vec<u8>>>> {
        self.exchange
            .slots
            .lock()
            .map_err(|_| ShmCommError::bootstrap("exchange lock poisoned"))
    }

    fn check_root(&self, root: Rank) -> Result<()> {
        if root >= self.world_size {
            return Err(ShmCommError::InvalidRank {
                rank: root,
                world_size: self.world_size,
            });
        }
        Ok(())
    }

    /// Gather every rank's bytes, in rank order.
    fn gather_all(&self, send: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.slots()?[self.rank as usize] = send.to_vec();
        self.exchange.barrier.wait();
        let all = self.slots()?.clone();
        self.exchange.barrier.wait();
        Ok(all)
    }

    fn reduce_all(&self, send: &[u8], count: usize, dtype: DataType, op: ReduceOp) -> Result<Vec<u8>> {
        let all = self.gather_all(send)?;
        let mut acc = all[0].clone();
        for contrib in &all[1..] {
            reduce_slice(&mut acc, contrib, count, dtype, op)?;
        }
        Ok(acc)
    }
}

impl Bootstrap for LocalPeer {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world_size
    }

    fn locality(&self, peer: Rank) -> Locality {
        self.topology.locality(self.rank, peer)
    }

    fn allgather(&self, send: &[u8], recv: &mut [u8]) -> Result<()> {
        let expected = send.len() * self.world_size as usize;
        if recv.len() != expected {
            return Err(ShmCommError::BufferSizeMismatch {
                expected,
                actual: recv.len(),
            });
        }
        let all = self.gather_all(send)?;
        for (r, rec) in all.iter().enumerate() {
            if rec.len() != send.len() {
                return Err(ShmCommError::bootstrap(format!(
                    "rank {r} contributed {} bytes, expected {}",
                    rec.len(),
                    send.len()
                )));
            }
            recv[r * send.len()..(r + 1) * send.len()].copy_from_slice(rec);
        }
        Ok(())
    }

    fn broadcast(&self, buf: &mut [u8], root: Rank) -> Result<()> {
        self.check_root(root)?;
        if self.rank == root {
            self.slots()?[root as usize] = buf.to_vec();
        }
        self.exchange.barrier.wait();
        let copied = if self.rank != root {
            let slots = self.slots()?;
            let src = &slots[root as usize];
            if src.len() == buf.len() {
                buf.copy_from_slice(src);
                Ok(())
            } else {
                Err(ShmCommError::BufferSizeMismatch {
                    expected: src.len(),
                    actual: buf.len(),
                })
            }
        } else {
            Ok(())
        };
        self.exchange.barrier.wait();
        copied
    }
}

impl Fallback for LocalPeer {
    fn barrier(&self) -> Result<()> {
        self.exchange.barrier.wait();
        Ok(())
    }

    unsafe fn broadcast(&self, ptr: u64, count: usize, dtype: DataType, root: Rank) -> Result<()> {
        let len = dtype.payload_len(count);
        if len == 0 {
            return Bootstrap::broadcast(self, &mut [], root);
        }
        // SAFETY: caller guarantees `ptr` is valid for `len` bytes.
        let buf = unsafe { std::slice::from_raw_parts_mut(ptr as *mut u8, len) };
        Bootstrap::broadcast(self, buf, root)
    }

    unsafe fn reduce(
        &self,
        send_ptr: u64,
        recv_ptr: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        root: Rank,
    ) -> Result<()> {
        self.check_root(root)?;
        let len = dtype.payload_len(count);
        let send = if len == 0 {
            &[][..]
        } else {
            // SAFETY: caller guarantees `send_ptr` is valid for `len` bytes.
            unsafe { std::slice::from_raw_parts(send_ptr as *const u8, len) }
        };
        let result = self.reduce_all(send, count, dtype, op)?;
        if self.rank == root && len > 0 {
            // SAFETY: caller guarantees `recv_ptr` is valid on the root.
            unsafe { std::ptr::copy_nonoverlapping(result.as_ptr(), recv_ptr as *mut u8, len) };
        }
        Ok(())
    }

    unsafe fn all_reduce(
        &self,
        send_ptr: u64,
        recv_ptr: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        let len = dtype.payload_len(count);
        let send = if len == 0 {
            &[][..]
        } else {
            // SAFETY: caller guarantees `send_ptr` is valid for `len` bytes.
            unsafe { std::slice::from_raw_parts(send_ptr as *const u8, len) }
        };
        let result = self.reduce_all(send, count, dtype, op)?;
        if len > 0 {
            // SAFETY: caller guarantees `recv_ptr` is valid for `len` bytes.
            unsafe { std::ptr::copy(result.as_ptr(), recv_ptr as *mut u8, len) };
        }
        Ok(())
    }
}
