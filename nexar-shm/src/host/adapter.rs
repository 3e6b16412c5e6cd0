use crate::error::{Result, ShmCommError};
use crate::topology::Locality;
use crate::types::{DataType, Rank, ReduceOp};

/// Baseline communication supplied by the host runtime.
///
/// Only used while the shared structures are being formed, before any
/// shared-memory group exists. Every participant must issue the same
/// sequence of calls.
pub trait Bootstrap: Send + Sync {
    /// This participant's rank.
    fn rank(&self) -> Rank;

    /// Number of participants.
    fn world_size(&self) -> u32;

    /// Scopes at which `peer` is local to this participant.
    ///
    /// For `peer == self.rank()` every named scope must be reported.
    fn locality(&self, peer: Rank) -> Locality;

    /// Exchange one fixed-size record per participant.
    ///
    /// `recv` must be `world_size * send.len()` bytes; record `r` lands at
    /// `recv[r * send.len()..]`.
    fn allgather(&self, send: &[u8], recv: &mut [u8]) -> Result<()>;

    /// Copy `buf` from `root` to every participant.
    fn broadcast(&self, buf: &mut [u8], root: Rank) -> Result<()>;
}

/// Gather one `u32` per participant.
pub fn allgather_u32(boot: &dyn Bootstrap, value: u32) -> Result<Vec<u32>> {
    let n = boot.world_size() as usize;
    let mut recv = vec![0u8; n * 4];
    boot.allgather(&value.to_le_bytes(), &mut recv)?;
    Ok(recv
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Minimum of one `i64` ticket per participant.
pub fn allreduce_min(boot: &dyn Bootstrap, ticket: i64) -> Result<i64> {
    gather_i64(boot, ticket)?
        .into_iter()
        .min()
        .ok_or_else(|| ShmCommError::bootstrap("empty participant set"))
}

/// Maximum of one `i64` ticket per participant.
pub fn allreduce_max(boot: &dyn Bootstrap, ticket: i64) -> Result<i64> {
    gather_i64(boot, ticket)?
        .into_iter()
        .max()
        .ok_or_else(|| ShmCommError::bootstrap("empty participant set"))
}

fn gather_i64(boot: &dyn Bootstrap, value: i64) -> Result<Vec<i64>> {
    let n = boot.world_size() as usize;
    let mut recv = vec![0u8; n * 8];
    boot.allgather(&value.to_le_bytes(), &mut recv)?;
    Ok(recv
        .chunks_exact(8)
        .map(|c| {
            let mut b = [0u8; 8];
            b.copy_from_slice(c);
            i64::from_le_bytes(b)
        })
        .collect())
}

/// Collectives the engine delegates to when it cannot run an operation
/// itself (initialization failed, or the operation needs a capability the
/// host does not provide).
///
/// Buffers are raw addresses with byte counts implied by `count * dtype`,
/// as in the engine's own entry points.
pub trait Fallback: Send + Sync {
    fn barrier(&self) -> Result<()>;

    /// # Safety
    /// `ptr` must be valid for `dtype.payload_len(count)` bytes.
    unsafe fn broadcast(&self, ptr: u64, count: usize, dtype: DataType, root: Rank)
    -> Result<()>;

    /// # Safety
    /// `send_ptr` must be valid for `count` elements; `recv_ptr` likewise on
    /// `root` (other ranks may pass any value).
    unsafe fn reduce(
        &self,
        send_ptr: u64,
        recv_ptr: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        root: Rank,
    ) -> Result<()>;

    /// # Safety
    /// `send_ptr` and `recv_ptr` must be valid for `count` elements. They may
    /// be equal (in-place).
    unsafe fn all_reduce(
        &self,
        send_ptr: u64,
        recv_ptr: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()>;
}

/// Reduction operator applied during the shard-reduce phase.
pub trait Reducer: Send + Sync {
    /// In-place reduce: `dst[i] = op(dst[i], src[i])` for each element.
    ///
    /// # Safety
    /// Both addresses must be valid for `dtype.payload_len(count)` bytes.
    unsafe fn reduce_inplace(
        &self,
        dst_ptr: u64,
        src_ptr: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()>;

    /// Whether `reduce_inplace` accepts `dtype`.
    fn supports(&self, dtype: DataType) -> bool;
}

/// Host-memory reducer built on the crate's element-wise kernels.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostReducer;

impl Reducer for HostReducer {
    unsafe fn reduce_inplace(
        &self,
        dst_ptr: u64,
        src_ptr: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        unsafe { crate::reduce::reduce_ptr(dst_ptr, src_ptr, count, dtype, op) }
    }

    fn supports(&self, dtype: DataType) -> bool {
        crate::reduce::is_reducible(dtype)
    }
}
