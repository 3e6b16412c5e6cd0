use crate::collective::allreduce::shard_reduce;
use crate::comm::ShmComm;
use crate::error::{Result, ShmCommError};
use crate::types::{DataType, Rank, ReduceOp};

/// Reduce to rank 0 over full-size buffers.
///
/// Runs the allreduce without handing the result back down, so only the
/// top-level members (rank 0 among them) end up with the final result.
/// Intermediate levels assemble partial results in `recv_ptr`, so every
/// participant must pass a receive buffer of full size.
///
/// # Safety
/// `send_ptr` and `recv_ptr` must be valid for `dtype.payload_len(count)`
/// bytes on every participant.
pub unsafe fn hierarchical_reduce(
    comm: &mut ShmComm,
    send_ptr: u64,
    recv_ptr: u64,
    count: usize,
    dtype: DataType,
    op: ReduceOp,
    root: Rank,
) -> Result<()> {
    if root != 0 {
        return Err(ShmCommError::Unsupported {
            operation: "reduce",
            reason: format!("only rank 0 can be the root, got {root}"),
        });
    }
    unsafe { shard_reduce(comm, send_ptr, recv_ptr, count, dtype, op, false) }
}
