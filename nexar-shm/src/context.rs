//! Per-communicator entry point with lazy engine formation.
//!
//! The engine is formed on the first collective. If formation fails on any
//! participant, every participant logs a warning and routes this and all
//! later collectives through the host's fallback implementation.

use crate::bootstrap::form_shm_comm;
use crate::collective::{
    hierarchical_allreduce, hierarchical_barrier, hierarchical_broadcast, hierarchical_reduce,
};
use crate::comm::ShmComm;
use crate::config::ShmConfig;
use crate::error::Result;
use crate::host::HostServices;
use crate::types::{DataType, Rank, ReduceOp};

enum EngineState {
    Pending,
    Ready(Box<ShmComm>),
    Unavailable,
}

/// Collective operations for one group of participants.
pub struct GroupContext {
    host: HostServices,
    config: ShmConfig,
    state: EngineState,
}

impl GroupContext {
    pub fn new(host: HostServices, config: ShmConfig) -> Self {
        Self {
            host,
            config,
            state: EngineState::Pending,
        }
    }

    /// Context configured from `NEXAR_SHM_*` environment variables.
    pub fn from_env(host: HostServices) -> Self {
        Self::new(host, ShmConfig::from_env())
    }

    pub fn rank(&self) -> Rank {
        self.host.bootstrap.rank()
    }

    /// The formed engine, if formation has run and succeeded.
    pub fn engine(&self) -> Option<&ShmComm> {
        match &self.state {
            EngineState::Ready(comm) => Some(&**comm),
            _ => None,
        }
    }

    /// Whether formation has been attempted and failed.
    pub fn is_unavailable(&self) -> bool {
        matches!(self.state, EngineState::Unavailable)
    }

    fn ensure_engine(&mut self) -> Option<&mut ShmComm> {
        if matches!(self.state, EngineState::Pending) {
            self.state = match form_shm_comm(self.host.clone(), self.config.clone()) {
                Ok(comm) => EngineState::Ready(Box::new(comm)),
                Err(e) => {
                    tracing::warn!(
                        rank = self.host.bootstrap.rank(),
                        "shm engine unavailable, using fallback collectives: {e}"
                    );
                    EngineState::Unavailable
                }
            };
        }
        match &mut self.state {
            EngineState::Ready(comm) => Some(&mut **comm),
            _ => None,
        }
    }

    pub fn barrier(&mut self) -> Result<()> {
        match self.ensure_engine() {
            Some(comm) => hierarchical_barrier(comm),
            None => self.host.fallback.barrier(),
        }
    }

    /// Broadcast `count` elements at `ptr` from `root`.
    ///
    /// # Safety
    /// `ptr` must be valid for `dtype.payload_len(count)` bytes.
    pub unsafe fn broadcast(
        &mut self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        root: Rank,
    ) -> Result<()> {
        match self.ensure_engine() {
            Some(comm) => unsafe { hierarchical_broadcast(comm, ptr, count, dtype, root) },
            None => unsafe { self.host.fallback.broadcast(ptr, count, dtype, root) },
        }
    }

    /// Element-wise reduce across all participants; every participant
    /// receives the result.
    ///
    /// Falls back to the host when the element type cannot be reduced here,
    /// or when the payload is too large for the staging buffers and peer
    /// memory cannot be mapped.
    ///
    /// # Safety
    /// `send_ptr` and `recv_ptr` must be valid for `dtype.payload_len(count)`
    /// bytes. They may be equal.
    pub unsafe fn all_reduce(
        &mut self,
        send_ptr: u64,
        recv_ptr: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        let bytes = dtype.payload_len(count);
        let supported = self.host.reducer.supports(dtype)
            && (bytes <= self.config.cico_max || self.host.xmem.features().can_map);
        tracing::trace!(rank = self.rank(), bytes, engine = supported, "allreduce routed");
        if supported {
            if let Some(comm) = self.ensure_engine() {
                return unsafe { hierarchical_allreduce(comm, send_ptr, recv_ptr, count, dtype, op) };
            }
        }
        unsafe {
            self.host
                .fallback
                .all_reduce(send_ptr, recv_ptr, count, dtype, op)
        }
    }

    /// Reduce to `root`.
    ///
    /// Delegates to the host unless `force_reduce` is set and `root` is 0,
    /// in which case it behaves like [`reduce_full_buffers`](Self::reduce_full_buffers).
    ///
    /// # Safety
    /// `send_ptr` must be valid for `count` elements; `recv_ptr` likewise on
    /// `root`, and on every participant when the engine handles the call.
    pub unsafe fn reduce(
        &mut self,
        send_ptr: u64,
        recv_ptr: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        root: Rank,
    ) -> Result<()> {
        if self.config.force_reduce && root == 0 {
            return unsafe { self.reduce_full_buffers(send_ptr, recv_ptr, count, dtype, op) };
        }
        unsafe {
            self.host
                .fallback
                .reduce(send_ptr, recv_ptr, count, dtype, op, root)
        }
    }

    /// Reduce to rank 0 using full-size receive buffers on every participant.
    ///
    /// Only rank 0's `recv_ptr` holds the final result afterwards; the others
    /// hold intermediate data.
    ///
    /// # Safety
    /// `send_ptr` and `recv_ptr` must be valid for `dtype.payload_len(count)`
    /// bytes on every participant.
    pub unsafe fn reduce_full_buffers(
        &mut self,
        send_ptr: u64,
        recv_ptr: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        let bytes = dtype.payload_len(count);
        let supported = self.host.reducer.supports(dtype)
            && (bytes <= self.config.cico_max || self.host.xmem.features().can_map);
        tracing::trace!(rank = self.rank(), bytes, engine = supported, "reduce routed");
        if supported {
            if let Some(comm) = self.ensure_engine() {
                return unsafe { hierarchical_reduce(comm, send_ptr, recv_ptr, count, dtype, op, 0) };
            }
        }
        unsafe {
            self.host
                .fallback
                .reduce(send_ptr, recv_ptr, count, dtype, op, 0)
        }
    }
}

impl std::fmt::Debug for GroupContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            EngineState::Pending => "pending",
            EngineState::Ready(_) => "ready",
            EngineState::Unavailable => "unavailable",
        };
        f.debug_struct("GroupContext")
            .field("rank", &self.host.bootstrap.rank())
            .field("state", &state)
            .finish_non_exhaustive()
    }
}
