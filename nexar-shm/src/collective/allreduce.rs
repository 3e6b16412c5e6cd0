use crate::comm::ShmComm;
use crate::error::{Result, ShmCommError};
use crate::group::MemberMeta;
use crate::host::{AccessToken, PeerId};
use crate::types::{DataType, Rank, ReduceOp};

/// Shards are multiples of this many elements, except for the surplus.
pub(crate) const SHARD_ALIGN: usize = 64;

/// Element range `(start, len)` owned by member `id` of `n`.
///
/// Every member gets the same aligned base; the surplus is handed out in
/// aligned pieces from member 0 upward, so the last pieces may be short or
/// empty.
pub(crate) fn shard(count: usize, n: usize, id: usize) -> (usize, usize) {
    let base = count / SHARD_ALIGN / n * SHARD_ALIGN;
    let surplus = count - base * n;
    let lead = (id * SHARD_ALIGN).min(surplus);
    let extra = surplus.saturating_sub(id * SHARD_ALIGN).min(SHARD_ALIGN);
    (id * base + lead, base + extra)
}

/// Hierarchical allreduce.
///
/// At each level the members split the vector into shards; each member
/// reduces its shard from every member's source, then copies every other
/// shard back, leaving the level's result in every member's buffer. The
/// group's manager carries that result one level up. Once the top level
/// is done, managers hand the final result down the hierarchy.
///
/// Payloads up to `cico_max` bytes run over the staging buffers; larger
/// ones read directly from the members' buffers, which needs mappable
/// cross-process memory.
///
/// # Safety
/// `send_ptr` and `recv_ptr` must be valid for `dtype.payload_len(count)`
/// bytes on every participant. They may be equal.
pub unsafe fn hierarchical_allreduce(
    comm: &mut ShmComm,
    send_ptr: u64,
    recv_ptr: u64,
    count: usize,
    dtype: DataType,
    op: ReduceOp,
) -> Result<()> {
    unsafe { shard_reduce(comm, send_ptr, recv_ptr, count, dtype, op, true) }
}

/// Shared body of the allreduce and the full-buffer reduce.
///
/// With `descend == false` the final result is only guaranteed at the
/// top-level members (rank 0 among them); other buffers hold partial results.
///
/// # Safety
/// See [`hierarchical_allreduce`].
pub(crate) unsafe fn shard_reduce(
    comm: &mut ShmComm,
    send_ptr: u64,
    recv_ptr: u64,
    count: usize,
    dtype: DataType,
    op: ReduceOp,
    descend: bool,
) -> Result<()> {
    let seq = comm.next_seq();
    let comm = &*comm;

    let bytes = dtype.payload_len(count);
    if bytes == 0 {
        return Ok(());
    }
    if !comm.host().reducer.supports(dtype) {
        return Err(ShmCommError::UnsupportedDType {
            dtype,
            op: "allreduce",
        });
    }

    let me = comm.rank();
    let rcache = comm.registrations();
    rcache.trim();
    let staging = if bytes <= comm.config().cico_max {
        comm.cico_ptr(me)
    } else {
        None
    };
    if staging.is_none() && !rcache.xmem().features().can_map {
        return Err(ShmCommError::Unsupported {
            operation: "allreduce",
            reason: "payload exceeds the staging buffer and peer memory cannot be mapped".into(),
        });
    }

    let mut bufs = match staging {
        Some(cico) => {
            unsafe { copy(send_ptr, cico, bytes) };
            Buffers {
                src: (cico, AccessToken::default()),
                work: (cico, AccessToken::default()),
                staged: true,
            }
        }
        None => {
            let rtok = rcache.expose(recv_ptr, bytes)?;
            let stok = if send_ptr == recv_ptr {
                rtok
            } else {
                rcache.expose(send_ptr, bytes)?
            };
            Buffers {
                src: (send_ptr, stok),
                work: (recv_ptr, rtok),
                staged: false,
            }
        }
    };

    let levels: Vec<usize> = comm
        .groups()
        .iter()
        .enumerate()
        .take_while(|(_, g)| g.is_member)
        .filter(|(_, g)| g.active_ctrl().is_some())
        .map(|(i, _)| i)
        .collect();

    for &level in &levels {
        unsafe { reduce_level(comm, level, seq, &bufs, count, dtype, op)? };
        bufs.src = bufs.work;
    }
    if bufs.src.0 != bufs.work.0 {
        unsafe { std::ptr::copy(bufs.src.0 as *const u8, bufs.work.0 as *mut u8, bytes) };
    }
    if descend {
        for &level in levels.iter().rev() {
            if comm.has_active_above(level) {
                unsafe { descend_level(comm, level, seq, &bufs, bytes)? };
            }
        }
    }

    if bufs.staged {
        unsafe { copy(bufs.work.0, recv_ptr, bytes) };
    }
    Ok(())
}

struct Buffers {
    /// Source of the current level and its access token.
    src: (u64, AccessToken),
    /// Buffer the result is assembled in.
    work: (u64, AccessToken),
    staged: bool,
}

/// Peer buffers resolved to local addresses for one level.
struct PeerView {
    src: u64,
    work: u64,
}

/// # Safety
/// Buffers in `bufs` must be valid for `count` elements.
unsafe fn reduce_level(
    comm: &ShmComm,
    level: usize,
    seq: u32,
    bufs: &Buffers,
    count: usize,
    dtype: DataType,
    op: ReduceOp,
) -> Result<()> {
    let g = &comm.groups()[level];
    let Some(ctrl) = g.active_ctrl() else {
        return Ok(());
    };
    let waiter = comm.waiter();
    let rcache = comm.registrations();
    let reducer = comm.host().reducer.as_ref();
    let esize = dtype.size_in_bytes();
    let bytes = count * esize;
    let n = g.size();
    let id = g.member_id;
    let mine = ctrl.member(id);

    if !bufs.staged {
        mine.meta
            .publish(comm.rank(), std::process::id(), bufs.src, bufs.work);
    }
    mine.member_seq.store(seq);

    let mut views = Vec::with_capacity(n);
    for m in 0..n {
        if m == id {
            views.push(PeerView {
                src: bufs.src.0,
                work: bufs.work.0,
            });
            continue;
        }
        let peer_ctrl = ctrl.member(m);
        waiter.wait(&peer_ctrl.member_seq, seq, 0);

        let rank = g.members[m];
        if bufs.staged {
            let p = comm.cico_ptr(rank).ok_or_else(|| {
                ShmCommError::topology(format!("no staging buffer mapped for rank {rank}"))
            })?;
            views.push(PeerView { src: p, work: p });
            continue;
        }

        let peer = published_peer(comm, rank, &peer_ctrl.meta)?;
        let (svaddr, stok) = peer_ctrl.meta.sbuf();
        let (rvaddr, rtok) = peer_ctrl.meta.rbuf();
        let work = unsafe { rcache.map(&peer, rtok, rvaddr, bytes)? };
        let src = if svaddr == rvaddr {
            work
        } else {
            unsafe { rcache.map(&peer, stok, svaddr, bytes)? }
        };
        views.push(PeerView { src, work });
    }

    let (start, len) = shard(count, n, id);
    if len > 0 {
        let off = (start * esize) as u64;
        if bufs.src.0 != bufs.work.0 {
            unsafe {
                std::ptr::copy(
                    (bufs.src.0 + off) as *const u8,
                    (bufs.work.0 + off) as *mut u8,
                    len * esize,
                )
            };
        }
        for (m, view) in views.iter().enumerate() {
            if m != id {
                unsafe { reducer.reduce_inplace(bufs.work.0 + off, view.src + off, len, dtype, op)? };
            }
        }
    }
    mine.reduce_done.store(seq);

    for (m, view) in views.iter().enumerate() {
        if m == id {
            continue;
        }
        waiter.wait(&ctrl.member(m).reduce_done, seq, 0);
        let (start, len) = shard(count, n, m);
        if len > 0 {
            let off = (start * esize) as u64;
            unsafe { copy(view.work + off, bufs.work.0 + off, len * esize) };
        }
    }
    mine.reduce_ready.store(seq);

    if id == 0 {
        for m in 1..n {
            waiter.wait(&ctrl.member(m).reduce_ready, seq, 0);
        }
        ctrl.group().coll_ack.store(seq);
    } else {
        waiter.wait(&ctrl.group().coll_ack, seq, 0);
    }
    Ok(())
}

/// Identity of the member in `rank`'s slot, as published with its buffers.
fn published_peer(comm: &ShmComm, rank: Rank, meta: &MemberMeta) -> Result<PeerId> {
    let expected = comm.peer(rank);
    let (owner, pid) = meta.owner();
    if owner != rank || pid != expected.pid {
        return Err(ShmCommError::topology(format!(
            "slot of rank {rank} holds buffers of rank {owner} (pid {pid})"
        )));
    }
    Ok(expected)
}

/// Hand the manager's final result to the other members of `level`.
///
/// # Safety
/// `bufs.work` must be valid for `bytes` bytes.
unsafe fn descend_level(
    comm: &ShmComm,
    level: usize,
    seq: u32,
    bufs: &Buffers,
    bytes: usize,
) -> Result<()> {
    let g = &comm.groups()[level];
    let Some(ctrl) = g.active_ctrl() else {
        return Ok(());
    };
    let waiter = comm.waiter();

    if g.member_id == 0 {
        ctrl.group().coll_seq.store(seq);
        for m in 1..g.size() {
            waiter.wait(&ctrl.member(m).member_ack, seq, 0);
        }
        return Ok(());
    }

    waiter.wait(&ctrl.group().coll_seq, seq, 0);
    let manager = g.manager();
    if bufs.staged {
        let src = comm.cico_ptr(manager).ok_or_else(|| {
            ShmCommError::topology(format!("no staging buffer mapped for rank {manager}"))
        })?;
        unsafe { copy(src, bufs.work.0, bytes) };
    } else {
        let meta = &ctrl.member(0).meta;
        let peer = published_peer(comm, manager, meta)?;
        let (vaddr, token) = meta.rbuf();
        let src = unsafe { comm.registrations().map(&peer, token, vaddr, bytes)? };
        unsafe { copy(src, bufs.work.0, bytes) };
    }
    ctrl.member(g.member_id).member_ack.store(seq);
    Ok(())
}

/// # Safety
/// Both ranges must be valid for `len` bytes and must not overlap.
unsafe fn copy(src: u64, dst: u64, len: usize) {
    unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len) };
}
