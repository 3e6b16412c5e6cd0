use crate::comm::ShmComm;
use crate::error::{Result, ShmCommError};
use crate::group::ControlBlock;
use crate::host::{AccessToken, PeerId, RegistrationCache};
use crate::pipeline::{Consumer, Producer};
use crate::types::{DataType, Rank};

/// Where a consumer reads a zero-copy transfer from.
enum Source {
    /// Local address of the producer's buffer.
    Mapped(u64),
    Remote {
        peer: PeerId,
        vaddr: u64,
        token: AccessToken,
    },
}

struct Incoming<'a> {
    consumer: Consumer<'a>,
    ctrl: &'a ControlBlock,
    chunk: usize,
    done: usize,
    source: Option<Source>,
}

struct Outgoing<'a> {
    producer: Producer<'a>,
    ctrl: &'a ControlBlock,
    chunk: usize,
    done: usize,
}

/// Hierarchical pipelined broadcast from `root`.
///
/// Data flows along the root's manager chain: the root produces directly
/// into every group of its chain (acting in its manager's slot above its
/// own reach), and each other group is fed by its manager once that manager
/// has received the data one level up. Per chunk, a participant first
/// consumes at its single receiving level, then releases as much as it has
/// to every level it feeds.
///
/// Payloads up to `cico_max` bytes travel through each group's ring slots.
/// Larger payloads are read straight out of the producer's buffer.
///
/// # Safety
/// `ptr` must be valid for `dtype.payload_len(count)` bytes on every
/// participant, and must not be touched by anyone else until this returns.
pub unsafe fn hierarchical_broadcast(
    comm: &mut ShmComm,
    ptr: u64,
    count: usize,
    dtype: DataType,
    root: Rank,
) -> Result<()> {
    if root >= comm.world_size() {
        return Err(ShmCommError::InvalidRank {
            rank: root,
            world_size: comm.world_size(),
        });
    }
    let seq = comm.next_seq();

    let bytes = dtype.payload_len(count);
    if bytes == 0 {
        return Ok(());
    }

    comm.registrations().trim();
    unsafe { transfer(comm, seq, ptr, bytes, root)? };

    for g in comm.groups_mut() {
        if !g.is_trivial() {
            g.pipe.advance(bytes.div_ceil(g.chunk_size) as u32);
        }
    }
    Ok(())
}

unsafe fn transfer(comm: &ShmComm, seq: u32, ptr: u64, bytes: usize, root: Rank) -> Result<()> {
    let me = comm.rank();
    let waiter = comm.waiter();
    let rcache = comm.registrations();
    let xmem = rcache.xmem();
    let zero_copy = bytes > comm.config().cico_max;

    let mut incoming: Option<Incoming<'_>> = None;
    let mut outgoing: Vec<Outgoing<'_>> = Vec::new();
    let mut token = None;

    let mut active = true;
    for (level, g) in comm.groups().iter().enumerate() {
        if level > 0 {
            let manages_below = comm.manager_of(level - 1, me) == me;
            active = me == root
                || (active && manages_below && comm.manager_of(level - 1, root) != me);
        }
        if !active {
            break;
        }
        let Some(ctrl) = g.active_ctrl() else {
            continue;
        };

        let rep = if level == 0 {
            root
        } else {
            comm.manager_of(level - 1, root)
        };
        let leader = g.slot_of(rep).unwrap_or(0);
        let base = g.pipe.base();

        if g.member_id == leader {
            let producer = Producer::begin(ctrl, waiter, g.member_id, base);
            ctrl.group().leader_seq.store(seq);
            if zero_copy {
                let t = match token {
                    Some(t) => t,
                    None => {
                        let t = rcache.expose(ptr, bytes)?;
                        token = Some(t);
                        t
                    }
                };
                ctrl.group()
                    .meta
                    .publish(me, std::process::id(), ptr, bytes as u64, t);
            }
            outgoing.push(Outgoing {
                producer,
                ctrl,
                chunk: g.chunk_size,
                done: 0,
            });
        } else if incoming.is_none() {
            incoming = Some(Incoming {
                consumer: Consumer::begin(ctrl, waiter, g.member_id, base),
                ctrl,
                chunk: g.chunk_size,
                done: 0,
                source: None,
            });
        } else {
            return Err(ShmCommError::topology(format!(
                "rank {me} would receive at more than one level"
            )));
        }
    }

    let mut received = if incoming.is_some() { 0 } else { bytes };
    loop {
        let mut pending = false;

        if let Some(inc) = incoming.as_mut() {
            if inc.done < bytes {
                let len = inc.chunk.min(bytes - inc.done);
                let slot = inc.consumer.wait_next();
                if inc.done == 0 {
                    let leader = inc.ctrl.group().leader_seq.load();
                    assert_eq!(leader, seq, "broadcast {seq} received from the producer of {leader}");
                }
                let dst = ptr + inc.done as u64;
                if zero_copy {
                    if inc.source.is_none() {
                        inc.source = Some(unsafe { open_source(rcache, inc.ctrl, bytes)? });
                    }
                    match &inc.source {
                        Some(Source::Mapped(local)) => unsafe {
                            copy(local + inc.done as u64, dst, len);
                        },
                        Some(Source::Remote { peer, vaddr, token }) => unsafe {
                            xmem.copy_from(peer, dst, vaddr + inc.done as u64, len, *token)?;
                        },
                        None => {}
                    }
                } else {
                    unsafe { copy(inc.ctrl.slot_ptr(slot) as u64, dst, len) };
                }
                inc.consumer.done();
                inc.done += len;
                received = inc.done;
            }
            pending |= inc.done < bytes;
        }

        for out in &mut outgoing {
            if out.done < bytes {
                let len = out.chunk.min(bytes - out.done);
                if received >= out.done + len {
                    let slot = out.producer.acquire();
                    if !zero_copy {
                        unsafe { copy(ptr + out.done as u64, out.ctrl.slot_ptr(slot) as u64, len) };
                    }
                    out.producer.release();
                    out.done += len;
                }
            }
            pending |= out.done < bytes;
        }

        if !pending {
            break;
        }
    }

    for out in outgoing {
        out.producer.drain();
    }
    Ok(())
}

/// Resolve the producer's buffer from the meta it published.
///
/// # Safety
/// Must only be called after the first chunk of the transfer was released.
unsafe fn open_source(rcache: &RegistrationCache, ctrl: &ControlBlock, bytes: usize) -> Result<Source> {
    let meta = &ctrl.group().meta;
    let published = meta.bytes.load(std::sync::atomic::Ordering::Relaxed);
    if published < bytes as u64 {
        return Err(ShmCommError::BufferSizeMismatch {
            expected: bytes,
            actual: published as usize,
        });
    }
    let peer = PeerId {
        rank: meta.data_rank.load(std::sync::atomic::Ordering::Relaxed),
        pid: meta.data_pid.load(std::sync::atomic::Ordering::Relaxed),
    };
    let vaddr = meta.data_vaddr.load(std::sync::atomic::Ordering::Relaxed);
    let token = meta.token();
    if rcache.xmem().features().can_map {
        let local = unsafe { rcache.map(&peer, token, vaddr, bytes)? };
        Ok(Source::Mapped(local))
    } else {
        Ok(Source::Remote { peer, vaddr, token })
    }
}

/// # Safety
/// Both ranges must be valid for `len` bytes and must not overlap.
unsafe fn copy(src: u64, dst: u64, len: usize) {
    unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len) };
}
