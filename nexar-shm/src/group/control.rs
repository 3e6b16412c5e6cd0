//! Shared control block of one group.
//!
//! ```text
//! +-------------+----------------+-----+------------------+--------+-----+
//! | GroupCtrl   | MemberCtrl[0]  | ... | MemberCtrl[n-1]  | slot 0 | ... |
//! +-------------+----------------+-----+------------------+--------+-----+
//! ```
//!
//! Every field sits on its own cache line. The block is created zero-filled,
//! which is the valid initial state of every flag and meta field.

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Result, ShmCommError};
use crate::flag::SeqFlag;
use crate::host::AccessToken;
use crate::shm::{Segment, SegmentHandle};
use crate::types::Rank;

const CACHE_LINE: usize = 64;

/// Where the current transfer's source lives, written by its producer.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct TransferMeta {
    pub data_rank: AtomicU32,
    pub data_pid: AtomicU32,
    pub data_vaddr: AtomicU64,
    pub bytes: AtomicU64,
    pub token: [AtomicU64; 2],
}

impl TransferMeta {
    /// Publish the producer's buffer. Must precede the first release of the
    /// transfer, whose flag store orders it.
    pub fn publish(&self, rank: Rank, pid: u32, vaddr: u64, bytes: u64, token: AccessToken) {
        let [lo, hi] = token.to_words();
        self.data_rank.store(rank, Ordering::Relaxed);
        self.data_pid.store(pid, Ordering::Relaxed);
        self.data_vaddr.store(vaddr, Ordering::Relaxed);
        self.bytes.store(bytes, Ordering::Relaxed);
        self.token[0].store(lo, Ordering::Relaxed);
        self.token[1].store(hi, Ordering::Relaxed);
    }

    pub fn token(&self) -> AccessToken {
        load_token(&self.token)
    }
}

/// Group-wide flags, written by whoever leads the current operation.
///
/// Leadership is static: the manager leads barrier and allreduce steps,
/// and a broadcast is led by whichever member produces it.
#[repr(C)]
#[derive(Debug, Default)]
pub struct GroupCtrl {
    /// Broadcast: sequence number of the operation whose producer currently
    /// owns the ring, stored before its first release.
    pub leader_seq: SeqFlag,
    /// Allreduce: the manager's result for `seq` is ready to be copied down.
    pub coll_seq: SeqFlag,
    /// Barrier and allreduce: the manager has collected every member.
    pub coll_ack: SeqFlag,
    /// Broadcast: every chunk up to this pipeline count was gathered.
    pub drained: SeqFlag,
    pub meta: TransferMeta,
}

/// Per-member buffer description for the allreduce.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct MemberMeta {
    pub rank: AtomicU32,
    pub pid: AtomicU32,
    pub sbuf_vaddr: AtomicU64,
    pub rbuf_vaddr: AtomicU64,
    pub sbuf_token: [AtomicU64; 2],
    pub rbuf_token: [AtomicU64; 2],
}

impl MemberMeta {
    pub fn publish(&self, rank: Rank, pid: u32, sbuf: (u64, AccessToken), rbuf: (u64, AccessToken)) {
        let [slo, shi] = sbuf.1.to_words();
        let [rlo, rhi] = rbuf.1.to_words();
        self.rank.store(rank, Ordering::Relaxed);
        self.pid.store(pid, Ordering::Relaxed);
        self.sbuf_vaddr.store(sbuf.0, Ordering::Relaxed);
        self.rbuf_vaddr.store(rbuf.0, Ordering::Relaxed);
        self.sbuf_token[0].store(slo, Ordering::Relaxed);
        self.sbuf_token[1].store(shi, Ordering::Relaxed);
        self.rbuf_token[0].store(rlo, Ordering::Relaxed);
        self.rbuf_token[1].store(rhi, Ordering::Relaxed);
    }

    /// Rank and pid of whoever published last.
    pub fn owner(&self) -> (Rank, u32) {
        (self.rank.load(Ordering::Relaxed), self.pid.load(Ordering::Relaxed))
    }

    pub fn sbuf(&self) -> (u64, AccessToken) {
        (self.sbuf_vaddr.load(Ordering::Relaxed), load_token(&self.sbuf_token))
    }

    pub fn rbuf(&self) -> (u64, AccessToken) {
        (self.rbuf_vaddr.load(Ordering::Relaxed), load_token(&self.rbuf_token))
    }
}

fn load_token(words: &[AtomicU64; 2]) -> AccessToken {
    AccessToken::from_words([
        words[0].load(Ordering::Relaxed),
        words[1].load(Ordering::Relaxed),
    ])
}

/// Flags owned by one member.
#[repr(C)]
#[derive(Debug, Default)]
pub struct MemberCtrl {
    /// Barrier and allreduce: this member has entered operation `seq`.
    pub member_seq: SeqFlag,
    /// Allreduce: this member has copied the manager's final result.
    pub member_ack: SeqFlag,
    /// Broadcast: pipeline count released to this member.
    pub release: SeqFlag,
    /// Broadcast: pipeline count this member has consumed.
    pub gather: SeqFlag,
    /// Allreduce: this member has assembled the level's full result.
    pub reduce_ready: SeqFlag,
    /// Allreduce: this member's shard is fully reduced.
    pub reduce_done: SeqFlag,
    pub meta: MemberMeta,
}

/// Byte offsets of the pieces of a control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtrlLayout {
    pub members: usize,
    pub slot_len: usize,
    pub depth: usize,
    members_off: usize,
    slots_off: usize,
    total: usize,
}

impl CtrlLayout {
    pub fn new(members: usize, slot_len: usize, depth: usize) -> Result<Self> {
        let overflow = || ShmCommError::config("control block size overflows");
        let slot_len = align_up(slot_len, CACHE_LINE).ok_or_else(overflow)?;
        let members_off = align_up(size_of::<GroupCtrl>(), CACHE_LINE).ok_or_else(overflow)?;
        let slots_off = size_of::<MemberCtrl>()
            .checked_mul(members)
            .and_then(|m| m.checked_add(members_off))
            .and_then(|end| align_up(end, CACHE_LINE))
            .ok_or_else(overflow)?;
        let total = slot_len
            .checked_mul(depth)
            .and_then(|s| s.checked_add(slots_off))
            .ok_or_else(overflow)?;
        Ok(Self {
            members,
            slot_len,
            depth,
            members_off,
            slots_off,
            total,
        })
    }

    pub fn total_len(&self) -> usize {
        self.total
    }
}

fn align_up(n: usize, align: usize) -> Option<usize> {
    n.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// A group's control block mapped into this process.
#[derive(Debug)]
pub struct ControlBlock {
    segment: Segment,
    layout: CtrlLayout,
}

impl ControlBlock {
    /// Create a fresh block; only the group's manager does this.
    pub fn create(dir: &Path, name: &str, layout: CtrlLayout) -> Result<Self> {
        let segment = Segment::create(dir, name, layout.total_len())?;
        Ok(Self { segment, layout })
    }

    pub fn attach(handle: &SegmentHandle, layout: CtrlLayout) -> Result<Self> {
        let segment = Segment::attach(handle)?;
        if segment.len() < layout.total_len() {
            return Err(ShmCommError::segment(
                segment.path().display(),
                format!(
                    "control block holds {} bytes, layout needs {}",
                    segment.len(),
                    layout.total_len()
                ),
            ));
        }
        Ok(Self { segment, layout })
    }

    pub fn handle(&self) -> SegmentHandle {
        self.segment.handle()
    }

    pub fn unlink(&mut self) -> Result<()> {
        self.segment.unlink()
    }

    pub fn layout(&self) -> &CtrlLayout {
        &self.layout
    }

    pub fn group(&self) -> &GroupCtrl {
        // SAFETY: offset 0 of a page-aligned mapping at least `total` bytes
        // long; zeroed memory is a valid `GroupCtrl`.
        unsafe { &*(self.segment.as_ptr() as *const GroupCtrl) }
    }

    pub fn member(&self, id: usize) -> &MemberCtrl {
        assert!(id < self.layout.members, "member {id} out of range");
        let off = self.layout.members_off + id * size_of::<MemberCtrl>();
        // SAFETY: in bounds per the layout; offsets are cache-line aligned.
        unsafe { &*(self.segment.as_ptr().add(off) as *const MemberCtrl) }
    }

    /// Address of ring slot `slot`, `layout().slot_len` bytes long.
    pub fn slot_ptr(&self, slot: usize) -> *mut u8 {
        assert!(slot < self.layout.depth, "slot {slot} out of range");
        let off = self.layout.slots_off + slot * self.layout.slot_len;
        // SAFETY: in bounds per the layout.
        unsafe { self.segment.as_ptr().add(off) }
    }
}
