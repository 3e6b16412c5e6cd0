//! Bounded producer/consumer pipeline over a group's control block.
//!
//! A transfer moves `n` chunks from one producer to every other member.
//! Chunk `k` (1-based) is released by storing `base + k` into each
//! consumer's `release` flag; a consumer acknowledges it by storing
//! `base + k` into its own `gather` flag. At most `depth` chunks are
//! released and not yet gathered by everyone, which also bounds reuse of
//! the ring slots (`(k - 1) % depth`).
//!
//! `base` is the group's pipeline count before the transfer. Every holder of
//! the group advances it by the transfer's chunk count, whether or not it
//! took part, so all participants agree on it without communicating. The
//! producer of a transfer waits until the previous producer has published
//! `drained == base`, so back-to-back transfers with different producers
//! never overlap on the ring or the meta fields.

use crate::flag::Waiter;
use crate::group::ControlBlock;

/// Per-holder pipeline count of one group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineState {
    count: u32,
}

impl PipelineState {
    pub fn base(&self) -> u32 {
        self.count
    }

    /// Account for a finished transfer of `chunks` chunks.
    pub fn advance(&mut self, chunks: u32) {
        self.count = self.count.wrapping_add(chunks);
    }
}

/// Releasing side of one transfer.
#[derive(Debug)]
pub struct Producer<'a> {
    ctrl: &'a ControlBlock,
    waiter: &'a Waiter,
    consumers: Vec<usize>,
    base: u32,
    released: u32,
    /// Whether the slot of chunk `released + 1` has been acquired.
    acquired: bool,
    depth: u32,
}

impl<'a> Producer<'a> {
    /// Start producing in slot `my_id`. Blocks until the previous transfer
    /// on this group is fully drained.
    pub fn begin(ctrl: &'a ControlBlock, waiter: &'a Waiter, my_id: usize, base: u32) -> Self {
        let layout = ctrl.layout();
        let consumers = (0..layout.members).filter(|&m| m != my_id).collect();
        waiter.wait(&ctrl.group().drained, base, 0);
        Self {
            ctrl,
            waiter,
            consumers,
            base,
            released: 0,
            acquired: false,
            depth: layout.depth as u32,
        }
    }

    pub fn released(&self) -> u32 {
        self.released
    }

    /// Ring slot of the next chunk, once it is free to overwrite.
    pub fn acquire(&mut self) -> usize {
        if self.released >= self.depth {
            // Chunk `released + 1 - depth` used the same slot.
            let oldest = self
                .base
                .wrapping_add(self.released + 1 - self.depth);
            for &m in &self.consumers {
                self.waiter
                    .wait(&self.ctrl.member(m).gather, oldest, self.depth - 1);
            }
        }
        self.acquired = true;
        (self.released % self.depth) as usize
    }

    /// Release the next chunk to every consumer.
    ///
    /// # Panics
    /// If the chunk's slot was not [`acquire`](Self::acquire)d first, or if
    /// a consumer still lags `depth` or more chunks behind.
    pub fn release(&mut self) {
        assert!(
            self.acquired,
            "pipeline chunk {} released without acquiring its slot",
            self.released + 1
        );
        let outstanding = self.released + 1 - self.min_gathered();
        assert!(
            outstanding <= self.depth,
            "pipeline overrun: {outstanding} chunks outstanding with depth {}",
            self.depth
        );
        self.acquired = false;
        self.released += 1;
        let seq = self.base.wrapping_add(self.released);
        for &m in &self.consumers {
            self.ctrl.member(m).release.store(seq);
        }
    }

    /// Chunks of this transfer that every consumer has gathered.
    fn min_gathered(&self) -> u32 {
        self.consumers
            .iter()
            .map(|&m| {
                let gathered = self.ctrl.member(m).gather.load().wrapping_sub(self.base);
                // Not yet started on this transfer.
                if gathered > self.released { 0 } else { gathered }
            })
            .min()
            .unwrap_or(self.released)
    }

    /// Wait for every consumer to gather everything released, then let the
    /// next producer in.
    ///
    /// # Panics
    /// If a slot was acquired and never released.
    pub fn drain(self) {
        assert!(
            !self.acquired,
            "pipeline drained with chunk {} acquired but not released",
            self.released + 1
        );
        let last = self.base.wrapping_add(self.released);
        for &m in &self.consumers {
            self.waiter.wait(&self.ctrl.member(m).gather, last, 0);
        }
        debug_assert_eq!(self.min_gathered(), self.released);
        self.ctrl.group().drained.store(last);
    }
}

/// Receiving side of one transfer.
#[derive(Debug)]
pub struct Consumer<'a> {
    ctrl: &'a ControlBlock,
    waiter: &'a Waiter,
    my_id: usize,
    base: u32,
    consumed: u32,
    depth: u32,
}

impl<'a> Consumer<'a> {
    pub fn begin(ctrl: &'a ControlBlock, waiter: &'a Waiter, my_id: usize, base: u32) -> Self {
        Self {
            ctrl,
            waiter,
            my_id,
            base,
            consumed: 0,
            depth: ctrl.layout().depth as u32,
        }
    }

    /// Block until the next chunk is released; returns its ring slot.
    pub fn wait_next(&self) -> usize {
        let seq = self.base.wrapping_add(self.consumed + 1);
        self.waiter
            .wait(&self.ctrl.member(self.my_id).release, seq, self.depth - 1);
        (self.consumed % self.depth) as usize
    }

    /// Acknowledge the chunk returned by [`wait_next`](Self::wait_next).
    pub fn done(&mut self) {
        self.consumed += 1;
        self.ctrl
            .member(self.my_id)
            .gather
            .store(self.base.wrapping_add(self.consumed));
    }
}
