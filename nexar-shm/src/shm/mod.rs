pub mod segment;

use std::sync::atomic::{AtomicU64, Ordering};

pub use segment::{Segment, SegmentHandle};

use crate::types::Rank;

static INSTANCE: AtomicU64 = AtomicU64::new(0);

/// Produces backing-file names unique to one engine instance.
///
/// Names carry the pid, the rank and a per-instance stamp, so several
/// engines in one process (or stale files from a crashed run) never clash.
#[derive(Debug, Clone)]
pub struct SegmentNamer {
    pid: u32,
    rank: Rank,
    stamp: u64,
}

impl SegmentNamer {
    pub fn new(rank: Rank) -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let seq = INSTANCE.fetch_add(1, Ordering::Relaxed);
        Self {
            pid: std::process::id(),
            rank,
            stamp: nanos ^ seq.rotate_left(48),
        }
    }

    pub fn name(&self, tag: &str) -> String {
        format!("nexar_shm.{}.r{}.{:x}.{tag}", self.pid, self.rank, self.stamp)
    }
}
