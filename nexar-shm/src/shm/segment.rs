//! File-backed shared segments.
//!
//! One participant creates a segment (sizing and zero-filling it), publishes
//! its [`SegmentHandle`] through the bootstrap exchange, and unlinks the
//! backing file once every peer has attached. Mappings stay valid after the
//! unlink until each participant drops its [`Segment`].

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{Result, ShmCommError};

/// Everything a peer needs to attach to a segment.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SegmentHandle {
    pub path: String,
    pub len: u64,
}

/// A mapped shared-memory segment.
#[derive(Debug)]
pub struct Segment {
    _mmap: MmapMut,
    base: *mut u8,
    len: usize,
    path: PathBuf,
    _file: File,
    owner: bool,
    linked: bool,
}

// SAFETY: the mapping is shared memory by construction; all cross-thread and
// cross-process access to it goes through atomics or is ordered by them.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create a new zero-filled segment named `name` inside `dir`.
    ///
    /// Fails if a file of that name already exists.
    pub fn create(dir: &Path, name: &str, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(ShmCommError::segment(name, "zero-length segment"));
        }
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| ShmCommError::segment(path.display(), format!("create: {e}")))?;

        let mapped = file
            .set_len(len as u64)
            // SAFETY: the file was just created by us and sized to `len`.
            .and_then(|_| unsafe { MmapOptions::new().len(len).map_mut(&file) });
        let mut mmap = match mapped {
            Ok(m) => m,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(ShmCommError::segment(path.display(), format!("map: {e}")));
            }
        };

        // Touch every page from the creator so first-touch placement keeps
        // the segment on the creator's NUMA node.
        mmap.fill(0);
        let base = mmap.as_mut_ptr();

        tracing::debug!(path = %path.display(), len, "shm segment created");
        Ok(Self {
            _mmap: mmap,
            base,
            len,
            path,
            _file: file,
            owner: true,
            linked: true,
        })
    }

    /// Attach to a segment created by another participant.
    pub fn attach(handle: &SegmentHandle) -> Result<Self> {
        let path = PathBuf::from(&handle.path);
        let len = usize::try_from(handle.len)
            .map_err(|_| ShmCommError::segment(&handle.path, "length overflows usize"))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| ShmCommError::segment(&handle.path, format!("open: {e}")))?;

        let actual = file.metadata()?.len();
        if actual < handle.len {
            return Err(ShmCommError::segment(
                &handle.path,
                format!("backing file holds {actual} bytes, expected {len}"),
            ));
        }

        // SAFETY: the file is at least `len` bytes long (checked above).
        let mut mmap = unsafe { MmapOptions::new().len(len).map_mut(&file) }
            .map_err(|e| ShmCommError::segment(&handle.path, format!("map: {e}")))?;
        let base = mmap.as_mut_ptr();

        tracing::debug!(path = %handle.path, len, "shm segment attached");
        Ok(Self {
            _mmap: mmap,
            base,
            len,
            path,
            _file: file,
            owner: false,
            linked: true,
        })
    }

    pub fn handle(&self) -> SegmentHandle {
        SegmentHandle {
            path: self.path.to_string_lossy().into_owned(),
            len: self.len as u64,
        }
    }

    /// Base address of the mapping in this process.
    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the backing file. Only the creator unlinks; calling this on an
    /// attached segment or twice is a no-op.
    pub fn unlink(&mut self) -> Result<()> {
        if !self.owner || !self.linked {
            return Ok(());
        }
        std::fs::remove_file(&self.path)
            .map_err(|e| ShmCommError::segment(self.path.display(), format!("unlink: {e}")))?;
        self.linked = false;
        tracing::debug!(path = %self.path.display(), "shm segment unlinked");
        Ok(())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.owner && self.linked {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::debug!(path = %self.path.display(), "shm segment cleanup failed: {e}");
            }
        }
    }
}
