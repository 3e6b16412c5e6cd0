//! Cross-process memory access.
//!
//! Zero-copy transfers read directly from a peer's user buffer. The owner
//! exposes the buffer and publishes a token; readers either map the range
//! into their own address space or copy out of it on demand.

use crate::error::{Result, ShmCommError};
use crate::types::Rank;

/// Opaque access token handed from the exposing participant to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AccessToken(pub [u8; 16]);

impl AccessToken {
    pub fn to_words(self) -> [u64; 2] {
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&self.0[..8]);
        hi.copy_from_slice(&self.0[8..]);
        [u64::from_le_bytes(lo), u64::from_le_bytes(hi)]
    }

    pub fn from_words(words: [u64; 2]) -> Self {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&words[0].to_le_bytes());
        out[8..].copy_from_slice(&words[1].to_le_bytes());
        Self(out)
    }
}

/// Identity of a peer process as seen by the cross-memory mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    pub rank: Rank,
    pub pid: u32,
}

/// What the mechanism can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XmemFeatures {
    /// `map` is available; otherwise readers fall back to `copy_from`.
    pub can_map: bool,
    /// Buffers must be exposed before peers can read them.
    pub needs_registration: bool,
}

/// A peer range mapped into this process.
#[derive(Debug)]
pub struct Mapping {
    /// Local address of the first mapped byte.
    pub local: u64,
    pub len: usize,
}

/// Host-provided cross-process memory mechanism.
pub trait CrossMemory: Send + Sync {
    fn features(&self) -> XmemFeatures;

    /// Make `[base, base + len)` readable by peers.
    fn expose(&self, base: u64, len: usize) -> Result<AccessToken>;

    /// Withdraw an exposure made by [`expose`](Self::expose).
    fn close(&self, token: AccessToken);

    /// Map `len` bytes of `peer`'s memory at `vaddr`.
    ///
    /// # Safety
    /// The peer must keep the range valid until the mapping is released.
    unsafe fn map(
        &self,
        peer: &PeerId,
        token: AccessToken,
        vaddr: u64,
        len: usize,
    ) -> Result<Mapping>;

    fn unmap(&self, mapping: Mapping);

    /// Copy `len` bytes from `peer`'s `src_vaddr` into local `dst`.
    ///
    /// # Safety
    /// `dst` must be valid for `len` bytes; the peer range must be valid for
    /// the duration of the call.
    unsafe fn copy_from(
        &self,
        peer: &PeerId,
        dst: u64,
        src_vaddr: u64,
        len: usize,
        token: AccessToken,
    ) -> Result<()>;
}

/// All participants share one address space (threads of one process).
///
/// Mapping is the identity and copies are plain memcpy.
#[derive(Debug, Default, Clone, Copy)]
pub struct SameAddressSpace;

impl CrossMemory for SameAddressSpace {
    fn features(&self) -> XmemFeatures {
        XmemFeatures {
            can_map: true,
            needs_registration: false,
        }
    }

    fn expose(&self, _base: u64, _len: usize) -> Result<AccessToken> {
        Ok(AccessToken::default())
    }

    fn close(&self, _token: AccessToken) {}

    unsafe fn map(
        &self,
        _peer: &PeerId,
        _token: AccessToken,
        vaddr: u64,
        len: usize,
    ) -> Result<Mapping> {
        Ok(Mapping { local: vaddr, len })
    }

    fn unmap(&self, _mapping: Mapping) {}

    unsafe fn copy_from(
        &self,
        _peer: &PeerId,
        dst: u64,
        src_vaddr: u64,
        len: usize,
        _token: AccessToken,
    ) -> Result<()> {
        if len > 0 {
            // SAFETY: caller guarantees both ranges; the address space is shared.
            unsafe {
                std::ptr::copy_nonoverlapping(src_vaddr as *const u8, dst as *mut u8, len);
            }
        }
        Ok(())
    }
}

/// Copy-only access to other processes through `process_vm_readv`.
///
/// Needs ptrace permission over the peer (same user with a permissive
/// `ptrace_scope`, or `CAP_SYS_PTRACE`).
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessVm;

#[cfg(target_os = "linux")]
impl CrossMemory for ProcessVm {
    fn features(&self) -> XmemFeatures {
        XmemFeatures {
            can_map: false,
            needs_registration: false,
        }
    }

    fn expose(&self, _base: u64, _len: usize) -> Result<AccessToken> {
        Ok(AccessToken::default())
    }

    fn close(&self, _token: AccessToken) {}

    unsafe fn map(
        &self,
        _peer: &PeerId,
        _token: AccessToken,
        _vaddr: u64,
        _len: usize,
    ) -> Result<Mapping> {
        Err(ShmCommError::xmem("process_vm_readv cannot map peer memory"))
    }

    fn unmap(&self, _mapping: Mapping) {}

    unsafe fn copy_from(
        &self,
        peer: &PeerId,
        dst: u64,
        src_vaddr: u64,
        len: usize,
        _token: AccessToken,
    ) -> Result<()> {
        let mut done = 0usize;
        while done < len {
            let local = libc::iovec {
                iov_base: (dst as usize + done) as *mut libc::c_void,
                iov_len: len - done,
            };
            let remote = libc::iovec {
                iov_base: (src_vaddr as usize + done) as *mut libc::c_void,
                iov_len: len - done,
            };
            // SAFETY: caller guarantees `dst` is valid for `len` bytes; the
            // kernel validates the remote range.
            let n = unsafe { libc::process_vm_readv(peer.pid as libc::pid_t, &local, 1, &remote, 1, 0) };
            if n < 0 {
                return Err(ShmCommError::xmem_with_source(
                    format!("process_vm_readv from rank {} (pid {})", peer.rank, peer.pid),
                    std::io::Error::last_os_error(),
                ));
            }
            if n == 0 {
                return Err(ShmCommError::xmem(format!(
                    "process_vm_readv from rank {} made no progress",
                    peer.rank
                )));
            }
            done += n as usize;
        }
        Ok(())
    }
}
