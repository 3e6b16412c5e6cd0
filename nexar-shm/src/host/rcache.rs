//! Registration cache for zero-copy transfers.
//!
//! Exposing a buffer and mapping a peer's range can be expensive, and
//! collectives tend to run on the same buffers over and over. The cache keeps
//! both for the lifetime of the engine: an exposure is keyed by its local
//! range, a mapping by the peer, its token and the mapped range. Everything
//! still held is released on drop.
//!
//! Reuse assumes the mechanism resolves a mapping through the owner's
//! current address space, so a range that was freed and reallocated by the
//! owner stays readable through the cached entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::Result;
use crate::host::{AccessToken, CrossMemory, Mapping, PeerId};

/// Mappings kept before the cache is flushed at the next collective.
const MAX_MAPPINGS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MapKey {
    peer: PeerId,
    token: AccessToken,
    vaddr: u64,
    len: usize,
}

pub struct RegistrationCache {
    xmem: Arc<dyn CrossMemory>,
    exposed: Mutex<HashMap<(u64, usize), AccessToken>>,
    mapped: Mutex<HashMap<MapKey, Mapping>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Entries stay consistent even if a holder panicked mid-insert.
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RegistrationCache {
    pub fn new(xmem: Arc<dyn CrossMemory>) -> Self {
        Self {
            xmem,
            exposed: Mutex::new(HashMap::new()),
            mapped: Mutex::new(HashMap::new()),
        }
    }

    pub fn xmem(&self) -> &dyn CrossMemory {
        self.xmem.as_ref()
    }

    /// Token for `[base, base + len)`, exposing the range on first use.
    ///
    /// Mechanisms that need no registration get the default token and are
    /// never asked to expose anything.
    pub fn expose(&self, base: u64, len: usize) -> Result<AccessToken> {
        if !self.xmem.features().needs_registration {
            return Ok(AccessToken::default());
        }
        let mut exposed = lock(&self.exposed);
        if let Some(&token) = exposed.get(&(base, len)) {
            return Ok(token);
        }
        let token = self.xmem.expose(base, len)?;
        tracing::trace!(base, len, "exposed buffer for zero-copy");
        exposed.insert((base, len), token);
        Ok(token)
    }

    /// Local address of `len` bytes of `peer`'s memory at `vaddr`, mapping
    /// the range on first use.
    ///
    /// # Safety
    /// The peer must keep the range valid while it is read through the
    /// returned address.
    pub unsafe fn map(&self, peer: &PeerId, token: AccessToken, vaddr: u64, len: usize) -> Result<u64> {
        let key = MapKey {
            peer: *peer,
            token,
            vaddr,
            len,
        };
        let mut mapped = lock(&self.mapped);
        if let Some(m) = mapped.get(&key) {
            return Ok(m.local);
        }
        let m = unsafe { self.xmem.map(peer, token, vaddr, len)? };
        tracing::trace!(peer = peer.rank, vaddr, len, "mapped peer range");
        let local = m.local;
        mapped.insert(key, m);
        Ok(local)
    }

    /// Drop every mapping once too many have piled up. Only call between
    /// collectives, while no address handed out by [`map`](Self::map) is in
    /// use.
    pub fn trim(&self) {
        let mut mapped = lock(&self.mapped);
        if mapped.len() > MAX_MAPPINGS {
            tracing::debug!(mappings = mapped.len(), "flushing peer mapping cache");
            for (_, m) in mapped.drain() {
                self.xmem.unmap(m);
            }
        }
    }

    pub fn mapped_len(&self) -> usize {
        lock(&self.mapped).len()
    }

    pub fn exposed_len(&self) -> usize {
        lock(&self.exposed).len()
    }
}

impl Drop for RegistrationCache {
    fn drop(&mut self) {
        let mapped = std::mem::take(self.mapped.get_mut().unwrap_or_else(PoisonError::into_inner));
        for (_, m) in mapped {
            self.xmem.unmap(m);
        }
        let exposed = std::mem::take(self.exposed.get_mut().unwrap_or_else(PoisonError::into_inner));
        for (_, token) in exposed {
            self.xmem.close(token);
        }
    }
}

impl std::fmt::Debug for RegistrationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationCache")
            .field("exposed", &self.exposed_len())
            .field("mapped", &self.mapped_len())
            .finish()
    }
}
