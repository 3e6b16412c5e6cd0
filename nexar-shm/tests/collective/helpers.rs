use nexar_shm::{
    AccessToken, CrossMemory, GroupContext, HostServices, LocalWorld, Locality, Mapping, PeerId,
    SameAddressSpace, ShmComm, ShmConfig, SyntheticTopology, XmemFeatures, form_shm_comm,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 8 ranks: two sockets of four, each split into NUMA pairs.
pub fn two_sockets() -> SyntheticTopology {
    SyntheticTopology::flat()
        .with(Locality::SOCKET, 4)
        .with(Locality::NUMA, 2)
}

/// Small chunks and a shallow ring so modest payloads span many chunks.
pub fn small_chunks(hierarchy: &str) -> ShmConfig {
    ShmConfig {
        hierarchy: hierarchy.to_string(),
        chunk_sizes: vec![256],
        cico_max: 4096,
        pipeline_depth: 2,
        ..ShmConfig::default()
    }
}

/// Run `f` on every rank of a freshly formed engine, each on its own
/// blocking thread. Results are returned in rank order.
pub async fn run_collective<F, T>(
    world_size: u32,
    topology: SyntheticTopology,
    config: ShmConfig,
    f: F,
) -> Vec<T>
where
    F: Fn(&mut ShmComm) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    let world = LocalWorld::new(world_size, topology);
    run_with_services(world.services(), config, f).await
}

/// Like [`run_collective`] with a caller-chosen memory mechanism.
pub async fn run_collective_with_xmem<F, T>(
    world_size: u32,
    topology: SyntheticTopology,
    config: ShmConfig,
    xmem: Arc<dyn CrossMemory>,
    f: F,
) -> Vec<T>
where
    F: Fn(&mut ShmComm) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    let world = LocalWorld::new(world_size, topology);
    run_with_services(world.services_with_xmem(xmem), config, f).await
}

async fn run_with_services<F, T>(services: Vec<HostServices>, config: ShmConfig, f: F) -> Vec<T>
where
    F: Fn(&mut ShmComm) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    let f = Arc::new(f);
    let mut handles = Vec::new();
    for host in services {
        let f = Arc::clone(&f);
        let config = config.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let mut comm = form_shm_comm(host, config).unwrap();
            f(&mut comm)
        }));
    }
    let mut out = Vec::new();
    for h in handles {
        out.push(h.await.unwrap());
    }
    out
}

/// Run `f` on a [`GroupContext`] per rank.
pub async fn run_contexts<F, T>(
    world_size: u32,
    topology: SyntheticTopology,
    config: ShmConfig,
    f: F,
) -> Vec<T>
where
    F: Fn(&mut GroupContext) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    let world = LocalWorld::new(world_size, topology);
    run_contexts_with(world.services(), config, f).await
}

/// Run `f` on a [`GroupContext`] per given host.
pub async fn run_contexts_with<F, T>(services: Vec<HostServices>, config: ShmConfig, f: F) -> Vec<T>
where
    F: Fn(&mut GroupContext) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    let f = Arc::new(f);
    let mut handles = Vec::new();
    for host in services {
        let f = Arc::clone(&f);
        let config = config.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let mut ctx = GroupContext::new(host, config);
            f(&mut ctx)
        }));
    }
    let mut out = Vec::new();
    for h in handles {
        out.push(h.await.unwrap());
    }
    out
}

/// Same address space, but refuses to map: forces the copy path.
#[derive(Debug, Default)]
pub struct CopyOnly(SameAddressSpace);

impl CrossMemory for CopyOnly {
    fn features(&self) -> XmemFeatures {
        XmemFeatures {
            can_map: false,
            needs_registration: false,
        }
    }

    fn expose(&self, base: u64, len: usize) -> nexar_shm::Result<AccessToken> {
        self.0.expose(base, len)
    }

    fn close(&self, token: AccessToken) {
        self.0.close(token)
    }

    unsafe fn map(
        &self,
        _peer: &PeerId,
        _token: AccessToken,
        _vaddr: u64,
        _len: usize,
    ) -> nexar_shm::Result<Mapping> {
        panic!("map called on a copy-only mechanism");
    }

    fn unmap(&self, mapping: Mapping) {
        self.0.unmap(mapping)
    }

    unsafe fn copy_from(
        &self,
        peer: &PeerId,
        dst: u64,
        src_vaddr: u64,
        len: usize,
        token: AccessToken,
    ) -> nexar_shm::Result<()> {
        unsafe { self.0.copy_from(peer, dst, src_vaddr, len, token) }
    }
}

/// Same address space with registration required, counting every call.
#[derive(Debug, Default)]
pub struct CountingXmem {
    exposes: AtomicUsize,
    closes: AtomicUsize,
    maps: AtomicUsize,
    unmaps: AtomicUsize,
}

impl CountingXmem {
    /// `(exposes, closes, maps, unmaps)` so far.
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        (
            self.exposes.load(Ordering::SeqCst),
            self.closes.load(Ordering::SeqCst),
            self.maps.load(Ordering::SeqCst),
            self.unmaps.load(Ordering::SeqCst),
        )
    }
}

impl CrossMemory for CountingXmem {
    fn features(&self) -> XmemFeatures {
        XmemFeatures {
            can_map: true,
            needs_registration: true,
        }
    }

    fn expose(&self, base: u64, len: usize) -> nexar_shm::Result<AccessToken> {
        self.exposes.fetch_add(1, Ordering::SeqCst);
        Ok(AccessToken::from_words([base, len as u64]))
    }

    fn close(&self, _token: AccessToken) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn map(
        &self,
        peer: &PeerId,
        token: AccessToken,
        vaddr: u64,
        len: usize,
    ) -> nexar_shm::Result<Mapping> {
        assert_eq!(token, AccessToken::from_words([vaddr, len as u64]), "stale token");
        self.maps.fetch_add(1, Ordering::SeqCst);
        unsafe { SameAddressSpace.map(peer, token, vaddr, len) }
    }

    fn unmap(&self, mapping: Mapping) {
        self.unmaps.fetch_add(1, Ordering::SeqCst);
        SameAddressSpace.unmap(mapping)
    }

    unsafe fn copy_from(
        &self,
        peer: &PeerId,
        dst: u64,
        src_vaddr: u64,
        len: usize,
        token: AccessToken,
    ) -> nexar_shm::Result<()> {
        unsafe { SameAddressSpace.copy_from(peer, dst, src_vaddr, len, token) }
    }
}

/// Deterministic per-rank payload.
pub fn pattern(rank: u32, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(rank * 7) as u8)
        .collect()
}
