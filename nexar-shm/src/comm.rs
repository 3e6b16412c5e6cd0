use crate::config::ShmConfig;
use crate::flag::Waiter;
use crate::group::Group;
use crate::host::{HostServices, PeerId, RegistrationCache};
use crate::shm::Segment;
use crate::topology::Locality;
use crate::types::Rank;

/// Shared-memory collective engine for one participant.
///
/// Built by [`crate::form_shm_comm`]. Every collective entry point must be
/// called by all participants in the same order.
pub struct ShmComm {
    host: HostServices,
    config: ShmConfig,
    waiter: Waiter,
    rank: Rank,
    world_size: u32,
    pids: Vec<u32>,
    groups: Vec<Group>,
    /// `level_managers[i][r]`: manager of rank `r`'s group at level `i`.
    level_managers: Vec<Vec<Rank>>,
    /// This participant's staging buffer.
    cico: Option<Segment>,
    /// Staging buffers of the members of this participant's groups.
    peer_cico: Vec<Option<Segment>>,
    /// Zero-copy exposures and peer mappings reused across collectives.
    rcache: RegistrationCache,
    seq: u32,
}

impl ShmComm {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        host: HostServices,
        config: ShmConfig,
        pids: Vec<u32>,
        groups: Vec<Group>,
        level_managers: Vec<Vec<Rank>>,
        cico: Option<Segment>,
        peer_cico: Vec<Option<Segment>>,
    ) -> Self {
        let waiter = Waiter::new(host.progress.clone(), config.spin_budget);
        let rcache = RegistrationCache::new(host.xmem.clone());
        let rank = host.bootstrap.rank();
        let world_size = host.bootstrap.world_size();
        Self {
            host,
            config,
            waiter,
            rank,
            world_size,
            pids,
            groups,
            level_managers,
            cico,
            peer_cico,
            rcache,
            seq: 0,
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    /// Locality of each level, most specific first.
    pub fn levels(&self) -> Vec<Locality> {
        self.groups.iter().map(|g| g.locality).collect()
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub(crate) fn groups_mut(&mut self) -> &mut [Group] {
        &mut self.groups
    }

    pub fn config(&self) -> &ShmConfig {
        &self.config
    }

    pub fn host(&self) -> &HostServices {
        &self.host
    }

    pub fn registrations(&self) -> &RegistrationCache {
        &self.rcache
    }

    pub(crate) fn waiter(&self) -> &Waiter {
        &self.waiter
    }

    /// Manager of `rank`'s group at `level`.
    pub fn manager_of(&self, level: usize, rank: Rank) -> Rank {
        self.level_managers[level][rank as usize]
    }

    pub(crate) fn peer(&self, rank: Rank) -> PeerId {
        PeerId {
            rank,
            pid: self.pids[rank as usize],
        }
    }

    /// Local address of `rank`'s staging buffer, if mapped here.
    pub(crate) fn cico_ptr(&self, rank: Rank) -> Option<u64> {
        let seg = if rank == self.rank {
            self.cico.as_ref()
        } else {
            self.peer_cico.get(rank as usize)?.as_ref()
        };
        seg.map(|s| s.as_ptr() as u64)
    }

    /// Sequence number of the next collective.
    pub(crate) fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Whether any group above `level` in this participant's chain moves data.
    pub(crate) fn has_active_above(&self, level: usize) -> bool {
        self.groups[level + 1..].iter().any(|g| !g.is_trivial())
    }

    /// Variable announcing this participant as a hardware-level leader:
    /// the first group it manages decides, and only socket, NUMA and L3
    /// groups have one.
    pub fn leader_env(&self) -> Option<&'static str> {
        let g = self.groups.iter().find(|g| g.is_member && g.manager() == self.rank)?;
        match g.locality {
            Locality::SOCKET => Some("AM_SOCKET_LEADER"),
            Locality::NUMA => Some("AM_NUMA_LEADER"),
            Locality::L3CACHE => Some("AM_L3_LEADER"),
            _ => None,
        }
    }

    /// Set [`leader_env`](Self::leader_env) to `1` unless it is already set.
    ///
    /// # Safety
    /// No other thread may read or write the environment concurrently.
    pub unsafe fn export_leader_env(&self) {
        let Some(key) = self.leader_env() else { return };
        if std::env::var_os(key).is_none() {
            tracing::debug!(rank = self.rank, key, "exporting hierarchy leader variable");
            unsafe { std::env::set_var(key, "1") };
        }
    }

    /// Log the formed hierarchy.
    pub fn log_hierarchy(&self) {
        for g in &self.groups {
            tracing::info!(
                rank = self.rank,
                level = g.level,
                locality = %g.locality,
                members = ?g.members,
                member = g.is_member,
                chunk = g.chunk_size,
                "shm hierarchy"
            );
        }
    }
}

impl std::fmt::Debug for ShmComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmComm")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("levels", &self.levels())
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}
