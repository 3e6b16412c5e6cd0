use crate::comm::ShmComm;
use crate::config::ShmConfig;
use crate::error::{Result, ShmCommError};
use crate::group::form_groups;
use crate::host::HostServices;
use crate::protocol::{BootstrapRecord, exchange};
use crate::shm::{Segment, SegmentNamer};
use crate::topology::{build_hierarchy, parse_hierarchy};

/// Form the shared-memory engine. All participants must call this
/// collectively with equal configurations.
///
/// Steps:
/// 1. Create this participant's staging buffer and exchange identities.
/// 2. Build the locality hierarchy.
/// 3. Form one group per level, creating or attaching control blocks.
/// 4. Attach the staging buffers of every co-member.
///
/// A failure on any participant after step 1 starts makes every participant
/// return an error; created segments are removed on the way out.
pub fn form_shm_comm(host: HostServices, config: ShmConfig) -> Result<ShmComm> {
    config.validate()?;
    let defs = parse_hierarchy(&config.hierarchy)?;

    let boot = host.bootstrap.as_ref();
    let me = boot.rank();
    let n = boot.world_size();
    let namer = SegmentNamer::new(me);

    let mut cico = None;
    let mut ok = true;
    if config.cico_max > 0 {
        match Segment::create(&config.backing_dir, &namer.name("cico"), config.cico_max) {
            Ok(seg) => cico = Some(seg),
            Err(e) => {
                tracing::warn!(rank = me, "shm staging buffer creation failed: {e}");
                ok = false;
            }
        }
    }

    let info = BootstrapRecord::RankInfo {
        ok,
        pid: std::process::id(),
        cico: cico.as_ref().map(Segment::handle),
    };
    let infos = exchange(boot, "rank info", &info)?;
    let mut pids = Vec::with_capacity(n as usize);
    let mut cico_handles = Vec::with_capacity(n as usize);
    for rec in infos {
        match rec {
            BootstrapRecord::RankInfo { pid, cico, .. } => {
                pids.push(pid);
                cico_handles.push(cico);
            }
            other => {
                return Err(ShmCommError::DecodeFailed(format!(
                    "expected rank info, got {other:?}"
                )));
            }
        }
    }

    let hierarchy = build_hierarchy(boot, &defs)?;
    if me == 0 && config.chunk_sizes.len() > 1 && config.chunk_sizes.len() != hierarchy.levels.len() {
        tracing::warn!(
            chunk_sizes = config.chunk_sizes.len(),
            levels = hierarchy.levels.len(),
            "shm chunk size list does not match the hierarchy depth; \
             missing levels reuse the last entry, extra entries are ignored"
        );
    }
    let formed = form_groups(boot, &hierarchy, &config, &namer)?;

    let mut peer_cico: Vec<Option<Segment>> = (0..n).map(|_| None).collect();
    let mut attach_ok = true;
    for g in formed.groups.iter().filter(|g| g.is_member && !g.is_trivial()) {
        for &r in &g.members {
            if r == me || peer_cico[r as usize].is_some() {
                continue;
            }
            let Some(handle) = &cico_handles[r as usize] else {
                continue;
            };
            match Segment::attach(handle) {
                Ok(seg) => peer_cico[r as usize] = Some(seg),
                Err(e) => {
                    tracing::warn!(rank = me, peer = r, "shm staging buffer attach failed: {e}");
                    attach_ok = false;
                }
            }
        }
    }
    exchange(boot, "staging attach", &BootstrapRecord::Ack { ok: attach_ok })?;
    if let Some(seg) = cico.as_mut()
        && let Err(e) = seg.unlink()
    {
        tracing::warn!(rank = me, "shm staging buffer unlink failed: {e}");
    }

    if formed.groups.iter().all(|g| g.is_trivial()) {
        return Err(ShmCommError::topology(
            "no group with more than one member; nothing to share",
        ));
    }

    let comm = ShmComm::new(
        host,
        config,
        pids,
        formed.groups,
        formed.level_managers,
        cico,
        peer_cico,
    );
    if comm.config().print_info {
        comm.log_hierarchy();
    }
    if comm.config().set_hierarchy_envs {
        // SAFETY: opting in asserts the host does not touch the
        // environment from other threads during formation.
        unsafe { comm.export_leader_env() };
    }
    tracing::debug!(rank = me, levels = ?comm.levels(), "shm engine formed");
    Ok(comm)
}
