//! Per-level groups and their formation.
//!
//! Level 0 groups every participant with its level-0 neighbours. Each
//! group's manager (its lowest rank) is the only candidate for the next
//! level. Every participant holds one group per level: the group it is a
//! member of, or, above its own reach, the group its manager chain belongs
//! to. A broadcast root uses the latter to feed upper levels directly.

mod control;

pub use control::{ControlBlock, CtrlLayout, GroupCtrl, MemberCtrl, MemberMeta, TransferMeta};

use crate::config::ShmConfig;
use crate::error::{Result, ShmCommError};
use crate::host::Bootstrap;
use crate::host::adapter::allgather_u32;
use crate::pipeline::PipelineState;
use crate::protocol::{BootstrapRecord, exchange};
use crate::shm::SegmentNamer;
use crate::topology::{Hierarchy, Locality};
use crate::types::Rank;

/// One level of this participant's hierarchy.
#[derive(Debug)]
pub struct Group {
    pub level: usize,
    pub locality: Locality,
    /// Ranks of the members, ascending. `members[0]` manages the group.
    pub members: Vec<Rank>,
    /// Slot this participant acts in: its own if it is a member, otherwise
    /// the slot of its manager chain.
    pub member_id: usize,
    /// Whether this participant is itself a member.
    pub is_member: bool,
    pub chunk_size: usize,
    /// `None` for single-member groups.
    pub ctrl: Option<ControlBlock>,
    pub pipe: PipelineState,
}

impl Group {
    pub fn manager(&self) -> Rank {
        self.members[0]
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn is_trivial(&self) -> bool {
        self.members.len() < 2
    }

    /// Slot of `rank` within the group, if it is a member.
    pub fn slot_of(&self, rank: Rank) -> Option<usize> {
        self.members.iter().position(|&r| r == rank)
    }

    /// The control block of a group that takes part in collectives.
    pub fn active_ctrl(&self) -> Option<&ControlBlock> {
        self.ctrl.as_ref().filter(|_| !self.is_trivial())
    }
}

/// Result of group formation.
#[derive(Debug)]
pub struct FormedGroups {
    pub groups: Vec<Group>,
    /// `level_managers[i][r]`: manager of rank `r`'s group at level `i`.
    pub level_managers: Vec<Vec<Rank>>,
}

/// Form one group per hierarchy level. Collective over the bootstrap.
pub fn form_groups(
    boot: &dyn Bootstrap,
    hierarchy: &Hierarchy,
    config: &ShmConfig,
    namer: &SegmentNamer,
) -> Result<FormedGroups> {
    let me = boot.rank();
    let n = boot.world_size();

    let mut groups: Vec<Group> = Vec::with_capacity(hierarchy.levels.len());
    let mut level_managers = Vec::with_capacity(hierarchy.levels.len());

    for (level, &loc) in hierarchy.levels.iter().enumerate() {
        let candidate = match groups.last() {
            None => true,
            Some(prev) => prev.is_member && prev.manager() == me,
        };
        let flags = allgather_u32(boot, u32::from(candidate))?;
        let members: Vec<Rank> = (0..n)
            .filter(|&r| flags[r as usize] != 0 && hierarchy.is_local(r, loc))
            .collect();

        // Non-members act in the slot of their previous-level manager.
        let slot_rank = match groups.last() {
            Some(prev) if !candidate => prev.manager(),
            _ => me,
        };
        let member_id = members.iter().position(|&r| r == slot_rank);
        let chunk_size = config.chunk_size(level);

        let mut ok = member_id.is_some();
        let manager = members.first().copied().unwrap_or(me);
        let trivial = members.len() < 2;

        let mut ctrl = None;
        if ok && candidate && manager == me && !trivial {
            let created = CtrlLayout::new(members.len(), chunk_size, config.pipeline_depth as usize)
                .and_then(|layout| {
                    ControlBlock::create(&config.backing_dir, &namer.name(&format!("ctrl{level}")), layout)
                });
            match created {
                Ok(block) => ctrl = Some(block),
                Err(e) => {
                    tracing::warn!(level, "shm control block creation failed: {e}");
                    ok = false;
                }
            }
        }

        let info = BootstrapRecord::CommInfo {
            ok,
            manager,
            ctrl: ctrl.as_ref().map(ControlBlock::handle),
        };
        let records = exchange(boot, "group formation", &info)?;
        let managers: Vec<Rank> = records
            .iter()
            .map(|rec| match rec {
                BootstrapRecord::CommInfo { manager, .. } => *manager,
                _ => Rank::MAX,
            })
            .collect();

        // Every member must agree on who manages the group.
        let mut attach_ok = members.iter().all(|&r| managers[r as usize] == manager);
        if !attach_ok {
            tracing::warn!(level, "shm group members disagree on their manager");
        }
        if attach_ok && !trivial && manager != me {
            let handle = match &records[manager as usize] {
                BootstrapRecord::CommInfo { ctrl: Some(h), .. } => Some(h),
                _ => None,
            };
            let attached = handle
                .ok_or_else(|| ShmCommError::topology(format!("rank {manager} published no control block")))
                .and_then(|h| {
                    let layout = CtrlLayout::new(members.len(), chunk_size, config.pipeline_depth as usize)?;
                    ControlBlock::attach(h, layout)
                });
            match attached {
                Ok(block) => ctrl = Some(block),
                Err(e) => {
                    tracing::warn!(level, "shm control block attach failed: {e}");
                    attach_ok = false;
                }
            }
        }

        exchange(boot, "group attach", &BootstrapRecord::Ack { ok: attach_ok })?;
        if let Some(block) = ctrl.as_mut()
            && let Err(e) = block.unlink()
        {
            tracing::warn!(level, "shm control block unlink failed: {e}");
        }

        tracing::debug!(
            level,
            locality = %loc,
            members = ?members,
            member_id = member_id.unwrap_or(0),
            candidate,
            "shm group formed"
        );

        groups.push(Group {
            level,
            locality: loc,
            members,
            member_id: member_id.unwrap_or(0),
            is_member: candidate,
            chunk_size,
            ctrl,
            pipe: PipelineState::default(),
        });
        level_managers.push(managers);
    }

    Ok(FormedGroups {
        groups,
        level_managers,
    })
}
