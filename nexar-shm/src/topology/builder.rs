//! Turns parsed level definitions into an ordered list of locality levels.
//!
//! Named levels come straight from the host's locality query. Anything else
//! (rank lists, split or capped scopes, several defs in one level) gets a
//! synthesized virtual bit, marked only on the peers that end up grouped
//! with this participant. Every step that needs agreement goes through the
//! bootstrap, so all participants build the same level list.

use crate::error::{Result, ShmCommError};
use crate::host::Bootstrap;
use crate::host::adapter::{allgather_u32, allreduce_max, allreduce_min};
use crate::topology::{LevelDef, Locality, LocalityDef};
use crate::types::Rank;

/// The built hierarchy, as seen by one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hierarchy {
    /// Locality of each level, most specific first. The last level is shared
    /// by every participant.
    pub levels: Vec<Locality>,
    /// How each participant relates to this one, virtual bits included.
    pub peer_locality: Vec<Locality>,
}

impl Hierarchy {
    /// Whether `peer` shares level locality `loc` with this participant.
    pub fn is_local(&self, peer: Rank, loc: Locality) -> bool {
        self.peer_locality
            .get(peer as usize)
            .is_some_and(|l| l.contains(loc))
    }
}

/// Build the hierarchy for `defs`. Collective over the bootstrap.
pub fn build_hierarchy(boot: &dyn Bootstrap, defs: &[LevelDef]) -> Result<Hierarchy> {
    let n = boot.world_size();
    let me = boot.rank();
    for (i, level) in defs.iter().enumerate() {
        check_rank_lists(i, level, n)?;
    }

    let mut peer_locality: Vec<Locality> = (0..n).map(|r| boot.locality(r)).collect();
    peer_locality[me as usize] = peer_locality[me as usize] | Locality::ALL_VIRTUAL;

    let mut levels = Vec::with_capacity(defs.len() + 1);
    let mut n_virtual = 0u32;

    for level in defs {
        if level.defs.is_empty() {
            return Err(ShmCommError::topology("hierarchy level without definitions"));
        }
        if !level.is_virtual() {
            levels.push(level.defs[0].named_locality());
            continue;
        }

        if n_virtual == Locality::VIRTUAL_BITS {
            return Err(ShmCommError::topology(format!(
                "at most {} virtual levels are supported",
                Locality::VIRTUAL_BITS
            )));
        }
        let bit = Locality::virtual_bit(n_virtual);
        n_virtual += 1;
        levels.push(bit);

        let my_def = claim_def(boot, &peer_locality, &level.defs)?;

        // Ranks following a different scope must not be grouped together.
        let follow = my_def.map_or(Locality::NONE, |d| d.named_locality());
        let follow_list = allgather_u32(boot, follow.bits())?;

        let Some(def) = my_def else { continue };
        mark_virtual(me, def, bit, &follow_list, &mut peer_locality);
    }

    if !levels.iter().any(|l| l.is_virtual()) {
        levels = sort_levels(boot, &peer_locality, &levels)?;
    }

    let local_common = peer_locality
        .iter()
        .fold(Locality::ALL_NAMED, |acc, l| acc & *l);
    let common = allgather_u32(boot, local_common.bits())?
        .into_iter()
        .fold(Locality::ALL_NAMED, |acc, bits| acc & Locality(bits));
    if common.is_empty() {
        return Err(ShmCommError::NoCommonLocality);
    }
    if levels.last().is_none_or(|last| !common.contains(*last)) {
        levels.push(common);
    }

    Ok(Hierarchy {
        levels,
        peer_locality,
    })
}

/// Every listed rank must exist, and may appear only once per level.
fn check_rank_lists(index: usize, level: &LevelDef, n: u32) -> Result<()> {
    let mut listed = vec![false; n as usize];
    for ranges in level.defs.iter().filter_map(LocalityDef::rank_list) {
        for range in ranges {
            if *range.end() >= n {
                return Err(ShmCommError::config(format!(
                    "hierarchy level {index}: rank list [{}-{}] exceeds world size {n}",
                    range.start(),
                    range.end()
                )));
            }
            for r in range.clone() {
                if std::mem::replace(&mut listed[r as usize], true) {
                    return Err(ShmCommError::config(format!(
                        "hierarchy level {index}: rank {r} is listed more than once"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Decide which def of a multi-def level this participant follows.
///
/// A rank list containing this participant wins outright. Named defs are
/// then claimed in order: the lowest unclaimed rank (or the highest, once a
/// repeat def reverses the direction) takes the next def, together with
/// every rank local to it at that scope. The last def left is followed by
/// whoever remains.
fn claim_def<'a>(
    boot: &dyn Bootstrap,
    peer_locality: &[Locality],
    defs: &'a [LocalityDef],
) -> Result<Option<&'a LocalityDef>> {
    let me = boot.rank();
    let n = boot.world_size() as i64;

    let mut my_def = defs.iter().find(|d| d.contains_rank(me));
    let mut remaining: Vec<&LocalityDef> = defs.iter().filter(|d| d.rank_list().is_none()).collect();

    let mut forward = true;
    while remaining.len() > 1 {
        let idx = if forward { 0 } else { remaining.len() - 1 };
        let def = remaining[idx];
        if forward && def.repeat {
            forward = false;
            continue;
        }

        let ticket = match my_def {
            None => me as i64,
            Some(_) if forward => n,
            Some(_) => -1,
        };
        let chosen = if forward {
            allreduce_min(boot, ticket)?
        } else {
            allreduce_max(boot, ticket)?
        };

        if my_def.is_none()
            && (0..n).contains(&chosen)
            && peer_locality[chosen as usize].contains(def.named_locality())
        {
            my_def = Some(def);
        }
        remaining.remove(idx);
    }

    if my_def.is_none() {
        my_def = remaining.first().copied();
    }
    Ok(my_def)
}

/// Set `bit` on every peer grouped with `me` under `def`.
fn mark_virtual(
    me: Rank,
    def: &LocalityDef,
    bit: Locality,
    follow_list: &[u32],
    peer_locality: &mut [Locality],
) {
    let members: Vec<Rank> = match def.rank_list() {
        Some(ranges) => ranges.iter().flat_map(|r| r.clone()).collect(),
        None => {
            let scope = def.named_locality();
            (0..peer_locality.len() as Rank)
                .filter(|&r| {
                    follow_list[r as usize] == scope.bits()
                        && peer_locality[r as usize].contains(scope)
                })
                .collect()
        }
    };
    for &r in &members {
        if let Some(l) = peer_locality.get_mut(r as usize) {
            *l = *l | bit;
        }
    }

    let Some(my_idx) = members.iter().position(|&r| r == me) else {
        return;
    };
    let piece = if def.split > 1 {
        split_piece(members.len(), def.split as usize, my_idx)
    } else if def.max_ranks > 1 {
        let cap = def.max_ranks as usize;
        let start = my_idx / cap * cap;
        start..(start + cap).min(members.len())
    } else {
        return;
    };

    for (m, &r) in members.iter().enumerate() {
        if !piece.contains(&m) {
            if let Some(l) = peer_locality.get_mut(r as usize) {
                *l = l.without(bit);
            }
        }
    }
}

/// Index range of the piece holding `idx` when `len` members are cut into
/// `pieces` near-equal pieces (earlier pieces take the leftover).
fn split_piece(len: usize, pieces: usize, idx: usize) -> std::ops::Range<usize> {
    let size = len / pieces;
    let leftover = len % pieces;
    let mut start = 0;
    for p in 0..pieces {
        let end = start + size + usize::from(p < leftover);
        if idx < end {
            return start..end;
        }
        start = end;
    }
    start..len
}

/// Order named levels from most to least specific: the level matching the
/// most peers (summed over all participants) goes last; ties keep the
/// configured order.
fn sort_levels(
    boot: &dyn Bootstrap,
    peer_locality: &[Locality],
    levels: &[Locality],
) -> Result<Vec<Locality>> {
    let mut totals = Vec::with_capacity(levels.len());
    for &loc in levels {
        let local = peer_locality.iter().filter(|l| l.contains(loc)).count() as u32;
        let sum: u64 = allgather_u32(boot, local)?.into_iter().map(u64::from).sum();
        totals.push(sum);
    }

    let mut done = vec![false; levels.len()];
    let mut sorted = vec![Locality::NONE; levels.len()];
    for slot in (0..levels.len()).rev() {
        let mut best: Option<usize> = None;
        for i in 0..levels.len() {
            if done[i] {
                continue;
            }
            if best.is_none_or(|b| totals[i] > totals[b]) {
                best = Some(i);
            }
        }
        if let Some(b) = best {
            sorted[slot] = levels[b];
            done[b] = true;
        }
    }
    Ok(sorted)
}
