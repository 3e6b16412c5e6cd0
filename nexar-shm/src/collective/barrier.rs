use crate::comm::ShmComm;
use crate::error::Result;

/// Hierarchical barrier.
///
/// Arrival climbs the hierarchy: each participant announces itself in its
/// lowest non-trivial group, and every manager waits for all of its members
/// before announcing itself one level up. The topmost manager then releases
/// the hierarchy top-down through each group's `coll_ack`. Participants
/// acknowledge the release in every group they joined.
pub fn hierarchical_barrier(comm: &mut ShmComm) -> Result<()> {
    let seq = comm.next_seq();
    let me = comm.rank();
    let waiter = comm.waiter();

    let mut joined: Vec<usize> = Vec::new();
    let mut led: Vec<usize> = Vec::new();
    for (idx, group) in comm.groups().iter().enumerate() {
        if !group.is_member {
            break;
        }
        let Some(ctrl) = group.active_ctrl() else {
            continue;
        };

        ctrl.member(group.member_id).member_seq.store(seq);
        joined.push(idx);
        if group.manager() != me {
            waiter.wait(&ctrl.group().coll_ack, seq, 0);
            break;
        }
        for m in 1..group.size() {
            waiter.wait(&ctrl.member(m).member_seq, seq, 0);
        }
        led.push(idx);
    }

    for &idx in led.iter().rev() {
        if let Some(ctrl) = comm.groups()[idx].active_ctrl() {
            ctrl.group().coll_ack.store(seq);
        }
    }
    for &idx in &joined {
        let group = &comm.groups()[idx];
        if let Some(ctrl) = group.active_ctrl() {
            ctrl.member(group.member_id).member_ack.store(seq);
        }
    }
    Ok(())
}
