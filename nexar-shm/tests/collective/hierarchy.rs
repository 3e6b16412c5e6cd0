use super::helpers::{run_collective, small_chunks, two_sockets};
use nexar_shm::{LocalWorld, Locality, ShmCommError, ShmConfig, SyntheticTopology, form_shm_comm};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_levels_and_managers() {
    let config = ShmConfig {
        print_info: true,
        ..small_chunks("numa,socket")
    };
    let views = run_collective(8, two_sockets(), config, |comm| {
        assert_eq!(
            comm.levels(),
            vec![Locality::NUMA, Locality::SOCKET, Locality::NODE]
        );
        let managers: Vec<Vec<u32>> = (0..3)
            .map(|level| (0..8).map(|r| comm.manager_of(level, r)).collect())
            .collect();
        let membership: Vec<bool> = comm.groups().iter().map(|g| g.is_member).collect();
        (managers, membership)
    })
    .await;

    for (managers, _) in &views {
        assert_eq!(managers[0], vec![0, 0, 2, 2, 4, 4, 6, 6]);
        assert_eq!(managers[1], vec![0, 0, 0, 0, 4, 4, 4, 4]);
        assert_eq!(managers[2], vec![0; 8]);
    }
    assert_eq!(views[0].1, vec![true, true, true]);
    assert_eq!(views[2].1, vec![true, true, false]);
    assert_eq!(views[6].1, vec![true, true, false]);
    assert_eq!(views[5].1, vec![true, false, false]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_group_members_follow_manager_chain() {
    let views = run_collective(8, two_sockets(), small_chunks("numa,socket"), |comm| {
        comm.groups()
            .iter()
            .map(|g| g.members.clone())
            .collect::<Vec<_>>()
    })
    .await;
    assert_eq!(views[5], vec![vec![4, 5], vec![4, 6], vec![0, 4]]);
    assert_eq!(views[3], vec![vec![2, 3], vec![0, 2], vec![0, 4]]);
    assert_eq!(views[0], vec![vec![0, 1], vec![0, 2], vec![0, 4]]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_formation_failure_is_reported_everywhere() {
    let world = LocalWorld::new(4, SyntheticTopology::flat());
    let config = ShmConfig {
        backing_dir: "/nonexistent/nexar-shm-test".into(),
        ..small_chunks("")
    };
    let mut handles = Vec::new();
    for host in world.services() {
        let config = config.clone();
        handles.push(tokio::task::spawn_blocking(move || form_shm_comm(host, config)));
    }
    for h in handles {
        let err = h.await.unwrap().unwrap_err();
        assert!(
            matches!(err, ShmCommError::InitAborted { stage: "rank info" }),
            "{err}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_hierarchy_is_rejected() {
    let world = LocalWorld::new(2, SyntheticTopology::flat());
    let mut handles = Vec::new();
    for host in world.services() {
        handles.push(tokio::task::spawn_blocking(move || {
            form_shm_comm(host, small_chunks("numa,bogus"))
        }));
    }
    for h in handles {
        assert!(h.await.unwrap().is_err());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_leader_env_follows_lowest_managed_group() {
    let numa = run_collective(8, two_sockets(), small_chunks("numa,socket"), |comm| {
        comm.leader_env()
    })
    .await;
    let leaders: Vec<Option<&str>> = (0..8)
        .map(|r| (r % 2 == 0).then_some("AM_NUMA_LEADER"))
        .collect();
    assert_eq!(numa, leaders);

    let socket = run_collective(8, two_sockets(), small_chunks("socket"), |comm| {
        comm.leader_env()
    })
    .await;
    assert_eq!(socket[0], Some("AM_SOCKET_LEADER"));
    assert_eq!(socket[4], Some("AM_SOCKET_LEADER"));
    assert_eq!(socket[1], None);

    let flat = run_collective(4, SyntheticTopology::flat(), small_chunks(""), |comm| {
        comm.leader_env()
    })
    .await;
    assert_eq!(flat, vec![None; 4]);
}
