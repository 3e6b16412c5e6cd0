use super::helpers::{run_collective, small_chunks, two_sockets};
use nexar_shm::{Locality, SyntheticTopology, hierarchical_barrier};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

async fn check_ordering(n: u32, topology: SyntheticTopology, hierarchy: &str, rounds: u32) {
    let arrived = Arc::new(AtomicU32::new(0));
    run_collective(n, topology, small_chunks(hierarchy), move |comm| {
        for round in 1..=rounds {
            arrived.fetch_add(1, Ordering::SeqCst);
            hierarchical_barrier(comm).unwrap();
            assert!(
                arrived.load(Ordering::SeqCst) >= round * n,
                "rank {} left round {round} early",
                comm.rank()
            );
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_barrier_flat_4() {
    check_ordering(4, SyntheticTopology::flat(), "", 5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_barrier_three_levels() {
    check_ordering(8, two_sockets(), "numa,socket", 5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_barrier_uneven_groups() {
    let topo = SyntheticTopology::flat().with(Locality::NUMA, 3);
    check_ordering(7, topo, "numa", 4).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_barrier_two_ranks_many_rounds() {
    check_ordering(2, SyntheticTopology::flat(), "", 200).await;
}
