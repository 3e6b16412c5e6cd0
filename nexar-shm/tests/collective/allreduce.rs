use super::helpers::{CountingXmem, run_collective, run_collective_with_xmem, small_chunks, two_sockets};
use nexar_shm::{
    DataType, Locality, ReduceOp, ShmComm, SyntheticTopology, hierarchical_allreduce,
    hierarchical_barrier,
};
use std::sync::Arc;

fn allreduce_f32(comm: &mut ShmComm, send: &[f32], op: ReduceOp) -> Vec<f32> {
    let mut recv = vec![0f32; send.len()];
    unsafe {
        hierarchical_allreduce(
            comm,
            send.as_ptr() as u64,
            recv.as_mut_ptr() as u64,
            send.len(),
            DataType::F32,
            op,
        )
        .unwrap()
    };
    recv
}

fn contribution(rank: u32, count: usize) -> Vec<f32> {
    (0..count).map(|i| (rank as usize * 1000 + i) as f32).collect()
}

fn expected_sum(n: u32, count: usize) -> Vec<f32> {
    (0..count)
        .map(|i| (0..n).map(|r| (r as usize * 1000 + i) as f32).sum())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_allreduce_sum_flat() {
    run_collective(4, SyntheticTopology::flat(), small_chunks(""), |comm| {
        for count in [1, 3, 64, 65, 300, 1000] {
            let out = allreduce_f32(comm, &contribution(comm.rank(), count), ReduceOp::Sum);
            assert_eq!(out, expected_sum(4, count), "count {count}");
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_allreduce_sum_three_levels() {
    run_collective(8, two_sockets(), small_chunks("numa,socket"), |comm| {
        for count in [5, 129, 1000] {
            let out = allreduce_f32(comm, &contribution(comm.rank(), count), ReduceOp::Sum);
            assert_eq!(out, expected_sum(8, count), "count {count}");
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_allreduce_zero_copy() {
    // 4096 f32 = 16 KiB, above the 4 KiB staging limit.
    run_collective(8, two_sockets(), small_chunks("numa,socket"), |comm| {
        for count in [4096, 5000] {
            let out = allreduce_f32(comm, &contribution(comm.rank(), count), ReduceOp::Sum);
            assert_eq!(out, expected_sum(8, count), "count {count}");
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_allreduce_min_max_i32() {
    let topo = SyntheticTopology::flat().with(Locality::NUMA, 3);
    run_collective(7, topo, small_chunks("numa"), |comm| {
        let r = comm.rank() as i32;
        let send: Vec<i32> = (0..200).map(|i| if i % 2 == 0 { r - i } else { i - r }).collect();
        // Even elements favour the extreme rank directly, odd ones inversely.
        for (op, pick) in [(ReduceOp::Min, 0), (ReduceOp::Max, 6)] {
            let mut recv = vec![0i32; send.len()];
            unsafe {
                hierarchical_allreduce(
                    comm,
                    send.as_ptr() as u64,
                    recv.as_mut_ptr() as u64,
                    send.len(),
                    DataType::I32,
                    op,
                )
                .unwrap()
            };
            for (i, v) in recv.iter().enumerate() {
                let i = i as i32;
                let want = if i % 2 == 0 { pick - i } else { i - (6 - pick) };
                assert_eq!(*v, want, "{op} element {i}");
            }
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_allreduce_in_place() {
    run_collective(8, two_sockets(), small_chunks("numa,socket"), |comm| {
        for count in [10, 2000] {
            let mut buf = contribution(comm.rank(), count);
            let ptr = buf.as_mut_ptr() as u64;
            unsafe {
                hierarchical_allreduce(comm, ptr, ptr, count, DataType::F32, ReduceOp::Sum).unwrap()
            };
            assert_eq!(buf, expected_sum(8, count), "count {count}");
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_allreduce_repeated_keeps_send_intact() {
    run_collective(4, SyntheticTopology::flat(), small_chunks(""), |comm| {
        let send = contribution(comm.rank(), 500);
        for _ in 0..20 {
            let out = allreduce_f32(comm, &send, ReduceOp::Sum);
            assert_eq!(out, expected_sum(4, 500));
        }
        assert_eq!(send, contribution(comm.rank(), 500));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_allreduce_empty_is_noop() {
    run_collective(2, SyntheticTopology::flat(), small_chunks(""), |comm| {
        let out = allreduce_f32(comm, &[], ReduceOp::Sum);
        assert!(out.is_empty());
        let out = allreduce_f32(comm, &[1.0, 2.0], ReduceOp::Sum);
        assert_eq!(out, vec![2.0, 4.0]);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeated_zero_copy_allreduce_maps_once() {
    let xmem = Arc::new(CountingXmem::default());
    let per_rank = run_collective_with_xmem(
        8,
        two_sockets(),
        small_chunks("numa,socket"),
        xmem.clone(),
        |comm| {
            let count = 4096;
            let send = contribution(comm.rank(), count);
            let mut recv = vec![0f32; count];
            let mut run = |comm: &mut ShmComm| unsafe {
                hierarchical_allreduce(
                    comm,
                    send.as_ptr() as u64,
                    recv.as_mut_ptr() as u64,
                    count,
                    DataType::F32,
                    ReduceOp::Sum,
                )
                .unwrap()
            };
            run(comm);
            let first = comm.registrations().mapped_len();
            for _ in 0..4 {
                run(comm);
            }
            hierarchical_barrier(comm).unwrap();
            assert_eq!(recv, expected_sum(8, count));
            (
                first,
                comm.registrations().mapped_len(),
                comm.registrations().exposed_len(),
            )
        },
    )
    .await;

    let mut total_mapped = 0;
    for (rank, (first, last, exposed)) in per_rank.into_iter().enumerate() {
        assert!(first > 0, "rank {rank} mapped nothing");
        assert_eq!(first, last, "rank {rank} mapped again on a later allreduce");
        assert_eq!(exposed, 2, "rank {rank} exposes send and recv once each");
        total_mapped += last;
    }
    // Every engine is gone by now and released what it held.
    let (exposes, closes, maps, unmaps) = xmem.counts();
    assert_eq!(exposes, 16);
    assert_eq!(maps, total_mapped);
    assert_eq!(closes, exposes);
    assert_eq!(unmaps, maps);
}
