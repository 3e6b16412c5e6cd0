use super::helpers::{run_collective, run_contexts, small_chunks, two_sockets};
use nexar_shm::{DataType, ReduceOp, ShmCommError, ShmConfig, SyntheticTopology, hierarchical_reduce};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reduce_to_rank_zero() {
    run_collective(8, two_sockets(), small_chunks("numa,socket"), |comm| {
        for count in [3, 700, 5000] {
            let send: Vec<u64> = (0..count).map(|i| i as u64 + comm.rank() as u64).collect();
            let mut recv = vec![0u64; count];
            unsafe {
                hierarchical_reduce(
                    comm,
                    send.as_ptr() as u64,
                    recv.as_mut_ptr() as u64,
                    count,
                    DataType::U64,
                    ReduceOp::Sum,
                    0,
                )
                .unwrap()
            };
            if comm.rank() == 0 {
                let want: Vec<u64> = (0..count).map(|i| 8 * i as u64 + 28).collect();
                assert_eq!(recv, want, "count {count}");
            }
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reduce_rejects_nonzero_root() {
    run_collective(2, SyntheticTopology::flat(), small_chunks(""), |comm| {
        let send = [1u32; 4];
        let mut recv = [0u32; 4];
        let err = unsafe {
            hierarchical_reduce(
                comm,
                send.as_ptr() as u64,
                recv.as_mut_ptr() as u64,
                4,
                DataType::U32,
                ReduceOp::Sum,
                1,
            )
            .unwrap_err()
        };
        assert!(matches!(err, ShmCommError::Unsupported { .. }));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_context_reduce_routes_by_root() {
    let config = ShmConfig {
        force_reduce: true,
        ..small_chunks("numa,socket")
    };
    run_contexts(8, two_sockets(), config, |ctx| {
        let me = ctx.rank();
        for root in [0, 5] {
            let send = vec![me as i64 + 1; 100];
            let mut recv = vec![0i64; 100];
            unsafe {
                ctx.reduce(
                    send.as_ptr() as u64,
                    recv.as_mut_ptr() as u64,
                    100,
                    DataType::I64,
                    ReduceOp::Sum,
                    root,
                )
                .unwrap()
            };
            if me == root {
                assert_eq!(recv, vec![36i64; 100], "root {root}");
            }
        }
        assert!(ctx.engine().is_some());
    })
    .await;
}
