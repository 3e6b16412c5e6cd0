use super::helpers::{
    CopyOnly, CountingXmem, pattern, run_collective, run_collective_with_xmem, small_chunks,
    two_sockets,
};
use nexar_shm::{DataType, ShmCommError, ShmConfig, SyntheticTopology, hierarchical_broadcast};
use std::sync::Arc;

/// Broadcast `len` bytes from every root in turn on one engine.
fn broadcast_all_roots(comm: &mut nexar_shm::ShmComm, len: usize) {
    let n = comm.world_size();
    for root in 0..n {
        let expected = pattern(root, len);
        let mut buf = if comm.rank() == root {
            expected.clone()
        } else {
            vec![0u8; len]
        };
        unsafe {
            hierarchical_broadcast(comm, buf.as_mut_ptr() as u64, len, DataType::U8, root).unwrap()
        };
        assert_eq!(buf, expected, "rank {} root {root} len {len}", comm.rank());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broadcast_chunk_boundaries() {
    // chunk = 256, cico_max = 4096: everything here stays in the ring.
    run_collective(4, SyntheticTopology::flat(), small_chunks(""), |comm| {
        for len in [1, 255, 256, 257, 1000, 4096] {
            broadcast_all_roots(comm, len);
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broadcast_three_levels_every_root() {
    run_collective(8, two_sockets(), small_chunks("numa,socket"), |comm| {
        for len in [7, 256, 3000] {
            broadcast_all_roots(comm, len);
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broadcast_zero_copy() {
    run_collective(8, two_sockets(), small_chunks("numa,socket"), |comm| {
        broadcast_all_roots(comm, 4097);
        broadcast_all_roots(comm, 64 * 1024 + 3);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broadcast_zero_copy_without_mapping() {
    run_collective_with_xmem(
        8,
        two_sockets(),
        small_chunks("numa,socket"),
        Arc::new(CopyOnly::default()),
        |comm| {
            broadcast_all_roots(comm, 10_000);
            broadcast_all_roots(comm, 100);
        },
    )
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broadcast_many_small_consecutive() {
    // Far more chunks than ring slots, with the producer changing each time.
    run_collective(3, SyntheticTopology::flat(), small_chunks(""), |comm| {
        for i in 0..300u32 {
            let root = i % 3;
            let mut v = if comm.rank() == root { i } else { u32::MAX };
            unsafe {
                hierarchical_broadcast(comm, &mut v as *mut u32 as u64, 1, DataType::U32, root)
                    .unwrap()
            };
            assert_eq!(v, i);
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broadcast_per_level_chunk_sizes() {
    let config = ShmConfig {
        chunk_sizes: vec![128, 512, 1024],
        ..small_chunks("numa,socket")
    };
    run_collective(8, two_sockets(), config, |comm| {
        broadcast_all_roots(comm, 2500);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broadcast_empty_is_noop() {
    run_collective(4, SyntheticTopology::flat(), small_chunks(""), |comm| {
        let mut buf = [9u8; 4];
        unsafe { hierarchical_broadcast(comm, buf.as_mut_ptr() as u64, 0, DataType::U8, 1).unwrap() };
        assert_eq!(buf, [9u8; 4]);
        broadcast_all_roots(comm, 300);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broadcast_invalid_root() {
    run_collective(2, SyntheticTopology::flat(), small_chunks(""), |comm| {
        let mut buf = [0u8; 4];
        let err = unsafe {
            hierarchical_broadcast(comm, buf.as_mut_ptr() as u64, 4, DataType::U8, 2).unwrap_err()
        };
        assert!(matches!(err, ShmCommError::InvalidRank { rank: 2, .. }));
        broadcast_all_roots(comm, 50);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeated_zero_copy_broadcast_reuses_mappings() {
    let xmem = Arc::new(CountingXmem::default());
    let per_rank = run_collective_with_xmem(
        8,
        two_sockets(),
        small_chunks("numa,socket"),
        xmem.clone(),
        |comm| {
            let len = 10_000;
            let expected = pattern(3, len);
            let mut buf = vec![0u8; len];
            let mut mapped = Vec::new();
            for _ in 0..3 {
                if comm.rank() == 3 {
                    buf.copy_from_slice(&expected);
                }
                unsafe {
                    hierarchical_broadcast(comm, buf.as_mut_ptr() as u64, len, DataType::U8, 3)
                        .unwrap()
                };
                assert_eq!(buf, expected);
                mapped.push(comm.registrations().mapped_len());
            }
            // Every group with a ring was led by the producer of the last broadcast.
            for g in comm.groups() {
                if let Some(ctrl) = g.active_ctrl() {
                    assert_eq!(ctrl.group().leader_seq.load(), 3, "level {}", g.level);
                }
            }
            mapped
        },
    )
    .await;

    for (rank, mapped) in per_rank.iter().enumerate() {
        assert_eq!(mapped[0], mapped[2], "rank {rank} mapped again");
        if rank != 3 {
            assert_eq!(mapped[0], 1, "rank {rank} reads one producer buffer");
        }
    }
    let (exposes, closes, maps, unmaps) = xmem.counts();
    assert_eq!(maps, 7);
    assert_eq!(unmaps, maps);
    assert_eq!(closes, exposes);
}
