use super::helpers::{CopyOnly, pattern, run_contexts, run_contexts_with, small_chunks, two_sockets};
use nexar_shm::{DataType, GroupContext, LocalWorld, ReduceOp, ShmConfig, SyntheticTopology};
use std::sync::Arc;

fn mixed_workload(ctx: &mut GroupContext, n: u32) {
    let me = ctx.rank();
    ctx.barrier().unwrap();

    for root in 0..n {
        let want = pattern(root, 777);
        let mut buf = if me == root { want.clone() } else { vec![0u8; 777] };
        unsafe { ctx.broadcast(buf.as_mut_ptr() as u64, buf.len(), DataType::U8, root).unwrap() };
        assert_eq!(buf, want);
    }

    let send = vec![me as f64; 3000];
    let mut recv = vec![0f64; 3000];
    unsafe {
        ctx.all_reduce(
            send.as_ptr() as u64,
            recv.as_mut_ptr() as u64,
            send.len(),
            DataType::F64,
            ReduceOp::Max,
        )
        .unwrap()
    };
    assert!(recv.iter().all(|&v| v == (n - 1) as f64));
    ctx.barrier().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_context_forms_engine_lazily() {
    run_contexts(8, two_sockets(), small_chunks("numa,socket"), |ctx| {
        assert!(ctx.engine().is_none());
        assert!(!ctx.is_unavailable());
        mixed_workload(ctx, 8);
        assert!(ctx.engine().is_some());
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_context_falls_back_when_formation_fails() {
    let config = ShmConfig {
        backing_dir: "/nonexistent/nexar-shm-test".into(),
        ..small_chunks("numa,socket")
    };
    run_contexts(8, two_sockets(), config, |ctx| {
        mixed_workload(ctx, 8);
        assert!(ctx.is_unavailable());
        assert!(ctx.engine().is_none());
        mixed_workload(ctx, 8);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_context_single_rank_uses_fallback() {
    run_contexts(1, SyntheticTopology::flat(), small_chunks(""), |ctx| {
        mixed_workload(ctx, 1);
        assert!(ctx.is_unavailable());
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_context_large_allreduce_without_mapping() {
    // 3000 f64 exceed the staging limit and peers cannot be mapped, so the
    // allreduce goes to the host while broadcasts stay on the engine.
    let world = LocalWorld::new(4, SyntheticTopology::flat());
    let services = world.services_with_xmem(Arc::new(CopyOnly::default()));
    run_contexts_with(services, small_chunks(""), |ctx| {
        mixed_workload(ctx, 4);
        assert!(ctx.engine().is_some());
    })
    .await;
}
