//! Hierarchical allreduce across 8 in-process ranks.
//!
//! The synthetic layout puts the ranks on two sockets of two NUMA pairs
//! each, so the sum climbs three levels before it is handed back down.
//!
//! ```bash
//! cargo run --example allreduce
//! ```

use nexar_shm::{
    DataType, GroupContext, LocalWorld, Locality, ReduceOp, ShmConfig, SyntheticTopology,
};

#[tokio::main]
async fn main() -> nexar_shm::Result<()> {
    let world_size = 8u32;
    let topology = SyntheticTopology::flat()
        .with(Locality::SOCKET, 4)
        .with(Locality::NUMA, 2);
    let world = LocalWorld::new(world_size, topology);
    let config = ShmConfig {
        hierarchy: "numa,socket".into(),
        print_info: true,
        ..ShmConfig::from_env()
    };

    let count = 8usize;

    // Ranks spin on shared flags, so each one gets a blocking thread.
    let mut handles = Vec::new();
    for host in world.services() {
        let config = config.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let mut ctx = GroupContext::new(host, config);
            let rank = ctx.rank();
            let mut data = vec![rank as f32; count];
            let ptr = data.as_mut_ptr() as u64;

            unsafe { ctx.all_reduce(ptr, ptr, count, DataType::F32, ReduceOp::Sum)? };

            // Each element = 0 + 1 + ... + 7 = 28.0
            nexar_shm::Result::Ok((rank, data))
        }));
    }

    for h in handles {
        let (rank, data) = h.await.expect("rank task panicked")?;
        println!("rank {rank}: {data:?}");
    }

    Ok(())
}
